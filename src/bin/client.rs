//! Benchmark client binary.
//!
//! Drives synchronous request/response traffic against a scalebench server
//! at a configured message rate and prints sent/received counts every
//! 20 seconds.

use clap::Parser;
use scalebench::client::Client;
use std::thread;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

const REPORT_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "Benchmark client for the scalebench server", long_about = None)]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value_t = 9090)]
    port: u16,

    /// Messages per second to send
    #[arg(short, long, default_value_t = 10, value_parser = clap::value_parser!(u32).range(1..))]
    rate: u32,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let client = Client::connect(&args.host, args.port, args.rate)?;
    info!(host = %args.host, port = args.port, rate = args.rate, "Connected to server");

    let reports = client.report_handle();
    thread::spawn(move || loop {
        thread::sleep(REPORT_INTERVAL);
        println!("{}", reports.take_report());
    });

    client.run()?;
    Ok(())
}
