use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap_derive::Parser;
use serialbridge::proxy::proxy::SerialProxy;
use serialbridge::proxy::proxy_config::ProxyConfig;
use serialbridge::stats::report::{format_stats, LineAssembler};
use tokio::select;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn, Level};

#[derive(Parser)]
struct Args {
    /// serial port the device is connected to, e.g. /dev/ttyUSB0 or COM3
    serial_port: String,

    #[clap(long, default_value_t = 115_200 * 10)]
    baud_rate: u32,

    /// interval for logging device output and throughput statistics
    #[clap(long, default_value_t = 1500)]
    report_interval_ms: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let serial = tokio_serial::new(&args.serial_port, args.baud_rate)
        .open_native_async()
        .with_context(|| format!("failed to open serial port {}", args.serial_port))?;
    info!("serial port {} open", args.serial_port);

    let proxy = SerialProxy::start(ProxyConfig::new(), serial)?;

    let report_result = report_until_interrupted(&proxy, Duration::from_millis(args.report_interval_ms)).await;

    info!("Shutting down..");
    // logs "Closed proxy" once the sockets are closed and "Threads joined" at the end
    let shutdown_result = proxy.shutdown().await;

    report_result.and(shutdown_result)
}

/// Periodically logs the device's diagnostic output and the proxy's statistics until Ctrl-C is
///  pressed or the proxy stops on its own
async fn report_until_interrupted(proxy: &SerialProxy, interval: Duration) -> anyhow::Result<()> {
    let mut lines = LineAssembler::default();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;

    loop {
        select! {
            _ = ticker.tick() => {
                for line in lines.push(&proxy.take_diagnostics()) {
                    info!(target: "device", "{}", line);
                }
                info!("{}", format_stats(proxy.num_sessions().await, &proxy.stats()));

                if !proxy.is_running() {
                    warn!("proxy stopped");
                    return Ok(());
                }
            }
            result = &mut ctrl_c => {
                return result.context("error waiting for Ctrl-C");
            }
        }
    }
}
