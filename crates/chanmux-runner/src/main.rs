//! # chanmux-runner
//!
//! Connects the streaming client using a JSON configuration file and logs
//! every output record until Ctrl+C.
//!
//! # Usage
//!
//! ```bash
//! chanmux-runner config.json --log-level info
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use chanmux_core::logging::LogFormat;
use chanmux_stream::{ClientConfig, OutputReceiver, StreamClient, WsConnector};
use clap::Parser;
use crossbeam_channel::RecvTimeoutError;
use tracing::{info, warn};

/// Multiplexed exchange stream runner.
#[derive(Parser)]
#[command(name = "chanmux-runner", about = "Multiplexed exchange stream runner")]
struct Cli {
    /// Configuration file path (JSON).
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Optional log directory for file output.
    #[arg(long)]
    log_dir: Option<String>,

    /// File log format (text, json).
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration (before logging, so the module name is known)
    let config = chanmux_core::config::load_config(&cli.config)?;

    // 2. Initialize logging
    let log_dir = cli.log_dir.clone().or_else(|| config.log_path());
    chanmux_core::logging::init_logging(&cli.log_level, log_dir.as_deref(), &config.module_name(), cli.log_format);
    info!("chanmux-runner starting, config={}, log_level={}", cli.config.display(), cli.log_level);

    // 3. Build and start the client
    let client_config = ClientConfig::from_feed_config(&config);
    info!(
        "{} pair(s) × {} channel kind(s) → {} subscription(s), auth={}",
        config.pairs.len(),
        config.channels.len(),
        client_config.subscriptions.len(),
        client_config.credentials.is_some(),
    );
    let client = StreamClient::new(client_config, WsConnector::new(config.effective_url()));
    client.start()?;

    // 4. Drain the output queue on a dedicated thread
    let done = Arc::new(AtomicBool::new(false));
    let consumer = {
        let output = client.output();
        let done = Arc::clone(&done);
        std::thread::Builder::new()
            .name("chanmux-output".into())
            .spawn(move || consume(output, &done))?
    };

    info!("client started, press Ctrl+C to stop");

    // 5. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    client.shutdown();
    done.store(true, Ordering::Release);
    if consumer.join().is_err() {
        warn!("output consumer panicked");
    }

    info!("stopped, goodbye");
    Ok(())
}

fn consume(output: OutputReceiver, done: &AtomicBool) {
    let mut count: u64 = 0;
    while !done.load(Ordering::Acquire) {
        match output.recv_timeout(Duration::from_millis(200)) {
            Ok(rec) => {
                count += 1;
                info!(topic = %rec.topic, pair = %rec.pair, ts = rec.received_at_us, "{}", rec.payload);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("output consumer finished after {count} records");
}
