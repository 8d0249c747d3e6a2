//! snap_sidecar - republish new snapshot files to the broker.
//!
//! Polls the snapshot directory, attaches the latest detections seen on the
//! detections topic and publishes each new file once to the snapshot topic.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use detection_relay::sidecar::POLL_INTERVAL;
use detection_relay::{DirectoryPoller, LastDetections, MqttTransport, RelayConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Publish new snapshot files to MQTT")]
struct Args {
    /// JSON config file (environment variables override its values).
    #[arg(long, env = "DS_CONFIG")]
    config: Option<PathBuf>,

    /// Poll interval in milliseconds.
    #[arg(long, env = "DS_SIDECAR_INTERVAL_MS", default_value_t = POLL_INTERVAL.as_millis() as u64)]
    interval_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let cfg = RelayConfig::load_from(args.config.as_deref())?;

    let mut settings = cfg.broker_settings()?;
    settings.client_id = format!("{}-sidecar", settings.client_id);
    let broker = Arc::new(MqttTransport::connect("mqtt", &settings)?);

    let last = Arc::new(LastDetections::default());
    last.subscribe(broker.as_ref(), &cfg.mqtt.topics.detections)?;

    let poller = DirectoryPoller::new(
        &cfg.snapshot.dir,
        broker.clone(),
        cfg.mqtt.topics.snapshot.clone(),
        cfg.camera.clone(),
        last,
    );
    let handle = poller.spawn(Duration::from_millis(args.interval_ms.max(1)))?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("snap_sidecar waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping poller...");
    handle.stop()?;
    broker.shutdown()?;
    Ok(())
}
