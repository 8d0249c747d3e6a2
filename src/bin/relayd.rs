//! relayd - detection relay daemon
//!
//! This daemon:
//! 1. Reads the perception pipeline's output lines on stdin
//! 2. Aggregates per-frame detections and fans them out (broker, bridge, local log)
//! 3. Captures paired clean/annotated snapshots on the configured cadence
//! 4. Accepts capture start/stop/period commands from the bridge
//! 5. Publishes a heartbeat every second

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use detection_relay::pipeline::read_pipeline;
use detection_relay::{
    now_ms, BridgeChannel, BrokerChannel, ControlListener, Engine, FanOutPublisher,
    JsonLinesSink, MqttTransport, RelayConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Detection telemetry and paired-snapshot relay")]
struct Args {
    /// JSON config file (environment variables override its values).
    #[arg(long, env = "DS_CONFIG")]
    config: Option<PathBuf>,

    /// Interval of the snapshot trigger check, in milliseconds.
    #[arg(long, env = "DS_TICK_MS", default_value_t = 100)]
    tick_ms: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = RelayConfig::load_from(args.config.as_deref())?;
    log::info!(
        "broker {}:{} (tls: {}), topics: detections={} heartbeat={} snapshot={}",
        cfg.mqtt.host,
        cfg.mqtt.port,
        cfg.mqtt.use_tls,
        cfg.mqtt.topics.detections,
        cfg.mqtt.topics.heartbeat,
        cfg.mqtt.topics.snapshot
    );
    log::info!(
        "bridge {}:{} enabled={} prefix={}",
        cfg.bridge.host,
        cfg.bridge.port,
        cfg.bridge.enabled,
        cfg.bridge.topic_prefix
    );
    if let Some(notice) = cfg.bridge_notice() {
        log::warn!("{}", notice);
    }
    log::info!(
        "snapshots in {} every {}ms (grace {}ms, capture {})",
        cfg.snapshot.dir.display(),
        cfg.snapshot.period_ms,
        cfg.snapshot.grace_ms,
        if cfg.snapshot.period_ms > 0 { "on" } else { "off" }
    );

    let broker = Arc::new(MqttTransport::connect("mqtt", &cfg.broker_settings()?)?);
    let mut fanout = FanOutPublisher::new(cfg.camera.clone()).with_channel(Arc::new(
        BrokerChannel::new(broker.clone(), cfg.mqtt.topics.clone()),
    ));

    let bridge = if cfg.bridge.enabled {
        let bridge = Arc::new(MqttTransport::connect("bridge", &cfg.bridge_settings())?);
        fanout = fanout.with_channel(Arc::new(BridgeChannel::new(
            bridge.clone(),
            cfg.bridge_topics(),
        )));
        Some(bridge)
    } else {
        None
    };

    if let Some(path) = &cfg.detections_log {
        log::info!("detections log: {}", path.display());
        fanout = fanout.with_channel(Arc::new(JsonLinesSink::new(path)));
    }

    let engine = Arc::new(Engine::from_config(&cfg, fanout));
    if let Some(bridge) = &bridge {
        ControlListener::attach(bridge.as_ref(), &cfg.bridge_topics(), engine.capture().clone())?;
    }
    engine.start_heartbeat()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let tick = {
        let engine = engine.clone();
        let shutdown = shutdown.clone();
        let interval = Duration::from_millis(args.tick_ms.max(1));
        std::thread::Builder::new()
            .name("trigger-tick".to_string())
            .spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    if let Some(base) = engine.tick(now_ms()) {
                        log::debug!("tick opened window {}", base);
                    }
                    std::thread::sleep(interval);
                }
            })
            .context("failed to spawn trigger tick thread")?
    };

    let (tx, rx) = mpsc::channel();
    {
        let tx = tx.clone();
        ctrlc::set_handler(move || {
            let _ = tx.send(());
        })
        .context("error setting Ctrl-C handler")?;
    }

    // stdin is blocking; this thread is never joined and ends with the process.
    {
        let engine = engine.clone();
        std::thread::Builder::new()
            .name("pipeline-stdin".to_string())
            .spawn(move || {
                let frames = read_pipeline(&engine, std::io::stdin().lock());
                log::info!("pipeline output closed after {} frames", frames);
                let _ = tx.send(());
            })
            .context("failed to spawn stdin reader")?;
    }

    log::info!("relayd running. waiting for pipeline output on stdin");
    let _ = rx.recv();
    log::info!("shutting down");

    shutdown.store(true, Ordering::SeqCst);
    tick.join()
        .map_err(|_| anyhow::anyhow!("trigger tick thread panicked"))?;
    engine.shutdown()?;
    if let Some(bridge) = &bridge {
        bridge.shutdown()?;
    }
    broker.shutdown()?;
    Ok(())
}
