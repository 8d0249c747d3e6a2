//! mqtt_probe - wait for one message on a topic and print it as JSON.
//!
//! Prints `{"received": {"topic": ..., "payload": ...}}` with the payload cut
//! to its first 500 characters, or `{"received": null}` on timeout.

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use detection_relay::transport::{parse_mqtt_endpoint, MqttSettings};
use detection_relay::{MqttTransport, Subscriber};

const PAYLOAD_PREVIEW_CHARS: usize = 500;

#[derive(Parser, Debug)]
#[command(author, version, about = "Print the next message on an MQTT topic")]
struct Args {
    /// MQTT broker address (`host:port`, `mqtt://`, `mqtts://`).
    #[arg(long, env = "DS_MQTT_ADDR", default_value = "127.0.0.1:1883")]
    broker: String,

    /// Enable TLS regardless of the address scheme.
    #[arg(long, env = "DS_MQTT_USE_TLS")]
    tls: bool,

    #[arg(long, env = "DS_MQTT_SNAP_TOPIC", default_value = "deepstream/snap")]
    topic: String,

    /// Seconds to wait before giving up.
    #[arg(long, default_value_t = 5)]
    timeout_secs: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let endpoint = parse_mqtt_endpoint(&args.broker, args.tls)?;
    let settings = MqttSettings::new(endpoint, format!("mqtt-probe-{}", std::process::id()));
    let client = MqttTransport::connect("probe", &settings)?;

    let (tx, rx) = mpsc::channel::<(String, Vec<u8>)>();
    let tx = Mutex::new(tx);
    client.subscribe(
        &args.topic,
        Arc::new(move |topic: &str, payload: &[u8]| {
            if let Ok(tx) = tx.lock() {
                let _ = tx.send((topic.to_string(), payload.to_vec()));
            }
        }),
    )?;

    let received = match rx.recv_timeout(Duration::from_secs(args.timeout_secs)) {
        Ok((topic, payload)) => {
            let text: String = String::from_utf8_lossy(&payload)
                .chars()
                .take(PAYLOAD_PREVIEW_CHARS)
                .collect();
            json!({ "topic": topic, "payload": text })
        }
        Err(_) => serde_json::Value::Null,
    };
    println!("{}", json!({ "received": received }));
    client.shutdown()?;
    Ok(())
}
