//! Remote capture control over the pub/sub bridge.
//!
//! Raw payloads are parsed into a [`ControlCommand`] once, at the subscription
//! boundary. Anything malformed is reported and dropped; the current capture
//! configuration is left as it was.

use std::sync::Arc;

use serde_json::Value;

use crate::error::{RelayError, RelayResult};
use crate::fanout::BridgeTopics;
use crate::snapshot::CaptureHandle;
use crate::transport::Subscriber;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Start,
    Stop,
    SetPeriod(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ControlTopic {
    Start,
    Stop,
    PeriodMs,
}

impl ControlCommand {
    /// `period_ms` accepts `{"data": n}` or bare integer text. Negative values clamp to 0.
    pub fn parse_period(payload: &[u8]) -> RelayResult<Self> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| RelayError::MalformedControlMessage("period_ms: not utf-8".to_string()))?
            .trim();
        let value = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => map.get("data").cloned().ok_or_else(|| {
                RelayError::MalformedControlMessage(format!("period_ms: no data field in {}", text))
            })?,
            Ok(other) => other,
            Err(_) => {
                return Err(RelayError::MalformedControlMessage(format!(
                    "period_ms: {:?}",
                    text
                )))
            }
        };
        let period = value.as_i64().ok_or_else(|| {
            RelayError::MalformedControlMessage(format!("period_ms: not an integer: {}", value))
        })?;
        Ok(ControlCommand::SetPeriod(period.max(0) as u64))
    }

    pub fn apply(self, capture: &CaptureHandle) {
        match self {
            ControlCommand::Start => capture.set_enabled(true),
            ControlCommand::Stop => capture.set_enabled(false),
            ControlCommand::SetPeriod(period_ms) => capture.set_period_ms(period_ms),
        }
    }
}

fn parse(topic: ControlTopic, payload: &[u8]) -> RelayResult<ControlCommand> {
    match topic {
        // Start and stop carry no meaningful payload; whatever arrives is ignored.
        ControlTopic::Start => Ok(ControlCommand::Start),
        ControlTopic::Stop => Ok(ControlCommand::Stop),
        ControlTopic::PeriodMs => ControlCommand::parse_period(payload),
    }
}

/// Subscribes the three control topics and applies commands to the shared
/// capture configuration from the subscriber's delivery thread.
pub struct ControlListener {
    capture: CaptureHandle,
}

impl ControlListener {
    pub fn attach(
        subscriber: &dyn Subscriber,
        topics: &BridgeTopics,
        capture: CaptureHandle,
    ) -> RelayResult<Arc<Self>> {
        let listener = Arc::new(Self { capture });
        for (topic, kind) in [
            (&topics.snapshot_start, ControlTopic::Start),
            (&topics.snapshot_stop, ControlTopic::Stop),
            (&topics.snapshot_period_ms, ControlTopic::PeriodMs),
        ] {
            let this = listener.clone();
            subscriber.subscribe(
                topic,
                Arc::new(move |_topic: &str, payload: &[u8]| this.handle(kind, payload)),
            )?;
        }
        log::info!(
            "control topics: {}, {}, {}",
            topics.snapshot_start,
            topics.snapshot_stop,
            topics.snapshot_period_ms
        );
        Ok(listener)
    }

    fn handle(&self, topic: ControlTopic, payload: &[u8]) {
        match parse(topic, payload) {
            Ok(command) => {
                command.apply(&self.capture);
                log::info!("control: {:?} -> {:?}", command, self.capture.get());
            }
            Err(e) => e.report("control"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectionEvent;
    use crate::snapshot::{CaptureConfig, SnapshotController};
    use crate::storage::SnapshotStore;
    use crate::transport::MemoryTransport;

    #[test]
    fn period_accepts_int32_message_and_bare_text() {
        assert_eq!(
            ControlCommand::parse_period(br#"{"data": 250}"#).unwrap(),
            ControlCommand::SetPeriod(250)
        );
        assert_eq!(
            ControlCommand::parse_period(b" 1500\n").unwrap(),
            ControlCommand::SetPeriod(1500)
        );
    }

    #[test]
    fn negative_period_clamps_to_zero() {
        assert_eq!(
            ControlCommand::parse_period(br#"{"data": -5}"#).unwrap(),
            ControlCommand::SetPeriod(0)
        );
    }

    #[test]
    fn non_numeric_period_is_malformed() {
        for payload in [
            &br#"{"data": "abc"}"#[..],
            b"abc",
            b"",
            br#"{"value": 3}"#,
            br#"{"data": 1.5}"#,
        ] {
            assert!(matches!(
                ControlCommand::parse_period(payload),
                Err(RelayError::MalformedControlMessage(_))
            ));
        }
    }

    #[test]
    fn listener_mutates_capture_config() {
        let bus = MemoryTransport::new("bridge");
        let topics = BridgeTopics::default();
        let capture = CaptureHandle::new(CaptureConfig::new(false, 1000));
        ControlListener::attach(&bus, &topics, capture.clone()).unwrap();

        bus.inject(&topics.snapshot_start, b"{}");
        assert!(capture.get().enabled);

        bus.inject(&topics.snapshot_period_ms, br#"{"data": 2000}"#);
        assert_eq!(capture.get().period_ms, 2000);

        bus.inject(&topics.snapshot_period_ms, br#"{"data": "abc"}"#);
        assert_eq!(capture.get().period_ms, 2000);

        bus.inject(&topics.snapshot_stop, b"");
        assert!(!capture.get().enabled);
    }

    #[test]
    fn commands_from_delivery_thread_interleave_with_checks() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MemoryTransport::new("bridge"));
        let topics = BridgeTopics::default();
        let capture = CaptureHandle::new(CaptureConfig::new(true, 5));
        ControlListener::attach(bus.as_ref(), &topics, capture.clone()).unwrap();
        let controller = SnapshotController::new(capture.clone(), SnapshotStore::new(dir.path()));

        let sender = {
            let bus = bus.clone();
            let topics = topics.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    bus.inject(&topics.snapshot_period_ms, br#"{"data": 0}"#);
                    bus.inject(&topics.snapshot_stop, b"");
                    bus.inject(&topics.snapshot_start, b"");
                    bus.inject(&topics.snapshot_period_ms, br#"{"data": 5}"#);
                }
                bus.inject(&topics.snapshot_stop, b"");
            })
        };

        let latest = DetectionEvent::default();
        let mut fires = Vec::new();
        for now in 0..5_000u64 {
            if controller.check_trigger(now, &latest).is_some() {
                fires.push(now);
            }
        }
        sender.join().unwrap();

        assert!(fires.windows(2).all(|w| w[1] - w[0] >= 5), "{fires:?}");
        assert_eq!(capture.get().last_fire_at, fires.last().copied());
        assert!(!capture.get().enabled);
        assert!(controller.check_trigger(1_000_000, &latest).is_none());
    }
}
