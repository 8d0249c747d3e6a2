use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, Incoming, MqttOptions};

use super::tls::{MqttEndpoint, TlsMaterials};
use super::{MessageHandler, Subscriber, Transport};
use crate::error::{RelayError, RelayResult};

const REQUEST_CAPACITY: usize = 64;
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct MqttSettings {
    pub endpoint: MqttEndpoint,
    pub tls: TlsMaterials,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttSettings {
    pub fn new(endpoint: MqttEndpoint, client_id: impl Into<String>) -> Self {
        Self {
            endpoint,
            tls: TlsMaterials::default(),
            client_id: client_id.into(),
            username: None,
            password: None,
        }
    }
}

type HandlerTable = Arc<Mutex<Vec<(String, MessageHandler)>>>;

/// MQTT client with a background connection thread.
///
/// Publishes are QoS 0, never retained, and queued with `try_publish` so a
/// stalled broker cannot block the caller. The connection thread reconnects on
/// error and re-subscribes every registered topic after each CONNACK.
pub struct MqttTransport {
    name: String,
    client: Client,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    handlers: HandlerTable,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    pub fn connect(name: impl Into<String>, settings: &MqttSettings) -> Result<Self> {
        let name = name.into();
        let endpoint = &settings.endpoint;
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        options.set_transport(settings.tls.build_transport(endpoint)?);

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handlers: HandlerTable = Arc::new(Mutex::new(Vec::new()));

        let join = {
            let worker = ConnectionWorker {
                name: name.clone(),
                client: client.clone(),
                connected: connected.clone(),
                shutdown: shutdown.clone(),
                handlers: handlers.clone(),
            };
            std::thread::Builder::new()
                .name(format!("mqtt-{}", name))
                .spawn(move || worker.run(connection))
                .map_err(|e| anyhow!("failed to spawn MQTT thread for {}: {}", name, e))?
        };

        log::info!(
            "{}: MQTT client started for {} (auth: {})",
            name,
            endpoint,
            settings.username.is_some()
        );
        Ok(Self {
            name,
            client,
            connected,
            shutdown,
            handlers,
            join: Mutex::new(Some(join)),
        })
    }

    /// Disconnect and join the connection thread.
    pub fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("{}: disconnect request failed: {}", self.name, e);
        }
        let join = self
            .join
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = join {
            join.join()
                .map_err(|_| anyhow!("{} connection thread panicked", self.name))?;
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl Transport for MqttTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> RelayResult<()> {
        if !self.is_connected() {
            return Err(RelayError::TransportUnavailable {
                transport: self.name.clone(),
            });
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| RelayError::Publish {
                transport: self.name.clone(),
                reason: e.to_string(),
            })
    }
}

impl Subscriber for MqttTransport {
    fn subscribe(&self, topic: &str, handler: MessageHandler) -> RelayResult<()> {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_string(), handler));
        // Otherwise the connection thread subscribes on CONNACK.
        if self.is_connected() {
            self.client
                .try_subscribe(topic, QoS::AtMostOnce)
                .map_err(|e| RelayError::Publish {
                    transport: self.name.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::warn!("{}: {}", self.name, e);
        }
    }
}

struct ConnectionWorker {
    name: String,
    client: Client,
    connected: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    handlers: HandlerTable,
}

impl ConnectionWorker {
    fn run(self, mut connection: Connection) {
        for event in connection.iter() {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    self.connected.store(true, Ordering::SeqCst);
                    log::info!("{}: connected", self.name);
                    self.resubscribe();
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let topic = match std::str::from_utf8(&publish.topic) {
                        Ok(topic) => topic,
                        Err(e) => {
                            log::warn!("{}: skipping publish with invalid topic: {}", self.name, e);
                            continue;
                        }
                    };
                    self.dispatch(topic, &publish.payload);
                }
                Ok(Event::Incoming(Incoming::Disconnect(_))) => {
                    self.connected.store(false, Ordering::SeqCst);
                    log::warn!("{}: broker sent disconnect", self.name);
                }
                Ok(_) => {}
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    log::warn!("{}: MQTT connection error: {}. Reconnecting...", self.name, e);
                    std::thread::sleep(RECONNECT_DELAY);
                }
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        log::debug!("{}: connection thread stopped", self.name);
    }

    fn resubscribe(&self) {
        let topics: Vec<String> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(topic, _)| topic.clone())
            .collect();
        for topic in topics {
            match self.client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                Ok(()) => log::info!("{}: subscribed to {}", self.name, topic),
                Err(e) => log::warn!("{}: subscribe to {} failed: {}", self.name, topic, e),
            }
        }
    }

    fn dispatch(&self, topic: &str, payload: &[u8]) {
        let matching: Vec<MessageHandler> = self
            .handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(subscribed, _)| subscribed == topic)
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in matching {
            handler(topic, payload);
        }
    }
}
