//! # mqtt
//!
//! `rumqttc`-backed `hes_core::mqtt_api::MqttSource`: one shared client
//! subscribes per-gateway to `<gateway-id>/ONDEMAND_REQUEST` (the original
//! `MQTTClient::set_mqtt_topic_and_client_id` topic shape) as sessions
//! register, and a background task drains the event loop into per-gateway
//! command queues. `next_command`/`drain_cancelled` are the only surface
//! `hes-core` sees, so the grammar parsing in `mqtt_api` stays broker-free.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use hes_core::mqtt_api::{self, MqttSource, ParsedCommand, QueueClass, RequestIdTracker};

struct GatewayInbox {
    commands: VecDeque<String>,
    cancelled: HashSet<u64>,
    tracker: RequestIdTracker,
    notify: Arc<Notify>,
}

impl Default for GatewayInbox {
    fn default() -> Self {
        Self {
            commands: VecDeque::new(),
            cancelled: HashSet::new(),
            tracker: RequestIdTracker::default(),
            notify: Arc::new(Notify::new()),
        }
    }
}

pub struct RumqttcSource {
    client: AsyncClient,
    inboxes: Mutex<HashMap<String, GatewayInbox>>,
}

impl RumqttcSource {
    /// Connects to the broker and returns the source plus the event-loop
    /// driver task to `tokio::spawn` alongside it.
    pub fn connect(host: &str, port: u16, client_id_prefix: &str) -> (Arc<Self>, EventLoop) {
        let mut options = MqttOptions::new(format!("{client_id_prefix}-{}", std::process::id()), host, port);
        options.set_keep_alive(Duration::from_secs(30));
        let (client, eventloop) = AsyncClient::new(options, 64);
        let source = Arc::new(Self { client, inboxes: Mutex::new(HashMap::new()) });
        (source, eventloop)
    }

    /// Subscribes to one gateway's inbox topic, called when a `GatewaySession`
    /// registers (spec §6).
    pub async fn subscribe_gateway(&self, gateway_id: &str) {
        let topic = format!("{gateway_id}/{}", mqtt_api::ONDEMAND_TOPIC_SUFFIX);
        if let Err(err) = self.client.subscribe(&topic, QoS::AtLeastOnce).await {
            warn!(gateway_id, %err, "mqtt subscribe failed");
        }
        self.inboxes.lock().await.entry(gateway_id.to_string()).or_default();
    }

    pub async fn unsubscribe_gateway(&self, gateway_id: &str) {
        let topic = format!("{gateway_id}/{}", mqtt_api::ONDEMAND_TOPIC_SUFFIX);
        let _ = self.client.unsubscribe(&topic).await;
        self.inboxes.lock().await.remove(gateway_id);
    }

    /// Drives `eventloop`, routing each published payload to its gateway's
    /// inbox. Runs for the lifetime of the process.
    pub async fn run(self: Arc<Self>, mut eventloop: EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let gateway_id = publish.topic.split('/').next().unwrap_or_default().to_string();
                    let Ok(payload) = std::str::from_utf8(&publish.payload) else {
                        warn!(gateway_id, "mqtt payload not utf8, dropping");
                        continue;
                    };
                    self.route_payload(&gateway_id, payload).await;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "mqtt event loop error, reconnecting");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn route_payload(&self, gateway_id: &str, payload: &str) {
        let mut inboxes = self.inboxes.lock().await;
        let Some(inbox) = inboxes.get_mut(gateway_id) else {
            debug!(gateway_id, "mqtt publish for unregistered gateway, dropping");
            return;
        };

        for parsed in mqtt_api::parse_topic_payload(gateway_id, payload) {
            match parsed {
                Ok(ParsedCommand::Odm(cmd)) => {
                    let class = QueueClass::of(cmd.download_type);
                    if !inbox.tracker.accept(class, cmd.request_id) {
                        warn!(gateway_id, request_id = cmd.request_id, "duplicate request id, dropping");
                        continue;
                    }
                    inbox.commands.push_back(payload.to_string());
                }
                Ok(ParsedCommand::Cancel(ids)) => {
                    inbox.cancelled.extend(ids);
                }
                Err(err) => {
                    warn!(gateway_id, ?err, "rejected malformed mqtt command");
                }
            }
        }
        inbox.notify.notify_waiters();
    }
}

#[async_trait]
impl MqttSource for RumqttcSource {
    async fn next_command(&self, gateway_id: &str) -> Option<String> {
        loop {
            let notify = {
                let mut inboxes = self.inboxes.lock().await;
                let inbox = inboxes.get_mut(gateway_id)?;
                if let Some(cmd) = inbox.commands.pop_front() {
                    return Some(cmd);
                }
                inbox.notify.clone()
            };
            notify.notified().await;
        }
    }

    async fn drain_cancelled(&self, gateway_id: &str) -> Vec<u64> {
        let mut inboxes = self.inboxes.lock().await;
        let Some(inbox) = inboxes.get_mut(gateway_id) else {
            return Vec::new();
        };
        inbox.cancelled.drain().collect()
    }
}

pub fn log_startup(host: &str, port: u16) {
    info!(host, port, "mqtt source starting");
}
