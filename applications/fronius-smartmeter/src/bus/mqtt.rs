//! MQTT binding of the object tree.
//!
//! Values are published retained on `{prefix}/N/{service}{path}` as
//! `{"value": ..., "text": ...}`; external writers publish `{"value": ...}` on
//! `{prefix}/W/{service}{path}`.

use super::{BusSnapshot, BusValue, ObjectTree, PathUpdate};
use crate::config::MqttConfig;
use crate::error::{BusError, DiscoveryError};
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS, Transport};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub fn build_options(cfg: &MqttConfig, role: &str) -> MqttOptions {
    let client_id = cfg
        .client_id
        .clone()
        .map(|id| format!("{id}-{role}"))
        .unwrap_or_else(|| format!("fronius-smartmeter-{role}-{}", Uuid::new_v4()));
    let mut opts = MqttOptions::new(client_id, &cfg.host, cfg.port);
    opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.unwrap_or(30)));
    opts.set_clean_session(true);
    if let (Some(u), Some(p)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(u.clone(), p.clone());
    }
    if cfg.port == 8883 {
        opts.set_transport(Transport::tls_with_default_config());
    }
    opts
}

pub fn new(options: MqttOptions) -> (AsyncClient, EventLoop) {
    AsyncClient::new(options, 64)
}

/// Topic layout of one service.
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
    service: String,
}

impl Topics {
    pub fn new(prefix: &str, service: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('/').to_string(),
            service: service.to_string(),
        }
    }

    pub fn notify(&self, path: &str) -> String {
        format!("{}/N/{}{}", self.prefix, self.service, path)
    }

    pub fn write_filter(&self) -> String {
        format!("{}/W/{}/#", self.prefix, self.service)
    }

    /// The bus path addressed by a write topic of this service.
    pub fn write_path<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.prefix.as_str())?
            .strip_prefix("/W/")?
            .strip_prefix(self.service.as_str())
            .filter(|path| path.starts_with('/'))
    }
}

/// Split `{prefix}/N/{service}{path}` into service and path.
pub fn split_notify_topic<'a>(prefix: &str, topic: &'a str) -> Option<(&'a str, &'a str)> {
    let rest = topic
        .strip_prefix(prefix.trim_end_matches('/'))?
        .strip_prefix("/N/")?;
    let idx = rest.find('/')?;
    Some((&rest[..idx], &rest[idx..]))
}

#[derive(Debug, Deserialize)]
struct ValuePayload {
    value: BusValue,
}

fn notify_payload(update: &PathUpdate) -> Vec<u8> {
    serde_json::json!({ "value": update.value, "text": update.text })
        .to_string()
        .into_bytes()
}

enum Inbound {
    Connected,
    Write { path: String, payload: Vec<u8> },
}

/// Mirror `tree` onto the broker and route external writes back into it.
/// Runs until the tree is dropped.
pub async fn run_binding(tree: Arc<ObjectTree>, cfg: MqttConfig) -> Result<(), BusError> {
    let topics = Topics::new(&cfg.topic_prefix, tree.service_name());
    let (client, eventloop) = new(build_options(&cfg, "service"));
    let (tx, mut rx) = mpsc::channel(64);
    tokio::spawn(drive_eventloop(eventloop, topics.clone(), tx));

    let mut updates = tree.subscribe();
    info!(host = %cfg.host, port = cfg.port, service = %tree.service_name(), "starting MQTT binding");

    loop {
        tokio::select! {
            inbound = rx.recv() => match inbound {
                Some(Inbound::Connected) => {
                    client
                        .subscribe(topics.write_filter(), QoS::AtLeastOnce)
                        .await
                        .map_err(|e| BusError::Mqtt(e.to_string()))?;
                    publish_all(&client, &topics, &tree).await?;
                    info!("MQTT connected; object tree published");
                }
                Some(Inbound::Write { path, payload }) => handle_write(&tree, &path, &payload),
                None => return Err(BusError::Mqtt("MQTT event loop stopped".into())),
            },
            update = updates.recv() => match update {
                Ok(u) => publish(&client, &topics, &u).await?,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "MQTT binding lagged; republishing object tree");
                    publish_all(&client, &topics, &tree).await?;
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn drive_eventloop(mut eventloop: EventLoop, topics: Topics, tx: mpsc::Sender<Inbound>) {
    loop {
        let inbound = match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(_))) => Inbound::Connected,
            Ok(Event::Incoming(Incoming::Publish(p))) => match topics.write_path(&p.topic) {
                Some(path) => Inbound::Write {
                    path: path.to_string(),
                    payload: p.payload.to_vec(),
                },
                None => continue,
            },
            Ok(_) => continue,
            Err(e) => {
                warn!("mqtt error: {e}; reconnecting after short delay");
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
        };
        if tx.send(inbound).await.is_err() {
            return;
        }
    }
}

async fn publish(client: &AsyncClient, topics: &Topics, update: &PathUpdate) -> Result<(), BusError> {
    client
        .publish(
            topics.notify(&update.path),
            QoS::AtMostOnce,
            true,
            notify_payload(update),
        )
        .await
        .map_err(|e| BusError::Mqtt(e.to_string()))
}

async fn publish_all(client: &AsyncClient, topics: &Topics, tree: &ObjectTree) -> Result<(), BusError> {
    for update in tree.snapshot() {
        publish(client, topics, &update).await?;
    }
    Ok(())
}

fn handle_write(tree: &ObjectTree, path: &str, payload: &[u8]) {
    let request: ValuePayload = match serde_json::from_slice(payload) {
        Ok(r) => r,
        Err(e) => {
            warn!(path, error = %e, "ignoring malformed write request");
            return;
        }
    };
    match tree.write_external(path, request.value) {
        Ok(()) => info!(path, "external write accepted"),
        Err(e) => warn!(path, error = %e, "external write rejected"),
    }
}

/// Collect the retained values of `paths` across all services on the broker.
///
/// Retained messages arrive right after subscribing; whatever has arrived
/// within `settle` makes up the snapshot.
pub async fn introspect(
    cfg: &MqttConfig,
    paths: &[&str],
    settle: Duration,
) -> Result<BusSnapshot, DiscoveryError> {
    let prefix = cfg.topic_prefix.trim_end_matches('/');
    let (client, mut eventloop) = new(build_options(cfg, "probe"));
    for path in paths {
        client
            .subscribe(format!("{prefix}/N/+{path}"), QoS::AtMostOnce)
            .await
            .map_err(|e| DiscoveryError::Bus(e.to_string()))?;
    }

    let mut snapshot = BusSnapshot::default();
    let deadline = tokio::time::sleep(settle);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Incoming::Publish(p))) => {
                    let Some((service, path)) = split_notify_topic(prefix, &p.topic) else {
                        continue;
                    };
                    match serde_json::from_slice::<ValuePayload>(&p.payload) {
                        Ok(v) => snapshot.insert(service, path, v.value),
                        Err(e) => debug!(topic = %p.topic, error = %e, "skipping unreadable bus value"),
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(DiscoveryError::Bus(e.to_string())),
            },
        }
    }

    let _ = client.disconnect().await;
    Ok(snapshot)
}
