// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Change publication.
//!
//! After a transaction commits, the jobs hand the entities they saved to a
//! [`ChangeNotifier`], which turns the tracked dirty-field set into a retained
//! message on `procdata/{instance}/{entity type}/{id}` and passes it to the
//! injected [`ChangePublisher`]. Publication is fire-and-forget: a
//! disconnected publisher drops the message, and a failed publish is logged.

use std::collections::BTreeSet;
use std::sync::Arc;

use monapps_core::model::{Entity, Field};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Entity created.
    Create,
    /// Entity fields changed.
    Update,
    /// Entity removed.
    Delete,
}

impl MessageType {
    /// Wire tag.
    pub const fn as_str(self) -> &'static str {
        match self {
            MessageType::Create => "c",
            MessageType::Update => "u",
            MessageType::Delete => "d",
        }
    }
}

/// One outgoing change message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeMessage {
    /// `procdata/{instance}/{entity type}/{id}`
    pub topic: String,
    /// JSON object with `id`, `messageType` and the changed fields.
    pub payload: Value,
    /// Always set, so late subscribers see the latest change.
    pub retain: bool,
    /// Delivery guarantee requested from the broker.
    pub qos: u8,
}

/// Publication failure.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Nobody is listening.
    #[error("publisher is not connected")]
    Disconnected,
    /// The transport rejected the message.
    #[error("publish failed: {0}")]
    Send(String),
}

/// Transport for change messages.
pub trait ChangePublisher: Send + Sync {
    /// Whether messages can currently be delivered.
    fn is_connected(&self) -> bool;

    /// Send one message.
    fn publish(&self, message: ChangeMessage) -> Result<(), PublishError>;
}

/// In-process publisher backed by a tokio broadcast channel.
///
/// Connected while at least one subscriber exists.
#[derive(Debug, Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<ChangeMessage>,
}

impl BroadcastPublisher {
    /// Create a publisher buffering up to `capacity` messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to every message published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeMessage> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl ChangePublisher for BroadcastPublisher {
    fn is_connected(&self) -> bool {
        self.tx.receiver_count() > 0
    }

    fn publish(&self, message: ChangeMessage) -> Result<(), PublishError> {
        self.tx
            .send(message)
            .map(|_| ())
            .map_err(|_| PublishError::Disconnected)
    }
}

/// Publisher that is never connected.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPublisher;

impl ChangePublisher for NoopPublisher {
    fn is_connected(&self) -> bool {
        false
    }

    fn publish(&self, _message: ChangeMessage) -> Result<(), PublishError> {
        Err(PublishError::Disconnected)
    }
}

/// Builds change messages for entities and publishes them.
#[derive(Clone)]
pub struct ChangeNotifier {
    publisher: Arc<dyn ChangePublisher>,
    instance_id: String,
}

impl ChangeNotifier {
    /// Create a notifier publishing under `procdata/{instance_id}/...`.
    pub fn new(publisher: Arc<dyn ChangePublisher>, instance_id: impl Into<String>) -> Self {
        Self {
            publisher,
            instance_id: instance_id.into(),
        }
    }

    /// Topic of an entity.
    pub fn topic<E: Entity>(&self, entity: &E) -> String {
        format!(
            "procdata/{}/{}/{}",
            self.instance_id,
            E::TYPE_NAME,
            entity.id()
        )
    }

    /// Build a message for `entity`.
    ///
    /// `fields` restricts the payload to the changed fields; `None` sends
    /// every published field. Returns `None` for an update with nothing to
    /// report.
    pub fn build<E: Entity>(
        &self,
        entity: &E,
        message_type: MessageType,
        fields: Option<&BTreeSet<Field>>,
    ) -> Option<ChangeMessage> {
        let mut payload = Map::new();
        payload.insert(
            "id".into(),
            Value::String(format!("{} {}", E::TYPE_NAME, entity.id())),
        );
        payload.insert(
            "messageType".into(),
            Value::String(message_type.as_str().into()),
        );

        let mut changed = 0usize;
        if message_type != MessageType::Delete {
            let all = match serde_json::to_value(entity) {
                Ok(Value::Object(map)) => map,
                Ok(_) => Map::new(),
                Err(e) => {
                    warn!(error = %e, entity = E::TYPE_NAME, "Failed to serialize change");
                    Map::new()
                }
            };
            match fields {
                None => {
                    for (key, value) in all {
                        if key != "id" {
                            payload.insert(key, value);
                            changed += 1;
                        }
                    }
                }
                Some(fields) => {
                    for field in fields {
                        let name = field.camel_name();
                        if let Some(value) = all.get(name) {
                            payload.insert(name.to_string(), value.clone());
                            changed += 1;
                        }
                    }
                }
            }
        }

        if message_type == MessageType::Update && changed == 0 {
            return None;
        }

        Some(ChangeMessage {
            topic: self.topic(entity),
            payload: Value::Object(payload),
            retain: true,
            qos: 0,
        })
    }

    /// Publish a change of `entity`. Never fails.
    pub fn notify<E: Entity>(
        &self,
        entity: &E,
        message_type: MessageType,
        fields: Option<&BTreeSet<Field>>,
    ) {
        if !self.publisher.is_connected() {
            debug!(
                entity = E::TYPE_NAME,
                id = entity.id(),
                "Publisher disconnected, change dropped"
            );
            return;
        }
        let Some(message) = self.build(entity, message_type, fields) else {
            return;
        };
        if let Err(e) = self.publisher.publish(message) {
            warn!(error = %e, entity = E::TYPE_NAME, id = entity.id(), "Failed to publish change");
        }
    }

    /// Publish the changed fields of a saved entity.
    pub fn notify_updated<E: Entity>(&self, entity: &E, fields: &BTreeSet<Field>) {
        if !fields.is_empty() {
            self.notify(entity, MessageType::Update, Some(fields));
        }
    }

    /// Publish a delete of `entity`.
    pub fn notify_deleted<E: Entity>(&self, entity: &E) {
        self.notify(entity, MessageType::Delete, None);
    }
}

impl std::fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("instance_id", &self.instance_id)
            .field("connected", &self.publisher.is_connected())
            .finish()
    }
}
