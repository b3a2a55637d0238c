//! Broker transport.
//!
//! [`TransportClient`] is the connection manager: one logical subscription
//! at a time, fixed-backoff reconnects, keepalive, and a clean distinction
//! between deliberate and unexpected disconnects.  The broker protocol sits
//! behind [`BrokerConnector`] / [`BrokerLink`]; [`mqtt::MqttConnector`] is
//! the production implementation.

pub mod client;
pub mod mqtt;

pub use client::TransportClient;
pub use mqtt::MqttConnector;

use crate::BoxFuture;
use crate::message_dedup::MessageId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_RAPID_RETRIES: u32 = 5;
pub const KEEPALIVE_TOPIC: &str = "$SYS/ping";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerScheme {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl BrokerScheme {
    /// Default scheme for a port when none is configured.
    pub fn for_port(port: u16) -> Self {
        match port {
            8884 => BrokerScheme::Wss,
            8883 => BrokerScheme::Tls,
            1883 => BrokerScheme::Tcp,
            _ => BrokerScheme::Ws,
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, BrokerScheme::Ws | BrokerScheme::Wss)
    }
}

impl fmt::Display for BrokerScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BrokerScheme::Tcp => "mqtt",
            BrokerScheme::Tls => "mqtts",
            BrokerScheme::Ws => "ws",
            BrokerScheme::Wss => "wss",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub endpoint: String,
    pub port: u16,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub active: bool,
    pub scheme: BrokerScheme,
    pub client_id: String,
}

impl TransportConfig {
    /// Username and password, only when both are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Some((u, p)),
            _ => None,
        }
    }

    /// Human-readable broker address (never includes credentials).
    pub fn url(&self) -> String {
        if self.scheme.is_websocket() {
            format!("{}://{}:{}/mqtt", self.scheme, self.endpoint, self.port)
        } else {
            format!("{}://{}:{}", self.scheme, self.endpoint, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportTimings {
    pub reconnect_backoff: Duration,
    pub keepalive_interval: Duration,
    /// Consecutive failures tolerated on one link before a fresh link is built.
    pub max_rapid_retries: u32,
}

impl Default for TransportTimings {
    fn default() -> Self {
        Self {
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_rapid_retries: DEFAULT_MAX_RAPID_RETRIES,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connection refused by broker: {0}")]
    Refused(String),
    #[error("connection closed: {0}")]
    Closed(String),
    #[error("subscription to '{topic}' rejected")]
    SubscribeRejected { topic: String },
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("no broker acknowledgement within keepalive interval")]
    KeepaliveTimeout,
}

/// One publish received from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub pkid: u16,
    /// True for QoS 1 and 2.
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Session accepted by the broker.
    ConnAck,
    SubAck { granted: bool },
    Publish(RawPublish),
    /// Anything else the link saw (pings, outgoing acks).
    Other,
}

/// A message handed to the [`TransportHandler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub message_id: Option<MessageId>,
}

impl InboundMessage {
    pub fn from_publish(p: RawPublish) -> Self {
        let message_id = MessageId::derive(&p.topic, p.pkid, p.acknowledged, &p.payload);
        Self {
            topic: p.topic,
            payload: p.payload,
            message_id,
        }
    }
}

/// One live broker session.
///
/// A link survives transient failures: after `next_event` returns an error
/// the next call attempts to re-establish the session on the same object.
pub trait BrokerLink: Send {
    fn next_event(&mut self) -> BoxFuture<'_, Result<LinkEvent, TransportError>>;
    fn subscribe<'a>(&'a mut self, topic: &'a str) -> BoxFuture<'a, Result<(), TransportError>>;
    fn publish<'a>(
        &'a mut self,
        topic: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TransportError>>;
    /// Best-effort unsubscribe and disconnect.
    fn close<'a>(&'a mut self, topic: &'a str) -> BoxFuture<'a, ()>;
}

pub trait BrokerConnector: Send + Sync {
    fn connect<'a>(
        &'a self,
        config: &'a TransportConfig,
    ) -> BoxFuture<'a, Result<Box<dyn BrokerLink>, TransportError>>;
}

/// Callbacks from the transport client.  Called from the client's task;
/// implementations must not block.
pub trait TransportHandler: Send + Sync {
    /// Subscribed and ready to receive.
    fn on_connect(&self);
    /// An established session dropped unexpectedly.  Not called after a
    /// deliberate `disconnect`.
    fn on_disconnect(&self);
    fn on_error(&self, err: &TransportError);
    fn on_message(&self, msg: InboundMessage);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: u16) -> TransportConfig {
        TransportConfig {
            endpoint: "broker.example.net".to_owned(),
            port,
            topic: "awsData".to_owned(),
            username: None,
            password: None,
            active: true,
            scheme: BrokerScheme::for_port(port),
            client_id: "wx_ingest_abc123_1".to_owned(),
        }
    }

    #[test]
    fn scheme_follows_port() {
        assert_eq!(BrokerScheme::for_port(8884), BrokerScheme::Wss);
        assert_eq!(BrokerScheme::for_port(8883), BrokerScheme::Tls);
        assert_eq!(BrokerScheme::for_port(1883), BrokerScheme::Tcp);
        assert_eq!(BrokerScheme::for_port(8000), BrokerScheme::Ws);
    }

    #[test]
    fn url_includes_websocket_path() {
        assert_eq!(config(8884).url(), "wss://broker.example.net:8884/mqtt");
        assert_eq!(config(1883).url(), "mqtt://broker.example.net:1883");
    }

    #[test]
    fn credentials_require_both_parts() {
        let mut c = config(8884);
        c.username = Some("user".to_owned());
        assert_eq!(c.credentials(), None);
        c.password = Some(String::new());
        assert_eq!(c.credentials(), None);
        c.password = Some("secret".to_owned());
        assert_eq!(c.credentials(), Some(("user", "secret")));
    }

    #[test]
    fn inbound_message_derives_id() {
        let msg = InboundMessage::from_publish(RawPublish {
            topic: "awsData".to_owned(),
            payload: br#"{"timestamp":1704067200}"#.to_vec(),
            pkid: 0,
            acknowledged: false,
        });
        assert_eq!(msg.message_id.unwrap().as_str(), "awsData-1704067200");
    }

    #[test]
    fn connection_state_serializes_snake_case() {
        let v = serde_json::to_value(ConnectionState::Disconnecting).unwrap();
        assert_eq!(v, "disconnecting");
    }
}
