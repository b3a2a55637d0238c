//! MQTT 3.1.1 broker link over `rumqttc`.
//!
//! `rumqttc` re-establishes the network connection the next time its event
//! loop is polled after an error, which is what [`BrokerLink`] expects of a
//! link between rapid retries.

use super::{
    BrokerConnector, BrokerLink, BrokerScheme, LinkEvent, RawPublish, TransportConfig,
    TransportError,
};
use crate::BoxFuture;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use std::time::Duration;
use tracing::debug;

/// Protocol-level keepalive negotiated with the broker.
const MQTT_KEEP_ALIVE: Duration = Duration::from_secs(15);
const REQUEST_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default, Clone, Copy)]
pub struct MqttConnector;

impl MqttConnector {
    pub fn new() -> Self {
        Self
    }

    fn options(config: &TransportConfig) -> MqttOptions {
        // Websocket transports take the full URL as the host.
        let host = if config.scheme.is_websocket() {
            config.url()
        } else {
            config.endpoint.clone()
        };
        let mut opts = MqttOptions::new(config.client_id.clone(), host, config.port);
        opts.set_keep_alive(MQTT_KEEP_ALIVE);
        opts.set_clean_session(true);
        if let Some((user, pass)) = config.credentials() {
            opts.set_credentials(user, pass);
        }
        match config.scheme {
            BrokerScheme::Tcp => {}
            BrokerScheme::Tls => {
                opts.set_transport(Transport::tls_with_default_config());
            }
            BrokerScheme::Ws => {
                opts.set_transport(Transport::Ws);
            }
            BrokerScheme::Wss => {
                opts.set_transport(Transport::wss_with_default_config());
            }
        }
        opts
    }
}

impl BrokerConnector for MqttConnector {
    fn connect<'a>(
        &'a self,
        config: &'a TransportConfig,
    ) -> BoxFuture<'a, Result<Box<dyn BrokerLink>, TransportError>> {
        Box::pin(async move {
            let (client, eventloop) =
                AsyncClient::new(Self::options(config), REQUEST_CHANNEL_CAPACITY);
            debug!(url = %config.url(), "mqtt link created");
            Ok(Box::new(MqttLink { client, eventloop }) as Box<dyn BrokerLink>)
        })
    }
}

pub struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
}

fn map_connection_error(e: ConnectionError) -> TransportError {
    match e {
        ConnectionError::ConnectionRefused(code) => TransportError::Refused(format!("{code:?}")),
        ConnectionError::Io(e) => TransportError::Connect(e.to_string()),
        other => TransportError::Closed(other.to_string()),
    }
}

impl BrokerLink for MqttLink {
    fn next_event(&mut self) -> BoxFuture<'_, Result<LinkEvent, TransportError>> {
        Box::pin(async move {
            let event = self.eventloop.poll().await.map_err(map_connection_error)?;
            Ok(match event {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(TransportError::Refused(format!("{:?}", ack.code)));
                    }
                    LinkEvent::ConnAck
                }
                Event::Incoming(Packet::SubAck(ack)) => LinkEvent::SubAck {
                    granted: !ack.return_codes.is_empty()
                        && ack
                            .return_codes
                            .iter()
                            .all(|c| matches!(c, SubscribeReasonCode::Success(_))),
                },
                Event::Incoming(Packet::Publish(p)) => LinkEvent::Publish(RawPublish {
                    topic: p.topic,
                    payload: p.payload.to_vec(),
                    pkid: p.pkid,
                    acknowledged: p.qos != QoS::AtMostOnce,
                }),
                Event::Incoming(Packet::Disconnect) => {
                    return Err(TransportError::Closed("broker sent disconnect".to_owned()));
                }
                _ => LinkEvent::Other,
            })
        })
    }

    fn subscribe<'a>(&'a mut self, topic: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.client
                .subscribe(topic, QoS::AtMostOnce)
                .await
                .map_err(|e| TransportError::Closed(e.to_string()))
        })
    }

    fn publish<'a>(
        &'a mut self,
        topic: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.client
                .try_publish(topic, QoS::AtMostOnce, false, payload)
                .map_err(|e| TransportError::Publish(e.to_string()))
        })
    }

    fn close<'a>(&'a mut self, topic: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            // The event loop is not polled after this; queue and drop.
            let _ = self.client.try_unsubscribe(topic);
            let _ = self.client.try_disconnect();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(port: u16) -> TransportConfig {
        TransportConfig {
            endpoint: "broker.example.net".to_owned(),
            port,
            topic: "awsData".to_owned(),
            username: Some("user".to_owned()),
            password: Some("secret".to_owned()),
            active: true,
            scheme: BrokerScheme::for_port(port),
            client_id: "wx_ingest_abc123_1".to_owned(),
        }
    }

    #[test]
    fn websocket_options_use_full_url() {
        let opts = MqttConnector::options(&config(8884));
        assert_eq!(opts.broker_address().0, "wss://broker.example.net:8884/mqtt");
        assert_eq!(opts.client_id(), "wx_ingest_abc123_1");
        assert_eq!(opts.keep_alive(), MQTT_KEEP_ALIVE);
        assert!(opts.clean_session());
        assert_eq!(
            opts.credentials(),
            Some(("user".to_owned(), "secret".to_owned()))
        );
    }

    #[test]
    fn plain_tcp_uses_bare_host() {
        let mut c = config(1883);
        c.password = None;
        let opts = MqttConnector::options(&c);
        assert_eq!(opts.broker_address(), ("broker.example.net".to_owned(), 1883));
        assert_eq!(opts.credentials(), None);
    }

    #[tokio::test]
    async fn connector_builds_link_without_network() {
        let link = MqttConnector::new().connect(&config(1883)).await;
        assert!(link.is_ok());
    }
}
