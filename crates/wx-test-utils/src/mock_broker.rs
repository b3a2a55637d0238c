//! Scripted broker for transport tests.
//!
//! [`MockBroker`] is a [`BrokerConnector`] whose links answer from a shared
//! script.  Every fresh link (and every re-poll after a link error) greets
//! with `ConnAck` unless failures are queued or the greeting is held back.
//! `subscribe` answers with a `SubAck` ahead of any scripted events.

use ingest::BoxFuture;
use ingest::transport::{
    BrokerConnector, BrokerLink, LinkEvent, RawPublish, TransportConfig, TransportError,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

struct Script {
    events: VecDeque<Result<LinkEvent, TransportError>>,
    connect_failures: u32,
    link_failures: u32,
    grant_subscriptions: bool,
    hold_connack: bool,
    fail_publish: bool,
    connects: u32,
    links_created: u32,
    closes: u32,
    subscriptions: Vec<String>,
    published: Vec<(String, Vec<u8>)>,
}

struct Shared {
    script: Mutex<Script>,
    wake: Notify,
}

#[derive(Clone)]
pub struct MockBroker {
    shared: Arc<Shared>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                script: Mutex::new(Script {
                    events: VecDeque::new(),
                    connect_failures: 0,
                    link_failures: 0,
                    grant_subscriptions: true,
                    hold_connack: false,
                    fail_publish: false,
                    connects: 0,
                    links_created: 0,
                    closes: 0,
                    subscriptions: Vec::new(),
                    published: Vec::new(),
                }),
                wake: Notify::new(),
            }),
        }
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.shared
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: Result<LinkEvent, TransportError>) {
        self.script().events.push_back(event);
        self.shared.wake.notify_one();
    }

    /// Deliver a publish to whichever link is polling.
    pub fn publish(&self, topic: &str, payload: Vec<u8>, pkid: u16, acknowledged: bool) {
        self.push(Ok(LinkEvent::Publish(RawPublish {
            topic: topic.to_owned(),
            payload,
            pkid,
            acknowledged,
        })));
    }

    /// Make the current link fail with `error`.
    pub fn drop_link(&self, error: TransportError) {
        self.push(Err(error));
    }

    /// The next `n` calls to `connect` fail.
    pub fn fail_connects(&self, n: u32) {
        self.script().connect_failures = n;
    }

    /// The next `n` link (re)connection attempts fail.
    pub fn fail_link_reconnects(&self, n: u32) {
        self.script().link_failures = n;
    }

    pub fn grant_subscriptions(&self, granted: bool) {
        self.script().grant_subscriptions = granted;
    }

    /// Links stay silent instead of sending `ConnAck`.
    pub fn hold_connack(&self, hold: bool) {
        self.script().hold_connack = hold;
        self.shared.wake.notify_one();
    }

    pub fn fail_publish(&self, on: bool) {
        self.script().fail_publish = on;
    }

    pub fn connects(&self) -> u32 {
        self.script().connects
    }

    pub fn links_created(&self) -> u32 {
        self.script().links_created
    }

    pub fn closes(&self) -> u32 {
        self.script().closes
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.script().subscriptions.clone()
    }

    pub fn published_to(&self, topic: &str) -> usize {
        self.script()
            .published
            .iter()
            .filter(|(t, _)| t == topic)
            .count()
    }
}

impl BrokerConnector for MockBroker {
    fn connect<'a>(
        &'a self,
        _config: &'a TransportConfig,
    ) -> BoxFuture<'a, Result<Box<dyn BrokerLink>, TransportError>> {
        Box::pin(async move {
            let mut script = self.script();
            script.connects += 1;
            if script.connect_failures > 0 {
                script.connect_failures -= 1;
                return Err(TransportError::Connect("mock broker unreachable".to_owned()));
            }
            script.links_created += 1;
            Ok(Box::new(MockLink {
                broker: self.clone(),
                greeted: false,
            }) as Box<dyn BrokerLink>)
        })
    }
}

pub struct MockLink {
    broker: MockBroker,
    /// False on a fresh link and after every error until `ConnAck` is sent.
    greeted: bool,
}

impl BrokerLink for MockLink {
    fn next_event(&mut self) -> BoxFuture<'_, Result<LinkEvent, TransportError>> {
        Box::pin(async move {
            loop {
                let wake = self.broker.shared.wake.notified();
                {
                    let mut script = self.broker.script();
                    if !self.greeted {
                        if script.link_failures > 0 {
                            script.link_failures -= 1;
                            return Err(TransportError::Connect("mock reconnect refused".to_owned()));
                        }
                        if !script.hold_connack {
                            self.greeted = true;
                            return Ok(LinkEvent::ConnAck);
                        }
                    } else if let Some(event) = script.events.pop_front() {
                        if event.is_err() {
                            self.greeted = false;
                        }
                        return event;
                    }
                }
                wake.await;
            }
        })
    }

    fn subscribe<'a>(&'a mut self, topic: &'a str) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut script = self.broker.script();
            script.subscriptions.push(topic.to_owned());
            let granted = script.grant_subscriptions;
            script.events.push_front(Ok(LinkEvent::SubAck { granted }));
            Ok(())
        })
    }

    fn publish<'a>(
        &'a mut self,
        topic: &'a str,
        payload: Vec<u8>,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let mut script = self.broker.script();
            if script.fail_publish {
                return Err(TransportError::Publish("mock publish rejected".to_owned()));
            }
            script.published.push((topic.to_owned(), payload));
            Ok(())
        })
    }

    fn close<'a>(&'a mut self, _topic: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.broker.script().closes += 1;
        })
    }
}
