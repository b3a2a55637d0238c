//! Live ingestion path: broker message -> message dedup -> decode -> accept.

use crate::coordinator::{AcceptOutcome, IngestError, IngestionCoordinator};
use crate::message_dedup::MessageDeduplicator;
use crate::status_log::StatusLog;
use crate::transport::{ConnectionState, InboundMessage, TransportError, TransportHandler};
use crate::ui_events::IngestUiEvent;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};
use wx_reading::{DecodeError, Reading};

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Fresh(Reading),
    /// Same broker message already seen on this connection.
    DuplicateMessage,
    Malformed(DecodeError),
}

/// [`TransportHandler`] that feeds the coordinator.  Cheap to clone.
#[derive(Clone)]
pub struct IngestPipeline {
    coordinator: Arc<IngestionCoordinator>,
    messages: Arc<Mutex<MessageDeduplicator>>,
    status: StatusLog,
}

impl IngestPipeline {
    pub fn new(coordinator: Arc<IngestionCoordinator>, message_dedup_capacity: usize) -> Self {
        let status = coordinator.status_log().clone();
        Self {
            coordinator,
            messages: Arc::new(Mutex::new(MessageDeduplicator::new(message_dedup_capacity))),
            status,
        }
    }

    pub fn coordinator(&self) -> &Arc<IngestionCoordinator> {
        &self.coordinator
    }

    /// Message-level filtering and decoding.  Redelivered messages are
    /// rejected before any decoding work.
    pub fn admit(&self, msg: &InboundMessage) -> Admission {
        let fresh = self
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(msg.message_id.as_ref());
        if !fresh {
            return Admission::DuplicateMessage;
        }
        match wx_reading::decode(&msg.payload) {
            Ok(reading) => Admission::Fresh(reading),
            Err(e) => Admission::Malformed(e),
        }
    }

    /// Run one message through the whole path.  `None` when the message was
    /// dropped before reaching the coordinator.
    pub async fn process(&self, msg: InboundMessage) -> Option<Result<AcceptOutcome, IngestError>> {
        match self.admit(&msg) {
            Admission::Fresh(reading) => Some(self.coordinator.accept(reading).await),
            Admission::DuplicateMessage => {
                debug!(id = ?msg.message_id, "duplicate broker message dropped");
                None
            }
            Admission::Malformed(e) => {
                debug!(topic = %msg.topic, error = %e, "malformed payload dropped");
                None
            }
        }
    }

    pub fn seen_messages(&self) -> usize {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl TransportHandler for IngestPipeline {
    fn on_connect(&self) {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
        let _ = self.status.sender().send(IngestUiEvent::StatusChanged {
            connection_state: ConnectionState::Connected,
            subscribed: true,
        });
        self.status.info("Connected to broker");
    }

    fn on_disconnect(&self) {
        self.status.warn("Broker connection lost; reconnecting");
    }

    fn on_error(&self, err: &TransportError) {
        self.status.warn(format!("Broker: {err}"));
    }

    fn on_message(&self, msg: InboundMessage) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Some(Err(e)) = this.process(msg).await {
                warn!(error = %e, "reading rejected");
            }
        });
    }
}
