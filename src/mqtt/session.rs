//! Session state: connection lifecycle, the single subscription, the publish
//! target and the buffer of received messages.
//!
//! [`Session`] is plain synchronous state. It is never shared directly; the
//! session worker owns it and applies operator commands and transport events
//! one at a time, which is what keeps the transitions below atomic.
//!
//! ```text
//! Disconnected ──connect──> Connecting ──accepted──> Connected
//!      ^                         │                       │
//!      │                      refused               link dropped
//!      │                         v                       │
//!      │                      Failed ──connect──> ...    │
//!      └─────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Local};
use rumqttc::mqttbytes::{matches, valid_filter};
use rumqttc::QoS;
use std::fmt;
use tracing::{debug, error, info, warn};

use super::config::{ConnectRequest, SESSION_QOS, STATUS_ONLINE};
use super::message_buffer::{decode_payload, MessageRecord, MessageRingBuffer};
use super::mqtt_handler::{ConnectOutcome, ConnectionId, Transport, TransportError, TransportEvent};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{}", text)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Subscription {
    pub topic: String,
    pub qos: QoS,
}

/// Returned by a successful publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishReceipt {
    pub topic: String,
    /// Exact text handed to the broker
    pub payload: String,
    /// Hint for the shell that the input field may be emptied
    pub clear_input: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Invalid connect request: {0}")]
    InvalidConnectRequest(String),

    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Cannot publish: {0}")]
    NoPublishTarget(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Session unavailable: {0}")]
    ChannelError(String),
}

/// Read-only copy of everything the shell renders.
#[derive(Clone, Debug, Default)]
pub struct SessionView {
    pub connection_state: ConnectionState,
    pub subscription: Option<Subscription>,
    pub publish_target: Option<String>,
    /// Oldest first
    pub messages: Vec<MessageRecord>,
    pub last_error: Option<String>,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub decode_warnings: usize,
    pub last_activity: Option<DateTime<Local>>,
}

impl SessionView {
    pub fn current_messages(&self) -> Vec<String> {
        self.messages.iter().map(|record| record.body.clone()).collect()
    }
}

/// Trims surrounding whitespace and control characters and terminates the text
/// with exactly one newline.
pub fn normalize_outbound(body: &str) -> String {
    let mut payload = body
        .trim_matches(|c: char| c.is_whitespace() || c.is_control())
        .to_string();
    payload.push('\n');
    payload
}

pub struct Session<T: Transport> {
    transport: T,
    state: ConnectionState,
    connection: Option<ConnectionId>,
    request: Option<ConnectRequest>,
    subscription: Option<Subscription>,
    publish_target: Option<String>,
    messages: MessageRingBuffer,
    last_error: Option<String>,
    messages_received: usize,
    messages_sent: usize,
    decode_warnings: usize,
    last_activity: Option<DateTime<Local>>,
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            state: ConnectionState::Disconnected,
            connection: None,
            request: None,
            subscription: None,
            publish_target: None,
            messages: MessageRingBuffer::default(),
            last_error: None,
            messages_received: 0,
            messages_sent: 0,
            decode_warnings: 0,
            last_activity: None,
        }
    }

    /// Starts a new connection attempt, tearing down any existing one first.
    ///
    /// The outcome arrives later through [`Session::handle_event`].
    pub fn connect(&mut self, request: ConnectRequest) -> Result<(), SessionError> {
        request
            .validate()
            .map_err(SessionError::InvalidConnectRequest)?;

        if self.connection.take().is_some() {
            debug!("Closing previous connection before reconnecting");
            self.transport.disconnect();
        }

        info!("Connecting to {}", request);
        self.state = ConnectionState::Connecting;
        self.last_error = None;

        match self.transport.connect(&request) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.request = Some(request);
                Ok(())
            }
            Err(e) => {
                error!("Could not start connection: {}", e);
                self.state = ConnectionState::Failed;
                self.last_error = Some(e.to_string());
                Err(SessionError::Connection(e.to_string()))
            }
        }
    }

    /// Operator initiated shutdown of the connection and the subscription.
    pub fn disconnect(&mut self) {
        if self.connection.take().is_some() {
            info!("Disconnecting from broker");
            self.transport.disconnect();
        }
        self.subscription = None;
        self.messages.clear();
        self.state = ConnectionState::Disconnected;
    }

    /// Replaces the active subscription with `topic`.
    ///
    /// The previous topic is unsubscribed before the new subscribe is queued,
    /// so the broker never holds two subscriptions for this session.
    pub fn subscribe(&mut self, topic: &str) -> Result<(), SessionError> {
        let reject = |reason: &str| SessionError::InvalidTopic {
            topic: topic.to_string(),
            reason: reason.to_string(),
        };
        if topic.is_empty() {
            return Err(reject("topic must not be empty"));
        }
        if !valid_filter(topic) {
            return Err(reject("not a valid topic filter"));
        }
        if self.state != ConnectionState::Connected {
            return Err(reject("session is not connected"));
        }

        if let Some(previous) = &self.subscription {
            debug!("Replacing subscription {}", previous.topic);
            self.transport.unsubscribe(&previous.topic)?;
        }
        self.subscription = None;
        self.messages.clear();

        self.transport.subscribe(topic, SESSION_QOS)?;
        info!("Subscribed to {}", topic);
        self.subscription = Some(Subscription {
            topic: topic.to_string(),
            qos: SESSION_QOS,
        });
        Ok(())
    }

    /// Drops the active subscription and its messages; no-op without one.
    pub fn unsubscribe(&mut self) {
        let Some(subscription) = self.subscription.take() else {
            debug!("Unsubscribe without active subscription");
            return;
        };
        self.messages.clear();

        if self.state == ConnectionState::Connected {
            if let Err(e) = self.transport.unsubscribe(&subscription.topic) {
                warn!("Unsubscribe from {} not queued: {}", subscription.topic, e);
                self.last_error = Some(e.to_string());
            }
        }
        info!("Unsubscribed from {}", subscription.topic);
    }

    /// Sets the topic used by the next publish; an empty topic unsets it.
    pub fn set_publish_target(&mut self, topic: &str) {
        if topic.is_empty() {
            self.clear_publish_target();
        } else {
            debug!("Publish target set to {}", topic);
            self.publish_target = Some(topic.to_string());
        }
    }

    pub fn clear_publish_target(&mut self) {
        debug!("Publish target reset");
        self.publish_target = None;
    }

    pub fn publish(&mut self, body: &str) -> Result<PublishReceipt, SessionError> {
        let Some(topic) = self.publish_target.clone() else {
            return Err(SessionError::NoPublishTarget(
                "no publish topic set".to_string(),
            ));
        };
        if self.state != ConnectionState::Connected {
            return Err(SessionError::NoPublishTarget(
                "session is not connected".to_string(),
            ));
        }

        let payload = normalize_outbound(body);
        self.transport
            .publish(&topic, payload.clone().into_bytes(), SESSION_QOS)?;
        debug!("Published {} bytes to {}", payload.len(), topic);

        self.messages_sent += 1;
        self.last_activity = Some(Local::now());
        Ok(PublishReceipt {
            topic,
            payload,
            clear_input: true,
        })
    }

    /// Entry point for everything the transport reports.
    ///
    /// Events of a connection that has since been replaced or closed are
    /// discarded.
    pub fn handle_event(&mut self, event: TransportEvent) {
        if self.connection != Some(event.connection()) {
            debug!(
                "Discarding event of inactive connection #{}",
                event.connection()
            );
            return;
        }

        match event {
            TransportEvent::ConnectionResult { outcome, .. } => self.on_connection_result(outcome),
            TransportEvent::MessageDelivered { topic, payload, .. } => {
                self.on_message_delivered(&topic, &payload)
            }
            TransportEvent::UnexpectedDisconnect { reason, .. } => {
                self.on_unexpected_disconnect(&reason)
            }
        }
    }

    fn on_connection_result(&mut self, outcome: ConnectOutcome) {
        match outcome {
            ConnectOutcome::Accepted => {
                info!("Connected to broker");
                self.state = ConnectionState::Connected;
                self.last_error = None;
                self.last_activity = Some(Local::now());

                // clean session: the broker forgot the subscription
                if let Some(subscription) = &self.subscription {
                    info!("Restoring subscription {}", subscription.topic);
                    if let Err(e) = self.transport.subscribe(&subscription.topic, subscription.qos)
                    {
                        warn!("Could not restore subscription: {}", e);
                        self.last_error = Some(e.to_string());
                    }
                }

                let status_topic = self
                    .request
                    .as_ref()
                    .and_then(|request| request.status_topic.clone());
                if let Some(status_topic) = status_topic {
                    if let Err(e) = self.transport.publish(
                        &status_topic,
                        STATUS_ONLINE.as_bytes().to_vec(),
                        QoS::AtMostOnce,
                    ) {
                        warn!("Could not publish status to {}: {}", status_topic, e);
                    }
                }
            }
            ConnectOutcome::Refused(reason) => {
                error!("Connection failed: {}", reason);
                self.state = ConnectionState::Failed;
                self.last_error = Some(reason);
                self.connection = None;
                self.transport.disconnect();
            }
        }
    }

    fn on_message_delivered(&mut self, topic: &str, payload: &[u8]) {
        let Some(subscription) = &self.subscription else {
            debug!("Message on {} without active subscription, discarded", topic);
            return;
        };
        if !matches(topic, &subscription.topic) {
            debug!(
                "Stale message on {} (subscribed to {}), discarded",
                topic, subscription.topic
            );
            return;
        }

        let (body, lossy) = decode_payload(payload);
        if lossy {
            self.decode_warnings += 1;
            warn!(
                "Message on {} contained invalid UTF-8, substituted {} bytes payload",
                topic,
                payload.len()
            );
        }

        let record = self.messages.append(topic, body, lossy);
        debug!("Stored message #{} from {}", record.seq, topic);
        self.messages_received += 1;
        self.last_activity = Some(Local::now());
    }

    fn on_unexpected_disconnect(&mut self, reason: &str) {
        warn!("Connection lost: {}", reason);
        self.state = ConnectionState::Disconnected;
        self.last_error = Some(format!("Connection lost: {}", reason));
        self.connection = None;
        self.transport.disconnect();
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state
    }

    pub fn subscription(&self) -> Option<&Subscription> {
        self.subscription.as_ref()
    }

    pub fn publish_target(&self) -> Option<&str> {
        self.publish_target.as_deref()
    }

    pub fn snapshot(&self) -> Vec<MessageRecord> {
        self.messages.snapshot()
    }

    pub fn current_messages(&self) -> Vec<String> {
        self.messages
            .snapshot()
            .into_iter()
            .map(|record| record.body)
            .collect()
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            connection_state: self.state,
            subscription: self.subscription.clone(),
            publish_target: self.publish_target.clone(),
            messages: self.messages.snapshot(),
            last_error: self.last_error.clone(),
            messages_received: self.messages_received,
            messages_sent: self.messages_sent,
            decode_warnings: self.decode_warnings,
            last_activity: self.last_activity,
        }
    }
}
