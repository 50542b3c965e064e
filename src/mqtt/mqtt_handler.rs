//! rumqttc backed transport connector.
//!
//! The connector owns at most one broker connection at a time. Each connection
//! walks through a small typestate machine:
//!
//! ```text
//! MqttTransport<Configured> ──start()──> MqttTransport<Running> ──stop()──> (dropped)
//! ```
//!
//! `Configured` holds the client and its not yet polled event loop, `Running`
//! owns the spawned task that polls the event loop and forwards everything the
//! session cares about as [`TransportEvent`]s. The task never reconnects on its
//! own: after a refused connection or a dropped link it reports once and exits,
//! so a new connection is always an explicit operator decision.

use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet, QoS,
};
use statum::{machine, state};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::{ConnectRequest, TlsConfig, STATUS_OFFLINE};

/// Identifies one broker connection so events of a torn down connection can be
/// told apart from the current one.
pub type ConnectionId = u64;

/// Capacity of rumqttc's internal request queue.
const REQUEST_CAPACITY: usize = 64;

/// Upper bound for flushing the DISCONNECT packet when stopping.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Result of a connection attempt as reported by the event loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectOutcome {
    Accepted,
    /// Broker refused or the transport failed before CONNACK; carries the reason verbatim
    Refused(String),
}

/// Callbacks from the network side, delivered through the session's event queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionResult {
        connection: ConnectionId,
        outcome: ConnectOutcome,
    },
    MessageDelivered {
        connection: ConnectionId,
        topic: String,
        payload: Vec<u8>,
    },
    UnexpectedDisconnect {
        connection: ConnectionId,
        reason: String,
    },
}

impl TransportEvent {
    pub fn connection(&self) -> ConnectionId {
        match self {
            TransportEvent::ConnectionResult { connection, .. }
            | TransportEvent::MessageDelivered { connection, .. }
            | TransportEvent::UnexpectedDisconnect { connection, .. } => *connection,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected to a broker")]
    NotConnected,

    #[error("Invalid TLS configuration: {0}")]
    TlsConfig(String),

    #[error("Request rejected by client: {0}")]
    Request(String),
}

/// Operations the session needs from a broker client.
///
/// Every call only queues work and returns immediately; results arrive later
/// as [`TransportEvent`]s.
pub trait Transport: Send {
    fn connect(&mut self, request: &ConnectRequest) -> Result<ConnectionId, TransportError>;

    /// Closes the current connection, if any. Never fails.
    fn disconnect(&mut self);

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError>;

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError>;
}

/// Human readable text for a CONNACK return code.
pub fn connack_reason(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::Success => "Connection Accepted.",
        ConnectReturnCode::RefusedProtocolVersion => {
            "Connection Refused: unacceptable protocol version."
        }
        ConnectReturnCode::BadClientId => "Connection Refused: identifier rejected.",
        ConnectReturnCode::ServiceUnavailable => "Connection Refused: broker unavailable.",
        ConnectReturnCode::BadUserNamePassword => "Connection Refused: bad user name or password.",
        ConnectReturnCode::NotAuthorized => "Connection Refused: not authorised.",
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum TransportState {
    Configured, // client built, event loop not yet polled
    Running,    // event loop task spawned
}

#[machine]
pub struct MqttTransport<S: TransportState> {
    connection: ConnectionId,
    client: AsyncClient,
    event_loop: Option<EventLoop>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MqttTransport<Configured> {
    pub fn configure(
        request: &ConnectRequest,
        connection: ConnectionId,
    ) -> Result<Self, TransportError> {
        debug!("Configuring broker connection #{}: {}", connection, request);

        let mut options = MqttOptions::new(
            request.client_id.clone(),
            request.endpoint.clone(),
            request.port,
        );
        options
            .set_credentials(
                request.credentials.username.clone(),
                request.credentials.password.clone(),
            )
            .set_keep_alive(request.keep_alive)
            .set_clean_session(true);

        let transport = match &request.tls {
            TlsConfig::Native => rumqttc::Transport::tls_with_default_config(),
            TlsConfig::CaFile { path } => {
                let ca = request.ca_bundle.clone().ok_or_else(|| {
                    TransportError::TlsConfig(format!("CA file {} was not loaded", path.display()))
                })?;
                rumqttc::Transport::tls(ca, None, None)
            }
            TlsConfig::Plain => {
                warn!("Connection #{} is not encrypted", connection);
                rumqttc::Transport::tcp()
            }
        };
        options.set_transport(transport);

        if let Some(status_topic) = &request.status_topic {
            options.set_last_will(LastWill::new(
                status_topic.clone(),
                STATUS_OFFLINE,
                QoS::AtMostOnce,
                false,
            ));
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        Ok(Self::new(
            connection,
            client,
            Some(event_loop),
            CancellationToken::new(),
            None, // task
        ))
    }

    /// Spawns the event loop task and hands over to the running state.
    pub fn start(mut self, events: mpsc::Sender<TransportEvent>) -> MqttTransport<Running> {
        if let Some(event_loop) = self.event_loop.take() {
            let cancel = self.cancel.clone();
            let connection = self.connection;
            info!("Starting event loop for connection #{}", connection);
            self.task = Some(tokio::spawn(async move {
                run_event_loop(event_loop, events, cancel, connection).await;
                debug!("Event loop for connection #{} finished", connection);
            }));
        } else {
            error!("Connection #{} has no event loop to start", self.connection);
        }
        self.transition()
    }
}

impl MqttTransport<Running> {
    pub fn client(&self) -> &AsyncClient {
        &self.client
    }

    /// Queues a DISCONNECT and tells the event loop to flush it and exit.
    pub fn stop(self) {
        let finished = self.task.as_ref().map_or(true, JoinHandle::is_finished);
        info!(
            "Stopping connection #{} (event loop already finished: {})",
            self.connection, finished
        );
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request for #{} not queued: {}", self.connection, e);
        }
        self.cancel.cancel();
    }
}

async fn run_event_loop(
    mut event_loop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
    connection: ConnectionId,
) {
    let mut connected = false;

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => {
                flush_disconnect(&mut event_loop, connection).await;
                return;
            }
            polled = event_loop.poll() => polled,
        };

        let (event, finished) = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let reason = connack_reason(ack.code);
                info!("CONNACK on #{}: {}", connection, reason);
                let (outcome, finished) = if ack.code == ConnectReturnCode::Success {
                    connected = true;
                    (ConnectOutcome::Accepted, false)
                } else {
                    (ConnectOutcome::Refused(reason.to_string()), true)
                };
                (
                    Some(TransportEvent::ConnectionResult {
                        connection,
                        outcome,
                    }),
                    finished,
                )
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "Incoming publish on #{}: {} ({} bytes)",
                    connection,
                    publish.topic,
                    publish.payload.len()
                );
                (
                    Some(TransportEvent::MessageDelivered {
                        connection,
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    }),
                    false,
                )
            }
            Ok(other) => {
                debug!("Event on #{}: {:?}", connection, other);
                (None, false)
            }
            Err(e) => {
                let reason = describe_connection_error(&e);
                if connected {
                    warn!("Connection #{} dropped: {}", connection, reason);
                    (
                        Some(TransportEvent::UnexpectedDisconnect { connection, reason }),
                        true,
                    )
                } else {
                    error!("Connection #{} failed: {}", connection, reason);
                    (
                        Some(TransportEvent::ConnectionResult {
                            connection,
                            outcome: ConnectOutcome::Refused(reason),
                        }),
                        true,
                    )
                }
            }
        };

        if let Some(event) = event {
            if cancel.is_cancelled() {
                debug!("Dropping event of stopped connection #{}", connection);
            } else if events.send(event).await.is_err() {
                warn!("Session event queue closed, stopping connection #{}", connection);
                return;
            }
        }

        if finished {
            return;
        }
    }
}

fn describe_connection_error(error: &ConnectionError) -> String {
    match error {
        ConnectionError::ConnectionRefused(code) => connack_reason(*code).to_string(),
        other => other.to_string(),
    }
}

async fn flush_disconnect(event_loop: &mut EventLoop, connection: ConnectionId) {
    let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match event_loop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    })
    .await;
    if flushed.is_err() {
        debug!("DISCONNECT for #{} not flushed in time", connection);
    }
}

/// [`Transport`] implementation on top of rumqttc.
pub struct MqttConnector {
    events: mpsc::Sender<TransportEvent>,
    next_connection: ConnectionId,
    active: Option<MqttTransport<Running>>,
}

impl MqttConnector {
    pub fn new(events: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            events,
            next_connection: 1,
            active: None,
        }
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.active
            .as_ref()
            .map(|transport| transport.client())
            .ok_or(TransportError::NotConnected)
    }
}

impl Transport for MqttConnector {
    fn connect(&mut self, request: &ConnectRequest) -> Result<ConnectionId, TransportError> {
        self.disconnect();

        let connection = self.next_connection;
        self.next_connection += 1;

        let transport = MqttTransport::configure(request, connection)?;
        self.active = Some(transport.start(self.events.clone()));
        Ok(connection)
    }

    fn disconnect(&mut self) {
        if let Some(transport) = self.active.take() {
            transport.stop();
        }
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.client()?
            .try_subscribe(topic, qos)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .try_unsubscribe(topic)
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError> {
        self.client()?
            .try_publish(topic, qos, false, payload)
            .map_err(|e| TransportError::Request(e.to_string()))
    }
}

impl Drop for MqttConnector {
    fn drop(&mut self) {
        self.disconnect();
    }
}
