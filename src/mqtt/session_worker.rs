use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::ConnectRequest;
use super::mqtt_handler::{Transport, TransportEvent};
use super::session::{ConnectionState, PublishReceipt, Session, SessionError, SessionView};

/// Depth of the operator command queue.
const COMMAND_QUEUE_DEPTH: usize = 32;

/// Depth of the queue between the transport event loop and the worker.
pub const EVENT_QUEUE_DEPTH: usize = 256;

// Publishes the new view before answering, so a caller that got its response
// never reads an older state.
macro_rules! handle_action {
    ($session:expr, $view_tx:expr, $action:expr, $response_tx:expr) => {{
        let result = $action;
        $view_tx.send_replace($session.view());
        if $response_tx.send(result).is_err() {
            error!("Failed to send response");
        }
    }};
}

// Commands accepted by the session worker
#[derive(Debug)]
pub enum SessionAction {
    Connect {
        request: ConnectRequest,
        response_tx: oneshot::Sender<Result<(), SessionError>>,
    },
    Disconnect {
        response_tx: oneshot::Sender<()>,
    },
    Subscribe {
        topic: String,
        response_tx: oneshot::Sender<Result<(), SessionError>>,
    },
    Unsubscribe {
        response_tx: oneshot::Sender<()>,
    },
    SetPublishTarget {
        topic: String,
        response_tx: oneshot::Sender<()>,
    },
    ClearPublishTarget {
        response_tx: oneshot::Sender<()>,
    },
    Publish {
        body: String,
        response_tx: oneshot::Sender<Result<PublishReceipt, SessionError>>,
    },
}

/// Cloneable front door to the session worker.
///
/// Every command is queued to the one task that owns the [`Session`]; queries
/// read the latest [`SessionView`] published by that task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: Sender<SessionAction>,
    view: watch::Receiver<SessionView>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    /// Starts the worker that owns `transport` and drains `events`.
    pub fn spawn<T>(transport: T, events: Receiver<TransportEvent>) -> (Self, JoinHandle<()>)
    where
        T: Transport + 'static,
    {
        let session = Session::new(transport);
        let (view_tx, view_rx) = watch::channel(session.view());
        let (tx, rx) = channel::<SessionAction>(COMMAND_QUEUE_DEPTH);
        let shutdown = CancellationToken::new();

        info!("Spawning session worker");
        let worker = tokio::spawn(run_session_worker(
            session,
            rx,
            events,
            view_tx,
            shutdown.clone(),
        ));

        (
            Self {
                tx,
                view: view_rx,
                shutdown,
            },
            worker,
        )
    }

    async fn request<R>(
        &self,
        action: SessionAction,
        response_rx: oneshot::Receiver<R>,
    ) -> Result<R, SessionError> {
        self.tx
            .send(action)
            .await
            .map_err(|e| SessionError::ChannelError(format!("worker stopped: {}", e)))?;
        response_rx
            .await
            .map_err(|e| SessionError::ChannelError(format!("no response: {}", e)))
    }

    pub async fn connect(&self, request: ConnectRequest) -> Result<(), SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(
            SessionAction::Connect {
                request,
                response_tx,
            },
            response_rx,
        )
        .await?
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(SessionAction::Disconnect { response_tx }, response_rx)
            .await
    }

    pub async fn subscribe(&self, topic: impl Into<String>) -> Result<(), SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(
            SessionAction::Subscribe {
                topic: topic.into(),
                response_tx,
            },
            response_rx,
        )
        .await?
    }

    pub async fn unsubscribe(&self) -> Result<(), SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(SessionAction::Unsubscribe { response_tx }, response_rx)
            .await
    }

    pub async fn set_publish_target(&self, topic: impl Into<String>) -> Result<(), SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(
            SessionAction::SetPublishTarget {
                topic: topic.into(),
                response_tx,
            },
            response_rx,
        )
        .await
    }

    pub async fn clear_publish_target(&self) -> Result<(), SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(SessionAction::ClearPublishTarget { response_tx }, response_rx)
            .await
    }

    pub async fn publish(&self, body: impl Into<String>) -> Result<PublishReceipt, SessionError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request(
            SessionAction::Publish {
                body: body.into(),
                response_tx,
            },
            response_rx,
        )
        .await?
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn current_messages(&self) -> Vec<String> {
        self.view.borrow().current_messages()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.view.borrow().connection_state
    }

    /// Receiver that is notified after every state change.
    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    /// Stops the worker; the broker connection is closed on the way out.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn run_session_worker<T: Transport>(
    mut session: Session<T>,
    mut rx: Receiver<SessionAction>,
    mut events: Receiver<TransportEvent>,
    view_tx: watch::Sender<SessionView>,
    shutdown: CancellationToken,
) {
    info!("Session worker started");
    let mut events_open = true;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Session worker shutting down");
                break;
            }
            action = rx.recv() => match action {
                Some(action) => apply_action(&mut session, &view_tx, action),
                None => {
                    info!("All session handles dropped, stopping worker");
                    break;
                }
            },
            event = events.recv(), if events_open => match event {
                Some(event) => {
                    debug!("Transport event: {:?}", event);
                    session.handle_event(event);
                    view_tx.send_replace(session.view());
                }
                None => {
                    warn!("Transport event queue closed");
                    events_open = false;
                }
            },
        }
    }

    session.disconnect();
    view_tx.send_replace(session.view());
}

fn apply_action<T: Transport>(
    session: &mut Session<T>,
    view_tx: &watch::Sender<SessionView>,
    action: SessionAction,
) {
    match action {
        SessionAction::Connect {
            request,
            response_tx,
        } => {
            handle_action!(session, view_tx, session.connect(request), response_tx);
        }
        SessionAction::Disconnect { response_tx } => {
            handle_action!(session, view_tx, session.disconnect(), response_tx);
        }
        SessionAction::Subscribe { topic, response_tx } => {
            handle_action!(session, view_tx, session.subscribe(&topic), response_tx);
        }
        SessionAction::Unsubscribe { response_tx } => {
            handle_action!(session, view_tx, session.unsubscribe(), response_tx);
        }
        SessionAction::SetPublishTarget { topic, response_tx } => {
            handle_action!(session, view_tx, session.set_publish_target(&topic), response_tx);
        }
        SessionAction::ClearPublishTarget { response_tx } => {
            handle_action!(session, view_tx, session.clear_publish_target(), response_tx);
        }
        SessionAction::Publish { body, response_tx } => {
            handle_action!(session, view_tx, session.publish(&body), response_tx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::{Credentials, TlsConfig};
    use crate::mqtt::fake_transport::{FakeTransport, TransportCall};
    use crate::mqtt::mqtt_handler::ConnectOutcome;
    use std::time::Duration;

    fn request() -> ConnectRequest {
        ConnectRequest::new(
            "ok-endpoint",
            8883,
            Credentials::new("operator", "secret"),
            TlsConfig::Native,
        )
    }

    async fn wait_for(
        handle: &SessionHandle,
        predicate: impl Fn(&SessionView) -> bool,
    ) -> SessionView {
        let mut rx = handle.watch();
        let view = tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|v| predicate(v)))
            .await
            .expect("state reached in time")
            .expect("worker alive")
            .clone();
        view
    }

    #[tokio::test]
    async fn end_to_end_through_the_worker() {
        let transport = FakeTransport::default();
        let calls = transport.recorder();
        let (events_tx, events_rx) = channel(EVENT_QUEUE_DEPTH);
        let (handle, _worker) = SessionHandle::spawn(transport, events_rx);

        handle.connect(request()).await.unwrap();
        assert_eq!(handle.connection_state(), ConnectionState::Connecting);

        // the fake hands out connection ids starting at 1
        events_tx
            .send(TransportEvent::ConnectionResult {
                connection: 1,
                outcome: ConnectOutcome::Accepted,
            })
            .await
            .unwrap();
        wait_for(&handle, |v| v.connection_state == ConnectionState::Connected).await;

        handle.subscribe("sensors/temp").await.unwrap();
        let view = handle.view();
        assert_eq!(view.subscription.unwrap().topic, "sensors/temp");
        assert!(view.messages.is_empty());

        for i in 0..12 {
            events_tx
                .send(TransportEvent::MessageDelivered {
                    connection: 1,
                    topic: "sensors/temp".into(),
                    payload: format!("{}", i).into_bytes(),
                })
                .await
                .unwrap();
        }
        let view = wait_for(&handle, |v| v.messages_received == 12).await;
        let expected: Vec<String> = (2..12).map(|i| i.to_string()).collect();
        assert_eq!(view.current_messages(), expected);

        handle.set_publish_target("cmd").await.unwrap();
        let receipt = handle.publish(" 42 \n").await.unwrap();
        assert_eq!(receipt.payload, "42\n");
        assert!(calls.lock().unwrap().contains(&TransportCall::Publish {
            topic: "cmd".into(),
            payload: "42\n".into(),
            qos: rumqttc::QoS::AtLeastOnce,
        }));

        handle.unsubscribe().await.unwrap();
        assert!(handle.current_messages().is_empty());
    }

    #[tokio::test]
    async fn errors_come_back_as_results() {
        let (_events_tx, events_rx) = channel(EVENT_QUEUE_DEPTH);
        let (handle, _worker) = SessionHandle::spawn(FakeTransport::default(), events_rx);

        assert!(matches!(
            handle.subscribe("").await,
            Err(SessionError::InvalidTopic { .. })
        ));
        assert!(matches!(
            handle.publish("x").await,
            Err(SessionError::NoPublishTarget(_))
        ));
        assert_eq!(handle.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_disconnects_and_rejects_further_commands() {
        let transport = FakeTransport::default();
        let calls = transport.recorder();
        let (_events_tx, events_rx) = channel(EVENT_QUEUE_DEPTH);
        let (handle, worker) = SessionHandle::spawn(transport, events_rx);

        handle.connect(request()).await.unwrap();
        handle.shutdown();
        worker.await.unwrap();

        assert!(calls.lock().unwrap().contains(&TransportCall::Disconnect));
        assert!(matches!(
            handle.subscribe("a").await,
            Err(SessionError::ChannelError(_))
        ));
    }
}
