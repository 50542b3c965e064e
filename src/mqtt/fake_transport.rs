//! In-memory [`Transport`] that records every request, used by the session tests.

use std::sync::{Arc, Mutex};

use rumqttc::QoS;

use super::config::ConnectRequest;
use super::mqtt_handler::{ConnectionId, Transport, TransportError};

#[derive(Clone, Debug, PartialEq)]
pub enum TransportCall {
    Connect { endpoint: String, port: u16 },
    Disconnect,
    Subscribe { topic: String, qos: QoS },
    Unsubscribe { topic: String },
    Publish { topic: String, payload: String, qos: QoS },
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    calls: Arc<Mutex<Vec<TransportCall>>>,
    next_connection: ConnectionId,
    fail_connect: Option<TransportError>,
}

impl FakeTransport {
    pub fn failing_connect(error: TransportError) -> Self {
        Self {
            fail_connect: Some(error),
            ..Self::default()
        }
    }

    /// Shared view of the recorded calls; stays valid after the fake moves into a worker.
    pub fn recorder(&self) -> Arc<Mutex<Vec<TransportCall>>> {
        self.calls.clone()
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl Transport for FakeTransport {
    fn connect(&mut self, request: &ConnectRequest) -> Result<ConnectionId, TransportError> {
        self.record(TransportCall::Connect {
            endpoint: request.endpoint.clone(),
            port: request.port,
        });
        if let Some(error) = &self.fail_connect {
            return Err(error.clone());
        }
        self.next_connection += 1;
        Ok(self.next_connection)
    }

    fn disconnect(&mut self) {
        self.record(TransportCall::Disconnect);
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.record(TransportCall::Subscribe {
            topic: topic.to_string(),
            qos,
        });
        Ok(())
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.record(TransportCall::Unsubscribe {
            topic: topic.to_string(),
        });
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), TransportError> {
        self.record(TransportCall::Publish {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(&payload).into_owned(),
            qos,
        });
        Ok(())
    }
}
