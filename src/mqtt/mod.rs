//! # MQTT Session Module
//!
//! Owns everything MQTTify does on the broker side: the encrypted connection,
//! the single active subscription, the single publish target and the bounded
//! history of received messages.
//!
//! ## Why This Module Exists
//!
//! Operator actions (subscribe, unsubscribe, publish) and network callbacks
//! (CONNACK, incoming PUBLISH, dropped links) arrive on different tasks at
//! arbitrary times. This module funnels both into one place so state changes
//! never interleave, and hands the shell a read-only view to render.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Connect request, TLS modes and session constants
//! ├── message_buffer.rs   - Received message records and the 10 entry ring buffer
//! ├── mqtt_handler.rs     - Transport trait and the rumqttc backed connector
//! ├── session.rs          - Connection state machine, subscription, publish target
//! └── session_worker.rs   - Worker task and the cloneable SessionHandle
//! ```
//!
//! ## Data Flow
//!
//! ```text
//! shell ─[SessionAction]─> session worker ─> Session ─> Transport ─> broker
//! broker ─> rumqttc event loop ─[TransportEvent]─> session worker ─> Session
//! Session ─[watch: SessionView]─> shell
//! ```
//!
//! ## Design Notes
//!
//! - **Single owner**: only the worker task touches [`session::Session`]; there
//!   is no lock around session state.
//! - **Topic tagged delivery**: every delivered message carries its topic and is
//!   checked against the current subscription, so messages of a replaced
//!   subscription never reach the buffer.
//! - **No silent reconnects**: a failed or dropped connection is reported once;
//!   reconnecting is always an explicit `connect`.

pub mod config;
#[cfg(test)]
pub mod fake_transport;
pub mod message_buffer;
pub mod mqtt_handler;
pub mod session;
pub mod session_worker;

pub use config::{ConnectRequest, Credentials, TlsConfig};
pub use mqtt_handler::{MqttConnector, TransportEvent};
pub use session::{ConnectionState, PublishReceipt, SessionError, SessionView};
pub use session_worker::{SessionHandle, EVENT_QUEUE_DEPTH};
