use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Quality of service used for every subscribe and publish issued by the session.
pub const SESSION_QOS: rumqttc::QoS = rumqttc::QoS::AtLeastOnce;

/// Number of received messages kept for the active subscription.
pub const MESSAGE_CAPACITY: usize = 10;

/// Payload published to the status topic once the broker accepts the connection.
pub const STATUS_ONLINE: &str = "online";

/// Payload the broker publishes on our behalf (last will) when the client drops.
pub const STATUS_OFFLINE: &str = "offline";

/// How the connection to the broker is secured.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum TlsConfig {
    /// TLS verified against the platform root certificates
    #[default]
    Native,
    /// TLS verified against a PEM encoded CA bundle
    CaFile { path: PathBuf },
    /// Unencrypted TCP, only meant for local test brokers
    Plain,
}

impl fmt::Display for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TlsConfig::Native => write!(f, "tls (native roots)"),
            TlsConfig::CaFile { path } => write!(f, "tls (ca: {})", path.display()),
            TlsConfig::Plain => write!(f, "plain tcp"),
        }
    }
}

/// Username/password pair handed to the broker.
///
/// The password never shows up in `Debug` output so connect requests can be
/// logged safely.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Everything the transport needs to open one broker connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub endpoint: String,
    pub port: u16,
    pub credentials: Credentials,
    pub tls: TlsConfig,
    /// PEM contents of the `ca_file` TLS mode, see [`ConnectRequest::load_ca_bundle`]
    pub ca_bundle: Option<Vec<u8>>,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Topic that receives "online" after connecting and "offline" as last will
    pub status_topic: Option<String>,
}

impl ConnectRequest {
    pub fn new(
        endpoint: impl Into<String>,
        port: u16,
        credentials: Credentials,
        tls: TlsConfig,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            port,
            credentials,
            tls,
            ca_bundle: None,
            client_id: "mqttify".to_string(),
            keep_alive: Duration::from_secs(60),
            status_topic: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_status_topic(mut self, status_topic: Option<String>) -> Self {
        self.status_topic = status_topic.filter(|topic| !topic.is_empty());
        self
    }

    /// Reads the CA bundle of a `ca_file` TLS mode, so connecting never blocks on disk IO.
    pub async fn load_ca_bundle(mut self) -> std::io::Result<Self> {
        if let TlsConfig::CaFile { path } = &self.tls {
            self.ca_bundle = Some(tokio::fs::read(path).await?);
        }
        Ok(self)
    }

    /// Checks the request before anything touches the network.
    ///
    /// Port 0 is the only value outside `[1, 65535]` a `u16` can hold.
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoint.trim().is_empty() {
            return Err("endpoint must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("port must be in 1..=65535".to_string());
        }
        if self.credentials.username.is_empty() {
            return Err("username must not be empty".to_string());
        }
        if self.credentials.password.is_empty() {
            return Err("password must not be empty".to_string());
        }
        Ok(())
    }
}

impl fmt::Display for ConnectRequest {
    /// Formats as "user@host:port", leaving the password out.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}@{}:{} via {}",
            self.credentials.username, self.endpoint, self.port, self.tls
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ConnectRequest {
        ConnectRequest::new(
            "broker.example.com",
            8883,
            Credentials::new("operator", "secret"),
            TlsConfig::Native,
        )
    }

    #[test]
    fn valid_request_passes() {
        assert!(request().validate().is_ok());
    }

    #[test]
    fn rejects_empty_endpoint_port_zero_and_missing_credentials() {
        let mut req = request();
        req.endpoint = "  ".to_string();
        assert!(req.validate().is_err());

        let mut req = request();
        req.port = 0;
        assert!(req.validate().is_err());

        let mut req = request();
        req.credentials.username.clear();
        assert!(req.validate().is_err());

        let mut req = request();
        req.credentials.password.clear();
        assert!(req.validate().is_err());
    }

    #[test]
    fn password_is_not_printed() {
        let req = request();
        assert!(!format!("{:?}", req).contains("secret"));
        assert!(!req.to_string().contains("secret"));
    }

    #[tokio::test]
    async fn ca_bundle_is_only_read_for_ca_file_mode() {
        let loaded = request().load_ca_bundle().await.unwrap();
        assert_eq!(loaded.ca_bundle, None);

        let mut req = request();
        req.tls = TlsConfig::CaFile {
            path: "/nonexistent/mqttify-ca.pem".into(),
        };
        assert!(req.load_ca_bundle().await.is_err());
    }

    #[test]
    fn empty_status_topic_is_ignored() {
        let req = request().with_status_topic(Some(String::new()));
        assert_eq!(req.status_topic, None);
    }
}
