use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_inline_default::serde_inline_default;
use uuid::Uuid;

use crate::{
    error::{Error, ErrorKind, Result},
    identity::NodeIdentity,
    registry::PeerConfig,
    retry::RetryPolicy,
    session::SessionOptions,
};

/// Node settings, usually read from a JSON file.
///
/// ```json
/// {
///   "config_dir": "/var/lib/meshnode",
///   "listeners": ["0.0.0.0:5661"],
///   "connections": { "10.0.0.2:5661": {} },
///   "retry": { "interval": "5s" }
/// }
/// ```
#[serde_inline_default]
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NodeConfig {
    /// Node uuid. Generated and stored in `config_dir` when absent.
    #[serde(default)]
    pub uuid: Option<Uuid>,
    /// Display name. Defaults to the host name.
    #[serde(default)]
    pub name: Option<String>,
    #[serde_inline_default(PathBuf::from("/var/lib/meshnode"))]
    pub config_dir: PathBuf,
    #[serde_inline_default(Some(PathBuf::from("/run/meshnode/node.sock")))]
    pub control_socket: Option<PathBuf>,
    /// Addresses to accept TLS connections on.
    #[serde(default)]
    pub listeners: Vec<String>,
    /// Persistent outbound peers, keyed by address.
    #[serde(default)]
    pub connections: BTreeMap<String, PeerConfig>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// `request_timeout` and `send_queue` of every session.
    #[serde(flatten)]
    pub session: SessionOptions,
    #[serde_inline_default(Duration::from_secs(10))]
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// How long a client without certificate is kept before it is dropped.
    #[serde_inline_default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub certificate_grace: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::Value::Object(serde_json::Map::default())).unwrap()
    }
}

impl NodeConfig {
    /// # Errors
    ///
    /// `Configuration` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::new(ErrorKind::Configuration, format!("{}: {e}", path.display()))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| Error::new(ErrorKind::Configuration, format!("{}: {e}", path.display())))
    }

    #[must_use]
    pub fn ssl_dir(&self) -> PathBuf {
        self.config_dir.join("ssl")
    }

    #[must_use]
    pub fn trust_dir(&self) -> PathBuf {
        self.config_dir.join("trust")
    }

    /// Resolves the node identity, persisting a generated uuid in
    /// `<config_dir>/uuid` so that it survives restarts.
    ///
    /// # Errors
    pub fn identity(&self) -> Result<NodeIdentity> {
        let uuid = match self.uuid {
            Some(uuid) => uuid,
            None => self.stored_uuid()?,
        };
        let name = self
            .name
            .clone()
            .or_else(host_name)
            .unwrap_or_else(|| uuid.to_string());
        Ok(NodeIdentity::new(uuid, name))
    }

    fn stored_uuid(&self) -> Result<Uuid> {
        let path = self.config_dir.join("uuid");
        match std::fs::read_to_string(&path) {
            Ok(content) => Uuid::parse_str(content.trim()).map_err(|e| {
                Error::new(ErrorKind::Configuration, format!("{}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let uuid = Uuid::new_v4();
                std::fs::create_dir_all(&self.config_dir)?;
                std::fs::write(&path, uuid.to_string())?;
                tracing::info!("generated node uuid {uuid}");
                Ok(uuid)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn host_name() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.config_dir, PathBuf::from("/var/lib/meshnode"));
        assert_eq!(
            config.control_socket,
            Some(PathBuf::from("/run/meshnode/node.sock"))
        );
        assert!(config.listeners.is_empty());
        assert_eq!(config.retry, RetryPolicy::default());
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.certificate_grace, Duration::from_secs(5));
        assert_eq!(config.session.request_timeout, None);
    }

    #[test]
    fn test_load_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        let content = serde_json::json!({
            "name": "edge-1",
            "config_dir": dir.path().join("state"),
            "control_socket": null,
            "listeners": ["127.0.0.1:0"],
            "connections": {"10.0.0.2:5661": {"fingerprint": "ab:cd"}},
            "retry": {"interval": "2s"},
            "handshake_timeout": "3s",
            "request_timeout": "30s",
        });
        std::fs::write(&path, content.to_string()).unwrap();

        let config = NodeConfig::load(&path).unwrap();
        assert_eq!(config.control_socket, None);
        assert_eq!(config.retry.interval, Duration::from_secs(2));
        assert_eq!(config.handshake_timeout, Duration::from_secs(3));
        assert_eq!(config.session.request_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.session.send_queue, 1024);
        assert_eq!(
            config.connections["10.0.0.2:5661"].fingerprint.as_deref(),
            Some("ab:cd")
        );

        let identity = config.identity().unwrap();
        assert_eq!(identity.name, "edge-1");
        assert_eq!(config.identity().unwrap().uuid, identity.uuid);

        std::fs::write(&path, "{\"listeners\": 1}").unwrap();
        let err = NodeConfig::load(&path).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
    }
}
