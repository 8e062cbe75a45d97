#![allow(dead_code)]

use std::{path::PathBuf, time::Duration};

use meshnode::{CertificateStore, NodeConfig, TrustStore};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};
use tempfile::TempDir;
use uuid::Uuid;

/// A CA plus one directory per node, everything below a temp dir.
pub struct Mesh {
    pub dir: TempDir,
    ca: rcgen::Certificate,
    ca_key: KeyPair,
}

impl Mesh {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.distinguished_name.push(DnType::CommonName, "mesh test ca");
        let ca_key = KeyPair::generate().unwrap();
        let ca = params.self_signed(&ca_key).unwrap();
        Self {
            dir: tempfile::tempdir().unwrap(),
            ca,
            ca_key,
        }
    }

    /// Config with a CA-signed certificate, a trusted CA, a control socket
    /// and one listener on an ephemeral port.
    pub fn config(&self, name: &str) -> NodeConfig {
        let config = self.unsigned_config(name);
        let uuid = config.uuid.unwrap();
        let store = CertificateStore::new(config.ssl_dir(), uuid.to_string());
        store.ensure_certificate().unwrap();
        let key = KeyPair::from_pem(&std::fs::read_to_string(store.key_path()).unwrap()).unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, uuid.to_string());
        let cert = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();
        store.write_certificate(&cert.pem()).unwrap();
        TrustStore::new(config.trust_dir())
            .add_ca_certificate(&self.ca.pem())
            .unwrap();
        config
    }

    /// Config whose node only has a self-signed certificate and no CA.
    pub fn unsigned_config(&self, name: &str) -> NodeConfig {
        let mut config = NodeConfig::default();
        config.uuid = Some(Uuid::new_v4());
        config.name = Some(name.to_string());
        config.config_dir = self.dir.path().join(name);
        config.control_socket = Some(self.socket_path(name));
        config.listeners = vec!["127.0.0.1:0".to_string()];
        config.retry = serde_json::from_value(serde_json::json!({
            "interval": "200ms",
            "min_delay": "100ms",
            "reconnect_delay": "100ms",
        }))
        .unwrap();
        config.session.request_timeout = Some(Duration::from_secs(10));
        config
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.dir.path().join(format!("{name}.sock"))
    }
}

/// Polls `condition` every 20ms for up to 10s.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
