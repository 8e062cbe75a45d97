//! On-disk node certificate, private key and trusted CA certificates.

use std::{
    fs,
    path::{Path, PathBuf},
};

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::{
    RootCertStore,
    pki_types::{CertificateDer, PrivateKeyDer, pem::PemObject},
};
use sha2::{Digest, Sha256};

use crate::error::{Error, ErrorKind, Result};

fn certificate_error(e: impl std::fmt::Display) -> Error {
    Error::new(ErrorKind::CertificateError, e.to_string())
}

/// SHA-256 of a DER certificate as lowercase hex.
#[must_use]
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// Accepts `AB:CD:...` as well as plain hex.
#[must_use]
pub fn normalize_fingerprint(fingerprint: &str) -> String {
    fingerprint
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase()
}

/// Subject common name of a DER certificate.
///
/// # Errors
///
/// Fails if the certificate cannot be parsed.
pub fn common_name(der: &[u8]) -> Result<Option<String>> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).map_err(certificate_error)?;
    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    Ok(common_name)
}

/// # Errors
///
/// Fails if the certificate cannot be parsed.
pub fn is_self_issued(der: &[u8]) -> Result<bool> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).map_err(certificate_error)?;
    Ok(cert.subject().as_raw() == cert.issuer().as_raw())
}

fn parse_pem_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(certificate_error)?;
    if certs.is_empty() {
        return Err(Error::new(
            ErrorKind::CertificateError,
            "no PEM certificate found",
        ));
    }
    Ok(certs)
}

/// `<dir>/<name>.pem` and `<dir>/<name>.key`.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
    name: String,
}

impl CertificateStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
        }
    }

    #[must_use]
    pub fn cert_path(&self) -> PathBuf {
        self.dir.join(format!("{}.pem", self.name))
    }

    #[must_use]
    pub fn key_path(&self) -> PathBuf {
        self.dir.join(format!("{}.key", self.name))
    }

    #[must_use]
    pub fn has_certificate(&self) -> bool {
        self.cert_path().is_file() && self.key_path().is_file()
    }

    /// Generates a key and a self-signed certificate (CN = store name)
    /// unless both already exist.
    ///
    /// # Errors
    pub fn ensure_certificate(&self) -> Result<()> {
        if self.has_certificate() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        let key = KeyPair::generate()?;
        let cert = self.params()?.self_signed(&key)?;
        write_private(&self.key_path(), key.serialize_pem().as_bytes())?;
        fs::write(self.cert_path(), cert.pem())?;
        tracing::info!("generated a self-signed certificate for {}", self.name);
        Ok(())
    }

    /// # Errors
    pub fn certificate_chain(&self) -> Result<Vec<CertificateDer<'static>>> {
        parse_pem_certificates(&fs::read(self.cert_path())?)
    }

    /// # Errors
    pub fn private_key(&self) -> Result<PrivateKeyDer<'static>> {
        PrivateKeyDer::from_pem_file(self.key_path()).map_err(certificate_error)
    }

    /// # Errors
    pub fn is_self_signed(&self) -> Result<bool> {
        let chain = self.certificate_chain()?;
        is_self_issued(&chain[0])
    }

    /// PKCS#10 signing request for the stored key.
    ///
    /// # Errors
    pub fn csr_pem(&self) -> Result<String> {
        self.ensure_certificate()?;
        let key = KeyPair::from_pem(&fs::read_to_string(self.key_path())?)?;
        Ok(self.params()?.serialize_request(&key)?.pem()?)
    }

    /// Replaces the certificate with a CA-signed one for the stored key.
    ///
    /// # Errors
    ///
    /// Fails with `CertificateError` if the certificate is invalid or does
    /// not belong to the stored key.
    pub fn write_certificate(&self, pem: &str) -> Result<()> {
        let chain = parse_pem_certificates(pem.as_bytes())?;
        let key = KeyPair::from_pem(&fs::read_to_string(self.key_path())?)?;
        let (_, leaf) = x509_parser::parse_x509_certificate(&chain[0]).map_err(certificate_error)?;
        if leaf.public_key().raw != key.public_key_der().as_slice() {
            return Err(Error::new(
                ErrorKind::CertificateError,
                "certificate does not match the private key",
            ));
        }
        fs::write(self.cert_path(), pem)?;
        tracing::info!("stored a signed certificate for {}", self.name);
        Ok(())
    }

    fn params(&self) -> Result<CertificateParams> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, self.name.as_str());
        params.distinguished_name = name;
        Ok(params)
    }
}

fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    fs::write(path, contents)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

/// Directory of trusted CA certificates, one `*.pem` per CA.
#[derive(Debug, Clone)]
pub struct TrustStore {
    dir: PathBuf,
}

impl TrustStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// # Errors
    pub fn ca_certificates(&self) -> Result<Vec<CertificateDer<'static>>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "pem"))
            .collect();
        paths.sort();

        let mut certs = Vec::new();
        for path in paths {
            match parse_pem_certificates(&fs::read(&path)?) {
                Ok(mut found) => certs.append(&mut found),
                Err(e) => tracing::warn!("ignoring {}: {e}", path.display()),
            }
        }
        Ok(certs)
    }

    /// Stores a CA certificate under its fingerprint and returns it.
    ///
    /// # Errors
    pub fn add_ca_certificate(&self, pem: &str) -> Result<String> {
        let certs = parse_pem_certificates(pem.as_bytes())?;
        if certs.len() != 1 {
            return Err(Error::new(
                ErrorKind::CertificateError,
                format!("expected one CA certificate, got {}", certs.len()),
            ));
        }
        let fingerprint = fingerprint(&certs[0]);
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join(format!("{fingerprint}.pem")), pem)?;
        tracing::info!("trusting CA certificate {fingerprint}");
        Ok(fingerprint)
    }

    /// # Errors
    pub fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in self.ca_certificates()? {
            roots.add(cert)?;
        }
        Ok(roots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, IsCa, KeyUsagePurpose};
    use uuid::Uuid;

    #[test]
    fn test_self_signed_then_signed() {
        let dir = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4().to_string();
        let store = CertificateStore::new(dir.path().join("ssl"), &uuid);
        assert!(!store.has_certificate());

        store.ensure_certificate().unwrap();
        assert!(store.has_certificate());
        assert!(store.is_self_signed().unwrap());
        let chain = store.certificate_chain().unwrap();
        assert_eq!(common_name(&chain[0]).unwrap().as_deref(), Some(uuid.as_str()));
        assert!(store.private_key().is_ok());
        assert!(store.csr_pem().unwrap().contains("CERTIFICATE REQUEST"));

        let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        ca_params.distinguished_name.push(DnType::CommonName, "test ca");
        let ca_key = KeyPair::generate().unwrap();
        let ca = ca_params.self_signed(&ca_key).unwrap();

        // a certificate for another key is refused.
        let other_key = KeyPair::generate().unwrap();
        let foreign = store.params().unwrap().signed_by(&other_key, &ca, &ca_key).unwrap();
        let err = store.write_certificate(&foreign.pem()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::CertificateError);

        let key = KeyPair::from_pem(&fs::read_to_string(store.key_path()).unwrap()).unwrap();
        let signed = store.params().unwrap().signed_by(&key, &ca, &ca_key).unwrap();
        store.write_certificate(&signed.pem()).unwrap();
        assert!(!store.is_self_signed().unwrap());

        let trust = TrustStore::new(dir.path().join("trust"));
        assert!(trust.root_store().unwrap().is_empty());
        let fp = trust.add_ca_certificate(&ca.pem()).unwrap();
        assert_eq!(fp, fingerprint(ca.der()));
        assert_eq!(trust.root_store().unwrap().len(), 1);
        assert!(trust.add_ca_certificate("garbage").is_err());
    }

    #[test]
    fn test_normalize_fingerprint() {
        assert_eq!(normalize_fingerprint("AB:cd:01"), "abcd01");
        assert_eq!(normalize_fingerprint("abcd01"), "abcd01");
    }
}
