//! Certificate provisioning for the HTTPS listener
//! Uses explicit PEM material when given, otherwise a local development CA

use crate::config::{DomainSet, SslOptions};
use crate::plugin::PLUGIN_NAME;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

const CA_CERT_FILE: &str = "devproxy-ca.crt";
const CA_KEY_FILE: &str = "devproxy-ca.key";
const CA_COMMON_NAME: &str = "devproxy Development CA";

/// Errors raised while generating certificates
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("invalid certificate domain `{0}`")]
    InvalidDomain(String),

    #[error("certificate store I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::RcgenError),
}

/// A PEM key/certificate pair as produced by a [`CertificateSource`].
/// Either half may be empty if the source misbehaves.
#[derive(Debug, Clone, Default)]
pub struct CertificatePair {
    pub key: Vec<u8>,
    pub cert: Vec<u8>,
}

/// TLS material for the HTTPS listener. Both halves are always non-empty.
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateMaterial {
    key: Vec<u8>,
    cert: Vec<u8>,
}

impl CertificateMaterial {
    /// Returns `None` unless both key and certificate carry content.
    pub fn from_pem(key: impl Into<Vec<u8>>, cert: impl Into<Vec<u8>>) -> Option<Self> {
        let key = key.into();
        let cert = cert.into();
        if is_blank(&key) || is_blank(&cert) {
            return None;
        }
        Some(Self { key, cert })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn cert(&self) -> &[u8] {
        &self.cert
    }
}

impl std::fmt::Debug for CertificateMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateMaterial")
            .field("key", &"<redacted>")
            .field("cert_len", &self.cert.len())
            .finish()
    }
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

/// Something that can produce a certificate valid for a domain set
pub trait CertificateSource {
    fn certificate_for(&self, domains: &DomainSet) -> Result<CertificatePair, CertificateError>;
}

/// Produce TLS material for the listener.
///
/// Explicit `ssl` material is returned as-is and the source is never called.
/// Otherwise the source is asked for a certificate covering `domains`; any
/// error or empty result yields `None` and a warning, so the server can still
/// start over plain HTTP.
pub fn provision<S>(
    ssl: Option<&SslOptions>,
    domains: &DomainSet,
    source: &S,
) -> Option<CertificateMaterial>
where
    S: CertificateSource + ?Sized,
{
    if let Some(ssl) = ssl {
        debug!("Using explicit ssl material");
        return CertificateMaterial::from_pem(ssl.key.as_bytes(), ssl.cert.as_bytes());
    }

    let material = match source.certificate_for(domains) {
        Ok(pair) => CertificateMaterial::from_pem(pair.key, pair.cert),
        Err(e) => {
            warn!("[{}]: {}", PLUGIN_NAME, e);
            None
        }
    };

    if material.is_none() {
        warn!(
            "[{}]: could not create a certificate for {:?}; pass the ssl option to serve over HTTPS",
            PLUGIN_NAME,
            domains.as_slice()
        );
    }
    material
}

/// Loaded CA: the signing certificate plus the PEM that was handed out
struct Authority {
    signer: Certificate,
    pem: String,
}

/// Local development certificate authority.
///
/// The CA key and certificate live in `certs_dir` and are reused across runs.
/// Leaf certificates are cached per domain set.
pub struct LocalCertificateAuthority {
    certs_dir: PathBuf,
}

impl LocalCertificateAuthority {
    /// Create an authority rooted at `certs_dir`. Nothing is written until a
    /// certificate is requested.
    pub fn new<P: AsRef<Path>>(certs_dir: P) -> Self {
        Self {
            certs_dir: certs_dir.as_ref().to_path_buf(),
        }
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs_dir
    }

    /// Path of the CA certificate operators add to their trust store
    pub fn ca_cert_path(&self) -> PathBuf {
        self.certs_dir.join(CA_CERT_FILE)
    }

    /// Create the CA if it does not exist yet and return its certificate path
    pub fn ensure_ca(&self) -> Result<PathBuf, CertificateError> {
        self.load_or_create_ca()?;
        Ok(self.ca_cert_path())
    }

    fn load_or_create_ca(&self) -> Result<Authority, CertificateError> {
        let cert_path = self.ca_cert_path();
        let key_path = self.certs_dir.join(CA_KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            let pem = read(&cert_path)?;
            let key_pem = read(&key_path)?;
            // Same key and subject, so leaves verify against the stored CA cert
            let mut params = Self::ca_params();
            params.key_pair = Some(KeyPair::from_pem(&key_pem)?);
            let signer = Certificate::from_params(params)?;
            debug!("Loaded development CA from {}", cert_path.display());
            return Ok(Authority { signer, pem });
        }

        create_dir(&self.certs_dir)?;
        let signer = Certificate::from_params(Self::ca_params())?;
        let pem = signer.serialize_pem()?;
        write(&cert_path, &pem)?;
        write_private(&key_path, &signer.serialize_private_key_pem())?;

        info!(
            "Created development CA at {}; add it to your trust store to avoid browser warnings",
            cert_path.display()
        );
        Ok(Authority { signer, pem })
    }

    fn ca_params() -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, CA_COMMON_NAME);
        name.push(DnType::OrganizationName, "devproxy");
        params.distinguished_name = name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params
    }

    fn leaf_params(domains: &DomainSet) -> Result<CertificateParams, CertificateError> {
        let mut params = CertificateParams::default();
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, domains.primary());
        params.distinguished_name = name;
        params.subject_alt_names = domains
            .iter()
            .map(Self::san)
            .collect::<Result<Vec<_>, _>>()?;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.use_authority_key_identifier_extension = true;
        Ok(params)
    }

    fn san(domain: &str) -> Result<SanType, CertificateError> {
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return Ok(SanType::IpAddress(ip));
        }
        if !Self::is_valid_domain(domain) {
            return Err(CertificateError::InvalidDomain(domain.to_string()));
        }
        Ok(SanType::DnsName(domain.to_string()))
    }

    /// Hostname check. A `*` may only appear as the whole leftmost label, and
    /// names under the reserved `.invalid` TLD are refused.
    fn is_valid_domain(domain: &str) -> bool {
        let labels: Vec<&str> = domain.split('.').collect();
        if labels.last() == Some(&"invalid") {
            return false;
        }
        labels.iter().enumerate().all(|(i, label)| {
            if *label == "*" {
                return i == 0 && labels.len() > 1;
            }
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
    }

    /// Sanitize a domain set into a file stem
    fn file_stem(domains: &DomainSet) -> String {
        domains
            .iter()
            .map(|d| d.replace('*', "wildcard").replace(':', "_"))
            .collect::<Vec<_>>()
            .join("+")
    }

    fn cached_leaf(&self, stem: &str) -> Option<CertificatePair> {
        let cert = fs::read(self.certs_dir.join(format!("{}.crt", stem))).ok()?;
        let key = fs::read(self.certs_dir.join(format!("{}.key", stem))).ok()?;
        if is_blank(&cert) || is_blank(&key) {
            return None;
        }
        Some(CertificatePair { key, cert })
    }
}

impl CertificateSource for LocalCertificateAuthority {
    fn certificate_for(&self, domains: &DomainSet) -> Result<CertificatePair, CertificateError> {
        // Validate before touching the store
        let params = Self::leaf_params(domains)?;
        let authority = self.load_or_create_ca()?;
        let stem = Self::file_stem(domains);

        if let Some(mut pair) = self.cached_leaf(&stem) {
            debug!("Reusing certificate for {:?}", domains.as_slice());
            pair.cert.extend_from_slice(authority.pem.as_bytes());
            return Ok(pair);
        }

        let leaf = Certificate::from_params(params)?;
        let leaf_pem = leaf.serialize_pem_with_signer(&authority.signer)?;
        let key_pem = leaf.serialize_private_key_pem();

        write(&self.certs_dir.join(format!("{}.crt", stem)), &leaf_pem)?;
        write_private(&self.certs_dir.join(format!("{}.key", stem)), &key_pem)?;
        info!("Generated certificate for: {}", domains.as_slice().join(", "));

        let mut cert = leaf_pem.into_bytes();
        cert.extend_from_slice(authority.pem.as_bytes());
        Ok(CertificatePair {
            key: key_pem.into_bytes(),
            cert,
        })
    }
}

fn read(path: &Path) -> Result<String, CertificateError> {
    fs::read_to_string(path).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write(path: &Path, contents: &str) -> Result<(), CertificateError> {
    fs::write(path, contents).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Private keys are readable by the owner only.
fn write_private(path: &Path, contents: &str) -> Result<(), CertificateError> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options
        .open(path)
        .and_then(|mut file| file.write_all(contents.as_bytes()))
        .map_err(|source| CertificateError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn create_dir(path: &Path) -> Result<(), CertificateError> {
    fs::create_dir_all(path).map_err(|source| CertificateError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::tempdir;

    struct FailingSource;

    impl CertificateSource for FailingSource {
        fn certificate_for(&self, domains: &DomainSet) -> Result<CertificatePair, CertificateError> {
            Err(CertificateError::InvalidDomain(domains.primary().to_string()))
        }
    }

    struct FixedSource {
        pair: CertificatePair,
        calls: Cell<usize>,
    }

    impl FixedSource {
        fn new(key: &str, cert: &str) -> Self {
            Self {
                pair: CertificatePair {
                    key: key.as_bytes().to_vec(),
                    cert: cert.as_bytes().to_vec(),
                },
                calls: Cell::new(0),
            }
        }
    }

    impl CertificateSource for FixedSource {
        fn certificate_for(&self, _domains: &DomainSet) -> Result<CertificatePair, CertificateError> {
            self.calls.set(self.calls.get() + 1);
            Ok(self.pair.clone())
        }
    }

    #[test]
    fn test_explicit_ssl_skips_source() {
        let source = FixedSource::new("generated-key", "generated-cert");
        let ssl = SslOptions {
            key: "explicit-key".to_string(),
            cert: "explicit-cert".to_string(),
        };

        let material = provision(Some(&ssl), &DomainSet::default(), &source).unwrap();

        assert_eq!(material.key(), b"explicit-key");
        assert_eq!(material.cert(), b"explicit-cert");
        assert_eq!(source.calls.get(), 0);
    }

    #[test]
    fn test_generation_error_yields_none() {
        let domains = DomainSet::new(["bad.invalid"]);
        assert!(provision(None, &domains, &FailingSource).is_none());
    }

    #[test]
    fn test_empty_key_or_cert_is_failure() {
        assert!(provision(None, &DomainSet::default(), &FixedSource::new("", "cert")).is_none());
        assert!(provision(None, &DomainSet::default(), &FixedSource::new("key", "  \n")).is_none());

        let material = provision(None, &DomainSet::default(), &FixedSource::new("key", "cert"));
        assert!(material.is_some());
    }

    #[test]
    fn test_local_ca_generates_chain() {
        let dir = tempdir().unwrap();
        let ca = LocalCertificateAuthority::new(dir.path().join("certs"));
        let domains = DomainSet::new(["localhost", "127.0.0.1"]);

        let pair = ca.certificate_for(&domains).unwrap();
        let cert = String::from_utf8(pair.cert).unwrap();
        let key = String::from_utf8(pair.key).unwrap();

        assert_eq!(cert.matches("BEGIN CERTIFICATE").count(), 2);
        assert!(key.contains("PRIVATE KEY"));
        assert!(ca.ca_cert_path().exists());
        assert!(dir.path().join("certs/localhost+127.0.0.1.crt").exists());
        assert!(dir.path().join("certs/localhost+127.0.0.1.key").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_private_keys_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let ca = LocalCertificateAuthority::new(dir.path());
        ca.certificate_for(&DomainSet::default()).unwrap();

        for name in ["devproxy-ca.key", "localhost.key"] {
            let mode = fs::metadata(dir.path().join(name)).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{}", name);
        }
    }

    #[test]
    fn test_local_ca_reuses_material() {
        let dir = tempdir().unwrap();
        let ca = LocalCertificateAuthority::new(dir.path());
        let domains = DomainSet::default();

        let first = ca.certificate_for(&domains).unwrap();
        let ca_pem = fs::read(ca.ca_cert_path()).unwrap();
        let second = ca.certificate_for(&domains).unwrap();

        assert_eq!(first.cert, second.cert);
        assert_eq!(first.key, second.key);
        assert_eq!(fs::read(ca.ca_cert_path()).unwrap(), ca_pem);
    }

    #[test]
    fn test_local_ca_separate_domain_sets() {
        let dir = tempdir().unwrap();
        let ca = LocalCertificateAuthority::new(dir.path());

        let a = ca.certificate_for(&DomainSet::new(["app.test"])).unwrap();
        let b = ca.certificate_for(&DomainSet::new(["*.app.test"])).unwrap();

        assert_ne!(a.key, b.key);
        assert!(dir.path().join("wildcard.app.test.crt").exists());
    }

    #[test]
    fn test_local_ca_rejects_invalid_domain() {
        let dir = tempdir().unwrap();
        let ca = LocalCertificateAuthority::new(dir.path());

        let err = ca.certificate_for(&DomainSet::new(["bad.invalid"])).unwrap_err();
        assert!(matches!(err, CertificateError::InvalidDomain(d) if d == "bad.invalid"));
        // Nothing written for a rejected request
        assert!(!ca.ca_cert_path().exists());
    }

    #[test]
    fn test_domain_validation() {
        assert!(LocalCertificateAuthority::is_valid_domain("localhost"));
        assert!(LocalCertificateAuthority::is_valid_domain("my-app.local"));
        assert!(LocalCertificateAuthority::is_valid_domain("*.example.com"));
        assert!(!LocalCertificateAuthority::is_valid_domain("*"));
        assert!(!LocalCertificateAuthority::is_valid_domain("a.*.example.com"));
        assert!(!LocalCertificateAuthority::is_valid_domain("has space.com"));
        assert!(!LocalCertificateAuthority::is_valid_domain("trailing."));
        assert!(!LocalCertificateAuthority::is_valid_domain("-dash.com"));
        assert!(!LocalCertificateAuthority::is_valid_domain("x.invalid"));
    }

    #[test]
    fn test_material_debug_redacts_key() {
        let material = CertificateMaterial::from_pem("secret", "cert").unwrap();
        assert!(!format!("{:?}", material).contains("secret"));
    }
}
