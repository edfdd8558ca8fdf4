//! Certificate Authority (CA) management for the capture proxy
//!
//! The root pair is either handed in as PEM (the usual case: a separate
//! provisioning step creates it and enrolls it in the trust store) or
//! generated once into a storage directory. Leaf certificates are signed per
//! intercepted hostname and cached for the life of the process.
//!

use crate::config::MitmConfig;
use crate::error::{Error, Result};
use moka::future::Cache;
use rand::Rng;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use x509_parser::parse_x509_certificate;

/// Longest leaf validity a manager will sign for, in days
pub const MAX_LEAF_TTL_DAYS: i64 = 3650;

/// Offset for not_before timestamp to handle clock skew (60 seconds)
const NOT_BEFORE_OFFSET: i64 = 60;
/// Leaves never outlive the root minus this margin
const ROOT_SAFETY_MARGIN: Duration = Duration::days(1);
/// Cached leaves this close to expiry are re-issued
const RENEW_MARGIN: Duration = Duration::hours(1);
/// Validity of a generated root (10 years)
const ROOT_TTL_DAYS: i64 = 3650;

const CA_CERT_FILE: &str = "ca_cert.pem";
const CA_KEY_FILE: &str = "ca_key.pem";

/// Root certificate and signing key
pub struct CertificateAuthority {
  /// Root CA issuer
  issuer: Issuer<'static, KeyPair>,
  /// Root CA certificate in DER format
  ca_cert_der: CertificateDer<'static>,
  /// Root CA certificate in PEM format
  ca_cert_pem: String,
  /// Root expiry, caps every leaf
  not_after: OffsetDateTime,
  /// Where the root certificate lives on disk, if anywhere
  cert_path: Option<PathBuf>,
}

impl CertificateAuthority {
  /// Build from an externally provisioned PEM certificate and private key
  pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
    let key_pair = KeyPair::from_pem(key_pem)
      .map_err(|e| Error::certificate_issuance(format!("Failed to parse CA key: {}", e)))?;

    let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair).map_err(|e| {
      Error::certificate_issuance(format!("Failed to create issuer from CA cert: {}", e))
    })?;

    // Parse PEM to DER for rustls
    let ca_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate_issuance("No certificate found in PEM"))?
      .map_err(|e| Error::certificate_issuance(format!("Failed to parse PEM: {}", e)))?;

    let (_, parsed) = parse_x509_certificate(ca_cert_der.as_ref())
      .map_err(|e| Error::certificate_issuance(format!("Failed to parse CA cert: {}", e)))?;
    let is_ca = parsed
      .basic_constraints()
      .ok()
      .flatten()
      .is_some_and(|constraints| constraints.value.ca);
    if !is_ca {
      return Err(Error::certificate_issuance(
        "Root certificate is not a CA certificate",
      ));
    }
    let not_after = parsed.validity().not_after.to_datetime();

    Ok(Self {
      issuer,
      ca_cert_der,
      ca_cert_pem: cert_pem.to_string(),
      not_after,
      cert_path: None,
    })
  }

  /// Load the root pair from PEM files
  pub async fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
    let cert_path = cert_path.as_ref();
    let cert_pem = fs::read_to_string(cert_path).await?;
    let key_pem = fs::read_to_string(key_path.as_ref()).await?;
    let mut ca = Self::from_pem(&cert_pem, &key_pem)?;
    ca.cert_path = Some(cert_path.to_path_buf());
    Ok(ca)
  }

  /// Load `ca_cert.pem`/`ca_key.pem` from `storage_path`, generating them on first use
  pub async fn load_or_generate(storage_path: impl AsRef<Path>) -> Result<Self> {
    let storage_path = storage_path.as_ref();
    if !storage_path.exists() {
      fs::create_dir_all(storage_path).await?;
    }

    let cert_path = storage_path.join(CA_CERT_FILE);
    let key_path = storage_path.join(CA_KEY_FILE);
    if cert_path.exists() && key_path.exists() {
      return Self::load(&cert_path, &key_path).await;
    }

    let (cert_pem, key_pem) = Self::generate_pem()?;
    let mut cert_file = fs::File::create(&cert_path).await?;
    cert_file.write_all(cert_pem.as_bytes()).await?;
    cert_file.flush().await?;

    let mut key_file = fs::File::create(&key_path).await?;
    key_file.write_all(key_pem.as_bytes()).await?;
    key_file.flush().await?;
    #[cfg(unix)]
    {
      use std::os::unix::fs::PermissionsExt;
      fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    tracing::info!("Generated new root CA at {}", cert_path.display());

    let mut ca = Self::from_pem(&cert_pem, &key_pem)?;
    ca.cert_path = Some(cert_path);
    Ok(ca)
  }

  /// Generate a fresh self-signed root, returned as (certificate PEM, key PEM)
  pub fn generate_pem() -> Result<(String, String)> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "Slinger Capture Proxy CA");
    dn.push(DnType::OrganizationName, "Emo-Crab");
    dn.push(DnType::CountryName, "CN");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::CrlSign,
      KeyUsagePurpose::DigitalSignature,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = now + Duration::days(ROOT_TTL_DAYS);

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_issuance(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .self_signed(&key_pair)
      .map_err(|e| Error::certificate_issuance(format!("Failed to generate CA: {}", e)))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
  }

  /// Sign a leaf certificate for `hostname`
  pub fn issue_leaf(&self, hostname: &str, ttl: Duration) -> Result<CertificateEntry> {
    let mut params = CertificateParams::default();
    params.serial_number = Some(rand::thread_rng().gen::<u64>().into());

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, hostname);
    params.distinguished_name = dn;

    // IP literals get an iPAddress SAN plus a dNSName fallback; some clients
    // only check one of the two.
    params.subject_alt_names = if let Ok(ip) = hostname.parse::<IpAddr>() {
      let mut sans = vec![SanType::IpAddress(ip)];
      if let Ok(dns_name) = hostname.try_into() {
        sans.push(SanType::DnsName(dns_name));
      }
      sans
    } else {
      vec![SanType::DnsName(hostname.try_into().map_err(|_| {
        Error::certificate_issuance(format!("Invalid domain name: {}", hostname))
      })?)]
    };
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let now = OffsetDateTime::now_utc();
    let not_after = (now + ttl).min(self.not_after - ROOT_SAFETY_MARGIN);
    if not_after <= now {
      return Err(Error::certificate_issuance(
        "Root certificate expires too soon to issue leaves",
      ));
    }
    params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
    params.not_after = not_after;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate_issuance(format!("Failed to generate key pair: {}", e)))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate_issuance(format!("Failed to sign server cert: {}", e)))?;

    let cert_chain = vec![
      CertificateDer::from(cert.der().to_vec()),
      self.ca_cert_der.clone(),
    ];
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate_issuance("Failed to serialize server key"))?;

    let mut server_config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(cert_chain.clone(), key.clone_key())
      .map_err(|e| Error::certificate_issuance(format!("Failed to create TLS config: {}", e)))?;
    server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(CertificateEntry {
      hostname: hostname.to_string(),
      cert_chain,
      key,
      not_after,
      server_config: Arc::new(server_config),
    })
  }

  /// Root certificate in PEM format for client installation
  pub fn ca_cert_pem(&self) -> &str {
    &self.ca_cert_pem
  }

  /// Root certificate file, when loaded from or written to disk
  pub fn ca_cert_path(&self) -> Option<&Path> {
    self.cert_path.as_deref()
  }
}

/// A signed leaf, its key, and the TLS config that serves it
pub struct CertificateEntry {
  hostname: String,
  cert_chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  not_after: OffsetDateTime,
  server_config: Arc<ServerConfig>,
}

impl CertificateEntry {
  /// Hostname the leaf was issued for
  pub fn hostname(&self) -> &str {
    &self.hostname
  }

  /// `[leaf, root]`
  pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
    &self.cert_chain
  }

  /// Leaf private key
  pub fn key(&self) -> &PrivateKeyDer<'static> {
    &self.key
  }

  /// Leaf expiry
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }

  /// rustls server config presenting this leaf
  pub fn server_config(&self) -> Arc<ServerConfig> {
    self.server_config.clone()
  }

  /// Whether the leaf is expired or about to be
  pub fn needs_renewal(&self, now: OffsetDateTime) -> bool {
    now + RENEW_MARGIN >= self.not_after
  }
}

impl fmt::Debug for CertificateEntry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CertificateEntry")
      .field("hostname", &self.hostname)
      .field("chain_len", &self.cert_chain.len())
      .field("not_after", &self.not_after)
      .finish_non_exhaustive()
  }
}

/// Manager for caching issued leaf certificates
pub struct CertificateManager {
  ca: Arc<CertificateAuthority>,
  /// Cache for issued leaves, keyed by lowercase hostname
  cert_cache: Cache<String, Arc<CertificateEntry>>,
  leaf_ttl: Duration,
  issued: Arc<AtomicU64>,
}

impl CertificateManager {
  /// Create a certificate manager around a root
  pub fn new(ca: CertificateAuthority, leaf_ttl: Duration) -> Self {
    let leaf_ttl = leaf_ttl.clamp(Duration::seconds(2), Duration::days(MAX_LEAF_TTL_DAYS));
    // Entries are dropped at half their validity and re-signed on next use
    let cache_ttl = std::time::Duration::from_secs((leaf_ttl.whole_seconds().max(2) / 2) as u64);
    let cert_cache = Cache::builder().time_to_live(cache_ttl).build();

    Self {
      ca: Arc::new(ca),
      cert_cache,
      leaf_ttl,
      issued: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Root from configured PEM paths, else from the storage directory
  pub async fn from_config(config: &MitmConfig) -> Result<Self> {
    let ca = match (&config.ca_cert_path, &config.ca_key_path) {
      (Some(cert), Some(key)) => CertificateAuthority::load(cert, key).await?,
      _ => CertificateAuthority::load_or_generate(&config.ca_storage_path).await?,
    };
    Ok(Self::new(ca, Duration::days(config.leaf_ttl_days)))
  }

  /// Return the cached leaf for `hostname`, signing one on a miss or expiry
  ///
  /// Concurrent callers asking for the same hostname share a single signing.
  pub async fn issue_leaf_certificate(&self, hostname: &str) -> Result<Arc<CertificateEntry>> {
    let key = hostname.trim_end_matches('.').to_ascii_lowercase();
    if key.is_empty() {
      return Err(Error::certificate_issuance("Empty hostname"));
    }

    let mut attempts = 0;
    loop {
      attempts += 1;
      let ca = self.ca.clone();
      let issued = self.issued.clone();
      let ttl = self.leaf_ttl;
      let host = key.clone();
      let entry = self
        .cert_cache
        .try_get_with(key.clone(), async move {
          let entry = tokio::task::spawn_blocking(move || ca.issue_leaf(&host, ttl))
            .await
            .map_err(|e| Error::CertificateIssuance(format!("Signing task failed: {}", e)))??;
          issued.fetch_add(1, Ordering::Relaxed);
          tracing::debug!("Issued leaf certificate for {}", entry.hostname());
          Ok::<_, Error>(Arc::new(entry))
        })
        .await
        .map_err(|e| Error::CertificateIssuance(e.to_string()))?;

      if attempts < 2 && entry.needs_renewal(OffsetDateTime::now_utc()) {
        self.cert_cache.invalidate(&key).await;
        continue;
      }
      return Ok(entry);
    }
  }

  /// Number of leaves signed so far
  pub fn issued_count(&self) -> u64 {
    self.issued.load(Ordering::Relaxed)
  }

  /// Root certificate in PEM format
  pub fn ca_cert_pem(&self) -> &str {
    self.ca.ca_cert_pem()
  }

  /// Root certificate file, if any
  pub fn ca_cert_path(&self) -> Option<PathBuf> {
    self.ca.ca_cert_path().map(Path::to_path_buf)
  }
}
