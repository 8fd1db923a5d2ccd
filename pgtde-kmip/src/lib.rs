//! KMIP key provider for `pgtde`.
//!
//! Keys are AES symmetric key objects identified by their `Name` attribute.
//! Every call opens a mutually authenticated TLS connection to the server,
//! runs its Locate/Get or Locate/Register exchange and closes it again.
//!
//! # Example
//!
//! ```rust,no_run
//! use pgtde::key_provider::KeyringProvider;
//! use pgtde::options::KmipOptions;
//! use pgtde_kmip::KmipKeyring;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let keyring = KmipKeyring::new(&KmipOptions {
//!     host: "kmip.internal".to_string(),
//!     port: "5696".to_string(),
//!     ca_path: "/etc/pki/kmip/ca.pem".to_string(),
//!     cert_path: "/etc/pki/kmip/client.pem".to_string(),
//!     key_path: Some("/etc/pki/kmip/client.key".to_string()),
//! })?;
//! let key = keyring.get_key("server-key")?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod session;
pub mod ttlv;

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use native_tls::{Certificate, Identity, TlsConnector, TlsStream};
use pgtde::error::KeyProviderError;
use pgtde::key_provider::{KeyInfo, KeyringProvider, MAX_KEY_DATA_SIZE};
use pgtde::options::KmipOptions;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

pub use session::KmipSession;
pub use ttlv::TtlvError;

const IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors specific to KMIP operations.
#[derive(Debug, Error)]
pub enum KmipError {
    /// Provider options are unusable
    #[error("invalid KMIP configuration: {0}")]
    Config(String),

    /// A certificate or key file could not be read
    #[error("could not read \"{path}\": {source}")]
    File {
        /// File path
        path: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// TLS setup failed
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// TLS handshake with the server failed
    #[error("TLS handshake with KMIP server failed: {0}")]
    Handshake(String),

    /// Socket error
    #[error("KMIP connection error: {0}")]
    Io(#[from] io::Error),

    /// Undecodable message
    #[error("malformed KMIP message: {0}")]
    Ttlv(#[from] TtlvError),

    /// Well-formed message with unexpected content
    #[error("unexpected KMIP response: {0}")]
    Protocol(String),

    /// The server reported a failure
    #[error("KMIP operation failed with status {status}: {message}")]
    Operation {
        /// Result status
        status: u32,
        /// Result reason, if given
        reason: Option<u32>,
        /// Result message, if given
        message: String,
    },

    /// No key under that name
    #[error("key \"{0}\" not found on KMIP server")]
    NotFound(String),

    /// A key with that name already exists
    #[error("key \"{0}\" already exists on KMIP server")]
    AlreadyExists(String),

    /// More than one key carries the name
    #[error("{count} keys named \"{name}\" on KMIP server")]
    Ambiguous {
        /// Key name
        name: String,
        /// Number of matches
        count: usize,
    },

    /// Key material has an unusable length
    #[error("key of {0} bytes is not supported")]
    InvalidKeySize(usize),
}

impl From<KmipError> for KeyProviderError {
    fn from(err: KmipError) -> Self {
        match err {
            KmipError::NotFound(name) => Self::KeyNotFound(name),
            KmipError::AlreadyExists(name) => Self::Duplicate(name),
            KmipError::InvalidKeySize(actual) => {
                Self::InvalidKeySize { actual, max: MAX_KEY_DATA_SIZE }
            }
            KmipError::Config(_) | KmipError::File { .. } | KmipError::Tls(_) => {
                Self::InvalidConfig(err.to_string())
            }
            KmipError::Handshake(_)
            | KmipError::Io(_)
            | KmipError::Ttlv(_)
            | KmipError::Protocol(_)
            | KmipError::Operation { .. }
            | KmipError::Ambiguous { .. } => Self::Backend(err.to_string()),
        }
    }
}

/// Looks up the key named `name` over an open session.
///
/// # Errors
///
/// Returns `KmipError::NotFound` when no key matches, `KmipError::Ambiguous`
/// when several do and `KmipError::InvalidKeySize` for oversized material.
pub fn fetch_key<S: Read + Write>(
    session: &mut KmipSession<S>,
    name: &str,
) -> Result<KeyInfo, KmipError> {
    let ids = session.locate(name)?;
    let uid = match ids.as_slice() {
        [] => return Err(KmipError::NotFound(name.to_string())),
        [uid] => uid,
        _ => return Err(KmipError::Ambiguous { name: name.to_string(), count: ids.len() }),
    };

    let material = session.get(uid)?;
    if material.is_empty() || material.len() > MAX_KEY_DATA_SIZE {
        return Err(KmipError::InvalidKeySize(material.len()));
    }
    debug!(name, uid = uid.as_str(), "fetched key from KMIP server");
    KeyInfo::new(name, material.to_vec()).map_err(|e| KmipError::Protocol(e.to_string()))
}

/// Registers `key` over an open session unless its name is taken.
///
/// # Errors
///
/// Returns `KmipError::AlreadyExists` if a key with the same name exists.
pub fn register_key<S: Read + Write>(
    session: &mut KmipSession<S>,
    key: &KeyInfo,
) -> Result<String, KmipError> {
    if !session.locate(key.name())?.is_empty() {
        return Err(KmipError::AlreadyExists(key.name().to_string()));
    }
    let uid = session.register(key.name(), key.data())?;
    debug!(name = key.name(), uid = uid.as_str(), "registered key on KMIP server");
    Ok(uid)
}

/// Key provider backed by a KMIP server.
pub struct KmipKeyring {
    host: String,
    port: u16,
    connector: TlsConnector,
}

impl std::fmt::Debug for KmipKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KmipKeyring")
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

impl KmipKeyring {
    /// Creates a provider from parsed provider options.
    ///
    /// The client identity is the certificate chain in `cert_path` with the
    /// PKCS#8 private key from `key_path`, or from `cert_path` when no key
    /// path is set. The server is verified against `ca_path`.
    ///
    /// # Errors
    ///
    /// Returns `KmipError::Config` for a bad host or port or a PEM file
    /// missing the expected blocks, `KmipError::File` if a PEM file cannot
    /// be read and `KmipError::Tls` if its content is unusable.
    pub fn new(options: &KmipOptions) -> Result<Self, KmipError> {
        if options.host.is_empty() {
            return Err(KmipError::Config("host is required".to_string()));
        }
        let port = options.port_number().map_err(|e| KmipError::Config(e.to_string()))?;

        let ca = read_pem(&options.ca_path)?;
        let identity = client_identity(options)?;

        let connector = TlsConnector::builder()
            .identity(identity)
            .add_root_certificate(Certificate::from_pem(&ca)?)
            .build()?;

        Ok(Self { host: options.host.clone(), port, connector })
    }

    fn connect(&self) -> Result<KmipSession<TlsStream<TcpStream>>, KmipError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port))?;
        tcp.set_read_timeout(Some(IO_TIMEOUT))?;
        tcp.set_write_timeout(Some(IO_TIMEOUT))?;
        let tls = self
            .connector
            .connect(&self.host, tcp)
            .map_err(|e| KmipError::Handshake(e.to_string()))?;
        debug!(host = self.host.as_str(), port = self.port, "connected to KMIP server");
        Ok(KmipSession::new(tls))
    }
}

fn read_pem(path: &str) -> Result<Vec<u8>, KmipError> {
    std::fs::read(path).map_err(|source| KmipError::File { path: path.to_string(), source })
}

fn parse_pem(path: &str) -> Result<Vec<pem::Pem>, KmipError> {
    let contents = Zeroizing::new(read_pem(path)?);
    pem::parse_many(contents.as_slice())
        .map_err(|e| KmipError::Config(format!("malformed PEM in \"{path}\": {e}")))
}

/// Splits the certificate and key files into the separate PEM documents
/// the TLS backend expects. A single file may hold both.
fn client_identity(options: &KmipOptions) -> Result<Identity, KmipError> {
    let cert_blocks = parse_pem(&options.cert_path)?;
    let chain: Vec<_> =
        cert_blocks.iter().filter(|block| block.tag() == "CERTIFICATE").cloned().collect();
    if chain.is_empty() {
        return Err(KmipError::Config(format!("no certificate in \"{}\"", options.cert_path)));
    }

    let key_path = options.private_key_path();
    let key_blocks = match &options.key_path {
        Some(path) => parse_pem(path)?,
        None => cert_blocks,
    };
    let key = key_blocks
        .iter()
        .find(|block| block.tag() == "PRIVATE KEY")
        .map(|block| Zeroizing::new(pem::encode(block)))
        .ok_or_else(|| KmipError::Config(format!("no PKCS#8 private key in \"{key_path}\"")))?;

    Ok(Identity::from_pkcs8(pem::encode_many(&chain).as_bytes(), key.as_bytes())?)
}

impl KeyringProvider for KmipKeyring {
    fn get_key(&self, name: &str) -> Result<KeyInfo, KeyProviderError> {
        let mut session = self.connect()?;
        Ok(fetch_key(&mut session, name)?)
    }

    fn store_key(&self, key: &KeyInfo) -> Result<(), KeyProviderError> {
        let mut session = self.connect()?;
        register_key(&mut session, key)?;
        Ok(())
    }
}
