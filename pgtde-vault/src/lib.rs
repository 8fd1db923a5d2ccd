//! `HashiCorp` Vault KV v2 key provider for `pgtde`.
//!
//! Each key is one secret at `<url>/v1/<mount_path>/data/<name>` holding a
//! single base64 field:
//!
//! ```json
//! {"data": {"key": "3q2+7w..."}}
//! ```
//!
//! Requests carry the configured token in `X-Vault-Token`. When `ca_path`
//! is set the server certificate is verified against that bundle, else
//! against the system roots.
//!
//! # Example
//!
//! ```rust,no_run
//! use pgtde::key_provider::KeyringProvider;
//! use pgtde::options::VaultV2Options;
//! use pgtde_vault::VaultV2Keyring;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let keyring = VaultV2Keyring::new(&VaultV2Options {
//!     token: "hvs.example".to_string(),
//!     url: "https://vault.internal:8200".to_string(),
//!     mount_path: "secret".to_string(),
//!     ca_path: Some("/etc/pki/vault-ca.pem".to_string()),
//! })?;
//! let key = keyring.get_key("server-key")?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use pgtde::error::KeyProviderError;
use pgtde::key_provider::{KeyInfo, KeyringProvider, MAX_KEY_DATA_SIZE};
use pgtde::options::VaultV2Options;
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_HEADER: &str = "X-Vault-Token";

/// Errors specific to Vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Provider options are unusable
    #[error("invalid Vault configuration: {0}")]
    Config(String),

    /// Reading the CA bundle failed
    #[error("could not read CA bundle \"{path}\": {source}")]
    CaBundle {
        /// Bundle path
        path: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Transport or TLS failure
    #[error("Vault request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Vault answered with an unexpected status
    #[error("Vault returned HTTP {status}: {message}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Error text from the response body
        message: String,
    },

    /// No secret under that name
    #[error("key \"{0}\" not found in Vault")]
    NotFound(String),

    /// A secret already exists under that name
    #[error("key \"{0}\" already exists in Vault")]
    AlreadyExists(String),

    /// The secret exists but is not a key written by this provider
    #[error("malformed secret \"{name}\": {reason}")]
    Malformed {
        /// Secret name
        name: String,
        /// What was wrong with it
        reason: String,
    },
}

impl From<VaultError> for KeyProviderError {
    fn from(err: VaultError) -> Self {
        match err {
            VaultError::NotFound(name) => Self::KeyNotFound(name),
            VaultError::AlreadyExists(name) => Self::Duplicate(name),
            VaultError::Malformed { .. } => Self::Corrupt(err.to_string()),
            VaultError::Config(_) | VaultError::CaBundle { .. } => {
                Self::InvalidConfig(err.to_string())
            }
            VaultError::Http(_) | VaultError::Status { .. } => Self::Backend(err.to_string()),
        }
    }
}

#[derive(Serialize)]
struct WriteRequest<'a> {
    options: WriteOptions,
    data: SecretData<'a>,
}

#[derive(Serialize)]
struct WriteOptions {
    cas: u32,
}

#[derive(Serialize, Deserialize)]
struct SecretData<'a> {
    key: std::borrow::Cow<'a, str>,
}

#[derive(Deserialize)]
struct ReadResponse {
    data: ReadData,
}

#[derive(Deserialize)]
struct ReadData {
    data: Option<SecretData<'static>>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

/// Key provider backed by a Vault KV v2 secrets engine.
pub struct VaultV2Keyring {
    client: Client,
    base_url: String,
    mount_path: String,
    token: Zeroizing<String>,
}

impl std::fmt::Debug for VaultV2Keyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultV2Keyring")
            .field("base_url", &self.base_url)
            .field("mount_path", &self.mount_path)
            .finish_non_exhaustive()
    }
}

impl VaultV2Keyring {
    /// Creates a provider from parsed provider options.
    ///
    /// # Errors
    ///
    /// Returns `VaultError::Config` for an empty URL or mount path,
    /// `VaultError::CaBundle` if `ca_path` cannot be read and
    /// `VaultError::Http` if the certificate or client is unusable.
    pub fn new(options: &VaultV2Options) -> Result<Self, VaultError> {
        let base_url = options.url.trim_end_matches('/').to_string();
        let mount_path = options.mount_path.trim_matches('/').to_string();
        if base_url.is_empty() || mount_path.is_empty() {
            return Err(VaultError::Config("url and mount_path are required".to_string()));
        }

        let mut builder = Client::builder().timeout(REQUEST_TIMEOUT).user_agent("pgtde-vault/0.1.0");
        if let Some(ca_path) = &options.ca_path {
            let pem = std::fs::read(ca_path)
                .map_err(|source| VaultError::CaBundle { path: ca_path.clone(), source })?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            base_url,
            mount_path,
            token: Zeroizing::new(options.token.clone()),
        })
    }

    /// URL of the secret holding key `name`.
    #[must_use]
    pub fn secret_url(&self, name: &str) -> String {
        format!("{}/v1/{}/data/{}", self.base_url, self.mount_path, urlencoding::encode(name))
    }

    /// Reads the raw key bytes of `name`.
    fn read_secret(&self, name: &str) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let resp = self
            .client
            .get(self.secret_url(name))
            .header(TOKEN_HEADER, self.token.as_str())
            .send()?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(VaultError::NotFound(name.to_string()));
        }
        if !status.is_success() {
            return Err(status_error(status, resp));
        }

        let body = Zeroizing::new(resp.text()?);
        let malformed = |reason: String| VaultError::Malformed { name: name.to_string(), reason };
        let parsed: ReadResponse =
            serde_json::from_str(&body).map_err(|e| malformed(e.to_string()))?;
        // Soft-deleted secrets come back with null data.
        let data = parsed.data.data.ok_or_else(|| VaultError::NotFound(name.to_string()))?;
        let key = STANDARD.decode(data.key.as_bytes()).map_err(|e| malformed(e.to_string()))?;
        Ok(Zeroizing::new(key))
    }
}

fn status_error(status: StatusCode, resp: reqwest::blocking::Response) -> VaultError {
    let message = resp
        .text()
        .ok()
        .and_then(|text| serde_json::from_str::<ErrorResponse>(&text).ok())
        .map(|body| body.errors.join("; "))
        .filter(|msg| !msg.is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown status").to_string());
    VaultError::Status { status: status.as_u16(), message }
}

impl KeyringProvider for VaultV2Keyring {
    fn get_key(&self, name: &str) -> Result<KeyInfo, KeyProviderError> {
        let data = self.read_secret(name)?;
        if data.len() > MAX_KEY_DATA_SIZE {
            return Err(KeyProviderError::InvalidKeySize { actual: data.len(), max: MAX_KEY_DATA_SIZE });
        }
        debug!(name, "fetched key from Vault");
        KeyInfo::new(name, data.to_vec())
    }

    fn store_key(&self, key: &KeyInfo) -> Result<(), KeyProviderError> {
        match self.read_secret(key.name()) {
            Ok(_) => return Err(VaultError::AlreadyExists(key.name().to_string()).into()),
            Err(VaultError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }

        let encoded = Zeroizing::new(STANDARD.encode(key.data()));
        let request = WriteRequest {
            // Create-only: Vault rejects the write if the secret appeared meanwhile.
            options: WriteOptions { cas: 0 },
            data: SecretData { key: encoded.as_str().into() },
        };
        let resp = self
            .client
            .post(self.secret_url(key.name()))
            .header(TOKEN_HEADER, self.token.as_str())
            .json(&request)
            .send()
            .map_err(VaultError::from)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, resp).into());
        }
        debug!(name = key.name(), "stored key in Vault");
        Ok(())
    }
}
