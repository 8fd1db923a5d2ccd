//! Provider options codec.
//!
//! Each provider type stores its settings as a small JSON document inside
//! the fixed-width provider record. Options are parsed in full before any
//! record is written, so a record on disk is always loadable.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::Error;
use crate::record::{ProviderRecord, MAX_OPTIONS_LEN};
use crate::scope::ProviderId;

const FILE_KEYRING_TYPE: &str = "file";
const VAULTV2_KEYRING_TYPE: &str = "vault-v2";
const KMIP_KEYRING_TYPE: &str = "kmip";

/// Longest accepted KMIP host name.
pub const MAX_HOST_LEN: usize = 255;

/// Kind of key provider. `Unknown` marks a deleted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ProviderType {
    /// Tombstone or unrecognized type.
    Unknown = 0,
    /// Local key file.
    File = 1,
    /// `HashiCorp` Vault KV version 2.
    VaultV2 = 2,
    /// KMIP server.
    Kmip = 3,
}

impl ProviderType {
    /// Decodes the on-disk tag; anything unrecognized is `Unknown`.
    #[must_use]
    pub const fn from_i32(value: i32) -> Self {
        match value {
            1 => Self::File,
            2 => Self::VaultV2,
            3 => Self::Kmip,
            _ => Self::Unknown,
        }
    }

    /// Returns the on-disk tag.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Maps a user-facing type name (`file`, `vault-v2`, `kmip`).
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            FILE_KEYRING_TYPE => Self::File,
            VAULTV2_KEYRING_TYPE => Self::VaultV2,
            KMIP_KEYRING_TYPE => Self::Kmip,
            _ => Self::Unknown,
        }
    }

    /// Returns the user-facing type name, or `None` for `Unknown`.
    #[must_use]
    pub const fn name(self) -> Option<&'static str> {
        match self {
            Self::File => Some(FILE_KEYRING_TYPE),
            Self::VaultV2 => Some(VAULTV2_KEYRING_TYPE),
            Self::Kmip => Some(KMIP_KEYRING_TYPE),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name().unwrap_or("unknown"))
    }
}

/// Options of the local file provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileOptions {
    /// Path of the key file.
    #[serde(default)]
    pub file_name: String,
}

/// Options of the Vault KV v2 provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultV2Options {
    /// Access token sent with every request.
    #[serde(default)]
    pub token: String,
    /// Base URL of the Vault server.
    #[serde(default)]
    pub url: String,
    /// Mount path of the KV v2 secrets engine.
    #[serde(default)]
    pub mount_path: String,
    /// CA bundle used to verify the server, if not the system roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_path: Option<String>,
}

/// Options of the KMIP provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KmipOptions {
    /// KMIP server host name.
    #[serde(default)]
    pub host: String,
    /// KMIP server port, accepted as a JSON string or number.
    #[serde(default, deserialize_with = "string_or_number")]
    pub port: String,
    /// CA bundle used to verify the server.
    #[serde(default)]
    pub ca_path: String,
    /// Client certificate (PEM).
    #[serde(default)]
    pub cert_path: String,
    /// Client private key (PEM); the certificate file is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<String>,
}

impl KmipOptions {
    /// Returns the file holding the client private key.
    #[must_use]
    pub fn private_key_path(&self) -> &str {
        self.key_path.as_deref().unwrap_or(&self.cert_path)
    }

    /// Returns the validated TCP port.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidOptions` if the port is not a number in `1..=65535`.
    pub fn port_number(&self) -> Result<u16, Error> {
        match self.port.parse::<u16>() {
            Ok(port) if port != 0 => Ok(port),
            _ => Err(Error::InvalidOptions(format!("invalid KMIP port \"{}\"", self.port))),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Text(String),
        Number(u64),
    }

    Ok(match Port::deserialize(deserializer)? {
        Port::Text(text) => text,
        Port::Number(number) => number.to_string(),
    })
}

/// Typed provider options, one variant per provider type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderOptions {
    /// Local key file.
    File(FileOptions),
    /// Vault KV v2.
    VaultV2(VaultV2Options),
    /// KMIP server.
    Kmip(KmipOptions),
}

impl ProviderOptions {
    /// Parses and validates an options blob for `provider_type`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidOptions` if the type is `Unknown`, the blob is
    /// too large or not well-formed JSON, or a required field is missing or
    /// empty.
    pub fn parse(provider_type: ProviderType, blob: &str) -> Result<Self, Error> {
        if blob.len() > MAX_OPTIONS_LEN {
            return Err(Error::InvalidOptions(format!(
                "too large provider options, maximum size is {MAX_OPTIONS_LEN} bytes"
            )));
        }

        let options = match provider_type {
            ProviderType::File => Self::File(from_json(blob)?),
            ProviderType::VaultV2 => Self::VaultV2(from_json(blob)?),
            ProviderType::Kmip => Self::Kmip(from_json(blob)?),
            ProviderType::Unknown => {
                return Err(Error::InvalidOptions("invalid provider type".to_string()))
            }
        };
        options.validate()?;
        Ok(options)
    }

    /// Returns the provider type of these options.
    #[must_use]
    pub const fn provider_type(&self) -> ProviderType {
        match self {
            Self::File(_) => ProviderType::File,
            Self::VaultV2(_) => ProviderType::VaultV2,
            Self::Kmip(_) => ProviderType::Kmip,
        }
    }

    /// Serializes the options to JSON, bounded by the record field size.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidOptions` if the JSON does not fit the record.
    pub fn to_json(&self) -> Result<String, Error> {
        let json = match self {
            Self::File(opts) => serde_json::to_string(opts),
            Self::VaultV2(opts) => serde_json::to_string(opts),
            Self::Kmip(opts) => serde_json::to_string(opts),
        }
        .map_err(|e| Error::InvalidOptions(e.to_string()))?;

        if json.len() > MAX_OPTIONS_LEN {
            return Err(Error::InvalidOptions(format!(
                "too large provider options, maximum size is {MAX_OPTIONS_LEN} bytes"
            )));
        }
        Ok(json)
    }

    fn validate(&self) -> Result<(), Error> {
        let missing: Vec<&str> = match self {
            Self::File(opts) => required(&[("file_name", &opts.file_name)]),
            Self::VaultV2(opts) => required(&[
                ("token", &opts.token),
                ("url", &opts.url),
                ("mount_path", &opts.mount_path),
            ]),
            Self::Kmip(opts) => required(&[
                ("host", &opts.host),
                ("port", &opts.port),
                ("ca_path", &opts.ca_path),
                ("cert_path", &opts.cert_path),
            ]),
        };

        if !missing.is_empty() {
            return Err(Error::InvalidOptions(format!(
                "missing in the keyring options: {}",
                missing.join(", ")
            )));
        }

        if let Self::Kmip(opts) = self {
            if opts.host.len() > MAX_HOST_LEN {
                return Err(Error::InvalidOptions(format!(
                    "KMIP host is too long (maximum is {MAX_HOST_LEN} bytes)"
                )));
            }
            opts.port_number()?;
        }
        Ok(())
    }
}

fn from_json<'a, T: Deserialize<'a>>(blob: &'a str) -> Result<T, Error> {
    serde_json::from_str(blob).map_err(|e| Error::InvalidOptions(format!("malformed JSON: {e}")))
}

fn required<'a>(fields: &[(&'a str, &String)]) -> Vec<&'a str> {
    fields.iter().filter(|(_, value)| value.is_empty()).map(|(name, _)| *name).collect()
}

/// A key provider loaded from its record and ready for dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyring {
    id: ProviderId,
    name: String,
    options: ProviderOptions,
    raw_options: String,
}

impl Keyring {
    /// Parses a stored record into a keyring handle.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidOptions` if the record is a tombstone, has no
    /// valid id, or its options fail to parse.
    pub fn load_from_record(record: &ProviderRecord) -> Result<Self, Error> {
        let id = ProviderId::from_signed(record.provider_id()).ok_or_else(|| {
            Error::InvalidOptions(format!("provider \"{}\" has no id", record.name()))
        })?;
        let options = ProviderOptions::parse(record.provider_type(), record.options())?;

        Ok(Self {
            id,
            name: record.name().to_string(),
            options,
            raw_options: record.options().to_string(),
        })
    }

    /// Returns the provider id.
    #[must_use]
    pub const fn id(&self) -> ProviderId {
        self.id
    }

    /// Returns the provider name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the provider type.
    #[must_use]
    pub const fn provider_type(&self) -> ProviderType {
        self.options.provider_type()
    }

    /// Returns the typed options.
    #[must_use]
    pub const fn options(&self) -> &ProviderOptions {
        &self.options
    }

    /// Returns the options exactly as stored.
    #[must_use]
    pub fn raw_options(&self) -> &str {
        &self.raw_options
    }
}
