//! Protocol limits and per-connection transport configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::auth::{relay_auth_token, AUTH_TOKEN_HEADER};
use crate::error::{Result, TransportError};
use crate::types::DEVICE_ID_HEADER;

/// Default ceiling for one serialized message (10 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 10 * 1024 * 1024;

/// Default size of one chunk of an oversized message.
pub const DEFAULT_CHUNK_SIZE: usize = 51_200;

/// Default age after which an incomplete chunked transfer is dropped.
pub const DEFAULT_CHUNK_STALE_SECS: u64 = 60;

/// Default bound on connect and send.
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

/// A simple frame's length must stay below this so its first byte is
/// always zero and never reads as the chunk flag.
pub const LENGTH_PREFIX_CEILING: usize = 1 << 24;

/// Size limits shared by the codec, the scanner and the assembler.
///
/// Fields are private so every instance has passed [`validate`](Self::validate):
/// build with [`new`](Self::new), [`from_json`](Self::from_json) or
/// deserialization, all of which reject a ceiling at or above 2^24.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "LimitsFile", into = "LimitsFile")]
pub struct ProtocolLimits {
    max_payload_size: usize,
    chunk_size: usize,
    chunk_stale_secs: u64,
}

/// Serialized form of [`ProtocolLimits`], validated on conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LimitsFile {
    max_payload_size: usize,
    chunk_size: usize,
    chunk_stale_secs: u64,
}

impl Default for LimitsFile {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_stale_secs: DEFAULT_CHUNK_STALE_SECS,
        }
    }
}

impl TryFrom<LimitsFile> for ProtocolLimits {
    type Error = TransportError;

    fn try_from(file: LimitsFile) -> Result<Self> {
        let limits = Self {
            max_payload_size: file.max_payload_size,
            chunk_size: file.chunk_size,
            chunk_stale_secs: file.chunk_stale_secs,
        };
        limits.validate()?;
        Ok(limits)
    }
}

impl From<ProtocolLimits> for LimitsFile {
    fn from(limits: ProtocolLimits) -> Self {
        Self {
            max_payload_size: limits.max_payload_size,
            chunk_size: limits.chunk_size,
            chunk_stale_secs: limits.chunk_stale_secs,
        }
    }
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_stale_secs: DEFAULT_CHUNK_STALE_SECS,
        }
    }
}

impl ProtocolLimits {
    /// Build validated limits.
    pub fn new(max_payload_size: usize, chunk_size: usize) -> Result<Self> {
        let limits = Self {
            max_payload_size,
            chunk_size,
            ..Self::default()
        };
        limits.validate()?;
        Ok(limits)
    }

    /// Same limits with a different staleness window.
    pub fn with_chunk_stale_secs(self, chunk_stale_secs: u64) -> Result<Self> {
        let limits = Self {
            chunk_stale_secs,
            ..self
        };
        limits.validate()?;
        Ok(limits)
    }

    /// Parse limits from JSON, filling missing fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let file: LimitsFile = serde_json::from_str(json)?;
        Self::try_from(file)
    }

    fn validate(&self) -> Result<()> {
        if self.max_payload_size == 0 || self.max_payload_size >= LENGTH_PREFIX_CEILING {
            return Err(TransportError::InvalidConfig(format!(
                "max_payload_size must be in 1..{}, got {}",
                LENGTH_PREFIX_CEILING, self.max_payload_size
            )));
        }
        if self.chunk_size == 0 || self.chunk_size > self.max_payload_size {
            return Err(TransportError::InvalidConfig(format!(
                "chunk_size must be in 1..={}, got {}",
                self.max_payload_size, self.chunk_size
            )));
        }
        if self.chunk_stale_secs == 0 {
            return Err(TransportError::InvalidConfig(
                "chunk_stale_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Largest serialized message, always below 2^24.
    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_stale_after(&self) -> Duration {
        Duration::from_secs(self.chunk_stale_secs)
    }
}

/// Where and how a transport connects. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfiguration {
    endpoint: String,
    pinned_fingerprint: Option<String>,
    headers: HashMap<String, String>,
    idle_timeout: Duration,
}

/// On-disk representation of [`TransportConfiguration`].
#[derive(Debug, Deserialize)]
struct ConfigurationFile {
    endpoint: String,
    #[serde(default)]
    pinned_fingerprint: Option<String>,
    #[serde(default)]
    headers: HashMap<String, String>,
    #[serde(default = "default_idle_timeout_secs")]
    idle_timeout_secs: u64,
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

impl TransportConfiguration {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            pinned_fingerprint: None,
            headers: HashMap::new(),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
        }
    }

    /// Configuration for the cloud relay.
    ///
    /// Always carries the device id header. The auth token header is only
    /// attached when a secret is supplied; without one the relay is used
    /// unauthenticated.
    pub fn for_relay(endpoint: impl Into<String>, device_id: &str, secret: Option<&str>) -> Self {
        let mut config = Self::new(endpoint).with_header(DEVICE_ID_HEADER, device_id);
        if let Some(token) = secret.and_then(|s| relay_auth_token(s, device_id)) {
            config = config.with_header(AUTH_TOKEN_HEADER, token);
        }
        config
    }

    /// Configuration for dialing a LAN peer.
    pub fn for_lan_peer(endpoint: impl Into<String>, device_id: &str) -> Self {
        Self::new(endpoint).with_header(DEVICE_ID_HEADER, device_id)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let file: ConfigurationFile = serde_json::from_str(json)?;
        if file.endpoint.trim().is_empty() {
            return Err(TransportError::InvalidConfig("endpoint is empty".to_string()));
        }
        if file.idle_timeout_secs == 0 {
            return Err(TransportError::InvalidConfig(
                "idle_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            endpoint: file.endpoint,
            pinned_fingerprint: file.pinned_fingerprint,
            headers: file.headers,
            idle_timeout: Duration::from_secs(file.idle_timeout_secs),
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_pinned_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.pinned_fingerprint = Some(fingerprint.into());
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn pinned_fingerprint(&self) -> Option<&str> {
        self.pinned_fingerprint.as_deref()
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }
}
