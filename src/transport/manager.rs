//! Chooses which transport the application uses, per a persisted preference.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Transport;
use crate::error::{Result, TransportError};
use crate::storage::Storage;

/// Which path the application should sync over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportPreference {
    /// Try the LAN first and fall back to the relay.
    #[default]
    LanFirst,
    /// Always use the cloud relay.
    CloudOnly,
}

impl TransportPreference {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportPreference::LanFirst => "lan-first",
            TransportPreference::CloudOnly => "cloud-only",
        }
    }
}

impl fmt::Display for TransportPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportPreference {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lan-first" => Ok(TransportPreference::LanFirst),
            "cloud-only" => Ok(TransportPreference::CloudOnly),
            other => Err(TransportError::InvalidConfig(format!(
                "unknown transport preference {:?}",
                other
            ))),
        }
    }
}

/// Persistence for the transport preference.
#[async_trait]
pub trait PreferenceStore: Send + Sync {
    async fn load(&self) -> Result<Option<TransportPreference>>;
    async fn save(&self, preference: TransportPreference) -> Result<()>;
}

/// Keeps the preference in memory only.
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    value: RwLock<Option<TransportPreference>>,
}

impl MemoryPreferenceStore {
    pub fn new(initial: Option<TransportPreference>) -> Self {
        Self {
            value: RwLock::new(initial),
        }
    }
}

#[async_trait]
impl PreferenceStore for MemoryPreferenceStore {
    async fn load(&self) -> Result<Option<TransportPreference>> {
        Ok(*self.value.read())
    }

    async fn save(&self, preference: TransportPreference) -> Result<()> {
        *self.value.write() = Some(preference);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredPreference {
    preference: TransportPreference,
}

/// Persists the preference as a small JSON document in [`Storage`].
pub struct StoragePreferenceStore {
    storage: Arc<Storage>,
}

impl StoragePreferenceStore {
    pub const KEY: &'static str = "transport_preference.json";

    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl PreferenceStore for StoragePreferenceStore {
    async fn load(&self) -> Result<Option<TransportPreference>> {
        let Some(bytes) = self.storage.read(Self::KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<StoredPreference>(&bytes) {
            Ok(stored) => Ok(Some(stored.preference)),
            Err(e) => {
                warn!("Ignoring unreadable transport preference: {}", e);
                Ok(None)
            }
        }
    }

    async fn save(&self, preference: TransportPreference) -> Result<()> {
        let bytes = serde_json::to_vec(&StoredPreference { preference })?;
        self.storage.write(Self::KEY, &bytes).await
    }
}

/// Builds (or hands out) the transport for a preference.
pub trait TransportProvider: Send + Sync {
    fn transport_for(&self, preference: TransportPreference) -> Arc<dyn Transport>;
}

impl<F> TransportProvider for F
where
    F: Fn(TransportPreference) -> Arc<dyn Transport> + Send + Sync,
{
    fn transport_for(&self, preference: TransportPreference) -> Arc<dyn Transport> {
        self(preference)
    }
}

/// Holds the current preference and resolves it to a transport.
///
/// The manager does not multiplex traffic; callers connect and send on the
/// transport it returns.
pub struct TransportManager {
    provider: Arc<dyn TransportProvider>,
    store: Arc<dyn PreferenceStore>,
    preference: RwLock<TransportPreference>,
}

impl TransportManager {
    /// Load the stored preference, defaulting to [`TransportPreference::LanFirst`].
    pub async fn new(provider: Arc<dyn TransportProvider>, store: Arc<dyn PreferenceStore>) -> Result<Self> {
        let preference = store.load().await?.unwrap_or_default();
        info!("Transport manager starting with preference {}", preference);
        Ok(Self {
            provider,
            store,
            preference: RwLock::new(preference),
        })
    }

    pub fn current_preference(&self) -> TransportPreference {
        *self.preference.read()
    }

    pub fn load_transport(&self) -> Arc<dyn Transport> {
        let preference = self.current_preference();
        debug!("Loading transport for {}", preference);
        self.provider.transport_for(preference)
    }

    /// Persist a new preference; later [`load_transport`](Self::load_transport)
    /// calls use it.
    pub async fn update(&self, preference: TransportPreference) -> Result<()> {
        self.store.save(preference).await?;
        *self.preference.write() = preference;
        info!("Transport preference set to {}", preference);
        Ok(())
    }
}
