//! Services over a [`Store`]: the database registry, folders, sharing and
//! notifications, bundled by [`Folio`].

mod folders;
mod notifications;
mod registry;
mod sharing;
mod tokens;

pub use folders::FolderService;
pub use notifications::NotificationManager;
pub use registry::DatabaseRegistry;
pub use sharing::{InvitationOptions, SharingService};
pub use tokens::{Redemption, TokenOptions};

use std::fs;
use std::sync::Arc;

use tracing::info;

use crate::batch::BatchProcessor;
use crate::cache::{EmbeddingCache, EmbeddingProvider};
use crate::config::FolioConfig;
use crate::error::Result;
use crate::store::{SqliteStore, Store};

/// Owns the store and every service built on it.
#[derive(Clone)]
pub struct Folio {
    config: FolioConfig,
    store: Arc<dyn Store>,
    registry: DatabaseRegistry,
    folders: FolderService,
    sharing: SharingService,
    notifications: NotificationManager,
}

impl Folio {
    /// Opens (creating if needed) the SQLite store under `config.data_dir`.
    pub fn open(config: FolioConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;
        let store = SqliteStore::new(config.db_path())?;
        info!("Opened store at {}", config.db_path().display());
        Self::with_store(Arc::new(store), config)
    }

    pub fn in_memory(config: FolioConfig) -> Result<Self> {
        config.validate()?;
        Self::with_store(Arc::new(SqliteStore::in_memory()?), config)
    }

    pub fn with_store(store: Arc<dyn Store>, config: FolioConfig) -> Result<Self> {
        store.initialize()?;

        let registry = DatabaseRegistry::new(store.clone());
        let folders = FolderService::new(store.clone(), registry.clone());
        let sharing = SharingService::new(store.clone(), registry.clone(), config.sharing.clone());
        let notifications = NotificationManager::new(store.clone());

        Ok(Self {
            config,
            store,
            registry,
            folders,
            sharing,
            notifications,
        })
    }

    pub fn config(&self) -> &FolioConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &DatabaseRegistry {
        &self.registry
    }

    pub fn folders(&self) -> &FolderService {
        &self.folders
    }

    pub fn sharing(&self) -> &SharingService {
        &self.sharing
    }

    pub fn notifications(&self) -> &NotificationManager {
        &self.notifications
    }

    /// Wraps `provider` in a cache sized by the `[cache]` config section.
    pub fn embedding_cache<P: EmbeddingProvider>(&self, provider: P) -> EmbeddingCache<P> {
        EmbeddingCache::new(provider, self.config.cache.options())
    }

    /// A processor using the `[batch]` config section.
    pub fn batch_processor(&self) -> BatchProcessor {
        BatchProcessor::new(self.config.batch.options())
    }

    /// Periodic housekeeping. Returns the number of tokens deactivated.
    pub fn run_maintenance(&self) -> Result<usize> {
        self.sharing.deactivate_expired()
    }
}
