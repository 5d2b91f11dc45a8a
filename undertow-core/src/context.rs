//! Process-wide resources built once at startup and handed to the service.

use std::sync::Arc;

use crate::UndertowError;
use crate::config::{ConfigSource, UndertowConfig};
use crate::persistence::{AppDatabase, KvStore, import_legacy, open_with_restore};
use crate::profile::Profile;
use crate::service::{HostBridge, LibraryIndex, NoLibrary, NullHost};

/// Configuration, profile, database handles and collaborators.
#[derive(Clone)]
pub struct Context {
    pub profile: Profile,
    pub config: UndertowConfig,
    pub config_source: Arc<dyn ConfigSource>,
    pub database: AppDatabase,
    pub cache: KvStore,
    pub host: Arc<dyn HostBridge>,
    pub library: Arc<dyn LibraryIndex>,
    /// Recoverable problems met while loading, for the host to show
    pub warnings: Vec<String>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("profile", &self.profile)
            .field("config", &self.config)
            .field("database", &self.database)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Loads configuration, creates the profile tree and opens both stores.
    /// A store that fails to open is restored from its backup once.
    ///
    /// # Errors
    ///
    /// - `UndertowError::Config` - Fatal configuration or profile failure
    /// - `UndertowError::Persistence` - A store could not be opened or restored
    pub async fn open(profile: Profile, config_source: Arc<dyn ConfigSource>) -> Result<Self, UndertowError> {
        profile.ensure()?;

        let mut warnings = Vec::new();
        let config = match config_source.load() {
            Ok(config) => config,
            Err(e) if !e.is_fatal() => {
                tracing::warn!("Configuration rejected, using defaults: {e}");
                warnings.push(format!("Configuration rejected, using defaults: {e}"));
                UndertowConfig::default()
            }
            Err(e) => return Err(e.into()),
        };

        let database = open_with_restore(&profile.app_db(), |path| async move { AppDatabase::open(&path).await }).await?;
        let cache = open_with_restore(&profile.cache_db(), |path| async move { KvStore::open(&path).await }).await?;

        match import_legacy(&database, &profile.library_db()).await {
            Ok(0) => {}
            Ok(imported) => tracing::info!(imported, "Imported legacy library entries"),
            Err(e) => {
                tracing::warn!("Legacy library import failed: {e}");
                warnings.push(format!("Legacy library import failed: {e}"));
            }
        }

        tracing::info!(
            profile = %profile.root().display(),
            schema = database.schema_version().await.unwrap_or_default(),
            "Context ready"
        );

        Ok(Self {
            profile,
            config,
            config_source,
            database,
            cache,
            host: Arc::new(NullHost),
            library: Arc::new(NoLibrary),
            warnings,
        })
    }

    pub fn with_host(mut self, host: Arc<dyn HostBridge>) -> Self {
        self.host = host;
        self
    }

    pub fn with_library(mut self, library: Arc<dyn LibraryIndex>) -> Self {
        self.library = library;
        self
    }
}
