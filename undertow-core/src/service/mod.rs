//! Top-level supervisor.
//!
//! [`Service`] owns the engine, the map of live torrents and every
//! persistence write. It consumes engine events on one task and runs all
//! periodic work (reaper, metadata timeouts, cache purge, backups) from a
//! single maintenance tick.

pub mod host;
pub mod maintenance;
pub mod reaper;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use host::{HostBridge, LibraryIndex, NoLibrary, NotificationLevel, NullHost, RemoteHost};
pub use maintenance::TickReport;
pub use reaper::{ReapAction, ReapCandidate, ReapReason};

use crate::config::{ConfigError, StoragePolicyKind, UndertowConfig};
use crate::context::Context;
use crate::error::ErrorKind;
use crate::persistence::{HistoryRecord, PersistenceError};
use crate::session::{EngineError, EngineEvent, EventReceiver, SessionState, SwarmEngine};
use crate::storage::{PieceStore, StoragePolicy, StoreError};
use crate::streaming::Reader;
use crate::torrent::{
    FileSelector, InfoHash, MediaContext, Metainfo, MetainfoError, Selection, SelectionHint, Torrent,
    TorrentError, TorrentItem, TorrentItemState, TorrentRef, TorrentSettings, TorrentSnapshot, TorrentSource,
    TorrentState, VideoFileSelector, resolve,
};

/// Errors from service operations.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("No torrent {id}")]
    NotFound { id: String },

    #[error("Metadata for {info_hash} not received within {timeout:?}")]
    MetadataTimeout { info_hash: InfoHash, timeout: Duration },

    #[error("Service is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Metainfo(#[from] MetainfoError),

    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::NotFound { .. } => ErrorKind::NotFound,
            ServiceError::MetadataTimeout { .. } => ErrorKind::MetadataTimeout,
            ServiceError::ShuttingDown => ErrorKind::Shutdown,
            ServiceError::Metainfo(e) => e.kind(),
            ServiceError::Torrent(e) => e.kind(),
            ServiceError::Engine(e) => e.kind(),
            ServiceError::Store(e) => e.kind(),
            ServiceError::Persistence(e) => e.kind(),
            ServiceError::Config(e) => e.kind(),
        }
    }
}

/// Session-level diagnostics for `/info`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub version: &'static str,
    pub engine: &'static str,
    pub session: SessionState,
    pub uptime_secs: u64,
    pub torrents: usize,
    pub readers: usize,
    pub storage_policy: StoragePolicyKind,
    pub profile: String,
    pub schema_version: u32,
}

/// The supervisor.
pub struct Service {
    context: Context,
    config: RwLock<UndertowConfig>,
    engine: Arc<dyn SwarmEngine>,
    torrents: Mutex<HashMap<InfoHash, Arc<Torrent>>>,
    selector: RwLock<Arc<dyn FileSelector>>,
    http: reqwest::Client,
    shutdown: CancellationToken,
    started_at: Instant,
    last_backup: Mutex<Instant>,
    /// Removed, unreferenced items and the tick that first saw them
    removed_since: Mutex<HashMap<InfoHash, Instant>>,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("engine", &self.engine.name())
            .field("torrents", &self.torrents.lock().len())
            .finish_non_exhaustive()
    }
}

impl Service {
    /// Builds the service, resumes persisted torrents and starts the event
    /// and maintenance tasks. `events` must be the receiver paired with the
    /// sender `engine` was built with.
    pub async fn start(context: Context, engine: Arc<dyn SwarmEngine>, events: EventReceiver) -> Arc<Self> {
        let config = context.config.clone();
        let selector: Arc<dyn FileSelector> = Arc::new(VideoFileSelector::new(config.selection.clone()));
        let http = reqwest::Client::builder()
            .timeout(config.network.tracker_timeout())
            .build()
            .unwrap_or_default();
        let service = Arc::new(Self {
            context,
            config: RwLock::new(config),
            engine,
            torrents: Mutex::new(HashMap::new()),
            selector: RwLock::new(selector),
            http,
            shutdown: CancellationToken::new(),
            started_at: Instant::now(),
            last_backup: Mutex::new(Instant::now()),
            removed_since: Mutex::new(HashMap::new()),
        });

        for warning in &service.context.warnings {
            service
                .context
                .host
                .push_notification(NotificationLevel::Warning, warning)
                .await;
        }

        tokio::spawn(dispatch_events(Arc::downgrade(&service), events, service.shutdown.clone()));
        tokio::spawn(maintenance::run(Arc::downgrade(&service), service.shutdown.clone()));

        match service.resume_persisted().await {
            Ok(0) => {}
            Ok(resumed) => tracing::info!(resumed, "Resumed persisted torrents"),
            Err(e) => tracing::error!("Resume of persisted torrents failed: {e}"),
        }
        service
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn config(&self) -> UndertowConfig {
        self.config.read().clone()
    }

    pub fn engine(&self) -> &Arc<dyn SwarmEngine> {
        &self.engine
    }

    /// Cancelled when shutdown was requested.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!("Shutdown requested");
            self.shutdown.cancel();
        }
    }

    /// Shared handle on a live torrent.
    pub fn torrent(&self, info_hash: InfoHash) -> Option<Arc<Torrent>> {
        self.torrents.lock().get(&info_hash).cloned()
    }

    fn lookup(&self, id: &str) -> Result<Arc<Torrent>, ServiceError> {
        InfoHash::from_hex(id)
            .ok()
            .and_then(|info_hash| self.torrent(info_hash))
            .ok_or_else(|| ServiceError::NotFound { id: id.to_string() })
    }

    fn torrent_handles(&self) -> Vec<Arc<Torrent>> {
        self.torrents.lock().values().cloned().collect()
    }

    fn ensure_running(&self) -> Result<(), ServiceError> {
        if self.shutdown.is_cancelled() {
            return Err(ServiceError::ShuttingDown);
        }
        Ok(())
    }

    /// Adds a torrent and returns its id, the infohash. Adding a known
    /// infohash returns the live torrent without fetching anything. With
    /// `wait` the call returns once the playback file is selected.
    ///
    /// # Errors
    ///
    /// - `ServiceError::Metainfo` - Reference unparseable or .torrent unreadable
    /// - `ServiceError::MetadataTimeout` - `wait` and metadata never arrived
    /// - `ServiceError::Engine` - Engine refused the torrent
    /// - `ServiceError::ShuttingDown` - Service is stopping
    pub async fn add(&self, reference: TorrentRef, context: MediaContext, wait: bool) -> Result<InfoHash, ServiceError> {
        self.ensure_running()?;
        if let Some(torrent) = reference.known_info_hash().and_then(|ih| self.torrent(ih)) {
            tracing::debug!(info_hash = %torrent.info_hash(), "Torrent already active");
            return self.finish_add(&torrent, wait).await;
        }

        let source = resolve(reference, &self.http).await?;
        let info_hash = source.info_hash();
        let (torrent, created) = {
            let mut torrents = self.torrents.lock();
            match torrents.get(&info_hash) {
                Some(torrent) => (Arc::clone(torrent), false),
                None => {
                    let settings = TorrentSettings::from_config(&self.config.read());
                    let torrent = Torrent::new(
                        info_hash,
                        source.name().map(str::to_string),
                        context.clone(),
                        Arc::clone(&self.engine),
                        settings,
                    );
                    torrents.insert(info_hash, Arc::clone(&torrent));
                    (torrent, true)
                }
            }
        };

        if created {
            self.persist_added(&torrent, &context, source.metainfo().map(Arc::as_ref))
                .await;
            if let Err(e) = self.engine.add_torrent(source).await {
                self.torrents.lock().remove(&info_hash);
                return Err(e.into());
            }
            tracing::info!(info_hash = %info_hash, name = %torrent.name(), "Torrent added");
        }
        self.finish_add(&torrent, wait).await
    }

    async fn finish_add(&self, torrent: &Arc<Torrent>, wait: bool) -> Result<InfoHash, ServiceError> {
        if torrent.state().is_terminal() {
            return Err(TorrentError::Removed {
                info_hash: torrent.info_hash(),
            }
            .into());
        }
        if wait {
            self.wait_for_selection(torrent).await?;
        }
        Ok(torrent.info_hash())
    }

    /// Blocks until `torrent` leaves metadata-pending, failing it on timeout.
    async fn wait_for_selection(&self, torrent: &Arc<Torrent>) -> Result<(), ServiceError> {
        let timeout = self.config.read().service.metadata_timeout();
        let mut states = torrent.subscribe_state();
        let waited = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(ServiceError::ShuttingDown),
            waited = tokio::time::timeout(
                timeout,
                states.wait_for(|state| *state != TorrentState::MetadataPending),
            ) => waited,
        };
        match waited {
            Err(_) => {
                torrent.fail(
                    ErrorKind::MetadataTimeout,
                    format!("no metadata after {}s", timeout.as_secs()),
                );
                Err(ServiceError::MetadataTimeout {
                    info_hash: torrent.info_hash(),
                    timeout,
                })
            }
            Ok(Err(_)) => Err(ServiceError::ShuttingDown),
            Ok(Ok(state)) if *state == TorrentState::Error => {
                drop(state);
                let (kind, detail) = torrent
                    .failure()
                    .unwrap_or((ErrorKind::Internal, "torrent failed".to_string()));
                Err(TorrentError::Failed {
                    info_hash: torrent.info_hash(),
                    kind,
                    detail,
                }
                .into())
            }
            Ok(Ok(_)) => Ok(()),
        }
    }

    /// Starts reaping `id` and tears it down. `delete_files` falls back to
    /// the configured default.
    ///
    /// # Errors
    ///
    /// - `ServiceError::NotFound` - Unknown id
    /// - `ServiceError::Torrent` - Payload could not be removed
    pub async fn remove(&self, id: &str, delete_files: Option<bool>) -> Result<(), ServiceError> {
        let torrent = self.lookup(id)?;
        let delete_files = delete_files.unwrap_or(self.config.read().reaper.delete_files_on_remove);
        self.reap(&torrent, delete_files).await
    }

    /// Full reap of one torrent: reaping, engine removal, storage teardown,
    /// item marked removed, gone.
    pub(crate) async fn reap(&self, torrent: &Arc<Torrent>, delete_files: bool) -> Result<(), ServiceError> {
        let info_hash = torrent.info_hash();
        if !torrent.state().is_terminal() {
            torrent.begin_reaping()?;
        }
        if let Err(e) = self.engine.remove_torrent(info_hash).await {
            tracing::debug!(info_hash = %info_hash, "Engine removal: {e}");
        }
        let teardown = torrent.finish_reaping(delete_files).await;

        if let Err(e) = self
            .context
            .database
            .set_item_state(info_hash, TorrentItemState::Removed)
            .await
        {
            tracing::warn!(info_hash = %info_hash, "Failed to mark item removed: {e}");
        }
        if delete_files {
            remove_if_present(&self.context.profile.torrent_file(info_hash)).await;
        }
        self.torrents.lock().remove(&info_hash);
        tracing::info!(info_hash = %info_hash, delete_files, "Torrent removed");
        teardown.map_err(ServiceError::from)
    }

    /// Opens a reader; a negative `file_index` reads the playback file.
    ///
    /// # Errors
    ///
    /// - `ServiceError::NotFound` - Unknown id
    /// - `ServiceError::Torrent` - Metadata pending, bad index, failed or reaping
    pub async fn attach_reader(
        &self,
        id: &str,
        file_index: i64,
        cancel: CancellationToken,
    ) -> Result<Reader, ServiceError> {
        self.ensure_running()?;
        let torrent = self.lookup(id)?;
        let previous = torrent.selected_file().map(|file| file.index);
        let index = usize::try_from(file_index).ok();
        let reader = torrent.attach_reader(index, cancel)?;
        if index.is_some() && index != previous {
            self.persist_selection(&torrent).await;
        }
        Ok(reader)
    }

    /// # Errors
    ///
    /// - `ServiceError::NotFound` - Unknown id
    /// - `ServiceError::Torrent` - Metadata pending or state forbids pausing
    pub fn pause(&self, id: &str) -> Result<(), ServiceError> {
        self.lookup(id)?.pause()?;
        Ok(())
    }

    /// # Errors
    ///
    /// - `ServiceError::NotFound` - Unknown id
    /// - `ServiceError::Torrent` - Metadata pending or state forbids resuming
    pub fn resume(&self, id: &str) -> Result<(), ServiceError> {
        self.lookup(id)?.resume()?;
        Ok(())
    }

    /// Reloads configuration and applies it to the engine and every live
    /// torrent. Blocked readers are untouched.
    ///
    /// # Errors
    ///
    /// - `ServiceError::Config` - Reloaded configuration is invalid
    /// - `ServiceError::Engine` - Engine rejected the network settings
    pub async fn reconfigure(&self) -> Result<(), ServiceError> {
        self.ensure_running()?;
        let mut config = self.context.config_source.load()?;
        if let Some(size) = self
            .context
            .host
            .fetch_setting("buffer_size")
            .await
            .and_then(|value| value.trim().parse::<u64>().ok())
        {
            config.buffer.host_cache_size = size;
        }
        config.validate()?;

        self.engine.reconfigure(&config.network).await?;
        let settings = TorrentSettings::from_config(&config);
        for torrent in self.torrent_handles() {
            torrent.reconfigure(settings.clone());
        }
        *self.selector.write() = Arc::new(VideoFileSelector::new(config.selection.clone()));
        *self.config.write() = config;
        tracing::info!("Configuration reloaded");
        Ok(())
    }

    /// Snapshot of every live torrent, oldest first.
    pub async fn list(&self) -> Vec<TorrentSnapshot> {
        let mut snapshots = Vec::new();
        for torrent in self.torrent_handles() {
            let stats = self.engine.stats(torrent.info_hash()).await.unwrap_or_default();
            snapshots.push(torrent.snapshot(stats));
        }
        snapshots.sort_by(|a, b| a.added_at.cmp(&b.added_at).then(a.id.cmp(&b.id)));
        snapshots
    }

    pub async fn info(&self) -> ServiceInfo {
        let torrents = self.torrent_handles();
        let storage_policy = self.config.read().storage.policy;
        ServiceInfo {
            version: env!("CARGO_PKG_VERSION"),
            engine: self.engine.name(),
            session: self.engine.state(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            torrents: torrents.len(),
            readers: torrents.iter().map(|torrent| torrent.reader_count()).sum(),
            storage_policy,
            profile: self.context.profile.root().display().to_string(),
            schema_version: self.context.database.schema_version().await.unwrap_or_default(),
        }
    }

    /// Recreates every active item that has no live torrent, from the stored
    /// metainfo blob, the retained .torrent file, or the bare infohash.
    ///
    /// # Errors
    ///
    /// - `ServiceError::Persistence` - Items could not be listed
    pub async fn resume_persisted(&self) -> Result<usize, ServiceError> {
        let items = self
            .context
            .database
            .items_with_state(TorrentItemState::Active)
            .await?;
        let mut resumed = 0;
        for item in items {
            if self.torrent(item.info_hash).is_some() {
                continue;
            }
            let source = self.resume_source(&item).await;
            let torrent = {
                let settings = TorrentSettings::from_config(&self.config.read());
                let torrent = Torrent::new(
                    item.info_hash,
                    source.name().map(str::to_string),
                    item.context.clone(),
                    Arc::clone(&self.engine),
                    settings,
                );
                self.torrents.lock().insert(item.info_hash, Arc::clone(&torrent));
                torrent
            };
            match self.engine.add_torrent(source).await {
                Ok(()) => {
                    tracing::info!(info_hash = %item.info_hash, name = %torrent.name(), "Torrent resumed");
                    resumed += 1;
                }
                Err(e) => {
                    self.torrents.lock().remove(&item.info_hash);
                    tracing::warn!(info_hash = %item.info_hash, "Failed to resume torrent: {e}");
                }
            }
        }
        Ok(resumed)
    }

    async fn resume_source(&self, item: &TorrentItem) -> TorrentSource {
        let history = match self.context.database.history(item.info_hash).await {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(info_hash = %item.info_hash, "History unreadable: {e}");
                None
            }
        };
        let from_blob = history
            .as_ref()
            .and_then(|record| record.metainfo.as_deref())
            .and_then(|blob| Metainfo::from_torrent_bytes(blob).ok())
            .filter(|metainfo| metainfo.info_hash == item.info_hash);
        if let Some(metainfo) = from_blob {
            return TorrentSource::Metainfo(Arc::new(metainfo));
        }
        let path = self.context.profile.torrent_file(item.info_hash);
        if let Ok(bytes) = tokio::fs::read(&path).await {
            match Metainfo::from_torrent_bytes(&bytes) {
                Ok(metainfo) if metainfo.info_hash == item.info_hash => {
                    return TorrentSource::Metainfo(Arc::new(metainfo));
                }
                Ok(_) => tracing::warn!(path = %path.display(), "Retained torrent has a different infohash"),
                Err(e) => tracing::warn!(path = %path.display(), "Retained torrent unreadable: {e}"),
            }
        }
        TorrentSource::Bare {
            info_hash: item.info_hash,
            name: history.map(|record| record.name),
            trackers: Vec::new(),
        }
    }

    /// Stops the engine and closes storage. Items stay active so the next
    /// start resumes them.
    pub async fn shutdown(&self) {
        self.request_shutdown();
        for torrent in self.torrent_handles() {
            if let Some(store) = torrent.store() {
                if let Err(e) = store.close(false).await {
                    tracing::warn!(info_hash = %torrent.info_hash(), "Store close failed: {e}");
                }
            }
        }
        if let Err(e) = self.engine.shutdown().await {
            tracing::warn!("Engine shutdown failed: {e}");
        }
        self.torrents.lock().clear();
        self.context.database.close().await;
        self.context.cache.close().await;
        tracing::info!("Service stopped");
    }

    async fn handle_event(self: &Arc<Self>, event: EngineEvent) {
        let info_hash = event.info_hash();
        let Some(torrent) = self.torrent(info_hash) else {
            tracing::trace!(info_hash = %info_hash, "Event for unknown torrent dropped");
            return;
        };
        match event {
            EngineEvent::MetadataReceived { metainfo, .. } => {
                let service = Arc::clone(self);
                tokio::spawn(async move { service.on_metadata(torrent, metainfo).await });
            }
            EngineEvent::PieceCompleted { piece, .. } => torrent.on_piece_complete(piece),
            EngineEvent::PieceHashFailed { piece, .. } => {
                tracing::warn!(info_hash = %info_hash, piece, "Piece failed hash check");
                if torrent.on_hash_failure(piece) {
                    self.notify(
                        NotificationLevel::Warning,
                        format!("{} is stalled on piece {piece}", torrent.name()),
                    );
                }
            }
            EngineEvent::StorageFailed { message, .. } => {
                if torrent.fail(ErrorKind::StorageFull, message.clone()) {
                    self.notify(
                        NotificationLevel::Error,
                        format!("{}: storage failed: {message}", torrent.name()),
                    );
                }
            }
            EngineEvent::TorrentFinished { .. } => {
                tracing::info!(info_hash = %info_hash, "All pieces verified");
            }
            EngineEvent::TrackerError { url, message, .. } => {
                tracing::debug!(info_hash = %info_hash, url, "Tracker error: {message}");
            }
        }
    }

    fn notify(&self, level: NotificationLevel, message: String) {
        let host = Arc::clone(&self.context.host);
        tokio::spawn(async move { host.push_notification(level, &message).await });
    }

    async fn on_metadata(&self, torrent: Arc<Torrent>, metainfo: Arc<Metainfo>) {
        if torrent.state() != TorrentState::MetadataPending {
            return;
        }
        let info_hash = torrent.info_hash();
        let index = self.choose_file(&torrent, &metainfo).await;
        let store = match self.open_store(Arc::clone(&metainfo)).await {
            Ok(store) => store,
            Err(e) => {
                torrent.fail(e.kind(), e.to_string());
                return;
            }
        };
        if let Err(e) = torrent.activate(Arc::clone(&metainfo), store, index).await {
            tracing::warn!(info_hash = %info_hash, "Activation failed: {e}");
            if !matches!(e, TorrentError::Transition(_)) {
                torrent.fail(e.kind(), e.to_string());
            }
            return;
        }

        let record = HistoryRecord {
            info_hash,
            name: metainfo.name.clone(),
            added_at: torrent.added_at(),
            metainfo: Some(metainfo.to_torrent_bytes()),
        };
        if let Err(e) = self.context.database.save_history(&record).await {
            tracing::warn!(info_hash = %info_hash, "Failed to store metainfo: {e}");
        }
        self.retain_torrent_file(&metainfo).await;
        self.persist_selection(&torrent).await;
    }

    /// Persisted selection first, then the selector, then the host, then
    /// the largest file.
    async fn choose_file(&self, torrent: &Torrent, metainfo: &Metainfo) -> usize {
        let persisted = match self.context.database.item(torrent.info_hash()).await {
            Ok(item) => item.and_then(|item| item.files.into_iter().next()),
            Err(e) => {
                tracing::warn!(info_hash = %torrent.info_hash(), "Item unreadable: {e}");
                None
            }
        };
        if let Some(path) = persisted {
            if let Some(file) = metainfo.files.iter().find(|file| file.display_path() == path) {
                return file.index;
            }
        }

        let context = torrent.context();
        let hint = SelectionHint {
            media_type: context.media_type,
            season: context.season,
            episode: context.episode,
        };
        let selection = {
            let selector = self.selector.read().clone();
            selector.select(&metainfo.files, &hint)
        };
        let largest = || {
            metainfo
                .files
                .iter()
                .max_by_key(|file| file.length)
                .map_or(0, |file| file.index)
        };
        match selection {
            Selection::Chosen(index) => index,
            Selection::Ambiguous(candidates) => {
                let options: Vec<String> = candidates
                    .iter()
                    .filter_map(|index| metainfo.files.get(*index))
                    .map(|file| file.display_path())
                    .collect();
                let picked = self
                    .context
                    .host
                    .prompt_user(&format!("Choose file to play from {}", metainfo.name), &options)
                    .await;
                picked
                    .and_then(|choice| candidates.get(choice).copied())
                    .or_else(|| candidates.first().copied())
                    .unwrap_or_else(largest)
            }
            Selection::NoCandidate => largest(),
        }
    }

    async fn open_store(&self, metainfo: Arc<Metainfo>) -> Result<Arc<PieceStore>, StoreError> {
        let storage = self.config.read().storage.clone();
        match storage.policy {
            StoragePolicyKind::Memory => PieceStore::open(
                &metainfo,
                StoragePolicy::Memory {
                    budget: storage.memory_budget,
                },
            ),
            StoragePolicyKind::File => {
                let profile = &self.context.profile;
                let downloads = match &storage.downloads_dir {
                    Some(dir) => self.context.host.translate_path(&dir.to_string_lossy()).await,
                    None => profile.downloads_dir(),
                };
                let policy = StoragePolicy::File {
                    root: profile.payload_dir(&downloads, metainfo.info_hash),
                    resume: profile.resume_file(&downloads, metainfo.info_hash),
                };
                tokio::task::spawn_blocking(move || PieceStore::open(&metainfo, policy))
                    .await
                    .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
            }
        }
    }

    async fn persist_added(&self, torrent: &Torrent, context: &MediaContext, metainfo: Option<&Metainfo>) {
        let database = &self.context.database;
        let info_hash = torrent.info_hash();
        let item = match database.item(info_hash).await {
            Ok(Some(mut item)) => {
                item.state = TorrentItemState::Active;
                if context.media_id != 0 {
                    item.media_id = context.media_id;
                    item.media_type = context.media_type;
                    item.context = context.clone();
                }
                item
            }
            Ok(None) => TorrentItem::new(info_hash, context.clone()),
            Err(e) => {
                tracing::warn!(info_hash = %info_hash, "Item unreadable: {e}");
                TorrentItem::new(info_hash, context.clone())
            }
        };
        if let Err(e) = database.save_item(&item).await {
            tracing::warn!(info_hash = %info_hash, "Failed to persist item: {e}");
        }
        let record = HistoryRecord {
            info_hash,
            name: torrent.name(),
            added_at: torrent.added_at(),
            metainfo: metainfo.map(Metainfo::to_torrent_bytes),
        };
        if let Err(e) = database.save_history(&record).await {
            tracing::warn!(info_hash = %info_hash, "Failed to persist history: {e}");
        }
        if let Some(metainfo) = metainfo {
            self.retain_torrent_file(metainfo).await;
        }
    }

    async fn persist_selection(&self, torrent: &Torrent) {
        let Some(file) = torrent.selected_file() else {
            return;
        };
        let info_hash = torrent.info_hash();
        let database = &self.context.database;
        let mut item = match database.item(info_hash).await {
            Ok(Some(item)) => item,
            Ok(None) => TorrentItem::new(info_hash, torrent.context()),
            Err(e) => {
                tracing::warn!(info_hash = %info_hash, "Item unreadable: {e}");
                return;
            }
        };
        item.files = vec![file.display_path()];
        if let Err(e) = database.save_item(&item).await {
            tracing::warn!(info_hash = %info_hash, "Failed to persist selection: {e}");
        }
    }

    async fn retain_torrent_file(&self, metainfo: &Metainfo) {
        let path = self.context.profile.torrent_file(metainfo.info_hash);
        if let Err(e) = tokio::fs::write(&path, metainfo.to_torrent_bytes()).await {
            tracing::warn!(path = %path.display(), "Failed to retain torrent file: {e}");
        }
    }
}

async fn remove_if_present(path: &std::path::Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "Failed to remove file: {e}"),
    }
}

/// Feeds engine events to the service until shutdown or until the engine
/// drops its sender.
async fn dispatch_events(
    service: std::sync::Weak<Service>,
    mut events: EventReceiver,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            break;
        };
        let Some(service) = service.upgrade() else {
            break;
        };
        service.handle_event(event).await;
    }
    tracing::debug!("Event dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UndertowConfig;
    use crate::profile::Profile;
    use crate::session::{SimulatedEngine, SimulationProfile, event_channel};

    const PIECE: u32 = 64 * 1024;
    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    async fn service_with(
        dir: &std::path::Path,
        config: UndertowConfig,
        profile: SimulationProfile,
    ) -> (Arc<Service>, Arc<SimulatedEngine>) {
        let context = Context::open(Profile::new(dir), Arc::new(config)).await.unwrap();
        let (events_tx, events_rx) = event_channel();
        let engine = SimulatedEngine::new(profile, events_tx);
        let service = Service::start(context, engine.clone(), events_rx).await;
        (service, engine)
    }

    fn simulation() -> SimulationProfile {
        SimulationProfile::for_testing().with_files(
            "Movie",
            PIECE,
            &[("movie.mkv", u64::from(PIECE) * 8), ("movie.nfo", 100)],
        )
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (service, engine) = service_with(dir.path(), UndertowConfig::for_testing(), simulation()).await;

        let reference = TorrentRef::parse(HASH).unwrap();
        let first = service
            .add(reference.clone(), MediaContext::default(), true)
            .await
            .unwrap();
        let second = service.add(reference, MediaContext::default(), false).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.to_string(), HASH);
        assert!(engine.contains(first));
        assert_eq!(service.list().await.len(), 1);

        let item = service.context().database.item(first).await.unwrap().unwrap();
        assert!(item.is_active());
        assert_eq!(item.files, vec!["movie.mkv".to_string()]);
        assert!(service.context().profile.torrent_file(first).exists());
    }

    #[tokio::test]
    async fn test_invalid_reference_kind() {
        let err = TorrentRef::parse("not a torrent").map_err(ServiceError::from).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRef);
    }

    #[tokio::test]
    async fn test_wait_times_out_without_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = UndertowConfig::for_testing();
        config.service.metadata_timeout_secs = 1;
        let profile = SimulationProfile {
            withhold_metadata: true,
            ..simulation()
        };
        let (service, _engine) = service_with(dir.path(), config, profile).await;

        let err = service
            .add(TorrentRef::parse(HASH).unwrap(), MediaContext::default(), true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MetadataTimeout);
        let torrent = service.torrent(InfoHash::from_hex(HASH).unwrap()).unwrap();
        assert_eq!(torrent.state(), TorrentState::Error);
    }

    #[tokio::test]
    async fn test_remove_marks_item_removed() {
        let dir = tempfile::tempdir().unwrap();
        let (service, engine) = service_with(dir.path(), UndertowConfig::for_testing(), simulation()).await;
        let ih = service
            .add(TorrentRef::parse(HASH).unwrap(), MediaContext::default(), true)
            .await
            .unwrap();

        service.remove(HASH, Some(true)).await.unwrap();
        assert!(service.torrent(ih).is_none());
        assert!(!engine.contains(ih));
        let item = service.context().database.item(ih).await.unwrap().unwrap();
        assert_eq!(item.state, TorrentItemState::Removed);
        assert!(matches!(
            service.remove(HASH, None).await,
            Err(ServiceError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reconfigure_reaches_engine() {
        let dir = tempfile::tempdir().unwrap();
        let (service, engine) = service_with(dir.path(), UndertowConfig::for_testing(), simulation()).await;
        service.reconfigure().await.unwrap();
        assert_eq!(engine.reconfigure_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_work() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _engine) = service_with(dir.path(), UndertowConfig::for_testing(), simulation()).await;
        service.shutdown().await;
        let err = service
            .add(TorrentRef::parse(HASH).unwrap(), MediaContext::default(), false)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shutdown);
    }
}
