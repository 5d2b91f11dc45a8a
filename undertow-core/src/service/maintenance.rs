//! The single periodic tick driving every maintenance sweep.

use std::sync::{Arc, Weak};
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::reaper::{self, ReapAction, ReapCandidate};
use super::{NotificationLevel, Service};
use crate::config::UndertowConfig;
use crate::error::ErrorKind;
use crate::torrent::{TorrentItemState, TorrentState};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Torrents failed for missing metadata
    pub timed_out: usize,
    /// Torrents reaped and torn down
    pub reaped: usize,
    /// Gone torrents dropped from memory
    pub dropped: usize,
    /// Resume bitfields written for file stores
    pub resume_flushed: usize,
    /// Expired cache rows removed
    pub purged: u64,
    pub backed_up: bool,
    /// Removed items deleted from the database
    pub hard_deleted: usize,
}

/// Runs [`Service::tick`] every `reaper.tick_secs` until shutdown.
pub(crate) async fn run(service: Weak<Service>, shutdown: CancellationToken) {
    loop {
        let Some(period) = service.upgrade().map(|service| service.config.read().reaper.tick()) else {
            break;
        };
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        let Some(service) = service.upgrade() else {
            break;
        };
        let report = service.tick().await;
        if report != TickReport::default() {
            tracing::debug!(?report, "Maintenance tick");
        }
    }
    tracing::debug!("Maintenance stopped");
}

impl Service {
    /// One maintenance pass: metadata timeouts, reaper, pending resume
    /// writes, cache purge, backup rotation and hard-delete of unreferenced
    /// removed items.
    ///
    /// An item reaped by this pass is never deleted by it; deletion waits for
    /// a later tick and for `reaper.removed_retention_secs`.
    pub async fn tick(&self) -> TickReport {
        let started = Instant::now();
        let config = self.config();
        let mut report = TickReport::default();

        self.sweep_metadata_timeouts(&config, &mut report);
        self.sweep_reaper(&config, &mut report).await;
        self.flush_resume_data(&mut report).await;

        match self.context.cache.purge_expired().await {
            Ok(purged) => report.purged = purged,
            Err(e) => tracing::warn!("Cache purge failed: {e}"),
        }

        let due = self.last_backup.lock().elapsed() >= config.service.backup_interval();
        if due {
            report.backed_up = self.rotate_backups().await;
        }

        self.hard_delete_removed(&config, started, &mut report).await;
        report
    }

    fn sweep_metadata_timeouts(&self, config: &UndertowConfig, report: &mut TickReport) {
        let timeout = config.service.metadata_timeout();
        for torrent in self.torrent_handles() {
            if torrent.state() != TorrentState::MetadataPending {
                continue;
            }
            let waited = (Utc::now() - torrent.added_at()).to_std().unwrap_or_default();
            if waited < timeout {
                continue;
            }
            if torrent.fail(
                ErrorKind::MetadataTimeout,
                format!("no metadata after {}s", timeout.as_secs()),
            ) {
                report.timed_out += 1;
                self.notify(
                    NotificationLevel::Error,
                    format!("{}: metadata not received", torrent.name()),
                );
            }
        }
    }

    async fn sweep_reaper(&self, config: &UndertowConfig, report: &mut TickReport) {
        let mut candidates = Vec::new();
        for torrent in self.torrent_handles() {
            let stats = self.engine.stats(torrent.info_hash()).await.unwrap_or_default();
            let ratio = (stats.downloaded > 0).then(|| stats.uploaded as f64 / stats.downloaded as f64);
            candidates.push(ReapCandidate {
                info_hash: torrent.info_hash(),
                state: torrent.state(),
                readers: torrent.reader_count(),
                idle_for: torrent.idle_for(),
                finished_for: torrent.finished_for(),
                ratio,
            });
        }

        for (info_hash, action) in reaper::plan(&candidates, &config.reaper) {
            let Some(torrent) = self.torrent(info_hash) else {
                continue;
            };
            match action {
                ReapAction::Drop => {
                    self.torrents.lock().remove(&info_hash);
                    report.dropped += 1;
                }
                ReapAction::Teardown => {
                    self.reap_logged(&torrent, config.reaper.delete_files_on_remove).await;
                    report.reaped += 1;
                }
                ReapAction::Schedule(reason) => {
                    tracing::info!(info_hash = %info_hash, %reason, "Reaping torrent");
                    self.reap_logged(&torrent, config.reaper.delete_files_on_remove).await;
                    report.reaped += 1;
                }
            }
        }
    }

    async fn flush_resume_data(&self, report: &mut TickReport) {
        let stores: Vec<_> = self
            .torrent_handles()
            .into_iter()
            .filter_map(|torrent| torrent.store())
            .filter(|store| store.resume_pending())
            .collect();
        if stores.is_empty() {
            return;
        }
        let flushed = tokio::task::spawn_blocking(move || {
            stores
                .iter()
                .filter(|store| match store.flush_resume() {
                    Ok(written) => written,
                    Err(e) => {
                        tracing::warn!(info_hash = %store.info_hash(), "Resume flush failed: {e}");
                        false
                    }
                })
                .count()
        })
        .await;
        match flushed {
            Ok(count) => report.resume_flushed = count,
            Err(e) => tracing::warn!("Resume flush task failed: {e}"),
        }
    }

    async fn reap_logged(&self, torrent: &Arc<crate::torrent::Torrent>, delete_files: bool) {
        if let Err(e) = self.reap(torrent, delete_files).await {
            tracing::warn!(info_hash = %torrent.info_hash(), "Reap incomplete: {e}");
        }
    }

    async fn rotate_backups(&self) -> bool {
        *self.last_backup.lock() = Instant::now();
        let app = self.context.database.backup().await;
        let cache = self.context.cache.backup().await;
        match (app, cache) {
            (Ok(_), Ok(_)) => {
                tracing::info!("Database backups rotated");
                true
            }
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("Backup rotation failed: {e}");
                false
            }
        }
    }

    async fn hard_delete_removed(&self, config: &UndertowConfig, started: Instant, report: &mut TickReport) {
        let removed = match self
            .context
            .database
            .items_with_state(TorrentItemState::Removed)
            .await
        {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!("Removed items unreadable: {e}");
                return;
            }
        };
        let mut unreferenced = Vec::with_capacity(removed.len());
        for item in removed {
            if self.torrent(item.info_hash).is_some() || self.context.library.references(item.info_hash).await {
                continue;
            }
            unreferenced.push(item.info_hash);
        }

        let retention = config.reaper.removed_retention();
        let due: Vec<_> = {
            let mut since = self.removed_since.lock();
            since.retain(|info_hash, _| unreferenced.contains(info_hash));
            unreferenced
                .iter()
                .filter(|info_hash| {
                    let seen = *since.entry(**info_hash).or_insert(started);
                    seen < started && seen.elapsed() >= retention
                })
                .copied()
                .collect()
        };

        for info_hash in due {
            match self.context.database.delete_item(info_hash).await {
                Ok(deleted) => {
                    self.removed_since.lock().remove(&info_hash);
                    if deleted {
                        report.hard_deleted += 1;
                        super::remove_if_present(&self.context.profile.torrent_file(info_hash)).await;
                    }
                }
                Err(e) => tracing::warn!(info_hash = %info_hash, "Hard delete failed: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::context::Context;
    use crate::profile::Profile;
    use crate::service::LibraryIndex;
    use crate::session::{SimulatedEngine, SimulationProfile, event_channel};
    use crate::torrent::{InfoHash, MediaContext, TorrentRef};

    const HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    struct Referenced;

    #[async_trait]
    impl LibraryIndex for Referenced {
        async fn references(&self, _info_hash: InfoHash) -> bool {
            true
        }
    }

    async fn service(dir: &std::path::Path, config: UndertowConfig, referenced: bool) -> Arc<Service> {
        let mut context = Context::open(Profile::new(dir), Arc::new(config)).await.unwrap();
        if referenced {
            context = context.with_library(Arc::new(Referenced));
        }
        let (events_tx, events_rx) = event_channel();
        let engine = SimulatedEngine::new(SimulationProfile::for_testing(), events_tx);
        Service::start(context, engine, events_rx).await
    }

    fn quiet_config() -> UndertowConfig {
        let mut config = UndertowConfig::for_testing();
        // Background ticks stay out of the way; tests call tick() directly.
        config.reaper.tick_secs = 3600;
        config
    }

    #[tokio::test]
    async fn test_reaped_item_is_hard_deleted_on_a_later_tick() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quiet_config();
        config.reaper.idle_timeout_secs = 0;
        config.reaper.removed_retention_secs = 0;
        let service = service(dir.path(), config, false).await;
        let ih = service
            .add(TorrentRef::parse(HASH).unwrap(), MediaContext::default(), true)
            .await
            .unwrap();

        let report = service.tick().await;
        assert_eq!(report.reaped, 1);
        assert_eq!(report.hard_deleted, 0);
        assert!(service.torrent(ih).is_none());
        let item = service.context().database.item(ih).await.unwrap().unwrap();
        assert_eq!(item.state, TorrentItemState::Removed);

        let report = service.tick().await;
        assert_eq!(report.hard_deleted, 1);
        assert!(service.context().database.item(ih).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_removed_item_kept_for_retention() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quiet_config();
        config.reaper.idle_timeout_secs = 0;
        let service = service(dir.path(), config, false).await;
        let ih = service
            .add(TorrentRef::parse(HASH).unwrap(), MediaContext::default(), true)
            .await
            .unwrap();

        for _ in 0..3 {
            assert_eq!(service.tick().await.hard_deleted, 0);
        }
        let item = service.context().database.item(ih).await.unwrap().unwrap();
        assert_eq!(item.state, TorrentItemState::Removed);
    }

    #[tokio::test]
    async fn test_library_reference_keeps_removed_item() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quiet_config();
        config.reaper.idle_timeout_secs = 0;
        let service = service(dir.path(), config, true).await;
        let ih = service
            .add(TorrentRef::parse(HASH).unwrap(), MediaContext::default(), true)
            .await
            .unwrap();

        service.tick().await;
        let item = service.context().database.item(ih).await.unwrap().unwrap();
        assert_eq!(item.state, TorrentItemState::Removed);
    }

    #[tokio::test]
    async fn test_keep_downloading_spares_idle_torrent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quiet_config();
        config.reaper.idle_timeout_secs = 0;
        config.reaper.keep_downloading = true;
        let service = service(dir.path(), config, false).await;
        let ih = service
            .add(TorrentRef::parse(HASH).unwrap(), MediaContext::default(), true)
            .await
            .unwrap();

        let report = service.tick().await;
        assert_eq!(report.reaped, 0);
        assert!(service.torrent(ih).is_some());
    }

    #[tokio::test]
    async fn test_tick_flushes_pending_resume_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quiet_config();
        config.storage.policy = crate::config::StoragePolicyKind::File;
        let service = service(dir.path(), config, false).await;
        let ih = service
            .add(TorrentRef::parse(HASH).unwrap(), MediaContext::default(), true)
            .await
            .unwrap();
        let store = service.torrent(ih).unwrap().store().unwrap();

        // Let the idle head fill and the swarm go quiet.
        let quiet = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            let mut seen = 0;
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                let now = store.downloaded_count();
                if now > 0 && now == seen {
                    break;
                }
                seen = now;
            }
        })
        .await;
        assert!(quiet.is_ok(), "swarm never went quiet");

        service.tick().await;
        assert!(!store.resume_pending());
        let profile = &service.context().profile;
        let resume = profile.resume_file(&profile.downloads_dir(), ih);
        let on_disk = crate::storage::file::load_resume(&resume, store.piece_count());
        let verified: Vec<u32> = (0..store.piece_count()).filter(|piece| store.is_verified(*piece)).collect();
        assert_eq!(on_disk, verified);
    }

    #[tokio::test]
    async fn test_backup_rotates_when_due() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = quiet_config();
        config.service.backup_interval_secs = 0;
        let service = service(dir.path(), config, false).await;

        let report = service.tick().await;
        assert!(report.backed_up);
        assert!(dir.path().join("app-backup.db").exists());
        assert!(dir.path().join("cache-backup.db").exists());
    }
}
