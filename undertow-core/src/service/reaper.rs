//! Reaper policy as a pure function over torrent snapshots.
//!
//! The service collects a [`ReapCandidate`] per torrent on every tick and
//! executes whatever [`plan`] returns. Rules are evaluated in order and the
//! first match wins.

use std::fmt;
use std::time::Duration;

use crate::config::ReaperConfig;
use crate::torrent::{InfoHash, TorrentState};

/// What the reaper needs to know about one torrent.
#[derive(Debug, Clone, PartialEq)]
pub struct ReapCandidate {
    pub info_hash: InfoHash,
    pub state: TorrentState,
    pub readers: usize,
    /// Time since the last reader detached; `None` while readers are attached
    pub idle_for: Option<Duration>,
    /// Time since the playback file completed
    pub finished_for: Option<Duration>,
    /// Uploaded over downloaded bytes, when anything was downloaded
    pub ratio: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapReason {
    Finished,
    Error,
    Idle,
    ShareRatio,
    SeedTime,
}

impl fmt::Display for ReapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReapReason::Finished => "finished",
            ReapReason::Error => "failed",
            ReapReason::Idle => "idle",
            ReapReason::ShareRatio => "share ratio reached",
            ReapReason::SeedTime => "seed time reached",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapAction {
    /// Gone: forget the torrent.
    Drop,
    /// Reaping: tear storage down and mark the item removed.
    Teardown,
    /// Start reaping for `reason`.
    Schedule(ReapReason),
}

/// First matching rule for `candidate`, if any.
pub fn decide(candidate: &ReapCandidate, config: &ReaperConfig) -> Option<ReapAction> {
    match candidate.state {
        TorrentState::Gone => return Some(ReapAction::Drop),
        TorrentState::Reaping => return Some(ReapAction::Teardown),
        _ => {}
    }

    if candidate.state == TorrentState::Finished && !config.keep_finished && candidate.readers == 0 {
        return Some(ReapAction::Schedule(ReapReason::Finished));
    }

    // Failed torrents stay visible for one idle timeout; keep flags do not apply.
    if candidate.state == TorrentState::Error
        && candidate
            .idle_for
            .is_some_and(|idle| idle >= config.idle_timeout())
    {
        return Some(ReapAction::Schedule(ReapReason::Error));
    }

    if !config.keep_downloading
        && candidate
            .idle_for
            .is_some_and(|idle| idle >= config.idle_timeout())
    {
        return Some(ReapAction::Schedule(ReapReason::Idle));
    }

    if config.share_ratio_limit > 0.0
        && candidate
            .ratio
            .is_some_and(|ratio| ratio >= config.share_ratio_limit)
    {
        return Some(ReapAction::Schedule(ReapReason::ShareRatio));
    }

    if config.seed_time_limit_secs > 0
        && candidate
            .finished_for
            .is_some_and(|seeding| seeding >= Duration::from_secs(config.seed_time_limit_secs))
    {
        return Some(ReapAction::Schedule(ReapReason::SeedTime));
    }

    None
}

/// Actions for every candidate that matched a rule.
pub fn plan(candidates: &[ReapCandidate], config: &ReaperConfig) -> Vec<(InfoHash, ReapAction)> {
    candidates
        .iter()
        .filter_map(|candidate| decide(candidate, config).map(|action| (candidate.info_hash, action)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(state: TorrentState) -> ReapCandidate {
        ReapCandidate {
            info_hash: InfoHash::new([1; 20]),
            state,
            readers: 0,
            idle_for: Some(Duration::ZERO),
            finished_for: None,
            ratio: None,
        }
    }

    fn config() -> ReaperConfig {
        ReaperConfig {
            idle_timeout_secs: 60,
            ..ReaperConfig::default()
        }
    }

    #[test]
    fn test_terminal_states_first() {
        let config = config();
        assert_eq!(decide(&candidate(TorrentState::Gone), &config), Some(ReapAction::Drop));
        let mut reaping = candidate(TorrentState::Reaping);
        reaping.idle_for = Some(Duration::from_secs(3600));
        assert_eq!(decide(&reaping, &config), Some(ReapAction::Teardown));
    }

    #[test]
    fn test_finished_respects_keep_and_readers() {
        let mut finished = candidate(TorrentState::Finished);
        assert_eq!(
            decide(&finished, &config()),
            Some(ReapAction::Schedule(ReapReason::Finished))
        );

        let keep = ReaperConfig {
            keep_finished: true,
            ..config()
        };
        assert_eq!(decide(&finished, &keep), None);

        finished.readers = 1;
        finished.idle_for = None;
        assert_eq!(decide(&finished, &config()), None);
    }

    #[test]
    fn test_idle_timeout() {
        let config = config();
        let mut idle = candidate(TorrentState::MetadataPending);
        idle.idle_for = Some(Duration::from_secs(59));
        assert_eq!(decide(&idle, &config), None);
        idle.idle_for = Some(Duration::from_secs(60));
        assert_eq!(decide(&idle, &config), Some(ReapAction::Schedule(ReapReason::Idle)));

        let keep = ReaperConfig {
            keep_downloading: true,
            ..config
        };
        assert_eq!(decide(&idle, &keep), None);
    }

    #[test]
    fn test_failed_torrent_is_reaped_despite_keep_flags() {
        let keep = ReaperConfig {
            keep_downloading: true,
            keep_finished: true,
            ..config()
        };
        let mut failed = candidate(TorrentState::Error);
        failed.idle_for = Some(Duration::from_secs(30));
        assert_eq!(decide(&failed, &keep), None);

        failed.idle_for = Some(Duration::from_secs(60));
        assert_eq!(decide(&failed, &keep), Some(ReapAction::Schedule(ReapReason::Error)));
        assert_eq!(ReapReason::Error.to_string(), "failed");

        failed.readers = 1;
        failed.idle_for = None;
        assert_eq!(decide(&failed, &keep), None);
    }

    #[test]
    fn test_share_limits() {
        let config = ReaperConfig {
            share_ratio_limit: 1.5,
            seed_time_limit_secs: 600,
            keep_finished: true,
            ..config()
        };
        let mut seeding = candidate(TorrentState::Playing);
        seeding.readers = 1;
        seeding.idle_for = None;
        seeding.ratio = Some(1.0);
        seeding.finished_for = Some(Duration::from_secs(10));
        assert_eq!(decide(&seeding, &config), None);

        seeding.ratio = Some(1.5);
        assert_eq!(
            decide(&seeding, &config),
            Some(ReapAction::Schedule(ReapReason::ShareRatio))
        );

        seeding.ratio = Some(0.1);
        seeding.finished_for = Some(Duration::from_secs(600));
        assert_eq!(
            decide(&seeding, &config),
            Some(ReapAction::Schedule(ReapReason::SeedTime))
        );
    }

    #[test]
    fn test_plan_skips_unmatched() {
        let mut busy = candidate(TorrentState::Playing);
        busy.info_hash = InfoHash::new([2; 20]);
        busy.readers = 1;
        busy.idle_for = None;
        let gone = candidate(TorrentState::Gone);
        let actions = plan(&[busy, gone], &config());
        assert_eq!(actions, vec![(InfoHash::new([1; 20]), ReapAction::Drop)]);
    }
}
