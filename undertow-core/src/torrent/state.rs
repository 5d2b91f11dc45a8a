//! Lifecycle state machine of one torrent.

use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TorrentState {
    MetadataPending,
    Buffering,
    Playing,
    Paused,
    Finished,
    Reaping,
    Gone,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid torrent transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: TorrentState,
    pub to: TorrentState,
}

impl TorrentState {
    /// Whether the machine permits moving from `self` to `to`.
    pub fn can_transition(self, to: TorrentState) -> bool {
        use TorrentState::*;
        match (self, to) {
            (Gone, _) => false,
            (Reaping, Gone) => true,
            (Reaping, _) => false,
            (_, Reaping) => true,
            (Error, _) => false,
            (_, Error) => true,
            (MetadataPending, Buffering) => true,
            (Buffering, Playing | Paused | Finished) => true,
            (Playing, Paused | Finished) => true,
            (Paused, Playing | Buffering | Finished) => true,
            _ => false,
        }
    }

    /// Validated transition.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` - The edge is not part of the lifecycle
    pub fn transition(self, to: TorrentState) -> Result<TorrentState, InvalidTransition> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }

    /// Metainfo known and storage attached.
    pub fn has_metadata(self) -> bool {
        matches!(
            self,
            TorrentState::Buffering
                | TorrentState::Playing
                | TorrentState::Paused
                | TorrentState::Finished
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TorrentState::Reaping | TorrentState::Gone)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TorrentState::MetadataPending => "metadata_pending",
            TorrentState::Buffering => "buffering",
            TorrentState::Playing => "playing",
            TorrentState::Paused => "paused",
            TorrentState::Finished => "finished",
            TorrentState::Reaping => "reaping",
            TorrentState::Gone => "gone",
            TorrentState::Error => "error",
        }
    }
}

impl fmt::Display for TorrentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::TorrentState::*;
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = MetadataPending;
        for next in [Buffering, Playing, Paused, Playing, Finished, Reaping, Gone] {
            state = state.transition(next).unwrap();
        }
        assert_eq!(state, Gone);
    }

    #[test]
    fn test_any_live_state_can_reap_or_fail() {
        for state in [MetadataPending, Buffering, Playing, Paused, Finished] {
            assert!(state.can_transition(Reaping), "{state} -> reaping");
            assert!(state.can_transition(Error), "{state} -> error");
        }
        assert!(Error.can_transition(Reaping));
    }

    #[test]
    fn test_rejected_edges() {
        assert!(MetadataPending.transition(Playing).is_err());
        assert!(Finished.transition(Playing).is_err());
        assert!(Reaping.transition(Error).is_err());
        assert!(Gone.transition(Reaping).is_err());
        assert!(Error.transition(Buffering).is_err());
        assert_eq!(
            Playing.transition(MetadataPending),
            Err(InvalidTransition {
                from: Playing,
                to: MetadataPending
            })
        );
    }
}
