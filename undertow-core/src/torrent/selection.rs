//! Automatic choice of the playback file.

use regex::Regex;

use super::item::MediaType;
use super::layout::FileEntry;
use crate::config::SelectionConfig;

const EPISODE_PATTERNS: &[&str] = &[
    r"(?i)s(\d{1,2})[ ._-]?e(\d{1,3})",
    r"(?i)(?:^|[^0-9a-z])(\d{1,2})x(\d{1,3})(?:[^0-9]|$)",
    r"(?i)season[ ._-]?(\d{1,2})[ ._-]*episode[ ._-]?(\d{1,3})",
];

/// What the caller knows about the wanted media.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelectionHint {
    pub media_type: MediaType,
    pub season: Option<u32>,
    pub episode: Option<u32>,
}

/// Outcome of an automatic selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Chosen(usize),
    /// Several candidates qualify and the caller asked to choose manually;
    /// indices are ordered largest first.
    Ambiguous(Vec<usize>),
    NoCandidate,
}

/// Strategy choosing the playback file of a torrent.
pub trait FileSelector: Send + Sync {
    fn select(&self, files: &[FileEntry], hint: &SelectionHint) -> Selection;
}

/// Largest video above a size threshold, disambiguated by episode pattern.
#[derive(Debug, Clone)]
pub struct VideoFileSelector {
    config: SelectionConfig,
    patterns: Vec<Regex>,
}

impl VideoFileSelector {
    pub fn new(config: SelectionConfig) -> Self {
        let patterns = EPISODE_PATTERNS
            .iter()
            .filter_map(|pattern| Regex::new(pattern).ok())
            .collect();
        Self { config, patterns }
    }

    fn is_video(&self, file: &FileEntry) -> bool {
        file.extension()
            .is_some_and(|ext| self.config.video_extensions.iter().any(|v| *v == ext))
    }

    /// Season and episode numbers parsed from a file name.
    pub fn episode_of(&self, name: &str) -> Option<(u32, u32)> {
        self.patterns.iter().find_map(|pattern| {
            let captures = pattern.captures(name)?;
            let season = captures.get(1)?.as_str().parse().ok()?;
            let episode = captures.get(2)?.as_str().parse().ok()?;
            Some((season, episode))
        })
    }
}

impl FileSelector for VideoFileSelector {
    fn select(&self, files: &[FileEntry], hint: &SelectionHint) -> Selection {
        let min_size = if hint.media_type.is_series() {
            self.config.min_show_size
        } else {
            self.config.min_movie_size
        };

        let mut candidates: Vec<&FileEntry> = files
            .iter()
            .filter(|file| self.is_video(file) && file.length >= min_size)
            .collect();
        if candidates.is_empty() {
            candidates = files.iter().filter(|file| self.is_video(file)).collect();
        }
        if candidates.is_empty() {
            candidates = files.iter().filter(|file| file.length > 0).collect();
        }
        candidates.sort_by(|a, b| b.length.cmp(&a.length).then(a.index.cmp(&b.index)));

        if let (Some(season), Some(episode)) = (hint.season, hint.episode) {
            let matching = candidates
                .iter()
                .find(|file| self.episode_of(file.file_name()) == Some((season, episode)));
            if let Some(file) = matching {
                return Selection::Chosen(file.index);
            }
        }

        match candidates.as_slice() {
            [] => Selection::NoCandidate,
            [only] => Selection::Chosen(only.index),
            [largest, ..] if !self.config.choose_manually => Selection::Chosen(largest.index),
            many => Selection::Ambiguous(many.iter().map(|file| file.index).collect()),
        }
    }
}
