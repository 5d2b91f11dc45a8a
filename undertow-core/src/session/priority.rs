//! Per-piece priority and deadline snapshot handed to the swarm engine.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::torrent::{PieceRange, Priority};

/// Complete priority assignment for one torrent.
///
/// Built by the buffer controller and submitted to the engine in one batch.
/// Pieces default to [`Priority::Skipped`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriorityMap {
    priorities: Vec<Priority>,
    deadlines: BTreeMap<u32, Duration>,
}

impl PriorityMap {
    /// Map with every piece skipped.
    pub fn skipped(piece_count: u32) -> Self {
        Self {
            priorities: vec![Priority::Skipped; piece_count as usize],
            deadlines: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> u32 {
        self.priorities.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.priorities.is_empty()
    }

    /// Sets `piece` to `priority`; out-of-range pieces are ignored.
    pub fn set(&mut self, piece: u32, priority: Priority) {
        if let Some(slot) = self.priorities.get_mut(piece as usize) {
            *slot = priority;
        }
    }

    /// Raises `piece` to `priority` if it is currently lower.
    pub fn raise(&mut self, piece: u32, priority: Priority) {
        if let Some(slot) = self.priorities.get_mut(piece as usize) {
            *slot = (*slot).max(priority);
        }
    }

    pub fn set_range(&mut self, range: PieceRange, priority: Priority) {
        for piece in range.iter() {
            self.set(piece, priority);
        }
    }

    /// Keeps the earliest deadline when one is already set.
    pub fn set_deadline(&mut self, piece: u32, deadline: Duration) {
        if piece >= self.len() {
            return;
        }
        self.deadlines
            .entry(piece)
            .and_modify(|existing| *existing = (*existing).min(deadline))
            .or_insert(deadline);
    }

    pub fn priority(&self, piece: u32) -> Priority {
        self.priorities
            .get(piece as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn deadline(&self, piece: u32) -> Option<Duration> {
        self.deadlines.get(&piece).copied()
    }

    pub fn is_wanted(&self, piece: u32) -> bool {
        self.priority(piece) != Priority::Skipped
    }

    /// Pieces whose priority is not skipped, ascending.
    pub fn wanted(&self) -> impl Iterator<Item = u32> + '_ {
        self.priorities
            .iter()
            .enumerate()
            .filter(|(_, priority)| **priority != Priority::Skipped)
            .map(|(piece, _)| piece as u32)
    }

    pub fn count(&self, priority: Priority) -> usize {
        self.priorities.iter().filter(|p| **p == priority).count()
    }

    /// Wanted pieces in the order an engine should fetch them: deadlined
    /// pieces first by deadline, then by descending priority, then by index.
    pub fn request_order(&self) -> Vec<u32> {
        let mut order: Vec<u32> = self.wanted().collect();
        order.sort_by_key(|piece| {
            let deadline = self.deadline(*piece).unwrap_or(Duration::MAX);
            (deadline, std::cmp::Reverse(self.priority(*piece)), *piece)
        });
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_order_prefers_deadlines_then_priority() {
        let mut map = PriorityMap::skipped(10);
        map.set(9, Priority::High);
        map.set(2, Priority::Now);
        map.set(3, Priority::High);
        map.set(5, Priority::Normal);
        map.set_deadline(3, Duration::from_millis(10));
        map.set_deadline(2, Duration::from_millis(0));

        assert_eq!(map.request_order(), vec![2, 3, 9, 5]);
        assert_eq!(map.wanted().collect::<Vec<_>>(), vec![2, 3, 5, 9]);
    }

    #[test]
    fn test_earliest_deadline_wins_and_out_of_range_is_ignored() {
        let mut map = PriorityMap::skipped(4);
        map.set_deadline(1, Duration::from_millis(30));
        map.set_deadline(1, Duration::from_millis(10));
        map.set_deadline(1, Duration::from_millis(20));
        map.set_deadline(7, Duration::from_millis(1));
        map.set(7, Priority::Now);

        assert_eq!(map.deadline(1), Some(Duration::from_millis(10)));
        assert_eq!(map.deadline(7), None);
        assert_eq!(map.priority(7), Priority::Skipped);
    }

    #[test]
    fn test_raise_never_lowers() {
        let mut map = PriorityMap::skipped(2);
        map.set(0, Priority::Now);
        map.raise(0, Priority::High);
        map.raise(1, Priority::Normal);
        assert_eq!(map.priority(0), Priority::Now);
        assert_eq!(map.priority(1), Priority::Normal);
    }
}
