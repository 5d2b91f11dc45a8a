//! Fixed ring of piece-sized slots for memory-backed torrents.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotStatus {
    Free,
    /// Holds a partial piece; block writes in flight
    Reserved,
    /// Holds a verified piece
    Filled,
}

#[derive(Debug)]
struct Slot {
    piece: Option<u32>,
    status: SlotStatus,
    /// Monotonic stamp of the last status change; oldest filled slots go first
    stamp: u64,
    data: Vec<u8>,
}

/// Slot chosen for an incoming block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Allocation {
    pub slot: usize,
    /// Piece whose bytes were displaced to make room
    pub displaced: Option<(u32, SlotStatus)>,
}

#[derive(Debug)]
pub(crate) struct MemorySlots {
    slots: Vec<Slot>,
    by_piece: HashMap<u32, usize>,
    piece_length: usize,
    clock: u64,
}

impl MemorySlots {
    pub fn new(capacity: usize, piece_length: u32) -> Self {
        let slots = (0..capacity.max(1))
            .map(|_| Slot {
                piece: None,
                status: SlotStatus::Free,
                stamp: 0,
                data: Vec::new(),
            })
            .collect();
        Self {
            slots,
            by_piece: HashMap::new(),
            piece_length: piece_length as usize,
            clock: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_of(&self, piece: u32) -> Option<usize> {
        self.by_piece.get(&piece).copied()
    }

    /// Finds a slot for `piece`.
    ///
    /// Order: the piece's own slot, a free slot, the oldest filled slot whose
    /// piece `evictable` accepts, then (only when `may_reclaim_partial`) the
    /// oldest reserved slot whose piece `evictable` accepts.
    pub fn allocate<F>(&mut self, piece: u32, may_reclaim_partial: bool, evictable: F) -> Option<Allocation>
    where
        F: Fn(u32) -> bool,
    {
        if let Some(slot) = self.slot_of(piece) {
            return Some(Allocation {
                slot,
                displaced: None,
            });
        }

        let victim = self
            .slots
            .iter()
            .position(|slot| slot.status == SlotStatus::Free)
            .or_else(|| self.oldest(SlotStatus::Filled, &evictable))
            .or_else(|| {
                may_reclaim_partial
                    .then(|| self.oldest(SlotStatus::Reserved, &evictable))
                    .flatten()
            })?;

        let displaced = self.slots[victim]
            .piece
            .map(|old| (old, self.slots[victim].status));
        if let Some((old, _)) = displaced {
            self.by_piece.remove(&old);
        }

        self.clock += 1;
        let slot = &mut self.slots[victim];
        slot.piece = Some(piece);
        slot.status = SlotStatus::Reserved;
        slot.stamp = self.clock;
        if slot.data.len() != self.piece_length {
            slot.data.resize(self.piece_length, 0);
        }
        self.by_piece.insert(piece, victim);

        Some(Allocation {
            slot: victim,
            displaced,
        })
    }

    fn oldest<F>(&self, status: SlotStatus, evictable: &F) -> Option<usize>
    where
        F: Fn(u32) -> bool,
    {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.status == status)
            .filter(|(_, slot)| slot.piece.is_some_and(evictable))
            .min_by_key(|(_, slot)| slot.stamp)
            .map(|(index, _)| index)
    }

    pub fn write(&mut self, slot: usize, offset: usize, data: &[u8]) {
        self.slots[slot].data[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn bytes(&self, slot: usize, offset: usize, length: usize) -> &[u8] {
        &self.slots[slot].data[offset..offset + length]
    }

    pub fn mark_filled(&mut self, slot: usize) {
        self.clock += 1;
        self.slots[slot].status = SlotStatus::Filled;
        self.slots[slot].stamp = self.clock;
    }

    /// Returns the slot holding `piece` to the free pool.
    pub fn release(&mut self, piece: u32) -> bool {
        let Some(slot) = self.by_piece.remove(&piece) else {
            return false;
        };
        let slot = &mut self.slots[slot];
        slot.piece = None;
        slot.status = SlotStatus::Free;
        true
    }

    /// Drops all payload memory.
    pub fn clear(&mut self) {
        self.by_piece.clear();
        for slot in &mut self.slots {
            slot.piece = None;
            slot.status = SlotStatus::Free;
            slot.data = Vec::new();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_slots_are_used_first() {
        let mut slots = MemorySlots::new(2, 8);
        let a = slots.allocate(5, false, |_| true).unwrap();
        let b = slots.allocate(6, false, |_| true).unwrap();
        assert_ne!(a.slot, b.slot);
        assert_eq!(a.displaced, None);
        assert_eq!(slots.allocate(5, false, |_| false).unwrap().slot, a.slot);
    }

    #[test]
    fn test_oldest_evictable_filled_slot_is_victim() {
        let mut slots = MemorySlots::new(2, 8);
        let a = slots.allocate(1, false, |_| true).unwrap();
        slots.mark_filled(a.slot);
        let b = slots.allocate(2, false, |_| true).unwrap();
        slots.mark_filled(b.slot);

        let c = slots.allocate(3, false, |piece| piece != 1).unwrap();
        assert_eq!(c.slot, b.slot);
        assert_eq!(c.displaced, Some((2, SlotStatus::Filled)));
        assert_eq!(slots.slot_of(2), None);
    }

    #[test]
    fn test_reserved_slots_need_explicit_permission() {
        let mut slots = MemorySlots::new(1, 8);
        slots.allocate(1, false, |_| true).unwrap();
        assert!(slots.allocate(2, false, |_| true).is_none());
        let reclaimed = slots.allocate(2, true, |_| true).unwrap();
        assert_eq!(reclaimed.displaced, Some((1, SlotStatus::Reserved)));
    }
}
