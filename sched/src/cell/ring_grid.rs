//! Slot-Indexed Ring Grid
//!
//! Fixed-size ring of per-slot state, indexed by the raw slot count. The
//! ring length must divide the number of slots in a hyper-frame for
//! numerology 0, otherwise lookups would jump to a different entry when the
//! slot point wraps at the hyper-frame boundary.

use common::types::SubcarrierSpacing;
use common::SlotPoint;

/// Number of slots per hyper-frame for numerology 0, the conservative
/// reference for ring sizing.
const NOF_SLOTS_PER_HYPER_FRAME_MU0: u32 = 1024 * 10;

/// Smallest ring size above `min_size` that keeps ring indices aligned
/// across the hyper-frame wrap: a power-of-two number of frames, so the
/// size divides the hyper-frame slot count.
pub fn ring_size_gt_min(min_size: u32, scs: SubcarrierSpacing) -> u32 {
    let slots_per_frame = scs.slots_per_frame();
    let nof_frames = min_size.div_ceil(slots_per_frame).next_power_of_two();
    nof_frames * slots_per_frame
}

/// Ring of per-slot entries
pub struct RingGrid<T> {
    slots: Vec<T>,
}

impl<T> RingGrid<T> {
    /// Build a ring with at least `min_size` entries, one per slot.
    ///
    /// Panics if the resulting size breaks the hyper-frame alignment
    /// invariant; that is a configuration error caught at startup.
    pub fn new_with(min_size: u32, scs: SubcarrierSpacing, mut init: impl FnMut() -> T) -> Self {
        let size = ring_size_gt_min(min_size, scs);
        assert!(
            NOF_SLOTS_PER_HYPER_FRAME_MU0 % size == 0 || size % NOF_SLOTS_PER_HYPER_FRAME_MU0 == 0,
            "ring size {} misaligns with the hyper-frame boundary",
            size
        );
        Self {
            slots: (0..size).map(|_| init()).collect(),
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the ring is empty (never true after construction)
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn index(&self, slot: SlotPoint) -> usize {
        slot.count() as usize % self.slots.len()
    }

    /// Entry for the given slot
    pub fn get(&self, slot: SlotPoint) -> &T {
        &self.slots[self.index(slot)]
    }

    /// Mutable entry for the given slot
    pub fn get_mut(&mut self, slot: SlotPoint) -> &mut T {
        let idx = self.index(slot);
        &mut self.slots[idx]
    }
}

impl<T: Default> RingGrid<T> {
    /// Build a ring of default values
    pub fn new(min_size: u32, scs: SubcarrierSpacing) -> Self {
        Self::new_with(min_size, scs, T::default)
    }

    /// Reset the entry for the given slot to its default
    pub fn clear_slot(&mut self, slot: SlotPoint) {
        *self.get_mut(slot) = T::default();
    }
}
