//! # Completion Tracker
//!
//! Accumulates "block N loaded" events across independent load calls and
//! declares the configuration set complete once every expected index has
//! either arrived or been waived. Completion is latched: it never resets for
//! the lifetime of the tracker.

use log::{info, warn};

use crate::block::{BlockKind, BLOCK_KIND_COUNT};

/// Maximum blocks per configuration set (bitmap width)
pub const MAX_BLOCKS: usize = 64;

/// Snapshot of the tracker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletionState {
    pub expected_block_count: usize,
    pub arrived_bitmask: u64,
    /// Optional blocks given up on after permanent failure
    pub waived_bitmask: u64,
    pub complete: bool,
    /// Currently waived blocks per kind, indexed by [`BlockKind::index`]
    pub degraded_count_by_kind: [u16; BLOCK_KIND_COUNT],
}

impl CompletionState {
    pub fn arrived(&self, index: usize) -> bool {
        index < MAX_BLOCKS && self.arrived_bitmask & (1 << index) != 0
    }

    pub fn waived(&self, index: usize) -> bool {
        index < MAX_BLOCKS && self.waived_bitmask & (1 << index) != 0
    }

    pub fn arrived_count(&self) -> u32 {
        self.arrived_bitmask.count_ones()
    }

    pub fn degraded(&self, kind: BlockKind) -> u16 {
        self.degraded_count_by_kind[kind.index()]
    }

    /// Whether any optional block was waived
    pub fn is_degraded(&self) -> bool {
        self.waived_bitmask != 0
    }

    /// Indices still outstanding
    pub fn missing(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.expected_block_count).filter(move |&i| !self.arrived(i) && !self.waived(i))
    }
}

/// Refusal to waive a block
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaiveError {
    /// The mandatory basic-init block cannot be waived
    Mandatory,
    OutOfRange(usize),
    /// Already arrived; nothing to waive
    Arrived(usize),
}

impl core::fmt::Display for WaiveError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            WaiveError::Mandatory => write!(f, "mandatory block cannot be waived"),
            WaiveError::OutOfRange(i) => write!(f, "block index {} out of range", i),
            WaiveError::Arrived(i) => write!(f, "block {} already arrived", i),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for WaiveError {}

#[derive(Clone, Debug)]
pub struct CompletionTracker {
    state: CompletionState,
    /// Kind of each waived index, for late arrivals
    waived_kinds: [Option<BlockKind>; MAX_BLOCKS],
    /// Set on the false -> true transition, cleared when taken
    event_pending: bool,
}

impl CompletionTracker {
    /// Tracker for `expected` blocks; `None` if outside `1..=MAX_BLOCKS`
    pub fn new(expected: usize) -> Option<Self> {
        if expected == 0 || expected > MAX_BLOCKS {
            return None;
        }
        Some(Self {
            state: CompletionState {
                expected_block_count: expected,
                arrived_bitmask: 0,
                waived_bitmask: 0,
                complete: false,
                degraded_count_by_kind: [0; BLOCK_KIND_COUNT],
            },
            waived_kinds: [None; MAX_BLOCKS],
            event_pending: false,
        })
    }

    pub fn state(&self) -> &CompletionState {
        &self.state
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.state.complete
    }

    /// Record a successful load of block `index`.
    ///
    /// Idempotent. An index outside the expected range is logged and ignored.
    /// A block that arrives after being waived counts as arrived and is no
    /// longer degraded.
    pub fn mark_arrived(&mut self, index: usize) -> CompletionState {
        if index >= self.state.expected_block_count {
            warn!(
                "completion: index {} outside expected {}",
                index, self.state.expected_block_count
            );
            return self.state;
        }
        let bit = 1u64 << index;
        self.state.arrived_bitmask |= bit;
        self.state.waived_bitmask &= !bit;
        if let Some(kind) = self.waived_kinds[index].take() {
            let count = &mut self.state.degraded_count_by_kind[kind.index()];
            *count = count.saturating_sub(1);
        }
        self.update();
        self.state
    }

    /// Give up on an optional block that failed permanently
    pub fn waive(&mut self, index: usize, kind: BlockKind) -> Result<CompletionState, WaiveError> {
        if kind.is_mandatory() {
            return Err(WaiveError::Mandatory);
        }
        if index >= self.state.expected_block_count {
            return Err(WaiveError::OutOfRange(index));
        }
        let bit = 1u64 << index;
        if self.state.arrived_bitmask & bit != 0 {
            return Err(WaiveError::Arrived(index));
        }
        if self.state.waived_bitmask & bit == 0 {
            self.state.waived_bitmask |= bit;
            let count = &mut self.state.degraded_count_by_kind[kind.index()];
            *count = count.saturating_add(1);
            self.waived_kinds[index] = Some(kind);
            warn!("completion: waived block {} ({})", index, kind.name());
        }
        self.update();
        Ok(self.state)
    }

    /// True exactly once, after the transition to complete
    pub fn take_completion_event(&mut self) -> bool {
        core::mem::replace(&mut self.event_pending, false)
    }

    fn update(&mut self) {
        if self.state.complete {
            return;
        }
        let expected = self.state.expected_block_count;
        let full = if expected == MAX_BLOCKS {
            u64::MAX
        } else {
            (1u64 << expected) - 1
        };
        if (self.state.arrived_bitmask | self.state.waived_bitmask) & full == full {
            self.state.complete = true;
            self.event_pending = true;
            info!(
                "completion: {} blocks complete ({} waived)",
                expected,
                self.state.waived_bitmask.count_ones()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_block_completes() {
        let mut tracker = CompletionTracker::new(1).unwrap();
        let state = tracker.mark_arrived(0);
        assert!(state.complete);
        assert!(tracker.take_completion_event());
        assert!(!tracker.take_completion_event());
    }

    #[test]
    fn test_mark_arrived_idempotent() {
        let mut tracker = CompletionTracker::new(3).unwrap();
        let once = tracker.mark_arrived(1);
        let twice = tracker.mark_arrived(1);
        assert_eq!(once, twice);
        assert!(!twice.complete);
    }

    #[test]
    fn test_complete_regardless_of_order() {
        let orders: [[usize; 4]; 3] = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1]];
        for order in orders {
            let mut tracker = CompletionTracker::new(4).unwrap();
            for (n, &i) in order.iter().enumerate() {
                let state = tracker.mark_arrived(i);
                assert_eq!(state.complete, n == 3, "order {:?}", order);
            }
            // Latched
            assert!(tracker.mark_arrived(0).complete);
            assert!(tracker.take_completion_event());
            assert!(!tracker.take_completion_event());
        }
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut tracker = CompletionTracker::new(2).unwrap();
        let state = tracker.mark_arrived(5);
        assert_eq!(state.arrived_bitmask, 0);
        assert!(CompletionTracker::new(0).is_none());
        assert!(CompletionTracker::new(MAX_BLOCKS + 1).is_none());
    }

    #[test]
    fn test_full_width_bitmap() {
        let mut tracker = CompletionTracker::new(MAX_BLOCKS).unwrap();
        for i in 0..MAX_BLOCKS - 1 {
            assert!(!tracker.mark_arrived(i).complete);
        }
        assert!(tracker.mark_arrived(MAX_BLOCKS - 1).complete);
    }

    #[test]
    fn test_waive_optional() {
        let mut tracker = CompletionTracker::new(2).unwrap();
        tracker.mark_arrived(0);
        let state = tracker.waive(1, BlockKind::DemuraLut).unwrap();
        assert!(state.complete);
        assert!(state.is_degraded());
        assert_eq!(state.degraded(BlockKind::DemuraLut), 1);

        // Waiving twice does not double count
        let state = tracker.waive(1, BlockKind::DemuraLut).unwrap();
        assert_eq!(state.degraded(BlockKind::DemuraLut), 1);
    }

    #[test]
    fn test_basic_init_never_waived() {
        let mut tracker = CompletionTracker::new(2).unwrap();
        assert_eq!(tracker.waive(0, BlockKind::BasicInit), Err(WaiveError::Mandatory));
        tracker.mark_arrived(0);
        assert_eq!(tracker.waive(0, BlockKind::Vac), Err(WaiveError::Arrived(0)));
    }

    #[test]
    fn test_late_arrival_clears_waive() {
        let mut tracker = CompletionTracker::new(2).unwrap();
        let state = tracker.waive(1, BlockKind::OdLut).unwrap();
        assert_eq!(state.degraded(BlockKind::OdLut), 1);
        let state = tracker.mark_arrived(1);
        assert!(state.arrived(1));
        assert!(!state.waived(1));
        assert_eq!(state.degraded(BlockKind::OdLut), 0);
        assert!(!state.is_degraded());
        assert_eq!(state.missing().collect::<Vec<_>>(), vec![0]);
    }
}
