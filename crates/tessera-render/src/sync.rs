// SPDX-License-Identifier: CEPL-1.0
//! Frame slot bookkeeping.
//!
//! The backend owns the actual semaphores and fences; this module tracks
//! which slots have outstanding submissions and which slot last submitted
//! work for every presentable image.

use std::fmt;

/// Index of a frame slot, in `0..frames_in_flight`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotId(pub u32);

impl SlotId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Submitted,
}

pub const MIN_FRAMES_IN_FLIGHT: usize = 2;
pub const MAX_FRAMES_IN_FLIGHT: usize = 3;

#[derive(Debug)]
pub struct FrameSynchronizer {
    slots: Vec<SlotState>,
    image_guards: Vec<Option<SlotId>>,
    current: usize,
}

impl FrameSynchronizer {
    /// `frames_in_flight` is clamped to 2..=3.
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        let frames = frames_in_flight.clamp(MIN_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT);
        Self {
            slots: vec![SlotState::Idle; frames],
            image_guards: vec![None; image_count],
            current: 0,
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn image_count(&self) -> usize {
        self.image_guards.len()
    }

    pub fn current_slot(&self) -> SlotId {
        SlotId(self.current as u32)
    }

    pub fn state(&self, slot: SlotId) -> SlotState {
        self.slots[slot.index()]
    }

    /// Slots whose submissions have not been observed complete, in slot order.
    pub fn in_flight(&self) -> Vec<SlotId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == SlotState::Submitted)
            .map(|(i, _)| SlotId(i as u32))
            .collect()
    }

    /// Slot whose submission last rendered to `image`, if still outstanding.
    pub fn guard_of(&self, image: u32) -> Option<SlotId> {
        self.image_guards
            .get(image as usize)
            .copied()
            .flatten()
            .filter(|slot| self.state(*slot) == SlotState::Submitted)
    }

    /// # Panics
    /// If `slot` already has an outstanding submission.
    pub fn mark_submitted(&mut self, slot: SlotId, image: u32) {
        assert_eq!(
            self.slots[slot.index()],
            SlotState::Idle,
            "{slot:?} submitted while its previous frame is still in flight"
        );
        self.slots[slot.index()] = SlotState::Submitted;
        if let Some(guard) = self.image_guards.get_mut(image as usize) {
            *guard = Some(slot);
        }
    }

    /// Transitions `slot` back to idle and releases the images it guarded.
    /// Returns true if it had been submitted.
    pub fn mark_complete(&mut self, slot: SlotId) -> bool {
        let state = &mut self.slots[slot.index()];
        let was_submitted = *state == SlotState::Submitted;
        *state = SlotState::Idle;
        for guard in &mut self.image_guards {
            if *guard == Some(slot) {
                *guard = None;
            }
        }
        was_submitted
    }

    /// Marks every slot complete, for use after a device wait-idle.
    /// Returns the slots that were outstanding.
    pub fn complete_all(&mut self) -> Vec<SlotId> {
        let done = self.in_flight();
        for slot in &done {
            self.mark_complete(*slot);
        }
        done
    }

    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Resizes the image table after swapchain recreation. The current slot
    /// index is preserved.
    pub fn reset_images(&mut self, image_count: usize) {
        self.image_guards = vec![None; image_count];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_in_flight_is_clamped() {
        assert_eq!(FrameSynchronizer::new(1, 3).frames_in_flight(), 2);
        assert_eq!(FrameSynchronizer::new(8, 3).frames_in_flight(), 3);
    }

    #[test]
    fn advance_wraps_modulo_frames() {
        let mut sync = FrameSynchronizer::new(3, 2);
        let seen: Vec<u32> = (0..7)
            .map(|_| {
                let s = sync.current_slot().0;
                sync.advance();
                s
            })
            .collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn slot_cycles_through_submitted_and_back() {
        let mut sync = FrameSynchronizer::new(2, 3);
        let slot = sync.current_slot();
        sync.mark_submitted(slot, 1);
        assert_eq!(sync.state(slot), SlotState::Submitted);
        assert_eq!(sync.in_flight(), vec![slot]);
        assert_eq!(sync.guard_of(1), Some(slot));

        assert!(sync.mark_complete(slot));
        assert!(!sync.mark_complete(slot));
        assert_eq!(sync.guard_of(1), None);
        assert!(sync.in_flight().is_empty());
    }

    #[test]
    #[should_panic(expected = "still in flight")]
    fn double_submit_on_one_slot_panics() {
        let mut sync = FrameSynchronizer::new(2, 3);
        sync.mark_submitted(SlotId(0), 0);
        sync.mark_submitted(SlotId(0), 1);
    }

    #[test]
    fn complete_all_reports_outstanding_slots() {
        let mut sync = FrameSynchronizer::new(3, 3);
        sync.mark_submitted(SlotId(0), 0);
        sync.mark_submitted(SlotId(2), 1);
        assert_eq!(sync.complete_all(), vec![SlotId(0), SlotId(2)]);
        assert!(sync.in_flight().is_empty());
    }

    #[test]
    fn reset_images_keeps_current_slot() {
        let mut sync = FrameSynchronizer::new(2, 3);
        sync.advance();
        sync.mark_submitted(SlotId(0), 2);
        sync.reset_images(4);
        assert_eq!(sync.current_slot(), SlotId(1));
        assert_eq!(sync.image_count(), 4);
        assert_eq!(sync.guard_of(2), None);
    }
}
