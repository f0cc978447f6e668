// SPDX-License-Identifier: CEPL-1.0
//! One frame, start to finish.
//!
//! [`FrameDriver::render_frame`] runs the acquire/record/submit/present
//! protocol against a [`FrameBackend`] and feeds every slot it observes
//! complete into the lifetime tracker.

use std::sync::Arc;

use portable_atomic::{AtomicBool, Ordering};
use tessera_core::{EngineError, Result};
use tracing::{debug, trace};

use crate::lifetime::{LifetimeTracker, TrackedResource};
use crate::recorder::CommandCache;
use crate::sync::{FrameSynchronizer, SlotId, SlotState};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    /// Usable this frame, but the swapchain should be rebuilt after present.
    pub suboptimal: bool,
}

/// GPU side of the frame protocol.
pub trait FrameBackend {
    /// Blocks until `slot`'s last submission has completed.
    fn wait_for_slot(&mut self, slot: SlotId) -> Result<()>;

    /// Fails with [`EngineError::SwapchainStale`] when the swapchain is out of date.
    fn acquire_next_image(&mut self, slot: SlotId) -> Result<AcquiredImage>;

    fn update_uniforms(&mut self, image: u32) -> Result<()>;

    /// Counter that changes whenever the recorded commands would differ.
    fn scene_generation(&self) -> u64;

    /// Re-encodes the command buffer of `image`. The image is not in flight.
    fn record(&mut self, image: u32) -> Result<()>;

    fn submit(&mut self, slot: SlotId, image: u32) -> Result<()>;

    /// Returns true when presentation succeeded but the swapchain is suboptimal.
    /// Fails with [`EngineError::SwapchainStale`] when it is out of date.
    fn present(&mut self, slot: SlotId, image: u32) -> Result<bool>;

    fn wait_idle(&mut self) -> Result<()>;

    /// Drains the device and rebuilds everything sized by the swapchain.
    /// Returns the new image count.
    fn recreate_swapchain(&mut self) -> Result<usize>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameStatus {
    Presented { image: u32 },
    /// Presented, then the swapchain was rebuilt.
    PresentedAndRecreated { image: u32 },
    /// Acquire found the swapchain stale; it was rebuilt and nothing was drawn.
    Skipped,
}

/// Set from the windowing side when the surface size changed.
#[derive(Debug, Default)]
pub struct ResizeFlag(AtomicBool);

impl ResizeFlag {
    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct FrameDriver {
    sync: FrameSynchronizer,
    commands: CommandCache,
    resized: Arc<ResizeFlag>,
    frames: u64,
    recreations: u64,
}

impl FrameDriver {
    pub fn new(frames_in_flight: usize, image_count: usize) -> Self {
        Self {
            sync: FrameSynchronizer::new(frames_in_flight, image_count),
            commands: CommandCache::new(image_count),
            resized: Arc::new(ResizeFlag::default()),
            frames: 0,
            recreations: 0,
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.sync.frames_in_flight()
    }

    pub fn current_slot(&self) -> SlotId {
        self.sync.current_slot()
    }

    /// Slots whose work may still reference resources retired right now.
    pub fn in_flight(&self) -> Vec<SlotId> {
        self.sync.in_flight()
    }

    pub fn resize_flag(&self) -> Arc<ResizeFlag> {
        Arc::clone(&self.resized)
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames
    }

    pub fn recreations(&self) -> u64 {
        self.recreations
    }

    pub fn synchronizer(&self) -> &FrameSynchronizer {
        &self.sync
    }

    pub fn invalidate_commands(&mut self) {
        self.commands.invalidate();
    }

    pub fn render_frame<B, R>(&mut self, backend: &mut B, tracker: &LifetimeTracker<R>) -> Result<FrameStatus>
    where
        B: FrameBackend,
        R: TrackedResource,
    {
        let mut retired = Vec::new();
        let result = self.step(backend, &mut retired);
        Self::retire(tracker, &retired);
        result
    }

    fn step<B: FrameBackend>(&mut self, backend: &mut B, retired: &mut Vec<SlotId>) -> Result<FrameStatus> {
        let slot = self.sync.current_slot();
        self.wait_slot(backend, slot, retired)?;

        let acquired = match backend.acquire_next_image(slot) {
            Ok(acquired) => acquired,
            Err(EngineError::SwapchainStale) => {
                debug!(?slot, "acquire found stale swapchain");
                self.recreate(backend, retired)?;
                return Ok(FrameStatus::Skipped);
            }
            Err(e) => return Err(e),
        };
        let image = acquired.index;

        // the image's uniform buffer is still read by whichever slot last drew it
        if let Some(guard) = self.sync.guard_of(image) {
            trace!(image, ?guard, "waiting on image guard");
            self.wait_slot(backend, guard, retired)?;
        }

        backend.update_uniforms(image)?;

        let generation = backend.scene_generation();
        if self.commands.is_stale(image, generation) {
            backend.record(image)?;
            self.commands.mark_recorded(image, generation);
        }

        backend.submit(slot, image)?;
        self.sync.mark_submitted(slot, image);

        let presented = backend.present(slot, image);
        self.sync.advance();
        self.frames += 1;

        let stale = match presented {
            Ok(suboptimal) => suboptimal || acquired.suboptimal,
            Err(EngineError::SwapchainStale) => true,
            Err(e) => return Err(e),
        };

        if stale || self.resized.take() {
            self.recreate(backend, retired)?;
            return Ok(FrameStatus::PresentedAndRecreated { image });
        }
        Ok(FrameStatus::Presented { image })
    }

    /// Re-records every image now, waiting for each image's guard first.
    pub fn record_all<B, R>(&mut self, backend: &mut B, tracker: &LifetimeTracker<R>) -> Result<()>
    where
        B: FrameBackend,
        R: TrackedResource,
    {
        let mut retired = Vec::new();
        let result = self.record_images(backend, &mut retired);
        Self::retire(tracker, &retired);
        result
    }

    fn record_images<B: FrameBackend>(&mut self, backend: &mut B, retired: &mut Vec<SlotId>) -> Result<()> {
        let generation = backend.scene_generation();
        for image in 0..self.sync.image_count() as u32 {
            if let Some(guard) = self.sync.guard_of(image) {
                self.wait_slot(backend, guard, retired)?;
            }
            backend.record(image)?;
            self.commands.mark_recorded(image, generation);
        }
        Ok(())
    }

    /// Rebuilds the swapchain outside the frame loop, e.g. after a vsync change.
    pub fn recreate_swapchain<B, R>(&mut self, backend: &mut B, tracker: &LifetimeTracker<R>) -> Result<()>
    where
        B: FrameBackend,
        R: TrackedResource,
    {
        let mut retired = Vec::new();
        let result = self.recreate(backend, &mut retired);
        Self::retire(tracker, &retired);
        result
    }

    /// Waits for the device to go idle and retires every outstanding slot.
    pub fn drain<B, R>(&mut self, backend: &mut B, tracker: &LifetimeTracker<R>) -> Result<()>
    where
        B: FrameBackend,
        R: TrackedResource,
    {
        backend.wait_idle()?;
        let done = self.sync.complete_all();
        Self::retire(tracker, &done);
        Ok(())
    }

    fn wait_slot<B: FrameBackend>(&mut self, backend: &mut B, slot: SlotId, retired: &mut Vec<SlotId>) -> Result<()> {
        if self.sync.state(slot) == SlotState::Submitted {
            backend.wait_for_slot(slot)?;
            self.sync.mark_complete(slot);
            retired.push(slot);
        }
        Ok(())
    }

    fn recreate<B: FrameBackend>(&mut self, backend: &mut B, retired: &mut Vec<SlotId>) -> Result<()> {
        let image_count = backend.recreate_swapchain()?;
        retired.extend(self.sync.complete_all());
        self.sync.reset_images(image_count);
        self.commands.reset(image_count);
        self.resized.take();
        self.recreations += 1;
        debug!(image_count, recreations = self.recreations, "swapchain recreated");
        Ok(())
    }

    fn retire<R: TrackedResource>(tracker: &LifetimeTracker<R>, slots: &[SlotId]) {
        for slot in slots {
            tracker.on_frame_retired(*slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifetime::tests::Res;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Ev {
        Wait(u32),
        Acquire(u32),
        Uniforms(u32),
        Record(u32),
        Submit(u32, u32),
        Present(u32, u32),
        WaitIdle,
        Recreate,
    }

    enum Acquire {
        Image(u32),
        Suboptimal(u32),
        Stale,
    }

    struct MockBackend {
        events: Vec<Ev>,
        acquires: VecDeque<Acquire>,
        presents: VecDeque<Result<bool>>,
        generation: u64,
        images: usize,
        next_image: u32,
    }

    impl MockBackend {
        fn new(images: usize) -> Self {
            Self {
                events: Vec::new(),
                acquires: VecDeque::new(),
                presents: VecDeque::new(),
                generation: 0,
                images,
                next_image: 0,
            }
        }

        fn count(&self, pred: impl Fn(&Ev) -> bool) -> usize {
            self.events.iter().filter(|e| pred(e)).count()
        }
    }

    impl FrameBackend for MockBackend {
        fn wait_for_slot(&mut self, slot: SlotId) -> Result<()> {
            self.events.push(Ev::Wait(slot.0));
            Ok(())
        }

        fn acquire_next_image(&mut self, slot: SlotId) -> Result<AcquiredImage> {
            self.events.push(Ev::Acquire(slot.0));
            let next = self.acquires.pop_front().unwrap_or_else(|| {
                let i = self.next_image;
                Acquire::Image(i)
            });
            self.next_image = (self.next_image + 1) % self.images as u32;
            match next {
                Acquire::Image(index) => Ok(AcquiredImage { index, suboptimal: false }),
                Acquire::Suboptimal(index) => Ok(AcquiredImage { index, suboptimal: true }),
                Acquire::Stale => Err(EngineError::SwapchainStale),
            }
        }

        fn update_uniforms(&mut self, image: u32) -> Result<()> {
            self.events.push(Ev::Uniforms(image));
            Ok(())
        }

        fn scene_generation(&self) -> u64 {
            self.generation
        }

        fn record(&mut self, image: u32) -> Result<()> {
            self.events.push(Ev::Record(image));
            Ok(())
        }

        fn submit(&mut self, slot: SlotId, image: u32) -> Result<()> {
            self.events.push(Ev::Submit(slot.0, image));
            Ok(())
        }

        fn present(&mut self, slot: SlotId, image: u32) -> Result<bool> {
            self.events.push(Ev::Present(slot.0, image));
            self.presents.pop_front().unwrap_or(Ok(false))
        }

        fn wait_idle(&mut self) -> Result<()> {
            self.events.push(Ev::WaitIdle);
            Ok(())
        }

        fn recreate_swapchain(&mut self) -> Result<usize> {
            self.events.push(Ev::Recreate);
            self.next_image = 0;
            Ok(self.images)
        }
    }

    fn tracker() -> (LifetimeTracker<Res>, Arc<Mutex<Vec<u64>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (LifetimeTracker::new(move |r: Res| sink.lock().push(r.0)), log)
    }

    #[test]
    fn steady_state_follows_protocol_order() {
        let (tracker, _) = tracker();
        let mut backend = MockBackend::new(3);
        let mut driver = FrameDriver::new(2, 3);

        let status = driver.render_frame(&mut backend, &tracker).unwrap();
        assert_eq!(status, FrameStatus::Presented { image: 0 });
        assert_eq!(
            backend.events,
            vec![Ev::Acquire(0), Ev::Uniforms(0), Ev::Record(0), Ev::Submit(0, 0), Ev::Present(0, 0)]
        );
        assert_eq!(driver.current_slot(), SlotId(1));
        assert_eq!(driver.in_flight(), vec![SlotId(0)]);
    }

    #[test]
    fn slot_is_waited_before_reuse_and_then_retired() {
        let (tracker, log) = tracker();
        let mut backend = MockBackend::new(3);
        let mut driver = FrameDriver::new(2, 3);

        driver.render_frame(&mut backend, &tracker).unwrap();
        driver.render_frame(&mut backend, &tracker).unwrap();
        assert_eq!(driver.in_flight(), vec![SlotId(0), SlotId(1)]);

        tracker.mark_for_destruction(Res(1), driver.in_flight());
        backend.events.clear();

        driver.render_frame(&mut backend, &tracker).unwrap();
        assert_eq!(backend.events[0], Ev::Wait(0));
        assert!(log.lock().is_empty());

        driver.render_frame(&mut backend, &tracker).unwrap();
        assert_eq!(*log.lock(), vec![1]);
    }

    #[test]
    fn stale_acquire_recreates_once_without_advancing() {
        let (tracker, _) = tracker();
        let mut backend = MockBackend::new(3);
        let mut driver = FrameDriver::new(2, 3);
        driver.render_frame(&mut backend, &tracker).unwrap();
        let slot = driver.current_slot();

        backend.acquires.push_back(Acquire::Stale);
        backend.events.clear();
        let status = driver.render_frame(&mut backend, &tracker).unwrap();

        assert_eq!(status, FrameStatus::Skipped);
        assert_eq!(driver.current_slot(), slot);
        assert_eq!(driver.recreations(), 1);
        assert_eq!(backend.count(|e| *e == Ev::Recreate), 1);
        assert_eq!(backend.count(|e| matches!(e, Ev::Submit(..) | Ev::Present(..))), 0);
        // recreation drains the device, so nothing is in flight afterwards
        assert!(driver.in_flight().is_empty());

        let status = driver.render_frame(&mut backend, &tracker).unwrap();
        assert!(matches!(status, FrameStatus::Presented { .. }));
        assert_eq!(driver.recreations(), 1);
    }

    #[test]
    fn image_guarded_by_other_slot_is_waited() {
        let (tracker, _) = tracker();
        let mut backend = MockBackend::new(3);
        let mut driver = FrameDriver::new(3, 3);

        backend.acquires.push_back(Acquire::Image(2));
        driver.render_frame(&mut backend, &tracker).unwrap();

        // slot 1 gets image 2 again while slot 0 still owns it
        backend.acquires.push_back(Acquire::Image(2));
        backend.events.clear();
        driver.render_frame(&mut backend, &tracker).unwrap();
        assert_eq!(
            backend.events,
            vec![Ev::Acquire(1), Ev::Wait(0), Ev::Uniforms(2), Ev::Submit(1, 2), Ev::Present(1, 2)]
        );
    }

    #[test]
    fn stale_present_still_advances_and_recreates() {
        let (tracker, _) = tracker();
        let mut backend = MockBackend::new(2);
        let mut driver = FrameDriver::new(2, 2);

        backend.presents.push_back(Err(EngineError::SwapchainStale));
        let status = driver.render_frame(&mut backend, &tracker).unwrap();
        assert_eq!(status, FrameStatus::PresentedAndRecreated { image: 0 });
        assert_eq!(driver.current_slot(), SlotId(1));
        assert_eq!(driver.recreations(), 1);
    }

    #[test]
    fn present_error_advances_and_propagates() {
        let (tracker, _) = tracker();
        let mut backend = MockBackend::new(2);
        let mut driver = FrameDriver::new(2, 2);

        backend
            .presents
            .push_back(Err(EngineError::Backend(anyhow::anyhow!("device lost"))));
        assert!(driver.render_frame(&mut backend, &tracker).is_err());
        assert_eq!(driver.current_slot(), SlotId(1));
        assert_eq!(driver.recreations(), 0);
    }

    #[test]
    fn suboptimal_acquire_presents_then_recreates() {
        let (tracker, _) = tracker();
        let mut backend = MockBackend::new(2);
        let mut driver = FrameDriver::new(2, 2);

        backend.acquires.push_back(Acquire::Suboptimal(1));
        let status = driver.render_frame(&mut backend, &tracker).unwrap();
        assert_eq!(status, FrameStatus::PresentedAndRecreated { image: 1 });
    }

    #[test]
    fn resize_flag_triggers_recreation_after_present() {
        let (tracker, _) = tracker();
        let mut backend = MockBackend::new(2);
        let mut driver = FrameDriver::new(2, 2);

        driver.resize_flag().raise();
        let status = driver.render_frame(&mut backend, &tracker).unwrap();
        assert!(matches!(status, FrameStatus::PresentedAndRecreated { .. }));
        assert!(!driver.resize_flag().is_raised());

        let status = driver.render_frame(&mut backend, &tracker).unwrap();
        assert!(matches!(status, FrameStatus::Presented { .. }));
    }

    #[test]
    fn unchanged_scene_is_not_rerecorded() {
        let (tracker, _) = tracker();
        let mut backend = MockBackend::new(2);
        let mut driver = FrameDriver::new(2, 2);

        for _ in 0..4 {
            driver.render_frame(&mut backend, &tracker).unwrap();
        }
        assert_eq!(backend.count(|e| matches!(e, Ev::Record(_))), 2);

        backend.generation += 1;
        for _ in 0..2 {
            driver.render_frame(&mut backend, &tracker).unwrap();
        }
        assert_eq!(backend.count(|e| matches!(e, Ev::Record(_))), 4);
    }

    #[test]
    fn record_all_waits_guards_and_marks_images_fresh() {
        let (tracker, _) = tracker();
        let mut backend = MockBackend::new(2);
        let mut driver = FrameDriver::new(2, 2);
        driver.render_frame(&mut backend, &tracker).unwrap();

        backend.generation += 1;
        backend.events.clear();
        driver.record_all(&mut backend, &tracker).unwrap();
        assert_eq!(backend.events, vec![Ev::Wait(0), Ev::Record(0), Ev::Record(1)]);

        backend.events.clear();
        driver.render_frame(&mut backend, &tracker).unwrap();
        assert_eq!(backend.count(|e| matches!(e, Ev::Record(_))), 0);
    }

    #[test]
    fn removal_with_two_frames_in_flight_waits_for_both() {
        let (tracker, log) = tracker();
        let mut backend = MockBackend::new(3);
        let mut driver = FrameDriver::new(3, 3);

        driver.render_frame(&mut backend, &tracker).unwrap();
        driver.render_frame(&mut backend, &tracker).unwrap();
        let in_flight = driver.in_flight();
        assert_eq!(in_flight, vec![SlotId(0), SlotId(1)]);
        tracker.mark_for_destruction(Res(42), in_flight);

        // slot 2 has nothing outstanding; its frame does not release anything
        driver.render_frame(&mut backend, &tracker).unwrap();
        assert!(log.lock().is_empty());

        // waits slot 0
        driver.render_frame(&mut backend, &tracker).unwrap();
        assert!(log.lock().is_empty());

        // waits slot 1
        driver.render_frame(&mut backend, &tracker).unwrap();
        assert_eq!(*log.lock(), vec![42]);
    }

    #[test]
    fn drain_retires_everything() {
        let (tracker, log) = tracker();
        let mut backend = MockBackend::new(2);
        let mut driver = FrameDriver::new(2, 2);
        driver.render_frame(&mut backend, &tracker).unwrap();
        driver.render_frame(&mut backend, &tracker).unwrap();
        tracker.mark_for_destruction(Res(7), driver.in_flight());

        driver.drain(&mut backend, &tracker).unwrap();
        assert_eq!(*log.lock(), vec![7]);
        assert!(driver.in_flight().is_empty());
    }
}
