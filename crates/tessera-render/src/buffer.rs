// SPDX-License-Identifier: CEPL-1.0
//! Host-visible buffers that follow CPU-side data.
//!
//! A [`DynamicBuffer`] is lazily allocated on the first non-empty upload.
//! Same-length updates are copied into the persistent mapping in place;
//! any length change drains the device, retires the old allocation through
//! the [`LifetimeTracker`] and allocates a fresh one.

use std::fmt::Debug;
use std::marker::PhantomData;

use bytemuck::Pod;
use tessera_core::Result;

use crate::lifetime::{LifetimeTracker, TrackedResource};
use crate::sync::SlotId;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Uniform,
}

/// Backend memory operations needed by [`DynamicBuffer`].
pub trait BufferAllocator {
    /// Owned allocation. Also the resource type of the lifetime tracker.
    type Allocation: TrackedResource;
    /// Raw handle recorded into command buffers.
    type Handle: Copy + Debug + PartialEq;

    /// Creates a mapped allocation of exactly `contents.len()` bytes holding `contents`.
    fn allocate(&mut self, usage: BufferUsage, contents: &[u8]) -> Result<Self::Allocation>;

    /// Overwrites the mapping of `allocation`. Length always matches.
    fn write(&mut self, allocation: &Self::Allocation, contents: &[u8]) -> Result<()>;

    /// Blocks until the device has finished all submitted work.
    fn wait_idle(&mut self) -> Result<()>;

    fn handle(allocation: &Self::Allocation) -> Self::Handle;
}

/// Everything a mutation needs: the allocator, the tracker that receives
/// retired allocations, and the slots currently in flight.
pub struct GpuContext<'a, A: BufferAllocator> {
    pub allocator: &'a mut A,
    pub tracker: &'a LifetimeTracker<A::Allocation>,
    pub in_flight: &'a [SlotId],
}

impl<'a, A: BufferAllocator> GpuContext<'a, A> {
    pub fn new(
        allocator: &'a mut A,
        tracker: &'a LifetimeTracker<A::Allocation>,
        in_flight: &'a [SlotId],
    ) -> Self {
        Self {
            allocator,
            tracker,
            in_flight,
        }
    }

    pub fn retire(&self, allocation: A::Allocation) {
        self.tracker
            .mark_for_destruction(allocation, self.in_flight.iter().copied());
    }

    pub fn retire_all(&self, allocations: impl IntoIterator<Item = A::Allocation>) {
        self.tracker.mark_all(allocations, self.in_flight);
    }
}

/// What [`DynamicBuffer::set_data`] did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufferUpdate {
    /// Nothing to do: empty data on an unallocated buffer.
    Unchanged,
    Created,
    InPlace,
    Reallocated,
    /// Emptied; the allocation went to the tracker.
    Released,
}

impl BufferUpdate {
    /// True when the buffer handle changed, so recorded commands are stale.
    pub fn invalidates_commands(self) -> bool {
        matches!(self, Self::Created | Self::Reallocated | Self::Released)
    }
}

pub struct DynamicBuffer<T: Pod, A: BufferAllocator> {
    usage: BufferUsage,
    allocation: Option<A::Allocation>,
    len: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Pod, A: BufferAllocator> DynamicBuffer<T, A> {
    pub fn new(usage: BufferUsage) -> Self {
        Self {
            usage,
            allocation: None,
            len: 0,
            _marker: PhantomData,
        }
    }

    pub fn vertex() -> Self {
        Self::new(BufferUsage::Vertex)
    }

    pub fn uniform() -> Self {
        Self::new(BufferUsage::Uniform)
    }

    pub fn set_data(&mut self, ctx: &mut GpuContext<'_, A>, data: &[T]) -> Result<BufferUpdate> {
        let bytes: &[u8] = bytemuck::cast_slice(data);

        match self.allocation.take() {
            None if data.is_empty() => Ok(BufferUpdate::Unchanged),
            None => {
                self.allocation = Some(ctx.allocator.allocate(self.usage, bytes)?);
                self.len = data.len();
                Ok(BufferUpdate::Created)
            }
            Some(old) if data.is_empty() => {
                self.len = 0;
                ctx.retire(old);
                Ok(BufferUpdate::Released)
            }
            Some(current) if data.len() == self.len => {
                let written = ctx.allocator.write(&current, bytes);
                self.allocation = Some(current);
                written?;
                Ok(BufferUpdate::InPlace)
            }
            Some(old) => {
                if let Err(e) = ctx.allocator.wait_idle() {
                    self.allocation = Some(old);
                    return Err(e);
                }
                self.len = 0;
                ctx.retire(old);
                self.allocation = Some(ctx.allocator.allocate(self.usage, bytes)?);
                self.len = data.len();
                Ok(BufferUpdate::Reallocated)
            }
        }
    }

    /// Retires the allocation, if any. Returns whether there was one.
    pub fn destroy(&mut self, ctx: &GpuContext<'_, A>) -> bool {
        match self.take_allocation() {
            Some(allocation) => {
                ctx.retire(allocation);
                true
            }
            None => false,
        }
    }

    /// Detaches the allocation so the caller can retire it as part of a batch.
    pub fn take_allocation(&mut self) -> Option<A::Allocation> {
        self.len = 0;
        self.allocation.take()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn allocation(&self) -> Option<&A::Allocation> {
        self.allocation.as_ref()
    }

    pub fn handle(&self) -> Option<A::Handle> {
        self.allocation.as_ref().map(A::handle)
    }
}

impl<T: Pod, A: BufferAllocator> Debug for DynamicBuffer<T, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicBuffer")
            .field("usage", &self.usage)
            .field("len", &self.len)
            .field("handle", &self.handle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Call, Harness};
    use tessera_math::Vertex;

    fn verts(n: usize, seed: f32) -> Vec<Vertex> {
        (0..n)
            .map(|i| Vertex::new([seed + i as f32, 0.0, 0.0], [1.0; 3], [0.0; 3]))
            .collect()
    }

    #[test]
    fn empty_data_on_fresh_buffer_defers_allocation() {
        let mut h = Harness::new();
        let mut buf = DynamicBuffer::<Vertex, _>::vertex();
        let update = buf.set_data(&mut h.ctx(&[]), &[]).unwrap();
        assert_eq!(update, BufferUpdate::Unchanged);
        assert!(buf.handle().is_none());
        assert!(h.allocator.calls.is_empty());
    }

    #[test]
    fn same_length_update_keeps_allocation() {
        let mut h = Harness::new();
        let mut buf = DynamicBuffer::<Vertex, _>::vertex();
        let in_flight = [SlotId(0), SlotId(1)];

        assert_eq!(buf.set_data(&mut h.ctx(&in_flight), &verts(3, 0.0)).unwrap(), BufferUpdate::Created);
        let first = buf.handle();

        let replacement = verts(3, 10.0);
        for _ in 0..4 {
            let update = buf.set_data(&mut h.ctx(&in_flight), &replacement).unwrap();
            assert_eq!(update, BufferUpdate::InPlace);
            assert_eq!(buf.handle(), first);
        }

        let contents = buf.allocation().unwrap().contents();
        assert_eq!(contents, bytemuck::cast_slice::<Vertex, u8>(&replacement));
        assert_eq!(h.tracker.pending_count(), 0);
        assert!(!h.allocator.calls.contains(&Call::WaitIdle));
    }

    #[test]
    fn resize_waits_idle_then_retires_old_allocation() {
        let mut h = Harness::new();
        let mut buf = DynamicBuffer::<Vertex, _>::vertex();
        let in_flight = [SlotId(0), SlotId(1)];

        buf.set_data(&mut h.ctx(&in_flight), &verts(3, 0.0)).unwrap();
        let old = buf.handle().unwrap();

        let update = buf.set_data(&mut h.ctx(&in_flight), &verts(5, 0.0)).unwrap();
        assert_eq!(update, BufferUpdate::Reallocated);
        assert_eq!(buf.len(), 5);
        let new = buf.handle().unwrap();
        assert_ne!(old, new);
        assert_eq!(buf.allocation().unwrap().contents().len(), 5 * std::mem::size_of::<Vertex>());

        // idle wait happens before the replacement allocation
        let wait = h.allocator.calls.iter().position(|c| *c == Call::WaitIdle).unwrap();
        let alloc = h.allocator.calls.iter().position(|c| matches!(c, Call::Allocate { id, .. } if *id == new)).unwrap();
        assert!(wait < alloc);

        assert!(h.tracker.is_pending(old));
        h.tracker.on_frame_retired(SlotId(0));
        assert!(h.released().is_empty());
        h.tracker.on_frame_retired(SlotId(1));
        assert_eq!(h.released(), vec![old]);
    }

    #[test]
    fn clearing_data_retires_allocation() {
        let mut h = Harness::new();
        let mut buf = DynamicBuffer::<Vertex, _>::vertex();
        buf.set_data(&mut h.ctx(&[SlotId(1)]), &verts(2, 0.0)).unwrap();
        let old = buf.handle().unwrap();

        let update = buf.set_data(&mut h.ctx(&[SlotId(1)]), &[]).unwrap();
        assert_eq!(update, BufferUpdate::Released);
        assert!(buf.is_empty());
        assert!(buf.handle().is_none());
        assert!(h.tracker.is_pending(old));
    }

    #[test]
    fn destroy_without_frames_in_flight_releases_now() {
        let mut h = Harness::new();
        let mut buf = DynamicBuffer::<Vertex, _>::vertex();
        buf.set_data(&mut h.ctx(&[]), &verts(4, 0.0)).unwrap();
        let id = buf.handle().unwrap();

        assert!(buf.destroy(&h.ctx(&[])));
        assert_eq!(h.released(), vec![id]);
        assert!(!buf.destroy(&h.ctx(&[])));
    }

    #[test]
    fn failed_write_keeps_allocation() {
        let mut h = Harness::new();
        let mut buf = DynamicBuffer::<Vertex, _>::vertex();
        buf.set_data(&mut h.ctx(&[]), &verts(2, 0.0)).unwrap();
        h.allocator.fail_writes = true;
        assert!(buf.set_data(&mut h.ctx(&[]), &verts(2, 1.0)).is_err());
        assert!(buf.handle().is_some());
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn failed_reallocation_leaves_buffer_empty_with_old_allocation_pending() {
        let mut h = Harness::new();
        let in_flight = [SlotId(0)];
        let mut buf = DynamicBuffer::<Vertex, _>::vertex();
        buf.set_data(&mut h.ctx(&in_flight), &verts(2, 0.0)).unwrap();

        h.allocator.fail_allocs = true;
        assert!(buf.set_data(&mut h.ctx(&in_flight), &verts(3, 0.0)).is_err());
        assert!(buf.handle().is_none());
        assert!(buf.is_empty());
        assert_eq!(h.tracker.pending_count(), 1);

        h.tracker.on_frame_retired(SlotId(0));
        assert_eq!(h.released(), vec![1]);
    }
}
