// SPDX-License-Identifier: CEPL-1.0
//! Deferred destruction of GPU resources.
//!
//! Removing a buffer or texture from the CPU side does not mean the GPU is
//! done with it: command buffers submitted in earlier frames may still read
//! from it. [`LifetimeTracker`] holds such resources until every frame slot
//! that was in flight when the resource was retired has completed.
//!
//! Each retired resource becomes one entry holding the set of slots that
//! could still reference it. [`LifetimeTracker::on_frame_retired`] strips a
//! slot from every entry; an entry whose set runs empty is released through
//! the [`Releaser`] and dropped from the registry. An entry created with an
//! empty set is released on the spot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::sync::SlotId;

/// A GPU resource that can be handed to the tracker.
pub trait TrackedResource: Send + 'static {
    /// Identity of the underlying handle. Registering the same key twice
    /// while the first registration is still pending is a logic error.
    type Key: Copy + Eq + Hash + Debug + Send + 'static;

    fn key(&self) -> Self::Key;
}

/// Performs the physical release once a resource is unreferenced.
pub trait Releaser<R>: Send {
    fn release(&mut self, resource: R);
}

impl<R, F> Releaser<R> for F
where
    F: FnMut(R) + Send,
{
    fn release(&mut self, resource: R) {
        self(resource)
    }
}

/// Handle to a pending entry, returned by [`LifetimeTracker::mark_for_destruction`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryState {
    /// Some slot that was in flight at mark time has not retired yet.
    Pending,
    /// Every such slot retired; the resource is about to be released.
    Safe,
}

struct PendingDestruction<R: TrackedResource> {
    unsafe_slots: BTreeSet<SlotId>,
    state: EntryState,
    resource: Option<R>,
}

struct Registry<R: TrackedResource> {
    entries: BTreeMap<EntryId, PendingDestruction<R>>,
    keys: HashMap<R::Key, EntryId>,
    next_id: u64,
    released: u64,
    releaser: Box<dyn Releaser<R>>,
}

impl<R: TrackedResource> Registry<R> {
    fn insert(&mut self, resource: R, slots: BTreeSet<SlotId>) -> Option<EntryId> {
        let key = resource.key();
        if let Some(existing) = self.keys.get(&key) {
            panic!("resource {key:?} registered for destruction twice (pending as {existing:?})");
        }

        if slots.is_empty() {
            trace!(?key, "released immediately");
            self.release(resource);
            return None;
        }

        let id = EntryId(self.next_id);
        self.next_id += 1;
        trace!(?key, ?id, ?slots, "deferred destruction");
        self.keys.insert(key, id);
        self.entries.insert(
            id,
            PendingDestruction {
                unsafe_slots: slots,
                state: EntryState::Pending,
                resource: Some(resource),
            },
        );
        Some(id)
    }

    fn retire(&mut self, slot: SlotId) -> usize {
        for entry in self.entries.values_mut() {
            if entry.unsafe_slots.remove(&slot) && entry.unsafe_slots.is_empty() {
                entry.state = EntryState::Safe;
            }
        }

        let safe: Vec<EntryId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Safe)
            .map(|(id, _)| *id)
            .collect();

        for id in &safe {
            if let Some(mut entry) = self.entries.remove(id) {
                let Some(resource) = entry.resource.take() else {
                    panic!("pending entry {id:?} lost its resource before release");
                };
                self.keys.remove(&resource.key());
                trace!(?id, ?slot, "released after retirement");
                self.release(resource);
            }
        }
        safe.len()
    }

    fn release(&mut self, resource: R) {
        self.released += 1;
        self.releaser.release(resource);
    }

    fn drain(&mut self) -> usize {
        let entries = std::mem::take(&mut self.entries);
        self.keys.clear();
        let mut count = 0;
        for (id, mut entry) in entries {
            let Some(resource) = entry.resource.take() else {
                panic!("pending entry {id:?} lost its resource before release");
            };
            self.release(resource);
            count += 1;
        }
        count
    }
}

impl<R: TrackedResource> Drop for Registry<R> {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            warn!(
                pending = self.entries.len(),
                "lifetime tracker dropped with unreleased resources"
            );
        }
    }
}

/// Shared registry of resources awaiting safe destruction.
///
/// Cloning yields another handle to the same registry, so a loader thread
/// and the render loop can both retire resources. All operations take one
/// lock for their whole read-modify-write and never block on the GPU.
pub struct LifetimeTracker<R: TrackedResource> {
    inner: Arc<Mutex<Registry<R>>>,
}

impl<R: TrackedResource> Clone for LifetimeTracker<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: TrackedResource> LifetimeTracker<R> {
    pub fn new(releaser: impl Releaser<R> + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                entries: BTreeMap::new(),
                keys: HashMap::new(),
                next_id: 0,
                released: 0,
                releaser: Box::new(releaser),
            })),
        }
    }

    /// Retires `resource`. `in_flight` must be every slot that may still be
    /// executing work recorded against it. Returns `None` when the set is
    /// empty and the resource was released immediately.
    ///
    /// # Panics
    /// If the same resource is already pending destruction.
    pub fn mark_for_destruction(
        &self,
        resource: R,
        in_flight: impl IntoIterator<Item = SlotId>,
    ) -> Option<EntryId> {
        let slots: BTreeSet<SlotId> = in_flight.into_iter().collect();
        self.inner.lock().insert(resource, slots)
    }

    /// Retires several resources against the same in-flight set under one lock.
    pub fn mark_all(&self, resources: impl IntoIterator<Item = R>, in_flight: &[SlotId]) {
        let slots: BTreeSet<SlotId> = in_flight.iter().copied().collect();
        let mut registry = self.inner.lock();
        for resource in resources {
            registry.insert(resource, slots.clone());
        }
    }

    /// Records that `slot`'s submission completed. Returns how many
    /// resources were released as a result.
    pub fn on_frame_retired(&self, slot: SlotId) -> usize {
        self.inner.lock().retire(slot)
    }

    /// Releases everything still pending. Only valid once the device is idle.
    pub fn release_all(&self) -> usize {
        self.inner.lock().drain()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_pending(&self, key: R::Key) -> bool {
        self.inner.lock().keys.contains_key(&key)
    }

    /// Slots still blocking release of `id`, or `None` once released.
    pub fn unsafe_slots(&self, id: EntryId) -> Option<Vec<SlotId>> {
        self.inner
            .lock()
            .entries
            .get(&id)
            .map(|e| e.unsafe_slots.iter().copied().collect())
    }

    pub fn state(&self, id: EntryId) -> Option<EntryState> {
        self.inner.lock().entries.get(&id).map(|e| e.state)
    }

    /// Number of resources released since creation.
    pub fn released_count(&self) -> u64 {
        self.inner.lock().released
    }
}
