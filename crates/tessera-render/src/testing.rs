// SPDX-License-Identifier: CEPL-1.0
//! In-memory backend used by the unit tests.

use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::Mutex;
use tessera_core::{EngineError, Result};

use crate::buffer::{BufferAllocator, BufferUsage, GpuContext};
use crate::lifetime::{LifetimeTracker, TrackedResource};
use crate::sync::SlotId;

#[derive(Debug)]
pub(crate) struct MockBuffer {
    pub id: u64,
    pub usage: BufferUsage,
    bytes: RefCell<Vec<u8>>,
}

impl MockBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.borrow().clone()
    }
}

impl TrackedResource for MockBuffer {
    type Key = u64;
    fn key(&self) -> u64 {
        self.id
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    Allocate { id: u64, len: usize },
    Write { id: u64 },
    WaitIdle,
}

#[derive(Default)]
pub(crate) struct MockAllocator {
    next_id: u64,
    pub calls: Vec<Call>,
    pub fail_writes: bool,
    pub fail_allocs: bool,
}

impl BufferAllocator for MockAllocator {
    type Allocation = MockBuffer;
    type Handle = u64;

    fn allocate(&mut self, usage: BufferUsage, contents: &[u8]) -> Result<MockBuffer> {
        if self.fail_allocs {
            return Err(EngineError::Backend(anyhow::anyhow!("out of device memory")));
        }
        self.next_id += 1;
        self.calls.push(Call::Allocate {
            id: self.next_id,
            len: contents.len(),
        });
        Ok(MockBuffer {
            id: self.next_id,
            usage,
            bytes: RefCell::new(contents.to_vec()),
        })
    }

    fn write(&mut self, allocation: &MockBuffer, contents: &[u8]) -> Result<()> {
        if self.fail_writes {
            return Err(EngineError::Backend(anyhow::anyhow!("mapping lost")));
        }
        self.calls.push(Call::Write { id: allocation.id });
        allocation.bytes.borrow_mut().copy_from_slice(contents);
        Ok(())
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.calls.push(Call::WaitIdle);
        Ok(())
    }

    fn handle(allocation: &MockBuffer) -> u64 {
        allocation.id
    }
}

pub(crate) struct Harness {
    pub allocator: MockAllocator,
    pub tracker: LifetimeTracker<MockBuffer>,
    released: Arc<Mutex<Vec<u64>>>,
}

impl Harness {
    pub fn new() -> Self {
        let released = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&released);
        Self {
            allocator: MockAllocator::default(),
            tracker: LifetimeTracker::new(move |b: MockBuffer| sink.lock().push(b.id)),
            released,
        }
    }

    pub fn ctx<'a>(&'a mut self, in_flight: &'a [SlotId]) -> GpuContext<'a, MockAllocator> {
        GpuContext::new(&mut self.allocator, &self.tracker, in_flight)
    }

    pub fn released(&self) -> Vec<u64> {
        self.released.lock().clone()
    }
}
