//! VXLAN id allocation.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use ovnet_core::StoreError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DriverError, Result};
use crate::persist::Stores;

/// Global-store key recording every allocated VNI.
pub const VNI_KEY: &str = "overlay/vxlan-ids";

const MAX_CONFLICT_RETRIES: usize = 16;

/// Hands out VXLAN ids.
pub trait IdAllocator: Send + Sync {
    /// Allocate the next free id.
    fn next(&self) -> Result<u32>;
    /// Mark an orchestrator-supplied id as used. An id some network already
    /// holds is refused.
    fn reserve(&self, id: u32) -> Result<()>;
    fn release(&self, id: u32) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VniSet {
    ids: BTreeSet<u32>,
}

/// Lowest id in `start..=end` not present in `used`.
fn lowest_free(used: &BTreeSet<u32>, start: u32, end: u32) -> Option<u32> {
    let mut candidate = start;
    for &id in used.range(start..=end) {
        if id != candidate {
            break;
        }
        candidate = candidate.checked_add(1)?;
    }
    (candidate <= end).then_some(candidate)
}

/// Allocator backed by the global store, so every host draws from the same
/// pool. Without a global store ids are tracked in memory.
pub struct VniAllocator {
    start: u32,
    end: u32,
    stores: Arc<Stores>,
    local: Mutex<BTreeSet<u32>>,
}

impl VniAllocator {
    pub fn new(start: u32, end: u32, stores: Arc<Stores>) -> Self {
        Self {
            start,
            end,
            stores,
            local: Mutex::new(BTreeSet::new()),
        }
    }

    fn check_range(&self, id: u32) -> Result<()> {
        if id < self.start || id > self.end {
            return Err(DriverError::BadRequest(format!(
                "vxlan id {id} outside {}-{}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    /// Read-modify-write the shared id set, retrying on conflict.
    fn update<R>(&self, mut f: impl FnMut(&mut BTreeSet<u32>) -> Result<R>) -> Result<R> {
        let Some(global) = self.stores.global() else {
            return f(&mut self.local.lock());
        };

        for attempt in 0..MAX_CONFLICT_RETRIES {
            let (mut set, index) = match global.get_object::<VniSet>(VNI_KEY) {
                Ok(v) => (v.value, Some(v.index)),
                Err(StoreError::NotFound(_)) => (VniSet::default(), None),
                Err(e) => return Err(e.into()),
            };
            let result = f(&mut set.ids)?;
            match global.put_object_atomic(VNI_KEY, &set, index) {
                Ok(_) => return Ok(result),
                Err(StoreError::Conflict(_)) => {
                    debug!("VNI set changed concurrently, retrying (attempt {attempt})");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(StoreError::Conflict(VNI_KEY.to_string()).into())
    }
}

impl IdAllocator for VniAllocator {
    fn next(&self) -> Result<u32> {
        let (start, end) = (self.start, self.end);
        self.update(|ids| {
            let id = lowest_free(ids, start, end).ok_or_else(|| {
                DriverError::Internal(format!("no free vxlan id in {start}-{end}"))
            })?;
            ids.insert(id);
            Ok(id)
        })
    }

    fn reserve(&self, id: u32) -> Result<()> {
        self.check_range(id)?;
        self.update(|ids| {
            if !ids.insert(id) {
                return Err(DriverError::Forbidden(format!("vxlan id {id} is already in use")));
            }
            Ok(())
        })
    }

    fn release(&self, id: u32) -> Result<()> {
        self.update(|ids| {
            if !ids.remove(&id) {
                warn!("Releasing vxlan id {id} that was not allocated");
            }
            Ok(())
        })
    }
}

/// Deterministic allocator handing out a fixed sequence.
#[derive(Debug, Default)]
pub struct SequenceAllocator {
    ids: Mutex<VecDeque<u32>>,
    released: Mutex<Vec<u32>>,
}

impl SequenceAllocator {
    pub fn new(ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            ids: Mutex::new(ids.into_iter().collect()),
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn released(&self) -> Vec<u32> {
        self.released.lock().clone()
    }
}

impl IdAllocator for SequenceAllocator {
    fn next(&self) -> Result<u32> {
        self.ids
            .lock()
            .pop_front()
            .ok_or_else(|| DriverError::Internal("vxlan id sequence exhausted".into()))
    }

    fn reserve(&self, _id: u32) -> Result<()> {
        Ok(())
    }

    fn release(&self, id: u32) -> Result<()> {
        self.released.lock().push(id);
        Ok(())
    }
}
