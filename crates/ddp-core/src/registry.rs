//! ---
//! ddp_section: "01-core-functionality"
//! ddp_subsection: "module"
//! ddp_type: "source"
//! ddp_scope: "code"
//! ddp_description: "Device id to digital device slot table."
//! ddp_version: "v0.0.0-prealpha"
//! ddp_owner: "tbd"
//! ---
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ddp_msg::DeviceId;
use tokio::task::AbortHandle;

use crate::device::DeviceHandle;

/// A running digital device as seen by the registry.
#[derive(Debug)]
pub struct ActiveDevice {
    pub handle: DeviceHandle,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    abort: AbortHandle,
}

impl ActiveDevice {
    pub fn new(handle: DeviceHandle, generation: u64, abort: AbortHandle) -> Self {
        Self {
            handle,
            generation,
            started_at: Utc::now(),
            abort,
        }
    }

    /// Stop the device task. Safe to call any number of times.
    pub fn terminate(&self) {
        self.abort.abort();
    }
}

/// A device id that exhausted its restart budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedDevice {
    pub failures: u32,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum Slot {
    Active(ActiveDevice),
    Failed(FailedDevice),
}

/// Slot table keyed by device id. Holds at most one slot per id; callers
/// serialise access.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    slots: HashMap<DeviceId, Slot>,
    next_generation: u64,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, device_id: DeviceId) -> Option<&Slot> {
        self.slots.get(&device_id)
    }

    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// Claim the slot for a new device. Returns `false` and leaves the table
    /// unchanged when the slot is taken.
    pub fn insert_if_absent(&mut self, device_id: DeviceId, device: ActiveDevice) -> bool {
        if self.slots.contains_key(&device_id) {
            return false;
        }
        self.slots.insert(device_id, Slot::Active(device));
        true
    }

    /// Remove and return the active device for `device_id`, if any.
    pub fn take_active(&mut self, device_id: DeviceId) -> Option<ActiveDevice> {
        match self.slots.get(&device_id) {
            Some(Slot::Active(_)) => match self.slots.remove(&device_id) {
                Some(Slot::Active(device)) => Some(device),
                _ => None,
            },
            _ => None,
        }
    }

    /// Release the slot only if it still belongs to `generation`.
    pub fn release(&mut self, device_id: DeviceId, generation: u64) -> bool {
        match self.slots.get(&device_id) {
            Some(Slot::Active(device)) if device.generation == generation => {
                self.slots.remove(&device_id);
                true
            }
            _ => false,
        }
    }

    /// Mark a vacant id as permanently failed. An occupied slot is left alone.
    pub fn mark_failed(&mut self, device_id: DeviceId, failures: u32) -> bool {
        if self.slots.contains_key(&device_id) {
            return false;
        }
        self.slots.insert(
            device_id,
            Slot::Failed(FailedDevice {
                failures,
                failed_at: Utc::now(),
            }),
        );
        true
    }

    pub fn clear_failed(&mut self, device_id: DeviceId) -> bool {
        if matches!(self.slots.get(&device_id), Some(Slot::Failed(_))) {
            self.slots.remove(&device_id);
            true
        } else {
            false
        }
    }

    pub fn lookup(&self, device_id: DeviceId) -> Option<DeviceHandle> {
        match self.slots.get(&device_id) {
            Some(Slot::Active(device)) => Some(device.handle.clone()),
            _ => None,
        }
    }

    pub fn active_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Active(_)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn failed_ids(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Failed(_)))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    pub fn active_count(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| matches!(slot, Slot::Active(_)))
            .count()
    }

    /// Remove every active device, leaving failed markers in place.
    pub fn drain_active(&mut self) -> Vec<ActiveDevice> {
        let ids = self.active_ids();
        ids.into_iter()
            .filter_map(|id| self.take_active(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationCoefficients;
    use crate::device::{spawn_device, DigitalDevice};
    use crate::sink::{TracingActuator, TracingSampleSink};
    use ddp_common::config::ThrottleAlgorithm;
    use ddp_msg::WireFormat;
    use ddp_rt::RateLimiter;
    use std::sync::Arc;
    use std::time::Duration;

    fn active(id: u8, generation: u64) -> ActiveDevice {
        let device = DigitalDevice::new(
            DeviceId(id),
            CalibrationCoefficients::IDENTITY,
            WireFormat::default(),
            RateLimiter::new(10, Duration::from_secs(1), ThrottleAlgorithm::SlidingWindow),
            Arc::new(TracingSampleSink),
            Arc::new(TracingActuator),
        );
        let (handle, task) = spawn_device(device, 1, Duration::from_millis(10), None);
        ActiveDevice::new(handle, generation, task.abort_handle())
    }

    #[tokio::test]
    async fn one_slot_per_device_id() {
        let mut registry = DeviceRegistry::new();
        let first = registry.next_generation();
        assert!(registry.insert_if_absent(DeviceId(1), active(1, first)));
        let second = registry.next_generation();
        assert!(!registry.insert_if_absent(DeviceId(1), active(1, second)));
        assert_eq!(registry.active_ids(), vec![DeviceId(1)]);
        assert_eq!(
            registry.lookup(DeviceId(1)).map(|handle| handle.device_id()),
            Some(DeviceId(1))
        );
    }

    #[tokio::test]
    async fn stale_generation_cannot_release_a_replacement() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.insert_if_absent(DeviceId(2), active(2, 1)));
        let stale = registry.take_active(DeviceId(2)).unwrap();
        stale.terminate();
        stale.terminate();
        assert!(registry.insert_if_absent(DeviceId(2), active(2, 2)));

        assert!(!registry.release(DeviceId(2), 1));
        assert_eq!(registry.active_count(), 1);
        assert!(registry.release(DeviceId(2), 2));
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn failed_markers_survive_drain_and_block_inserts() {
        let mut registry = DeviceRegistry::new();
        assert!(registry.mark_failed(DeviceId(3), 4));
        assert!(!registry.insert_if_absent(DeviceId(3), active(3, 1)));
        assert!(registry.insert_if_absent(DeviceId(4), active(4, 2)));

        let drained = registry.drain_active();
        assert_eq!(drained.len(), 1);
        assert_eq!(registry.failed_ids(), vec![DeviceId(3)]);
        assert!(registry.lookup(DeviceId(3)).is_none());

        assert!(registry.clear_failed(DeviceId(3)));
        assert!(!registry.clear_failed(DeviceId(3)));
    }
}
