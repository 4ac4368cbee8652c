//! Live device set and counters
//!
//! The registry is the single writer of device state: the scheduler and the
//! executor mutate devices only through these methods, and every transition
//! emits a typed delta. List order is preserved because the stagger at
//! `start()` depends on it.

use std::collections::HashMap;

use crate::models::{Device, DeviceStatus};
use crate::notify::{Notification, Notifier, StatusDelta};
use crate::state::{new_state, Shared};

#[derive(Clone)]
pub struct DeviceRegistry {
    devices: Shared<Vec<Device>>,
    notifier: Notifier,
}

impl DeviceRegistry {
    pub fn new(notifier: Notifier) -> Self {
        Self {
            devices: new_state(Vec::new()),
            notifier,
        }
    }

    /// Replace the whole set (initial load / full reload). Counters start
    /// from zero; a reconcile goes through [`apply_update`](Self::apply_update).
    pub fn replace_all(&self, devices: Vec<Device>) {
        *self.devices.lock() = devices;
        self.notify_set();
    }

    pub fn snapshot(&self) -> Vec<Device> {
        self.devices.lock().clone()
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.devices.lock().iter().find(|d| d.id == id).cloned()
    }

    pub fn active_devices(&self) -> Vec<Device> {
        self.devices
            .lock()
            .iter()
            .filter(|d| d.active)
            .cloned()
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.devices.lock().len()
    }

    pub fn insert(&self, device: Device) {
        let delta = {
            let mut devices = self.devices.lock();
            // id uniqueness invariant: a re-added id replaces, never duplicates
            devices.retain(|d| d.id != device.id);
            let delta = StatusDelta::of(&device);
            devices.push(device);
            delta
        };
        self.notifier.send(Notification::DeviceDelta(delta));
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut devices = self.devices.lock();
        let before = devices.len();
        devices.retain(|d| d.id != id);
        devices.len() != before
    }

    /// Replace the configuration fields of an existing device while keeping
    /// its counters, status and countdown. Returns the merged device.
    pub fn apply_update(&self, incoming: Device) -> Option<Device> {
        let mut devices = self.devices.lock();
        let current = devices.iter_mut().find(|d| d.id == incoming.id)?;
        current.name = incoming.name;
        current.target = incoming.target;
        current.start_index = incoming.start_index;
        current.count = incoming.count;
        current.timeout_ms = incoming.timeout_ms;
        current.interval_seconds = incoming.interval_seconds;
        current.active = incoming.active;
        Some(current.clone())
    }

    pub fn set_status(&self, id: &str, status: DeviceStatus) {
        let delta = {
            let mut devices = self.devices.lock();
            let Some(device) = devices.iter_mut().find(|d| d.id == id) else {
                return;
            };
            device.status = status;
            StatusDelta::of(device)
        };
        self.notifier.send(Notification::DeviceDelta(delta));
    }

    /// Arm the countdown: the device will fire in `seconds`.
    pub fn arm_countdown(&self, id: &str, seconds: u32) {
        let delta = {
            let mut devices = self.devices.lock();
            let Some(device) = devices.iter_mut().find(|d| d.id == id) else {
                return;
            };
            device.next_read_in = Some(seconds);
            StatusDelta::of(device)
        };
        self.notifier.send(Notification::DeviceDelta(delta));
    }

    /// Clear the countdown of one device (its timer was cancelled).
    pub fn clear_countdown(&self, id: &str) {
        let mut devices = self.devices.lock();
        if let Some(device) = devices.iter_mut().find(|d| d.id == id) {
            device.next_read_in = None;
        }
    }

    /// Clear every countdown (scheduler fully stopped).
    pub fn clear_all_countdowns(&self) {
        let mut devices = self.devices.lock();
        for device in devices.iter_mut() {
            device.next_read_in = None;
        }
    }

    /// Record the outcome of one read: bump exactly one counter and settle
    /// the status (`Active` after success, `Error` after failure).
    pub fn record_read_outcome(&self, id: &str, success: bool) {
        let delta = {
            let mut devices = self.devices.lock();
            let Some(device) = devices.iter_mut().find(|d| d.id == id) else {
                return;
            };
            if success {
                device.success_count += 1;
                device.status = DeviceStatus::Active;
            } else {
                device.fail_count += 1;
                device.status = DeviceStatus::Error;
            }
            StatusDelta::of(device)
        };
        self.notifier.send(Notification::DeviceDelta(delta));
    }

    /// One second elapsed: decrement every armed countdown that is still
    /// above zero and publish the tick map.
    pub fn tick_countdowns(&self) -> HashMap<String, u32> {
        let map = {
            let mut devices = self.devices.lock();
            let mut map = HashMap::new();
            for device in devices.iter_mut() {
                if let Some(secs) = device.next_read_in {
                    let next = secs.saturating_sub(1);
                    device.next_read_in = Some(next);
                    map.insert(device.id.clone(), next);
                }
            }
            map
        };
        self.notifier.send(Notification::Countdowns(map.clone()));
        map
    }

    pub fn notify_set(&self) {
        self.notifier.send(Notification::DeviceSet(self.snapshot()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BusTarget;

    fn device(id: &str, interval: u32) -> Device {
        Device {
            id: id.to_string(),
            name: format!("dev {id}"),
            target: BusTarget {
                host: "10.0.0.1".into(),
                port: 502,
                unit_id: 1,
            },
            start_index: 0,
            count: 4,
            timeout_ms: 1000,
            interval_seconds: interval,
            active: true,
            status: DeviceStatus::Active,
            next_read_in: None,
            success_count: 0,
            fail_count: 0,
        }
    }

    fn registry() -> DeviceRegistry {
        let (notifier, rx) = Notifier::channel();
        std::mem::forget(rx); // keep the channel open for the test
        DeviceRegistry::new(notifier)
    }

    #[test]
    fn counters_only_grow_and_settle_status() {
        let reg = registry();
        reg.replace_all(vec![device("a", 10)]);

        reg.record_read_outcome("a", true);
        reg.record_read_outcome("a", false);
        reg.record_read_outcome("a", true);

        let dev = reg.get("a").unwrap();
        assert_eq!(dev.success_count, 2);
        assert_eq!(dev.fail_count, 1);
        assert_eq!(dev.status, DeviceStatus::Active);
    }

    #[test]
    fn apply_update_preserves_counters() {
        let reg = registry();
        reg.replace_all(vec![device("a", 10)]);
        reg.record_read_outcome("a", true);

        let mut incoming = device("a", 30);
        incoming.active = false;
        let merged = reg.apply_update(incoming).unwrap();

        assert_eq!(merged.success_count, 1);
        assert_eq!(merged.interval_seconds, 30);
        assert!(!merged.active);
    }

    #[test]
    fn tick_decrements_only_armed_countdowns() {
        let reg = registry();
        reg.replace_all(vec![device("a", 10), device("b", 20)]);
        reg.arm_countdown("a", 3);

        let map = reg.tick_countdowns();
        assert_eq!(map.get("a"), Some(&2));
        assert!(!map.contains_key("b"));

        // sits at zero, never goes negative
        reg.tick_countdowns();
        reg.tick_countdowns();
        let map = reg.tick_countdowns();
        assert_eq!(map.get("a"), Some(&0));
    }

    #[test]
    fn insert_replaces_same_id() {
        let reg = registry();
        reg.replace_all(vec![device("a", 10)]);
        reg.record_read_outcome("a", true);

        reg.insert(device("a", 15));
        assert_eq!(reg.len(), 1);
        // a re-added id is a new device: counters are gone
        assert_eq!(reg.get("a").unwrap().success_count, 0);
    }

    #[test]
    fn preserves_list_order() {
        let reg = registry();
        reg.replace_all(vec![device("a", 10), device("b", 20), device("c", 30)]);
        let ids: Vec<_> = reg.snapshot().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
