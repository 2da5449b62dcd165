//! Targeted tracing for individual devices.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::PoisonError;

use tracing::warn;

use crate::device::Device;

/// Set of device ids whose traffic is logged at warn level, so it shows up
/// without turning on debug logging everywhere.
#[derive(Debug, Default)]
pub struct DeviceWatcher {
    watched: Mutex<HashSet<String>>,
}

impl DeviceWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watch(&self, device_id: &str) {
        self.lock().insert(device_id.to_string());
    }

    pub fn unwatch(&self, device_id: &str) {
        self.lock().remove(device_id);
    }

    pub fn is_watched(&self, device_id: &str) -> bool {
        self.lock().contains(device_id)
    }

    pub fn watched(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Log `message` if the device is watched, with the device's current
    /// status when a device is given.
    pub fn report_message(&self, device_id: &str, message: &str, device: Option<&Device>) {
        self.report_with(device_id, device, || message.to_string());
    }

    /// Like [`report_message`](Self::report_message), building the message
    /// only for watched devices.
    pub fn report_with(&self, device_id: &str, device: Option<&Device>, message: impl FnOnce() -> String) {
        if !self.is_watched(device_id) {
            return;
        }
        let message = message();
        match device {
            Some(device) => warn!(
                "WD: {} ({}): {} status={:?}",
                device_id,
                device.name,
                message,
                device.status.snapshot()
            ),
            None => warn!("WD: {}: {}", device_id, message),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.watched.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
