//! Per-device reading buffers.
//!
//! Buffers only grow at the tail and only shrink at the head, and only by
//! the length of a snapshot that was successfully uploaded. Readings that
//! arrive while an upload is in flight stay behind for the next batch.

use std::collections::{HashMap, VecDeque};

use crate::reading::Reading;

/// Ordered pending readings, keyed by device id.
#[derive(Debug, Default)]
pub struct DeviceBuffers {
    buffers: HashMap<String, VecDeque<Reading>>,
}

impl DeviceBuffers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a reading at the tail of its device buffer. Returns the new length.
    pub fn append(&mut self, reading: Reading) -> usize {
        let buffer = self.buffers.entry(reading.device_id.clone()).or_default();
        buffer.push_back(reading);
        buffer.len()
    }

    #[must_use]
    pub fn len(&self, device_id: &str) -> usize {
        self.buffers.get(device_id).map_or(0, VecDeque::len)
    }

    #[must_use]
    pub fn is_empty(&self, device_id: &str) -> bool {
        self.len(device_id) == 0
    }

    /// Copy of everything currently buffered for the device, oldest first.
    #[must_use]
    pub fn snapshot(&self, device_id: &str) -> Vec<Reading> {
        self.buffers
            .get(device_id)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop the first `count` readings. Returns how many were removed.
    ///
    /// Empty buffers are removed from the map so idle devices cost nothing.
    pub fn trim_front(&mut self, device_id: &str, count: usize) -> usize {
        let Some(buffer) = self.buffers.get_mut(device_id) else {
            return 0;
        };
        let removed = count.min(buffer.len());
        buffer.drain(..removed);
        if buffer.is_empty() {
            self.buffers.remove(device_id);
        }
        removed
    }

    /// Devices with at least one pending reading, sorted for stable output.
    #[must_use]
    pub fn pending_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self
            .buffers
            .iter()
            .filter(|(_, buffer)| !buffer.is_empty())
            .map(|(device, _)| device.clone())
            .collect();
        devices.sort();
        devices
    }

    /// Total readings buffered across all devices.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.buffers.values().map(VecDeque::len).sum()
    }
}
