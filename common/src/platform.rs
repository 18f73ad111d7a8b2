//! Seams between the agent core and the device it runs on.
//!
//! Everything in this crate is written against these traits so that the
//! same control logic runs on the ESP32 firmware, on a host machine, and
//! inside unit tests with scripted fakes.

use std::{
    sync::OnceLock,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use log::warn;
use thiserror::Error;

use crate::types::{InboundCommand, TelemetryValue};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("transport i/o failed: {0}")]
    Io(String),
}

/// Byte-level request/response exchange with a remote host.
pub trait Transport {
    /// Connects to `endpoint`, writes `request` and reads until the peer
    /// closes the connection. `timeout` bounds the connect and each read.
    fn exchange(
        &mut self,
        endpoint: &Endpoint,
        request: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;
}

#[derive(Debug, Error)]
#[error("publish on channel {channel} failed: {reason}")]
pub struct PublishError {
    pub channel: u8,
    pub reason: String,
}

/// Publish/subscribe capability.
///
/// Inbound commands are queued by the platform and handed out one at a
/// time from the agent's own thread, so command handling never races the
/// control loop.
pub trait PubSub {
    fn publish(&mut self, value: &TelemetryValue) -> Result<(), PublishError>;
    fn next_command(&mut self) -> Option<InboundCommand>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("range {offset}..{end} is outside the {len} byte region")]
    OutOfBounds {
        offset: usize,
        end: usize,
        len: usize,
    },
    #[error("storage backend failed: {0}")]
    Backend(String),
}

/// Fixed-size byte region that survives power loss.
pub trait PersistentStore {
    fn get(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError>;
    fn put(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
}

pub trait Clock {
    /// Seconds since the Unix epoch.
    fn wall_clock_secs(&self) -> i64;
    /// Milliseconds since an arbitrary fixed point; never goes backwards.
    fn monotonic_ms(&self) -> u64;
}

/// In-memory image of a persistent region. Backends load it once, apply
/// `put`s to the image and flush the whole image on `commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    bytes: Vec<u8>,
    dirty: bool,
}

impl MemoryRegion {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
            dirty: false,
        }
    }

    /// Builds a region of exactly `len` bytes from previously stored data,
    /// zero-filling or cutting as needed.
    pub fn from_bytes(mut bytes: Vec<u8>, len: usize) -> Self {
        bytes.resize(len, 0);
        Self {
            bytes,
            dirty: false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the image changed since it was last flushed.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Call once the backend has durably written the image.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn range(&self, offset: usize, len: usize) -> Result<std::ops::Range<usize>, StoreError> {
        let end = offset.saturating_add(len);
        if end > self.bytes.len() {
            return Err(StoreError::OutOfBounds {
                offset,
                end,
                len: self.bytes.len(),
            });
        }
        Ok(offset..end)
    }
}

impl PersistentStore for MemoryRegion {
    fn get(&mut self, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn put(&mut self, offset: usize, data: &[u8]) -> Result<(), StoreError> {
        let range = self.range(offset, data.len())?;
        if self.bytes[range.clone()] != *data {
            self.bytes[range].copy_from_slice(data);
            self.dirty = true;
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Clock backed by the operating system. Wall time comes from SNTP on the
/// device, so callers should wait for sync before trusting it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn wall_clock_secs(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX),
            Err(_) => 0,
        }
    }

    fn monotonic_ms(&self) -> u64 {
        static START: OnceLock<Instant> = OnceLock::new();
        START
            .get_or_init(Instant::now)
            .elapsed()
            .as_millis()
            .try_into()
            .unwrap_or(u64::MAX)
    }
}

/// Publishes a value, logging instead of failing. Telemetry is best-effort.
pub fn publish_or_warn<P: PubSub>(pubsub: &mut P, value: TelemetryValue) {
    if let Err(err) = pubsub.publish(&value) {
        warn!("{err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_rejects_out_of_bounds_access() {
        let mut region = MemoryRegion::new(16);
        let mut buf = [0_u8; 8];

        assert!(region.get(8, &mut buf).is_ok());
        assert!(matches!(
            region.get(9, &mut buf),
            Err(StoreError::OutOfBounds { end: 17, .. })
        ));
        assert!(region.put(12, &[1, 2, 3, 4, 5]).is_err());
    }

    #[test]
    fn region_tracks_dirty_only_on_change() {
        let mut region = MemoryRegion::from_bytes(vec![7, 7], 4);
        assert_eq!(region.as_bytes(), &[7, 7, 0, 0]);

        region.put(0, &[7, 7]).unwrap();
        assert!(!region.is_dirty());

        region.put(2, &[1]).unwrap();
        assert!(region.is_dirty());
        region.mark_clean();
        assert!(!region.is_dirty());

        let cut = MemoryRegion::from_bytes(vec![1, 2, 3, 4, 5], 3);
        assert_eq!(cut.as_bytes(), &[1, 2, 3]);
    }
}
