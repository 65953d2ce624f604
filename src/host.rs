//! Host operating-system bindings.
//!
//! The engine never touches the host object model directly: block
//! devices, arrival notifications, boot arguments, and the boot-uuid
//! resource all come through the traits here, implemented by a thin
//! adapter on the host side.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// A handle to a block device published by the host.
///
/// Handles are owned by the host. The engine holds one only between
/// arrival and probe, and releases it once its labels have been read.
pub trait BlockDevice: Send + Sync {
    /// Total device size in bytes.
    fn byte_size(&self) -> u64;

    /// Whether this device is a leaf with no partition-like children.
    /// Only leaves are eligible as pool members.
    fn is_leaf(&self) -> bool;

    /// Stable BSD-style device name, e.g. `disk2s1`.
    fn bsd_name(&self) -> Option<String>;

    /// Media UUID, when the host publishes one.
    fn media_uuid(&self) -> Option<String>;

    /// Open the device for reading. Dropping the reader closes it.
    fn open_readonly(&self) -> Result<Box<dyn MediaReader + '_>, HostError>;
}

/// Synchronous bounded reads against an open device.
pub trait MediaReader {
    /// Read into `buf` at the given byte offset, returning the number of
    /// bytes read. A short count is not an error; callers decide whether
    /// a partial read is usable.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, HostError>;
}

/// Callback invoked once per arriving device. The host may invoke it for
/// several devices concurrently, and concurrently with the import worker.
pub type ArrivalHandler = Arc<dyn Fn(Arc<dyn BlockDevice>) + Send + Sync>;

/// First-publish subscription against the host's block-device class.
pub trait DeviceNotifier: Send + Sync {
    /// Register `handler` to run for every currently-present device and
    /// each future arrival.
    fn subscribe(&self, handler: ArrivalHandler) -> Result<Box<dyn Subscription>, HostError>;
}

pub trait Subscription: Send {
    /// Cancel the subscription. Blocks until the host guarantees no
    /// callback is still in flight.
    fn cancel(&mut self);
}

/// Boot-time facts only the platform knows.
pub trait BootEnvironment: Send + Sync {
    /// Look up a boot argument by name.
    fn boot_arg(&self, name: &str) -> Option<String>;

    /// Time since power-on.
    fn uptime(&self) -> Duration;

    /// The `boot-uuid` property of the global resource service. Present
    /// only until the root filesystem has been matched.
    fn boot_uuid(&self) -> Option<String>;
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("device error: {0}")]
    Device(String),
}
