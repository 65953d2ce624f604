//! Synthetic boot device publication.
//!
//! After a successful import the host still expects a block device to
//! match its boot volume against. We stand up a virtual device whose
//! product string names the boot dataset, stamp its media with the
//! `boot-uuid` the firmware recorded, and let the host's boot matcher
//! bind to it. The device stores nothing: reads are zero-filled and
//! writes are accepted and forgotten, because only the matching matters.
//!
//! The host object model stays on the host side of [`BootDeviceHost`];
//! this module only describes the device.

use crate::engine::{Bootfs, EngineError, StorageEngine};
use crate::host::BootEnvironment;
use crate::label::MAX_DATASET_NAME_LEN;
use crate::timeouts::{PUBLISH_POLL_ATTEMPTS, PUBLISH_POLL_INTERVAL};
use log::{info, warn};
use std::thread;
use thiserror::Error;

/// Reported block size in bytes.
pub const BOOT_DEV_BLOCK_SIZE: u64 = 512;

/// Reported block count: 2^29 blocks, about 256 GiB of claimed capacity.
pub const BOOT_DEV_BLOCK_COUNT: u64 = 1 << 29;

/// Content hint stamped on the published media.
pub const BOOT_CONTENT_HINT: &str = "Apple_Boot";

/// The virtual block device bound to the boot dataset.
///
/// All property accessors are fixed except the product string, which
/// carries the dataset name so the device is recognizable in device
/// listings.
#[derive(Debug, Clone)]
pub struct VirtualBootDevice {
    dataset_name: String,
}

impl VirtualBootDevice {
    pub fn new(dataset_name: &str) -> Result<Self, PublishError> {
        if dataset_name.is_empty() || dataset_name.len() > MAX_DATASET_NAME_LEN {
            return Err(PublishError::InvalidDatasetName {
                len: dataset_name.len(),
            });
        }
        Ok(Self {
            dataset_name: dataset_name.to_string(),
        })
    }

    pub fn vendor(&self) -> &str {
        "ZFS"
    }

    pub fn revision(&self) -> &str {
        "1.0"
    }

    pub fn additional_info(&self) -> &str {
        "n/a"
    }

    /// Device name is 'Vendor Product Media'; the product slot carries
    /// the dataset name.
    pub fn product(&self) -> &str {
        &self.dataset_name
    }

    pub fn block_size(&self) -> u64 {
        BOOT_DEV_BLOCK_SIZE
    }

    pub fn block_count(&self) -> u64 {
        BOOT_DEV_BLOCK_COUNT
    }

    pub fn capacity_bytes(&self) -> u64 {
        BOOT_DEV_BLOCK_SIZE * BOOT_DEV_BLOCK_COUNT
    }

    pub fn write_protected(&self) -> bool {
        true
    }

    pub fn ejectable(&self) -> bool {
        false
    }

    pub fn removable(&self) -> bool {
        false
    }

    pub fn media_present(&self) -> bool {
        true
    }

    /// Cache synchronization is a no-op; nothing is ever dirty.
    pub fn synchronize_cache(&self) {}

    /// Reads succeed with zero-filled data of the requested length.
    pub fn read(&self, _block: u64, buf: &mut [u8]) {
        buf.fill(0);
    }

    /// Writes succeed without persisting anything.
    pub fn write(&self, _block: u64, _buf: &[u8]) {}

    pub fn eject(&self) -> Result<(), PublishError> {
        Err(PublishError::NotEjectable)
    }
}

/// Host-side adapter that owns attaching and registering the device.
pub trait BootDeviceHost: Send + Sync {
    /// Attach, start, and asynchronously register `device` with the host.
    fn register(&self, device: &VirtualBootDevice) -> Result<(), PublishError>;

    /// The media object the host published for the registered device,
    /// once it exists. Polled by [`publish_bootfs`].
    fn published_media(&self) -> Option<Box<dyn BootMedia>>;
}

/// The host's media object for the published boot device.
pub trait BootMedia {
    fn bsd_name(&self) -> String;
    fn bsd_unit(&self) -> u32;
    fn bsd_major(&self) -> u32;
    fn bsd_minor(&self) -> u32;

    /// Set the content hint and volume UUID properties.
    fn stamp(&mut self, content_hint: &str, uuid: &str);

    /// Re-register so the boot matcher sees the stamped properties.
    fn reregister(&self);
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("dataset name empty or too long ({len} bytes)")]
    InvalidDatasetName { len: usize },
    #[error("bootfs dataset could not be resolved: {0}")]
    Dataset(#[from] EngineError),
    #[error("host adapter error: {0}")]
    Host(String),
    #[error("host never published media for the boot device")]
    MediaNotPublished,
    #[error("boot device is not ejectable")]
    NotEjectable,
}

/// Publish the boot dataset as the boot-UUID media resource.
///
/// Resolves the dataset name, registers the virtual device, waits
/// (bounded) for the host to publish its media, then stamps the media
/// with `Apple_Boot` and the firmware's `boot-uuid`.
///
/// # Panics
///
/// Panics when the `boot-uuid` resource is missing: without it the boot
/// matcher can never bind, and there is no way to hand off the root
/// filesystem.
pub fn publish_bootfs(
    engine: &dyn StorageEngine,
    host: &dyn BootDeviceHost,
    env: &dyn BootEnvironment,
    bootfs: &Bootfs,
) -> Result<String, PublishError> {
    let dataset = engine.dataset_name(&bootfs.pool_name, bootfs.object_id)?;
    info!(
        "event=bootfs_resolved pool={} object={} dataset={dataset}",
        bootfs.pool_name, bootfs.object_id
    );

    let device = VirtualBootDevice::new(&dataset)?;
    host.register(&device)?;

    let mut media = None;
    for _ in 0..PUBLISH_POLL_ATTEMPTS {
        if let Some(found) = host.published_media() {
            media = Some(found);
            break;
        }
        thread::sleep(PUBLISH_POLL_INTERVAL);
    }
    let Some(mut media) = media else {
        warn!("event=boot_media_missing dataset={dataset}");
        return Err(PublishError::MediaNotPublished);
    };
    info!(
        "event=boot_media_published name={} unit={} major={} minor={}",
        media.bsd_name(),
        media.bsd_unit(),
        media.bsd_major(),
        media.bsd_minor()
    );

    let Some(uuid) = env.boot_uuid() else {
        panic!("boot-uuid resource missing while publishing boot device");
    };

    media.stamp(BOOT_CONTENT_HINT, &uuid);
    media.reregister();
    info!("event=bootfs_published dataset={dataset} uuid={uuid}");
    Ok(format!("/dev/{}", media.bsd_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{RecordingEngine, SimBootHost, SimEnvironment};

    fn bootfs() -> Bootfs {
        Bootfs {
            pool_name: "tank".to_string(),
            object_id: 21,
        }
    }

    #[test]
    fn device_properties_are_fixed() {
        let device = VirtualBootDevice::new("tank/ROOT/default").unwrap();
        assert_eq!(device.vendor(), "ZFS");
        assert_eq!(device.revision(), "1.0");
        assert_eq!(device.product(), "tank/ROOT/default");
        assert_eq!(device.block_size(), 512);
        assert_eq!(device.capacity_bytes(), 512 << 29);
        assert!(device.write_protected());
        assert!(!device.ejectable());
        assert!(device.media_present());
        assert!(device.eject().is_err());
    }

    #[test]
    fn reads_are_zero_filled_and_writes_vanish() {
        let device = VirtualBootDevice::new("tank").unwrap();
        device.write(0, &[0xff; 512]);
        let mut buf = [0xaau8; 1024];
        device.read(0, &mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn over_long_dataset_names_are_rejected() {
        let name = "t".repeat(MAX_DATASET_NAME_LEN + 1);
        assert!(matches!(
            VirtualBootDevice::new(&name),
            Err(PublishError::InvalidDatasetName { .. })
        ));
        assert!(VirtualBootDevice::new("").is_err());
    }

    #[test]
    fn publish_stamps_media_with_boot_uuid() {
        let engine = RecordingEngine::new();
        engine.set_dataset_name("tank", 21, "tank/ROOT/default");
        let host = SimBootHost::new().with_publish_delay(2);
        let env = SimEnvironment::new().with_boot_uuid("UUID-1234");

        let path = publish_bootfs(&engine, &host, &env, &bootfs()).unwrap();
        assert_eq!(path, "/dev/disk10");
        assert_eq!(host.registered_product(), Some("tank/ROOT/default".into()));
        assert_eq!(
            host.stamps(),
            vec![("Apple_Boot".to_string(), "UUID-1234".to_string())]
        );
        assert_eq!(host.reregister_count(), 1);
    }

    #[test]
    #[should_panic(expected = "boot-uuid resource missing")]
    fn missing_boot_uuid_is_fatal() {
        let engine = RecordingEngine::new();
        engine.set_dataset_name("tank", 21, "tank/ROOT/default");
        let host = SimBootHost::new();
        let env = SimEnvironment::new();
        let _ = publish_bootfs(&engine, &host, &env, &bootfs());
    }

    #[test]
    fn unresolvable_dataset_is_an_error() {
        let engine = RecordingEngine::new();
        let host = SimBootHost::new();
        let env = SimEnvironment::new().with_boot_uuid("UUID-1234");
        assert!(matches!(
            publish_bootfs(&engine, &host, &env, &bootfs()),
            Err(PublishError::Dataset(_))
        ));
    }
}
