//! Boot-time pool discovery and import engine.
//!
//! During early startup this crate watches the block-device namespace,
//! reads on-disk labels from candidate leaf media, reconciles them into
//! a coherent pool configuration, and hands that configuration to the
//! storage engine's import entry point so the root filesystem can be
//! published. Everything platform-specific is reached through the traits
//! in [`host`], [`engine`], and [`bootdev`]; the [`sim`] module provides
//! in-memory stand-ins for all of them.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod aggregate;
pub mod bootargs;
pub mod bootdev;
pub mod discovery;
pub mod engine;
pub mod host;
pub mod label;
pub mod nvlist;
pub mod sim;
pub mod telemetry;
pub mod timeouts;
pub mod userspace;
mod watcher;
mod worker;

pub use aggregate::PoolList;
pub use bootargs::{boot_target, BootTarget};
pub use bootdev::{
    publish_bootfs, BootDeviceHost, BootMedia, PublishError, VirtualBootDevice, BOOT_CONTENT_HINT,
    BOOT_DEV_BLOCK_COUNT, BOOT_DEV_BLOCK_SIZE,
};
pub use discovery::PoolDiscovery;
pub use engine::{Bootfs, EngineError, StorageEngine};
pub use host::{
    ArrivalHandler, BlockDevice, BootEnvironment, DeviceNotifier, HostError, MediaReader,
    Subscription,
};
pub use label::{
    label_offset, read_label, LabelError, LabelScan, PoolState, LABEL_COUNT, LABEL_SIZE,
    MIN_DEVICE_SIZE,
};
pub use nvlist::{NvDecodeError, NvList, NvValue};
pub use telemetry::{DiscoveryReport, DiscoveryStats};
pub use userspace::FileMedia;
