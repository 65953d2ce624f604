//! On-disk label vocabulary and the boot label reader.
//!
//! Every leaf device in a pool carries four copies of a fixed-size label:
//! two at the front and two at the back, so that a torn write or a grown
//! partition cannot wipe all of them at once. The label embeds a packed
//! property list describing the device's vdev and its pool; that list is
//! all the boot path needs, so this reader ignores the surrounding boot
//! block and uberblock rings entirely.

use crate::host::BlockDevice;
use crate::nvlist::NvList;
use log::debug;
use thiserror::Error;

/// Names of the configuration values consulted by the boot path.
pub mod keys {
    pub const VERSION: &str = "version";
    pub const POOL_NAME: &str = "name";
    pub const POOL_STATE: &str = "state";
    pub const POOL_TXG: &str = "txg";
    pub const POOL_GUID: &str = "pool_guid";
    pub const GUID: &str = "guid";
    pub const TOP_GUID: &str = "top_guid";
    pub const ID: &str = "id";
    pub const PATH: &str = "path";
    pub const DEVID: &str = "devid";
    pub const TYPE: &str = "type";
    pub const VDEV_TREE: &str = "vdev_tree";
    pub const CHILDREN: &str = "children";
    pub const SPARES: &str = "spares";
    pub const L2CACHE: &str = "l2cache";
    pub const VDEV_CHILDREN: &str = "vdev_children";
    pub const HOLE_ARRAY: &str = "hole_array";
    pub const HOSTID: &str = "hostid";
    pub const HOSTNAME: &str = "hostname";
    pub const COMMENT: &str = "comment";
}

/// Vdev type strings used when assembling configurations.
pub mod vdev_type {
    pub const ROOT: &str = "root";
    pub const DISK: &str = "disk";
    pub const HOLE: &str = "hole";
    pub const MISSING: &str = "missing";
}

/// Size of one on-disk label.
pub const LABEL_SIZE: u64 = 256 * 1024;

/// Number of label copies per device.
pub const LABEL_COUNT: u64 = 4;

// Label interior: blank space for a partition table, the boot block
// header, then the packed property list. The uberblock ring fills the
// rest and is of no interest here.
const BLANK_SIZE: u64 = 8 * 1024;
const BOOT_HEADER_SIZE: u64 = 8 * 1024;

/// Offset of the packed property list within a label.
pub const NVLIST_OFFSET: u64 = BLANK_SIZE + BOOT_HEADER_SIZE;

/// Size of the packed property list region, excluding its checksum tail.
pub const NVLIST_SIZE: usize = 112 * 1024 - 40;

/// Smallest device that can be a pool member.
pub const MIN_DEVICE_SIZE: u64 = 64 * 1024 * 1024;

/// Longest permitted dataset name, including the pool component.
pub const MAX_DATASET_NAME_LEN: usize = 256;

/// Pool state recorded in a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Active = 0,
    Exported = 1,
    Destroyed = 2,
    Spare = 3,
    L2Cache = 4,
}

impl PoolState {
    /// Map the on-disk value, rejecting anything past the known range.
    pub fn from_u64(value: u64) -> Option<PoolState> {
        match value {
            0 => Some(PoolState::Active),
            1 => Some(PoolState::Exported),
            2 => Some(PoolState::Destroyed),
            3 => Some(PoolState::Spare),
            4 => Some(PoolState::L2Cache),
            _ => None,
        }
    }

    /// Spares and cache devices carry an abbreviated label with no
    /// transaction group.
    pub fn is_aux(self) -> bool {
        matches!(self, PoolState::Spare | PoolState::L2Cache)
    }
}

/// Byte offset of label copy `index` on a device whose size has been
/// rounded down to a label multiple. Copies 0 and 1 sit at the front,
/// copies 2 and 3 at the back.
pub fn label_offset(aligned_size: u64, index: usize) -> u64 {
    let l = index as u64;
    l * LABEL_SIZE
        + if l < LABEL_COUNT / 2 {
            0
        } else {
            aligned_size - LABEL_COUNT * LABEL_SIZE
        }
}

/// Outcome of scanning one device for labels.
#[derive(Debug, Default)]
pub struct LabelScan {
    /// Configuration from the first accepted label copy.
    pub config: Option<NvList>,
    /// How many accepted copies agreed with that label's vdev guid.
    pub labels_found: u8,
}

#[derive(Debug, Error)]
pub enum LabelError {
    #[error("device reports zero size")]
    EmptyDevice,
    #[error("device too small for labels: {size} bytes")]
    TooSmall { size: u64 },
    #[error(transparent)]
    Host(#[from] crate::host::HostError),
}

/// Read all four label copies from `device` and return the configuration
/// of the first usable one, together with the number of copies that
/// agreed with it.
///
/// A copy is usable when it reads completely, its property list decodes,
/// it names a non-zero vdev guid and a known pool state, and (for
/// non-aux states) a non-zero transaction group. Copies naming a
/// different vdev guid than the first accepted one are ignored without
/// resetting the count.
pub fn read_label(device: &dyn BlockDevice) -> Result<LabelScan, LabelError> {
    let size = device.byte_size();
    if size == 0 {
        return Err(LabelError::EmptyDevice);
    }
    let aligned = size - (size % LABEL_SIZE);
    if aligned < LABEL_COUNT * LABEL_SIZE {
        return Err(LabelError::TooSmall { size });
    }

    let mut scan = LabelScan::default();
    let mut expected_guid = 0u64;
    let mut buf = vec![0u8; LABEL_SIZE as usize];
    let mut reader = device.open_readonly()?;

    for index in 0..LABEL_COUNT as usize {
        let offset = label_offset(aligned, index);
        buf.fill(0);
        match reader.read_at(offset, &mut buf) {
            Ok(n) if n == buf.len() => {}
            Ok(n) => {
                debug!("event=label_short_read index={index} got={n}");
                continue;
            }
            Err(err) => {
                debug!("event=label_read_failed index={index} error={err}");
                continue;
            }
        }

        let region = &buf[NVLIST_OFFSET as usize..NVLIST_OFFSET as usize + NVLIST_SIZE];
        let config = match NvList::unpack(region) {
            Ok(config) => config,
            Err(err) => {
                debug!("event=label_undecodable index={index} error={err}");
                continue;
            }
        };

        let guid = match config.uint64(keys::GUID) {
            Some(guid) if guid != 0 => guid,
            _ => {
                debug!("event=label_skipped index={index} reason=no_guid");
                continue;
            }
        };
        let state = match config.uint64(keys::POOL_STATE).and_then(PoolState::from_u64) {
            Some(state) => state,
            None => {
                debug!("event=label_skipped index={index} reason=bad_state");
                continue;
            }
        };
        if !state.is_aux() && config.uint64(keys::POOL_TXG).unwrap_or(0) == 0 {
            debug!("event=label_skipped index={index} reason=no_txg");
            continue;
        }

        if expected_guid != 0 {
            if guid == expected_guid {
                scan.labels_found += 1;
            }
        } else {
            expected_guid = guid;
            scan.labels_found = 1;
            scan.config = Some(config);
        }
    }

    Ok(scan)
}
