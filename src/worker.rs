//! The import worker.
//!
//! A single long-lived thread drains the device queue, reads labels,
//! feeds the aggregator, and keeps attempting the import until it
//! succeeds or teardown is requested. It holds no lock while touching
//! devices or the engine, and re-reads the terminating flag at every
//! natural boundary; the engine calls themselves are the one thing it
//! will not abandon midway.

use crate::bootdev::publish_bootfs;
use crate::discovery::Shared;
use crate::host::BlockDevice;
use crate::label::{keys, read_label, PoolState};
use crate::timeouts::WORKER_WAIT;
use log::{debug, error, info, warn};
use std::sync::Arc;

/// Path prefix used when a device carries a media UUID.
const BY_ID_PREFIX: &str = "/private/var/run/disk/by-id/media-";

/// Search order recorded with every discovered path. Boot probing sees
/// one synthetic namespace, so everything shares one order and path
/// tie-breaks fall through to the label count.
const BOOT_PATH_ORDER: u32 = 1;

/// Canonical path under which a device is recorded for path fixup.
pub(crate) fn canonical_path(device: &dyn BlockDevice, bsd_name: &str) -> String {
    match device.media_uuid().filter(|uuid| !uuid.is_empty()) {
        Some(uuid) => format!("{BY_ID_PREFIX}{uuid}"),
        None => format!("/dev/{bsd_name}"),
    }
}

pub(crate) fn run(shared: Arc<Shared>) {
    let mut imported: Option<String> = None;

    'main: loop {
        // Swap the pending set out under the lock, then work on it
        // unlocked.
        let batch = {
            let Ok(mut state) = shared.state.lock() else {
                break 'main;
            };
            if shared.is_terminating() {
                break 'main;
            }
            std::mem::take(&mut state.disks)
        };

        for (bsd_name, device) in batch {
            if shared.is_terminating() {
                break 'main;
            }
            probe_device(&shared, &bsd_name, device.as_ref());
            // The device handle is released here; anything worth keeping
            // is in the aggregation tree by now.
        }

        if shared.is_terminating() {
            break 'main;
        }

        // More arrivals while probing? Drain them before deciding what
        // is importable.
        let configs = {
            let Ok(state) = shared.state.lock() else {
                break 'main;
            };
            if !state.disks.is_empty() {
                debug!("event=worker_redrain pending={}", state.disks.len());
                continue 'main;
            }
            state.pools.get_configs(shared.engine.as_ref(), true)
        };

        if shared.is_terminating() {
            break 'main;
        }

        for (pool_name, config) in &configs {
            let state = config.uint64(keys::POOL_STATE).and_then(PoolState::from_u64);
            if state == Some(PoolState::Destroyed) {
                debug!("event=pool_skipped reason=destroyed pool={pool_name}");
                continue;
            }
            if shared.is_terminating() {
                break 'main;
            }

            shared.stats.import_attempted();
            let Some(refreshed) = shared.engine.try_import(config) else {
                debug!("event=try_import_rejected pool={pool_name}");
                shared.stats.import_failed();
                continue;
            };
            match shared.engine.import(pool_name, &refreshed) {
                Ok(()) => {
                    info!("event=pool_imported pool={pool_name}");
                    imported = Some(pool_name.clone());
                    break 'main;
                }
                Err(err) => {
                    // The pool may become importable once more of its
                    // devices arrive; keep looping.
                    warn!("event=import_failed pool={pool_name} error={err}");
                    shared.stats.import_failed();
                }
            }
        }

        let Ok(state) = shared.state.lock() else {
            break 'main;
        };
        if state.disks.is_empty() && !shared.is_terminating() {
            let _ = shared.cv.wait_timeout(state, WORKER_WAIT);
        }
    }

    // Free the discovery state before handing off to the mount path. If
    // teardown already ran externally this is a no-op.
    shared.teardown();

    if let Some(pool_name) = imported {
        publish_imported(&shared, &pool_name);
    }
}

fn publish_imported(shared: &Shared, pool_name: &str) {
    let Some(bootfs) = shared.engine.bootfs() else {
        info!("event=no_bootfs pool={pool_name}");
        return;
    };
    shared.engine.hijack_mountroot();
    match publish_bootfs(
        shared.engine.as_ref(),
        shared.boot_host.as_ref(),
        shared.env.as_ref(),
        &bootfs,
    ) {
        Ok(path) => info!("event=bootfs_ready pool={pool_name} device={path}"),
        Err(err) => error!("event=bootfs_publish_failed pool={pool_name} error={err}"),
    }
}

fn probe_device(shared: &Shared, bsd_name: &str, device: &dyn BlockDevice) {
    let path = canonical_path(device, bsd_name);
    shared.stats.device_probed();

    if shared.is_terminating() {
        return;
    }

    let scan = match read_label(device) {
        Ok(scan) => scan,
        Err(err) => {
            debug!("event=probe_failed path={path} error={err}");
            return;
        }
    };
    let Some(config) = scan.config else {
        debug!("event=no_labels path={path}");
        return;
    };
    shared.stats.labels_found(scan.labels_found);

    let matched = if let Some(want) = &shared.target.pool_name {
        config.string(keys::POOL_NAME) == Some(want.as_str())
    } else if shared.target.pool_guid != 0 {
        config.uint64(keys::POOL_GUID) == Some(shared.target.pool_guid)
    } else {
        false
    };
    if !matched {
        debug!("event=pool_mismatch path={path}");
        shared.stats.config_dropped();
        return;
    }
    info!(
        "event=pool_matched path={path} labels={}",
        scan.labels_found
    );

    if shared.is_terminating() {
        return;
    }
    let Ok(mut state) = shared.state.lock() else {
        return;
    };
    state
        .pools
        .add_config(&path, BOOT_PATH_ORDER, u32::from(scan.labels_found), config);
    shared.stats.config_added();
}
