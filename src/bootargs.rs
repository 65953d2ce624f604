//! Boot-argument parsing and the early-boot gate.

use crate::host::BootEnvironment;
use crate::timeouts::UPTIME_GATE;
use log::{debug, info};
use serde::Serialize;

/// The pool this boot attempt is looking for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BootTarget {
    /// Pool name, taken from the boot arguments up to the first `/`.
    pub pool_name: Option<String>,
    /// Pool guid. Zero means "not specified".
    pub pool_guid: u64,
}

impl BootTarget {
    /// A target is usable when at least one selector is present.
    pub fn is_specified(&self) -> bool {
        self.pool_name.as_deref().is_some_and(|name| !name.is_empty()) || self.pool_guid != 0
    }
}

/// Decide whether boot-time discovery should run, and for which pool.
///
/// Discovery is only meaningful before the root filesystem is mounted,
/// so anything past the uptime gate returns `None`. The pool spec is
/// taken from `zfs_boot`, falling back to `rd` and then `rootdev`; the
/// fallbacks are legacy root-device arguments and are only honored when
/// they do not carry another filesystem's `zfs:` prefix.
pub fn boot_target(env: &dyn BootEnvironment) -> Option<BootTarget> {
    let uptime = env.uptime();
    if uptime >= UPTIME_GATE {
        debug!(
            "event=boot_gate_closed uptime_s={} limit_s={}",
            uptime.as_secs(),
            UPTIME_GATE.as_secs()
        );
        return None;
    }

    let spec = env
        .boot_arg("zfs_boot")
        .filter(|arg| !arg.is_empty())
        .or_else(|| fallback_arg(env, "rd"))
        .or_else(|| fallback_arg(env, "rootdev"));

    // TODO: parse a zpool_guid boot argument once one is defined; until
    // then the guid selector is always zero.
    let pool_guid = 0u64;

    let target = match spec {
        Some(spec) => {
            // Everything after the first slash names a dataset and is
            // resolved later, by the mount path.
            let name = spec.split('/').next().unwrap_or("").to_string();
            BootTarget {
                pool_name: (!name.is_empty()).then_some(name),
                pool_guid,
            }
        }
        None => BootTarget {
            pool_name: None,
            pool_guid,
        },
    };

    if !target.is_specified() {
        debug!("event=boot_target_missing");
        return None;
    }
    info!(
        "event=boot_target_selected pool={} guid={:#x}",
        target.pool_name.as_deref().unwrap_or("-"),
        target.pool_guid
    );
    Some(target)
}

fn fallback_arg(env: &dyn BootEnvironment, name: &str) -> Option<String> {
    env.boot_arg(name)
        .filter(|arg| !arg.is_empty() && !arg.starts_with("zfs:"))
}
