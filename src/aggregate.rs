//! Pool configuration aggregation.
//!
//! Labels stream in one device at a time, in whatever order the host
//! publishes arrivals. This module reconciles them into one best
//! configuration per pool: pick the newest config for each top-level
//! vdev, assemble the child array by vdev id, patch holes and missing
//! slots, and rewrite device paths from the names gathered during
//! discovery. The algorithm follows the userland import path, so a pool
//! assembled here looks exactly like one a full import scan would build.

use crate::engine::StorageEngine;
use crate::label::{keys, vdev_type, PoolState};
use crate::nvlist::NvList;
use log::debug;
use std::collections::BTreeMap;

/// Everything learned from the labels seen so far.
///
/// Relationships are by value (guids), not pointers: pools own their
/// top-level vdev entries, vdev entries own the configs competing for
/// them, and the flat name list maps vdev guids to the paths they were
/// discovered under.
#[derive(Debug, Default)]
pub struct PoolList {
    pools: Vec<PoolEntry>,
    names: Vec<NameEntry>,
}

#[derive(Debug)]
struct PoolEntry {
    pool_guid: u64,
    vdevs: Vec<VdevEntry>,
}

#[derive(Debug)]
struct VdevEntry {
    top_guid: u64,
    configs: Vec<ConfigEntry>,
}

#[derive(Debug)]
struct ConfigEntry {
    txg: u64,
    config: NvList,
}

#[derive(Debug)]
struct NameEntry {
    path: String,
    guid: u64,
    order: u32,
    num_labels: u32,
}

impl PoolList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn name_count(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty() && self.names.is_empty()
    }

    /// Record one decoded label configuration found at `path`.
    ///
    /// Spares and cache devices contribute a name mapping only. Anything
    /// else must name its pool, its vdev, its top-level vdev, and a
    /// non-zero transaction group; a config missing any of those is a
    /// half-initialized label and is dropped without complaint. Within a
    /// top-level vdev the first config seen for a given transaction group
    /// wins, and later duplicates are discarded.
    pub fn add_config(&mut self, path: &str, order: u32, num_labels: u32, config: NvList) {
        let state = config.uint64(keys::POOL_STATE).and_then(PoolState::from_u64);
        if state.is_some_and(PoolState::is_aux) {
            if let Some(guid) = config.uint64(keys::GUID) {
                self.names.push(NameEntry {
                    path: path.to_string(),
                    guid,
                    order,
                    num_labels,
                });
            }
            return;
        }

        let (Some(pool_guid), Some(vdev_guid), Some(top_guid), Some(txg)) = (
            config.uint64(keys::POOL_GUID),
            config.uint64(keys::GUID),
            config.uint64(keys::TOP_GUID),
            config.uint64(keys::POOL_TXG).filter(|txg| *txg != 0),
        ) else {
            debug!("event=config_dropped reason=incomplete path={path}");
            return;
        };

        let pool_idx = match self.pools.iter().position(|p| p.pool_guid == pool_guid) {
            Some(idx) => idx,
            None => {
                self.pools.push(PoolEntry {
                    pool_guid,
                    vdevs: Vec::new(),
                });
                self.pools.len() - 1
            }
        };
        let pool = &mut self.pools[pool_idx];

        let vdev_idx = match pool.vdevs.iter().position(|v| v.top_guid == top_guid) {
            Some(idx) => idx,
            None => {
                pool.vdevs.push(VdevEntry {
                    top_guid,
                    configs: Vec::new(),
                });
                pool.vdevs.len() - 1
            }
        };
        let vdev = &mut pool.vdevs[vdev_idx];

        if vdev.configs.iter().any(|c| c.txg == txg) {
            debug!(
                "event=config_dropped reason=duplicate_txg pool={pool_guid:#x} \
                 top={top_guid:#x} txg={txg}"
            );
        } else {
            vdev.configs.push(ConfigEntry { txg, config });
        }

        self.names.push(NameEntry {
            path: path.to_string(),
            guid: vdev_guid,
            order,
            num_labels,
        });
    }

    /// Convert the gathered labels into the definitive configuration for
    /// each pool, keyed by pool name.
    ///
    /// With `active_ok` the assembled configs are returned as-is; the
    /// caller intends to run its own import. Otherwise each config is
    /// round-tripped through the engine so it can canonicalize the tree,
    /// after which spare and cache paths are fixed up and the host
    /// identity read from the labels is restored.
    pub fn get_configs(&self, engine: &dyn StorageEngine, active_ok: bool) -> BTreeMap<String, NvList> {
        let mut ret = BTreeMap::new();

        for pool in &self.pools {
            let mut config = NvList::new();
            let mut config_seen = false;
            let mut max_txg = 0u64;
            let mut max_id = 0u64;
            let mut valid_top_config = false;
            let mut hole_array: Vec<u64> = Vec::new();
            let mut hostid = 0u64;
            let mut hostname = String::new();
            let mut children: Vec<Option<NvList>> = Vec::new();

            for vdev in &pool.vdevs {
                // Best config for this top-level vdev: the newest one.
                let Some(best) = vdev.configs.iter().max_by_key(|c| c.txg) else {
                    continue;
                };

                // The newest config in the whole pool knows the valid
                // top-level namespace.
                if best.txg > max_txg {
                    config.remove(keys::VDEV_CHILDREN);
                    config.remove(keys::HOLE_ARRAY);
                    max_txg = best.txg;
                    hole_array.clear();
                    max_id = 0;
                    valid_top_config = false;

                    if let Some(count) = best.config.uint64(keys::VDEV_CHILDREN) {
                        config.add_uint64(keys::VDEV_CHILDREN, count);
                        max_id = count;
                        valid_top_config = true;
                    }
                    if let Some(holes) = best.config.uint64_array(keys::HOLE_ARRAY) {
                        config.add_uint64_array(keys::HOLE_ARRAY, holes.to_vec());
                        hole_array = holes.to_vec();
                    }
                }

                if !config_seen {
                    // Seed the pool header from the first usable config.
                    if let Some(version) = best.config.uint64(keys::VERSION) {
                        config.add_uint64(keys::VERSION, version);
                    }
                    if let Some(guid) = best.config.uint64(keys::POOL_GUID) {
                        config.add_uint64(keys::POOL_GUID, guid);
                    }
                    if let Some(name) = best.config.string(keys::POOL_NAME) {
                        config.add_string(keys::POOL_NAME, name);
                    }
                    if let Some(txg) = best.config.uint64(keys::POOL_TXG) {
                        config.add_uint64(keys::POOL_TXG, txg);
                    }
                    if let Some(comment) = best.config.string(keys::COMMENT) {
                        config.add_string(keys::COMMENT, comment);
                    }
                    if let Some(state) = best.config.uint64(keys::POOL_STATE) {
                        config.add_uint64(keys::POOL_STATE, state);
                    }
                    if let Some(id) = best.config.uint64(keys::HOSTID) {
                        hostid = id;
                        config.add_uint64(keys::HOSTID, id);
                        if let Some(name) = best.config.string(keys::HOSTNAME) {
                            hostname = name.to_string();
                            config.add_string(keys::HOSTNAME, name);
                        }
                    }
                    config_seen = true;
                }

                // Place this top-level vdev at its id, growing lazily.
                let Some(tree) = best.config.list(keys::VDEV_TREE) else {
                    continue;
                };
                let Some(id) = tree.uint64(keys::ID) else {
                    continue;
                };
                let idx = id as usize;
                if idx >= children.len() {
                    children.resize(idx + 1, None);
                }
                children[idx] = Some(tree.clone());
            }

            // With an authoritative child count, trim slots beyond the
            // valid range and extend to cover devices not seen at all.
            if valid_top_config {
                let want = max_id as usize;
                if want < children.len() {
                    children.truncate(want);
                } else if want > children.len() {
                    children.resize(want, None);
                }
            }

            // Device removal leaves holes that must stay in position.
            for (idx, slot) in children.iter_mut().enumerate() {
                if slot.is_none() && hole_array.contains(&(idx as u64)) {
                    *slot = Some(placeholder(vdev_type::HOLE, idx as u64));
                }
            }

            // Anything still empty gets a placeholder. Ids encode the
            // position in the namespace, so the array cannot be
            // compressed.
            for (idx, slot) in children.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = Some(placeholder(vdev_type::MISSING, idx as u64));
                }
            }

            let mut root = NvList::new();
            root.add_string(keys::TYPE, vdev_type::ROOT);
            root.add_uint64(keys::ID, 0);
            root.add_uint64(keys::GUID, pool.pool_guid);
            root.add_list_array(keys::CHILDREN, children.into_iter().flatten().collect());
            self.fix_paths(&mut root);
            config.add_list(keys::VDEV_TREE, root);

            if !active_ok {
                let Some(mut refreshed) = engine.try_import(&config) else {
                    debug!("event=pool_config_rejected pool={:#x}", pool.pool_guid);
                    continue;
                };
                // The engine now knows the spares and cache devices; fix
                // their paths too, then restore the host identity read
                // from the labels, which the engine may have overwritten.
                if let Some(tree) = refreshed.list_mut(keys::VDEV_TREE) {
                    for key in [keys::SPARES, keys::L2CACHE] {
                        if let Some(entries) = tree.list_array_mut(key) {
                            for entry in entries.iter_mut() {
                                self.fix_paths(entry);
                            }
                        }
                    }
                }
                refreshed.remove(keys::HOSTID);
                refreshed.remove(keys::HOSTNAME);
                if hostid != 0 {
                    refreshed.add_uint64(keys::HOSTID, hostid);
                    refreshed.add_string(keys::HOSTNAME, hostname.as_str());
                }
                config = refreshed;
            }

            let Some(name) = config.string(keys::POOL_NAME).map(str::to_owned) else {
                debug!("event=pool_config_rejected reason=unnamed pool={:#x}", pool.pool_guid);
                continue;
            };
            ret.insert(name, config);
        }

        ret
    }

    /// Rewrite leaf vdev paths from the discovered name list.
    ///
    /// There may be several names for one guid when a disk is reachable
    /// through multiple paths. A name equal to the path already in the
    /// config wins outright; otherwise prefer the name backed by more
    /// label copies, then the one discovered earlier in the search order.
    fn fix_paths(&self, nv: &mut NvList) {
        if let Some(children) = nv.list_array_mut(keys::CHILDREN) {
            for child in children.iter_mut() {
                self.fix_paths(child);
            }
            return;
        }

        let Some(guid) = nv.uint64(keys::GUID) else {
            return;
        };
        let current = nv.string(keys::PATH).map(str::to_owned);

        let mut best: Option<&NameEntry> = None;
        for entry in &self.names {
            if entry.guid != guid {
                continue;
            }
            let Some(path) = &current else {
                best = Some(entry);
                break;
            };
            if *path == entry.path {
                best = Some(entry);
                break;
            }
            match best {
                None => best = Some(entry),
                Some(b) if entry.num_labels > b.num_labels => best = Some(entry),
                Some(b) if entry.num_labels == b.num_labels && entry.order < b.order => {
                    best = Some(entry)
                }
                _ => {}
            }
        }

        let Some(best) = best else {
            return;
        };
        nv.add_string(keys::PATH, best.path.as_str());
        // No devid can be derived at boot; drop any stale one.
        nv.remove(keys::DEVID);
    }
}

fn placeholder(vdev_kind: &str, id: u64) -> NvList {
    let mut nv = NvList::new();
    nv.add_string(keys::TYPE, vdev_kind);
    nv.add_uint64(keys::ID, id);
    nv.add_uint64(keys::GUID, 0);
    nv
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::RecordingEngine;

    const POOL_GUID: u64 = 0x9000;

    fn leaf_label(name: &str, vdev_guid: u64, id: u64, vdev_children: u64, txg: u64) -> NvList {
        let mut tree = NvList::new();
        tree.add_string(keys::TYPE, vdev_type::DISK);
        tree.add_uint64(keys::ID, id);
        tree.add_uint64(keys::GUID, vdev_guid);
        tree.add_string(keys::PATH, "/dev/old-path");
        tree.add_string(keys::DEVID, "stale-devid");

        let mut config = NvList::new();
        config.add_uint64(keys::VERSION, 5000);
        config.add_string(keys::POOL_NAME, name);
        config.add_uint64(keys::POOL_STATE, PoolState::Exported as u64);
        config.add_uint64(keys::POOL_TXG, txg);
        config.add_uint64(keys::POOL_GUID, POOL_GUID);
        config.add_uint64(keys::GUID, vdev_guid);
        config.add_uint64(keys::TOP_GUID, vdev_guid);
        config.add_uint64(keys::VDEV_CHILDREN, vdev_children);
        config.add_uint64(keys::HOSTID, 0xbeef);
        config.add_string(keys::HOSTNAME, "darkstar");
        config.add_list(keys::VDEV_TREE, tree);
        config
    }

    fn child_types(config: &NvList) -> Vec<String> {
        config
            .list(keys::VDEV_TREE)
            .and_then(|root| root.list_array(keys::CHILDREN))
            .map(|children| {
                children
                    .iter()
                    .map(|c| c.string(keys::TYPE).unwrap_or("?").to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[test]
    fn incomplete_configs_are_dropped() {
        let engine = RecordingEngine::new();
        let mut list = PoolList::new();
        let mut config = leaf_label("pond", 0x1, 0, 1, 7);
        config.remove(keys::TOP_GUID);
        list.add_config("/dev/disk2", 1, 4, config);
        assert_eq!(list.pool_count(), 0);
        // No name entry either: the device never proved it belongs
        // anywhere.
        assert_eq!(list.name_count(), 0);
        assert!(list.get_configs(&engine, true).is_empty());
    }

    #[test]
    fn duplicate_txg_keeps_first_config() {
        let engine = RecordingEngine::new();
        let mut list = PoolList::new();
        let mut first = leaf_label("pond", 0x1, 0, 1, 7);
        first.add_string(keys::COMMENT, "first");
        let mut second = leaf_label("pond", 0x1, 0, 1, 7);
        second.add_string(keys::COMMENT, "second");
        list.add_config("/dev/disk2", 1, 4, first);
        list.add_config("/dev/disk3", 1, 4, second);

        let configs = list.get_configs(&engine, true);
        assert_eq!(configs["pond"].string(keys::COMMENT), Some("first"));
        // Both devices still contributed name entries.
        assert_eq!(list.name_count(), 2);
    }

    #[test]
    fn pool_guids_stay_unique() {
        let mut list = PoolList::new();
        list.add_config("/dev/disk2", 1, 4, leaf_label("pond", 0x1, 0, 2, 7));
        list.add_config("/dev/disk3", 1, 4, leaf_label("pond", 0x2, 1, 2, 7));
        assert_eq!(list.pool_count(), 1);
    }

    #[test]
    fn spare_contributes_name_only() {
        let engine = RecordingEngine::new();
        let mut list = PoolList::new();
        let mut spare = NvList::new();
        spare.add_uint64(keys::POOL_STATE, PoolState::Spare as u64);
        spare.add_uint64(keys::GUID, 0x77);
        list.add_config("/dev/disk9", 1, 2, spare);
        assert_eq!(list.pool_count(), 0);
        assert_eq!(list.name_count(), 1);
        assert!(list.get_configs(&engine, true).is_empty());
    }

    #[test]
    fn mirror_assembles_regardless_of_arrival_order() {
        let engine = RecordingEngine::new();
        let build = |order: &[(&str, u64, u64)]| {
            let mut list = PoolList::new();
            for (path, guid, id) in order {
                list.add_config(path, 1, 4, leaf_label("pond", *guid, *id, 2, 7));
            }
            list.get_configs(&engine, true)
        };

        let forward = build(&[("/dev/diskA", 0xa, 0), ("/dev/diskB", 0xb, 1)]);
        let reversed = build(&[("/dev/diskB", 0xb, 1), ("/dev/diskA", 0xa, 0)]);
        assert_eq!(forward, reversed);

        let config = &forward["pond"];
        let root = config.list(keys::VDEV_TREE).unwrap();
        assert_eq!(root.string(keys::TYPE), Some(vdev_type::ROOT));
        assert_eq!(root.uint64(keys::GUID), Some(POOL_GUID));
        let children = root.list_array(keys::CHILDREN).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].uint64(keys::GUID), Some(0xa));
        assert_eq!(children[1].uint64(keys::GUID), Some(0xb));
        assert_eq!(child_types(config), vec!["disk", "disk"]);
    }

    #[test]
    fn absent_device_becomes_missing_placeholder() {
        let engine = RecordingEngine::new();
        let mut list = PoolList::new();
        list.add_config("/dev/diskA", 1, 4, leaf_label("pond", 0xa, 0, 3, 7));
        list.add_config("/dev/diskC", 1, 4, leaf_label("pond", 0xc, 2, 3, 7));

        let configs = list.get_configs(&engine, true);
        assert_eq!(child_types(&configs["pond"]), vec!["disk", "missing", "disk"]);
        let root = configs["pond"].list(keys::VDEV_TREE).unwrap();
        let missing = &root.list_array(keys::CHILDREN).unwrap()[1];
        assert_eq!(missing.uint64(keys::ID), Some(1));
        assert_eq!(missing.uint64(keys::GUID), Some(0));
    }

    #[test]
    fn holes_are_filled_before_missing_slots() {
        let engine = RecordingEngine::new();
        let mut list = PoolList::new();
        let mut with_holes = |guid, id| {
            let mut config = leaf_label("pond", guid, id, 3, 7);
            config.add_uint64_array(keys::HOLE_ARRAY, vec![1]);
            config
        };
        list.add_config("/dev/diskA", 1, 4, with_holes(0xa, 0));
        list.add_config("/dev/diskC", 1, 4, with_holes(0xc, 2));

        let configs = list.get_configs(&engine, true);
        assert_eq!(child_types(&configs["pond"]), vec!["disk", "hole", "disk"]);
    }

    #[test]
    fn newest_txg_defines_the_namespace() {
        let engine = RecordingEngine::new();
        let mut list = PoolList::new();
        // Stale label claims four children; the newer one knows there
        // are only two.
        list.add_config("/dev/diskA", 1, 4, leaf_label("pond", 0xa, 0, 4, 5));
        list.add_config("/dev/diskB", 1, 4, leaf_label("pond", 0xb, 1, 2, 9));

        let configs = list.get_configs(&engine, true);
        let config = &configs["pond"];
        assert_eq!(config.uint64(keys::VDEV_CHILDREN), Some(2));
        assert_eq!(child_types(config), vec!["disk", "disk"]);
    }

    #[test]
    fn per_vdev_best_is_max_txg() {
        let engine = RecordingEngine::new();
        let mut list = PoolList::new();
        let mut old = leaf_label("pond", 0xa, 0, 1, 5);
        old.add_string(keys::COMMENT, "old");
        let mut new = leaf_label("pond", 0xa, 0, 1, 9);
        new.add_string(keys::COMMENT, "new");
        list.add_config("/dev/diskA", 1, 2, old);
        list.add_config("/dev/diskA", 1, 4, new);

        let configs = list.get_configs(&engine, true);
        assert_eq!(configs["pond"].string(keys::COMMENT), Some("new"));
        assert_eq!(configs["pond"].uint64(keys::POOL_TXG), Some(9));
    }

    #[test]
    fn paths_prefer_more_labels_then_lower_order() {
        let engine = RecordingEngine::new();
        let mut list = PoolList::new();
        list.add_config("/dev/flaky", 2, 1, leaf_label("pond", 0xa, 0, 1, 7));
        // Same txg arrives again under better paths; the config is a
        // duplicate but the names still accumulate.
        list.add_config("/dev/solid", 2, 4, leaf_label("pond", 0xa, 0, 1, 7));
        list.add_config("/dev/late-solid", 3, 4, leaf_label("pond", 0xa, 0, 1, 7));

        let configs = list.get_configs(&engine, true);
        let root = configs["pond"].list(keys::VDEV_TREE).unwrap();
        let leaf = &root.list_array(keys::CHILDREN).unwrap()[0];
        assert_eq!(leaf.string(keys::PATH), Some("/dev/solid"));
        assert_eq!(leaf.string(keys::DEVID), None);
    }

    #[test]
    fn exact_path_match_short_circuits() {
        let engine = RecordingEngine::new();
        let mut list = PoolList::new();
        let mut config = leaf_label("pond", 0xa, 0, 1, 8);
        if let Some(tree) = config.list_mut(keys::VDEV_TREE) {
            tree.add_string(keys::PATH, "/dev/already-right");
        }
        list.add_config("/dev/with-more-labels", 1, 4, leaf_label("pond", 0xa, 0, 1, 7));
        list.add_config("/dev/already-right", 1, 1, config);

        let configs = list.get_configs(&engine, true);
        let root = configs["pond"].list(keys::VDEV_TREE).unwrap();
        let leaf = &root.list_array(keys::CHILDREN).unwrap()[0];
        // txg 8 wins the config; its recorded path matches a known name
        // exactly, overriding the more-labels rule.
        assert_eq!(leaf.string(keys::PATH), Some("/dev/already-right"));
    }

    #[test]
    fn engine_round_trip_restores_host_identity() {
        // The engine rewrites hostid/hostname and grows a spares array;
        // get_configs must undo the former and fix paths in the latter.
        let engine = RecordingEngine::new();
        engine.set_refresh(|mut config: NvList| {
            config.add_uint64(keys::HOSTID, 0x9999);
            config.add_string(keys::HOSTNAME, "someone-else");
            if let Some(tree) = config.list_mut(keys::VDEV_TREE) {
                let mut spare = NvList::new();
                spare.add_string(keys::TYPE, vdev_type::DISK);
                spare.add_uint64(keys::GUID, 0x77);
                tree.add_list_array(keys::SPARES, vec![spare]);
            }
            config
        });

        let mut list = PoolList::new();
        list.add_config("/dev/diskA", 1, 4, leaf_label("pond", 0xa, 0, 1, 7));
        let mut spare = NvList::new();
        spare.add_uint64(keys::POOL_STATE, PoolState::Spare as u64);
        spare.add_uint64(keys::GUID, 0x77);
        list.add_config("/dev/spare0", 1, 2, spare);

        let configs = list.get_configs(&engine, false);
        let config = &configs["pond"];
        assert_eq!(config.uint64(keys::HOSTID), Some(0xbeef));
        assert_eq!(config.string(keys::HOSTNAME), Some("darkstar"));
        let tree = config.list(keys::VDEV_TREE).unwrap();
        let spares = tree.list_array(keys::SPARES).unwrap();
        assert_eq!(spares[0].string(keys::PATH), Some("/dev/spare0"));
    }

    #[test]
    fn engine_rejection_drops_the_pool() {
        let engine = RecordingEngine::new();
        engine.refuse_try_import();
        let mut list = PoolList::new();
        list.add_config("/dev/diskA", 1, 4, leaf_label("pond", 0xa, 0, 1, 7));
        assert!(list.get_configs(&engine, false).is_empty());
        // The active_ok path never consults the engine.
        assert!(!list.get_configs(&engine, true).is_empty());
    }
}
