use bootpool::label::{keys, vdev_type};
use bootpool::sim::{MemMedia, RecordingEngine, SimBootHost, SimEnvironment, SimNotifier};
use bootpool::{NvList, PoolDiscovery, PoolState, MIN_DEVICE_SIZE};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn pool_member(name: &str, vdev_guid: u64, id: u64) -> Arc<MemMedia> {
    let mut tree = NvList::new();
    tree.add_string(keys::TYPE, vdev_type::DISK);
    tree.add_uint64(keys::ID, id);
    tree.add_uint64(keys::GUID, vdev_guid);

    let mut config = NvList::new();
    config.add_uint64(keys::VERSION, 5000);
    config.add_string(keys::POOL_NAME, "pond");
    config.add_uint64(keys::POOL_STATE, PoolState::Exported as u64);
    config.add_uint64(keys::POOL_TXG, 7);
    config.add_uint64(keys::POOL_GUID, 0x9e0d);
    config.add_uint64(keys::GUID, vdev_guid);
    config.add_uint64(keys::TOP_GUID, vdev_guid);
    config.add_uint64(keys::VDEV_CHILDREN, 4);
    config.add_list(keys::VDEV_TREE, tree);

    let mut media = MemMedia::new(name, MIN_DEVICE_SIZE as usize);
    media.write_labels(&config.pack());
    Arc::new(media)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn teardown_races_cleanly_with_probes_and_arrivals() {
    let env = Arc::new(SimEnvironment::new().with_arg("zfs_boot", "pond"));
    let notifier = Arc::new(SimNotifier::new());
    notifier.add_existing(pool_member("diskA", 0xa, 0));

    let engine = Arc::new(RecordingEngine::new());
    // Imports never succeed and try_import dwells, so teardown lands
    // while the worker is inside an engine call.
    engine.fail_imports(5);
    engine.set_try_import_delay(Duration::from_millis(300));

    let discovery = PoolDiscovery::start(
        env,
        notifier.clone(),
        engine.clone(),
        Arc::new(SimBootHost::new()),
    )
    .unwrap()
    .unwrap();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.try_import_count() >= 1
    }));

    // A hot arrival races the teardown from another thread.
    let racing_notifier = notifier.clone();
    let racer = std::thread::spawn(move || {
        racing_notifier.publish(pool_member("diskB", 0xb, 1));
    });

    discovery.teardown();
    racer.join().unwrap();

    // The notifier was cancelled exactly once and drained.
    assert_eq!(notifier.cancel_count(), 1);
    assert!(discovery.is_terminating());

    // Arrivals after the drain never touch discovery state.
    let seen_before = discovery.report().devices_seen;
    notifier.publish(pool_member("diskC", 0xc, 2));
    assert_eq!(discovery.report().devices_seen, seen_before);

    // The worker finishes its engine call and exits without importing.
    discovery.shutdown();
    assert!(engine.imported_pools().is_empty());
}

#[test]
fn teardown_before_any_arrival_is_clean() {
    let env = Arc::new(SimEnvironment::new().with_arg("zfs_boot", "pond"));
    let notifier = Arc::new(SimNotifier::new());
    let engine = Arc::new(RecordingEngine::new());
    let discovery = PoolDiscovery::start(
        env,
        notifier.clone(),
        engine.clone(),
        Arc::new(SimBootHost::new()),
    )
    .unwrap()
    .unwrap();

    discovery.shutdown();
    assert_eq!(notifier.cancel_count(), 1);
    assert!(engine.imported_pools().is_empty());
}

#[test]
fn dropping_the_handle_tears_down() {
    let env = Arc::new(SimEnvironment::new().with_arg("zfs_boot", "pond"));
    let notifier = Arc::new(SimNotifier::new());
    {
        let _discovery = PoolDiscovery::start(
            env,
            notifier.clone(),
            Arc::new(RecordingEngine::new()),
            Arc::new(SimBootHost::new()),
        )
        .unwrap()
        .unwrap();
    }
    assert_eq!(notifier.cancel_count(), 1);
    assert!(!notifier.is_subscribed());
}
