//! Simulated host bindings.
//!
//! Stand-ins for the platform objects the engine talks to, good enough
//! to exercise the whole discovery flow without real hardware: in-memory
//! media, a notifier whose arrivals are scripted by the test, a
//! recording storage engine, and a canned boot environment. Kept in the
//! crate (rather than a test helper) so integration tests and downstream
//! experiments can drive the engine the same way.

use crate::bootdev::{BootDeviceHost, BootMedia, PublishError, VirtualBootDevice};
use crate::engine::{Bootfs, EngineError, StorageEngine};
use crate::host::{
    ArrivalHandler, BlockDevice, BootEnvironment, DeviceNotifier, HostError, MediaReader,
    Subscription,
};
use crate::label::{label_offset, LABEL_COUNT, LABEL_SIZE, NVLIST_OFFSET};
use crate::nvlist::NvList;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

type RefreshFn = dyn Fn(NvList) -> NvList + Send + Sync;

/// An in-memory block device.
#[derive(Debug)]
pub struct MemMedia {
    bsd_name: Option<String>,
    media_uuid: Option<String>,
    leaf: bool,
    data: Vec<u8>,
}

impl MemMedia {
    pub fn new(bsd_name: &str, size: usize) -> Self {
        Self {
            bsd_name: Some(bsd_name.to_string()),
            media_uuid: None,
            leaf: true,
            data: vec![0u8; size],
        }
    }

    pub fn with_uuid(mut self, uuid: &str) -> Self {
        self.media_uuid = Some(uuid.to_string());
        self
    }

    pub fn non_leaf(mut self) -> Self {
        self.leaf = false;
        self
    }

    pub fn without_bsd_name(mut self) -> Self {
        self.bsd_name = None;
        self
    }

    /// Write a packed configuration into label copy `index`, at the
    /// offset the reader will look for it.
    pub fn write_label(&mut self, index: usize, packed: &[u8]) {
        let size = self.data.len() as u64;
        let aligned = size - (size % LABEL_SIZE);
        assert!(aligned >= LABEL_COUNT * LABEL_SIZE, "device too small for labels");
        let start = (label_offset(aligned, index) + NVLIST_OFFSET) as usize;
        self.data[start..start + packed.len()].copy_from_slice(packed);
    }

    /// Write the same packed configuration into all four label copies.
    pub fn write_labels(&mut self, packed: &[u8]) {
        for index in 0..LABEL_COUNT as usize {
            self.write_label(index, packed);
        }
    }

    /// Zero label copy `index`.
    pub fn corrupt_label(&mut self, index: usize) {
        let size = self.data.len() as u64;
        let aligned = size - (size % LABEL_SIZE);
        let start = label_offset(aligned, index) as usize;
        self.data[start..start + LABEL_SIZE as usize].fill(0);
    }
}

impl BlockDevice for MemMedia {
    fn byte_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn is_leaf(&self) -> bool {
        self.leaf
    }

    fn bsd_name(&self) -> Option<String> {
        self.bsd_name.clone()
    }

    fn media_uuid(&self) -> Option<String> {
        self.media_uuid.clone()
    }

    fn open_readonly(&self) -> Result<Box<dyn MediaReader + '_>, HostError> {
        Ok(Box::new(MemReader { data: &self.data }))
    }
}

struct MemReader<'a> {
    data: &'a [u8],
}

impl MediaReader for MemReader<'_> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, HostError> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let len = buf.len().min(self.data.len() - offset);
        buf[..len].copy_from_slice(&self.data[offset..offset + len]);
        Ok(len)
    }
}

/// A scripted device notifier.
///
/// Devices registered with [`SimNotifier::add_existing`] replay through
/// the handler at subscription time, the way a first-publish
/// notification does; later calls to [`SimNotifier::publish`] model hot
/// arrivals and may come from any thread. Cancelling the subscription
/// blocks until in-flight callbacks drain.
#[derive(Default)]
pub struct SimNotifier {
    inner: Arc<NotifierInner>,
}

#[derive(Default)]
struct NotifierInner {
    handler: Mutex<Option<ArrivalHandler>>,
    existing: Mutex<Vec<Arc<dyn BlockDevice>>>,
    inflight: Mutex<usize>,
    drained: Condvar,
    cancels: AtomicUsize,
}

impl SimNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_existing(&self, device: Arc<dyn BlockDevice>) {
        self.inner
            .existing
            .lock()
            .expect("notifier lock poisoned")
            .push(device);
    }

    /// Deliver one device arrival through the subscribed handler.
    pub fn publish(&self, device: Arc<dyn BlockDevice>) {
        // The in-flight count is bumped while the handler lock is held,
        // so cancel() can never observe a drained notifier while a
        // just-started callback is still running.
        let handler = {
            let guard = self.inner.handler.lock().expect("notifier lock poisoned");
            let Some(handler) = guard.clone() else {
                return;
            };
            *self.inner.inflight.lock().expect("notifier lock poisoned") += 1;
            handler
        };
        handler(device);
        *self.inner.inflight.lock().expect("notifier lock poisoned") -= 1;
        self.inner.drained.notify_all();
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner
            .handler
            .lock()
            .expect("notifier lock poisoned")
            .is_some()
    }

    pub fn cancel_count(&self) -> usize {
        self.inner.cancels.load(Ordering::SeqCst)
    }
}

impl DeviceNotifier for SimNotifier {
    fn subscribe(&self, handler: ArrivalHandler) -> Result<Box<dyn Subscription>, HostError> {
        *self.inner.handler.lock().expect("notifier lock poisoned") = Some(handler.clone());
        let existing: Vec<_> = self
            .inner
            .existing
            .lock()
            .expect("notifier lock poisoned")
            .drain(..)
            .collect();
        for device in existing {
            handler(device);
        }
        Ok(Box::new(SimSubscription {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct SimSubscription {
    inner: Arc<NotifierInner>,
}

impl Subscription for SimSubscription {
    fn cancel(&mut self) {
        self.inner
            .handler
            .lock()
            .expect("notifier lock poisoned")
            .take();
        self.inner.cancels.fetch_add(1, Ordering::SeqCst);
        let mut inflight = self.inner.inflight.lock().expect("notifier lock poisoned");
        while *inflight > 0 {
            inflight = self
                .inner
                .drained
                .wait(inflight)
                .expect("notifier lock poisoned");
        }
    }
}

/// A storage engine that records what the worker asks of it.
#[derive(Default)]
pub struct RecordingEngine {
    refresh: Mutex<Option<Box<RefreshFn>>>,
    refuse_try_import: Mutex<bool>,
    try_import_delay: Mutex<Option<Duration>>,
    import_error: Mutex<Option<i32>>,
    imported: Mutex<Vec<String>>,
    bootfs: Mutex<Option<Bootfs>>,
    dataset_names: Mutex<HashMap<(String, u64), String>>,
    hijacks: AtomicU32,
    try_imports: AtomicU32,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transform applied by `try_import` instead of the identity.
    pub fn set_refresh(&self, f: impl Fn(NvList) -> NvList + Send + Sync + 'static) {
        *self.refresh.lock().expect("engine lock poisoned") = Some(Box::new(f));
    }

    pub fn refuse_try_import(&self) {
        *self.refuse_try_import.lock().expect("engine lock poisoned") = true;
    }

    /// Make `try_import` dwell, so tests can race teardown against it.
    pub fn set_try_import_delay(&self, delay: Duration) {
        *self.try_import_delay.lock().expect("engine lock poisoned") = Some(delay);
    }

    /// Make `import` fail with `code` until cleared.
    pub fn fail_imports(&self, code: i32) {
        *self.import_error.lock().expect("engine lock poisoned") = Some(code);
    }

    pub fn allow_imports(&self) {
        *self.import_error.lock().expect("engine lock poisoned") = None;
    }

    pub fn set_bootfs(&self, pool_name: &str, object_id: u64) {
        *self.bootfs.lock().expect("engine lock poisoned") = Some(Bootfs {
            pool_name: pool_name.to_string(),
            object_id,
        });
    }

    pub fn set_dataset_name(&self, pool_name: &str, object_id: u64, dataset: &str) {
        self.dataset_names
            .lock()
            .expect("engine lock poisoned")
            .insert((pool_name.to_string(), object_id), dataset.to_string());
    }

    pub fn imported_pools(&self) -> Vec<String> {
        self.imported.lock().expect("engine lock poisoned").clone()
    }

    pub fn try_import_count(&self) -> u32 {
        self.try_imports.load(Ordering::SeqCst)
    }

    pub fn hijack_count(&self) -> u32 {
        self.hijacks.load(Ordering::SeqCst)
    }
}

impl StorageEngine for RecordingEngine {
    fn try_import(&self, config: &NvList) -> Option<NvList> {
        self.try_imports.fetch_add(1, Ordering::SeqCst);
        let delay = *self.try_import_delay.lock().expect("engine lock poisoned");
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if *self.refuse_try_import.lock().expect("engine lock poisoned") {
            return None;
        }
        let refresh = self.refresh.lock().expect("engine lock poisoned");
        Some(match refresh.as_ref() {
            Some(f) => f(config.clone()),
            None => config.clone(),
        })
    }

    fn import(&self, pool_name: &str, _config: &NvList) -> Result<(), EngineError> {
        if let Some(code) = *self.import_error.lock().expect("engine lock poisoned") {
            return Err(EngineError::Import { code });
        }
        self.imported
            .lock()
            .expect("engine lock poisoned")
            .push(pool_name.to_string());
        Ok(())
    }

    fn bootfs(&self) -> Option<Bootfs> {
        self.bootfs.lock().expect("engine lock poisoned").clone()
    }

    fn dataset_name(&self, pool_name: &str, object_id: u64) -> Result<String, EngineError> {
        self.dataset_names
            .lock()
            .expect("engine lock poisoned")
            .get(&(pool_name.to_string(), object_id))
            .cloned()
            .ok_or(EngineError::UnknownDataset {
                pool: pool_name.to_string(),
                object_id,
            })
    }

    fn hijack_mountroot(&self) {
        self.hijacks.fetch_add(1, Ordering::SeqCst);
    }
}

/// A canned boot environment.
#[derive(Debug, Default)]
pub struct SimEnvironment {
    args: HashMap<String, String>,
    uptime: Duration,
    boot_uuid: Option<String>,
}

impl SimEnvironment {
    /// Defaults to early boot (five seconds of uptime) with no boot
    /// arguments and no boot-uuid resource.
    pub fn new() -> Self {
        Self {
            args: HashMap::new(),
            uptime: Duration::from_secs(5),
            boot_uuid: None,
        }
    }

    pub fn with_arg(mut self, name: &str, value: &str) -> Self {
        self.args.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_uptime(mut self, uptime: Duration) -> Self {
        self.uptime = uptime;
        self
    }

    pub fn with_boot_uuid(mut self, uuid: &str) -> Self {
        self.boot_uuid = Some(uuid.to_string());
        self
    }
}

impl BootEnvironment for SimEnvironment {
    fn boot_arg(&self, name: &str) -> Option<String> {
        self.args.get(name).cloned()
    }

    fn uptime(&self) -> Duration {
        self.uptime
    }

    fn boot_uuid(&self) -> Option<String> {
        self.boot_uuid.clone()
    }
}

/// A boot-device host whose media appears after a configurable number of
/// polls.
#[derive(Default)]
pub struct SimBootHost {
    inner: Arc<BootHostInner>,
}

#[derive(Default)]
struct BootHostInner {
    registered: Mutex<Option<String>>,
    polls_until_media: AtomicU32,
    stamps: Mutex<Vec<(String, String)>>,
    reregisters: AtomicU32,
}

impl SimBootHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report no media for the first `polls` queries.
    pub fn with_publish_delay(self, polls: u32) -> Self {
        self.inner.polls_until_media.store(polls, Ordering::SeqCst);
        self
    }

    pub fn registered_product(&self) -> Option<String> {
        self.inner
            .registered
            .lock()
            .expect("boot host lock poisoned")
            .clone()
    }

    pub fn stamps(&self) -> Vec<(String, String)> {
        self.inner
            .stamps
            .lock()
            .expect("boot host lock poisoned")
            .clone()
    }

    pub fn reregister_count(&self) -> u32 {
        self.inner.reregisters.load(Ordering::SeqCst)
    }
}

impl BootDeviceHost for SimBootHost {
    fn register(&self, device: &VirtualBootDevice) -> Result<(), PublishError> {
        *self
            .inner
            .registered
            .lock()
            .expect("boot host lock poisoned") = Some(device.product().to_string());
        Ok(())
    }

    fn published_media(&self) -> Option<Box<dyn BootMedia>> {
        if self
            .inner
            .registered
            .lock()
            .expect("boot host lock poisoned")
            .is_none()
        {
            return None;
        }
        let remaining = self.inner.polls_until_media.load(Ordering::SeqCst);
        if remaining > 0 {
            self.inner
                .polls_until_media
                .store(remaining - 1, Ordering::SeqCst);
            return None;
        }
        Some(Box::new(SimBootMedia {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct SimBootMedia {
    inner: Arc<BootHostInner>,
}

impl BootMedia for SimBootMedia {
    fn bsd_name(&self) -> String {
        "disk10".to_string()
    }

    fn bsd_unit(&self) -> u32 {
        10
    }

    fn bsd_major(&self) -> u32 {
        1
    }

    fn bsd_minor(&self) -> u32 {
        0
    }

    fn stamp(&mut self, content_hint: &str, uuid: &str) {
        self.inner
            .stamps
            .lock()
            .expect("boot host lock poisoned")
            .push((content_hint.to_string(), uuid.to_string()));
    }

    fn reregister(&self) {
        self.inner.reregisters.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
pub(crate) fn test_shared(pool_name: &str) -> Arc<crate::discovery::Shared> {
    use crate::aggregate::PoolList;
    use crate::bootargs::BootTarget;
    use crate::discovery::{DiscoveryState, Shared};
    use crate::telemetry::DiscoveryStats;
    use std::sync::atomic::AtomicBool;

    Arc::new(Shared {
        target: BootTarget {
            pool_name: Some(pool_name.to_string()),
            pool_guid: 0,
        },
        state: Mutex::new(DiscoveryState {
            disks: HashMap::new(),
            pools: PoolList::new(),
        }),
        cv: Condvar::new(),
        terminating: AtomicBool::new(false),
        subscription: Mutex::new(None),
        engine: Arc::new(RecordingEngine::new()),
        boot_host: Arc::new(SimBootHost::new()),
        env: Arc::new(SimEnvironment::new()),
        stats: DiscoveryStats::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_reader_truncates_at_end_of_device() {
        let media = MemMedia::new("disk1", 100);
        let mut reader = media.open_readonly().unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(reader.read_at(90, &mut buf).unwrap(), 10);
        assert_eq!(reader.read_at(100, &mut buf).unwrap(), 0);
        assert_eq!(reader.read_at(0, &mut buf).unwrap(), 64);
    }

    #[test]
    fn cancelled_notifier_drops_arrivals() {
        let notifier = SimNotifier::new();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        let mut subscription = notifier
            .subscribe(Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        notifier.publish(Arc::new(MemMedia::new("disk1", 0)));
        subscription.cancel();
        notifier.publish(Arc::new(MemMedia::new("disk2", 0)));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
