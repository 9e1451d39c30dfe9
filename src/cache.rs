//! Background object cache.
//!
//! `ensure(oid)` is the hydration entry point: concurrent calls for the same
//! object share one in-flight fetch (single-flight), and misses that land
//! within the batch window coalesce into a single pack request instead of a
//! storm of singleton downloads. Waiters are counted so that when the last
//! interested caller cancels, the fetch is aborted instead of finishing for
//! nobody. A blob-size sidecar answers stat without touching blob bodies.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::Path,
    sync::{
        Arc, Mutex, OnceLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::{
    errors::GvfsError,
    http::requester::ObjectRequester,
    object::store::ObjectStore,
    oid::ObjectId,
    zlib,
};

/// The wire seam the cache fetches through; production is [`ObjectRequester`],
/// tests script their own.
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    /// One deflated loose object.
    async fn fetch_object(&self, oid: &ObjectId) -> Result<Bytes, GvfsError>;
    /// A packfile covering the batch.
    async fn fetch_batch(&self, oids: &[ObjectId]) -> Result<Bytes, GvfsError>;
}

#[async_trait]
impl ObjectFetcher for ObjectRequester {
    async fn fetch_object(&self, oid: &ObjectId) -> Result<Bytes, GvfsError> {
        self.get_object(oid).await
    }

    async fn fetch_batch(&self, oids: &[ObjectId]) -> Result<Bytes, GvfsError> {
        self.post_batch(oids, true).await
    }
}

/// One fetch task serving one or more coalesced object ids.
struct FetchJob {
    oids: Mutex<Vec<ObjectId>>,
    /// Callers currently awaiting any flight on this job.
    waiters: AtomicUsize,
    /// Open while new misses may still join the batch window.
    accepting: AtomicBool,
    finished: AtomicBool,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Per-oid rendezvous between the fetch task and its waiters.
struct Flight {
    job: Arc<FetchJob>,
    completed: AtomicBool,
    notify: Notify,
    /// `None` is success; a message is the failure handed to waiters.
    outcome: OnceLock<Option<String>>,
}

impl Flight {
    fn finish(&self, outcome: Option<String>) {
        let _ = self.outcome.set(outcome);
        self.completed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}

/// Persisted `oid → content size` map so stat never reads blob bodies.
pub struct BlobSizes {
    map: DashMap<ObjectId, u64>,
    writer: Mutex<File>,
}

impl BlobSizes {
    /// Load the sidecar, tolerating a torn final line.
    pub fn open(path: &Path) -> Result<BlobSizes, GvfsError> {
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let map = DashMap::new();
        for line in contents.lines() {
            let Some((oid, size)) = line.split_once(' ') else {
                continue;
            };
            if let (Ok(oid), Ok(size)) = (oid.parse::<ObjectId>(), size.parse::<u64>()) {
                map.insert(oid, size);
            }
        }
        Ok(BlobSizes {
            map,
            writer: Mutex::new(file),
        })
    }

    pub fn get(&self, oid: &ObjectId) -> Option<u64> {
        self.map.get(oid).map(|entry| *entry)
    }

    /// Record a newly learned size; duplicate records are ignored.
    pub fn record(&self, oid: ObjectId, size: u64) {
        if self.map.insert(oid, size).is_some() {
            return;
        }
        let mut writer = self.writer.lock().expect("blob size writer lock poisoned");
        if let Err(e) = writer
            .write_all(format!("{oid} {size}\n").as_bytes())
            .and_then(|_| writer.sync_data())
        {
            warn!(error = %e, "blob size append failed");
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

struct CacheInner {
    store: Arc<ObjectStore>,
    fetcher: Arc<dyn ObjectFetcher>,
    flights: DashMap<ObjectId, Arc<Flight>>,
    open_job: Mutex<Option<Arc<FetchJob>>>,
    sizes: BlobSizes,
    batch_window: Duration,
}

/// The background object cache shared by every callback worker.
#[derive(Clone)]
pub struct ObjectCache {
    inner: Arc<CacheInner>,
}

/// Decrements the waiter count on drop; the last leaver aborts the job.
struct WaiterGuard {
    inner: Arc<CacheInner>,
    flight: Arc<Flight>,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        let job = &self.flight.job;
        if job.waiters.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if job.finished.load(Ordering::Acquire) {
            return;
        }
        // Last waiter cancelled while the fetch is still running: nobody is
        // interested in the result anymore.
        debug!("aborting fetch job with no remaining waiters");
        job.finished.store(true, Ordering::Release);
        job.accepting.store(false, Ordering::Release);
        if let Some(handle) = job.handle.lock().expect("job handle lock poisoned").take() {
            handle.abort();
        }
        let mut open = self.inner.open_job.lock().expect("open job lock poisoned");
        if open.as_ref().is_some_and(|candidate| Arc::ptr_eq(candidate, job)) {
            *open = None;
        }
        drop(open);
        for oid in job.oids.lock().expect("job oid lock poisoned").iter() {
            if let Some((_, flight)) = self.inner.flights.remove(oid) {
                flight.finish(Some("fetch aborted: no waiters remain".into()));
            }
        }
    }
}

impl ObjectCache {
    pub fn new(
        store: Arc<ObjectStore>,
        fetcher: Arc<dyn ObjectFetcher>,
        sizes: BlobSizes,
        batch_window: Duration,
    ) -> ObjectCache {
        ObjectCache {
            inner: Arc::new(CacheInner {
                store,
                fetcher,
                flights: DashMap::new(),
                open_job: Mutex::new(None),
                sizes,
                batch_window,
            }),
        }
    }

    /// Make `oid` readable from the local store, downloading it if needed.
    /// Concurrent calls for the same id share one fetch.
    pub async fn ensure(&self, oid: ObjectId) -> Result<(), GvfsError> {
        if self.inner.store.has_object(&oid) {
            return Ok(());
        }
        let flight = self.join_flight(oid);
        let guard = WaiterGuard {
            inner: self.inner.clone(),
            flight: flight.clone(),
        };

        loop {
            if flight.completed.load(Ordering::Acquire) {
                break;
            }
            let mut notified = Box::pin(flight.notify.notified());
            notified.as_mut().enable();
            if flight.completed.load(Ordering::Acquire) {
                break;
            }
            notified.await;
        }
        drop(guard);

        match flight.outcome.get() {
            Some(None) => Ok(()),
            Some(Some(message)) => Err(GvfsError::CustomError(format!(
                "hydration of {oid} failed: {message}"
            ))),
            None => Err(GvfsError::Invariant(
                "flight completed without an outcome".into(),
            )),
        }
    }

    /// Read an object's bytes, hydrating first when absent.
    pub async fn read(&self, oid: ObjectId) -> Result<(crate::object::ObjectKind, Vec<u8>), GvfsError> {
        self.ensure(oid).await?;
        let found = self.inner.store.read_object(&oid)?;
        self.inner.sizes.record(oid, found.1.len() as u64);
        Ok(found)
    }

    /// Content size for stat answers: the sidecar first, then the local
    /// store. `None` means only a download could answer.
    pub fn known_size(&self, oid: &ObjectId) -> Option<u64> {
        if let Some(size) = self.inner.sizes.get(oid) {
            return Some(size);
        }
        if self.inner.store.has_object(oid)
            && let Ok(size) = self.inner.store.object_size(oid)
        {
            self.inner.sizes.record(*oid, size);
            return Some(size);
        }
        None
    }

    pub fn record_size(&self, oid: ObjectId, size: u64) {
        self.inner.sizes.record(oid, size);
    }

    /// Objects currently being fetched; heartbeat counter.
    pub fn in_flight(&self) -> usize {
        self.inner.flights.len()
    }

    pub fn sizes_known(&self) -> usize {
        self.inner.sizes.len()
    }

    /// Find or create the flight for `oid`, joining the open batch window
    /// when one is accepting.
    fn join_flight(&self, oid: ObjectId) -> Arc<Flight> {
        use dashmap::mapref::entry::Entry;
        match self.inner.flights.entry(oid) {
            Entry::Occupied(existing) => {
                let flight = existing.get().clone();
                flight.job.waiters.fetch_add(1, Ordering::AcqRel);
                flight
            }
            Entry::Vacant(vacant) => {
                let job = self.join_or_spawn_job(oid);
                job.waiters.fetch_add(1, Ordering::AcqRel);
                let flight = Arc::new(Flight {
                    job,
                    completed: AtomicBool::new(false),
                    notify: Notify::new(),
                    outcome: OnceLock::new(),
                });
                vacant.insert(flight.clone());
                flight
            }
        }
    }

    fn join_or_spawn_job(&self, oid: ObjectId) -> Arc<FetchJob> {
        let mut open = self.inner.open_job.lock().expect("open job lock poisoned");
        if let Some(job) = open.as_ref()
            && job.accepting.load(Ordering::Acquire)
        {
            job.oids.lock().expect("job oid lock poisoned").push(oid);
            return job.clone();
        }
        let job = Arc::new(FetchJob {
            oids: Mutex::new(vec![oid]),
            waiters: AtomicUsize::new(0),
            accepting: AtomicBool::new(true),
            finished: AtomicBool::new(false),
            handle: Mutex::new(None),
        });
        *open = Some(job.clone());
        drop(open);

        let inner = self.inner.clone();
        let task_job = job.clone();
        let handle = tokio::spawn(async move {
            run_job(inner, task_job).await;
        });
        *job.handle.lock().expect("job handle lock poisoned") = Some(handle);
        job
    }
}

/// Drive one job: let the window fill, then fetch as a batch or a singleton,
/// then settle every flight.
async fn run_job(inner: Arc<CacheInner>, job: Arc<FetchJob>) {
    tokio::time::sleep(inner.batch_window).await;
    job.accepting.store(false, Ordering::Release);
    {
        let mut open = inner.open_job.lock().expect("open job lock poisoned");
        if open.as_ref().is_some_and(|candidate| Arc::ptr_eq(candidate, &job)) {
            *open = None;
        }
    }
    let oids = job.oids.lock().expect("job oid lock poisoned").clone();

    let mut outcomes: HashMap<ObjectId, Option<String>> = HashMap::new();
    if oids.len() == 1 {
        let oid = oids[0];
        outcomes.insert(oid, fetch_one(&inner, &oid).await.err().map(|e| e.to_string()));
    } else {
        info!(count = oids.len(), "coalesced object misses into one pack request");
        match fetch_pack(&inner, &oids).await {
            Ok(()) => {
                for oid in &oids {
                    if inner.store.has_object(oid) {
                        outcomes.insert(*oid, None);
                    } else {
                        // The pack did not cover this id; fall back to the
                        // singleton endpoint.
                        outcomes.insert(
                            *oid,
                            fetch_one(&inner, oid).await.err().map(|e| e.to_string()),
                        );
                    }
                }
            }
            Err(batch_error) => {
                warn!(error = %batch_error, "batch download failed; falling back to singletons");
                for oid in &oids {
                    outcomes.insert(
                        *oid,
                        fetch_one(&inner, oid).await.err().map(|e| e.to_string()),
                    );
                }
            }
        }
    }

    job.finished.store(true, Ordering::Release);
    for oid in &oids {
        if let Some((_, flight)) = inner.flights.remove(oid) {
            flight.finish(outcomes.remove(oid).flatten());
        }
    }
}

/// Download, verify, and persist one loose object.
async fn fetch_one(inner: &CacheInner, oid: &ObjectId) -> Result<(), GvfsError> {
    let compressed = inner.fetcher.fetch_object(oid).await?;
    let (kind, data) = zlib::inflate_loose(&compressed)
        .map_err(|_| GvfsError::CorruptObject(oid.to_string(), "bad zlib from service".into()))?;
    let actual = ObjectId::for_object(kind, &data);
    if actual != *oid {
        return Err(GvfsError::CorruptObject(
            oid.to_string(),
            format!("service bytes hashed to {actual}"),
        ));
    }
    inner.store.write_loose_compressed(oid, &compressed)?;
    inner.sizes.record(*oid, data.len() as u64);
    Ok(())
}

/// Download one pack covering the batch and install it.
async fn fetch_pack(inner: &CacheInner, oids: &[ObjectId]) -> Result<(), GvfsError> {
    let bytes = inner.fetcher.fetch_batch(oids).await?;
    inner.store.write_pack(&bytes).await?;
    Ok(())
}
