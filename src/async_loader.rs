// src/async_loader.rs
//! # Asynchronous resource loading
//!
//! Decoding happens on a [`WorkerPool`]; GPU upload happens on whichever thread
//! calls [`AsyncResourceLoader::process_completed_loads`] with the
//! [`ResourceManager`].
//!
//! ```text
//! load_*_async ──► requests (Pending) ──► worker: Loading → decode ──► completion channel
//!                                                                         │
//! callbacks / futures ◄── upload via ResourceManager ◄── process_completed_loads (main thread)
//! ```
//!
//! - **Dedup**: requests for the same (kind, path, options) share one decode
//!   until the result is drained; every waiter receives the same outcome.
//! - **Cancellation**: only while Pending. Cancelled callbacks are dropped
//!   without running; cancelled futures resolve to [`Error::Cancelled`].
//! - **Workers** touch only the request map, the progress callback and the
//!   completion channels. Pools and caches are main-thread only.
//!
//! Lock order: `requests`, then a waiter map. Waiters run outside both.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::asset::{AssetDecoder, LoadStatus, ResourceKind};
use crate::error::{Error, Result};
use crate::gltf_loader::{ModelData, ModelDesc};
use crate::gpu::backend::GpuBackend;
use crate::gpu::handle::Handle;
use crate::offload::{Priority, WorkerPool};
use crate::resource_manager::{ModelHandle, PooledResource, ResourceManager, TextureHandle};
use crate::texture_importer::{ImportError, TextureData, TextureDesc};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub worker_threads: usize,
    pub thread_name: String,
    /// Per-queue cap used by [`AsyncResourceLoader::process_frame`]. 0 = no cap.
    pub max_loads_per_frame: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            thread_name: "slop-loader".into(),
            max_loads_per_frame: 8,
        }
    }
}

impl LoaderConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

// ============================================================================
// Futures
// ============================================================================

struct FutureSlot<H> {
    value: Mutex<Option<Result<H>>>,
    ready: Condvar,
}

impl<H> FutureSlot<H> {
    fn resolve(&self, result: Result<H>) {
        *self.value.lock() = Some(result);
        self.ready.notify_all();
    }
}

/// Blocking handle to the outcome of an async load.
///
/// Resolved by `process_completed_loads`, so waiting on it from the thread that
/// drains the loader, before draining, never returns.
pub struct LoadFuture<H> {
    slot: Arc<FutureSlot<H>>,
}

impl<H: Clone> LoadFuture<H> {
    fn ready(result: Result<H>) -> Self {
        Self {
            slot: Arc::new(FutureSlot {
                value: Mutex::new(Some(result)),
                ready: Condvar::new(),
            }),
        }
    }

    pub fn wait(&self) -> Result<H> {
        let mut value = self.slot.value.lock();
        loop {
            if let Some(result) = value.as_ref() {
                return result.clone();
            }
            self.slot.ready.wait(&mut value);
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<H>> {
        let deadline = Instant::now() + timeout;
        let mut value = self.slot.value.lock();
        while value.is_none() {
            if self.slot.ready.wait_until(&mut value, deadline).timed_out() {
                break;
            }
        }
        value.clone()
    }

    pub fn try_get(&self) -> Option<Result<H>> {
        self.slot.value.lock().clone()
    }

    pub fn is_ready(&self) -> bool {
        self.slot.value.lock().is_some()
    }
}

/// Write side of a [`LoadFuture`]. Dropping it unfulfilled cancels the future.
struct Promise<H> {
    slot: Option<Arc<FutureSlot<H>>>,
}

impl<H> Promise<H> {
    fn fulfil(mut self, result: Result<H>) {
        if let Some(slot) = self.slot.take() {
            slot.resolve(result);
        }
    }
}

impl<H> Drop for Promise<H> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.resolve(Err(Error::Cancelled));
        }
    }
}

fn promise<H: Clone>() -> (Promise<H>, LoadFuture<H>) {
    let slot = Arc::new(FutureSlot {
        value: Mutex::new(None),
        ready: Condvar::new(),
    });
    (
        Promise {
            slot: Some(Arc::clone(&slot)),
        },
        LoadFuture { slot },
    )
}

enum Waiter<H> {
    Callback(Box<dyn FnOnce(Result<H>) + Send + 'static>),
    Promise(Promise<H>),
}

impl<H> Waiter<H> {
    fn deliver(self, result: Result<H>) {
        match self {
            Waiter::Callback(callback) => callback(result),
            Waiter::Promise(promise) => promise.fulfil(result),
        }
    }

    /// Callbacks are dropped uninvoked; futures observe `err`.
    fn abandon(self, err: Error) {
        if let Waiter::Promise(promise) = self {
            promise.fulfil(Err(err));
        }
    }
}

type WaiterMap<H> = Mutex<HashMap<LoadKey, Vec<Waiter<H>>>>;

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LoadKey {
    kind: ResourceKind,
    path: PathBuf,
    options: u64,
}

/// Snapshot of a tracked request.
#[derive(Debug, Clone)]
pub struct LoadRequestInfo {
    pub id: u64,
    pub path: PathBuf,
    pub kind: ResourceKind,
    pub status: LoadStatus,
    pub priority: Priority,
    pub progress: f32,
}

struct Completion<D: Decodable> {
    key: LoadKey,
    id: u64,
    desc: D,
    result: Result<D::Payload>,
}

type ProgressCallback = Arc<dyn Fn(&Path, f32) + Send + Sync + 'static>;

/// State shared with worker threads.
struct Shared {
    requests: Mutex<HashMap<LoadKey, LoadRequestInfo>>,
    progress_callback: RwLock<Option<ProgressCallback>>,
    decoder: Arc<dyn AssetDecoder>,
    texture_tx: Sender<Completion<TextureDesc>>,
    model_tx: Sender<Completion<ModelDesc>>,
}

impl Shared {
    fn report_progress(&self, key: &LoadKey, id: u64, value: f32) {
        let value = value.clamp(0.0, 1.0);
        if let Some(info) = self.requests.lock().get_mut(key) {
            if info.id == id {
                info.progress = value;
            }
        }
        let callback = self.progress_callback.read().clone();
        if let Some(callback) = callback {
            callback(&key.path, value);
        }
    }
}

/// Options types that select a decoder and a completion queue.
trait Decodable: Copy + Send + 'static {
    type Payload: Send + 'static;
    const KIND: ResourceKind;

    fn options_key(&self) -> u64;

    fn decode(
        &self,
        decoder: &dyn AssetDecoder,
        path: &Path,
        progress: &dyn Fn(f32),
    ) -> std::result::Result<Self::Payload, ImportError>;

    fn sender(shared: &Shared) -> &Sender<Completion<Self>>;
}

impl Decodable for TextureDesc {
    type Payload = TextureData;
    const KIND: ResourceKind = ResourceKind::Texture;

    fn options_key(&self) -> u64 {
        self.cache_key()
    }

    fn decode(
        &self,
        decoder: &dyn AssetDecoder,
        path: &Path,
        progress: &dyn Fn(f32),
    ) -> std::result::Result<TextureData, ImportError> {
        decoder.decode_texture(path, self, progress)
    }

    fn sender(shared: &Shared) -> &Sender<Completion<Self>> {
        &shared.texture_tx
    }
}

impl Decodable for ModelDesc {
    type Payload = ModelData;
    const KIND: ResourceKind = ResourceKind::Model;

    fn options_key(&self) -> u64 {
        self.cache_key()
    }

    fn decode(
        &self,
        decoder: &dyn AssetDecoder,
        path: &Path,
        progress: &dyn Fn(f32),
    ) -> std::result::Result<ModelData, ImportError> {
        decoder.decode_model(path, self, progress)
    }

    fn sender(shared: &Shared) -> &Sender<Completion<Self>> {
        &shared.model_tx
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Worker side of a load. Runs on a pool thread.
fn run_load<D: Decodable>(shared: &Shared, key: LoadKey, id: u64, desc: D) {
    {
        let mut requests = shared.requests.lock();
        match requests.get_mut(&key) {
            Some(info) if info.id == id && info.status == LoadStatus::Pending => {
                info.status = LoadStatus::Loading;
            }
            _ => {
                debug!("Skipping cancelled {} load: {}", D::KIND, key.path.display());
                return;
            }
        }
    }

    let progress = |value: f32| shared.report_progress(&key, id, value);
    let decoded = panic::catch_unwind(AssertUnwindSafe(|| {
        desc.decode(shared.decoder.as_ref(), &key.path, &progress)
    }));
    let result = match decoded {
        Ok(Ok(payload)) => Ok(payload),
        Ok(Err(err)) => Err(Error::decode(&key.path, err)),
        Err(panic) => Err(Error::decode(
            &key.path,
            ImportError::Panicked(panic_message(&*panic)),
        )),
    };

    {
        let mut requests = shared.requests.lock();
        if let Some(info) = requests.get_mut(&key) {
            if info.id == id {
                match &result {
                    Ok(_) => {
                        info.status = LoadStatus::Completed;
                        info.progress = 1.0;
                    }
                    Err(_) => info.status = LoadStatus::Failed,
                }
            }
        }
    }
    if let Err(err) = &result {
        warn!("{} decode failed: {err}", D::KIND);
    }

    let completion = Completion {
        key,
        id,
        desc,
        result,
    };
    if D::sender(shared).send(completion).is_err() {
        debug!("Loader gone; dropping decoded {}", D::KIND);
    }
}

// ============================================================================
// AsyncResourceLoader
// ============================================================================

pub struct AsyncResourceLoader<B: GpuBackend> {
    config: LoaderConfig,
    shared: Arc<Shared>,
    pool: WorkerPool,
    texture_rx: Receiver<Completion<TextureDesc>>,
    model_rx: Receiver<Completion<ModelDesc>>,
    texture_waiters: WaiterMap<TextureHandle<B>>,
    model_waiters: WaiterMap<ModelHandle<B>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    _backend: PhantomData<fn() -> B>,
}

impl<B: GpuBackend> AsyncResourceLoader<B> {
    pub fn new(config: LoaderConfig, decoder: Arc<dyn AssetDecoder>) -> Result<Self> {
        let pool = WorkerPool::new(config.worker_threads, &config.thread_name)
            .map_err(|e| Error::from(e).context("failed to start loader workers"))?;
        let (texture_tx, texture_rx) = unbounded();
        let (model_tx, model_rx) = unbounded();

        info!(
            "Async resource loader started ({} workers)",
            pool.thread_count()
        );
        Ok(Self {
            config,
            shared: Arc::new(Shared {
                requests: Mutex::new(HashMap::new()),
                progress_callback: RwLock::new(None),
                decoder,
                texture_tx,
                model_tx,
            }),
            pool,
            texture_rx,
            model_rx,
            texture_waiters: Mutex::new(HashMap::new()),
            model_waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
            _backend: PhantomData,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    // ---------- Enqueue ----------

    /// `callback` runs on the thread that calls `process_completed_loads`.
    /// After shutdown began it is dropped and `ShutdownInProgress` is returned.
    pub fn load_texture_async<F>(
        &self,
        path: impl AsRef<Path>,
        desc: &TextureDesc,
        priority: Priority,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<TextureHandle<B>>) + Send + 'static,
    {
        self.enqueue(
            path.as_ref(),
            *desc,
            priority,
            &self.texture_waiters,
            Waiter::Callback(Box::new(callback)),
        )
    }

    pub fn load_model_async<F>(
        &self,
        path: impl AsRef<Path>,
        desc: &ModelDesc,
        priority: Priority,
        callback: F,
    ) -> Result<()>
    where
        F: FnOnce(Result<ModelHandle<B>>) + Send + 'static,
    {
        self.enqueue(
            path.as_ref(),
            *desc,
            priority,
            &self.model_waiters,
            Waiter::Callback(Box::new(callback)),
        )
    }

    pub fn load_texture_future(
        &self,
        path: impl AsRef<Path>,
        desc: &TextureDesc,
        priority: Priority,
    ) -> LoadFuture<TextureHandle<B>> {
        let (promise, future) = promise();
        match self.enqueue(
            path.as_ref(),
            *desc,
            priority,
            &self.texture_waiters,
            Waiter::Promise(promise),
        ) {
            Ok(()) => future,
            Err(err) => LoadFuture::ready(Err(err)),
        }
    }

    pub fn load_model_future(
        &self,
        path: impl AsRef<Path>,
        desc: &ModelDesc,
        priority: Priority,
    ) -> LoadFuture<ModelHandle<B>> {
        let (promise, future) = promise();
        match self.enqueue(
            path.as_ref(),
            *desc,
            priority,
            &self.model_waiters,
            Waiter::Promise(promise),
        ) {
            Ok(()) => future,
            Err(err) => LoadFuture::ready(Err(err)),
        }
    }

    fn enqueue<D: Decodable, H>(
        &self,
        path: &Path,
        desc: D,
        priority: Priority,
        waiters: &WaiterMap<H>,
        waiter: Waiter<H>,
    ) -> Result<()> {
        let key = LoadKey {
            kind: D::KIND,
            path: path.to_path_buf(),
            options: desc.options_key(),
        };

        let id = {
            let mut requests = self.shared.requests.lock();
            if self.shutting_down.load(Ordering::Acquire) {
                return Err(Error::ShutdownInProgress);
            }
            let mut waiters = waiters.lock();
            if let Some(info) = requests.get(&key) {
                debug!(
                    "Joining in-flight {} load: {} (request {})",
                    D::KIND,
                    path.display(),
                    info.id
                );
                waiters.entry(key).or_default().push(waiter);
                return Ok(());
            }

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            requests.insert(
                key.clone(),
                LoadRequestInfo {
                    id,
                    path: key.path.clone(),
                    kind: D::KIND,
                    status: LoadStatus::Pending,
                    priority,
                    progress: 0.0,
                },
            );
            waiters.insert(key.clone(), vec![waiter]);
            id
        };

        debug!("Queued {} load: {} (request {id})", D::KIND, path.display());
        let shared = Arc::clone(&self.shared);
        let job_key = key.clone();
        if self
            .pool
            .submit(priority, move || run_load(&shared, job_key, id, desc))
        {
            return Ok(());
        }

        // Pool already stopped: undo the bookkeeping.
        let abandoned = {
            let mut requests = self.shared.requests.lock();
            if requests.get(&key).map(|info| info.id) == Some(id) {
                requests.remove(&key);
                waiters.lock().remove(&key).unwrap_or_default()
            } else {
                Vec::new()
            }
        };
        for waiter in abandoned {
            waiter.abandon(Error::ShutdownInProgress);
        }
        Err(Error::ShutdownInProgress)
    }

    // ---------- Main-thread drain ----------

    /// Uploads decoded payloads and resolves their waiters. Handles at most
    /// `max_count` completions per kind; 0 drains everything. Returns the number
    /// of completions taken off the queues.
    pub fn process_completed_loads(&self, manager: &mut ResourceManager<B>, max_count: usize) -> usize {
        let limit = if max_count == 0 { usize::MAX } else { max_count };
        let mut processed = 0;

        for completion in self.texture_rx.try_iter().take(limit) {
            self.finish(manager, completion, &self.texture_waiters, |m, path, desc, data| {
                m.upload_texture_data(path, desc, data)
            });
            processed += 1;
        }
        for completion in self.model_rx.try_iter().take(limit) {
            self.finish(manager, completion, &self.model_waiters, |m, path, desc, data| {
                m.upload_model_data(path, desc, data)
            });
            processed += 1;
        }

        processed
    }

    /// `process_completed_loads` capped by `LoaderConfig::max_loads_per_frame`.
    pub fn process_frame(&self, manager: &mut ResourceManager<B>) -> usize {
        self.process_completed_loads(manager, self.config.max_loads_per_frame)
    }

    fn finish<D, R, U>(
        &self,
        manager: &mut ResourceManager<B>,
        completion: Completion<D>,
        waiters: &WaiterMap<Handle<R>>,
        upload: U,
    ) where
        D: Decodable,
        R: PooledResource<B>,
        U: FnOnce(&mut ResourceManager<B>, &Path, &D, D::Payload) -> Result<Handle<R>>,
    {
        let Completion {
            key,
            id,
            desc,
            result,
        } = completion;

        let tracked = self
            .shared
            .requests
            .lock()
            .get(&key)
            .map_or(false, |info| info.id == id);
        if !tracked {
            debug!("Dropping result of untracked load: {}", key.path.display());
            return;
        }

        let outcome = result.and_then(|payload| upload(manager, &key.path, &desc, payload));

        let waiting = {
            let mut requests = self.shared.requests.lock();
            requests.remove(&key);
            waiters.lock().remove(&key).unwrap_or_default()
        };

        match &outcome {
            Ok(handle) => {
                // One reference per waiter; nobody left means nobody holds it.
                if waiting.is_empty() {
                    manager.release(*handle);
                }
                for _ in 1..waiting.len() {
                    manager.retain(*handle);
                }
                info!(
                    "Async {} load finished: {} -> {:?} ({} waiters)",
                    D::KIND,
                    key.path.display(),
                    handle,
                    waiting.len()
                );
            }
            Err(err) => error!("Async {} load failed: {err}", D::KIND),
        }

        for waiter in waiting {
            waiter.deliver(outcome.clone());
        }
    }

    // ---------- Cancellation ----------

    /// Cancels every Pending request for `path`, whatever its options. Requests a
    /// worker already picked up are not affected.
    pub fn cancel_load(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let cancelled = self.cancel_where(|key| key.path == path);
        if cancelled > 0 {
            info!("Cancelled {cancelled} pending load(s) of {}", path.display());
        }
        cancelled > 0
    }

    pub fn cancel_all_pending(&self) -> usize {
        let cancelled = self.cancel_where(|_| true);
        if cancelled > 0 {
            info!("Cancelled {cancelled} pending load(s)");
        }
        cancelled
    }

    fn cancel_where(&self, matches: impl Fn(&LoadKey) -> bool) -> usize {
        let (textures, models, count) = {
            let mut requests = self.shared.requests.lock();
            let keys: Vec<LoadKey> = requests
                .iter()
                .filter(|(key, info)| info.status == LoadStatus::Pending && matches(*key))
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                requests.remove(key);
            }

            let mut texture_waiters = self.texture_waiters.lock();
            let mut model_waiters = self.model_waiters.lock();
            let textures: Vec<_> = keys
                .iter()
                .filter_map(|key| texture_waiters.remove(key))
                .flatten()
                .collect();
            let models: Vec<_> = keys
                .iter()
                .filter_map(|key| model_waiters.remove(key))
                .flatten()
                .collect();
            (textures, models, keys.len())
        };

        for waiter in textures {
            waiter.abandon(Error::Cancelled);
        }
        for waiter in models {
            waiter.abandon(Error::Cancelled);
        }
        count
    }

    // ---------- Queries ----------

    /// Blocks until no decode is queued or running. Completions still need a drain.
    pub fn wait_for_all(&self) {
        self.pool.wait_idle();
    }

    pub fn is_loading(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        self.shared.requests.lock().keys().any(|key| key.path == path)
    }

    /// Status of the oldest tracked request for `path`.
    pub fn load_status(&self, path: impl AsRef<Path>) -> Option<LoadStatus> {
        self.oldest_request(path.as_ref()).map(|info| info.status)
    }

    pub fn progress(&self, path: impl AsRef<Path>) -> Option<f32> {
        self.oldest_request(path.as_ref()).map(|info| info.progress)
    }

    fn oldest_request(&self, path: &Path) -> Option<LoadRequestInfo> {
        self.shared
            .requests
            .lock()
            .values()
            .filter(|info| info.path == path)
            .min_by_key(|info| info.id)
            .cloned()
    }

    /// Tracked requests, oldest first.
    pub fn requests(&self) -> Vec<LoadRequestInfo> {
        let mut requests: Vec<_> = self.shared.requests.lock().values().cloned().collect();
        requests.sort_by_key(|info| info.id);
        requests
    }

    /// Requests enqueued and not yet drained.
    pub fn pending_count(&self) -> usize {
        self.shared.requests.lock().len()
    }

    /// Decoded results waiting for `process_completed_loads`.
    pub fn completed_count(&self) -> usize {
        self.texture_rx.len() + self.model_rx.len()
    }

    /// Called from worker threads with values in `0.0..=1.0`.
    pub fn set_progress_callback<F>(&self, callback: F)
    where
        F: Fn(&Path, f32) + Send + Sync + 'static,
    {
        *self.shared.progress_callback.write() = Some(Arc::new(callback));
    }

    pub fn clear_progress_callback(&self) {
        *self.shared.progress_callback.write() = None;
    }

    // ---------- Shutdown ----------

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Rejects new loads, cancels pending ones, lets running decodes finish and
    /// drains everything into `manager`. Idempotent.
    pub fn shutdown(&self, manager: &mut ResourceManager<B>) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        // Any enqueue that saw the flag unset has finished inserting.
        drop(self.shared.requests.lock());

        let cancelled = self.cancel_all_pending();
        self.pool.shutdown();
        let drained = self.process_completed_loads(manager, 0);
        info!("Async resource loader shut down ({cancelled} cancelled, {drained} drained)");
    }
}

impl<B: GpuBackend> Drop for AsyncResourceLoader<B> {
    fn drop(&mut self) {
        if !self.shutting_down.swap(true, Ordering::AcqRel) {
            drop(self.shared.requests.lock());
            // Queued jobs find their request gone and skip the decode.
            self.cancel_all_pending();
        }
        self.pool.shutdown();
        let undelivered = self.completed_count();
        if undelivered > 0 {
            warn!("Async resource loader dropped with {undelivered} undelivered results");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
