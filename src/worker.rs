use crate::animation::PoseEvaluator;
use crate::assets::ModelData;
use crate::cache::{CacheEntry, PoseSource, ResultCache};
use crate::config::AnimationConfig;
use crate::error::{AnimResult, AnimationError};
use crate::instance::InstanceId;
use crate::pose::{PoseOutputs, PoseSnapshot};
use std::collections::{HashMap, HashSet};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub type RequestId = u64;

/// Receives the published cache entry, a worker failure, or `Cancelled` on terminate.
/// Superseded and stale requests never invoke their callback.
pub type PoseCallback = Box<dyn FnOnce(Result<&CacheEntry, AnimationError>)>;

#[derive(Clone, Debug, PartialEq)]
pub struct AnimationRequest {
    pub instance: InstanceId,
    pub model_id: Arc<str>,
    pub clip: Arc<str>,
    pub time: f32,
    pub looping: bool,
    pub needs_bones: bool,
}

pub struct PendingRequest {
    pub request_id: RequestId,
    pub instance: InstanceId,
    pub model_id: Arc<str>,
    pub generation: u64,
    pub submitted: Instant,
    callback: Option<PoseCallback>,
}

struct EvaluateJob {
    request_id: RequestId,
    generation: u64,
    request: AnimationRequest,
}

enum WorkerMessage {
    CacheModel(Arc<ModelData>),
    Evaluate(EvaluateJob),
    ReleaseInstance(InstanceId),
    Shutdown,
}

enum WorkerReply {
    Ready,
    ModelCached(Arc<str>),
    ModelRejected { model_id: Arc<str>, message: String },
    Pose { request_id: RequestId, instance: InstanceId, generation: u64, pose: PoseSnapshot },
    Failed { request_id: RequestId, instance: InstanceId, message: String },
}

/// Runs pose evaluation on a dedicated thread. Models are shipped once; each frame
/// an instance sends a small request and the reply is published into the cache
/// from `pump`. Only one request per instance is tracked at a time.
pub struct AnimationWorker {
    tx: Option<mpsc::SyncSender<WorkerMessage>>,
    rx: Option<mpsc::Receiver<WorkerReply>>,
    handle: Option<thread::JoinHandle<()>>,
    ready: bool,
    failed: bool,
    requested_models: HashMap<Arc<str>, Arc<ModelData>>,
    ready_models: HashSet<Arc<str>>,
    pending: HashMap<InstanceId, PendingRequest>,
    unsent_releases: Vec<InstanceId>,
    next_request_id: RequestId,
    errors: Vec<AnimationError>,
}

impl AnimationWorker {
    pub fn spawn(config: &AnimationConfig) -> Self {
        let (tx, rx) = mpsc::sync_channel(config.worker_queue_depth.max(1));
        let (reply_tx, reply_rx) = mpsc::channel();
        let builder = thread::Builder::new().name(config.worker_thread_name.clone());
        match builder.spawn(move || run_worker(rx, reply_tx)) {
            Ok(handle) => {
                log::debug!("[animation] worker thread '{}' spawned", config.worker_thread_name);
                let mut worker = Self::unavailable();
                worker.tx = Some(tx);
                worker.rx = Some(reply_rx);
                worker.handle = Some(handle);
                worker.failed = false;
                worker
            }
            Err(err) => {
                log::warn!("[animation] failed to spawn worker thread: {err:?}; using inline evaluation");
                Self::unavailable()
            }
        }
    }

    /// A worker that never becomes ready; every request falls back inline.
    pub fn unavailable() -> Self {
        Self {
            tx: None,
            rx: None,
            handle: None,
            ready: false,
            failed: true,
            requested_models: HashMap::new(),
            ready_models: HashSet::new(),
            pending: HashMap::new(),
            unsent_releases: Vec::new(),
            next_request_id: 0,
            errors: Vec::new(),
        }
    }

    pub fn is_worker_ready(&self) -> bool {
        self.ready && !self.failed
    }

    pub fn is_model_ready(&self, model_id: &str) -> bool {
        self.is_worker_ready() && self.ready_models.contains(model_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_request(&self, instance: InstanceId) -> Option<&PendingRequest> {
        self.pending.get(&instance)
    }

    /// Ships `model` to the worker. Repeated calls with the same model are no-ops;
    /// readiness flips once the worker acknowledges it. Different data under an id
    /// the worker already holds is rejected, since requests address models by id.
    pub fn cache_model(&mut self, model: &Arc<ModelData>) -> AnimResult<()> {
        if self.failed {
            return Err(AnimationError::WorkerUnavailable);
        }
        if let Some(shipped) = self.requested_models.get(&model.id) {
            if Arc::ptr_eq(shipped, model) {
                return Ok(());
            }
            return Err(AnimationError::ModelAlreadyLoaded(model.id.to_string()));
        }
        self.send(WorkerMessage::CacheModel(Arc::clone(model)))?;
        self.requested_models.insert(Arc::clone(&model.id), Arc::clone(model));
        Ok(())
    }

    /// Queues an evaluation and returns its request id. Any earlier pending request
    /// for the same instance is superseded and its callback dropped.
    pub fn request_animation(
        &mut self,
        cache: &mut ResultCache,
        request: AnimationRequest,
        callback: Option<PoseCallback>,
    ) -> AnimResult<RequestId> {
        if !self.is_worker_ready() {
            return Err(AnimationError::WorkerUnavailable);
        }
        if !self.ready_models.contains(&request.model_id) {
            return Err(AnimationError::ModelNotReady(request.model_id.to_string()));
        }

        let request_id = self.next_request_id + 1;
        let generation = cache.reserve_generation(request.instance);
        let instance = request.instance;
        let model_id = Arc::clone(&request.model_id);
        self.send(WorkerMessage::Evaluate(EvaluateJob { request_id, generation, request }))?;
        self.next_request_id = request_id;

        let pending = PendingRequest {
            request_id,
            instance,
            model_id,
            generation,
            submitted: Instant::now(),
            callback,
        };
        if let Some(previous) = self.pending.insert(instance, pending) {
            log::trace!("[animation] request {} superseded by {request_id}", previous.request_id);
        }
        Ok(request_id)
    }

    /// Delivers every reply that has already arrived. Never blocks.
    pub fn pump(&mut self, cache: &mut ResultCache) -> usize {
        self.retry_releases();
        let mut published = 0;
        loop {
            let reply = match self.rx.as_ref().map(mpsc::Receiver::try_recv) {
                Some(Ok(reply)) => reply,
                Some(Err(mpsc::TryRecvError::Disconnected)) => {
                    self.mark_disconnected();
                    break;
                }
                Some(Err(mpsc::TryRecvError::Empty)) | None => break,
            };
            if self.handle_reply(cache, reply) {
                published += 1;
            }
        }
        published
    }

    /// Blocks until the worker is ready, every shipped model is acknowledged and no
    /// request is pending, or until `timeout` elapses. Returns the number of poses published.
    pub fn flush(&mut self, cache: &mut ResultCache, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut published = self.pump(cache);
        while !self.is_settled() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let reply = match self.rx.as_ref().map(|rx| rx.recv_timeout(remaining)) {
                Some(Ok(reply)) => reply,
                Some(Err(mpsc::RecvTimeoutError::Disconnected)) => {
                    self.mark_disconnected();
                    break;
                }
                Some(Err(mpsc::RecvTimeoutError::Timeout)) | None => break,
            };
            if self.handle_reply(cache, reply) {
                published += 1;
            }
        }
        published
    }

    /// Forgets any pending request for `instance` and frees its worker-side state.
    /// A release that meets a full queue is retried on the next `pump`.
    pub fn release_instance(&mut self, instance: InstanceId) {
        self.pending.remove(&instance);
        self.unsent_releases.push(instance);
        self.retry_releases();
    }

    fn retry_releases(&mut self) {
        let Some(tx) = self.tx.as_ref() else {
            self.unsent_releases.clear();
            return;
        };
        while let Some(&instance) = self.unsent_releases.first() {
            match tx.try_send(WorkerMessage::ReleaseInstance(instance)) {
                Ok(()) => {
                    self.unsent_releases.remove(0);
                }
                Err(mpsc::TrySendError::Full(_)) => {
                    log::debug!(
                        "[animation] worker queue full; {} instance release(s) deferred",
                        self.unsent_releases.len()
                    );
                    return;
                }
                Err(mpsc::TrySendError::Disconnected(_)) => {
                    self.unsent_releases.clear();
                    return;
                }
            }
        }
    }

    /// Stops the worker thread and fails every pending request with `Cancelled`.
    /// The worker stays unavailable afterwards.
    pub fn terminate(&mut self) -> usize {
        if let Some(tx) = self.tx.take() {
            let _ = tx.try_send(WorkerMessage::Shutdown);
        }
        self.rx = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("[animation] worker thread panicked during shutdown");
            }
        }
        self.ready = false;
        self.failed = true;
        self.cancel_pending()
    }

    /// Errors reported by the worker since the last call.
    pub fn take_errors(&mut self) -> Vec<AnimationError> {
        std::mem::take(&mut self.errors)
    }

    fn is_settled(&self) -> bool {
        if self.failed {
            return true;
        }
        self.ready && self.pending.is_empty() && self.requested_models.len() == self.ready_models.len()
    }

    fn send(&mut self, message: WorkerMessage) -> AnimResult<()> {
        let Some(tx) = self.tx.as_ref() else {
            return Err(AnimationError::WorkerUnavailable);
        };
        match tx.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::TrySendError::Full(_)) => {
                log::warn!("[animation] worker queue full; evaluating inline");
                Err(AnimationError::WorkerUnavailable)
            }
            Err(mpsc::TrySendError::Disconnected(_)) => {
                self.mark_disconnected();
                Err(AnimationError::WorkerUnavailable)
            }
        }
    }

    fn mark_disconnected(&mut self) {
        if self.failed {
            return;
        }
        log::warn!("[animation] worker thread disconnected; falling back to inline evaluation");
        self.tx = None;
        self.rx = None;
        self.ready = false;
        self.failed = true;
        self.cancel_pending();
    }

    fn cancel_pending(&mut self) -> usize {
        let cancelled = self.pending.len();
        for (_, pending) in self.pending.drain() {
            if let Some(callback) = pending.callback {
                callback(Err(AnimationError::Cancelled(pending.request_id)));
            }
        }
        cancelled
    }

    /// Returns true if the reply was published into the cache.
    fn handle_reply(&mut self, cache: &mut ResultCache, reply: WorkerReply) -> bool {
        match reply {
            WorkerReply::Ready => {
                log::debug!("[animation] worker ready");
                self.ready = true;
                false
            }
            WorkerReply::ModelCached(model_id) => {
                log::debug!("[animation] model '{model_id}' cached on worker");
                self.ready_models.insert(model_id);
                false
            }
            WorkerReply::ModelRejected { model_id, message } => {
                log::warn!("[animation] worker rejected model '{model_id}': {message}");
                self.requested_models.remove(&model_id);
                self.errors.push(AnimationError::MalformedModel(message));
                false
            }
            WorkerReply::Pose { request_id, instance, generation, pose } => {
                let Some(pending) = self.take_matching(instance, request_id) else {
                    return false;
                };
                if !cache.publish_snapshot(instance, generation, pose, PoseSource::Worker) {
                    log::trace!("[animation] request {request_id} older than cached pose; dropped");
                    return false;
                }
                if let (Some(callback), Some(entry)) = (pending.callback, cache.entry(instance)) {
                    callback(Ok(entry));
                }
                true
            }
            WorkerReply::Failed { request_id, instance, message } => {
                let Some(pending) = self.take_matching(instance, request_id) else {
                    return false;
                };
                let err = AnimationError::WorkerFailure { request_id, message };
                log::warn!("[animation] {err}");
                self.errors.push(err.clone());
                if let Some(callback) = pending.callback {
                    callback(Err(err));
                }
                false
            }
        }
    }

    fn take_matching(&mut self, instance: InstanceId, request_id: RequestId) -> Option<PendingRequest> {
        match self.pending.get(&instance) {
            Some(pending) if pending.request_id == request_id => self.pending.remove(&instance),
            _ => {
                log::trace!("[animation] stale reply for request {request_id} on instance {instance} dropped");
                None
            }
        }
    }

    #[cfg(test)]
    fn detached() -> (Self, mpsc::Receiver<WorkerMessage>, mpsc::Sender<WorkerReply>) {
        Self::detached_with_capacity(16)
    }

    #[cfg(test)]
    fn detached_with_capacity(
        capacity: usize,
    ) -> (Self, mpsc::Receiver<WorkerMessage>, mpsc::Sender<WorkerReply>) {
        let (tx, rx) = mpsc::sync_channel(capacity);
        let (reply_tx, reply_rx) = mpsc::channel();
        let mut worker = Self::unavailable();
        worker.tx = Some(tx);
        worker.rx = Some(reply_rx);
        worker.failed = false;
        (worker, rx, reply_tx)
    }
}

impl Drop for AnimationWorker {
    fn drop(&mut self) {
        if self.tx.is_some() || self.handle.is_some() {
            self.terminate();
        }
    }
}

fn run_worker(rx: mpsc::Receiver<WorkerMessage>, tx: mpsc::Sender<WorkerReply>) {
    if tx.send(WorkerReply::Ready).is_err() {
        return;
    }
    let mut models: HashMap<Arc<str>, Arc<ModelData>> = HashMap::new();
    let mut poses: HashMap<InstanceId, PoseEvaluator> = HashMap::new();

    while let Ok(first) = rx.recv() {
        let mut batch = vec![first];
        while let Ok(next) = rx.try_recv() {
            batch.push(next);
        }
        // Only the newest evaluation per instance is worth computing.
        let mut newest: HashMap<InstanceId, usize> = HashMap::new();
        for (slot, message) in batch.iter().enumerate() {
            if let WorkerMessage::Evaluate(job) = message {
                newest.insert(job.request.instance, slot);
            }
        }

        for (slot, message) in batch.into_iter().enumerate() {
            let reply = match message {
                WorkerMessage::Shutdown => return,
                WorkerMessage::CacheModel(model) => match PoseEvaluator::new(Arc::clone(&model)) {
                    Ok(_) => {
                        let model_id = Arc::clone(&model.id);
                        models.insert(Arc::clone(&model_id), model);
                        WorkerReply::ModelCached(model_id)
                    }
                    Err(err) => WorkerReply::ModelRejected { model_id: Arc::clone(&model.id), message: err.to_string() },
                },
                WorkerMessage::ReleaseInstance(instance) => {
                    poses.remove(&instance);
                    continue;
                }
                WorkerMessage::Evaluate(job) => {
                    if newest.get(&job.request.instance) != Some(&slot) {
                        continue;
                    }
                    evaluate_job(&models, &mut poses, job)
                }
            };
            if tx.send(reply).is_err() {
                return;
            }
        }
    }
}

fn evaluate_job(
    models: &HashMap<Arc<str>, Arc<ModelData>>,
    poses: &mut HashMap<InstanceId, PoseEvaluator>,
    job: EvaluateJob,
) -> WorkerReply {
    let EvaluateJob { request_id, generation, request } = job;
    let failed = |message: String| WorkerReply::Failed { request_id, instance: request.instance, message };

    let Some(model) = models.get(&request.model_id) else {
        return failed(format!("model '{}' is not cached on the worker", request.model_id));
    };
    let Some(clip) = model.clip(&request.clip) else {
        return failed(
            AnimationError::AnimationNotFound { model: Arc::clone(&model.id), clip: request.clip.to_string() }
                .to_string(),
        );
    };

    let stale_evaluator = poses.get(&request.instance).map_or(true, |pose| !Arc::ptr_eq(pose.model(), model));
    if stale_evaluator {
        match PoseEvaluator::new(Arc::clone(model)) {
            Ok(pose) => {
                poses.insert(request.instance, pose);
            }
            Err(err) => return failed(err.to_string()),
        }
    }
    let Some(pose) = poses.get_mut(&request.instance) else {
        return failed("evaluator missing".to_string());
    };

    let outputs = PoseOutputs::with_bones(request.needs_bones);
    match pose.evaluate(Some(clip), request.time, request.looping, outputs) {
        Ok(()) => WorkerReply::Pose { request_id, instance: request.instance, generation, pose: pose.snapshot(outputs) },
        Err(err) => failed(err.to_string()),
    }
}
