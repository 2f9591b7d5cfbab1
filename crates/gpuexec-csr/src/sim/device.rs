use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use gpuexec_mem::{AllocationId, ContextId, GraphicsAllocation, TaskCount, MAX_OS_CONTEXTS};
use serde::{Deserialize, Serialize};

use super::executor::{Cursor, Fault, PostSyncGate, Step};
use super::os_context::SimOsContext;
use crate::command::Command;
use crate::os_context::{EngineDescriptor, EngineType, OsContext};
use crate::submission::{BatchBuffer, GpuSubmitter, SubmissionStatus};

pub const DEFAULT_MAX_COMMANDS_PER_BATCH: usize = 1 << 20;
/// Execution records and evictions kept before the oldest are dropped.
pub const DEFAULT_LOG_CAPACITY: usize = 4096;
const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Batches run inside `submit`.
    #[default]
    Immediate,
    /// Batches queue until [`SimDevice::process_pending`] or a worker runs them.
    Deferred,
}

/// What the device did with one batch.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub context_id: ContextId,
    pub task_count: TaskCount,
    pub direct_submission: bool,
    pub residency: Vec<AllocationId>,
    pub commands: Vec<Command>,
    pub fault: Option<Fault>,
}

#[derive(Debug)]
struct PendingBatch {
    context_id: ContextId,
    task_count: TaskCount,
    direct_submission: bool,
    residency: Vec<Arc<GraphicsAllocation>>,
    cursor: Cursor,
}

impl PendingBatch {
    fn into_record(self, fault: Option<Fault>) -> ExecutionRecord {
        ExecutionRecord {
            context_id: self.context_id,
            task_count: self.task_count,
            direct_submission: self.direct_submission,
            residency: self.residency.iter().map(|a| a.id()).collect(),
            commands: self.cursor.into_executed(),
            fault,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    queues: BTreeMap<ContextId, VecDeque<PendingBatch>>,
    injected_failures: VecDeque<SubmissionStatus>,
    context_init_failures: HashMap<ContextId, u32>,
    direct_submission_unsupported: HashSet<EngineType>,
    gate: PostSyncGate,
    log: VecDeque<ExecutionRecord>,
    evictions: VecDeque<(ContextId, AllocationId)>,
}

/// In-process device executing submitted command streams against allocation memory.
///
/// Each OS context has its own in-order queue; queues advance independently, so a batch blocked
/// on a semaphore only stalls its own context.
#[derive(Debug)]
pub struct SimDevice {
    mode: ExecutionMode,
    max_commands_per_batch: usize,
    state: Mutex<SimState>,
    work: Condvar,
    hang: AtomicBool,
    next_context_id: AtomicU32,
    submissions: AtomicU64,
    log_capacity: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn push_bounded<T>(log: &mut VecDeque<T>, capacity: usize, entry: T) {
    if capacity == 0 {
        return;
    }
    while log.len() >= capacity {
        log.pop_front();
    }
    log.push_back(entry);
}

impl SimDevice {
    pub fn new(mode: ExecutionMode) -> Arc<Self> {
        Self::with_max_commands(mode, DEFAULT_MAX_COMMANDS_PER_BATCH)
    }

    pub fn with_max_commands(mode: ExecutionMode, max_commands_per_batch: usize) -> Arc<Self> {
        Arc::new(Self {
            mode,
            max_commands_per_batch,
            state: Mutex::new(SimState::default()),
            work: Condvar::new(),
            hang: AtomicBool::new(false),
            next_context_id: AtomicU32::new(0),
            submissions: AtomicU64::new(0),
            log_capacity: AtomicUsize::new(DEFAULT_LOG_CAPACITY),
        })
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// New OS context on this device. Context ids are assigned in creation order.
    pub fn create_os_context(self: &Arc<Self>, descriptor: EngineDescriptor) -> Arc<SimOsContext> {
        let context_id = self.next_context_id.fetch_add(1, Ordering::Relaxed);
        debug_assert!((context_id as usize) < MAX_OS_CONTEXTS);
        Arc::new(SimOsContext::new(context_id, descriptor, self.clone()))
    }

    pub fn is_hang_detected(&self) -> bool {
        self.hang.load(Ordering::Acquire)
    }

    /// Mark the device hung; nothing executes afterwards.
    pub fn inject_hang(&self) {
        tracing::warn!("simulated gpu hang injected");
        self.hang.store(true, Ordering::Release);
    }

    /// Reject the next `count` submissions with `status`.
    pub fn fail_next_submissions(&self, status: SubmissionStatus, count: usize) {
        let mut state = lock(&self.state);
        state
            .injected_failures
            .extend(std::iter::repeat(status).take(count));
    }

    /// Fail the next `count` context creations of `context_id`.
    pub fn fail_context_initialization(&self, context_id: ContextId, count: u32) {
        lock(&self.state)
            .context_init_failures
            .insert(context_id, count);
    }

    pub(crate) fn take_context_init_failure(&self, context_id: ContextId) -> bool {
        let mut state = lock(&self.state);
        match state.context_init_failures.get_mut(&context_id) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn set_direct_submission_supported(&self, engine_type: EngineType, supported: bool) {
        let mut state = lock(&self.state);
        if supported {
            state.direct_submission_unsupported.remove(&engine_type);
        } else {
            state.direct_submission_unsupported.insert(engine_type);
        }
    }

    pub fn supports_direct_submission(&self, engine_type: EngineType) -> bool {
        !lock(&self.state)
            .direct_submission_unsupported
            .contains(&engine_type)
    }

    /// Hold back completion writes of `partition` until [`SimDevice::release_partition`].
    pub fn stall_partition(&self, partition: u32) {
        lock(&self.state).gate.stall(partition);
    }

    pub fn release_partition(&self, partition: u32) {
        let mut state = lock(&self.state);
        if let Err(err) = state.gate.release(partition) {
            tracing::error!(partition, %err, "failed to publish held completion writes");
        }
        self.pump_locked(&mut state);
    }

    /// Run queued work until every queue is empty or blocked. Returns the batches retired.
    pub fn process_pending(&self) -> usize {
        let mut state = lock(&self.state);
        self.pump_locked(&mut state)
    }

    pub fn pending_batches(&self) -> usize {
        lock(&self.state).queues.values().map(VecDeque::len).sum()
    }

    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    /// Keep at most `capacity` execution records and evictions, dropping the oldest first.
    /// Zero turns recording off.
    pub fn set_log_capacity(&self, capacity: usize) {
        self.log_capacity.store(capacity, Ordering::Relaxed);
        let mut state = lock(&self.state);
        let excess = state.log.len().saturating_sub(capacity);
        state.log.drain(..excess);
        let excess = state.evictions.len().saturating_sub(capacity);
        state.evictions.drain(..excess);
    }

    pub fn execution_log(&self) -> Vec<ExecutionRecord> {
        lock(&self.state).log.iter().cloned().collect()
    }

    pub fn take_execution_log(&self) -> Vec<ExecutionRecord> {
        std::mem::take(&mut lock(&self.state).log).into()
    }

    pub fn evictions(&self) -> Vec<(ContextId, AllocationId)> {
        lock(&self.state).evictions.iter().copied().collect()
    }

    /// Background thread executing deferred work as it arrives.
    pub fn spawn_worker(self: &Arc<Self>) -> SimWorker {
        let stop = Arc::new(AtomicBool::new(false));
        let device = self.clone();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name("gpuexec-sim".into())
            .spawn(move || {
                let mut state = lock(&device.state);
                while !thread_stop.load(Ordering::Acquire) {
                    device.pump_locked(&mut state);
                    state = match device.work.wait_timeout(state, WORKER_POLL_INTERVAL) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
            });
        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::error!(%err, "failed to spawn simulator worker");
                None
            }
        };
        SimWorker {
            device: self.clone(),
            stop,
            handle,
        }
    }

    fn pump_locked(&self, state: &mut SimState) -> usize {
        let mut retired = 0;
        loop {
            let mut progress = false;
            let context_ids: Vec<ContextId> = state.queues.keys().copied().collect();
            for context_id in context_ids {
                loop {
                    if self.is_hang_detected() {
                        return retired;
                    }
                    let SimState { queues, gate, .. } = &mut *state;
                    let Some(batch) = queues.get_mut(&context_id).and_then(VecDeque::front_mut)
                    else {
                        break;
                    };
                    let before = batch.cursor.executed().len();
                    let step = batch
                        .cursor
                        .run(&batch.residency, gate, self.max_commands_per_batch);
                    if batch.cursor.executed().len() != before {
                        progress = true;
                    }
                    let fault = match step {
                        Step::Blocked => break,
                        Step::Finished => None,
                        Step::Fault(fault) => Some(fault),
                    };
                    let Some(batch) = queues.get_mut(&context_id).and_then(VecDeque::pop_front)
                    else {
                        break;
                    };
                    retired += 1;
                    progress = true;
                    if let Some(fault) = &fault {
                        tracing::error!(
                            context_id,
                            task_count = batch.task_count,
                            %fault,
                            "gpu fault, device lost"
                        );
                        self.hang.store(true, Ordering::Release);
                    }
                    let capacity = self.log_capacity.load(Ordering::Relaxed);
                    push_bounded(&mut state.log, capacity, batch.into_record(fault));
                }
            }
            if !progress {
                return retired;
            }
        }
    }
}

impl GpuSubmitter for SimDevice {
    fn submit(
        &self,
        batch: &BatchBuffer,
        residency: &[Arc<GraphicsAllocation>],
        os_context: &dyn OsContext,
    ) -> SubmissionStatus {
        let context_id = os_context.context_id();
        if self.is_hang_detected() {
            return SubmissionStatus::Failed;
        }
        let mut state = lock(&self.state);
        if let Some(status) = state.injected_failures.pop_front() {
            tracing::debug!(context_id, task_count = batch.task_count, ?status, "injected submission failure");
            return status;
        }
        if !residency
            .iter()
            .any(|allocation| allocation.id() == batch.command_buffer.id())
        {
            tracing::error!(context_id, task_count = batch.task_count, "batch buffer is not resident");
            return SubmissionStatus::Failed;
        }

        self.submissions.fetch_add(1, Ordering::Relaxed);
        state
            .queues
            .entry(context_id)
            .or_default()
            .push_back(PendingBatch {
                context_id,
                task_count: batch.task_count,
                direct_submission: batch.direct_submission,
                residency: residency.to_vec(),
                cursor: Cursor::new(batch.command_buffer.clone(), batch.start_offset),
            });
        match self.mode {
            ExecutionMode::Immediate => {
                self.pump_locked(&mut state);
            }
            ExecutionMode::Deferred => self.work.notify_all(),
        }
        SubmissionStatus::Success
    }

    fn process_eviction(&self, evictions: &[Arc<GraphicsAllocation>], os_context: &dyn OsContext) {
        let context_id = os_context.context_id();
        let capacity = self.log_capacity.load(Ordering::Relaxed);
        let mut state = lock(&self.state);
        for allocation in evictions {
            push_bounded(&mut state.evictions, capacity, (context_id, allocation.id()));
        }
    }
}

/// Handle to a [`SimDevice::spawn_worker`] thread; stops and joins it on drop.
#[derive(Debug)]
pub struct SimWorker {
    device: Arc<SimDevice>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for SimWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.device.work.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("simulator worker panicked");
            }
        }
    }
}
