//! Priority-segregated task scheduler.
//!
//! Three FIFO queues (Light / Medium / Heavy) drained by a fixed pool of OS
//! threads. Workers run in one of four modes that define which queues they
//! scan and in what order; within a class, ordering is FIFO, across classes
//! there is no guarantee. The only suspension point is the queue wait: a
//! task runs to completion once popped.
//!
//! Freeze discipline: `freeze` asks every worker to finish its current task
//! and park on the wait predicate; it returns only once all of them report
//! `Waiting`. `thaw` releases them. This is the barrier the save path uses
//! to snapshot a quiescent graph.

use core_codec::buffer::{ByteReader, ByteWriter};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Tasks executed by the pool, in rising weight order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskClass {
    /// Oracle-bound short callbacks.
    Light = 0,
    /// Delta-debugging inner orchestration.
    Medium = 1,
    /// Generation and execution supervision.
    Heavy = 2,
}

impl TaskClass {
    pub const ALL: [TaskClass; 3] = [TaskClass::Light, TaskClass::Medium, TaskClass::Heavy];

    fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            TaskClass::Light => "light",
            TaskClass::Medium => "medium",
            TaskClass::Heavy => "heavy",
        }
    }
}

/// A queued unit of work. Exactly one of `run` or `dispose` is invoked.
///
/// Tasks carry a stable 64-bit type tag and can serialize their payload so a
/// pending callback survives a save (reconstruction goes through factories
/// registered by the session at startup).
pub trait Task: Send + 'static {
    fn class(&self) -> TaskClass;

    fn type_tag(&self) -> u64;

    fn run(self: Box<Self>);

    /// Called instead of `run` when the queue is cleared.
    fn dispose(self: Box<Self>) {}

    /// Payload for save-file persistence. Tasks that cannot be persisted
    /// simply keep the default empty payload and are rebuilt from scratch.
    fn write_payload(&self, _out: &mut ByteWriter<Vec<u8>>) -> core_codec::Result<()> {
        Ok(())
    }
}

/// Per-worker lifecycle hooks. Used to set up and tear down thread state
/// tasks rely on (the oracle's scripting context in particular).
pub trait WorkerHooks: Send + Sync + 'static {
    fn on_worker_start(&self, _worker: usize, _mode: WorkerMode) {}
    fn on_worker_exit(&self, _worker: usize) {}
}

struct NoWorkerHooks;

impl WorkerHooks for NoWorkerHooks {}

/// Queue-scan behavior of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Drains Light, then Medium, then Heavy. Only used by 1-thread pools.
    SingleThread,
    /// Consumes Light only.
    LightExclusive,
    /// Light first, then Medium.
    LightMedium,
    /// Medium first, then Heavy.
    General,
}

impl WorkerMode {
    fn scan_order(self) -> &'static [TaskClass] {
        match self {
            WorkerMode::SingleThread => &TaskClass::ALL,
            WorkerMode::LightExclusive => &[TaskClass::Light],
            WorkerMode::LightMedium => &[TaskClass::Light, TaskClass::Medium],
            WorkerMode::General => &[TaskClass::Medium, TaskClass::Heavy],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            WorkerMode::SingleThread => "single",
            WorkerMode::LightExclusive => "light",
            WorkerMode::LightMedium => "light_medium",
            WorkerMode::General => "general",
        }
    }
}

/// Worker layout of the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub modes: Vec<WorkerMode>,
}

impl SchedulerConfig {
    /// Explicit per-class activation.
    pub fn explicit(light: usize, light_medium: usize, general: usize) -> Self {
        let mut modes = Vec::new();
        modes.extend(std::iter::repeat_n(WorkerMode::LightExclusive, light));
        modes.extend(std::iter::repeat_n(WorkerMode::LightMedium, light_medium));
        modes.extend(std::iter::repeat_n(WorkerMode::General, general));
        if modes.is_empty() {
            modes.push(WorkerMode::SingleThread);
        }
        Self { modes }
    }

    /// Splits a single thread count into classes: one light-exclusive
    /// worker, one light+medium worker once the pool is large enough, the
    /// rest general.
    pub fn from_total(total: usize) -> Self {
        match total {
            0 | 1 => Self {
                modes: vec![WorkerMode::SingleThread],
            },
            2 => Self {
                modes: vec![WorkerMode::LightMedium, WorkerMode::General],
            },
            n => {
                let mut modes = vec![WorkerMode::LightExclusive, WorkerMode::LightMedium];
                modes.extend(std::iter::repeat_n(WorkerMode::General, n - 2));
                Self { modes }
            }
        }
    }

    fn serves(&self, class: TaskClass) -> bool {
        self.modes
            .iter()
            .any(|m| m.scan_order().contains(&class))
    }
}

#[derive(Default)]
struct SchedState {
    queues: [VecDeque<Box<dyn Task>>; 3],
    terminate: bool,
    drain_on_stop: bool,
    frozen: bool,
    waiting: usize,
    alive: usize,
}

impl SchedState {
    fn queued(&self) -> usize {
        self.queues.iter().map(VecDeque::len).sum()
    }

    fn pop_for(&mut self, mode: WorkerMode) -> Option<Box<dyn Task>> {
        for class in mode.scan_order() {
            if let Some(task) = self.queues[class.index()].pop_front() {
                return Some(task);
            }
        }
        None
    }

    fn has_work_for(&self, mode: WorkerMode) -> bool {
        mode.scan_order()
            .iter()
            .any(|class| !self.queues[class.index()].is_empty())
    }
}

/// The worker pool. Lives for the whole session; stopped exactly once.
pub struct TaskScheduler {
    state: Mutex<SchedState>,
    work_cv: Condvar,
    barrier_cv: Condvar,
    config: SchedulerConfig,
    hooks: Mutex<Arc<dyn WorkerHooks>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    executed: AtomicU64,
    disposed: AtomicU64,
}

impl TaskScheduler {
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedState::default()),
            work_cv: Condvar::new(),
            barrier_cv: Condvar::new(),
            config,
            hooks: Mutex::new(Arc::new(NoWorkerHooks)),
            handles: Mutex::new(Vec::new()),
            executed: AtomicU64::new(0),
            disposed: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Installs the worker lifecycle hooks. Must precede `start`.
    pub fn set_worker_hooks(&self, hooks: Arc<dyn WorkerHooks>) {
        *self.hooks.lock().expect("hooks lock poisoned") = hooks;
    }

    /// Spawns the worker threads.
    pub fn start(self: &Arc<Self>) {
        let mut handles = self.handles.lock().expect("handles lock poisoned");
        if !handles.is_empty() {
            warn!(target: "sched", "start_ignored_already_running");
            return;
        }
        {
            let mut state = self.state.lock().expect("scheduler lock poisoned");
            state.alive = self.config.modes.len();
            state.terminate = false;
        }
        for (worker, mode) in self.config.modes.iter().copied().enumerate() {
            let this = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("worker-{worker}-{}", mode.label()))
                .spawn(move || this.worker_loop(worker, mode))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
        info!(target: "sched", workers = self.config.modes.len(), "pool_started");
    }

    fn worker_loop(self: Arc<Self>, worker: usize, mode: WorkerMode) {
        let hooks = self.hooks.lock().expect("hooks lock poisoned").clone();
        hooks.on_worker_start(worker, mode);
        debug!(target: "sched.worker", worker, mode = mode.label(), "worker_started");

        loop {
            let task = {
                let mut state = self.state.lock().expect("scheduler lock poisoned");
                loop {
                    if state.terminate
                        && (!state.drain_on_stop || !state.has_work_for(mode))
                    {
                        state.alive -= 1;
                        self.barrier_cv.notify_all();
                        drop(state);
                        hooks.on_worker_exit(worker);
                        debug!(target: "sched.worker", worker, "worker_stopped");
                        return;
                    }
                    if !state.frozen {
                        if let Some(task) = state.pop_for(mode) {
                            break task;
                        }
                    }
                    // Wait predicate: the worker counts as Waiting only
                    // while parked here.
                    state.waiting += 1;
                    self.barrier_cv.notify_all();
                    state = self
                        .work_cv
                        .wait(state)
                        .expect("scheduler lock poisoned");
                    state.waiting -= 1;
                }
            };
            task.run();
            self.executed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Appends to the task's queue and wakes one worker. Submission to a
    /// class no worker serves falls back to the general (Heavy) queue.
    pub fn submit(&self, task: Box<dyn Task>) {
        let mut class = task.class();
        if !self.config.serves(class) {
            class = TaskClass::Heavy;
        }
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        if state.terminate {
            drop(state);
            self.disposed.fetch_add(1, Ordering::Relaxed);
            task.dispose();
            return;
        }
        state.queues[class.index()].push_back(task);
        drop(state);
        self.work_cv.notify_one();
    }

    /// Blocks until every worker has parked on the wait predicate. No task
    /// executes between `freeze` returning and `thaw`.
    pub fn freeze(&self) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        state.frozen = true;
        while state.alive > 0 && state.waiting < state.alive {
            state = self
                .barrier_cv
                .wait(state)
                .expect("scheduler lock poisoned");
        }
        info!(target: "sched", "pool_frozen");
    }

    pub fn thaw(&self) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        state.frozen = false;
        drop(state);
        self.work_cv.notify_all();
        info!(target: "sched", "pool_thawed");
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().expect("scheduler lock poisoned").frozen
    }

    /// Cooperative-cancellation probe for long tasks.
    pub fn should_terminate(&self) -> bool {
        self.state.lock().expect("scheduler lock poisoned").terminate
    }

    /// Stops the pool. With `drain` the queues are emptied by the workers
    /// first; without it pending tasks are disposed.
    pub fn stop(&self, drain: bool) {
        {
            let mut state = self.state.lock().expect("scheduler lock poisoned");
            state.terminate = true;
            state.drain_on_stop = drain;
            state.frozen = false;
        }
        self.work_cv.notify_all();
        let handles: Vec<_> = {
            let mut guard = self.handles.lock().expect("handles lock poisoned");
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
        if !drain {
            self.clear();
        }
        info!(
            target: "sched",
            drain,
            executed = self.executed.load(Ordering::Relaxed),
            "pool_stopped"
        );
    }

    /// Drops all pending tasks through their dispose hook.
    pub fn clear(&self) {
        let drained: Vec<Box<dyn Task>> = {
            let mut state = self.state.lock().expect("scheduler lock poisoned");
            state
                .queues
                .iter_mut()
                .flat_map(|q| q.drain(..))
                .collect()
        };
        for task in drained {
            self.disposed.fetch_add(1, Ordering::Relaxed);
            task.dispose();
        }
    }

    pub fn queued_tasks(&self) -> usize {
        self.state.lock().expect("scheduler lock poisoned").queued()
    }

    pub fn executed_tasks(&self) -> u64 {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn disposed_tasks(&self) -> u64 {
        self.disposed.load(Ordering::Relaxed)
    }

    /// Busy-waits (with the barrier condvar) until the queues are empty and
    /// every worker is parked, or the timeout elapses. Test and shutdown
    /// helper, not a synchronization primitive.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        loop {
            if state.queued() == 0 && state.waiting == state.alive {
                return true;
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .barrier_cv
                .wait_timeout(state, deadline - now)
                .expect("scheduler lock poisoned");
            state = next;
        }
    }
}

/// Factory registry for reconstructing serialized tasks. Callbacks are
/// persisted as `[type_tag:u64][payload]`; owners register a builder per
/// tag at startup (the builder may capture whatever live context the
/// rebuilt task needs).
#[derive(Default)]
pub struct TaskFactories {
    builders: RwLock<
        HashMap<u64, Arc<dyn Fn(&mut ByteReader<&[u8]>) -> Option<Box<dyn Task>> + Send + Sync>>,
    >,
}

impl TaskFactories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        type_tag: u64,
        builder: impl Fn(&mut ByteReader<&[u8]>) -> Option<Box<dyn Task>> + Send + Sync + 'static,
    ) {
        self.builders
            .write()
            .expect("factory lock poisoned")
            .insert(type_tag, Arc::new(builder));
    }

    /// Serializes a task to its tagged byte form.
    pub fn serialize(task: &dyn Task) -> core_codec::Result<Vec<u8>> {
        let mut out = ByteWriter::new(Vec::new());
        out.write_u64(task.type_tag())?;
        task.write_payload(&mut out)?;
        Ok(out.into_inner())
    }

    /// Rebuilds a task from its tagged byte form. Unknown tags are dropped
    /// with a warning.
    pub fn deserialize(&self, bytes: &[u8]) -> Option<Box<dyn Task>> {
        let mut reader = ByteReader::new(bytes);
        let type_tag = reader.read_u64().ok()?;
        let builder = self
            .builders
            .read()
            .expect("factory lock poisoned")
            .get(&type_tag)
            .cloned();
        match builder {
            Some(builder) => builder(&mut reader),
            None => {
                warn!(target: "sched", type_tag, "unknown_task_tag");
                None
            }
        }
    }
}

/// Convenience adapter turning a closure into a [`Task`].
pub struct ClosureTask<F: FnOnce() + Send + 'static> {
    class: TaskClass,
    type_tag: u64,
    body: F,
}

impl<F: FnOnce() + Send + 'static> ClosureTask<F> {
    pub fn new(class: TaskClass, type_tag: u64, body: F) -> Box<Self> {
        Box::new(Self {
            class,
            type_tag,
            body,
        })
    }
}

impl<F: FnOnce() + Send + 'static> Task for ClosureTask<F> {
    fn class(&self) -> TaskClass {
        self.class
    }

    fn type_tag(&self) -> u64 {
        self.type_tag
    }

    fn run(self: Box<Self>) {
        (self.body)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn counting_task(
        class: TaskClass,
        counter: Arc<AtomicUsize>,
    ) -> Box<dyn Task> {
        ClosureTask::new(class, 1, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn executes_all_classes() {
        let sched = TaskScheduler::new(SchedulerConfig::from_total(4));
        sched.start();
        let counter = Arc::new(AtomicUsize::new(0));
        for class in TaskClass::ALL {
            for _ in 0..10 {
                sched.submit(counting_task(class, counter.clone()));
            }
        }
        assert!(sched.wait_idle(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 30);
        sched.stop(true);
    }

    #[test]
    fn single_thread_mode_preserves_class_priority() {
        let sched = TaskScheduler::new(SchedulerConfig::from_total(1));
        let order = Arc::new(Mutex::new(Vec::new()));

        // Queue before starting so the lone worker sees all three at once.
        for (class, name) in [
            (TaskClass::Heavy, "heavy"),
            (TaskClass::Medium, "medium"),
            (TaskClass::Light, "light"),
        ] {
            let order = order.clone();
            sched.submit(ClosureTask::new(class, 1, move || {
                order.lock().unwrap().push(name);
            }));
        }
        sched.start();
        assert!(sched.wait_idle(Duration::from_secs(5)));
        assert_eq!(*order.lock().unwrap(), vec!["light", "medium", "heavy"]);
        sched.stop(true);
    }

    #[test]
    fn fifo_within_class() {
        let sched = TaskScheduler::new(SchedulerConfig::explicit(1, 0, 0));
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..50 {
            let order = order.clone();
            sched.submit(ClosureTask::new(TaskClass::Light, 1, move || {
                order.lock().unwrap().push(i);
            }));
        }
        sched.start();
        assert!(sched.wait_idle(Duration::from_secs(5)));
        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
        sched.stop(true);
    }

    #[test]
    fn freeze_barrier_blocks_execution() {
        let sched = TaskScheduler::new(SchedulerConfig::from_total(3));
        sched.start();
        assert!(sched.wait_idle(Duration::from_secs(5)));
        sched.freeze();

        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        sched.submit(ClosureTask::new(TaskClass::Medium, 1, move || {
            flag.store(true, Ordering::SeqCst);
        }));
        std::thread::sleep(Duration::from_millis(100));
        assert!(
            !ran.load(Ordering::SeqCst),
            "no task may execute while frozen"
        );

        sched.thaw();
        assert!(sched.wait_idle(Duration::from_secs(5)));
        assert!(ran.load(Ordering::SeqCst));
        sched.stop(true);
    }

    #[test]
    fn disabled_class_falls_back_to_general() {
        // No worker serves Light here.
        let sched = TaskScheduler::new(SchedulerConfig::explicit(0, 0, 2));
        sched.start();
        let counter = Arc::new(AtomicUsize::new(0));
        sched.submit(counting_task(TaskClass::Light, counter.clone()));
        assert!(sched.wait_idle(Duration::from_secs(5)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        sched.stop(true);
    }

    #[test]
    fn stop_without_drain_disposes_pending() {
        struct Disposable(Arc<AtomicUsize>);
        impl Task for Disposable {
            fn class(&self) -> TaskClass {
                TaskClass::Heavy
            }
            fn type_tag(&self) -> u64 {
                2
            }
            fn run(self: Box<Self>) {
                panic!("queued task must not run after stop(false)");
            }
            fn dispose(self: Box<Self>) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let sched = TaskScheduler::new(SchedulerConfig::from_total(2));
        let disposed = Arc::new(AtomicUsize::new(0));
        // Never started: tasks stay queued until stop.
        for _ in 0..5 {
            sched.submit(Box::new(Disposable(disposed.clone())));
        }
        sched.stop(false);
        assert_eq!(disposed.load(Ordering::SeqCst), 5);
        assert_eq!(sched.disposed_tasks(), 5);
    }

    #[test]
    fn task_factories_round_trip() {
        let counter = Arc::new(AtomicUsize::new(0));
        let factories = TaskFactories::new();
        let captured = counter.clone();
        factories.register(42, move |_reader| {
            let captured = captured.clone();
            let task: Box<dyn Task> = ClosureTask::new(TaskClass::Light, 42, move || {
                captured.fetch_add(1, Ordering::SeqCst);
            });
            Some(task)
        });

        let original = ClosureTask::new(TaskClass::Light, 42, || {});
        let bytes = TaskFactories::serialize(original.as_ref()).unwrap();
        let rebuilt = factories.deserialize(&bytes).expect("known tag");
        assert_eq!(rebuilt.type_tag(), 42);
        rebuilt.run();
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let mut unknown = bytes.clone();
        unknown[0] = 0xFF;
        assert!(factories.deserialize(&unknown).is_none());
    }

    #[test]
    fn stop_with_drain_runs_remaining() {
        let sched = TaskScheduler::new(SchedulerConfig::from_total(2));
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            sched.submit(counting_task(TaskClass::Heavy, counter.clone()));
        }
        sched.start();
        sched.stop(true);
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }
}
