//! Session lifecycle and the master control loop.
//!
//! A session wires the scheduler, the execution handler, the exclusion
//! tree and the bookkeeping forms together, then runs one control thread
//! that periodically performs the end/save/memory checks, the index
//! cleanup, the delta watchdog and the execution-handler stall probe.
//! Fatal conditions (OutOfMemory, ConvergenceFailure) end the session from
//! that thread, never from inside a worker task.

use crate::ctx::EngineCtx;
use crate::delta::{self, DeltaController};
use crate::functions;
use crate::generation::Generation;
use crate::grammar::{Generator, Grammar};
use crate::sessiondata::SessionData;
use crate::settings::Settings;
use crate::SessionError;
use core_codec::buffer::{ByteReader, ByteWriter};
use core_codec::record::StringTable;
use core_exec::ExecutionHandler;
use core_forms::{
    Form, FormFlags, FormId, FormRef, FormRegistry, RetainGuard, SaveContext, SaveHooks,
    reserved,
};
use core_inputs::{DerivationTree, ExclusionTree, Input};
use core_oracle::{Oracle, PutType};
use core_sched::{ClosureTask, TaskClass, TaskFactories, TaskScheduler, WorkerHooks, WorkerMode};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub const TYPE_SESSION: i32 = i32::from_be_bytes(*b"SESS");

/// Control-loop tick.
const CONTROL_PERIOD: Duration = Duration::from_millis(500);

/// Confirmation delay between the hard memory limit firing and the session
/// ending.
const MEMORY_CONFIRM: Duration = Duration::from_millis(100);

/// Why a session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndReason {
    #[default]
    None,
    GoalReached,
    ConvergenceFailure,
    OutOfMemory,
    Aborted,
}

impl EndReason {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => EndReason::GoalReached,
            2 => EndReason::ConvergenceFailure,
            3 => EndReason::OutOfMemory,
            4 => EndReason::Aborted,
            _ => EndReason::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            EndReason::None => 0,
            EndReason::GoalReached => 1,
            EndReason::ConvergenceFailure => 2,
            EndReason::OutOfMemory => 3,
            EndReason::Aborted => 4,
        }
    }

    /// CLI exit code mapping.
    pub fn exit_code(self) -> i32 {
        match self {
            EndReason::None | EndReason::GoalReached | EndReason::Aborted => 0,
            EndReason::ConvergenceFailure => 3,
            EndReason::OutOfMemory => 1,
        }
    }
}

/// Persistent session record: cumulative runtime and end state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionForm {
    pub save_number: u64,
    pub ended: bool,
    pub end_reason: u8,
}

impl Form for SessionForm {
    fn type_tag() -> i32 {
        TYPE_SESSION
    }

    fn version() -> i32 {
        2
    }

    fn singleton_id() -> Option<FormId> {
        Some(reserved::SESSION)
    }

    fn write_data(
        &self,
        out: &mut ByteWriter<Vec<u8>>,
        _strings: &mut StringTable,
    ) -> core_codec::Result<()> {
        out.write_u64(self.save_number)?;
        out.write_bool(self.ended)?;
        out.write_u8(self.end_reason)
    }

    fn read_data(
        _version: i32,
        input: &mut ByteReader<&[u8]>,
        _strings: &StringTable,
    ) -> core_forms::Result<Self> {
        Ok(Self {
            save_number: input.read_u64()?,
            ended: input.read_bool()?,
            end_reason: input.read_u8()?,
        })
    }
}

/// Point-in-time counters for the stats printer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub total_tests: u64,
    pub positives: u64,
    pub negatives: u64,
    pub unfinished: u64,
    pub undefined: u64,
    pub duplicates: u64,
    pub prefix_skips: u64,
    pub stale_batch_completions: u64,
    pub dd_tests: u64,
    pub repeats: u64,
    pub generation_number: u64,
    pub controllers: usize,
    pub exclusion_nodes: usize,
    pub exclusion_leaves: usize,
    pub exclusion_depth: usize,
    pub runtime_seconds: u64,
    pub forms: usize,
}

struct ControlState {
    ended: Mutex<Option<EndReason>>,
    ended_cv: Condvar,
    paused: AtomicBool,
    stop_requested: AtomicBool,
    wake: Mutex<()>,
    wake_cv: Condvar,
}

struct OracleWorkerHooks {
    oracle: FormRef<Oracle>,
}

impl WorkerHooks for OracleWorkerHooks {
    fn on_worker_start(&self, worker: usize, mode: WorkerMode) {
        if let Err(err) = self.oracle.read().register_thread() {
            error!(
                target: "session",
                worker,
                mode = mode.label(),
                %err,
                "oracle_register_failed"
            );
        }
    }

    fn on_worker_exit(&self, _worker: usize) {
        Oracle::unregister_thread();
    }
}

struct FreezeBoth {
    scheduler: Arc<TaskScheduler>,
    exec: Arc<ExecutionHandler>,
}

impl SaveHooks for FreezeBoth {
    fn freeze(&self) {
        self.scheduler.freeze();
        self.exec.freeze();
    }

    fn thaw(&self) {
        self.exec.thaw();
        self.scheduler.thaw();
    }
}

/// A running (or resumable) fuzzing session.
pub struct Session {
    ctx: Arc<EngineCtx>,
    form: FormRef<SessionForm>,
    state: Arc<ControlState>,
    control: Mutex<Option<JoinHandle<()>>>,
    last_error: Mutex<Option<SessionError>>,
    factories: Arc<TaskFactories>,
}

/// Serialized form of the generate-tests callback stored in the save
/// file's pending-callback region.
fn pending_generate_callback() -> Option<Vec<u8>> {
    let marker = ClosureTask::new(TaskClass::Heavy, functions::TASK_TAG_GENERATE, || {});
    TaskFactories::serialize(marker.as_ref()).ok()
}

/// Registers every record factory. Must run before any load.
pub fn register_factories(registry: &FormRegistry) {
    registry.register_factory::<Settings>();
    registry.register_factory::<Grammar>();
    registry.register_factory::<Generator>();
    registry.register_factory::<Oracle>();
    registry.register_factory::<ExclusionTree>();
    registry.register_factory::<SessionData>();
    registry.register_factory::<SessionForm>();
    registry.register_factory::<Generation>();
    registry.register_factory::<Input>();
    registry.register_factory::<DerivationTree>();
    registry.register_factory::<DeltaController>();
}

fn fresh_guid() -> (u64, u64) {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let state = RandomState::new();
    let mut first = state.build_hasher();
    first.write_u64(std::process::id() as u64);
    let a = first.finish();
    let mut second = state.build_hasher();
    second.write_u64(a ^ 0x9E37_79B9_7F4A_7C15);
    (a, second.finish())
}

/// Script and grammar settings may hold a file path or the source itself.
fn read_source(value: &str) -> String {
    let path = Path::new(value);
    if path.is_file() {
        std::fs::read_to_string(path).unwrap_or_else(|_| value.to_owned())
    } else {
        value.to_owned()
    }
}

fn put_type_from(settings: &Settings) -> PutType {
    match settings.put.put_type.as_str() {
        "script" => PutType::Script,
        "stdin_dump" => PutType::StdinDump,
        _ => PutType::Undefined,
    }
}

impl Session {
    /// Starts a fresh session from settings. Fails with `StartupError` on
    /// oracle or grammar misconfiguration.
    pub fn start(settings: Settings) -> Result<Session, SessionError> {
        let oracle_source = read_source(&settings.put.lua_oracle_script);
        if oracle_source.trim().is_empty() {
            return Err(SessionError::Startup("no oracle script configured".into()));
        }
        let grammar = Grammar::parse(&read_source(&settings.put.grammar));
        if !grammar.is_usable() {
            return Err(SessionError::Startup("grammar has no tokens".into()));
        }
        if settings.put.path.trim().is_empty() {
            return Err(SessionError::Startup("no PUT path configured".into()));
        }

        let registry = Arc::new(FormRegistry::new(fresh_guid()));
        register_factories(&registry);

        let settings_form = registry.create(|_| settings.clone());
        let grammar_form = registry.create(|_| grammar);
        let generator_form = registry.create(|_| Generator::default());
        let oracle_form = registry.create(|_| Oracle {
            put_type: put_type_from(&settings),
            put_path: settings.put.path.clone(),
            cmd_script: read_source(&settings.put.lua_cmd_script),
            cmd_replay_script: read_source(&settings.put.lua_cmd_script_replay),
            script_args_script: read_source(&settings.put.lua_script_args_script),
            oracle_script: oracle_source,
        });
        let exclusion_form = registry.create(|_| ExclusionTree::new());
        let session_data_form = registry.create(|_| SessionData::default());
        let session_form = registry.create(|_| SessionForm::default());
        let _ = settings_form;

        // Normalized settings land next to the saves.
        if settings.saves.enable_saves {
            let normalized = settings.saves.save_path.join(format!(
                "{}_settings.toml",
                settings.saves.save_name
            ));
            if let Err(err) = settings.write_normalized(&normalized) {
                warn!(target: "session", %err, "settings_writeback_failed");
            }
        }

        let session = Self::wire(
            registry,
            settings,
            oracle_form,
            grammar_form,
            generator_form,
            exclusion_form,
            session_data_form,
            session_form,
            Duration::ZERO,
        )?;

        // First generation plus the initial master-control/generate pair.
        {
            let ctx = &session.ctx;
            let generation = ctx.registry.create(|_| {
                let mut g = Generation::new(
                    1,
                    ctx.settings.generation.generation_size,
                    ctx.settings.threads.concurrent_tests.max(1) as u64,
                );
                g.max_derived_inputs_per_source =
                    ctx.settings.generation.max_derived_inputs_per_source;
                g.max_derived_fails_per_source =
                    ctx.settings.generation.max_derived_fails_per_source;
                g.started_at = Some(Duration::ZERO);
                g
            });
            let mut data = ctx.session_data.write();
            data.current_generation = generation.id();
            data.generations.push(generation.id());
        }
        functions::schedule_generate_tests(&session.ctx);
        Ok(session)
    }

    /// Resumes a session from a save file.
    pub fn start_loaded(path: &Path) -> Result<Session, SessionError> {
        let registry = Arc::new(FormRegistry::new((0, 0)));
        register_factories(&registry);
        let outcome = core_forms::load(&registry, path, None)?;

        let settings = registry
            .singleton::<Settings>()
            .map(|s| s.read().clone())
            .map_err(|_| SessionError::Startup("save file lacks settings".into()))?;
        let oracle_form = registry
            .singleton::<Oracle>()
            .map_err(|_| SessionError::Startup("save file lacks the oracle".into()))?;
        let grammar_form = registry
            .singleton::<Grammar>()
            .map_err(|_| SessionError::Startup("save file lacks the grammar".into()))?;
        let generator_form = registry
            .singleton::<Generator>()
            .map_err(|_| SessionError::Startup("save file lacks the generator".into()))?;
        let exclusion_form = registry.create(|_| ExclusionTree::new());
        let session_data_form = registry.create(|_| SessionData::default());
        let session_form = registry.create(|_| SessionForm::default());

        let session = Self::wire(
            registry,
            settings,
            oracle_form,
            grammar_form,
            generator_form,
            exclusion_form,
            session_data_form,
            session_form,
            outcome.header.runtime,
        )?;

        // Resume unfinished delta controllers under fresh batch ids.
        let controllers: Vec<FormId> = session.ctx.session_data.read().controllers.clone();
        for id in controllers {
            if let Ok(ctrl) = session.ctx.registry.lookup::<DeltaController>(id) {
                if !ctrl.read().is_finished() {
                    delta::resume(&session.ctx, &ctrl);
                }
            }
        }

        // The pending callback saved with the file restarts generation;
        // fall back to a fresh task when absent or unknown.
        let rebuilt = outcome
            .pending_callback
            .as_deref()
            .and_then(|bytes| session.factories.deserialize(bytes));
        match rebuilt {
            Some(task) => session.ctx.scheduler.submit(task),
            None => functions::schedule_generate_tests(&session.ctx),
        }
        info!(target: "session", path = %path.display(), "session_resumed");
        Ok(session)
    }

    #[allow(clippy::too_many_arguments)]
    fn wire(
        registry: Arc<FormRegistry>,
        settings: Settings,
        oracle: FormRef<Oracle>,
        grammar: FormRef<Grammar>,
        generator: FormRef<Generator>,
        exclusion: FormRef<ExclusionTree>,
        session_data: FormRef<SessionData>,
        session_form: FormRef<SessionForm>,
        runtime_base: Duration,
    ) -> Result<Session, SessionError> {
        let scheduler = TaskScheduler::new(settings.scheduler_config());
        scheduler.set_worker_hooks(Arc::new(OracleWorkerHooks {
            oracle: oracle.clone(),
        }));
        let exec = ExecutionHandler::new(settings.exec_config());

        let ctx = EngineCtx::new(
            registry,
            scheduler.clone(),
            exec.clone(),
            settings,
            oracle,
            grammar,
            generator,
            exclusion,
            session_data,
            runtime_base,
        );
        scheduler.start();
        exec.start();

        // Callback factories for the pending-callback region of a save.
        let factories = Arc::new(TaskFactories::new());
        {
            let ctx2 = Arc::clone(&ctx);
            factories.register(functions::TASK_TAG_GENERATE, move |_reader| {
                let ctx3 = Arc::clone(&ctx2);
                let task: Box<dyn core_sched::Task> = ClosureTask::new(
                    TaskClass::Heavy,
                    functions::TASK_TAG_GENERATE,
                    move || functions::generate_tests(&ctx3),
                );
                Some(task)
            });
        }

        let session = Session {
            ctx,
            form: session_form,
            state: Arc::new(ControlState {
                ended: Mutex::new(None),
                ended_cv: Condvar::new(),
                paused: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                wake: Mutex::new(()),
                wake_cv: Condvar::new(),
            }),
            control: Mutex::new(None),
            last_error: Mutex::new(None),
            factories,
        };
        session.spawn_control_thread();
        Ok(session)
    }

    pub fn ctx(&self) -> &Arc<EngineCtx> {
        &self.ctx
    }

    fn spawn_control_thread(&self) {
        let ctx = Arc::clone(&self.ctx);
        let state = Arc::clone(&self.state);
        let form = self.form.clone();
        let tests_at_last_save = Arc::new(Mutex::new(0u64));
        let memory_over = Arc::new(Mutex::new(None::<Instant>));
        let last_autosave = Arc::new(Mutex::new(Instant::now()));

        let handle = std::thread::Builder::new()
            .name("session-control".into())
            .spawn(move || {
                info!(target: "session.control", "control_started");
                loop {
                    if state.stop_requested.load(Ordering::Acquire) {
                        break;
                    }
                    if !state.paused.load(Ordering::Acquire) {
                        if let Some(reason) = Self::master_control(
                            &ctx,
                            &form,
                            &tests_at_last_save,
                            &last_autosave,
                            &memory_over,
                        ) {
                            let mut ended =
                                state.ended.lock().expect("ended lock poisoned");
                            if ended.is_none() {
                                *ended = Some(reason);
                                state.ended_cv.notify_all();
                            }
                            break;
                        }
                    }
                    let guard = state.wake.lock().expect("wake lock poisoned");
                    let _ = state
                        .wake_cv
                        .wait_timeout(guard, CONTROL_PERIOD)
                        .expect("wake lock poisoned");
                }
                info!(target: "session.control", "control_stopped");
            })
            .expect("failed to spawn control thread");
        *self.control.lock().expect("control lock poisoned") = Some(handle);
    }

    /// One master-control pass. Returns the end reason when the session
    /// should stop.
    fn master_control(
        ctx: &Arc<EngineCtx>,
        form: &FormRef<SessionForm>,
        tests_at_last_save: &Arc<Mutex<u64>>,
        last_autosave: &Arc<Mutex<Instant>>,
        memory_over: &Arc<Mutex<Option<Instant>>>,
    ) -> Option<EndReason> {
        // 1. End checks.
        let goals = &ctx.settings.goals;
        let (total, positives, negatives, collapsed) = {
            let data = ctx.session_data.read();
            (
                data.total_tests,
                data.positive_count,
                data.negative_count,
                data.generation_collapsed(),
            )
        };
        if goals.use_overall_tests && goals.overall_tests > 0 && total >= goals.overall_tests {
            info!(target: "session.control", total, "overall_tests_goal_reached");
            return Some(EndReason::GoalReached);
        }
        if goals.use_found_positives && goals.found_positives > 0 && positives >= goals.found_positives
        {
            return Some(EndReason::GoalReached);
        }
        if goals.use_found_negatives && goals.found_negatives > 0 && negatives >= goals.found_negatives
        {
            return Some(EndReason::GoalReached);
        }
        if goals.use_timeout
            && goals.timeout_s > 0
            && ctx.runtime() >= Duration::from_secs(goals.timeout_s)
        {
            return Some(EndReason::GoalReached);
        }
        if collapsed {
            warn!(target: "session.control", "generation_failure_rate_exceeded");
            return Some(EndReason::ConvergenceFailure);
        }

        // 2. Autosave checks.
        let saves = &ctx.settings.saves;
        if saves.enable_saves {
            let by_tests = saves.autosave_period_tests > 0 && {
                let mut last = tests_at_last_save.lock().expect("save lock poisoned");
                if total.saturating_sub(*last) >= saves.autosave_period_tests {
                    *last = total;
                    true
                } else {
                    false
                }
            };
            let by_time = saves.autosave_period_seconds > 0 && {
                let mut last = last_autosave.lock().expect("save lock poisoned");
                if last.elapsed() >= Duration::from_secs(saves.autosave_period_seconds) {
                    *last = Instant::now();
                    true
                } else {
                    false
                }
            };
            if by_tests || by_time {
                Self::save_to_disk(ctx, form);
            }
        }

        // 3. Memory checks: sweep at the soft limit, end past the hard
        //    limit after the confirmation delay.
        let memory = &ctx.settings.memory;
        if memory.memory_soft_limit > 0 {
            let rss = ctx.own_memory();
            if rss > memory.memory_soft_limit * 1024 * 1024 {
                let swept = ctx.registry.sweep(|f| {
                    (f.type_tag() == core_inputs::input::TYPE_INPUT
                        || f.type_tag() == core_inputs::derivation::TYPE_DERIVATION_TREE)
                        && (f.meta().has_flag(FormFlags::DUPLICATE)
                            || f.meta().has_flag(FormFlags::DELETED))
                });
                if swept > 0 {
                    info!(target: "session.control", swept, "memory_sweep");
                }
            }
        }
        if memory.memory_limit > 0 {
            let rss = ctx.own_memory();
            let mut over = memory_over.lock().expect("memory lock poisoned");
            if rss > memory.memory_limit * 1024 * 1024 {
                match *over {
                    None => *over = Some(Instant::now()),
                    Some(since) if since.elapsed() >= MEMORY_CONFIRM => {
                        error!(target: "session.control", rss, "hard_memory_limit");
                        if ctx.settings.saves.enable_saves {
                            Self::save_to_disk(ctx, form);
                        }
                        return Some(EndReason::OutOfMemory);
                    }
                    Some(_) => {}
                }
            } else {
                *over = None;
            }
        }

        // 4. Periodic index cleanup.
        {
            let registry = Arc::clone(&ctx.registry);
            ctx.session_data.write().cleanup(move |id| {
                registry
                    .lookup::<Input>(id)
                    .map(|input| {
                        !input.meta().has_flag(FormFlags::DUPLICATE)
                            && !input.meta().has_flag(FormFlags::DELETED)
                    })
                    .unwrap_or(false)
            });
        }

        // 5. Delta watchdog.
        let controllers: Vec<FormId> = ctx.session_data.read().controllers.clone();
        for id in controllers {
            if let Ok(ctrl) = ctx.registry.lookup::<DeltaController>(id) {
                delta::watchdog_check(ctx, &ctrl);
            }
        }

        // 6. Execution handler stall probe.
        if !ctx.exec.last_cycle_within(Duration::from_secs(10)) {
            ctx.exec.reinitialize();
        }

        // 7. Keep the generation pipeline moving.
        functions::check_generation_end(ctx);
        if let Some(generation) = ctx.current_generation() {
            let (can, _) = generation.write().can_generate();
            if can && !ctx.block_input_generation.load(Ordering::Acquire) {
                functions::schedule_generate_tests(ctx);
            }
        }

        None
    }

    fn save_to_disk(ctx: &Arc<EngineCtx>, form: &FormRef<SessionForm>) {
        let number = {
            let mut f = form.write();
            f.save_number += 1;
            f.save_number
        };
        let path = ctx.settings.save_file(number);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let save_ctx = SaveContext {
            global_tasks: false,
            global_exec: false,
            runtime: ctx.runtime(),
            compression: ctx.settings.compression(),
            pending_callback: pending_generate_callback(),
        };
        let hooks = FreezeBoth {
            scheduler: Arc::clone(&ctx.scheduler),
            exec: Arc::clone(&ctx.exec),
        };
        match core_forms::save(&ctx.registry, &path, &save_ctx, &hooks) {
            Ok(()) => info!(target: "session", path = %path.display(), "saved"),
            Err(err) => warn!(target: "session", %err, "save_failed"),
        }
    }

    /// Explicit save, used by `stop(save)` and the CLI.
    pub fn save(&self) -> Result<std::path::PathBuf, SessionError> {
        let number = {
            let mut f = self.form.write();
            f.save_number += 1;
            f.save_number
        };
        let path = self.ctx.settings.save_file(number);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let save_ctx = SaveContext {
            global_tasks: false,
            global_exec: false,
            runtime: self.ctx.runtime(),
            compression: self.ctx.settings.compression(),
            pending_callback: pending_generate_callback(),
        };
        let hooks = FreezeBoth {
            scheduler: Arc::clone(&self.ctx.scheduler),
            exec: Arc::clone(&self.ctx.exec),
        };
        core_forms::save(&self.ctx.registry, &path, &save_ctx, &hooks)?;
        Ok(path)
    }

    /// Blocks until the session ends.
    pub fn wait(&self) -> EndReason {
        let mut ended = self.state.ended.lock().expect("ended lock poisoned");
        while ended.is_none() {
            ended = self
                .state
                .ended_cv
                .wait(ended)
                .expect("ended lock poisoned");
        }
        ended.unwrap_or_default()
    }

    /// Blocks until the session ends or the timeout elapses.
    pub fn wait_for(&self, timeout: Duration) -> Option<EndReason> {
        let deadline = Instant::now() + timeout;
        let mut ended = self.state.ended.lock().expect("ended lock poisoned");
        while ended.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self
                .state
                .ended_cv
                .wait_timeout(ended, deadline - now)
                .expect("ended lock poisoned");
            ended = next;
        }
        *ended
    }

    pub fn end_reason(&self) -> Option<EndReason> {
        *self.state.ended.lock().expect("ended lock poisoned")
    }

    /// Freezes both pools and blocks input production.
    pub fn pause(&self) {
        self.state.paused.store(true, Ordering::Release);
        self.ctx.block_input_generation.store(true, Ordering::Release);
        self.ctx.scheduler.freeze();
        self.ctx.exec.freeze();
        info!(target: "session", "paused");
    }

    pub fn resume(&self) {
        self.ctx.exec.thaw();
        self.ctx.scheduler.thaw();
        self.ctx.block_input_generation.store(false, Ordering::Release);
        self.state.paused.store(false, Ordering::Release);
        info!(target: "session", "resumed");
    }

    /// Stops everything; optionally writes a final save first.
    pub fn stop(&self, save: bool) -> EndReason {
        self.ctx.abort.store(true, Ordering::Release);
        self.ctx
            .block_input_generation
            .store(true, Ordering::Release);
        self.state.stop_requested.store(true, Ordering::Release);
        self.state.wake_cv.notify_all();
        if let Some(handle) = self.control.lock().expect("control lock poisoned").take() {
            let _ = handle.join();
        }

        if save && self.ctx.settings.saves.enable_saves {
            if let Err(err) = self.save() {
                warn!(target: "session", %err, "final_save_failed");
                *self.last_error.lock().expect("error lock poisoned") = Some(err);
            }
        }

        self.ctx.exec.stop();
        self.ctx.scheduler.stop(false);

        let reason = {
            let mut ended = self.state.ended.lock().expect("ended lock poisoned");
            if ended.is_none() {
                *ended = Some(EndReason::Aborted);
                self.state.ended_cv.notify_all();
            }
            ended.unwrap_or(EndReason::Aborted)
        };
        {
            let mut f = self.form.write();
            f.ended = true;
            f.end_reason = reason.as_u8();
        }
        info!(target: "session", reason = ?reason, "stopped");
        reason
    }

    /// Consumes the session after stop.
    pub fn destroy(self) {
        drop(self);
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .expect("error lock poisoned")
            .as_ref()
            .map(|e| e.to_string())
    }

    pub fn stats(&self) -> SessionStats {
        let data = self.ctx.session_data.read();
        let exclusion = self.ctx.exclusion.read();
        let generation_number = self
            .ctx
            .registry
            .lookup::<Generation>(data.current_generation)
            .map(|g| g.read().number)
            .unwrap_or(0);
        SessionStats {
            total_tests: data.total_tests,
            positives: data.positive_count,
            negatives: data.negative_count,
            unfinished: data.unfinished_count,
            undefined: data.undefined_count,
            duplicates: self.ctx.counters.duplicates.load(Ordering::Relaxed),
            prefix_skips: self.ctx.counters.prefix_skips.load(Ordering::Relaxed),
            stale_batch_completions: self
                .ctx
                .counters
                .stale_batch_completions
                .load(Ordering::Relaxed),
            dd_tests: self.ctx.counters.dd_tests.load(Ordering::Relaxed),
            repeats: self.ctx.counters.repeats.load(Ordering::Relaxed),
            generation_number,
            controllers: data.controllers.len(),
            exclusion_nodes: exclusion.node_count(),
            exclusion_leaves: exclusion.leaf_count(),
            exclusion_depth: exclusion.depth(),
            runtime_seconds: self.ctx.runtime().as_secs(),
            forms: self.ctx.registry.len(),
        }
    }

    /// Reads the statistics of a save file without starting a session.
    pub fn stats_from_save(path: &Path) -> Result<SessionStats, SessionError> {
        let registry = Arc::new(FormRegistry::new((0, 0)));
        register_factories(&registry);
        let outcome = core_forms::load(&registry, path, None)?;
        let data = registry
            .singleton::<SessionData>()
            .map_err(|_| SessionError::Startup("save file lacks session data".into()))?;
        let exclusion = registry
            .singleton::<ExclusionTree>()
            .map_err(|_| SessionError::Startup("save file lacks the exclusion tree".into()))?;
        let data = data.read();
        let exclusion = exclusion.read();
        let generation_number = registry
            .lookup::<Generation>(data.current_generation)
            .map(|g| g.read().number)
            .unwrap_or(0);
        Ok(SessionStats {
            total_tests: data.total_tests,
            positives: data.positive_count,
            negatives: data.negative_count,
            unfinished: data.unfinished_count,
            undefined: data.undefined_count,
            duplicates: 0,
            prefix_skips: 0,
            stale_batch_completions: 0,
            dd_tests: 0,
            repeats: 0,
            generation_number,
            controllers: data.controllers.len(),
            exclusion_nodes: exclusion.node_count(),
            exclusion_leaves: exclusion.leaf_count(),
            exclusion_depth: exclusion.depth(),
            runtime_seconds: outcome.header.runtime.as_secs(),
            forms: registry.len(),
        })
    }

    /// Registers an externally supplied input with the session (dry replay
    /// and seeded delta-debug paths). The returned guard keeps it pinned.
    pub fn seed_input(
        &self,
        tokens: Vec<String>,
    ) -> Result<(FormRef<Input>, RetainGuard), SessionError> {
        let tree = {
            let grammar = self.ctx.grammar.read();
            if !grammar.derives(&tokens) {
                return Err(SessionError::InvalidDerivation);
            }
            let leaves = tokens.iter().map(core_inputs::DerivationNode::leaf).collect();
            DerivationTree::new(
                self.ctx.grammar.id(),
                core_inputs::DerivationNode::inner("S", leaves),
            )
        };
        let tree = self.ctx.registry.create(|_| tree);
        let generation_id = self.ctx.session_data.read().current_generation;
        let input = self.ctx.registry.create(|_| {
            let mut fresh = Input::new(tokens);
            fresh.generation_id = generation_id;
            fresh.derive_tree_id = tree.id();
            fresh.target_length = fresh.sequence.len() as i64;
            fresh
        });
        let pin = RetainGuard::pin(&input);
        Ok((input, pin))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A dropped-but-never-stopped session still shuts its threads down.
        if !self.state.stop_requested.load(Ordering::Acquire) {
            self.stop(false);
        }
    }
}
