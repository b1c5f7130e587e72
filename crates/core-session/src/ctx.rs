//! Shared runtime context.
//!
//! One `EngineCtx` is built per session and handed (as an `Arc`) to every
//! task the scheduler runs: generation jobs, test completions, delta
//! batches, the control loop. It bundles the singleton forms, the two
//! thread pools and the session-wide switches; everything persistent stays
//! in the forms themselves.

use crate::generation::Generation;
use crate::grammar::{Generator, Grammar};
use crate::sessiondata::SessionData;
use crate::settings::Settings;
use core_exec::{ExecutionHandler, TestCommand};
use core_forms::{FormRef, FormRegistry};
use core_inputs::ExclusionTree;
use core_oracle::{Oracle, PutType};
use core_sched::TaskScheduler;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Process-wide counters surfaced by the stats printer.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub tests_started: AtomicU64,
    pub prefix_skips: AtomicU64,
    pub duplicates: AtomicU64,
    pub stale_batch_completions: AtomicU64,
    pub dd_tests: AtomicU64,
    pub repeats: AtomicU64,
    pub oracle_context_misses: AtomicU64,
}

pub struct EngineCtx {
    pub registry: Arc<FormRegistry>,
    pub scheduler: Arc<TaskScheduler>,
    pub exec: Arc<ExecutionHandler>,
    pub settings: Settings,
    pub oracle: FormRef<Oracle>,
    pub grammar: FormRef<Grammar>,
    pub generator: FormRef<Generator>,
    pub exclusion: FormRef<ExclusionTree>,
    pub session_data: FormRef<SessionData>,
    pub counters: EngineCounters,
    /// Session-wide cooperative cancellation.
    pub abort: AtomicBool,
    /// Pauses new-input production without touching the generation lock.
    pub block_input_generation: AtomicBool,
    test_ids: AtomicU64,
    /// Runtime carried over from previous sessions of this save.
    runtime_base: Duration,
    started_at: Instant,
}

impl EngineCtx {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<FormRegistry>,
        scheduler: Arc<TaskScheduler>,
        exec: Arc<ExecutionHandler>,
        settings: Settings,
        oracle: FormRef<Oracle>,
        grammar: FormRef<Grammar>,
        generator: FormRef<Generator>,
        exclusion: FormRef<ExclusionTree>,
        session_data: FormRef<SessionData>,
        runtime_base: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            scheduler,
            exec,
            settings,
            oracle,
            grammar,
            generator,
            exclusion,
            session_data,
            counters: EngineCounters::default(),
            abort: AtomicBool::new(false),
            block_input_generation: AtomicBool::new(false),
            test_ids: AtomicU64::new(1),
            runtime_base,
            started_at: Instant::now(),
        })
    }

    pub fn next_test_id(&self) -> u64 {
        self.test_ids.fetch_add(1, Ordering::AcqRel)
    }

    /// Cumulative session runtime, previous runs included.
    pub fn runtime(&self) -> Duration {
        self.runtime_base + self.started_at.elapsed()
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    pub fn current_generation(&self) -> Option<FormRef<Generation>> {
        let id = self.session_data.read().current_generation;
        self.registry.lookup::<Generation>(id).ok()
    }

    /// Resolves the PUT command line for one test. Must run on a worker
    /// with a registered oracle context.
    pub fn put_command(
        &self,
        test: &core_exec::Test,
        replay: bool,
    ) -> Result<TestCommand, core_oracle::OracleError> {
        let oracle = self.oracle.read();
        let raw_args = oracle.get_cmd_args(test, replay)?;
        let mut args: Vec<String> = raw_args.split_whitespace().map(str::to_owned).collect();
        if oracle.put_type == PutType::Script {
            // Script PUTs get their script arguments prepended.
            let script_args = oracle.get_script_args(test)?;
            let mut prepended: Vec<String> =
                script_args.split_whitespace().map(str::to_owned).collect();
            prepended.append(&mut args);
            args = prepended;
        }
        Ok(TestCommand {
            program: oracle.put_path.clone(),
            args,
        })
    }

    /// Resident set size of this process, 0 when unknown.
    pub fn own_memory(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            let Ok(contents) = std::fs::read_to_string("/proc/self/statm") else {
                return 0;
            };
            let mut fields = contents.split_whitespace();
            let _virtual = fields.next();
            fields
                .next()
                .and_then(|pages| pages.parse::<u64>().ok())
                .map(|pages| pages * 4096)
                .unwrap_or(0)
        }
        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }
}
