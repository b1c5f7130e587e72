//! Delta-debugging controller: goal-directed subset search over one input.
//!
//! The controller is an explicit state machine (`AwaitingBatch` →
//! `EvaluatingLevel` → … → `Finished`) driven by three events: candidate
//! completion, batch drained, evaluation done. Candidates of one level form
//! a batch tagged with a monotonically increasing id; completions carrying
//! an older id are discarded from accounting (their retention pins are
//! still released). The evaluate-level step is single-flight, guarded by
//! the `send_end`/`processed_end` pair plus a batch-id check inside the
//! task itself.
//!
//! Standard mode is classical ddmin: split into `level` parts, test each
//! part and its complement. ScoreProgress mode removes windows drawn only
//! from contiguous equal-score ranges of the per-position primary scores,
//! skipping `skip_ranges` leading ranges inherited from an already-reduced
//! ancestor.

use crate::ctx::EngineCtx;
use crate::functions;
use crate::settings::DeltaSettings;
use core_codec::buffer::{ByteReader, ByteWriter};
use core_codec::record::StringTable;
use core_forms::{Form, FormFlags, FormId, FormRef, RetainGuard};
use core_inputs::{DerivationTree, Input, OracleVerdict, ParentSplit, SplitRange};
use core_sched::{ClosureTask, TaskClass};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const TYPE_DELTA_CONTROLLER: i32 = i32::from_be_bytes(*b"DDCT");

/// Scheduler type tags of the controller's tasks.
pub const TASK_TAG_EVALUATE_LEVEL: u64 = 0x6464_6576; // "ddev"
pub const TASK_TAG_BEGIN_BATCH: u64 = 0x6464_6267; // "ddbg"

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeltaMode {
    #[default]
    Standard,
    ScoreProgress,
}

impl DeltaMode {
    fn from_u8(v: u8) -> Self {
        if v == 1 { DeltaMode::ScoreProgress } else { DeltaMode::Standard }
    }

    fn as_u8(self) -> u8 {
        match self {
            DeltaMode::Standard => 0,
            DeltaMode::ScoreProgress => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeltaGoal {
    #[default]
    None,
    ReproduceResult,
    MaximizePrimary,
    MaximizeSecondary,
    MaximizeBoth,
}

impl DeltaGoal {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DeltaGoal::ReproduceResult,
            2 => DeltaGoal::MaximizePrimary,
            3 => DeltaGoal::MaximizeSecondary,
            4 => DeltaGoal::MaximizeBoth,
            _ => DeltaGoal::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DeltaGoal::None => 0,
            DeltaGoal::ReproduceResult => 1,
            DeltaGoal::MaximizePrimary => 2,
            DeltaGoal::MaximizeSecondary => 3,
            DeltaGoal::MaximizeBoth => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DdPhase {
    #[default]
    AwaitingBatch,
    EvaluatingLevel,
    Finishing,
    Finished,
}

impl DdPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => DdPhase::EvaluatingLevel,
            2 => DdPhase::Finishing,
            3 => DdPhase::Finished,
            _ => DdPhase::AwaitingBatch,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            DdPhase::AwaitingBatch => 0,
            DdPhase::EvaluatingLevel => 1,
            DdPhase::Finishing => 2,
            DdPhase::Finished => 3,
        }
    }
}

/// Parameter object of one controller, frozen at start.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaParams {
    pub acceptable_loss_primary: f64,
    pub acceptable_loss_secondary: f64,
    pub absolute_loss_primary: f64,
    pub absolute_loss_secondary: f64,
    /// Total-test budget; 0 is unlimited.
    pub budget: u64,
    /// Candidates in flight per batch; 0 runs the whole level at once.
    pub batch_cap: usize,
    pub execute_above_length: usize,
    pub approximate_execution: bool,
    pub approx_threshold: f64,
    pub run_reproduce_after_score: bool,
    /// Leading score ranges to skip (ScoreProgress).
    pub skip_ranges: usize,
}

impl DeltaParams {
    pub fn from_settings(settings: &DeltaSettings) -> Self {
        Self {
            acceptable_loss_primary: settings.acceptable_loss_primary,
            acceptable_loss_secondary: settings.acceptable_loss_secondary,
            absolute_loss_primary: settings.acceptable_loss_absolute_primary,
            absolute_loss_secondary: settings.acceptable_loss_absolute_secondary,
            budget: settings.budget,
            batch_cap: settings.batchprocessing,
            execute_above_length: settings.execute_above_length,
            approximate_execution: settings.approximate_execution,
            approx_threshold: settings.approx_threshold,
            run_reproduce_after_score: settings.run_reproduce_results_after_score_approx_on_positive,
            skip_ranges: 0,
        }
    }
}

/// One queued candidate: its split descriptor and, once created, the input
/// form carrying it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCandidate {
    pub split: ParentSplit,
    pub input_id: Option<FormId>,
}

/// Loss record kept per completed candidate. The batch tag scopes level
/// evaluation: level values repeat (they reset after every improvement),
/// batch ids never do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateResult {
    pub primary_loss: f64,
    pub secondary_loss: f64,
    pub level: u64,
    pub batch: u64,
}

#[derive(Default)]
pub struct DeltaController {
    pub orig_input: FormId,
    pub current_best: FormId,
    pub best_primary: f64,
    pub best_secondary: f64,
    pub orig_verdict: OracleVerdict,
    pub mode: DeltaMode,
    pub goal: DeltaGoal,
    pub params: Option<DeltaParams>,
    pub level: u64,
    pub phase: DdPhase,
    pub batch_id: u64,
    pub waiting: VecDeque<PendingCandidate>,
    /// Submitted candidates of the current batch, by input id.
    pub active: BTreeMap<FormId, ParentSplit>,
    pub completed_tests: Vec<FormId>,
    pub results: BTreeMap<FormId, CandidateResult>,
    pub total_tests: u64,
    pub skipped_stale: u64,
    pub prefix_skips: u64,
    pub approx_skips: u64,
    pub invalid_extractions: u64,
    pub send_end: bool,
    pub processed_end: bool,
    pub started_at: Option<Duration>,
    pub ended_at: Option<Duration>,
    /// Runtime pins on the inputs this controller borrows.
    pins: HashMap<FormId, RetainGuard>,
    /// Completion callbacks submitted to the scheduler at finish.
    callbacks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl DeltaController {
    pub fn params(&self) -> &DeltaParams {
        self.params.as_ref().expect("controller started without params")
    }

    pub fn is_finished(&self) -> bool {
        self.phase == DdPhase::Finished
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// Whether the controller actually reduced its input.
    pub fn reduced(&self) -> bool {
        self.current_best != self.orig_input
    }

    fn pin(&mut self, input: &FormRef<Input>) {
        self.pins
            .entry(input.id())
            .or_insert_with(|| RetainGuard::pin(input));
    }

    fn unpin(&mut self, id: FormId) {
        self.pins.remove(&id);
    }

    /// The acceptance predicate of the configured goal.
    fn passes(&self, verdict: OracleVerdict, primary: f64, secondary: f64) -> bool {
        let params = self.params();
        let primary_ok = || {
            let loss = self.best_primary - primary;
            let rel = if self.best_primary > 0.0 {
                loss / self.best_primary
            } else {
                0.0
            };
            rel < params.acceptable_loss_primary
                && (params.absolute_loss_primary <= 0.0 || loss <= params.absolute_loss_primary)
        };
        let secondary_ok = || {
            let loss = self.best_secondary - secondary;
            let rel = if self.best_secondary > 0.0 {
                loss / self.best_secondary
            } else {
                0.0
            };
            rel < params.acceptable_loss_secondary
                && (params.absolute_loss_secondary <= 0.0 || loss <= params.absolute_loss_secondary)
        };
        match self.goal {
            DeltaGoal::None => false,
            DeltaGoal::ReproduceResult => verdict == self.orig_verdict,
            DeltaGoal::MaximizePrimary => primary_ok(),
            DeltaGoal::MaximizeSecondary => secondary_ok(),
            DeltaGoal::MaximizeBoth => primary_ok() && secondary_ok(),
        }
    }
}

/// Splits `length` into `parts` roughly-equal windows; the last absorbs the
/// remainder.
pub fn partition(length: usize, parts: usize) -> Vec<SplitRange> {
    if length == 0 || parts == 0 {
        return Vec::new();
    }
    let parts = parts.min(length);
    let base = length / parts;
    let mut out = Vec::with_capacity(parts);
    let mut begin = 0usize;
    for i in 0..parts {
        let len = if i + 1 == parts { length - begin } else { base };
        out.push(SplitRange { begin, length: len });
        begin += len;
    }
    out
}

/// Candidate splits for one Standard-mode level: each sufficiently long
/// part and its complement.
pub fn standard_candidates(length: usize, level: u64, min_part: usize) -> Vec<ParentSplit> {
    let mut out = Vec::new();
    for part in partition(length, level as usize) {
        if part.length < min_part.max(1) {
            continue;
        }
        out.push(ParentSplit {
            ranges: vec![part],
            complement: false,
        });
        if part.length < length {
            out.push(ParentSplit {
                ranges: vec![part],
                complement: true,
            });
        }
    }
    out
}

/// Candidate splits for one ScoreProgress-mode level: complements of
/// `length/level`-sized windows drawn from within the equal-score ranges,
/// the first `skip_ranges` ranges excluded.
pub fn score_progress_candidates(
    ranges: &[SplitRange],
    length: usize,
    level: u64,
    skip_ranges: usize,
) -> Vec<ParentSplit> {
    let window = (length / level.max(1) as usize).max(1);
    let mut out = Vec::new();
    for range in ranges.iter().skip(skip_ranges) {
        let mut begin = range.begin;
        let end = range.begin + range.length;
        while begin < end {
            let len = window.min(end - begin);
            out.push(ParentSplit {
                ranges: vec![SplitRange { begin, length: len }],
                complement: true,
            });
            begin += len;
        }
    }
    out
}

/// Creates and starts a controller over `input`. Registers it with the
/// session data and current generation, then schedules the first batch as
/// a Medium task.
pub fn start_controller(
    ctx: &Arc<EngineCtx>,
    input: &FormRef<Input>,
    mode: DeltaMode,
    goal: DeltaGoal,
    params: DeltaParams,
    callbacks: Vec<Box<dyn FnOnce() + Send>>,
) -> FormRef<DeltaController> {
    let (primary, secondary, verdict) = {
        let data = input.read();
        (data.primary_score(), data.secondary_score(), data.verdict())
    };
    let runtime = ctx.runtime();
    let ctrl = ctx.registry.create(|_| DeltaController::default());
    {
        let mut c = ctrl.write();
        c.orig_input = input.id();
        c.current_best = input.id();
        c.best_primary = primary;
        c.best_secondary = secondary;
        c.orig_verdict = verdict;
        c.mode = mode;
        c.goal = goal;
        c.params = Some(params);
        c.level = 2;
        c.phase = DdPhase::AwaitingBatch;
        c.started_at = Some(runtime);
        c.callbacks = Mutex::new(callbacks);
        c.pin(input);
    }
    {
        let mut data = ctx.session_data.write();
        data.controllers.push(ctrl.id());
    }
    if let Some(generation) = ctx.current_generation() {
        generation.write().controllers.insert(ctrl.id());
    }
    info!(
        target: "session.delta",
        controller = ctrl.id(),
        input = input.id(),
        mode = ?mode,
        goal = ?goal,
        "controller_started"
    );
    schedule_begin_batch(ctx, ctrl.id());
    ctrl
}

fn schedule_begin_batch(ctx: &Arc<EngineCtx>, ctrl_id: FormId) {
    let ctx = Arc::clone(ctx);
    ctx.scheduler.clone().submit(ClosureTask::new(
        TaskClass::Medium,
        TASK_TAG_BEGIN_BATCH,
        move || {
            if let Ok(ctrl) = ctx.registry.lookup::<DeltaController>(ctrl_id) {
                begin_batch(&ctx, &ctrl);
            }
        },
    ));
}

/// Fills the waiting queue with the current level's candidates and starts
/// submitting. Called at controller start and after each level evaluation.
pub fn begin_batch(ctx: &Arc<EngineCtx>, ctrl: &FormRef<DeltaController>) {
    let (splits, best_id) = {
        let mut c = ctrl.write();
        if c.phase == DdPhase::Finished || c.phase == DdPhase::Finishing {
            return;
        }
        let best_id = c.current_best;
        let Ok(best) = ctx.registry.lookup::<Input>(best_id) else {
            warn!(target: "session.delta", controller = ctrl.id(), "best_input_missing");
            drop(c);
            finish(ctx, ctrl);
            return;
        };
        let best_data = best.read();
        let length = best_data.sequence.len();
        if length <= 1 {
            drop(best_data);
            drop(c);
            finish(ctx, ctrl);
            return;
        }
        let splits = match c.mode {
            DeltaMode::Standard => {
                standard_candidates(length, c.level, c.params().execute_above_length)
            }
            DeltaMode::ScoreProgress => score_progress_candidates(
                &best_data.primary_score_ranges(),
                length,
                c.level,
                c.params().skip_ranges,
            ),
        };
        drop(best_data);
        c.waiting
            .extend(splits.iter().cloned().map(|split| PendingCandidate {
                split,
                input_id: None,
            }));
        c.send_end = false;
        c.processed_end = false;
        c.phase = DdPhase::AwaitingBatch;
        (splits, best_id)
    };
    debug!(
        target: "session.delta",
        controller = ctrl.id(),
        candidates = splits.len(),
        best = best_id,
        "batch_built"
    );
    pump_waiting(ctx, ctrl);
}

/// Submits waiting candidates while the batch cap allows. Candidates the
/// exclusion tree or derivation extraction reject are counted and skipped
/// without ever becoming tests.
pub fn pump_waiting(ctx: &Arc<EngineCtx>, ctrl: &FormRef<DeltaController>) {
    loop {
        let next = {
            let mut c = ctrl.write();
            if c.phase != DdPhase::AwaitingBatch {
                return;
            }
            let cap = c.params().batch_cap;
            if cap != 0 && c.active.len() >= cap {
                return;
            }
            match c.waiting.pop_front() {
                Some(pending) => (pending, c.batch_id, c.current_best, c.best_primary),
                None => break,
            }
        };
        let (pending, batch_id, best_id, best_primary) = next;
        submit_candidate(ctx, ctrl, pending, batch_id, best_id, best_primary);
    }

    // Batch drained without a single live candidate: evaluate directly.
    let drained = {
        let mut c = ctrl.write();
        if c.phase == DdPhase::AwaitingBatch
            && c.active.is_empty()
            && c.waiting.is_empty()
            && !c.send_end
        {
            c.send_end = true;
            true
        } else {
            false
        }
    };
    if drained {
        enqueue_evaluate(ctx, ctrl.id());
    }
}

enum CandidateBuild {
    /// Runs against the PUT.
    Live(FormRef<Input>),
    /// Result already determined by a decided prefix; never executed.
    Answered(FormRef<Input>),
    /// Gated away (approximation or invalid extraction).
    Skipped,
}

fn submit_candidate(
    ctx: &Arc<EngineCtx>,
    ctrl: &FormRef<DeltaController>,
    pending: PendingCandidate,
    batch_id: u64,
    best_id: FormId,
    best_primary: f64,
) {
    // Reuse the candidate input when resubmitting after a load.
    let build = if let Some(id) = pending.input_id {
        match ctx.registry.lookup::<Input>(id) {
            Ok(input) => CandidateBuild::Live(input),
            Err(_) => CandidateBuild::Skipped,
        }
    } else {
        build_candidate_input(ctx, ctrl, &pending.split, best_id, best_primary)
    };

    match build {
        CandidateBuild::Live(input) => {
            {
                let mut c = ctrl.write();
                c.pin(&input);
                c.active.insert(input.id(), pending.split.clone());
            }
            if let Err(err) = functions::submit_delta_test(ctx, &input, ctrl.id(), batch_id) {
                warn!(
                    target: "session.delta",
                    controller = ctrl.id(),
                    input = input.id(),
                    %err,
                    "candidate_submit_failed"
                );
                let mut c = ctrl.write();
                c.active.remove(&input.id());
                c.unpin(input.id());
                c.invalid_extractions += 1;
            }
        }
        CandidateBuild::Answered(input) => {
            // The tree answered; account the candidate as completed so the
            // level evaluation can still pick it.
            let (primary, secondary) = {
                let data = input.read();
                (data.primary_score(), data.secondary_score())
            };
            let mut c = ctrl.write();
            c.pin(&input);
            c.completed_tests.push(input.id());
            let result = CandidateResult {
                primary_loss: c.best_primary - primary,
                secondary_loss: c.best_secondary - secondary,
                level: c.level,
                batch: c.batch_id,
            };
            c.results.insert(input.id(), result);
        }
        CandidateBuild::Skipped => {}
    }
}

/// Materializes one candidate: sequence via the split, derivation via
/// extraction, exclusion-tree gating.
fn build_candidate_input(
    ctx: &Arc<EngineCtx>,
    ctrl: &FormRef<DeltaController>,
    split: &ParentSplit,
    best_id: FormId,
    best_primary: f64,
) -> CandidateBuild {
    let Ok(best) = ctx.registry.lookup::<Input>(best_id) else {
        return CandidateBuild::Skipped;
    };
    let (sequence, tree_id, generation_id) = {
        let data = best.read();
        (
            Input::apply_split(&data.sequence, split),
            data.derive_tree_id,
            data.generation_id,
        )
    };
    if sequence.is_empty() {
        ctrl.write().invalid_extractions += 1;
        return CandidateBuild::Skipped;
    }

    // Exclusion gating: a decided prefix answers the candidate outright;
    // in approximate mode a dominant completed extension suppresses it.
    let params_approx = {
        let c = ctrl.read();
        (
            c.params().approximate_execution,
            c.params().approx_threshold,
        )
    };
    let (hit, extension) = {
        let tree = ctx.exclusion.read();
        tree.has_prefix_and_shortest_extension(&sequence)
    };
    if !hit.found && params_approx.0 {
        if let Some((ext_id, _)) = extension {
            if let Ok(ext) = ctx.registry.lookup::<Input>(ext_id) {
                let dominant =
                    ext.read().primary_score() > best_primary * (1.0 - params_approx.1);
                if dominant {
                    ctrl.write().approx_skips += 1;
                    return CandidateBuild::Skipped;
                }
            }
        }
    }

    // Regenerate the derivation by extraction; non-derivable splits are
    // dropped.
    let parent_tree = ctx.registry.lookup::<DerivationTree>(tree_id).ok();
    let extracted = parent_tree
        .as_ref()
        .and_then(|t| crate::grammar::Generator::extract_subtree(&t.read(), split));
    let Some(extracted) = extracted else {
        ctrl.write().invalid_extractions += 1;
        return CandidateBuild::Skipped;
    };

    let tree = ctx.registry.create(|_| extracted);
    let input = ctx.registry.create(|_| {
        let mut candidate = Input::new(sequence);
        candidate.parent_id = best_id;
        candidate.generation_id = generation_id;
        candidate.derive_tree_id = tree.id();
        candidate.parent_split = split.clone();
        candidate.target_length = candidate.sequence.len() as i64;
        candidate
    });
    input
        .meta()
        .set_flag(FormFlags::GENERATED_DELTA_DEBUGGING);

    if hit.found {
        // Inherit the terminal's classification without executing. The
        // per-position vectors carry over only for exact duplicates.
        ctrl.write().prefix_skips += 1;
        let (primary, secondary, primary_individual, secondary_individual) = ctx
            .registry
            .lookup::<Input>(hit.input_id)
            .map(|source| {
                let data = source.read();
                let exact = data.sequence.len() == input.read().sequence.len();
                (
                    data.primary_score(),
                    data.secondary_score(),
                    if exact { data.primary_individual().to_vec() } else { Vec::new() },
                    if exact { data.secondary_individual().to_vec() } else { Vec::new() },
                )
            })
            .unwrap_or((0.0, 0.0, Vec::new(), Vec::new()));
        {
            let mut data = input.write();
            data.set_scores(primary, secondary, primary_individual, secondary_individual);
            data.set_verdict(hit.verdict);
        }
        return CandidateBuild::Answered(input);
    }
    CandidateBuild::Live(input)
}

/// Candidate completion event, called from the test-end pipeline after the
/// oracle classified the input. Completions of stale batches only release
/// their pin.
pub fn candidate_completed(
    ctx: &Arc<EngineCtx>,
    ctrl_id: FormId,
    batch_id: u64,
    input_id: FormId,
) {
    let Ok(ctrl) = ctx.registry.lookup::<DeltaController>(ctrl_id) else {
        return;
    };
    let action = {
        let mut c = ctrl.write();
        if c.phase == DdPhase::Finished {
            c.unpin(input_id);
            return;
        }
        if batch_id != c.batch_id {
            c.skipped_stale += 1;
            c.unpin(input_id);
            ctx.counters
                .stale_batch_completions
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            return;
        }

        c.active.remove(&input_id);
        c.completed_tests.push(input_id);
        c.total_tests += 1;
        let level = c.level;
        let batch = c.batch_id;
        if let Ok(input) = ctx.registry.lookup::<Input>(input_id) {
            let data = input.read();
            let result = CandidateResult {
                primary_loss: c.best_primary - data.primary_score(),
                secondary_loss: c.best_secondary - data.secondary_score(),
                level,
                batch,
            };
            drop(data);
            c.results.insert(input_id, result);

            // Fast path: a passing candidate that cannot get smaller stops
            // the batch early.
            let input_data = input.read();
            if input_data.sequence.len() <= 1
                && c.passes(
                    input_data.verdict(),
                    input_data.primary_score(),
                    input_data.secondary_score(),
                )
            {
                c.waiting.clear();
            }
        }

        if !c.waiting.is_empty() {
            CompletionAction::Pump
        } else if c.active.is_empty() && !c.send_end {
            c.send_end = true;
            CompletionAction::Evaluate
        } else {
            CompletionAction::Nothing
        }
    };
    match action {
        CompletionAction::Pump => pump_waiting(ctx, &ctrl),
        CompletionAction::Evaluate => enqueue_evaluate(ctx, ctrl_id),
        CompletionAction::Nothing => {}
    }
}

enum CompletionAction {
    Pump,
    Evaluate,
    Nothing,
}

/// Schedules the single evaluate-level task (Light class).
pub fn enqueue_evaluate(ctx: &Arc<EngineCtx>, ctrl_id: FormId) {
    let ctx2 = Arc::clone(ctx);
    ctx.scheduler.submit(ClosureTask::new(
        TaskClass::Light,
        TASK_TAG_EVALUATE_LEVEL,
        move || {
            if let Ok(ctrl) = ctx2.registry.lookup::<DeltaController>(ctrl_id) {
                evaluate_level(&ctx2, &ctrl);
            }
        },
    ));
}

/// The level-evaluation step: scores the completed batch against the goal,
/// replaces the current best or widens the partition, and either builds the
/// next batch or finishes.
pub fn evaluate_level(ctx: &Arc<EngineCtx>, ctrl: &FormRef<DeltaController>) {
    // Single-flight entry guard.
    {
        let mut c = ctrl.write();
        if c.phase != DdPhase::AwaitingBatch
            || !c.send_end
            || c.processed_end
            || !c.active.is_empty()
        {
            return;
        }
        c.processed_end = true;
        c.phase = DdPhase::EvaluatingLevel;
    }

    enum Decision {
        NextBatch,
        Finish,
    }

    let decision = {
        let mut c = ctrl.write();
        let params_budget = c.params().budget;
        if params_budget != 0 && c.total_tests >= params_budget {
            info!(
                target: "session.delta",
                controller = ctrl.id(),
                tests = c.total_tests,
                "budget_exhausted"
            );
            Decision::Finish
        } else {
            // Collect this batch's passing candidates.
            let batch = c.batch_id;
            let current_best = c.current_best;
            let mut passing: Vec<(FormId, f64, f64, usize, bool)> = Vec::new();
            let completed: Vec<FormId> = c
                .results
                .iter()
                .filter(|(id, r)| r.batch == batch && **id != current_best)
                .map(|(id, _)| *id)
                .collect();
            for id in completed {
                let Ok(input) = ctx.registry.lookup::<Input>(id) else {
                    continue;
                };
                let data = input.read();
                if c.passes(data.verdict(), data.primary_score(), data.secondary_score()) {
                    passing.push((
                        id,
                        data.primary_score(),
                        data.secondary_score(),
                        data.sequence.len(),
                        data.parent_split.complement,
                    ));
                }
            }

            let best_len = ctx
                .registry
                .lookup::<Input>(c.current_best)
                .map(|b| b.read().sequence.len())
                .unwrap_or(0);

            if let Some(winner) = pick_winner(c.goal, &passing) {
                let (id, primary, secondary, len, complement) = winner;
                let old_best = c.current_best;
                c.current_best = id;
                c.best_primary = primary;
                c.best_secondary = secondary;
                if old_best != c.orig_input && old_best != id {
                    c.unpin(old_best);
                }
                c.level = if complement { c.level.saturating_sub(1).max(2) } else { 2 };
                debug!(
                    target: "session.delta",
                    controller = ctrl.id(),
                    best = id,
                    len,
                    level = c.level,
                    "best_replaced"
                );
                if len <= 1 {
                    Decision::Finish
                } else {
                    Decision::NextBatch
                }
            } else if c.level >= best_len as u64 {
                Decision::Finish
            } else {
                c.level = (c.level * 2).min(best_len as u64);
                Decision::NextBatch
            }
        }
    };

    match decision {
        Decision::NextBatch => {
            {
                let mut c = ctrl.write();
                c.batch_id += 1;
                c.phase = DdPhase::AwaitingBatch;
                c.send_end = false;
                c.processed_end = false;
            }
            begin_batch(ctx, ctrl);
        }
        Decision::Finish => finish(ctx, ctrl),
    }
}

/// Goal-specific preference among passing candidates.
fn pick_winner(
    goal: DeltaGoal,
    passing: &[(FormId, f64, f64, usize, bool)],
) -> Option<(FormId, f64, f64, usize, bool)> {
    if passing.is_empty() {
        return None;
    }
    let best = match goal {
        DeltaGoal::ReproduceResult => passing
            .iter()
            .min_by_key(|(_, _, _, len, _)| *len),
        DeltaGoal::MaximizeSecondary => passing.iter().max_by(|a, b| {
            a.2.total_cmp(&b.2)
                .then_with(|| a.1.total_cmp(&b.1))
                .then_with(|| b.3.cmp(&a.3))
        }),
        _ => passing.iter().max_by(|a, b| {
            a.1.total_cmp(&b.1)
                .then_with(|| a.2.total_cmp(&b.2))
                .then_with(|| b.3.cmp(&a.3))
        }),
    };
    best.copied()
}

/// Terminal transition: flags, pins, callbacks, optional follow-up
/// controller.
pub fn finish(ctx: &Arc<EngineCtx>, ctrl: &FormRef<DeltaController>) {
    let (callbacks, spawn_reproduce) = {
        let mut c = ctrl.write();
        if c.phase == DdPhase::Finished || c.phase == DdPhase::Finishing {
            return;
        }
        c.phase = DdPhase::Finishing;
        c.ended_at = Some(ctx.runtime());

        // Release everything except the result and the origin.
        let keep = [c.current_best, c.orig_input];
        let doomed: Vec<FormId> = c
            .pins
            .keys()
            .copied()
            .filter(|id| !keep.contains(id))
            .collect();
        for id in doomed {
            c.unpin(id);
        }

        let spawn = c.params().run_reproduce_after_score
            && c.goal == DeltaGoal::ReproduceResult
            && c.mode != DeltaMode::Standard
            && !c.reduced();
        let callbacks = std::mem::take(&mut *c.callbacks.lock().unwrap());
        c.phase = DdPhase::Finished;
        (callbacks, spawn)
    };

    if let Ok(orig) = ctx.registry.lookup::<Input>(ctrl.read().orig_input) {
        orig.meta().set_flag(FormFlags::DELTA_DEBUGGED);
    }

    let (ctrl_id, best, tests) = {
        let c = ctrl.read();
        (ctrl.id(), c.current_best, c.total_tests)
    };
    info!(
        target: "session.delta",
        controller = ctrl_id,
        best,
        tests,
        "controller_finished"
    );

    if spawn_reproduce {
        let c = ctrl.read();
        if let Ok(input) = ctx.registry.lookup::<Input>(c.orig_input) {
            let params = c.params().clone();
            let goal = c.goal;
            drop(c);
            start_controller(ctx, &input, DeltaMode::Standard, goal, params, Vec::new());
        }
    }

    for callback in callbacks {
        ctx.scheduler.submit(ClosureTask::new(
            TaskClass::Light,
            TASK_TAG_EVALUATE_LEVEL,
            callback,
        ));
    }
}

/// Watchdog probe from the session control loop: re-enqueues the evaluate
/// task when a batch looks drained but no evaluation is pending, or an
/// evaluation was scheduled and never ran.
pub fn watchdog_check(ctx: &Arc<EngineCtx>, ctrl: &FormRef<DeltaController>) {
    let stuck = {
        let c = ctrl.read();
        if c.phase == DdPhase::Finished || c.phase == DdPhase::Finishing {
            false
        } else {
            (c.active.is_empty() && c.waiting.is_empty() && !c.send_end)
                || (c.send_end && !c.processed_end)
        }
    };
    if stuck {
        {
            let mut c = ctrl.write();
            if c.active.is_empty() && c.waiting.is_empty() {
                c.send_end = true;
            }
        }
        warn!(target: "session.delta", controller = ctrl.id(), "watchdog_requeue");
        enqueue_evaluate(ctx, ctrl.id());
    }
}

/// Post-load continuation: in-flight candidates of the saved batch become
/// waiting again under a fresh batch id.
pub fn resume(ctx: &Arc<EngineCtx>, ctrl: &FormRef<DeltaController>) {
    {
        let mut c = ctrl.write();
        if c.phase == DdPhase::Finished || c.phase == DdPhase::Finishing {
            return;
        }
        let stranded: Vec<PendingCandidate> = c
            .active
            .iter()
            .map(|(id, split)| PendingCandidate {
                split: split.clone(),
                input_id: Some(*id),
            })
            .collect();
        c.active.clear();
        for pending in stranded.into_iter().rev() {
            c.waiting.push_front(pending);
        }
        c.batch_id += 1;
        c.send_end = false;
        c.processed_end = false;
        c.phase = DdPhase::AwaitingBatch;
        // Re-pin the inputs this controller still references.
        for id in [c.orig_input, c.current_best] {
            if let Ok(input) = ctx.registry.lookup::<Input>(id) {
                c.pin(&input);
            }
        }
        let waiting_ids: Vec<FormId> =
            c.waiting.iter().filter_map(|p| p.input_id).collect();
        for id in waiting_ids {
            if let Ok(input) = ctx.registry.lookup::<Input>(id) {
                c.pin(&input);
            }
        }
    }
    info!(target: "session.delta", controller = ctrl.id(), "controller_resumed");
    // Submission resolves PUT command lines, which needs a worker's oracle
    // context; hand the pump to the pool.
    let ctx2 = Arc::clone(ctx);
    let ctrl_id = ctrl.id();
    ctx.scheduler.submit(ClosureTask::new(
        TaskClass::Medium,
        TASK_TAG_BEGIN_BATCH,
        move || {
            if let Ok(ctrl) = ctx2.registry.lookup::<DeltaController>(ctrl_id) {
                pump_waiting(&ctx2, &ctrl);
            }
        },
    ));
}

impl Form for DeltaController {
    fn type_tag() -> i32 {
        TYPE_DELTA_CONTROLLER
    }

    fn version() -> i32 {
        2
    }

    fn write_data(
        &self,
        out: &mut ByteWriter<Vec<u8>>,
        _strings: &mut StringTable,
    ) -> core_codec::Result<()> {
        out.write_u64(self.orig_input)?;
        out.write_u64(self.current_best)?;
        out.write_f64(self.best_primary)?;
        out.write_f64(self.best_secondary)?;
        out.write_u8(self.orig_verdict.as_u8())?;
        out.write_u8(self.mode.as_u8())?;
        out.write_u8(self.goal.as_u8())?;
        let params = self.params();
        out.write_f64(params.acceptable_loss_primary)?;
        out.write_f64(params.acceptable_loss_secondary)?;
        out.write_f64(params.absolute_loss_primary)?;
        out.write_f64(params.absolute_loss_secondary)?;
        out.write_u64(params.budget)?;
        out.write_u64(params.batch_cap as u64)?;
        out.write_u64(params.execute_above_length as u64)?;
        out.write_bool(params.approximate_execution)?;
        out.write_f64(params.approx_threshold)?;
        out.write_bool(params.run_reproduce_after_score)?;
        out.write_u64(params.skip_ranges as u64)?;
        out.write_u64(self.level)?;
        out.write_u8(self.phase.as_u8())?;
        out.write_u64(self.batch_id)?;
        write_split_list(
            out,
            self.waiting
                .iter()
                .map(|p| (&p.split, p.input_id.unwrap_or(0))),
            self.waiting.len(),
        )?;
        write_split_list(
            out,
            self.active.iter().map(|(id, s)| (s, *id)),
            self.active.len(),
        )?;
        out.write_u64(self.completed_tests.len() as u64)?;
        for id in &self.completed_tests {
            out.write_u64(*id)?;
        }
        out.write_u64(self.results.len() as u64)?;
        for (id, result) in &self.results {
            out.write_u64(*id)?;
            out.write_f64(result.primary_loss)?;
            out.write_f64(result.secondary_loss)?;
            out.write_u64(result.level)?;
            out.write_u64(result.batch)?;
        }
        out.write_u64(self.total_tests)?;
        out.write_u64(self.skipped_stale)?;
        out.write_u64(self.prefix_skips)?;
        out.write_u64(self.approx_skips)?;
        out.write_u64(self.invalid_extractions)?;
        out.write_duration(self.started_at)?;
        out.write_duration(self.ended_at)
    }

    fn read_data(
        _version: i32,
        input: &mut ByteReader<&[u8]>,
        _strings: &StringTable,
    ) -> core_forms::Result<Self> {
        let orig_input = input.read_u64()?;
        let current_best = input.read_u64()?;
        let best_primary = input.read_f64()?;
        let best_secondary = input.read_f64()?;
        let orig_verdict = OracleVerdict::from_u8(input.read_u8()?);
        let mode = DeltaMode::from_u8(input.read_u8()?);
        let goal = DeltaGoal::from_u8(input.read_u8()?);
        let params = DeltaParams {
            acceptable_loss_primary: input.read_f64()?,
            acceptable_loss_secondary: input.read_f64()?,
            absolute_loss_primary: input.read_f64()?,
            absolute_loss_secondary: input.read_f64()?,
            budget: input.read_u64()?,
            batch_cap: input.read_u64()? as usize,
            execute_above_length: input.read_u64()? as usize,
            approximate_execution: input.read_bool()?,
            approx_threshold: input.read_f64()?,
            run_reproduce_after_score: input.read_bool()?,
            skip_ranges: input.read_u64()? as usize,
        };
        let level = input.read_u64()?;
        let phase = DdPhase::from_u8(input.read_u8()?);
        let batch_id = input.read_u64()?;
        let waiting_raw = read_split_list(input)?;
        let active_raw = read_split_list(input)?;
        let mut completed_tests = Vec::new();
        for _ in 0..input.read_u64()? {
            completed_tests.push(input.read_u64()?);
        }
        let mut results = BTreeMap::new();
        for _ in 0..input.read_u64()? {
            let id = input.read_u64()?;
            let result = CandidateResult {
                primary_loss: input.read_f64()?,
                secondary_loss: input.read_f64()?,
                level: input.read_u64()?,
                batch: input.read_u64()?,
            };
            results.insert(id, result);
        }
        let total_tests = input.read_u64()?;
        let skipped_stale = input.read_u64()?;
        let prefix_skips = input.read_u64()?;
        let approx_skips = input.read_u64()?;
        let invalid_extractions = input.read_u64()?;
        let started_at = input.read_duration()?;
        let ended_at = input.read_duration()?;

        Ok(Self {
            orig_input,
            current_best,
            best_primary,
            best_secondary,
            orig_verdict,
            mode,
            goal,
            params: Some(params),
            level,
            phase,
            batch_id,
            waiting: waiting_raw
                .into_iter()
                .map(|(split, id)| PendingCandidate {
                    split,
                    input_id: (id != 0).then_some(id),
                })
                .collect(),
            active: active_raw.into_iter().map(|(s, id)| (id, s)).collect(),
            completed_tests,
            results,
            total_tests,
            skipped_stale,
            prefix_skips,
            approx_skips,
            invalid_extractions,
            send_end: false,
            processed_end: false,
            started_at,
            ended_at,
            pins: HashMap::new(),
            callbacks: Mutex::new(Vec::new()),
        })
    }
}

fn write_split_list<'a>(
    out: &mut ByteWriter<Vec<u8>>,
    items: impl Iterator<Item = (&'a ParentSplit, FormId)>,
    len: usize,
) -> core_codec::Result<()> {
    out.write_u64(len as u64)?;
    for (split, id) in items {
        out.write_u64(id)?;
        out.write_bool(split.complement)?;
        out.write_u64(split.ranges.len() as u64)?;
        for range in &split.ranges {
            out.write_u64(range.begin as u64)?;
            out.write_u64(range.length as u64)?;
        }
    }
    Ok(())
}

fn read_split_list(
    input: &mut ByteReader<&[u8]>,
) -> core_forms::Result<Vec<(ParentSplit, FormId)>> {
    let count = input.read_u64()? as usize;
    let mut out = Vec::with_capacity(count.min(1 << 16));
    for _ in 0..count {
        let id = input.read_u64()?;
        let complement = input.read_bool()?;
        let mut ranges = Vec::new();
        for _ in 0..input.read_u64()? {
            ranges.push(SplitRange {
                begin: input.read_u64()? as usize,
                length: input.read_u64()? as usize,
            });
        }
        out.push((ParentSplit { ranges, complement }, id));
    }
    Ok(out)
}
