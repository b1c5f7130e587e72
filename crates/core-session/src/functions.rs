//! Session functions: test submission, the per-test completion pipeline,
//! and generation tasks.
//!
//! Every finished test flows through [`test_end`] on a Light worker: stale
//! derivation re-queue, duplicate short-circuit, oracle classification,
//! generation bookkeeping, index and exclusion-tree updates, delta
//! controller notification and generation-end checking, in that order. The
//! pipeline never unwinds into the scheduler; failures are recorded on the
//! input and surface through statistics.

use crate::ctx::EngineCtx;
use crate::delta;
use crate::generation::Generation;
use crate::sessiondata::FilterParams;
use crate::sets::InputNode;
use core_exec::{ExitReason, Test};
use core_forms::{FormFlags, FormId, FormRef, RetainGuard};
use core_inputs::{AddOutcome, DerivationTree, Input, OracleVerdict};
use core_oracle::OracleError;
use core_sched::{ClosureTask, TaskClass};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

pub const TASK_TAG_TEST_END: u64 = 0x7465_6E64; // "tend"
pub const TASK_TAG_GENERATE: u64 = 0x6765_6E74; // "gent"
pub const TASK_TAG_GENERATION_END: u64 = 0x6765_6E64; // "gend"

/// Maximum automatic re-queues of a delta candidate whose derivation went
/// stale.
const MAX_REPEATS: u32 = 3;

/// Where a test came from; delta completions carry their batch tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOrigin {
    Generation,
    Delta { controller: FormId, batch: u64 },
}

/// Builds and submits the PUT test for an input. Must run on a scheduler
/// worker (the command line comes from the worker's oracle context).
pub fn submit_test(
    ctx: &Arc<EngineCtx>,
    input: &FormRef<Input>,
    origin: TestOrigin,
) -> Result<(), crate::SessionError> {
    let sequence = input.read().sequence.clone();
    let mut test = Test::new(
        ctx.next_test_id(),
        input.id(),
        Some(RetainGuard::pin(input)),
        sequence,
        Default::default(),
        ctx.settings.tests.execute_fragments,
    );
    test.command = ctx.put_command(&test, false)?;

    input.write().set_verdict(OracleVerdict::Running);
    if let Ok(generation) = ctx.registry.lookup::<Generation>(input.read().generation_id) {
        generation.write().input_started();
    }
    ctx.counters.tests_started.fetch_add(1, Ordering::Relaxed);
    if matches!(origin, TestOrigin::Delta { .. }) {
        ctx.counters.dd_tests.fetch_add(1, Ordering::Relaxed);
    }

    let ctx2 = Arc::clone(ctx);
    ctx.exec.submit(
        test,
        Box::new(move |done| {
            let ctx3 = Arc::clone(&ctx2);
            ctx2.scheduler.submit(ClosureTask::new(
                TaskClass::Light,
                TASK_TAG_TEST_END,
                move || test_end(&ctx3, done, origin),
            ));
        }),
    );
    Ok(())
}

pub fn submit_delta_test(
    ctx: &Arc<EngineCtx>,
    input: &FormRef<Input>,
    controller: FormId,
    batch: u64,
) -> Result<(), crate::SessionError> {
    submit_test(ctx, input, TestOrigin::Delta { controller, batch })
}

/// The TestEnd pipeline.
pub fn test_end(ctx: &Arc<EngineCtx>, mut test: Test, origin: TestOrigin) {
    let input_id = test.input_id;
    let Ok(input) = ctx.registry.lookup::<Input>(input_id) else {
        warn!(target: "session.functions", input_id, "test_end_input_missing");
        return;
    };

    // 1. Delta candidates whose derivation no longer matches their
    //    sequence are repeated, not classified.
    if let TestOrigin::Delta { .. } = origin {
        let stale = {
            let data = input.read();
            ctx.registry
                .lookup::<DerivationTree>(data.derive_tree_id)
                .map(|tree| tree.read().leaf_count() != data.sequence.len())
                .unwrap_or(true)
        };
        if stale {
            let retries = {
                let mut data = input.write();
                data.retries += 1;
                data.retries
            };
            if retries <= MAX_REPEATS {
                test.exit_reasons |= ExitReason::REPEAT;
                ctx.counters.repeats.fetch_add(1, Ordering::Relaxed);
                debug!(target: "session.functions", input_id, retries, "candidate_repeat");
                input_finished(ctx, &input);
                drop(test);
                if let Err(err) = submit_test(ctx, &input, origin) {
                    warn!(target: "session.functions", input_id, %err, "repeat_submit_failed");
                    complete_delta(ctx, origin, input_id);
                }
                return;
            }
            // Too many repeats: fall through and classify what we have.
            warn!(target: "session.functions", input_id, "repeat_cap_reached");
        }
    }

    // 2. A decided prefix makes this input a duplicate of the earliest
    //    input that reached the terminal.
    let prefix = {
        let tree = ctx.exclusion.read();
        tree.has_prefix(&input.read().sequence)
    };
    if prefix.found && prefix.input_id != input_id {
        input.meta().set_flag(FormFlags::DUPLICATE);
        ctx.counters.duplicates.fetch_add(1, Ordering::Relaxed);
        debug!(
            target: "session.functions",
            input_id,
            effective = prefix.input_id,
            "duplicate_of_prefix"
        );
        input_finished(ctx, &input);
        {
            let mut data = ctx.session_data.write();
            data.record_duplicate(input_id);
            if origin == TestOrigin::Generation {
                data.record_generation_attempt(false);
            }
        }
        // Free the duplicate and its derivation; the prefix source is the
        // effective input.
        let tree_id = input.read().derive_tree_id;
        test.pin = None;
        drop(test);
        complete_delta(ctx, origin, input_id);
        ctx.registry.delete(tree_id);
        ctx.registry.delete(input_id);
        check_generation_end(ctx);
        return;
    }

    // 3. Classification under the worker's oracle context.
    let evaluation = {
        let oracle = ctx.oracle.read();
        oracle.evaluate(&test)
    };
    let evaluation = match evaluation {
        Ok(evaluation) => evaluation,
        Err(OracleError::NoContext) => {
            error!(target: "session.functions", input_id, "oracle_context_missing");
            ctx.counters
                .oracle_context_misses
                .fetch_add(1, Ordering::Relaxed);
            input_finished(ctx, &input);
            if origin == TestOrigin::Generation {
                ctx.session_data.write().record_generation_attempt(false);
            }
            complete_delta(ctx, origin, input_id);
            return;
        }
        Err(err) => {
            warn!(target: "session.functions", input_id, %err, "oracle_failed");
            Default::default()
        }
    };

    // Attach execution stats to the input, then fix the verdict. Score and
    // length writes must precede the final verdict, which freezes them.
    {
        let mut data = input.write();
        data.execution_time = Some(test.runtime());
        data.exit_code = test.exit_code;
        data.exit_reasons = test.exit_reasons.bits();
        data.reaction_times = test.reaction_times.clone();
        if test.fragment_mode {
            data.trim_to(test.delivered);
        }
        data.set_scores(
            evaluation.primary,
            evaluation.secondary,
            evaluation.primary_individual.clone(),
            evaluation.secondary_individual.clone(),
        );
        let store = ctx.settings.tests.store_put_output
            || (ctx.settings.tests.store_put_output_successful
                && evaluation.verdict == OracleVerdict::Passing);
        if store {
            data.output = Some(test.output_lossy());
        }
        data.set_verdict(evaluation.verdict);
    }

    // 4. Generation membership.
    if let Ok(generation) = ctx.registry.lookup::<Generation>(input.read().generation_id) {
        let mut g = generation.write();
        match origin {
            TestOrigin::Generation => {
                g.generated.insert(input_id);
            }
            TestOrigin::Delta { .. } => {
                g.dd_generated.insert(input_id);
            }
        }
        let parent = input.read().parent_id;
        if parent != 0 {
            g.record_derivation(parent, evaluation.verdict == OracleVerdict::Failing);
        }
    }

    // 5. Indices and the exclusion tree.
    let verdict = input.read().verdict();
    let node = {
        let data = input.read();
        InputNode::new(
            input_id,
            data.primary_score(),
            data.secondary_score(),
            data.effective_len(),
        )
    };
    let mut duplicate = false;
    if matches!(
        verdict,
        OracleVerdict::Passing | OracleVerdict::Failing | OracleVerdict::Unfinished
    ) {
        let outcome = {
            let mut tree = ctx.exclusion.write();
            tree.add_input(&input.read().sequence, verdict, input_id)
        };
        match outcome {
            AddOutcome::Duplicate { input_id: earliest } if earliest != input_id => {
                input.meta().set_flag(FormFlags::DUPLICATE);
                ctx.counters.duplicates.fetch_add(1, Ordering::Relaxed);
                duplicate = true;
            }
            AddOutcome::Subsumed { .. } => {
                input.meta().set_flag(FormFlags::DUPLICATE);
                duplicate = true;
            }
            _ => {}
        }
    }
    {
        let mut data = ctx.session_data.write();
        if duplicate {
            data.record_duplicate(input_id);
        } else {
            data.record_classification(node, verdict);
        }
        if origin == TestOrigin::Generation {
            data.record_generation_attempt(!duplicate);
        }
    }

    // 6. Release the execution pin; the test object is done.
    input_finished(ctx, &input);
    test.pin = None;
    drop(test);

    // Delta bookkeeping and possible new controllers.
    complete_delta(ctx, origin, input_id);
    if origin == TestOrigin::Generation
        && !duplicate
        && verdict == OracleVerdict::Failing
        && ctx.settings.generation.delta_debugging
        && input.read().sequence.len() > 1
    {
        let params = delta::DeltaParams::from_settings(&ctx.settings.delta);
        delta::start_controller(
            ctx,
            &input,
            delta::DeltaMode::Standard,
            delta::DeltaGoal::ReproduceResult,
            params,
            Vec::new(),
        );
    }

    // 7. Generation-end check for the current generation.
    check_generation_end(ctx);
}

fn complete_delta(ctx: &Arc<EngineCtx>, origin: TestOrigin, input_id: FormId) {
    if let TestOrigin::Delta { controller, batch } = origin {
        delta::candidate_completed(ctx, controller, batch, input_id);
    }
}

fn input_finished(ctx: &Arc<EngineCtx>, input: &FormRef<Input>) {
    if let Ok(generation) = ctx.registry.lookup::<Generation>(input.read().generation_id) {
        generation.write().input_finished();
    }
}

/// Consecutive in-task generation failures before the task yields back to
/// the scheduler (the control loop re-schedules it).
const GENERATION_FAILURE_BAIL: u32 = 50;

/// Heavy task: produce inputs for the current generation until its budget
/// is exhausted or production is blocked.
pub fn generate_tests(ctx: &Arc<EngineCtx>) {
    let mut consecutive_failures = 0u32;
    loop {
        if ctx.aborted() || ctx.block_input_generation.load(Ordering::Acquire) {
            return;
        }
        let Some(generation) = ctx.current_generation() else {
            return;
        };
        {
            let mut g = generation.write();
            let (can, _) = g.can_generate();
            if !can {
                return;
            }
            g.begin_generation();
        }

        let produced = produce_one(ctx, &generation);
        {
            let mut g = generation.write();
            g.finish_generation(produced);
        }
        if produced {
            consecutive_failures = 0;
        } else {
            ctx.session_data.write().record_generation_attempt(false);
            consecutive_failures += 1;
            if consecutive_failures >= GENERATION_FAILURE_BAIL {
                return;
            }
        }
    }
}

/// One generation attempt: sequence, prefix gate, forms, submission.
/// Sequences that extend a decided prefix are answered from the exclusion
/// tree instead of being executed.
fn produce_one(ctx: &Arc<EngineCtx>, generation: &FormRef<Generation>) -> bool {
    let grammar = ctx.grammar.read();
    let generated = {
        let mut generator = ctx.generator.write();
        generator.generate(&grammar, ctx.grammar.id(), 0)
    };
    drop(grammar);
    let Some((tokens, tree)) = generated else {
        return false;
    };

    let prefix = {
        let exclusion = ctx.exclusion.read();
        exclusion.has_prefix(&tokens)
    };

    let tree = ctx.registry.create(|_| tree);
    let generation_id = generation.id();
    let input = ctx.registry.create(|_| {
        let mut fresh = Input::new(tokens);
        fresh.generation_id = generation_id;
        fresh.derive_tree_id = tree.id();
        fresh.target_length = fresh.sequence.len() as i64;
        fresh
    });

    if prefix.found {
        // The result is already determined by the prefix terminal; inherit
        // its classification without spawning the PUT.
        ctx.counters.prefix_skips.fetch_add(1, Ordering::Relaxed);
        let (primary, secondary) = ctx
            .registry
            .lookup::<Input>(prefix.input_id)
            .map(|source| {
                let data = source.read();
                (data.primary_score(), data.secondary_score())
            })
            .unwrap_or((0.0, 0.0));
        let length = {
            let mut data = input.write();
            data.set_scores(primary, secondary, Vec::new(), Vec::new());
            data.set_verdict(prefix.verdict);
            data.effective_len()
        };
        generation.write().generated.insert(input.id());
        ctx.session_data.write().record_classification(
            InputNode::new(input.id(), primary, secondary, length),
            prefix.verdict,
        );
        return true;
    }

    match submit_test(ctx, &input, TestOrigin::Generation) {
        Ok(()) => true,
        Err(err) => {
            warn!(target: "session.functions", input = input.id(), %err, "submit_failed");
            false
        }
    }
}

/// Schedules the generation task on the Heavy queue.
pub fn schedule_generate_tests(ctx: &Arc<EngineCtx>) {
    let ctx2 = Arc::clone(ctx);
    ctx.scheduler.submit(ClosureTask::new(
        TaskClass::Heavy,
        TASK_TAG_GENERATE,
        move || generate_tests(&ctx2),
    ));
}

/// Generation-end probe; at most one end callback is in flight per
/// generation.
pub fn check_generation_end(ctx: &Arc<EngineCtx>) {
    let Some(generation) = ctx.current_generation() else {
        return;
    };
    let claim = {
        let mut g = generation.write();
        if g.is_ended() || !g.is_ending(ctx.exec.is_idle()) {
            false
        } else {
            g.claim_end_callback()
        }
    };
    if claim {
        let ctx2 = Arc::clone(ctx);
        let generation_id = generation.id();
        ctx.scheduler.submit(ClosureTask::new(
            TaskClass::Light,
            TASK_TAG_GENERATION_END,
            move || end_generation(&ctx2, generation_id),
        ));
    }
}

/// Ends the generation and rolls the session onto the next one, seeded by
/// the root-fair source filter.
fn end_generation(ctx: &Arc<EngineCtx>, generation_id: FormId) {
    let Ok(generation) = ctx.registry.lookup::<Generation>(generation_id) else {
        return;
    };
    let number = {
        let mut g = generation.write();
        if g.is_ended() {
            return;
        }
        g.end(ctx.runtime());
        g.number
    };

    // Next generation, seeded from the best classified inputs.
    let sources = {
        let data = ctx.session_data.read();
        let params = FilterParams {
            target: ctx.settings.generation.generation_step as usize,
            start_frac: ctx.settings.generation.generation_tweak_start.max(0.05),
            frac_step: 0.1,
            use_secondary: false,
            min_length: ctx.settings.delta.min_backtrack_length,
            exclude_delta_debugged: !ctx.settings.delta.allow_delta_debugged_sources,
        };
        data.filter_sources(&params, |id| {
            let input = ctx.registry.lookup::<Input>(id).ok()?;
            let meta = input.meta();
            if meta.has_flag(FormFlags::DUPLICATE) || meta.has_flag(FormFlags::DELETED) {
                return None;
            }
            let root = {
                let d = input.read();
                if meta.has_flag(FormFlags::GENERATED_DELTA_DEBUGGING) && d.parent_id != 0 {
                    d.parent_id
                } else {
                    id
                }
            };
            Some(crate::sessiondata::FilterInfo {
                root,
                delta_debugged: meta.has_flag(FormFlags::DELTA_DEBUGGED),
            })
        })
    };

    let next = ctx.registry.create(|_| {
        let mut g = Generation::new(
            number + 1,
            ctx.settings.generation.generation_size,
            ctx.settings.threads.concurrent_tests.max(1) as u64,
        );
        g.max_derived_inputs_per_source = ctx.settings.generation.max_derived_inputs_per_source;
        g.max_derived_fails_per_source = ctx.settings.generation.max_derived_fails_per_source;
        g.started_at = Some(ctx.runtime());
        g
    });
    {
        let mut g = next.write();
        for id in &sources {
            if let Ok(source) = ctx.registry.lookup::<Input>(*id) {
                g.add_source(*id, RetainGuard::pin(&source));
            }
        }
    }
    {
        let mut data = ctx.session_data.write();
        data.current_generation = next.id();
        data.generations.push(next.id());
    }
    info!(
        target: "session.functions",
        ended = number,
        next = number + 1,
        sources = sources.len(),
        "generation_rolled"
    );
    schedule_generate_tests(ctx);
}
