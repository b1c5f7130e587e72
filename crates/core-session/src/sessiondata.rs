//! SessionData: the scoring indices and pools every other component reads.
//!
//! Holds the three descending orderings (primary, secondary, length) for
//! classified and unfinished inputs, bounded top-K mirrors of each, the
//! positive/negative pools, the recent-generation sliding window, and the
//! last-run ring. Index membership follows the verdict: a node stays until
//! its input is deleted or flagged duplicate, which the periodic cleanup
//! enforces.

use crate::sets::{ByLength, ByPrimary, BySecondary, InputNode, StableMultiset};
use core_codec::buffer::{ByteReader, ByteWriter};
use core_codec::record::StringTable;
use core_forms::{Form, FormFlags, FormId, LoadResolver, reserved};
use core_inputs::{Input, OracleVerdict};
use std::collections::{BTreeSet, VecDeque};
use tracing::debug;

pub const TYPE_SESSION_DATA: i32 = i32::from_be_bytes(*b"SDAT");

/// Depth of the generation success/failure window.
pub const GENERATION_WINDOW: usize = 1000;

/// Failure-rate threshold that ends the session with ConvergenceFailure.
pub const FAILURE_RATE_LIMIT: f64 = 0.9;

const LAST_RUN_RING: usize = 128;

/// One view (classified or unfinished): the three orderings plus their
/// bounded mirrors.
#[derive(Debug, Default)]
pub struct OrderedView {
    pub by_primary: BTreeSet<ByPrimary>,
    pub by_secondary: BTreeSet<BySecondary>,
    pub by_length: BTreeSet<ByLength>,
    pub top_primary: StableMultiset<ByPrimary>,
    pub top_secondary: StableMultiset<BySecondary>,
    pub top_length: StableMultiset<ByLength>,
}

impl OrderedView {
    fn insert(&mut self, node: InputNode) {
        self.by_primary.insert(ByPrimary(node));
        self.by_secondary.insert(BySecondary(node));
        self.by_length.insert(ByLength(node));
        self.top_primary.insert(ByPrimary(node));
        self.top_secondary.insert(BySecondary(node));
        self.top_length.insert(ByLength(node));
    }

    fn retain(&mut self, mut keep: impl FnMut(FormId) -> bool) {
        self.by_primary.retain(|n| keep(n.0.id));
        self.by_secondary.retain(|n| keep(n.0.id));
        self.by_length.retain(|n| keep(n.0.id));
        self.top_primary.retain(|n| keep(n.0.id));
        self.top_secondary.retain(|n| keep(n.0.id));
        self.top_length.retain(|n| keep(n.0.id));
    }

    pub fn len(&self) -> usize {
        self.by_primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_primary.is_empty()
    }
}

/// Eligibility data the source filter needs about one input.
#[derive(Debug, Clone, Copy)]
pub struct FilterInfo {
    /// Root under which the input was produced (the delta controller's
    /// original input, or the input itself for plain generation output).
    pub root: FormId,
    pub delta_debugged: bool,
}

/// Parameters of the root-fair source filter.
#[derive(Debug, Clone)]
pub struct FilterParams {
    pub target: usize,
    pub start_frac: f64,
    pub frac_step: f64,
    pub use_secondary: bool,
    pub min_length: usize,
    pub exclude_delta_debugged: bool,
}

#[derive(Debug, Default)]
pub struct SessionData {
    pub current_generation: FormId,
    pub generations: Vec<FormId>,
    pub classified: OrderedView,
    pub unfinished: OrderedView,
    pub positives: Vec<FormId>,
    pub negatives: Vec<FormId>,
    pub controllers: Vec<FormId>,
    pub positive_count: u64,
    pub negative_count: u64,
    pub unfinished_count: u64,
    pub undefined_count: u64,
    pub total_tests: u64,
    last_run: VecDeque<FormId>,
    generation_window: VecDeque<bool>,
    pub generation_attempts: u64,
    pub generation_failures: u64,
}

impl SessionData {
    /// Routes one classified input into the views, pools and counters.
    pub fn record_classification(&mut self, node: InputNode, verdict: OracleVerdict) {
        self.total_tests += 1;
        self.push_last_run(node.id);
        match verdict {
            OracleVerdict::Passing => {
                self.positive_count += 1;
                self.positives.push(node.id);
                self.classified.insert(node);
            }
            OracleVerdict::Failing => {
                self.negative_count += 1;
                self.negatives.push(node.id);
                self.classified.insert(node);
            }
            OracleVerdict::Undefined => {
                self.undefined_count += 1;
                self.classified.insert(node);
            }
            OracleVerdict::Unfinished => {
                self.unfinished_count += 1;
                self.unfinished.insert(node);
            }
            other => {
                debug!(target: "session.data", verdict = other.label(), "unindexed_verdict");
            }
        }
    }

    /// A completed test whose input turned out to be a duplicate still
    /// counts toward the overall-test totals.
    pub fn record_duplicate(&mut self, id: FormId) {
        self.total_tests += 1;
        self.push_last_run(id);
    }

    fn push_last_run(&mut self, id: FormId) {
        self.last_run.push_back(id);
        while self.last_run.len() > LAST_RUN_RING {
            self.last_run.pop_front();
        }
    }

    pub fn last_run(&self) -> impl Iterator<Item = FormId> + '_ {
        self.last_run.iter().copied()
    }

    /// Sliding window of generation outcomes.
    pub fn record_generation_attempt(&mut self, success: bool) {
        self.generation_attempts += 1;
        if !success {
            self.generation_failures += 1;
        }
        self.generation_window.push_back(success);
        while self.generation_window.len() > GENERATION_WINDOW {
            self.generation_window.pop_front();
        }
    }

    pub fn window_failure_rate(&self) -> f64 {
        if self.generation_window.is_empty() {
            return 0.0;
        }
        let failures = self.generation_window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.generation_window.len() as f64
    }

    /// ConvergenceFailure predicate: the window is saturated and almost
    /// everything in it failed.
    pub fn generation_collapsed(&self) -> bool {
        self.generation_attempts > GENERATION_WINDOW as u64
            && self.window_failure_rate() >= FAILURE_RATE_LIMIT
    }

    /// Drops index nodes whose backing input is gone, duplicate or deleted.
    /// Applied to the classified and unfinished views alike.
    pub fn cleanup(&mut self, mut alive: impl FnMut(FormId) -> bool) -> usize {
        let before = self.classified.len() + self.unfinished.len();
        self.classified.retain(&mut alive);
        self.unfinished.retain(&mut alive);
        self.positives.retain(|id| alive(*id));
        self.negatives.retain(|id| alive(*id));
        before - (self.classified.len() + self.unfinished.len())
    }

    /// Root-fair candidate filter over the classified scores.
    ///
    /// Relaxes the relative threshold `frac` by `frac_step` until `target`
    /// candidates are selected or the threshold covers everything. Each
    /// root receives an equal integer share of the target; surplus
    /// candidates of a root are rejected in reverse score order.
    pub fn filter_sources(
        &self,
        params: &FilterParams,
        mut info: impl FnMut(FormId) -> Option<FilterInfo>,
    ) -> Vec<FormId> {
        if params.target == 0 {
            return Vec::new();
        }
        let max_score = if params.use_secondary {
            self.classified
                .by_secondary
                .first()
                .map(|n| n.0.secondary)
                .unwrap_or(0.0)
        } else {
            self.classified
                .by_primary
                .first()
                .map(|n| n.0.primary)
                .unwrap_or(0.0)
        };

        let eligible: Vec<(InputNode, FilterInfo)> = if params.use_secondary {
            self.classified
                .by_secondary
                .iter()
                .map(|n| n.0)
                .filter_map(|n| info(n.id).map(|i| (n, i)))
                .collect()
        } else {
            self.classified
                .by_primary
                .iter()
                .map(|n| n.0)
                .filter_map(|n| info(n.id).map(|i| (n, i)))
                .collect()
        };

        let mut frac = params.start_frac.clamp(0.0, 1.0).max(f64::EPSILON);
        loop {
            let threshold = max_score * (1.0 - frac);
            let mut picked: Vec<(InputNode, FormId)> = Vec::new();
            for (node, i) in &eligible {
                let score = if params.use_secondary {
                    node.secondary
                } else {
                    node.primary
                };
                if score < threshold {
                    break;
                }
                if node.length <= params.min_length {
                    continue;
                }
                if params.exclude_delta_debugged && i.delta_debugged {
                    continue;
                }
                picked.push((*node, i.root));
            }

            // Root-fair share: every producing root gets target/roots
            // slots; a root's surplus is dropped from its worst end.
            let mut roots: Vec<FormId> = picked.iter().map(|(_, r)| *r).collect();
            roots.sort_unstable();
            roots.dedup();
            let selected = if roots.len() > 1 {
                let share = (params.target / roots.len()).max(1);
                let mut out = Vec::new();
                for root in &roots {
                    let of_root: Vec<FormId> = picked
                        .iter()
                        .filter(|(_, r)| r == root)
                        .map(|(n, _)| n.id)
                        .collect();
                    out.extend(of_root.into_iter().take(share));
                }
                out
            } else {
                picked.iter().map(|(n, _)| n.id).collect()
            };

            if selected.len() >= params.target || frac >= 1.0 {
                let mut out = selected;
                out.truncate(params.target);
                return out;
            }
            frac = (frac + params.frac_step.max(f64::EPSILON)).min(1.0);
        }
    }
}

impl Form for SessionData {
    fn type_tag() -> i32 {
        TYPE_SESSION_DATA
    }

    fn version() -> i32 {
        2
    }

    fn singleton_id() -> Option<FormId> {
        Some(reserved::SESSION_DATA)
    }

    fn write_data(
        &self,
        out: &mut ByteWriter<Vec<u8>>,
        _strings: &mut StringTable,
    ) -> core_codec::Result<()> {
        out.write_u64(self.current_generation)?;
        out.write_u64(self.generations.len() as u64)?;
        for id in &self.generations {
            out.write_u64(*id)?;
        }
        out.write_u64(self.positives.len() as u64)?;
        for id in &self.positives {
            out.write_u64(*id)?;
        }
        out.write_u64(self.negatives.len() as u64)?;
        for id in &self.negatives {
            out.write_u64(*id)?;
        }
        out.write_u64(self.controllers.len() as u64)?;
        for id in &self.controllers {
            out.write_u64(*id)?;
        }
        out.write_u64(self.positive_count)?;
        out.write_u64(self.negative_count)?;
        out.write_u64(self.unfinished_count)?;
        out.write_u64(self.undefined_count)?;
        out.write_u64(self.total_tests)?;
        out.write_u64(self.last_run.len() as u64)?;
        for id in &self.last_run {
            out.write_u64(*id)?;
        }
        out.write_u64(self.generation_attempts)?;
        out.write_u64(self.generation_failures)
    }

    fn read_data(
        _version: i32,
        input: &mut ByteReader<&[u8]>,
        _strings: &StringTable,
    ) -> core_forms::Result<Self> {
        let current_generation = input.read_u64()?;
        let mut data = SessionData {
            current_generation,
            ..SessionData::default()
        };
        for _ in 0..input.read_u64()? {
            data.generations.push(input.read_u64()?);
        }
        for _ in 0..input.read_u64()? {
            data.positives.push(input.read_u64()?);
        }
        for _ in 0..input.read_u64()? {
            data.negatives.push(input.read_u64()?);
        }
        for _ in 0..input.read_u64()? {
            data.controllers.push(input.read_u64()?);
        }
        data.positive_count = input.read_u64()?;
        data.negative_count = input.read_u64()?;
        data.unfinished_count = input.read_u64()?;
        data.undefined_count = input.read_u64()?;
        data.total_tests = input.read_u64()?;
        for _ in 0..input.read_u64()? {
            data.last_run.push_back(input.read_u64()?);
        }
        data.generation_attempts = input.read_u64()?;
        data.generation_failures = input.read_u64()?;
        Ok(data)
    }

    fn initialize_late(&mut self, resolver: &LoadResolver) -> core_forms::Result<()> {
        // The ordering views are not persisted; rebuild them from the
        // loaded inputs. Ids are collected first so no form is resolved
        // while the registry iteration lock is held.
        let mut input_ids: Vec<FormId> = Vec::new();
        resolver.registry().visit(|form| {
            if form.type_tag() == core_inputs::input::TYPE_INPUT
                && !form.meta().has_flag(FormFlags::DUPLICATE)
            {
                input_ids.push(form.id());
            }
            core_forms::VisitDecision::Continue
        });
        input_ids.sort_unstable();

        let mut nodes: Vec<(InputNode, OracleVerdict)> = Vec::new();
        for id in input_ids {
            let Some(cell) = resolver.resolve_form::<Input>(id) else {
                continue;
            };
            let data = cell.read();
            let verdict = data.verdict();
            if matches!(
                verdict,
                OracleVerdict::Passing
                    | OracleVerdict::Failing
                    | OracleVerdict::Undefined
                    | OracleVerdict::Unfinished
            ) {
                nodes.push((
                    InputNode::new(
                        id,
                        data.primary_score(),
                        data.secondary_score(),
                        data.effective_len(),
                    ),
                    verdict,
                ));
            }
        }
        for (node, verdict) in nodes {
            match verdict {
                OracleVerdict::Unfinished => self.unfinished.insert(node),
                _ => self.classified.insert(node),
            }
        }
        debug!(
            target: "session.data",
            classified = self.classified.len(),
            unfinished = self.unfinished.len(),
            "indices_rebuilt"
        );
        Ok(())
    }
}
