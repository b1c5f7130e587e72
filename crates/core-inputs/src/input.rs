//! The `Input` form: one token sequence plus everything the engine learned
//! about it.
//!
//! Score and length fields freeze once the verdict becomes final
//! (`Passing`, `Failing` or `Undefined`); late writes are dropped with a
//! warning rather than corrupting the indices that already sorted on them.

use crate::OracleVerdict;
use core_codec::buffer::{ByteReader, ByteWriter};
use core_codec::record::StringTable;
use core_forms::{Form, FormId, Result};
use std::time::Duration;
use tracing::warn;

pub const TYPE_INPUT: i32 = i32::from_be_bytes(*b"INPT");

/// One kept/removed range of a parent sequence, `(begin, length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitRange {
    pub begin: usize,
    pub length: usize,
}

/// How this input was cut out of its parent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParentSplit {
    pub ranges: Vec<SplitRange>,
    /// When set, `ranges` name the removed part and the input is the rest.
    pub complement: bool,
}

impl ParentSplit {
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total length of the ranges themselves.
    pub fn range_len(&self) -> usize {
        self.ranges.iter().map(|r| r.length).sum()
    }
}

/// Persistent record of one generated or derived test input.
#[derive(Debug, Default, Clone)]
pub struct Input {
    pub sequence: Vec<String>,
    pub parent_id: FormId,
    pub generation_id: FormId,
    pub derive_tree_id: FormId,
    verdict: OracleVerdict,
    primary_score: f64,
    secondary_score: f64,
    primary_individual: Vec<f64>,
    secondary_individual: Vec<f64>,
    /// Length the generator aimed for.
    pub target_length: i64,
    /// Length after fragment-mode trimming; -1 while untrimmed.
    pub trimmed_length: i64,
    pub execution_time: Option<Duration>,
    pub exit_code: i32,
    pub exit_reasons: u64,
    /// Captured PUT output, kept only when the store policy allows.
    pub output: Option<String>,
    /// Reaction time per delivered fragment, whole-run single entry
    /// otherwise.
    pub reaction_times: Vec<Duration>,
    pub derived_inputs: u64,
    pub derived_fails: u64,
    pub parent_split: ParentSplit,
    pub retries: u32,
}

impl Input {
    pub fn new(sequence: Vec<String>) -> Self {
        Self {
            sequence,
            trimmed_length: -1,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Effective length: the trimmed length once fragment mode cut the
    /// sequence short, the full length otherwise.
    pub fn effective_len(&self) -> usize {
        if self.trimmed_length >= 0 {
            self.trimmed_length as usize
        } else {
            self.sequence.len()
        }
    }

    pub fn verdict(&self) -> OracleVerdict {
        self.verdict
    }

    pub fn primary_score(&self) -> f64 {
        self.primary_score
    }

    pub fn secondary_score(&self) -> f64 {
        self.secondary_score
    }

    pub fn primary_individual(&self) -> &[f64] {
        &self.primary_individual
    }

    pub fn secondary_individual(&self) -> &[f64] {
        &self.secondary_individual
    }

    /// Records the oracle's classification. Once a final verdict is in
    /// place it cannot be replaced.
    pub fn set_verdict(&mut self, verdict: OracleVerdict) {
        if self.verdict.is_final() && verdict != self.verdict {
            warn!(
                target: "inputs",
                current = self.verdict.label(),
                attempted = verdict.label(),
                "verdict_change_rejected"
            );
            return;
        }
        self.verdict = verdict;
    }

    /// Stores the score pair and per-position vectors. Rejected after the
    /// verdict became final.
    pub fn set_scores(
        &mut self,
        primary: f64,
        secondary: f64,
        primary_individual: Vec<f64>,
        secondary_individual: Vec<f64>,
    ) {
        if self.verdict.is_final() {
            warn!(target: "inputs", "score_change_rejected_final_verdict");
            return;
        }
        self.primary_score = primary.max(0.0);
        self.secondary_score = secondary.max(0.0);
        self.primary_individual = primary_individual;
        self.secondary_individual = secondary_individual;
    }

    /// Cuts the sequence down to what was actually delivered to the PUT.
    pub fn trim_to(&mut self, delivered: usize) {
        if delivered < self.sequence.len() {
            self.trimmed_length = delivered as i64;
        }
    }

    /// Contiguous runs of equal per-position primary score, as
    /// `(begin, length)` ranges. Basis of score-progress partitioning.
    pub fn primary_score_ranges(&self) -> Vec<SplitRange> {
        let scores = &self.primary_individual;
        if scores.is_empty() {
            return Vec::new();
        }
        let mut ranges = Vec::new();
        let mut begin = 0usize;
        for i in 1..scores.len() {
            if scores[i] != scores[begin] {
                ranges.push(SplitRange {
                    begin,
                    length: i - begin,
                });
                begin = i;
            }
        }
        ranges.push(SplitRange {
            begin,
            length: scores.len() - begin,
        });
        ranges
    }

    /// Materializes a child sequence from a parent-split descriptor.
    pub fn apply_split(sequence: &[String], split: &ParentSplit) -> Vec<String> {
        let mut keep = vec![split.complement; sequence.len()];
        for range in &split.ranges {
            for idx in range.begin..(range.begin + range.length).min(sequence.len()) {
                keep[idx] = !split.complement;
            }
        }
        sequence
            .iter()
            .zip(keep)
            .filter_map(|(tok, k)| k.then(|| tok.clone()))
            .collect()
    }
}

impl Form for Input {
    fn type_tag() -> i32 {
        TYPE_INPUT
    }

    fn version() -> i32 {
        2
    }

    fn write_data(
        &self,
        out: &mut ByteWriter<Vec<u8>>,
        strings: &mut StringTable,
    ) -> core_codec::Result<()> {
        strings.write_sequence(out, &self.sequence)?;
        out.write_u64(self.parent_id)?;
        out.write_u64(self.generation_id)?;
        out.write_u64(self.derive_tree_id)?;
        out.write_u8(self.verdict.as_u8())?;
        out.write_f64(self.primary_score)?;
        out.write_f64(self.secondary_score)?;
        out.write_u64(self.primary_individual.len() as u64)?;
        for v in &self.primary_individual {
            out.write_f64(*v)?;
        }
        out.write_u64(self.secondary_individual.len() as u64)?;
        for v in &self.secondary_individual {
            out.write_f64(*v)?;
        }
        out.write_i64(self.target_length)?;
        out.write_i64(self.trimmed_length)?;
        out.write_duration(self.execution_time)?;
        out.write_i32(self.exit_code)?;
        out.write_u64(self.exit_reasons)?;
        match &self.output {
            Some(text) => {
                out.write_bool(true)?;
                out.write_string(text)?;
            }
            None => out.write_bool(false)?,
        }
        out.write_u64(self.reaction_times.len() as u64)?;
        for t in &self.reaction_times {
            out.write_duration(Some(*t))?;
        }
        out.write_u64(self.derived_inputs)?;
        out.write_u64(self.derived_fails)?;
        out.write_u64(self.parent_split.ranges.len() as u64)?;
        for range in &self.parent_split.ranges {
            out.write_u64(range.begin as u64)?;
            out.write_u64(range.length as u64)?;
        }
        out.write_bool(self.parent_split.complement)?;
        out.write_u32(self.retries)?;
        Ok(())
    }

    fn read_data(
        _version: i32,
        input: &mut ByteReader<&[u8]>,
        strings: &StringTable,
    ) -> Result<Self> {
        let sequence = strings.read_sequence(input)?;
        let parent_id = input.read_u64()?;
        let generation_id = input.read_u64()?;
        let derive_tree_id = input.read_u64()?;
        let verdict = OracleVerdict::from_u8(input.read_u8()?);
        let primary_score = input.read_f64()?;
        let secondary_score = input.read_f64()?;
        let mut primary_individual = Vec::new();
        for _ in 0..input.read_u64()? {
            primary_individual.push(input.read_f64()?);
        }
        let mut secondary_individual = Vec::new();
        for _ in 0..input.read_u64()? {
            secondary_individual.push(input.read_f64()?);
        }
        let target_length = input.read_i64()?;
        let trimmed_length = input.read_i64()?;
        let execution_time = input.read_duration()?;
        let exit_code = input.read_i32()?;
        let exit_reasons = input.read_u64()?;
        let output = if input.read_bool()? {
            Some(input.read_string()?)
        } else {
            None
        };
        let mut reaction_times = Vec::new();
        for _ in 0..input.read_u64()? {
            reaction_times.push(input.read_duration()?.unwrap_or_default());
        }
        let derived_inputs = input.read_u64()?;
        let derived_fails = input.read_u64()?;
        let mut ranges = Vec::new();
        for _ in 0..input.read_u64()? {
            ranges.push(SplitRange {
                begin: input.read_u64()? as usize,
                length: input.read_u64()? as usize,
            });
        }
        let complement = input.read_bool()?;
        let retries = input.read_u32()?;

        Ok(Self {
            sequence,
            parent_id,
            generation_id,
            derive_tree_id,
            verdict,
            primary_score,
            secondary_score,
            primary_individual,
            secondary_individual,
            target_length,
            trimmed_length,
            execution_time,
            exit_code,
            exit_reasons,
            output,
            reaction_times,
            derived_inputs,
            derived_fails,
            parent_split: ParentSplit { ranges, complement },
            retries,
        })
    }
}
