//! Exclusion tree: a trie over executed token sequences.
//!
//! Every classified execution enters its sequence here; later inputs that
//! extend a decided prefix are answered from the tree instead of being run.
//! Terminals record the verdict and the earliest input that established it.
//! Once a terminal is Passing or Failing it is never overwritten; only
//! Unfinished terminals may be superseded by a classified verdict.

use crate::OracleVerdict;
use ahash::AHashMap;
use core_codec::buffer::{ByteReader, ByteWriter};
use core_codec::record::StringTable;
use core_forms::{Form, FormId, Result, reserved};
use tracing::{debug, warn};

pub const TYPE_EXCLUSION_TREE: i32 = i32::from_be_bytes(*b"EXCL");

#[derive(Debug, Default, Clone)]
struct Node {
    children: AHashMap<String, usize>,
    terminal: Option<(OracleVerdict, FormId)>,
}

/// Result of a prefix probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrefixHit {
    /// A terminal was reached at or before the sequence's end.
    pub found: bool,
    pub input_id: FormId,
    pub verdict: OracleVerdict,
}

/// Result of [`ExclusionTree::add_input`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// New terminal created.
    Added,
    /// A Passing/Failing terminal strictly before the end already decides
    /// this sequence; nothing was inserted.
    Subsumed { input_id: FormId },
    /// The exact sequence already has a terminal; the new input is a
    /// duplicate of it.
    Duplicate { input_id: FormId },
    /// An Unfinished terminal was upgraded to the new classified verdict.
    Superseded,
}

#[derive(Debug, Clone)]
pub struct ExclusionTree {
    nodes: Vec<Node>,
    leaves: usize,
    depth: usize,
    additions: u64,
}

impl Default for ExclusionTree {
    fn default() -> Self {
        Self {
            nodes: vec![Node::default()],
            leaves: 0,
            depth: 0,
            additions: 0,
        }
    }
}

impl ExclusionTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.leaves
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn additions(&self) -> u64 {
        self.additions
    }

    fn decided_terminal(&self, node: usize) -> Option<(OracleVerdict, FormId)> {
        match self.nodes[node].terminal {
            Some((OracleVerdict::Unfinished, _)) => None,
            other => other,
        }
    }

    /// Walks the sequence until a decided terminal or the sequence end.
    /// Unfinished terminals do not stop the walk: their sequences may be
    /// re-executed and superseded.
    pub fn has_prefix(&self, sequence: &[String]) -> PrefixHit {
        let mut node = 0usize;
        if let Some((verdict, id)) = self.decided_terminal(node) {
            return PrefixHit {
                found: true,
                input_id: id,
                verdict,
            };
        }
        for token in sequence {
            match self.nodes[node].children.get(token) {
                Some(next) => node = *next,
                None => return PrefixHit::default(),
            }
            if let Some((verdict, id)) = self.decided_terminal(node) {
                return PrefixHit {
                    found: true,
                    input_id: id,
                    verdict,
                };
            }
        }
        PrefixHit::default()
    }

    /// Prefix probe plus, when the walk ends mid-tree, the shortest
    /// completed descendant. Approximate execution uses the extension's
    /// result in place of running the candidate.
    pub fn has_prefix_and_shortest_extension(
        &self,
        sequence: &[String],
    ) -> (PrefixHit, Option<(FormId, OracleVerdict)>) {
        let mut node = 0usize;
        if let Some((verdict, id)) = self.decided_terminal(node) {
            return (
                PrefixHit {
                    found: true,
                    input_id: id,
                    verdict,
                },
                None,
            );
        }
        for token in sequence {
            match self.nodes[node].children.get(token) {
                Some(next) => node = *next,
                None => return (PrefixHit::default(), None),
            }
            if let Some((verdict, id)) = self.decided_terminal(node) {
                return (
                    PrefixHit {
                        found: true,
                        input_id: id,
                        verdict,
                    },
                    None,
                );
            }
        }
        // Sequence exhausted mid-tree: breadth-first search for the
        // shortest decided terminal below.
        let mut frontier = vec![node];
        while !frontier.is_empty() {
            let mut next_frontier = Vec::new();
            for idx in frontier {
                if let Some((verdict, id)) = self.decided_terminal(idx) {
                    return (PrefixHit::default(), Some((id, verdict)));
                }
                next_frontier.extend(self.nodes[idx].children.values().copied());
            }
            frontier = next_frontier;
        }
        (PrefixHit::default(), None)
    }

    /// Records a classified execution. Only Passing, Failing and Unfinished
    /// verdicts enter the tree.
    pub fn add_input(
        &mut self,
        sequence: &[String],
        verdict: OracleVerdict,
        input_id: FormId,
    ) -> AddOutcome {
        if !matches!(
            verdict,
            OracleVerdict::Passing | OracleVerdict::Failing | OracleVerdict::Unfinished
        ) {
            warn!(
                target: "inputs.exclusion",
                verdict = verdict.label(),
                input_id,
                "add_rejected_verdict"
            );
            return AddOutcome::Duplicate { input_id };
        }
        self.additions += 1;

        let mut node = 0usize;
        for (pos, token) in sequence.iter().enumerate() {
            // A decided terminal above this sequence subsumes it.
            if let Some((existing, id)) = self.nodes[node].terminal {
                if existing != OracleVerdict::Unfinished {
                    debug!(target: "inputs.exclusion", input_id, prefix = id, "subsumed");
                    return AddOutcome::Subsumed { input_id: id };
                }
            }
            node = match self.nodes[node].children.get(token) {
                Some(next) => *next,
                None => {
                    let idx = self.nodes.len();
                    self.nodes.push(Node::default());
                    // A childless terminal stops being a leaf when it gains
                    // its first child (an Unfinished terminal extended by a
                    // longer sequence).
                    if self.nodes[node].terminal.is_some() && self.nodes[node].children.is_empty()
                    {
                        self.leaves -= 1;
                    }
                    self.nodes[node].children.insert(token.clone(), idx);
                    self.depth = self.depth.max(pos + 1);
                    idx
                }
            };
        }

        match self.nodes[node].terminal {
            None => {
                self.nodes[node].terminal = Some((verdict, input_id));
                if self.nodes[node].children.is_empty() {
                    self.leaves += 1;
                }
                AddOutcome::Added
            }
            Some((OracleVerdict::Unfinished, _)) if verdict != OracleVerdict::Unfinished => {
                self.nodes[node].terminal = Some((verdict, input_id));
                AddOutcome::Superseded
            }
            Some((_, id)) => AddOutcome::Duplicate { input_id: id },
        }
    }
}

impl Form for ExclusionTree {
    fn type_tag() -> i32 {
        TYPE_EXCLUSION_TREE
    }

    fn version() -> i32 {
        2
    }

    fn singleton_id() -> Option<FormId> {
        Some(reserved::EXCLUSION_TREE)
    }

    fn write_data(
        &self,
        out: &mut ByteWriter<Vec<u8>>,
        strings: &mut StringTable,
    ) -> core_codec::Result<()> {
        out.write_u64(self.nodes.len() as u64)?;
        out.write_u64(self.leaves as u64)?;
        out.write_u64(self.depth as u64)?;
        out.write_u64(self.additions)?;
        for node in &self.nodes {
            match node.terminal {
                Some((verdict, id)) => {
                    out.write_bool(true)?;
                    out.write_u8(verdict.as_u8())?;
                    out.write_u64(id)?;
                }
                None => out.write_bool(false)?,
            }
            // Children sorted by token so the record is deterministic.
            let mut children: Vec<(&String, &usize)> = node.children.iter().collect();
            children.sort_by(|a, b| a.0.cmp(b.0));
            out.write_u64(children.len() as u64)?;
            for (token, child) in children {
                strings.write_token(out, token)?;
                out.write_u64(*child as u64)?;
            }
        }
        Ok(())
    }

    fn read_data(
        _version: i32,
        input: &mut ByteReader<&[u8]>,
        strings: &StringTable,
    ) -> Result<Self> {
        let node_count = input.read_u64()? as usize;
        let leaves = input.read_u64()? as usize;
        let depth = input.read_u64()? as usize;
        let additions = input.read_u64()?;
        let mut nodes = Vec::with_capacity(node_count.min(1 << 22));
        for _ in 0..node_count {
            let terminal = if input.read_bool()? {
                let verdict = OracleVerdict::from_u8(input.read_u8()?);
                let id = input.read_u64()?;
                Some((verdict, id))
            } else {
                None
            };
            let child_count = input.read_u64()? as usize;
            let mut children = AHashMap::with_capacity(child_count.min(1 << 16));
            for _ in 0..child_count {
                let token = strings.read_token(input)?;
                let child = input.read_u64()? as usize;
                children.insert(token, child);
            }
            nodes.push(Node { children, terminal });
        }
        if nodes.is_empty() {
            nodes.push(Node::default());
        }
        Ok(Self {
            nodes,
            leaves,
            depth,
            additions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn failing_prefix_subsumes_extensions() {
        let mut tree = ExclusionTree::new();
        assert_eq!(
            tree.add_input(&seq(&["a", "X"]), OracleVerdict::Failing, 10),
            AddOutcome::Added
        );

        // Extension of a failing sequence is already decided.
        let hit = tree.has_prefix(&seq(&["a", "X", "b", "c"]));
        assert!(hit.found);
        assert_eq!(hit.input_id, 10);
        assert_eq!(hit.verdict, OracleVerdict::Failing);

        assert_eq!(
            tree.add_input(&seq(&["a", "X", "b"]), OracleVerdict::Failing, 11),
            AddOutcome::Subsumed { input_id: 10 }
        );
    }

    #[test]
    fn exact_duplicate_is_flagged() {
        let mut tree = ExclusionTree::new();
        tree.add_input(&seq(&["a"]), OracleVerdict::Passing, 1);
        assert_eq!(
            tree.add_input(&seq(&["a"]), OracleVerdict::Passing, 2),
            AddOutcome::Duplicate { input_id: 1 }
        );
        // Disagreeing verdict on the same sequence is also a duplicate of
        // the earliest input.
        assert_eq!(
            tree.add_input(&seq(&["a"]), OracleVerdict::Failing, 3),
            AddOutcome::Duplicate { input_id: 1 }
        );
    }

    #[test]
    fn unfinished_terminal_is_superseded() {
        let mut tree = ExclusionTree::new();
        tree.add_input(&seq(&["a", "b"]), OracleVerdict::Unfinished, 5);
        assert_eq!(
            tree.add_input(&seq(&["a", "b"]), OracleVerdict::Failing, 6),
            AddOutcome::Superseded
        );
        let hit = tree.has_prefix(&seq(&["a", "b"]));
        assert_eq!(hit.verdict, OracleVerdict::Failing);
        assert_eq!(hit.input_id, 6);
    }

    #[test]
    fn unfinished_prefix_does_not_subsume() {
        let mut tree = ExclusionTree::new();
        tree.add_input(&seq(&["a"]), OracleVerdict::Unfinished, 1);
        assert_eq!(
            tree.add_input(&seq(&["a", "b"]), OracleVerdict::Passing, 2),
            AddOutcome::Added
        );
        // An unfinished terminal does not stop a probe either; the
        // sequence may run again and be superseded.
        assert!(!tree.has_prefix(&seq(&["a"])).found);
        assert!(!tree.has_prefix(&seq(&["a", "c"])).found);
    }

    #[test]
    fn shortest_extension_found() {
        let mut tree = ExclusionTree::new();
        tree.add_input(&seq(&["a", "b", "c", "d"]), OracleVerdict::Passing, 1);
        tree.add_input(&seq(&["a", "b", "e"]), OracleVerdict::Failing, 2);

        let (hit, extension) = tree.has_prefix_and_shortest_extension(&seq(&["a", "b"]));
        assert!(!hit.found);
        let (id, verdict) = extension.unwrap();
        assert_eq!(id, 2, "shortest completed descendant wins");
        assert_eq!(verdict, OracleVerdict::Failing);
    }

    #[test]
    fn no_extension_outside_tree() {
        let mut tree = ExclusionTree::new();
        tree.add_input(&seq(&["a"]), OracleVerdict::Passing, 1);
        let (hit, extension) = tree.has_prefix_and_shortest_extension(&seq(&["z"]));
        assert!(!hit.found);
        assert!(extension.is_none());
    }

    #[test]
    fn stats_track_shape() {
        let mut tree = ExclusionTree::new();
        tree.add_input(&seq(&["a", "b", "c"]), OracleVerdict::Passing, 1);
        tree.add_input(&seq(&["a", "d"]), OracleVerdict::Failing, 2);
        assert_eq!(tree.depth(), 3);
        assert_eq!(tree.leaf_count(), 2);
        assert_eq!(tree.node_count(), 1 + 4); // root + a,b,c + d
    }

    #[test]
    fn extending_past_a_terminal_keeps_leaf_count_exact() {
        let mut tree = ExclusionTree::new();
        tree.add_input(&seq(&["a"]), OracleVerdict::Unfinished, 1);
        assert_eq!(tree.leaf_count(), 1);

        // Unfinished terminals don't subsume, so the walk legally passes
        // through "a"; the node loses leaf status when "b" appears.
        tree.add_input(&seq(&["a", "b"]), OracleVerdict::Passing, 2);
        assert_eq!(tree.leaf_count(), 1);

        tree.add_input(&seq(&["a", "c"]), OracleVerdict::Failing, 3);
        assert_eq!(tree.leaf_count(), 2);

        // The interior terminal on "a" is still there and supersedable.
        assert_eq!(
            tree.add_input(&seq(&["a"]), OracleVerdict::Failing, 4),
            AddOutcome::Superseded
        );
        assert_eq!(tree.leaf_count(), 2);
    }

    #[test]
    fn record_round_trip() {
        let mut tree = ExclusionTree::new();
        tree.add_input(&seq(&["x", "y"]), OracleVerdict::Failing, 3);
        tree.add_input(&seq(&["x", "z"]), OracleVerdict::Passing, 4);
        tree.add_input(&seq(&["w"]), OracleVerdict::Unfinished, 5);

        let mut strings = StringTable::new();
        let mut out = ByteWriter::new(Vec::new());
        tree.write_data(&mut out, &mut strings).unwrap();
        let bytes = out.into_inner();

        let mut reader = ByteReader::new(bytes.as_slice());
        let decoded = ExclusionTree::read_data(2, &mut reader, &strings).unwrap();
        assert_eq!(decoded.node_count(), tree.node_count());
        assert_eq!(decoded.leaf_count(), tree.leaf_count());
        assert_eq!(decoded.depth(), tree.depth());

        let hit = decoded.has_prefix(&seq(&["x", "y", "tail"]));
        assert!(hit.found);
        assert_eq!(hit.input_id, 3);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn verdict_strategy() -> impl Strategy<Value = OracleVerdict> {
            prop_oneof![
                Just(OracleVerdict::Passing),
                Just(OracleVerdict::Failing),
                Just(OracleVerdict::Unfinished),
            ]
        }

        fn sequence_strategy() -> impl Strategy<Value = Vec<String>> {
            prop::collection::vec(prop_oneof![Just("a"), Just("b"), Just("c")], 1..8)
                .prop_map(|tokens| tokens.into_iter().map(str::to_owned).collect())
        }

        proptest! {
            /// The incremental leaf counter always matches a brute-force
            /// recount over the arena, whatever order terminals and their
            /// extensions arrive in.
            #[test]
            fn leaf_count_matches_recount(
                entries in prop::collection::vec(
                    (sequence_strategy(), verdict_strategy()),
                    1..64,
                )
            ) {
                let mut tree = ExclusionTree::new();
                for (i, (sequence, verdict)) in entries.iter().enumerate() {
                    tree.add_input(sequence, *verdict, i as u64 + 1);
                }
                let recount = tree
                    .nodes
                    .iter()
                    .filter(|n| n.terminal.is_some() && n.children.is_empty())
                    .count();
                prop_assert_eq!(tree.leaf_count(), recount);
                prop_assert!(tree.depth() <= 8);
            }

            /// Once a sequence has a decided terminal anywhere along it,
            /// every extension probes as found with a decided verdict.
            #[test]
            fn decided_terminal_subsumes_every_extension(
                noise in prop::collection::vec(
                    (sequence_strategy(), verdict_strategy()),
                    0..32,
                ),
                base in sequence_strategy(),
                extension in sequence_strategy(),
            ) {
                let mut tree = ExclusionTree::new();
                for (i, (sequence, verdict)) in noise.iter().enumerate() {
                    tree.add_input(sequence, *verdict, i as u64 + 100);
                }
                tree.add_input(&base, OracleVerdict::Failing, 7);

                let mut extended = base.clone();
                extended.extend(extension.iter().cloned());
                let hit = tree.has_prefix(&extended);
                prop_assert!(hit.found);
                prop_assert!(matches!(
                    hit.verdict,
                    OracleVerdict::Passing | OracleVerdict::Failing
                ));
                prop_assert!(hit.input_id != 0);
            }
        }
    }
}
