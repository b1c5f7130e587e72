//! Derivation trees: the grammar witness attached to every input.
//!
//! A tree proves its input's token sequence is in the grammar's language.
//! When a child input keeps or removes ranges of its parent, the child's
//! tree is extracted from the parent's by pruning leaves; extraction fails
//! when nothing derivable remains.

use crate::input::{ParentSplit, SplitRange};
use core_codec::buffer::{ByteReader, ByteWriter};
use core_codec::record::StringTable;
use core_forms::{Form, FormId, Result};

pub const TYPE_DERIVATION_TREE: i32 = i32::from_be_bytes(*b"DEVT");

/// One production node. Leaves carry the terminal token; inner nodes carry
/// the non-terminal symbol they expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationNode {
    pub symbol: String,
    pub children: Vec<DerivationNode>,
}

impl DerivationNode {
    pub fn leaf(token: impl Into<String>) -> Self {
        Self {
            symbol: token.into(),
            children: Vec::new(),
        }
    }

    pub fn inner(symbol: impl Into<String>, children: Vec<DerivationNode>) -> Self {
        Self {
            symbol: symbol.into(),
            children,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a str>) {
        if self.is_leaf() {
            out.push(self.symbol.as_str());
            return;
        }
        for child in &self.children {
            child.collect_leaves(out);
        }
    }

    /// Keeps only the leaves whose positions are selected, dropping inner
    /// nodes that end up childless. `position` advances across the whole
    /// traversal.
    fn prune(&self, keep: &[bool], position: &mut usize) -> Option<DerivationNode> {
        if self.is_leaf() {
            let idx = *position;
            *position += 1;
            if keep.get(idx).copied().unwrap_or(false) {
                return Some(self.clone());
            }
            return None;
        }
        let children: Vec<DerivationNode> = self
            .children
            .iter()
            .filter_map(|c| c.prune(keep, position))
            .collect();
        if children.is_empty() {
            return None;
        }
        Some(DerivationNode {
            symbol: self.symbol.clone(),
            children,
        })
    }

    fn write(&self, out: &mut ByteWriter<Vec<u8>>, strings: &mut StringTable)
        -> core_codec::Result<()> {
        strings.write_token(out, &self.symbol)?;
        out.write_u64(self.children.len() as u64)?;
        for child in &self.children {
            child.write(out, strings)?;
        }
        Ok(())
    }

    fn read(input: &mut ByteReader<&[u8]>, strings: &StringTable) -> Result<Self> {
        let symbol = strings.read_token(input)?;
        let count = input.read_u64()? as usize;
        let mut children = Vec::with_capacity(count.min(1 << 16));
        for _ in 0..count {
            children.push(Self::read(input, strings)?);
        }
        Ok(Self { symbol, children })
    }
}

/// The persistent form wrapping one derivation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivationTree {
    pub grammar_id: FormId,
    pub root: Option<DerivationNode>,
}

impl DerivationTree {
    pub fn new(grammar_id: FormId, root: DerivationNode) -> Self {
        Self {
            grammar_id,
            root: Some(root),
        }
    }

    /// The terminal sequence this tree derives.
    pub fn leaves(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            root.collect_leaves(&mut out);
        }
        out.into_iter().map(str::to_owned).collect()
    }

    pub fn leaf_count(&self) -> usize {
        match &self.root {
            Some(root) => {
                let mut out = Vec::new();
                root.collect_leaves(&mut out);
                out.len()
            }
            None => 0,
        }
    }

    /// Extracts the sub-tree for a child that keeps (`complement == false`)
    /// or removes (`complement == true`) the given parent ranges. `None`
    /// when the remaining sequence is empty or a range falls outside the
    /// tree, both of which make the child non-derivable.
    pub fn extract(&self, split: &ParentSplit) -> Option<DerivationTree> {
        let root = self.root.as_ref()?;
        let total = self.leaf_count();
        for range in &split.ranges {
            if range.begin + range.length > total {
                return None;
            }
        }
        let mut keep = vec![split.complement; total];
        for range in &split.ranges {
            for flag in keep.iter_mut().skip(range.begin).take(range.length) {
                *flag = !split.complement;
            }
        }
        if !keep.iter().any(|k| *k) {
            return None;
        }
        let mut position = 0usize;
        let pruned = root.prune(&keep, &mut position)?;
        Some(DerivationTree {
            grammar_id: self.grammar_id,
            root: Some(pruned),
        })
    }

    /// Extraction by a single `(begin, length)` window.
    pub fn extract_range(&self, begin: usize, length: usize, complement: bool)
        -> Option<DerivationTree> {
        self.extract(&ParentSplit {
            ranges: vec![SplitRange { begin, length }],
            complement,
        })
    }
}

impl Form for DerivationTree {
    fn type_tag() -> i32 {
        TYPE_DERIVATION_TREE
    }

    fn version() -> i32 {
        2
    }

    fn write_data(
        &self,
        out: &mut ByteWriter<Vec<u8>>,
        strings: &mut StringTable,
    ) -> core_codec::Result<()> {
        out.write_u64(self.grammar_id)?;
        match &self.root {
            Some(root) => {
                out.write_bool(true)?;
                root.write(out, strings)
            }
            None => out.write_bool(false),
        }
    }

    fn read_data(
        _version: i32,
        input: &mut ByteReader<&[u8]>,
        strings: &StringTable,
    ) -> Result<Self> {
        let grammar_id = input.read_u64()?;
        let root = if input.read_bool()? {
            Some(DerivationNode::read(input, strings)?)
        } else {
            None
        };
        Ok(Self { grammar_id, root })
    }
}
