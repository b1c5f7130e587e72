//! Leaf entities of the object graph: inputs, derivation trees, and the
//! exclusion tree that deduplicates executed prefixes.

pub mod derivation;
pub mod exclusion;
pub mod input;

pub use derivation::{DerivationNode, DerivationTree};
pub use exclusion::{AddOutcome, ExclusionTree, PrefixHit};
pub use input::{Input, ParentSplit, SplitRange};

/// Classification of one executed test.
///
/// The oracle itself only ever returns the first four; `Prefix` and
/// `Running` are assigned by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OracleVerdict {
    #[default]
    None,
    Passing,
    Failing,
    Unfinished,
    Undefined,
    Prefix,
    Running,
}

impl OracleVerdict {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => OracleVerdict::Passing,
            2 => OracleVerdict::Failing,
            3 => OracleVerdict::Unfinished,
            4 => OracleVerdict::Undefined,
            5 => OracleVerdict::Prefix,
            6 => OracleVerdict::Running,
            _ => OracleVerdict::None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OracleVerdict::None => 0,
            OracleVerdict::Passing => 1,
            OracleVerdict::Failing => 2,
            OracleVerdict::Unfinished => 3,
            OracleVerdict::Undefined => 4,
            OracleVerdict::Prefix => 5,
            OracleVerdict::Running => 6,
        }
    }

    /// Verdicts that freeze the input's scores and length for good.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            OracleVerdict::Passing | OracleVerdict::Failing | OracleVerdict::Undefined
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            OracleVerdict::None => "none",
            OracleVerdict::Passing => "passing",
            OracleVerdict::Failing => "failing",
            OracleVerdict::Unfinished => "unfinished",
            OracleVerdict::Undefined => "undefined",
            OracleVerdict::Prefix => "prefix",
            OracleVerdict::Running => "running",
        }
    }
}
