//! Session layer: settings, generations, scoring indices, the delta
//! debugging controller and the session control loop.
//!
//! Everything here composes the lower crates into the long-lived engine:
//! the registry holds the object graph, the scheduler and execution
//! handler do the work, and this crate decides what work there is.

pub mod ctx;
pub mod delta;
pub mod functions;
pub mod generation;
pub mod grammar;
pub mod session;
pub mod sessiondata;
pub mod sets;
pub mod settings;

pub use ctx::EngineCtx;
pub use delta::{DeltaController, DeltaGoal, DeltaMode, DeltaParams};
pub use generation::Generation;
pub use grammar::{Generator, Grammar};
pub use session::{EndReason, Session, SessionForm, SessionStats, register_factories};
pub use sessiondata::SessionData;
pub use settings::Settings;

use thiserror::Error;

/// Session-level error kinds. Test-local failures never surface here; they
/// live on the tests' exit-reason bitsets.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Form(#[from] core_forms::FormError),
    #[error(transparent)]
    Oracle(#[from] core_oracle::OracleError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("startup error: {0}")]
    Startup(String),
    #[error("generation failure rate exceeded the threshold")]
    ConvergenceFailure,
    #[error("memory limit exceeded past the confirmation timer")]
    OutOfMemory,
    #[error("delta-debugging budget consumed")]
    BudgetExceeded,
    #[error("cannot extract a derivation sub-tree")]
    InvalidDerivation,
}
