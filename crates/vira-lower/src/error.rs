//! Error types for the lowering pipeline.

use std::fmt;

use vira_ir::{IrError, PropertySet};

/// Where in a module a lowering error was found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Location {
    pub function: String,
    /// Statement path from the function body, e.g. `body/0/2`.
    pub path: String,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.function, self.path)
    }
}

/// Errors produced by the pass manager and the passes.
#[derive(Debug, thiserror::Error)]
pub enum LoweringError {
    /// A pass was scheduled before the passes establishing what it needs.
    #[error("{pass}: required properties not established: {missing}")]
    PreconditionViolation { pass: String, missing: PropertySet },

    /// The input uses something the pass cannot lower.
    #[error("{pass}: unsupported construct in {location}: {message}")]
    UnsupportedConstruct {
        pass: String,
        location: Location,
        message: String,
    },

    /// A pass broke a property it claims to establish, or met IR that an
    /// earlier pass should have ruled out.
    #[error("{pass}: internal invariant failure in {location}: {message}")]
    InternalInvariantFailure {
        pass: String,
        location: Location,
        message: String,
    },

    /// The input module is structurally invalid.
    #[error("malformed module: {0}")]
    MalformedModule(#[from] IrError),

    /// A pass name that no pass answers to.
    #[error("unknown pass `{0}`")]
    UnknownPass(String),
}

impl LoweringError {
    /// Name of the pass that failed, if a pass did.
    pub fn pass(&self) -> Option<&str> {
        match self {
            Self::PreconditionViolation { pass, .. }
            | Self::UnsupportedConstruct { pass, .. }
            | Self::InternalInvariantFailure { pass, .. } => Some(pass),
            Self::MalformedModule(_) | Self::UnknownPass(_) => None,
        }
    }

    /// Function and statement the error points at, if any.
    pub fn location(&self) -> Option<&Location> {
        match self {
            Self::UnsupportedConstruct { location, .. }
            | Self::InternalInvariantFailure { location, .. } => Some(location),
            _ => None,
        }
    }
}
