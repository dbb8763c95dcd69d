//! Error types for the VIRA IR.

/// Structural problems found in a module.
#[derive(Debug, thiserror::Error)]
pub enum IrError {
    /// A handle index is out of bounds for its arena.
    #[error("{function} at {path}: {kind} handle index {index} out of bounds (arena size: {size})")]
    BadHandle {
        function: String,
        path: String,
        kind: &'static str,
        index: usize,
        size: usize,
    },

    /// A vector type, ramp, broadcast or mask with zero lanes.
    #[error("{function} at {path}: zero-lane {what}")]
    ZeroLanes {
        function: String,
        path: String,
        what: &'static str,
    },

    /// A module map key that disagrees with the function's own name.
    #[error("function registered as `{key}` is named `{name}`")]
    NameMismatch { key: String, name: String },

    /// A buffer whose definition is inconsistent.
    #[error("{function}: buffer `{buffer}`: {message}")]
    BadBuffer {
        function: String,
        buffer: String,
        message: String,
    },

    /// An event table that does not cover the function's events.
    #[error("{function}: event table has {found} slots for {expected} events")]
    EventTableSize {
        function: String,
        expected: usize,
        found: usize,
    },
}

/// Errors raised by the reference interpreter.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("unbound variable `{0}`")]
    UnboundVar(String),

    #[error("unknown buffer `{0}`")]
    UnknownBuffer(String),

    #[error("dangling {kind} handle {index}")]
    DanglingHandle { kind: &'static str, index: usize },

    #[error("access to `{buffer}` at element {index} is out of bounds (size {size})")]
    OutOfBounds {
        buffer: String,
        index: i64,
        size: usize,
    },

    #[error("byte offset {offset} into `{buffer}` is not element aligned")]
    Misaligned { buffer: String, offset: i64 },

    #[error("`{buffer}` accessed with {found} indices but has rank {expected}")]
    RankMismatch {
        buffer: String,
        expected: usize,
        found: usize,
    },

    #[error("input for `{buffer}` has {found} elements, expected {expected}")]
    InputSize {
        buffer: String,
        expected: usize,
        found: usize,
    },

    #[error("integer division by zero")]
    DivisionByZero,

    #[error("expected a scalar {0}")]
    ExpectedScalar(&'static str),

    #[error("cannot evaluate: {0}")]
    Unsupported(String),
}
