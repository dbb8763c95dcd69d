//! Statements: operations with side effects and control flow.

use serde::{Deserialize, Serialize};

use crate::arena::Handle;
use crate::buffer::{Buffer, Event};
use crate::expr::{Expr, Var};

/// How the iterations of a loop are meant to execute.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum ForKind {
    /// One iteration after another.
    #[default]
    Serial,
    /// The body is written per element; loop partitioning turns it into
    /// vector code.
    Vectorized,
}

/// Which half of a partitioned loop this is.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum PartitionRole {
    /// Full-width iterations; carries the likely hint.
    Main,
    /// Boundary iterations under a lane mask.
    Tail,
}

/// A counted loop: `for var in min..min + extent`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Loop {
    pub var: Var,
    pub min: Expr,
    pub extent: Expr,
    #[serde(default)]
    pub kind: ForKind,
    /// Advisory: every iteration is expected to run at full vector width.
    #[serde(default)]
    pub likely: bool,
    #[serde(default)]
    pub partition: Option<PartitionRole>,
    pub body: Box<Stmt>,
}

impl Loop {
    pub fn serial(var: Var, min: Expr, extent: Expr, body: Stmt) -> Self {
        Self {
            var,
            min,
            extent,
            kind: ForKind::Serial,
            likely: false,
            partition: None,
            body: Box::new(body),
        }
    }

    /// Trip count when it is a literal.
    pub fn const_extent(&self) -> Option<i64> {
        self.extent.as_int()
    }
}

/// One side of a DMA transfer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DmaEndpoint {
    pub buffer: Handle<Buffer>,
    /// Byte offset of the first element.
    pub offset: Expr,
}

/// One dimension of a DMA transfer, outermost first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DmaDim {
    /// Number of elements moved along this dimension.
    pub length: Expr,
    pub src_stride: Expr,
    pub dst_stride: Expr,
}

/// An asynchronous block transfer between address spaces.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DmaTransfer {
    pub src: DmaEndpoint,
    pub dst: DmaEndpoint,
    pub dims: Vec<DmaDim>,
    pub elem_bytes: u32,
    /// Signaled by hardware when the transfer completes.
    pub event: Handle<Event>,
}

impl DmaTransfer {
    /// Total bytes moved, when every length is static.
    pub fn total_bytes(&self) -> Option<u64> {
        self.dims.iter().try_fold(u64::from(self.elem_bytes), |acc, dim| {
            let len = u64::try_from(dim.length.as_int()?).ok()?;
            acc.checked_mul(len)
        })
    }
}

/// A statement in the IR.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Seq(Vec<Stmt>),
    For(Loop),
    If {
        condition: Expr,
        then_case: Box<Stmt>,
        else_case: Option<Box<Stmt>>,
    },
    /// Bind `var` to `value` for the scope of `body`.
    Let {
        var: Var,
        value: Expr,
        body: Box<Stmt>,
    },
    /// Write to a buffer. A vector index in the last position writes lanes.
    Store {
        buffer: Handle<Buffer>,
        indices: Vec<Expr>,
        value: Expr,
        predicate: Option<Expr>,
    },
    Dma(DmaTransfer),
    /// Block until the event has been signaled.
    Wait(Handle<Event>),
    /// Signal an event from software.
    Signal(Handle<Event>),
    /// Evaluate an expression for its side effects (intrinsics, `vstore`).
    Evaluate(Expr),
}

impl Stmt {
    pub fn seq(stmts: Vec<Stmt>) -> Self {
        Self::Seq(stmts)
    }

    pub fn empty() -> Self {
        Self::Seq(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Seq(stmts) if stmts.iter().all(Stmt::is_empty))
    }

    pub fn store(buffer: Handle<Buffer>, indices: Vec<Expr>, value: Expr) -> Self {
        Self::Store {
            buffer,
            indices,
            value,
            predicate: None,
        }
    }

    pub fn let_(var: Var, value: Expr, body: Stmt) -> Self {
        Self::Let {
            var,
            value,
            body: Box::new(body),
        }
    }

    pub fn if_then(condition: Expr, then_case: Stmt) -> Self {
        Self::If {
            condition,
            then_case: Box::new(then_case),
            else_case: None,
        }
    }

    /// Flattens nested sequences into one list of statements.
    pub fn into_flat(self) -> Vec<Stmt> {
        match self {
            Self::Seq(stmts) => stmts.into_iter().flat_map(Stmt::into_flat).collect(),
            other => vec![other],
        }
    }
}
