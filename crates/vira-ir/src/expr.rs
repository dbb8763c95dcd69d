//! Expressions: side-effect-free values, from generic vector arithmetic down
//! to virtual-ISA instructions.

use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

use crate::arena::Handle;
use crate::buffer::Buffer;
use crate::types::{DataType, Scalar, ScalarKind};

/// Source of process-unique variable ids, shared by every thread.
static NEXT_VAR_ID: AtomicU32 = AtomicU32::new(1);

/// Returns a process-unique id.
pub fn fresh_id() -> u32 {
    NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed)
}

/// Makes sure ids handed out later are all greater than `id`.
///
/// Needed after deserializing a module whose ids were allocated elsewhere.
pub fn reserve_ids_through(id: u32) {
    NEXT_VAR_ID.fetch_max(id.saturating_add(1), Ordering::Relaxed);
}

/// A scalar or vector variable. Identity is the `id`; the name is cosmetic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Var {
    pub id: u32,
    pub name: String,
    pub dtype: DataType,
}

impl Var {
    /// Creates a variable with a fresh id.
    pub fn new(name: impl Into<String>, dtype: DataType) -> Self {
        Self {
            id: fresh_id(),
            name: name.into(),
            dtype,
        }
    }

    /// A new variable (fresh id) derived from this one with another type.
    pub fn derive(&self, suffix: &str, dtype: DataType) -> Self {
        Self::new(format!("{}{suffix}", self.name), dtype)
    }

    pub fn same(&self, other: &Var) -> bool {
        self.id == other.id
    }
}

/// A literal constant value.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Bool(bool),
    Int { value: i64, scalar: Scalar },
    Float { value: f64, scalar: Scalar },
}

impl Literal {
    /// Returns the scalar type of this literal.
    pub fn scalar(&self) -> Scalar {
        match *self {
            Self::Bool(_) => Scalar::BOOL,
            Self::Int { scalar, .. } | Self::Float { scalar, .. } => scalar,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match *self {
            Self::Int { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        match *self {
            Self::Int { value, .. } => value == 0,
            Self::Float { value, .. } => value == 0.0,
            Self::Bool(b) => !b,
        }
    }

    pub fn is_one(&self) -> bool {
        match *self {
            Self::Int { value, .. } => value == 1,
            Self::Float { value, .. } => value == 1.0,
            Self::Bool(b) => b,
        }
    }
}

/// A unary operator.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum UnaryOp {
    Negate,
    /// Logical not on bools, bitwise not on integers.
    Not,
}

/// A binary operator.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    /// Truncating division for integers, IEEE division for floats.
    Div,
    /// Truncating remainder.
    Mod,
    FloorDiv,
    FloorMod,
    Min,
    Max,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

impl BinaryOp {
    pub fn is_commutative(self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Mul
                | Self::Min
                | Self::Max
                | Self::Eq
                | Self::Ne
                | Self::And
                | Self::Or
                | Self::BitAnd
                | Self::BitOr
                | Self::BitXor
        )
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    /// The operator `op'` with `a op b == b op' a`, if any.
    pub fn mirrored(self) -> Option<Self> {
        match self {
            Self::Lt => Some(Self::Gt),
            Self::Le => Some(Self::Ge),
            Self::Gt => Some(Self::Lt),
            Self::Ge => Some(Self::Le),
            op if op.is_commutative() => Some(op),
            _ => None,
        }
    }
}

/// A built-in intrinsic function.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Intrinsic {
    /// Index of the executing core; constant for a kernel invocation.
    GetLocalId,
    Abs,
    /// Extend every lane to twice its width (sign- or zero-extending by the
    /// source signedness).
    Widen,
    /// Truncate every lane to half its width.
    Narrow,
    /// Convert between integer and float lanes of equal width, or between
    /// float widths.
    Convert,
    /// Core-wide execution barrier.
    Barrier,
    /// Opaque hardware instruction passed through to the code generator.
    Extern(String),
}

impl Intrinsic {
    pub fn has_side_effects(&self) -> bool {
        matches!(self, Self::Barrier | Self::Extern(_))
    }
}

/// A per-lane predicate in its hardware form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Mask {
    /// Explicit lane bits.
    Const(Vec<bool>),
    /// Lane `j` is enabled iff `j < active` (no lane when `active <= 0`).
    Tail { active: Box<Expr>, lanes: u16 },
}

impl Mask {
    /// The first `active` of `lanes` lanes enabled.
    pub fn prefix(active: u16, lanes: u16) -> Self {
        Self::Const((0..lanes).map(|j| j < active).collect())
    }

    pub fn lanes(&self) -> u16 {
        match self {
            Self::Const(bits) => bits.len() as u16,
            Self::Tail { lanes, .. } => *lanes,
        }
    }

    pub fn is_all_true(&self) -> bool {
        matches!(self, Self::Const(bits) if bits.iter().all(|&b| b))
    }
}

/// Comparison condition of a `vcmp` instruction.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum CmpCond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpCond {
    pub fn from_binary(op: BinaryOp) -> Option<Self> {
        Some(match op {
            BinaryOp::Eq => Self::Eq,
            BinaryOp::Ne => Self::Ne,
            BinaryOp::Lt => Self::Lt,
            BinaryOp::Le => Self::Le,
            BinaryOp::Gt => Self::Gt,
            BinaryOp::Ge => Self::Ge,
            _ => return None,
        })
    }

    /// The condition with swapped operands.
    pub fn mirrored(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
            c => c,
        }
    }
}

/// A virtual-ISA opcode: one hardware vector instruction.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Opcode {
    VAdd,
    VSub,
    /// Reverse subtract: `vrsub(a, b) = b - a`.
    VRsub,
    VMul,
    VDiv,
    VMin,
    VMax,
    VAnd,
    VOr,
    VXor,
    VShl,
    VShr,
    VNeg,
    VNot,
    VAbs,
    VCmp(CmpCond),
    /// `vsel(cond, a, b)`.
    VSel,
    /// Scalar to all lanes.
    VBcast,
    /// `vramp(base, stride)`: lane `j` is `base + j * stride`.
    VRamp,
    /// `vmla(a, b, c) = a * b + c`.
    VMla,
    /// `vmls(a, b, c) = c - a * b`.
    VMls,
    VWiden,
    VNarrow,
    VCvt,
    /// Register reinterpretation; no data movement.
    VReint,
    /// `vload(addr)`.
    VLoad,
    /// `vload.s(addr, byte_stride)`.
    VLoadStrided,
    /// `vstore(addr, value)`.
    VStore,
    /// `vstore.s(addr, byte_stride, value)`.
    VStoreStrided,
}

impl Opcode {
    pub fn is_store(self) -> bool {
        matches!(self, Self::VStore | Self::VStoreStrided)
    }

    pub fn is_load(self) -> bool {
        matches!(self, Self::VLoad | Self::VLoadStrided)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::VAdd => "vadd",
            Self::VSub => "vsub",
            Self::VRsub => "vrsub",
            Self::VMul => "vmul",
            Self::VDiv => "vdiv",
            Self::VMin => "vmin",
            Self::VMax => "vmax",
            Self::VAnd => "vand",
            Self::VOr => "vor",
            Self::VXor => "vxor",
            Self::VShl => "vshl",
            Self::VShr => "vshr",
            Self::VNeg => "vneg",
            Self::VNot => "vnot",
            Self::VAbs => "vabs",
            Self::VCmp(CmpCond::Eq) => "vcmp.eq",
            Self::VCmp(CmpCond::Ne) => "vcmp.ne",
            Self::VCmp(CmpCond::Lt) => "vcmp.lt",
            Self::VCmp(CmpCond::Le) => "vcmp.le",
            Self::VCmp(CmpCond::Gt) => "vcmp.gt",
            Self::VCmp(CmpCond::Ge) => "vcmp.ge",
            Self::VSel => "vsel",
            Self::VBcast => "vbcast",
            Self::VRamp => "vramp",
            Self::VMla => "vmla",
            Self::VMls => "vmls",
            Self::VWiden => "vwiden",
            Self::VNarrow => "vnarrow",
            Self::VCvt => "vcvt",
            Self::VReint => "vreint",
            Self::VLoad => "vload",
            Self::VLoadStrided => "vload.s",
            Self::VStore => "vstore",
            Self::VStoreStrided => "vstore.s",
        }
    }
}

/// One virtual-ISA instruction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Inst {
    pub opcode: Opcode,
    pub args: Vec<Expr>,
    /// Lanes with a false predicate keep no result (stores) or read as zero.
    pub mask: Option<Expr>,
    pub dtype: DataType,
}

/// An expression in the IR.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Var(Var),
    Literal(Literal),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Select {
        condition: Box<Expr>,
        accept: Box<Expr>,
        reject: Box<Expr>,
    },
    /// Read from a buffer. A vector index in the last position reads lanes.
    Load {
        buffer: Handle<Buffer>,
        indices: Vec<Expr>,
        predicate: Option<Box<Expr>>,
        dtype: DataType,
    },
    /// `lanes` values `base + j * stride`.
    Ramp {
        base: Box<Expr>,
        stride: Box<Expr>,
        lanes: u16,
    },
    Broadcast {
        value: Box<Expr>,
        lanes: u16,
    },
    /// Value-converting cast.
    Cast {
        value: Box<Expr>,
        dtype: DataType,
    },
    /// Bit-preserving reinterpretation.
    Reinterpret {
        value: Box<Expr>,
        dtype: DataType,
    },
    Mask(Mask),
    Call {
        intrinsic: Intrinsic,
        args: Vec<Expr>,
        dtype: DataType,
    },
    /// Byte address `buffer + offset` in the buffer's address space.
    Address {
        buffer: Handle<Buffer>,
        offset: Box<Expr>,
    },
    Isa(Box<Inst>),
}

impl Expr {
    pub fn int(value: i64, scalar: Scalar) -> Self {
        Self::Literal(Literal::Int { value, scalar })
    }

    pub fn i32(value: i64) -> Self {
        Self::int(value, Scalar::I32)
    }

    pub fn float(value: f64, scalar: Scalar) -> Self {
        Self::Literal(Literal::Float { value, scalar })
    }

    pub fn f32(value: f64) -> Self {
        Self::float(value, Scalar::F32)
    }

    pub fn bool(value: bool) -> Self {
        Self::Literal(Literal::Bool(value))
    }

    pub fn var(var: &Var) -> Self {
        Self::Var(var.clone())
    }

    /// An integer literal of the given type (floats get the float value).
    pub fn typed_const(value: i64, dtype: DataType) -> Self {
        let lit = match dtype.scalar.kind {
            ScalarKind::Float => Self::float(value as f64, dtype.scalar),
            ScalarKind::Bool => Self::bool(value != 0),
            _ => Self::int(value, dtype.scalar),
        };
        if dtype.is_vector() {
            Self::broadcast(lit, dtype.lanes)
        } else {
            lit
        }
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Self::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn add(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn lt(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::Lt, lhs, rhs)
    }

    pub fn and(lhs: Expr, rhs: Expr) -> Self {
        Self::binary(BinaryOp::And, lhs, rhs)
    }

    pub fn not(operand: Expr) -> Self {
        Self::Unary {
            op: UnaryOp::Not,
            operand: Box::new(operand),
        }
    }

    pub fn ramp(base: Expr, stride: Expr, lanes: u16) -> Self {
        Self::Ramp {
            base: Box::new(base),
            stride: Box::new(stride),
            lanes,
        }
    }

    pub fn broadcast(value: Expr, lanes: u16) -> Self {
        Self::Broadcast {
            value: Box::new(value),
            lanes,
        }
    }

    pub fn load(buffer: Handle<Buffer>, indices: Vec<Expr>, dtype: DataType) -> Self {
        Self::Load {
            buffer,
            indices,
            predicate: None,
            dtype,
        }
    }

    pub fn cast(value: Expr, dtype: DataType) -> Self {
        Self::Cast {
            value: Box::new(value),
            dtype,
        }
    }

    pub fn call(intrinsic: Intrinsic, args: Vec<Expr>, dtype: DataType) -> Self {
        Self::Call {
            intrinsic,
            args,
            dtype,
        }
    }

    pub fn isa(opcode: Opcode, args: Vec<Expr>, mask: Option<Expr>, dtype: DataType) -> Self {
        Self::Isa(Box::new(Inst {
            opcode,
            args,
            mask,
            dtype,
        }))
    }

    /// The type of the value this expression produces.
    pub fn dtype(&self) -> DataType {
        match self {
            Self::Var(var) => var.dtype,
            Self::Literal(lit) => DataType::scalar(lit.scalar()),
            Self::Unary { operand, .. } => operand.dtype(),
            Self::Binary { op, lhs, rhs } => {
                let l = lhs.dtype();
                let lanes = l.lanes.max(rhs.dtype().lanes);
                if op.is_comparison() {
                    DataType::vector(Scalar::BOOL, lanes)
                } else {
                    l.with_lanes(lanes)
                }
            }
            Self::Select { accept, .. } => accept.dtype(),
            Self::Load { dtype, .. }
            | Self::Cast { dtype, .. }
            | Self::Reinterpret { dtype, .. }
            | Self::Call { dtype, .. } => *dtype,
            Self::Ramp { base, lanes, .. } => base.dtype().with_lanes(*lanes),
            Self::Broadcast { value, lanes } => value.dtype().with_lanes(*lanes),
            Self::Mask(mask) => DataType::vector(Scalar::BOOL, mask.lanes()),
            Self::Address { .. } => DataType::U32,
            Self::Isa(inst) => inst.dtype,
        }
    }

    pub fn lanes(&self) -> u16 {
        self.dtype().lanes
    }

    pub fn as_literal(&self) -> Option<&Literal> {
        match self {
            Self::Literal(lit) => Some(lit),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        self.as_literal().and_then(Literal::as_int)
    }

    /// A literal, or a broadcast of a literal.
    pub fn is_const(&self) -> bool {
        match self {
            Self::Literal(_) => true,
            Self::Broadcast { value, .. } => value.is_const(),
            _ => false,
        }
    }

    pub fn is_var(&self, var: &Var) -> bool {
        matches!(self, Self::Var(v) if v.same(var))
    }
}
