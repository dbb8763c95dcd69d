//! Reference interpreter.
//!
//! Executes a function at any lowering stage, from the generic loop/vector
//! form down to virtual-ISA instructions, DMA descriptors and events. Buffer
//! contents are kept one lane per element; byte offsets are converted to
//! element offsets through the buffer's element width. Tests use it to check
//! that lowering preserves results.

use std::collections::HashMap;

use crate::arena::Handle;
use crate::buffer::{Buffer, Dim};
use crate::error::EvalError;
use crate::expr::{BinaryOp, Expr, Inst, Intrinsic, Literal, Mask, Opcode, UnaryOp};
use crate::func::{Function, Param};
use crate::stmt::{DmaTransfer, Stmt};
use crate::types::{DataType, Scalar, ScalarKind};

/// One lane of a runtime value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Lane {
    Bool(bool),
    Int(i64),
    Float(f64),
}

impl Lane {
    /// The zero value of a scalar type.
    pub fn zero(scalar: Scalar) -> Self {
        match scalar.kind {
            ScalarKind::Bool => Self::Bool(false),
            ScalarKind::Float => Self::Float(0.0),
            _ => Self::Int(0),
        }
    }

    pub fn to_f64(self) -> f64 {
        match self {
            Self::Bool(b) => f64::from(u8::from(b)),
            Self::Int(i) => i as f64,
            Self::Float(f) => f,
        }
    }

    pub fn to_i64(self) -> i64 {
        match self {
            Self::Bool(b) => i64::from(b),
            Self::Int(i) => i,
            Self::Float(f) => f as i64,
        }
    }

    pub fn truthy(self) -> bool {
        match self {
            Self::Bool(b) => b,
            Self::Int(i) => i != 0,
            Self::Float(f) => f != 0.0,
        }
    }

    /// Value-converting cast to `to`.
    pub fn convert(self, to: Scalar) -> Self {
        match to.kind {
            ScalarKind::Bool => Self::Bool(self.truthy()),
            ScalarKind::Sint | ScalarKind::Uint => Self::Int(wrap_int(self.to_i64(), to)),
            ScalarKind::Float => Self::Float(round_float(self.to_f64(), to)),
            ScalarKind::Void => self,
        }
    }

    /// Bit-preserving reinterpretation between scalars of equal width.
    pub fn reinterpret(self, from: Scalar, to: Scalar) -> Result<Self, EvalError> {
        if from.width != to.width {
            return Err(EvalError::Unsupported(format!(
                "reinterpret {from} as {to} changes width"
            )));
        }
        Ok(match (self, to.kind) {
            (Self::Float(f), ScalarKind::Sint | ScalarKind::Uint) if from.width == 4 => {
                Self::Int(wrap_int(i64::from((f as f32).to_bits()), to))
            }
            (Self::Int(i), ScalarKind::Float) if to.width == 4 => {
                Self::Float(f64::from(f32::from_bits(i as u32)))
            }
            (Self::Int(i), ScalarKind::Sint | ScalarKind::Uint) => Self::Int(wrap_int(i, to)),
            (lane @ Self::Float(_), ScalarKind::Float) | (lane @ Self::Bool(_), ScalarKind::Bool) => {
                lane
            }
            _ => {
                return Err(EvalError::Unsupported(format!(
                    "reinterpret {from} as {to}"
                )));
            }
        })
    }
}

/// Wraps an integer into the range of `scalar`.
pub fn wrap_int(value: i64, scalar: Scalar) -> i64 {
    let bits = scalar.bits();
    if bits == 0 || bits >= 64 {
        return value;
    }
    let low = value & ((1i64 << bits) - 1);
    match scalar.kind {
        ScalarKind::Sint if (low >> (bits - 1)) & 1 == 1 => low - (1i64 << bits),
        _ => low,
    }
}

/// Rounds a float to the precision of `scalar`.
pub fn round_float(value: f64, scalar: Scalar) -> f64 {
    if scalar.width == 4 {
        f64::from(value as f32)
    } else {
        value
    }
}

fn floor_div(x: i64, y: i64) -> i64 {
    let q = x.wrapping_div(y);
    if x.wrapping_rem(y) != 0 && ((x < 0) != (y < 0)) {
        q - 1
    } else {
        q
    }
}

/// Applies a binary operator to one lane; `scalar` is the operand type.
pub fn binary_lane(op: BinaryOp, a: Lane, b: Lane, scalar: Scalar) -> Result<Lane, EvalError> {
    use BinaryOp as B;
    Ok(match (a, b) {
        (Lane::Bool(x), Lane::Bool(y)) => Lane::Bool(match op {
            B::And | B::BitAnd | B::Min | B::Mul => x && y,
            B::Or | B::BitOr | B::Max => x || y,
            B::BitXor | B::Ne => x != y,
            B::Eq => x == y,
            B::Lt => !x && y,
            B::Le => x <= y,
            B::Gt => x && !y,
            B::Ge => x >= y,
            _ => return Err(EvalError::Unsupported(format!("`{op}` on bool lanes"))),
        }),
        (Lane::Int(x), Lane::Int(y)) => {
            let v = match op {
                B::Add => x.wrapping_add(y),
                B::Sub => x.wrapping_sub(y),
                B::Mul => x.wrapping_mul(y),
                B::Div | B::Mod | B::FloorDiv | B::FloorMod if y == 0 => {
                    return Err(EvalError::DivisionByZero);
                }
                B::Div => x.wrapping_div(y),
                B::Mod => x.wrapping_rem(y),
                B::FloorDiv => floor_div(x, y),
                B::FloorMod => x.wrapping_sub(floor_div(x, y).wrapping_mul(y)),
                B::Min => x.min(y),
                B::Max => x.max(y),
                B::BitAnd => x & y,
                B::BitOr => x | y,
                B::BitXor => x ^ y,
                B::And => return Ok(Lane::Bool(x != 0 && y != 0)),
                B::Or => return Ok(Lane::Bool(x != 0 || y != 0)),
                B::Shl => x.wrapping_shl(y as u32),
                B::Shr => x.wrapping_shr(y as u32),
                B::Eq => return Ok(Lane::Bool(x == y)),
                B::Ne => return Ok(Lane::Bool(x != y)),
                B::Lt => return Ok(Lane::Bool(x < y)),
                B::Le => return Ok(Lane::Bool(x <= y)),
                B::Gt => return Ok(Lane::Bool(x > y)),
                B::Ge => return Ok(Lane::Bool(x >= y)),
            };
            Lane::Int(wrap_int(v, scalar))
        }
        (a, b) => {
            let (x, y) = (a.to_f64(), b.to_f64());
            let v = match op {
                B::Add => x + y,
                B::Sub => x - y,
                B::Mul => x * y,
                B::Div => x / y,
                B::Mod => x % y,
                B::FloorDiv => (x / y).floor(),
                B::FloorMod => x - (x / y).floor() * y,
                B::Min => x.min(y),
                B::Max => x.max(y),
                B::Eq => return Ok(Lane::Bool(x == y)),
                B::Ne => return Ok(Lane::Bool(x != y)),
                B::Lt => return Ok(Lane::Bool(x < y)),
                B::Le => return Ok(Lane::Bool(x <= y)),
                B::Gt => return Ok(Lane::Bool(x > y)),
                B::Ge => return Ok(Lane::Bool(x >= y)),
                _ => return Err(EvalError::Unsupported(format!("`{op}` on float lanes"))),
            };
            Lane::Float(round_float(v, scalar))
        }
    })
}

/// Like [`binary_lane`], except that an integer lane of a multi-lane value
/// divided by zero reads as zero. Padding lanes hold zeros.
fn lane_of_vector(
    op: BinaryOp,
    a: Lane,
    b: Lane,
    scalar: Scalar,
    lanes: usize,
) -> Result<Lane, EvalError> {
    match binary_lane(op, a, b, scalar) {
        Err(EvalError::DivisionByZero) if lanes > 1 => Ok(Lane::zero(scalar)),
        other => other,
    }
}

fn unary_lane(op: UnaryOp, a: Lane, scalar: Scalar) -> Result<Lane, EvalError> {
    Ok(match (op, a) {
        (UnaryOp::Negate, Lane::Int(i)) => Lane::Int(wrap_int(i.wrapping_neg(), scalar)),
        (UnaryOp::Negate, Lane::Float(f)) => Lane::Float(-f),
        (UnaryOp::Not, Lane::Bool(b)) => Lane::Bool(!b),
        (UnaryOp::Not, Lane::Int(i)) => Lane::Int(wrap_int(!i, scalar)),
        (op, lane) => {
            return Err(EvalError::Unsupported(format!("`{op}` on {lane:?}")));
        }
    })
}

fn abs_lane(a: Lane, scalar: Scalar) -> Lane {
    match a {
        Lane::Int(i) => Lane::Int(wrap_int(i.wrapping_abs(), scalar)),
        Lane::Float(f) => Lane::Float(f.abs()),
        lane => lane,
    }
}

/// A runtime value: one scalar type over one or more lanes. Void values have
/// no lanes.
#[derive(Clone, Debug, PartialEq)]
pub struct Value {
    pub scalar: Scalar,
    pub lanes: Vec<Lane>,
}

impl Value {
    fn scalar(scalar: Scalar, lane: Lane) -> Self {
        Self {
            scalar,
            lanes: vec![lane],
        }
    }

    fn void() -> Self {
        Self {
            scalar: Scalar::VOID,
            lanes: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.is_empty()
    }

    /// Lane `j`; single-lane values broadcast.
    pub fn lane(&self, j: usize) -> Lane {
        match self.lanes.len() {
            0 => Lane::zero(self.scalar),
            1 => self.lanes[0],
            n => self.lanes[j % n],
        }
    }
}

/// Interprets one function against in-memory buffers.
///
/// Buffers not given an initial value are zero-filled. Scalar parameters and
/// symbolic sizes are bound by name.
pub struct Interpreter<'a> {
    func: &'a Function,
    inputs: HashMap<String, Vec<Lane>>,
    scalars: HashMap<String, Lane>,
    memory: HashMap<Handle<Buffer>, Vec<Lane>>,
    env: HashMap<u32, Value>,
    local_id: i64,
}

impl<'a> Interpreter<'a> {
    pub fn new(func: &'a Function) -> Self {
        Self {
            func,
            inputs: HashMap::new(),
            scalars: HashMap::new(),
            memory: HashMap::new(),
            env: HashMap::new(),
            local_id: 0,
        }
    }

    /// Value returned by `get_local_id()`.
    pub fn with_local_id(mut self, id: i64) -> Self {
        self.local_id = id;
        self
    }

    /// Initial contents of the buffer named `name`.
    pub fn set_buffer(&mut self, name: &str, data: Vec<Lane>) {
        self.inputs.insert(name.to_string(), data);
    }

    /// Value of the scalar parameter or size variable named `name`.
    pub fn set_scalar(&mut self, name: &str, value: Lane) {
        self.scalars.insert(name.to_string(), value);
    }

    /// Contents of the buffer named `name` after [`Interpreter::run`].
    pub fn buffer(&self, name: &str) -> Option<&[Lane]> {
        let (handle, _) = self.func.buffers.find(|b| b.name == name)?;
        self.memory.get(&handle).map(Vec::as_slice)
    }

    /// Allocates every buffer and executes the function body.
    pub fn run(&mut self) -> Result<(), EvalError> {
        let func = self.func;
        for param in &func.params {
            if let Param::Scalar(var) = param {
                let lane = match self.scalars.get(&var.name) {
                    Some(lane) => *lane,
                    // A zero-dimension buffer may have been turned into a scalar.
                    None => match self.inputs.get(&var.name).map(Vec::as_slice) {
                        Some([lane]) => *lane,
                        _ => return Err(EvalError::UnboundVar(var.name.clone())),
                    },
                };
                self.env
                    .insert(var.id, Value::scalar(var.dtype.scalar, lane.convert(var.dtype.scalar)));
            }
        }
        for (handle, buf) in func.buffers.iter() {
            let size = self.buffer_size(buf)?;
            let data = match self.inputs.get(&buf.name) {
                Some(data) if data.len() == size => data.clone(),
                Some(data) => {
                    return Err(EvalError::InputSize {
                        buffer: buf.name.clone(),
                        expected: size,
                        found: data.len(),
                    });
                }
                None => vec![Lane::zero(buf.dtype.scalar); size],
            };
            self.memory.insert(handle, data);
        }
        self.exec(&func.body)
    }

    fn buffer_size(&mut self, buf: &Buffer) -> Result<usize, EvalError> {
        let mut size = 1usize;
        for dim in &buf.shape {
            let n = self.dim_extent(dim)?;
            size = size.saturating_mul(usize::try_from(n).unwrap_or(0));
        }
        Ok(size)
    }

    fn dim_extent(&mut self, dim: &Dim) -> Result<i64, EvalError> {
        match dim {
            Dim::Fixed(n) => Ok(*n as i64),
            Dim::Size(var) => self.scalar_int(&Expr::Var(var.clone())),
        }
    }

    fn buf(&self, h: Handle<Buffer>) -> Result<&'a Buffer, EvalError> {
        let func = self.func;
        func.buffers.try_get(h).ok_or(EvalError::DanglingHandle {
            kind: "buffer",
            index: h.index(),
        })
    }

    fn read(&self, h: Handle<Buffer>, index: i64) -> Result<Lane, EvalError> {
        let data = self.memory.get(&h).ok_or(EvalError::DanglingHandle {
            kind: "buffer",
            index: h.index(),
        })?;
        usize::try_from(index)
            .ok()
            .and_then(|i| data.get(i).copied())
            .ok_or_else(|| EvalError::OutOfBounds {
                buffer: self.func.buffers.try_get(h).map(|b| b.name.clone()).unwrap_or_default(),
                index,
                size: data.len(),
            })
    }

    fn write(&mut self, h: Handle<Buffer>, index: i64, lane: Lane) -> Result<(), EvalError> {
        let name = self.buf(h)?.name.clone();
        let data = self.memory.get_mut(&h).ok_or(EvalError::DanglingHandle {
            kind: "buffer",
            index: h.index(),
        })?;
        let size = data.len();
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| data.get_mut(i))
            .ok_or(EvalError::OutOfBounds {
                buffer: name,
                index,
                size,
            })?;
        *slot = lane;
        Ok(())
    }

    /// Converts a byte offset into an element offset.
    fn element_of(&self, h: Handle<Buffer>, bytes: i64) -> Result<i64, EvalError> {
        let buf = self.buf(h)?;
        let width = buf.elem_bytes() as i64;
        if width == 0 || bytes % width != 0 {
            return Err(EvalError::Misaligned {
                buffer: buf.name.clone(),
                offset: bytes,
            });
        }
        Ok(bytes / width)
    }

    /// Per-dimension strides in elements.
    fn element_strides(&mut self, buf: &Buffer) -> Result<Vec<i64>, EvalError> {
        if let Some(strides) = &buf.strides {
            let width = buf.elem_bytes() as i64;
            return strides
                .iter()
                .map(|s| {
                    let bytes = self.scalar_int(s)?;
                    if width == 0 || bytes % width != 0 {
                        return Err(EvalError::Misaligned {
                            buffer: buf.name.clone(),
                            offset: bytes,
                        });
                    }
                    Ok(bytes / width)
                })
                .collect();
        }
        let mut strides = vec![1i64; buf.rank()];
        let mut acc = 1i64;
        for (k, dim) in buf.shape.iter().enumerate().rev() {
            strides[k] = acc;
            acc = acc.wrapping_mul(self.dim_extent(dim)?);
        }
        Ok(strides)
    }

    /// Element offset of every lane addressed by `indices`.
    fn element_offsets(&mut self, h: Handle<Buffer>, indices: &[Expr]) -> Result<Vec<i64>, EvalError> {
        let buf = self.buf(h)?;
        if indices.len() != buf.rank() {
            return Err(EvalError::RankMismatch {
                buffer: buf.name.clone(),
                expected: buf.rank(),
                found: indices.len(),
            });
        }
        let strides = self.element_strides(buf)?;
        let values = indices
            .iter()
            .map(|e| self.eval(e))
            .collect::<Result<Vec<_>, _>>()?;
        let lanes = values.iter().map(Value::len).max().unwrap_or(1).max(1);
        Ok((0..lanes)
            .map(|j| {
                values
                    .iter()
                    .zip(&strides)
                    .map(|(v, s)| v.lane(j).to_i64().wrapping_mul(*s))
                    .fold(0i64, i64::wrapping_add)
            })
            .collect())
    }

    /// Evaluates an expression that must yield a single integer.
    pub fn scalar_int(&mut self, expr: &Expr) -> Result<i64, EvalError> {
        let v = self.eval(expr)?;
        match v.lanes.as_slice() {
            [Lane::Float(_)] | [] => Err(EvalError::ExpectedScalar("integer")),
            [lane] => Ok(lane.to_i64()),
            _ => Err(EvalError::ExpectedScalar("integer")),
        }
    }

    fn scalar_bool(&mut self, expr: &Expr) -> Result<Option<bool>, EvalError> {
        let v = self.eval(expr)?;
        if v.lanes.iter().all(|l| l.truthy()) {
            Ok(Some(true))
        } else if v.lanes.iter().all(|l| !l.truthy()) {
            Ok(Some(false))
        } else {
            Ok(None)
        }
    }

    fn bind(&mut self, id: u32, value: Value) -> Option<Value> {
        self.env.insert(id, value)
    }

    fn unbind(&mut self, id: u32, previous: Option<Value>) {
        match previous {
            Some(v) => {
                self.env.insert(id, v);
            }
            None => {
                self.env.remove(&id);
            }
        }
    }

    fn exec(&mut self, stmt: &Stmt) -> Result<(), EvalError> {
        match stmt {
            Stmt::Seq(stmts) => {
                for s in stmts {
                    self.exec(s)?;
                }
            }
            Stmt::For(l) => {
                let min = self.scalar_int(&l.min)?;
                let extent = self.scalar_int(&l.extent)?;
                let scalar = l.var.dtype.scalar;
                let mut previous = None;
                for k in 0..extent.max(0) {
                    let value = Value::scalar(scalar, Lane::Int(wrap_int(min + k, scalar)));
                    let old = self.bind(l.var.id, value);
                    if k == 0 {
                        previous = old;
                    }
                    self.exec(&l.body)?;
                }
                if extent > 0 {
                    self.unbind(l.var.id, previous);
                }
            }
            Stmt::If {
                condition,
                then_case,
                else_case,
            } => match self.scalar_bool(condition)? {
                Some(true) => self.exec(then_case)?,
                Some(false) => {
                    if let Some(else_case) = else_case {
                        self.exec(else_case)?;
                    }
                }
                None => {
                    return Err(EvalError::Unsupported(
                        "branch on a partially true vector condition".into(),
                    ));
                }
            },
            Stmt::Let { var, value, body } => {
                let v = self.eval(value)?;
                let previous = self.bind(var.id, v);
                self.exec(body)?;
                self.unbind(var.id, previous);
            }
            Stmt::Store {
                buffer,
                indices,
                value,
                predicate,
            } => {
                let offsets = self.element_offsets(*buffer, indices)?;
                let value = self.eval(value)?;
                let mask = predicate.as_ref().map(|p| self.eval(p)).transpose()?;
                let lanes = offsets.len().max(value.len());
                for j in 0..lanes {
                    if mask.as_ref().is_some_and(|m| !m.lane(j).truthy()) {
                        continue;
                    }
                    let offset = offsets[j % offsets.len()];
                    self.write(*buffer, offset, value.lane(j))?;
                }
            }
            Stmt::Dma(dma) => self.exec_dma(dma)?,
            Stmt::Wait(_) | Stmt::Signal(_) => {}
            Stmt::Evaluate(e) => {
                self.eval(e)?;
            }
        }
        Ok(())
    }

    fn exec_dma(&mut self, dma: &DmaTransfer) -> Result<(), EvalError> {
        let src = self.scalar_int(&dma.src.offset)?;
        let dst = self.scalar_int(&dma.dst.offset)?;
        let mut dims = Vec::with_capacity(dma.dims.len());
        for d in &dma.dims {
            dims.push((
                self.scalar_int(&d.length)?,
                self.scalar_int(&d.src_stride)?,
                self.scalar_int(&d.dst_stride)?,
            ));
        }
        self.copy(dma, &dims, src, dst)
    }

    fn copy(
        &mut self,
        dma: &DmaTransfer,
        dims: &[(i64, i64, i64)],
        src: i64,
        dst: i64,
    ) -> Result<(), EvalError> {
        match dims.split_first() {
            None => {
                let s = self.element_of(dma.src.buffer, src)?;
                let d = self.element_of(dma.dst.buffer, dst)?;
                let lane = self.read(dma.src.buffer, s)?;
                self.write(dma.dst.buffer, d, lane)
            }
            Some((&(len, ss, ds), rest)) => {
                for k in 0..len.max(0) {
                    self.copy(dma, rest, src + k * ss, dst + k * ds)?;
                }
                Ok(())
            }
        }
    }

    /// Evaluates an expression, performing any memory effect it has.
    pub fn eval(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        Ok(match expr {
            Expr::Var(var) => match self.env.get(&var.id) {
                Some(v) => v.clone(),
                None => match self.scalars.get(&var.name) {
                    Some(lane) => Value::scalar(var.dtype.scalar, lane.convert(var.dtype.scalar)),
                    None => return Err(EvalError::UnboundVar(var.name.clone())),
                },
            },
            Expr::Literal(lit) => match *lit {
                Literal::Bool(b) => Value::scalar(Scalar::BOOL, Lane::Bool(b)),
                Literal::Int { value, scalar } => Value::scalar(scalar, Lane::Int(wrap_int(value, scalar))),
                Literal::Float { value, scalar } => {
                    Value::scalar(scalar, Lane::Float(round_float(value, scalar)))
                }
            },
            Expr::Unary { op, operand } => {
                let v = self.eval(operand)?;
                let lanes = v
                    .lanes
                    .iter()
                    .map(|l| unary_lane(*op, *l, v.scalar))
                    .collect::<Result<_, _>>()?;
                Value {
                    scalar: v.scalar,
                    lanes,
                }
            }
            Expr::Binary { op, lhs, rhs } => {
                let a = self.eval(lhs)?;
                let b = self.eval(rhs)?;
                let n = a.len().max(b.len());
                let lanes = (0..n)
                    .map(|j| lane_of_vector(*op, a.lane(j), b.lane(j), a.scalar, n))
                    .collect::<Result<_, _>>()?;
                let scalar = if op.is_comparison() { Scalar::BOOL } else { a.scalar };
                Value { scalar, lanes }
            }
            Expr::Select {
                condition,
                accept,
                reject,
            } => {
                let c = self.eval(condition)?;
                let a = self.eval(accept)?;
                let r = self.eval(reject)?;
                let n = c.len().max(a.len()).max(r.len());
                Value {
                    scalar: a.scalar,
                    lanes: (0..n)
                        .map(|j| if c.lane(j).truthy() { a.lane(j) } else { r.lane(j) })
                        .collect(),
                }
            }
            Expr::Load {
                buffer,
                indices,
                predicate,
                dtype,
            } => {
                let offsets = self.element_offsets(*buffer, indices)?;
                let mask = predicate.as_deref().map(|p| self.eval(p)).transpose()?;
                let n = offsets.len().max(usize::from(dtype.lanes));
                let mut lanes = Vec::with_capacity(n);
                for j in 0..n {
                    if mask.as_ref().is_some_and(|m| !m.lane(j).truthy()) {
                        lanes.push(Lane::zero(dtype.scalar));
                    } else {
                        lanes.push(self.read(*buffer, offsets[j % offsets.len()])?);
                    }
                }
                Value {
                    scalar: dtype.scalar,
                    lanes,
                }
            }
            Expr::Ramp {
                base,
                stride,
                lanes,
            } => {
                let b = self.eval(base)?;
                let s = self.eval(stride)?;
                ramp(b.lane(0), s.lane(0), b.scalar, *lanes)?
            }
            Expr::Broadcast { value, lanes } => {
                let v = self.eval(value)?;
                Value {
                    scalar: v.scalar,
                    lanes: (0..usize::from(*lanes)).map(|j| v.lane(j)).collect(),
                }
            }
            Expr::Cast { value, dtype } => {
                let v = self.eval(value)?;
                convert(&v, *dtype)
            }
            Expr::Reinterpret { value, dtype } => {
                let v = self.eval(value)?;
                reinterpret(&v, *dtype)?
            }
            Expr::Mask(Mask::Const(bits)) => Value {
                scalar: Scalar::BOOL,
                lanes: bits.iter().map(|&b| Lane::Bool(b)).collect(),
            },
            Expr::Mask(Mask::Tail { active, lanes }) => {
                let active = self.scalar_int(active)?;
                Value {
                    scalar: Scalar::BOOL,
                    lanes: (0..i64::from(*lanes)).map(|j| Lane::Bool(j < active)).collect(),
                }
            }
            Expr::Call {
                intrinsic,
                args,
                dtype,
            } => self.eval_call(intrinsic, args, *dtype)?,
            Expr::Address { buffer, offset } => {
                self.buf(*buffer)?;
                let off = self.scalar_int(offset)?;
                Value::scalar(Scalar::U32, Lane::Int(off))
            }
            Expr::Isa(inst) => self.eval_inst(inst)?,
        })
    }

    fn eval_call(
        &mut self,
        intrinsic: &Intrinsic,
        args: &[Expr],
        dtype: DataType,
    ) -> Result<Value, EvalError> {
        let first = |this: &mut Self| -> Result<Value, EvalError> {
            match args.first() {
                Some(a) => this.eval(a),
                None => Err(EvalError::Unsupported(format!("`{intrinsic}` without operand"))),
            }
        };
        Ok(match intrinsic {
            Intrinsic::GetLocalId => Value::scalar(dtype.scalar, Lane::Int(self.local_id)),
            Intrinsic::Abs => {
                let v = first(self)?;
                Value {
                    scalar: v.scalar,
                    lanes: v.lanes.iter().map(|l| abs_lane(*l, v.scalar)).collect(),
                }
            }
            Intrinsic::Widen | Intrinsic::Narrow | Intrinsic::Convert => convert(&first(self)?, dtype),
            Intrinsic::Barrier | Intrinsic::Extern(_) => {
                for a in args {
                    self.eval(a)?;
                }
                Value::void()
            }
        })
    }

    /// Evaluates an `Address` operand into (buffer, byte offset).
    fn address(&mut self, expr: Option<&Expr>) -> Result<(Handle<Buffer>, i64), EvalError> {
        match expr {
            Some(Expr::Address { buffer, offset }) => Ok((*buffer, self.scalar_int(offset)?)),
            other => Err(EvalError::Unsupported(format!(
                "memory instruction without an address operand: {other:?}"
            ))),
        }
    }

    fn eval_inst(&mut self, inst: &Inst) -> Result<Value, EvalError> {
        let mask = inst.mask.as_ref().map(|m| self.eval(m)).transpose()?;
        let active = |j: usize| mask.as_ref().is_none_or(|m| m.lane(j).truthy());
        let n = usize::from(inst.dtype.lanes);
        let scalar = inst.dtype.scalar;

        match inst.opcode {
            Opcode::VLoad | Opcode::VLoadStrided => {
                let (buf, base) = self.address(inst.args.first())?;
                let stride = if inst.opcode == Opcode::VLoadStrided {
                    self.scalar_int(Self::operand(inst, 1)?)?
                } else {
                    self.buf(buf)?.elem_bytes() as i64
                };
                let mut lanes = Vec::with_capacity(n);
                for j in 0..n {
                    if active(j) {
                        let e = self.element_of(buf, base + j as i64 * stride)?;
                        lanes.push(self.read(buf, e)?);
                    } else {
                        lanes.push(Lane::zero(scalar));
                    }
                }
                return Ok(Value { scalar, lanes });
            }
            Opcode::VStore | Opcode::VStoreStrided => {
                let (buf, base) = self.address(inst.args.first())?;
                let (stride, value) = if inst.opcode == Opcode::VStoreStrided {
                    let s = self.scalar_int(Self::operand(inst, 1)?)?;
                    (s, self.eval(Self::operand(inst, 2)?)?)
                } else {
                    let s = self.buf(buf)?.elem_bytes() as i64;
                    (s, self.eval(Self::operand(inst, 1)?)?)
                };
                for j in 0..value.len() {
                    if active(j) {
                        let e = self.element_of(buf, base + j as i64 * stride)?;
                        self.write(buf, e, value.lane(j))?;
                    }
                }
                return Ok(Value::void());
            }
            _ => {}
        }

        let args = inst
            .args
            .iter()
            .map(|a| self.eval(a))
            .collect::<Result<Vec<_>, _>>()?;
        let arg = |i: usize| -> Result<&Value, EvalError> {
            args.get(i).ok_or_else(|| {
                EvalError::Unsupported(format!("`{}` missing operand {i}", inst.opcode))
            })
        };

        let value = match inst.opcode {
            Opcode::VBcast => Value {
                scalar,
                lanes: vec![arg(0)?.lane(0); n],
            },
            Opcode::VRamp => ramp(arg(0)?.lane(0), arg(1)?.lane(0), arg(0)?.scalar, inst.dtype.lanes)?,
            Opcode::VWiden | Opcode::VNarrow | Opcode::VCvt => convert(arg(0)?, inst.dtype),
            Opcode::VReint => reinterpret(arg(0)?, inst.dtype)?,
            Opcode::VSel => {
                let (c, a, b) = (arg(0)?, arg(1)?, arg(2)?);
                Value {
                    scalar,
                    lanes: (0..n)
                        .map(|j| if c.lane(j).truthy() { a.lane(j) } else { b.lane(j) })
                        .collect(),
                }
            }
            op => {
                let mut lanes = Vec::with_capacity(n);
                let operand_scalar = arg(0)?.scalar;
                for j in 0..n {
                    let l = |i: usize| arg(i).map(|v| v.lane(j));
                    let lane = match op {
                        Opcode::VNeg => unary_lane(UnaryOp::Negate, l(0)?, operand_scalar)?,
                        Opcode::VNot => unary_lane(UnaryOp::Not, l(0)?, operand_scalar)?,
                        Opcode::VAbs => abs_lane(l(0)?, operand_scalar),
                        Opcode::VRsub => binary_lane(BinaryOp::Sub, l(1)?, l(0)?, operand_scalar)?,
                        Opcode::VMla => {
                            let p = binary_lane(BinaryOp::Mul, l(0)?, l(1)?, operand_scalar)?;
                            binary_lane(BinaryOp::Add, p, l(2)?, operand_scalar)?
                        }
                        Opcode::VMls => {
                            let p = binary_lane(BinaryOp::Mul, l(0)?, l(1)?, operand_scalar)?;
                            binary_lane(BinaryOp::Sub, l(2)?, p, operand_scalar)?
                        }
                        other => {
                            let bop = binary_of(other).ok_or_else(|| {
                                EvalError::Unsupported(format!("opcode `{other}`"))
                            })?;
                            lane_of_vector(bop, l(0)?, l(1)?, operand_scalar, n)?
                        }
                    };
                    lanes.push(lane);
                }
                Value { scalar, lanes }
            }
        };

        Ok(match mask {
            Some(_) => Value {
                scalar: value.scalar,
                lanes: value
                    .lanes
                    .iter()
                    .enumerate()
                    .map(|(j, l)| if active(j) { *l } else { Lane::zero(value.scalar) })
                    .collect(),
            },
            None => value,
        })
    }

    fn operand<'e>(inst: &'e Inst, i: usize) -> Result<&'e Expr, EvalError> {
        inst.args.get(i).ok_or_else(|| {
            EvalError::Unsupported(format!("`{}` missing operand {i}", inst.opcode))
        })
    }
}

/// The generic operator an ALU opcode computes, if it is a plain binary op.
pub fn binary_of(opcode: Opcode) -> Option<BinaryOp> {
    use crate::expr::CmpCond;
    Some(match opcode {
        Opcode::VAdd => BinaryOp::Add,
        Opcode::VSub => BinaryOp::Sub,
        Opcode::VMul => BinaryOp::Mul,
        Opcode::VDiv => BinaryOp::Div,
        Opcode::VMin => BinaryOp::Min,
        Opcode::VMax => BinaryOp::Max,
        Opcode::VAnd => BinaryOp::BitAnd,
        Opcode::VOr => BinaryOp::BitOr,
        Opcode::VXor => BinaryOp::BitXor,
        Opcode::VShl => BinaryOp::Shl,
        Opcode::VShr => BinaryOp::Shr,
        Opcode::VCmp(CmpCond::Eq) => BinaryOp::Eq,
        Opcode::VCmp(CmpCond::Ne) => BinaryOp::Ne,
        Opcode::VCmp(CmpCond::Lt) => BinaryOp::Lt,
        Opcode::VCmp(CmpCond::Le) => BinaryOp::Le,
        Opcode::VCmp(CmpCond::Gt) => BinaryOp::Gt,
        Opcode::VCmp(CmpCond::Ge) => BinaryOp::Ge,
        _ => return None,
    })
}

fn ramp(base: Lane, stride: Lane, scalar: Scalar, lanes: u16) -> Result<Value, EvalError> {
    let mut out = Vec::with_capacity(usize::from(lanes));
    for j in 0..i64::from(lanes) {
        let step = binary_lane(BinaryOp::Mul, Lane::Int(j).convert(scalar), stride, scalar)?;
        out.push(binary_lane(BinaryOp::Add, base, step, scalar)?);
    }
    Ok(Value { scalar, lanes: out })
}

fn convert(v: &Value, dtype: DataType) -> Value {
    let n = v.len().max(usize::from(dtype.lanes));
    Value {
        scalar: dtype.scalar,
        lanes: (0..n).map(|j| v.lane(j).convert(dtype.scalar)).collect(),
    }
}

fn reinterpret(v: &Value, dtype: DataType) -> Result<Value, EvalError> {
    if v.len() != usize::from(dtype.lanes) {
        return Err(EvalError::Unsupported(format!(
            "reinterpret of {} lanes as {dtype}",
            v.len()
        )));
    }
    let lanes = v
        .lanes
        .iter()
        .map(|l| l.reinterpret(v.scalar, dtype.scalar))
        .collect::<Result<_, _>>()?;
    Ok(Value {
        scalar: dtype.scalar,
        lanes,
    })
}
