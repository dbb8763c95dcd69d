//! Human-readable IR: `Display` for every node and the `--emit-ir` dump.

use std::fmt::{self, Write as _};

use crate::Module;
use crate::arena::{Arena, Handle};
use crate::buffer::{AddressSpace, Buffer, Dim, Event, Layout};
use crate::expr::{BinaryOp, Expr, Intrinsic, Literal, Mask, Opcode, UnaryOp};
use crate::func::{Function, Param};
use crate::stmt::{ForKind, PartitionRole, Stmt};
use crate::types::{DataType, Scalar, ScalarKind};

impl fmt::Display for ScalarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Sint => write!(f, "sint"),
            Self::Uint => write!(f, "uint"),
            Self::Float => write!(f, "float"),
            Self::Void => write!(f, "void"),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ScalarKind::Bool => write!(f, "bool"),
            ScalarKind::Sint => write!(f, "i{}", self.bits()),
            ScalarKind::Uint => write!(f, "u{}", self.bits()),
            ScalarKind::Float => write!(f, "f{}", self.bits()),
            ScalarKind::Void => write!(f, "void"),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.lanes == 1 {
            write!(f, "{}", self.scalar)
        } else {
            write!(f, "{}x{}", self.scalar, self.lanes)
        }
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Local => write!(f, "local"),
            Self::Shared => write!(f, "shared"),
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RowMajor => write!(f, "row_major"),
            Self::ColumnMajor => write!(f, "col_major"),
            Self::Permuted(order) => write!(f, "permuted{order:?}"),
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int { value, scalar } if scalar == Scalar::I32 => write!(f, "{value}"),
            Self::Int { value, scalar } => write!(f, "{value}{scalar}"),
            Self::Float { value, scalar } if scalar == Scalar::F32 => write!(f, "{value:?}f"),
            Self::Float { value, scalar } => write!(f, "{value:?}{scalar}"),
        }
    }
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Negate => write!(f, "-"),
            Self::Not => write!(f, "!"),
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::FloorDiv => "floordiv",
            Self::FloorMod => "floormod",
            Self::Min => "min",
            Self::Max => "max",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
            Self::BitAnd => "&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::Shl => "<<",
            Self::Shr => ">>",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Intrinsic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GetLocalId => write!(f, "get_local_id"),
            Self::Abs => write!(f, "abs"),
            Self::Widen => write!(f, "widen"),
            Self::Narrow => write!(f, "narrow"),
            Self::Convert => write!(f, "convert"),
            Self::Barrier => write!(f, "barrier"),
            Self::Extern(name) => write!(f, "extern.{name}"),
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&Printer::default().expr(self))
    }
}

impl fmt::Display for Stmt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = String::new();
        Printer::default().stmt(&mut out, self, 0);
        f.write_str(&out)
    }
}

/// Resolves buffer and event names when a function is available.
#[derive(Default)]
struct Printer<'a> {
    buffers: Option<&'a Arena<Buffer>>,
    events: Option<&'a Arena<Event>>,
}

impl<'a> Printer<'a> {
    fn for_function(func: &'a Function) -> Self {
        Self {
            buffers: Some(&func.buffers),
            events: Some(&func.events),
        }
    }

    fn buffer(&self, h: Handle<Buffer>) -> String {
        match self.buffers.and_then(|a| a.try_get(h)) {
            Some(buf) => buf.name.clone(),
            None => format!("buf{h:?}"),
        }
    }

    fn event(&self, h: Handle<Event>) -> String {
        match self.events.and_then(|a| a.try_get(h)) {
            Some(ev) => ev.name.clone(),
            None => format!("ev{h:?}"),
        }
    }

    fn list(&self, exprs: &[Expr]) -> String {
        exprs
            .iter()
            .map(|e| self.expr(e))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn expr(&self, expr: &Expr) -> String {
        match expr {
            Expr::Var(v) => v.name.clone(),
            Expr::Literal(lit) => lit.to_string(),
            Expr::Unary { op, operand } => format!("{op}{}", self.expr(operand)),
            Expr::Binary { op, lhs, rhs } => match op {
                BinaryOp::FloorDiv | BinaryOp::FloorMod | BinaryOp::Min | BinaryOp::Max => {
                    format!("{op}({}, {})", self.expr(lhs), self.expr(rhs))
                }
                _ => format!("({} {op} {})", self.expr(lhs), self.expr(rhs)),
            },
            Expr::Select {
                condition,
                accept,
                reject,
            } => format!(
                "select({}, {}, {})",
                self.expr(condition),
                self.expr(accept),
                self.expr(reject)
            ),
            Expr::Load {
                buffer,
                indices,
                predicate,
                ..
            } => match predicate {
                Some(p) => format!("{}[{}; {}]", self.buffer(*buffer), self.list(indices), self.expr(p)),
                None => format!("{}[{}]", self.buffer(*buffer), self.list(indices)),
            },
            Expr::Ramp {
                base,
                stride,
                lanes,
            } => format!("ramp({}, {}, {lanes})", self.expr(base), self.expr(stride)),
            Expr::Broadcast { value, lanes } => format!("bcast({}, {lanes})", self.expr(value)),
            Expr::Cast { value, dtype } => format!("cast<{dtype}>({})", self.expr(value)),
            Expr::Reinterpret { value, dtype } => {
                format!("reinterpret<{dtype}>({})", self.expr(value))
            }
            Expr::Mask(Mask::Const(bits)) => {
                let bits: String = bits.iter().map(|&b| if b { '1' } else { '0' }).collect();
                format!("mask[{bits}]")
            }
            Expr::Mask(Mask::Tail { active, lanes }) => {
                format!("tail_mask({}, {lanes})", self.expr(active))
            }
            Expr::Call {
                intrinsic, args, ..
            } => format!("{intrinsic}({})", self.list(args)),
            Expr::Address { buffer, offset } => {
                format!("&{}[+{}]", self.buffer(*buffer), self.expr(offset))
            }
            Expr::Isa(inst) => {
                let mut s = format!("{}.{}({})", inst.opcode, inst.dtype, self.list(&inst.args));
                if let Some(mask) = &inst.mask {
                    let _ = write!(s, " @ {}", self.expr(mask));
                }
                s
            }
        }
    }

    fn stmt(&self, out: &mut String, stmt: &Stmt, indent: usize) {
        let pad = " ".repeat(indent);
        match stmt {
            Stmt::Seq(stmts) => {
                for s in stmts {
                    self.stmt(out, s, indent);
                }
            }
            Stmt::For(l) => {
                let mut attrs = String::new();
                if l.kind == ForKind::Vectorized {
                    attrs.push_str(" vectorized");
                }
                if l.likely {
                    attrs.push_str(" likely");
                }
                match l.partition {
                    Some(PartitionRole::Main) => attrs.push_str(" main"),
                    Some(PartitionRole::Tail) => attrs.push_str(" tail"),
                    None => {}
                }
                let _ = writeln!(
                    out,
                    "{pad}for {}: {} in ({}, {}){attrs} {{",
                    l.var.name,
                    l.var.dtype,
                    self.expr(&l.min),
                    self.expr(&l.extent)
                );
                self.stmt(out, &l.body, indent + 2);
                let _ = writeln!(out, "{pad}}}");
            }
            Stmt::If {
                condition,
                then_case,
                else_case,
            } => {
                let _ = writeln!(out, "{pad}if {} {{", self.expr(condition));
                self.stmt(out, then_case, indent + 2);
                if let Some(else_case) = else_case {
                    let _ = writeln!(out, "{pad}}} else {{");
                    self.stmt(out, else_case, indent + 2);
                }
                let _ = writeln!(out, "{pad}}}");
            }
            Stmt::Let { var, value, body } => {
                let _ = writeln!(out, "{pad}let {}: {} = {}", var.name, var.dtype, self.expr(value));
                self.stmt(out, body, indent);
            }
            Stmt::Store {
                buffer,
                indices,
                value,
                predicate,
            } => {
                let target = format!("{}[{}]", self.buffer(*buffer), self.list(indices));
                match predicate {
                    Some(p) => {
                        let _ = writeln!(out, "{pad}{target} = {} @ {}", self.expr(value), self.expr(p));
                    }
                    None => {
                        let _ = writeln!(out, "{pad}{target} = {}", self.expr(value));
                    }
                }
            }
            Stmt::Dma(dma) => {
                let dims: Vec<_> = dma
                    .dims
                    .iter()
                    .map(|d| {
                        format!(
                            "{}:{}/{}",
                            self.expr(&d.length),
                            self.expr(&d.src_stride),
                            self.expr(&d.dst_stride)
                        )
                    })
                    .collect();
                let _ = writeln!(
                    out,
                    "{pad}dma {} &{}[+{}] -> &{}[+{}] dims [{}] elem {}",
                    self.event(dma.event),
                    self.buffer(dma.src.buffer),
                    self.expr(&dma.src.offset),
                    self.buffer(dma.dst.buffer),
                    self.expr(&dma.dst.offset),
                    dims.join(", "),
                    dma.elem_bytes
                );
            }
            Stmt::Wait(e) => {
                let _ = writeln!(out, "{pad}wait {}", self.event(*e));
            }
            Stmt::Signal(e) => {
                let _ = writeln!(out, "{pad}signal {}", self.event(*e));
            }
            Stmt::Evaluate(e) => {
                let _ = writeln!(out, "{pad}{}", self.expr(e));
            }
        }
    }
}

fn format_buffer(buf: &Buffer) -> String {
    let shape: Vec<_> = buf
        .shape
        .iter()
        .map(|d| match d {
            Dim::Fixed(n) => n.to_string(),
            Dim::Size(v) => v.name.clone(),
        })
        .collect();
    let mut s = format!("{} {}: {}[{}]", buf.space, buf.name, buf.dtype, shape.join(", "));
    if let Some(strides) = &buf.strides {
        let p = Printer::default();
        let _ = write!(s, " strides({})", p.list(strides));
    }
    if let Some(layout) = &buf.layout {
        let _ = write!(s, " {layout}");
    }
    s
}

/// Renders a function as text.
pub fn dump_function(func: &Function) -> String {
    let mut out = String::new();
    let p = Printer::for_function(func);
    let params: Vec<_> = func
        .params
        .iter()
        .map(|param| match param {
            Param::Scalar(v) => format!("{}: {}", v.name, v.dtype),
            Param::Buffer(h) => p.buffer(*h),
        })
        .collect();
    let _ = writeln!(out, "fn {}({}) {{", func.name, params.join(", "));

    for (handle, buf) in func.buffers.iter() {
        let _ = writeln!(out, "  buffer {handle:?} {}", format_buffer(buf));
    }
    for (handle, ev) in func.events.iter() {
        let slot = func
            .event_state
            .as_ref()
            .and_then(|s| s.slots.get(handle.index()));
        match slot {
            Some(slot) => {
                let _ = writeln!(
                    out,
                    "  event {handle:?} {} queue {} slot {}",
                    ev.name, slot.queue, slot.slot
                );
            }
            None => {
                let _ = writeln!(out, "  event {handle:?} {}", ev.name);
            }
        }
    }

    p.stmt(&mut out, &func.body, 2);
    out.push_str("}\n");
    out
}

/// Renders a whole module as text.
pub fn dump_module(module: &Module) -> String {
    let mut out = format!("// properties: {}\n", module.properties);
    for func in module.functions.values() {
        out.push('\n');
        out.push_str(&dump_function(func));
    }
    out
}
