//! Structural validation.
//!
//! Checks that every handle points into its arena, that no type, ramp,
//! broadcast or mask has zero lanes, and that buffer definitions and event
//! tables are self-consistent. Runs before any pass touches a module.

use crate::arena::Handle;
use crate::buffer::{Buffer, Event};
use crate::error::IrError;
use crate::expr::{Expr, Mask};
use crate::func::{Function, Param};
use crate::stmt::Stmt;
use crate::visit::StmtPath;
use crate::{DataType, Module};

/// Validates every function of a module, stopping at the first problem.
pub fn validate_module(module: &Module) -> Result<(), IrError> {
    for (key, func) in &module.functions {
        if *key != func.name {
            return Err(IrError::NameMismatch {
                key: key.clone(),
                name: func.name.clone(),
            });
        }
        validate_function(func)?;
    }
    Ok(())
}

/// Validates a single function.
pub fn validate_function(func: &Function) -> Result<(), IrError> {
    let ctx = Checker { func };

    for (_, buf) in func.buffers.iter() {
        ctx.check_buffer(buf)?;
    }
    for param in &func.params {
        match param {
            Param::Buffer(h) => ctx.buffer(*h, &StmtPath::root())?,
            Param::Scalar(v) => ctx.lanes(v.dtype, "parameter type", &StmtPath::root())?,
        }
    }
    if let Some(state) = &func.event_state {
        if state.slots.len() != func.events.len() {
            return Err(IrError::EventTableSize {
                function: func.name.clone(),
                expected: func.events.len(),
                found: state.slots.len(),
            });
        }
    }

    func.body
        .walk(&mut StmtPath::root(), &mut |stmt, path| ctx.check_stmt(stmt, path))
}

struct Checker<'a> {
    func: &'a Function,
}

impl Checker<'_> {
    fn check_buffer(&self, buf: &Buffer) -> Result<(), IrError> {
        let bad = |message: String| IrError::BadBuffer {
            function: self.func.name.clone(),
            buffer: buf.name.clone(),
            message,
        };
        if buf.dtype.lanes != 1 {
            return Err(bad(format!("element type has {} lanes", buf.dtype.lanes)));
        }
        if buf.dtype.is_void() || buf.dtype.scalar.width == 0 {
            return Err(bad("element type has no width".into()));
        }
        if let Some(strides) = &buf.strides {
            if strides.len() != buf.rank() {
                return Err(bad(format!(
                    "{} strides for rank {}",
                    strides.len(),
                    buf.rank()
                )));
            }
        }
        if let Some(layout) = &buf.layout {
            if layout.dim_order(buf.rank()).is_none() {
                return Err(bad(format!("layout {layout:?} does not fit rank {}", buf.rank())));
            }
        }
        Ok(())
    }

    fn buffer(&self, h: Handle<Buffer>, path: &StmtPath) -> Result<(), IrError> {
        if self.func.buffers.try_get(h).is_some() {
            return Ok(());
        }
        Err(IrError::BadHandle {
            function: self.func.name.clone(),
            path: path.to_string(),
            kind: "buffer",
            index: h.index(),
            size: self.func.buffers.len(),
        })
    }

    fn event(&self, h: Handle<Event>, path: &StmtPath) -> Result<(), IrError> {
        if self.func.events.try_get(h).is_some() {
            return Ok(());
        }
        Err(IrError::BadHandle {
            function: self.func.name.clone(),
            path: path.to_string(),
            kind: "event",
            index: h.index(),
            size: self.func.events.len(),
        })
    }

    fn lanes(&self, dtype: DataType, what: &'static str, path: &StmtPath) -> Result<(), IrError> {
        self.nonzero(dtype.lanes, what, path)
    }

    fn nonzero(&self, lanes: u16, what: &'static str, path: &StmtPath) -> Result<(), IrError> {
        if lanes > 0 {
            return Ok(());
        }
        Err(IrError::ZeroLanes {
            function: self.func.name.clone(),
            path: path.to_string(),
            what,
        })
    }

    fn check_stmt(&self, stmt: &Stmt, path: &StmtPath) -> Result<(), IrError> {
        match stmt {
            Stmt::For(l) => self.lanes(l.var.dtype, "loop variable", path)?,
            Stmt::Let { var, .. } => self.lanes(var.dtype, "let variable", path)?,
            Stmt::Store { buffer, .. } => self.buffer(*buffer, path)?,
            Stmt::Dma(dma) => {
                self.buffer(dma.src.buffer, path)?;
                self.buffer(dma.dst.buffer, path)?;
                self.event(dma.event, path)?;
            }
            Stmt::Wait(e) | Stmt::Signal(e) => self.event(*e, path)?,
            _ => {}
        }
        for expr in stmt.exprs() {
            self.check_expr(expr, path)?;
        }
        Ok(())
    }

    fn check_expr(&self, expr: &Expr, path: &StmtPath) -> Result<(), IrError> {
        match expr {
            Expr::Var(v) => self.lanes(v.dtype, "variable", path)?,
            Expr::Load { buffer, dtype, .. } => {
                self.buffer(*buffer, path)?;
                self.lanes(*dtype, "load", path)?;
            }
            Expr::Address { buffer, .. } => self.buffer(*buffer, path)?,
            Expr::Ramp { lanes, .. } => self.nonzero(*lanes, "ramp", path)?,
            Expr::Broadcast { lanes, .. } => self.nonzero(*lanes, "broadcast", path)?,
            Expr::Cast { dtype, .. } | Expr::Reinterpret { dtype, .. } => {
                self.lanes(*dtype, "cast", path)?
            }
            Expr::Call { dtype, .. } => self.lanes(*dtype, "call", path)?,
            Expr::Mask(Mask::Const(bits)) => self.nonzero(bits.len() as u16, "mask", path)?,
            Expr::Mask(Mask::Tail { lanes, .. }) => self.nonzero(*lanes, "mask", path)?,
            Expr::Isa(inst) => self.lanes(inst.dtype, "instruction", path)?,
            _ => {}
        }
        for child in expr.children() {
            self.check_expr(child, path)?;
        }
        Ok(())
    }
}
