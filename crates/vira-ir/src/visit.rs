//! Traversal and rewriting helpers shared by every pass.

use std::collections::HashSet;
use std::fmt;

use crate::arena::Handle;
use crate::buffer::Buffer;
use crate::expr::{Expr, Mask, Opcode, Var};
use crate::stmt::Stmt;

/// Position of a statement inside a function body, as child indices from the
/// root (`Seq` element index, `0` for loop/let bodies and then-branches, `1`
/// for else-branches).
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq)]
pub struct StmtPath(Vec<u32>);

impl StmtPath {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, index: u32) {
        self.0.push(index);
    }

    pub fn pop(&mut self) {
        self.0.pop();
    }

    pub fn indices(&self) -> &[u32] {
        &self.0
    }
}

impl fmt::Display for StmtPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("body")?;
        for i in &self.0 {
            write!(f, "/{i}")?;
        }
        Ok(())
    }
}

impl Expr {
    /// Immediate sub-expressions, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Self::Var(_) | Self::Literal(_) => Vec::new(),
            Self::Unary { operand, .. } => vec![operand],
            Self::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Self::Select {
                condition,
                accept,
                reject,
            } => vec![condition, accept, reject],
            Self::Load {
                indices, predicate, ..
            } => indices.iter().chain(predicate.as_deref()).collect(),
            Self::Ramp { base, stride, .. } => vec![base, stride],
            Self::Broadcast { value, .. }
            | Self::Cast { value, .. }
            | Self::Reinterpret { value, .. } => vec![value],
            Self::Mask(Mask::Const(_)) => Vec::new(),
            Self::Mask(Mask::Tail { active, .. }) => vec![active],
            Self::Call { args, .. } => args.iter().collect(),
            Self::Address { offset, .. } => vec![offset],
            Self::Isa(inst) => inst.args.iter().chain(inst.mask.as_ref()).collect(),
        }
    }

    /// Mutable immediate sub-expressions, in evaluation order.
    pub fn children_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Self::Var(_) | Self::Literal(_) => Vec::new(),
            Self::Unary { operand, .. } => vec![operand],
            Self::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Self::Select {
                condition,
                accept,
                reject,
            } => vec![condition, accept, reject],
            Self::Load {
                indices, predicate, ..
            } => indices.iter_mut().chain(predicate.as_deref_mut()).collect(),
            Self::Ramp { base, stride, .. } => vec![base, stride],
            Self::Broadcast { value, .. }
            | Self::Cast { value, .. }
            | Self::Reinterpret { value, .. } => vec![value],
            Self::Mask(Mask::Const(_)) => Vec::new(),
            Self::Mask(Mask::Tail { active, .. }) => vec![active],
            Self::Call { args, .. } => args.iter_mut().collect(),
            Self::Address { offset, .. } => vec![offset],
            Self::Isa(inst) => {
                let inst = &mut **inst;
                inst.args.iter_mut().chain(inst.mask.as_mut()).collect()
            }
        }
    }

    /// Pre-order walk over this expression and all sub-expressions.
    pub fn visit(&self, f: &mut dyn FnMut(&Expr)) {
        f(self);
        for child in self.children() {
            child.visit(f);
        }
    }

    /// Returns `true` if any sub-expression (including `self`) satisfies `pred`.
    pub fn any(&self, pred: &mut dyn FnMut(&Expr) -> bool) -> bool {
        pred(self) || self.children().into_iter().any(|c| c.any(pred))
    }

    /// Rebuilds the tree bottom-up, applying `f` to every node after its
    /// children have been rewritten.
    pub fn transform(self, f: &mut dyn FnMut(Expr) -> Expr) -> Expr {
        let mut this = self;
        for child in this.children_mut() {
            let old = std::mem::replace(child, Expr::bool(false));
            *child = old.transform(f);
        }
        f(this)
    }

    /// Fallible form of [`Expr::transform`].
    pub fn try_transform<E>(
        self,
        f: &mut dyn FnMut(Expr) -> Result<Expr, E>,
    ) -> Result<Expr, E> {
        let mut this = self;
        for child in this.children_mut() {
            let old = std::mem::replace(child, Expr::bool(false));
            *child = old.try_transform(f)?;
        }
        f(this)
    }

    /// Replaces every use of `var` with `replacement`.
    pub fn substitute(self, var: &Var, replacement: &Expr) -> Expr {
        self.transform(&mut |e| match e {
            Expr::Var(v) if v.same(var) => replacement.clone(),
            other => other,
        })
    }

    pub fn uses_var(&self, var: &Var) -> bool {
        self.any(&mut |e| e.is_var(var))
    }
}

impl Stmt {
    /// Expressions held directly by this statement.
    pub fn exprs(&self) -> Vec<&Expr> {
        match self {
            Self::Seq(_) | Self::Wait(_) | Self::Signal(_) => Vec::new(),
            Self::For(l) => vec![&l.min, &l.extent],
            Self::If { condition, .. } => vec![condition],
            Self::Let { value, .. } => vec![value],
            Self::Store {
                indices,
                value,
                predicate,
                ..
            } => indices
                .iter()
                .chain(std::iter::once(value))
                .chain(predicate.as_ref())
                .collect(),
            Self::Dma(dma) => {
                let mut out = vec![&dma.src.offset, &dma.dst.offset];
                for dim in &dma.dims {
                    out.extend([&dim.length, &dim.src_stride, &dim.dst_stride]);
                }
                out
            }
            Self::Evaluate(e) => vec![e],
        }
    }

    /// Mutable expressions held directly by this statement.
    pub fn exprs_mut(&mut self) -> Vec<&mut Expr> {
        match self {
            Self::Seq(_) | Self::Wait(_) | Self::Signal(_) => Vec::new(),
            Self::For(l) => vec![&mut l.min, &mut l.extent],
            Self::If { condition, .. } => vec![condition],
            Self::Let { value, .. } => vec![value],
            Self::Store {
                indices,
                value,
                predicate,
                ..
            } => indices
                .iter_mut()
                .chain(std::iter::once(value))
                .chain(predicate.as_mut())
                .collect(),
            Self::Dma(dma) => {
                let mut out = vec![&mut dma.src.offset, &mut dma.dst.offset];
                for dim in &mut dma.dims {
                    out.push(&mut dim.length);
                    out.push(&mut dim.src_stride);
                    out.push(&mut dim.dst_stride);
                }
                out
            }
            Self::Evaluate(e) => vec![e],
        }
    }

    /// Nested statements.
    pub fn children(&self) -> Vec<&Stmt> {
        match self {
            Self::Seq(stmts) => stmts.iter().collect(),
            Self::For(l) => vec![&l.body],
            Self::If {
                then_case,
                else_case,
                ..
            } => std::iter::once(&**then_case)
                .chain(else_case.as_deref())
                .collect(),
            Self::Let { body, .. } => vec![body],
            _ => Vec::new(),
        }
    }

    /// Mutable nested statements.
    pub fn children_mut(&mut self) -> Vec<&mut Stmt> {
        match self {
            Self::Seq(stmts) => stmts.iter_mut().collect(),
            Self::For(l) => vec![&mut l.body],
            Self::If {
                then_case,
                else_case,
                ..
            } => std::iter::once(&mut **then_case)
                .chain(else_case.as_deref_mut())
                .collect(),
            Self::Let { body, .. } => vec![body],
            _ => Vec::new(),
        }
    }

    /// Pre-order walk with the path of every statement.
    pub fn walk<E>(
        &self,
        path: &mut StmtPath,
        f: &mut dyn FnMut(&Stmt, &StmtPath) -> Result<(), E>,
    ) -> Result<(), E> {
        f(self, path)?;
        for (i, child) in self.children().into_iter().enumerate() {
            path.push(i as u32);
            let res = child.walk(path, f);
            path.pop();
            res?;
        }
        Ok(())
    }

    /// Rebuilds the tree bottom-up, applying `f` to every statement after its
    /// nested statements have been rewritten.
    pub fn try_transform<E>(
        self,
        path: &mut StmtPath,
        f: &mut dyn FnMut(Stmt, &StmtPath) -> Result<Stmt, E>,
    ) -> Result<Stmt, E> {
        let mut this = self;
        for (i, child) in this.children_mut().into_iter().enumerate() {
            path.push(i as u32);
            let old = std::mem::replace(child, Stmt::empty());
            let res = old.try_transform(path, f);
            path.pop();
            *child = res?;
        }
        f(this, path)
    }

    /// Infallible form of [`Stmt::try_transform`].
    pub fn transform(self, f: &mut dyn FnMut(Stmt) -> Stmt) -> Stmt {
        let mut this = self;
        for child in this.children_mut() {
            let old = std::mem::replace(child, Stmt::empty());
            *child = old.transform(f);
        }
        f(this)
    }

    /// Applies `f` to every top-level expression of every statement.
    pub fn try_map_exprs<E>(
        self,
        path: &mut StmtPath,
        f: &mut dyn FnMut(Expr, &StmtPath) -> Result<Expr, E>,
    ) -> Result<Stmt, E> {
        self.try_transform(path, &mut |mut stmt, path| {
            for e in stmt.exprs_mut() {
                let old = std::mem::replace(e, Expr::bool(false));
                *e = f(old, path)?;
            }
            Ok(stmt)
        })
    }

    /// Infallible form of [`Stmt::try_map_exprs`].
    pub fn map_exprs(self, f: &mut dyn FnMut(Expr) -> Expr) -> Stmt {
        self.transform(&mut |mut stmt| {
            for e in stmt.exprs_mut() {
                let old = std::mem::replace(e, Expr::bool(false));
                *e = f(old);
            }
            stmt
        })
    }

    /// Calls `f` on every top-level expression of every statement.
    pub fn visit_exprs(&self, f: &mut dyn FnMut(&Expr)) {
        for e in self.exprs() {
            f(e);
        }
        for child in self.children() {
            child.visit_exprs(f);
        }
    }

    /// Replaces every use of `var` with `replacement`.
    pub fn substitute(self, var: &Var, replacement: &Expr) -> Stmt {
        self.map_exprs(&mut |e| e.substitute(var, replacement))
    }

    pub fn uses_var(&self, var: &Var) -> bool {
        let mut used = false;
        self.visit_exprs(&mut |e| used |= e.uses_var(var));
        used
    }

    /// Buffers read and written anywhere inside this statement.
    pub fn buffer_effects(&self) -> BufferEffects {
        let mut effects = BufferEffects::default();
        effects.collect_stmt(self);
        effects
    }
}

/// Buffers read and written by a piece of IR.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BufferEffects {
    pub reads: HashSet<Handle<Buffer>>,
    pub writes: HashSet<Handle<Buffer>>,
}

impl BufferEffects {
    pub fn touches(&self, buffer: Handle<Buffer>) -> bool {
        self.reads.contains(&buffer) || self.writes.contains(&buffer)
    }

    /// Returns `true` if one side writes a buffer the other side touches.
    pub fn conflicts_with(&self, other: &BufferEffects) -> bool {
        self.writes.iter().any(|b| other.touches(*b))
            || other.writes.iter().any(|b| self.touches(*b))
    }

    fn collect_stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Store { buffer, .. } => {
                self.writes.insert(*buffer);
            }
            Stmt::Dma(dma) => {
                self.reads.insert(dma.src.buffer);
                self.writes.insert(dma.dst.buffer);
            }
            _ => {}
        }
        for e in stmt.exprs() {
            self.collect_expr(e);
        }
        for child in stmt.children() {
            self.collect_stmt(child);
        }
    }

    fn collect_expr(&mut self, expr: &Expr) {
        expr.visit(&mut |e| match e {
            Expr::Load { buffer, .. } => {
                self.reads.insert(*buffer);
            }
            Expr::Isa(inst) if inst.opcode.is_store() => {
                if let Some(Expr::Address { buffer, .. }) = inst.args.first() {
                    self.writes.insert(*buffer);
                }
            }
            Expr::Isa(inst) if inst.opcode.is_load() => {
                if let Some(Expr::Address { buffer, .. }) = inst.args.first() {
                    self.reads.insert(*buffer);
                }
            }
            _ => {}
        });
    }
}

/// Returns `true` if the expression is an instruction of the given opcode.
pub fn is_opcode(expr: &Expr, opcode: Opcode) -> bool {
    matches!(expr, Expr::Isa(inst) if inst.opcode == opcode)
}
