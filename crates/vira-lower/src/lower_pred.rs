//! Lower-pred pass: predicates into the mask forms the hardware has.
//!
//! - `ramp(b, 1, L) < bcast(n)` becomes a tail mask of `n - b` active lanes
//!   (`<=` gives `n - b + 1`), mirrored comparisons likewise
//! - broadcast bool literals become constant masks
//! - scalar predicates on vector operations are broadcast
//! - conditionals on a vector condition become predicated stores

use vira_ir::{BinaryOp, Expr, Function, Literal, Mask, PropertySet, Stmt, StmtPath, Var};

use crate::util::{add, broadcast_to, is_pure, sub};
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct LowerPred;

impl Pass for LowerPred {
    fn name(&self) -> &'static str {
        "lower-pred"
    }

    fn requires(&self) -> PropertySet {
        PropertySet::LOOPS_PARTITIONED
    }

    fn establishes(&self) -> PropertySet {
        PropertySet::PREDICATES_LOWERED
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        let body = body.try_transform(&mut StmtPath::root(), &mut |stmt, path| match stmt {
            Stmt::If {
                condition,
                then_case,
                else_case,
            } if condition.lanes() > 1 => if_to_predicates(condition, *then_case, else_case.map(|e| *e), path, cx),
            other => Ok(other),
        })?;
        func.body = body.map_exprs(&mut lower_loads).transform(&mut |stmt| match stmt {
            Stmt::Store {
                buffer,
                indices,
                value,
                predicate: Some(p),
            } => {
                let lanes = indices.iter().map(Expr::lanes).fold(value.lanes(), u16::max);
                Stmt::Store {
                    buffer,
                    indices,
                    value,
                    predicate: Some(lower_predicate(p, lanes)),
                }
            }
            other => other,
        });
        Ok(func)
    }
}

fn lower_loads(e: Expr) -> Expr {
    e.transform(&mut |e| match e {
        Expr::Load {
            buffer,
            indices,
            predicate: Some(p),
            dtype,
        } => Expr::Load {
            buffer,
            indices,
            predicate: Some(Box::new(lower_predicate(*p, dtype.lanes))),
            dtype,
        },
        other => other,
    })
}

/// Lowers a predicate guarding an operation of `lanes` lanes.
pub(crate) fn lower_predicate(p: Expr, lanes: u16) -> Expr {
    broadcast_to(p, lanes).transform(&mut to_mask)
}

fn to_mask(e: Expr) -> Expr {
    use BinaryOp as B;
    match e {
        Expr::Broadcast { value, lanes } => match *value {
            Expr::Literal(Literal::Bool(b)) => Expr::Mask(Mask::Const(vec![b; usize::from(lanes)])),
            value => Expr::broadcast(value, lanes),
        },
        Expr::Binary { op, lhs, rhs } => {
            let (ramp, bound, inclusive) = match op {
                B::Lt => (&*lhs, &*rhs, false),
                B::Le => (&*lhs, &*rhs, true),
                B::Gt => (&*rhs, &*lhs, false),
                B::Ge => (&*rhs, &*lhs, true),
                _ => return Expr::Binary { op, lhs, rhs },
            };
            match tail_count(ramp, bound, inclusive) {
                Some(mask) => Expr::Mask(mask),
                None => Expr::Binary { op, lhs, rhs },
            }
        }
        other => other,
    }
}

/// `ramp(b, 1, L) < bcast(n)` as a tail mask.
fn tail_count(ramp: &Expr, bound: &Expr, inclusive: bool) -> Option<Mask> {
    let Expr::Ramp {
        base,
        stride,
        lanes,
    } = ramp
    else {
        return None;
    };
    let Expr::Broadcast { value: n, lanes: m } = bound else {
        return None;
    };
    if stride.as_int() != Some(1) || lanes != m || base.lanes() != 1 || n.lanes() != 1 {
        return None;
    }
    if base.dtype().scalar != n.dtype().scalar || !n.dtype().scalar.is_int() {
        return None;
    }
    let mut active = sub((**n).clone(), (**base).clone());
    if inclusive {
        active = add(active, Expr::typed_const(1, n.dtype()));
    }
    Some(Mask::Tail {
        active: Box::new(active),
        lanes: *lanes,
    })
}

/// Turns `if (c) { then } else { other }` with a vector `c` into stores
/// predicated by `c` and `!c`.
fn if_to_predicates(
    condition: Expr,
    then_case: Stmt,
    else_case: Option<Stmt>,
    path: &StmtPath,
    cx: &PassContext<'_>,
) -> Result<Stmt, LoweringError> {
    let lanes = condition.lanes();
    let reads_memory = condition.any(&mut |e| matches!(e, Expr::Load { .. }));
    let (binding, cond) = if reads_memory || !is_pure(&condition) {
        let var = Var::new("cond", condition.dtype());
        let use_ = Expr::var(&var);
        (Some((var, condition)), use_)
    } else {
        (None, condition)
    };

    let mut parts = vec![guard(then_case, &cond, lanes, path, cx)?];
    if let Some(else_case) = else_case {
        parts.push(guard(else_case, &Expr::not(cond), lanes, path, cx)?);
    }
    let body = Stmt::Seq(parts);
    Ok(match binding {
        Some((var, value)) => Stmt::let_(var, value, body),
        None => body,
    })
}

/// Adds `cond` to the predicate of every vector access in `stmt`.
fn guard(
    stmt: Stmt,
    cond: &Expr,
    lanes: u16,
    path: &StmtPath,
    cx: &PassContext<'_>,
) -> Result<Stmt, LoweringError> {
    let combine = |existing: Option<Expr>| match existing {
        Some(p) => Expr::and(p, cond.clone()),
        None => cond.clone(),
    };
    stmt.try_transform(&mut path.clone(), &mut |s, path| match s {
        Stmt::For(_) | Stmt::Dma(_) | Stmt::Wait(_) | Stmt::Signal(_) => Err(cx.unsupported(
            path,
            "loop or DMA under a vector condition",
        )),
        Stmt::Evaluate(e) if !is_pure(&e) => Err(cx.unsupported(
            path,
            "side effect under a vector condition",
        )),
        Stmt::Store {
            buffer,
            indices,
            value,
            predicate,
        } => {
            let n = indices.iter().map(Expr::lanes).fold(value.lanes(), u16::max);
            if n != lanes {
                return Err(cx.unsupported(
                    path,
                    format!("{n}-lane store under a {lanes}-lane condition"),
                ));
            }
            Ok(Stmt::Store {
                buffer,
                indices,
                value: guard_loads(value, cond, lanes),
                predicate: Some(combine(predicate)),
            })
        }
        Stmt::Let { var, value, body } => Ok(Stmt::Let {
            var,
            value: guard_loads(value, cond, lanes),
            body,
        }),
        other => Ok(other),
    })
}

fn guard_loads(e: Expr, cond: &Expr, lanes: u16) -> Expr {
    e.transform(&mut |e| match e {
        Expr::Load {
            buffer,
            indices,
            predicate,
            dtype,
        } if dtype.lanes == lanes => Expr::Load {
            buffer,
            indices,
            predicate: Some(Box::new(match predicate {
                Some(p) => Expr::and(*p, cond.clone()),
                None => cond.clone(),
            })),
            dtype,
        },
        other => other,
    })
}
