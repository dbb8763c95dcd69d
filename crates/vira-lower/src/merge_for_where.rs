//! Merge-for-where pass: fuses adjacent loops with identical iteration
//! spaces and adjacent conditionals with identical predicates.

use vira_ir::{Expr, Function, Loop, Stmt};

use crate::util::{is_pure, seq};
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct MergeForWhere;

impl Pass for MergeForWhere {
    fn name(&self) -> &'static str {
        "merge-for-where"
    }

    fn run_on_function(
        &self,
        mut func: Function,
        _cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let mut merged = 0;
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        func.body = body.transform(&mut |stmt| match stmt {
            Stmt::Seq(stmts) => seq(merge_block(stmts, &mut merged)),
            other => other,
        });
        if merged > 0 {
            log::debug!("`{}`: merged {merged} statement pairs", func.name);
        }
        Ok(func)
    }
}

fn merge_block(stmts: Vec<Stmt>, merged: &mut usize) -> Vec<Stmt> {
    let mut out: Vec<Stmt> = Vec::with_capacity(stmts.len());
    for stmt in stmts.into_iter().flat_map(Stmt::into_flat) {
        match out.pop() {
            Some(prev) => match merge_pair(prev, stmt, merged) {
                Ok(fused) => out.push(fused),
                Err((prev, stmt)) => out.extend([prev, stmt]),
            },
            None => out.push(stmt),
        }
    }
    out
}

/// Fuses `first; second` into one statement, or hands both back.
fn merge_pair(first: Stmt, second: Stmt, merged: &mut usize) -> Result<Stmt, (Stmt, Stmt)> {
    if has_ordering_effects(&first) || has_ordering_effects(&second) {
        return Err((first, second));
    }
    match (first, second) {
        (Stmt::For(a), Stmt::For(b)) if same_space(&a, &b) && loops_commute(&a, &b) => {
            *merged += 1;
            let Loop { var, body, .. } = b;
            let renamed = body.substitute(&var, &Expr::var(&a.var));
            let inner = merge_block(vec![*a.body, renamed], merged);
            Ok(Stmt::For(Loop {
                body: Box::new(seq(inner)),
                ..a
            }))
        }
        (
            Stmt::If {
                condition,
                then_case,
                else_case,
            },
            Stmt::If {
                condition: c2,
                then_case: t2,
                else_case: e2,
            },
        ) if condition == c2 && condition_survives(&condition, &then_case, else_case.as_deref()) => {
            *merged += 1;
            let then_case = seq(merge_block(vec![*then_case, *t2], merged));
            let else_case = match (else_case, e2) {
                (None, None) => None,
                (e1, e2) => {
                    let stmts = e1.into_iter().chain(e2).map(|s| *s).collect();
                    Some(Box::new(seq(merge_block(stmts, merged))))
                }
            };
            Ok(Stmt::If {
                condition,
                then_case: Box::new(then_case),
                else_case,
            })
        }
        (first, second) => Err((first, second)),
    }
}

fn same_space(a: &Loop, b: &Loop) -> bool {
    a.min == b.min
        && a.extent == b.extent
        && a.kind == b.kind
        && a.likely == b.likely
        && a.partition == b.partition
}

/// Interleaving the iterations of `a` and `b` keeps every buffer access in
/// order, and the header of `b` sees the same values after `a` has run.
fn loops_commute(a: &Loop, b: &Loop) -> bool {
    let ea = a.body.buffer_effects();
    let eb = b.body.buffer_effects();
    let header = Stmt::seq(vec![
        Stmt::Evaluate(b.min.clone()),
        Stmt::Evaluate(b.extent.clone()),
    ])
    .buffer_effects();
    is_pure(&b.min)
        && is_pure(&b.extent)
        && !ea.conflicts_with(&eb)
        && !header.reads.iter().any(|buf| ea.writes.contains(buf))
}

/// The predicate reads nothing the first conditional writes.
fn condition_survives(condition: &Expr, then_case: &Stmt, else_case: Option<&Stmt>) -> bool {
    let reads = Stmt::Evaluate(condition.clone()).buffer_effects().reads;
    let writes = |s: &Stmt| s.buffer_effects().writes;
    let written = else_case.map(writes).unwrap_or_default();
    is_pure(condition)
        && !reads
            .iter()
            .any(|b| written.contains(b) || writes(then_case).contains(b))
}

/// DMA, events and side-effecting intrinsics pin a statement in place.
fn has_ordering_effects(stmt: &Stmt) -> bool {
    let mut pinned = false;
    let _ = stmt.walk::<()>(&mut vira_ir::StmtPath::root(), &mut |s, _| {
        pinned |= matches!(s, Stmt::Dma(_) | Stmt::Wait(_) | Stmt::Signal(_));
        Ok(())
    });
    stmt.visit_exprs(&mut |e| {
        pinned |= e.any(&mut |e| {
            matches!(e, Expr::Call { intrinsic, .. } if intrinsic.has_side_effects())
        });
    });
    pinned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::run_pass;
    use vira_ir::eval::{Interpreter, Lane};
    use vira_ir::{AddressSpace, Buffer, DataType, Handle, Intrinsic, Var};

    struct Kernel {
        func: Function,
        a: Handle<Buffer>,
        b: Handle<Buffer>,
        c: Handle<Buffer>,
    }

    fn kernel() -> Kernel {
        let mut func = Function::new("k");
        let mut add = |name: &str| {
            func.add_buffer_param(Buffer::fixed(name, DataType::I32, &[8], AddressSpace::Local))
        };
        let (a, b, c) = (add("a"), add("b"), add("c"));
        Kernel { func, a, b, c }
    }

    /// `for i in 0..8 { dst[i] = src[i] + k }`
    fn copy_loop(dst: Handle<Buffer>, src: Handle<Buffer>, k: i64) -> Stmt {
        let i = Var::new("i", DataType::I32);
        let value = Expr::add(Expr::load(src, vec![Expr::var(&i)], DataType::I32), Expr::i32(k));
        Stmt::For(Loop::serial(
            i.clone(),
            Expr::i32(0),
            Expr::i32(8),
            Stmt::store(dst, vec![Expr::var(&i)], value),
        ))
    }

    fn run(func: &Function) -> Vec<Vec<Lane>> {
        let mut interp = Interpreter::new(func);
        interp.set_buffer("a", (0..8).map(Lane::Int).collect());
        interp.set_buffer("b", vec![Lane::Int(0); 8]);
        interp.set_buffer("c", vec![Lane::Int(0); 8]);
        interp.run().unwrap();
        ["a", "b", "c"]
            .iter()
            .map(|n| interp.buffer(n).unwrap().to_vec())
            .collect()
    }

    fn loops(stmt: &Stmt) -> usize {
        let mut n = 0;
        let _ = stmt.walk::<()>(&mut vira_ir::StmtPath::root(), &mut |s, _| {
            n += usize::from(matches!(s, Stmt::For(_)));
            Ok(())
        });
        n
    }

    #[test]
    fn independent_loops_merge() {
        let Kernel { mut func, a, b, c } = kernel();
        func.body = Stmt::seq(vec![copy_loop(b, a, 1), copy_loop(c, a, 2)]);
        let out = run_pass(&MergeForWhere, func.clone()).unwrap();
        assert_eq!(loops(&out.body), 1);
        assert_eq!(run(&func), run(&out));
    }

    #[test]
    fn dependent_loops_stay_apart() {
        let Kernel { mut func, a, b, c } = kernel();
        // The second loop reads what the first writes.
        func.body = Stmt::seq(vec![copy_loop(b, a, 1), copy_loop(c, b, 2)]);
        let out = run_pass(&MergeForWhere, func).unwrap();
        assert_eq!(loops(&out.body), 2);
    }

    #[test]
    fn different_bounds_stay_apart() {
        let Kernel { mut func, a, b, c } = kernel();
        let Stmt::For(mut short) = copy_loop(c, a, 2) else {
            unreachable!()
        };
        short.extent = Expr::i32(4);
        func.body = Stmt::seq(vec![copy_loop(b, a, 1), Stmt::For(short)]);
        let out = run_pass(&MergeForWhere, func).unwrap();
        assert_eq!(loops(&out.body), 2);
    }

    #[test]
    fn nested_loops_merge_all_the_way_down() {
        let Kernel { mut func, a, b, c } = kernel();
        let outer = |inner: Stmt| {
            let o = Var::new("o", DataType::I32);
            Stmt::For(Loop::serial(o, Expr::i32(0), Expr::i32(2), inner))
        };
        func.body = Stmt::seq(vec![outer(copy_loop(b, a, 1)), outer(copy_loop(c, a, 3))]);
        let out = run_pass(&MergeForWhere, func.clone()).unwrap();
        assert_eq!(loops(&out.body), 2);
        assert_eq!(run(&func), run(&out));
    }

    #[test]
    fn conditionals_with_same_predicate_merge() {
        let Kernel { mut func, a, b, c } = kernel();
        let n = Var::new("n", DataType::I32);
        func.params.push(vira_ir::Param::Scalar(n.clone()));
        let cond = Expr::lt(Expr::var(&n), Expr::i32(4));
        let store = |buf, v| Stmt::store(buf, vec![Expr::i32(0)], Expr::i32(v));
        func.body = Stmt::seq(vec![
            Stmt::if_then(cond.clone(), store(b, 1)),
            Stmt::If {
                condition: cond,
                then_case: Box::new(store(c, 2)),
                else_case: Some(Box::new(store(a, 3))),
            },
        ]);
        let out = run_pass(&MergeForWhere, func).unwrap();
        let Stmt::If {
            then_case,
            else_case,
            ..
        } = &out.body
        else {
            panic!("expected one conditional, got {:?}", out.body);
        };
        assert_eq!(then_case.clone().into_flat().len(), 2);
        assert_eq!(**else_case.as_ref().unwrap(), store(a, 3));
    }

    #[test]
    fn predicate_reading_written_buffer_stays_apart() {
        let Kernel { mut func, a, b, .. } = kernel();
        let cond = Expr::lt(Expr::load(a, vec![Expr::i32(0)], DataType::I32), Expr::i32(4));
        let store = |buf, v| Stmt::store(buf, vec![Expr::i32(0)], Expr::i32(v));
        func.body = Stmt::seq(vec![
            Stmt::if_then(cond.clone(), store(a, 9)),
            Stmt::if_then(cond, store(b, 1)),
        ]);
        let out = run_pass(&MergeForWhere, func).unwrap();
        assert_eq!(out.body.clone().into_flat().len(), 2);
    }

    #[test]
    fn barriers_pin_loops() {
        let Kernel { mut func, a, b, c } = kernel();
        let Stmt::For(mut l) = copy_loop(b, a, 1) else {
            unreachable!()
        };
        let barrier = Stmt::Evaluate(Expr::call(Intrinsic::Barrier, vec![], DataType::VOID));
        l.body = Box::new(Stmt::seq(vec![*l.body, barrier]));
        func.body = Stmt::seq(vec![Stmt::For(l), copy_loop(c, a, 2)]);
        let out = run_pass(&MergeForWhere, func).unwrap();
        assert_eq!(loops(&out.body), 2);
    }
}
