//! Lower-virtual-ISA pass: every remaining vector operation becomes one
//! virtual-ISA instruction.

use vira_ir::{
    BinaryOp, CmpCond, Expr, Function, Intrinsic, Opcode, PropertySet, Stmt, StmtPath, UnaryOp,
};

use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct LowerVirtualIsa;

impl Pass for LowerVirtualIsa {
    fn name(&self) -> &'static str {
        "lower-virtual-isa"
    }

    fn requires(&self) -> PropertySet {
        PropertySet::VIRTUAL_POINTERS | PropertySet::VECTOR_CASTS_LOWERED
    }

    fn establishes(&self) -> PropertySet {
        PropertySet::VIRTUAL_ISA
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        func.body = body.try_map_exprs(&mut StmtPath::root(), &mut |e, path| {
            e.try_transform(&mut |e| lower(e).map_err(|m| cx.unsupported(path, m)))
        })?;
        Ok(func)
    }
}

/// The opcode of a vector binary operator.
pub(crate) fn opcode_of(op: BinaryOp) -> Option<Opcode> {
    use BinaryOp as B;
    Some(match op {
        B::Add => Opcode::VAdd,
        B::Sub => Opcode::VSub,
        B::Mul => Opcode::VMul,
        B::Div => Opcode::VDiv,
        B::Min => Opcode::VMin,
        B::Max => Opcode::VMax,
        B::And | B::BitAnd => Opcode::VAnd,
        B::Or | B::BitOr => Opcode::VOr,
        B::BitXor => Opcode::VXor,
        B::Shl => Opcode::VShl,
        B::Shr => Opcode::VShr,
        B::Mod | B::FloorDiv | B::FloorMod => return None,
        cmp => Opcode::VCmp(CmpCond::from_binary(cmp)?),
    })
}

/// A scalar operand of a vector instruction, broadcast to `lanes`.
fn splat(e: Expr, lanes: u16) -> Expr {
    if e.lanes() == 1 {
        let ty = e.dtype().with_lanes(lanes);
        Expr::isa(Opcode::VBcast, vec![e], None, ty)
    } else {
        e
    }
}

fn lower(e: Expr) -> Result<Expr, String> {
    let ty = e.dtype();
    if ty.is_scalar() {
        return Ok(e);
    }
    let lanes = ty.lanes;
    Ok(match e {
        Expr::Binary { op, lhs, rhs } => {
            let opcode =
                opcode_of(op).ok_or_else(|| format!("no vector instruction for `{op}` on `{ty}`"))?;
            Expr::isa(opcode, vec![splat(*lhs, lanes), splat(*rhs, lanes)], None, ty)
        }
        Expr::Unary { op, operand } => {
            let opcode = match op {
                UnaryOp::Negate => Opcode::VNeg,
                UnaryOp::Not => Opcode::VNot,
            };
            Expr::isa(opcode, vec![*operand], None, ty)
        }
        Expr::Select {
            condition,
            accept,
            reject,
        } => Expr::isa(
            Opcode::VSel,
            vec![splat(*condition, lanes), splat(*accept, lanes), splat(*reject, lanes)],
            None,
            ty,
        ),
        Expr::Broadcast { value, .. } => Expr::isa(Opcode::VBcast, vec![*value], None, ty),
        Expr::Ramp { base, stride, .. } => Expr::isa(Opcode::VRamp, vec![*base, *stride], None, ty),
        Expr::Reinterpret { value, .. } => Expr::isa(Opcode::VReint, vec![*value], None, ty),
        Expr::Call {
            intrinsic, args, ..
        } => {
            let opcode = match intrinsic {
                Intrinsic::Widen => Opcode::VWiden,
                Intrinsic::Narrow => Opcode::VNarrow,
                Intrinsic::Convert => Opcode::VCvt,
                Intrinsic::Abs => Opcode::VAbs,
                other => return Err(format!("no vector instruction for `{other}`")),
            };
            Expr::isa(opcode, args, None, ty)
        }
        Expr::Cast { .. } => return Err(format!("vector cast to `{ty}` was not lowered")),
        Expr::Load { .. } => return Err(format!("vector load of `{ty}` was not lowered")),
        other => other,
    })
}
