//! ISA-aware rewrite: operand-order legality fixes.
//!
//! The hardware takes a broadcast operand only in the second source slot.
//! Each [`OperandRule`] moves a broadcast out of the first slot of one
//! opcode family, possibly switching to a mirrored opcode.

use vira_ir::{CmpCond, Expr, Function, Inst, Opcode, PropertySet, Stmt};
use vira_target::{InstructionSet, TargetDescriptor};

use crate::{LoweringError, Pass, PassContext};

/// How an instruction is rewritten once it matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reorder {
    /// Swap the first two operands; the opcode stays.
    Swap,
    /// Swap the first two operands and use another opcode.
    SwapAs(Opcode),
    /// Swap the first two operands of a comparison and mirror its condition.
    MirrorCompare,
}

/// One entry of the legality table.
#[derive(Clone, Debug)]
pub struct OperandRule {
    pub name: &'static str,
    pub opcodes: Vec<Opcode>,
    pub reorder: Reorder,
    /// Optional instructions the rewrite needs.
    pub requires: InstructionSet,
    /// Why the reordered instruction computes the same lanes.
    pub note: &'static str,
}

impl OperandRule {
    fn matches(&self, inst: &Inst, target: &TargetDescriptor) -> bool {
        let bcast = |e: Option<&Expr>| {
            matches!(e, Some(Expr::Isa(i)) if i.opcode == Opcode::VBcast)
        };
        let first_matches = match inst.opcode {
            Opcode::VCmp(_) => self.opcodes.iter().any(|o| matches!(o, Opcode::VCmp(_))),
            op => self.opcodes.contains(&op),
        };
        first_matches
            && target.supports(self.requires)
            && bcast(inst.args.first())
            && !bcast(inst.args.get(1))
    }

    /// Rewrites `inst` when the rule applies to it on `target`.
    pub fn apply(&self, inst: &Inst, target: &TargetDescriptor) -> Option<Inst> {
        if !self.matches(inst, target) {
            return None;
        }
        let mut out = inst.clone();
        out.args.swap(0, 1);
        match self.reorder {
            Reorder::Swap => {}
            Reorder::SwapAs(opcode) => out.opcode = opcode,
            Reorder::MirrorCompare => {
                let Opcode::VCmp(cond) = inst.opcode else {
                    return None;
                };
                out.opcode = Opcode::VCmp(CmpCond::mirrored(cond));
            }
        }
        Some(out)
    }
}

#[derive(Debug)]
pub struct IsaAwareRewrite {
    rules: Vec<OperandRule>,
}

impl IsaAwareRewrite {
    pub fn new(rules: Vec<OperandRule>) -> Self {
        Self { rules }
    }

    pub fn with_builtin_rules() -> Self {
        use Opcode::*;
        Self::new(vec![
            OperandRule {
                name: "commute-broadcast",
                opcodes: vec![VAdd, VMul, VMin, VMax, VAnd, VOr, VXor],
                reorder: Reorder::Swap,
                requires: InstructionSet::NONE,
                note: "the operation is commutative",
            },
            OperandRule {
                name: "reverse-sub",
                opcodes: vec![VSub],
                reorder: Reorder::SwapAs(VRsub),
                requires: InstructionSet::REVERSE_SUB,
                note: "vrsub(v, s) = s - v",
            },
            OperandRule {
                name: "mirror-compare",
                opcodes: vec![VCmp(CmpCond::Eq)],
                reorder: Reorder::MirrorCompare,
                requires: InstructionSet::NONE,
                note: "a < b iff b > a",
            },
            OperandRule {
                name: "mla-multiplicand",
                opcodes: vec![VMla, VMls],
                reorder: Reorder::Swap,
                requires: InstructionSet::NONE,
                note: "the product is commutative; the addend stays last",
            },
        ])
    }

    pub fn rules(&self) -> &[OperandRule] {
        &self.rules
    }
}

impl Pass for IsaAwareRewrite {
    fn name(&self) -> &'static str {
        "isa-aware-rewrite"
    }

    fn requires(&self) -> PropertySet {
        PropertySet::VIRTUAL_ISA
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        func.body = body.map_exprs(&mut |e| {
            e.transform(&mut |e| match e {
                Expr::Isa(inst) => {
                    let hit = self
                        .rules
                        .iter()
                        .find_map(|rule| rule.apply(&inst, cx.target).map(|out| (rule, out)));
                    match hit {
                        Some((rule, out)) => {
                            log::trace!("`{}`: `{}` on `{}`", func.name, rule.name, inst.opcode);
                            Expr::Isa(Box::new(out))
                        }
                        None => Expr::Isa(inst),
                    }
                }
                other => other,
            })
        });
        Ok(func)
    }
}
