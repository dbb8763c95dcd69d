//! Instruction combining.
//!
//! Pattern-matches trees of virtual-ISA instructions against a table of
//! [`CombineRule`]s and replaces each match with the rule's fused form.
//! Every rule states the element types it is exact for, the optional
//! instructions it needs, and why the rewrite preserves values.

use vira_ir::{DataType, Expr, Function, Inst, Opcode, PropertySet, Stmt};
use vira_target::{InstructionSet, MlaRounding, TargetDescriptor};

use crate::{LoweringError, Pass, PassContext};

/// Operand shape on the matching side of a rule.
#[derive(Clone, Debug, PartialEq)]
pub enum Pattern {
    /// Any operand, bound to a numbered slot. A slot used twice must bind
    /// equal operands.
    Slot(usize),
    /// An unmasked instruction with the given operands.
    Inst(Opcode, Vec<Pattern>),
}

/// Operand shape on the replacement side of a rule.
#[derive(Clone, Debug, PartialEq)]
pub enum Template {
    Slot(usize),
    Inst(Opcode, Vec<Template>),
}

/// Element types a rule is value-equivalent for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeClass {
    /// Integer lanes; wrapping arithmetic makes the rewrite exact.
    Int,
    /// Float lanes, when the target's fused instructions round like the
    /// unfused sequence.
    Float(MlaRounding),
}

impl TypeClass {
    fn admits(self, dtype: DataType, target: &TargetDescriptor) -> bool {
        match self {
            Self::Int => dtype.scalar.is_int(),
            Self::Float(rounding) => dtype.scalar.is_float() && target.mla_rounding == rounding,
        }
    }
}

/// One entry of the combine table.
#[derive(Clone, Debug)]
pub struct CombineRule {
    pub name: &'static str,
    /// Root instruction shape. The root's mask carries over to the result.
    pub before: Pattern,
    pub after: Template,
    pub class: TypeClass,
    /// Optional instructions the target must implement.
    pub requires: InstructionSet,
    /// Why `after` computes the same lanes as `before`.
    pub note: &'static str,
}

impl CombineRule {
    /// Rewrites `inst` when the rule applies to it on `target`.
    pub fn apply(&self, inst: &Inst, target: &TargetDescriptor) -> Option<Expr> {
        if !target.supports(self.requires) || !self.class.admits(inst.dtype, target) {
            return None;
        }
        let Pattern::Inst(opcode, operands) = &self.before else {
            return None;
        };
        if *opcode != inst.opcode || operands.len() != inst.args.len() {
            return None;
        }
        let mut slots = Vec::new();
        for (pat, arg) in operands.iter().zip(&inst.args) {
            if !bind(pat, arg, &mut slots) {
                return None;
            }
        }
        let Template::Inst(opcode, args) = &self.after else {
            return None;
        };
        let args = args
            .iter()
            .map(|t| instantiate(t, &slots, inst.dtype))
            .collect::<Option<Vec<_>>>()?;
        Some(Expr::isa(*opcode, args, inst.mask.clone(), inst.dtype))
    }
}

fn bind(pat: &Pattern, e: &Expr, slots: &mut Vec<Option<Expr>>) -> bool {
    match pat {
        Pattern::Slot(k) => {
            if slots.len() <= *k {
                slots.resize(k + 1, None);
            }
            match &slots[*k] {
                Some(bound) => bound == e,
                None => {
                    slots[*k] = Some(e.clone());
                    true
                }
            }
        }
        Pattern::Inst(opcode, operands) => {
            let Expr::Isa(inst) = e else { return false };
            inst.opcode == *opcode
                && inst.mask.is_none()
                && inst.args.len() == operands.len()
                && operands.iter().zip(&inst.args).all(|(p, a)| bind(p, a, slots))
        }
    }
}

fn instantiate(tmpl: &Template, slots: &[Option<Expr>], dtype: DataType) -> Option<Expr> {
    match tmpl {
        Template::Slot(k) => slots.get(*k)?.clone(),
        Template::Inst(opcode, args) => {
            let args = args
                .iter()
                .map(|t| instantiate(t, slots, dtype))
                .collect::<Option<Vec<_>>>()?;
            Some(Expr::isa(*opcode, args, None, dtype))
        }
    }
}

/// Combines instruction sequences using a rule table.
#[derive(Debug)]
pub struct CombineInstructions {
    rules: Vec<CombineRule>,
}

impl CombineInstructions {
    pub fn new(rules: Vec<CombineRule>) -> Self {
        Self { rules }
    }

    /// Multiply-accumulate fusion: `vadd(vmul(a, b), c)`, its commuted form
    /// and `vsub(c, vmul(a, b))`, for integers and chained-rounding floats.
    pub fn with_builtin_rules() -> Self {
        use Opcode::{VAdd, VMla, VMls, VMul, VSub};
        let mul = || Pattern::Inst(VMul, vec![Pattern::Slot(0), Pattern::Slot(1)]);
        let fused = |op| Template::Inst(op, vec![Template::Slot(0), Template::Slot(1), Template::Slot(2)]);
        let mut rules = Vec::new();
        for (class, note) in [
            (TypeClass::Int, "two's-complement wrapping makes a*b+c exact"),
            (
                TypeClass::Float(MlaRounding::Chained),
                "the product is rounded before the add, as in the pair",
            ),
        ] {
            rules.push(CombineRule {
                name: "mul-add",
                before: Pattern::Inst(VAdd, vec![mul(), Pattern::Slot(2)]),
                after: fused(VMla),
                class,
                requires: InstructionSet::FUSED_MLA,
                note,
            });
            rules.push(CombineRule {
                name: "add-mul",
                before: Pattern::Inst(VAdd, vec![Pattern::Slot(2), mul()]),
                after: fused(VMla),
                class,
                requires: InstructionSet::FUSED_MLA,
                note,
            });
            rules.push(CombineRule {
                name: "sub-mul",
                before: Pattern::Inst(VSub, vec![Pattern::Slot(2), mul()]),
                after: fused(VMls),
                class,
                requires: InstructionSet::FUSED_MLS,
                note,
            });
        }
        Self { rules }
    }

    pub fn rules(&self) -> &[CombineRule] {
        &self.rules
    }
}

impl Pass for CombineInstructions {
    fn name(&self) -> &'static str {
        "combine-instructions"
    }

    fn requires(&self) -> PropertySet {
        PropertySet::VIRTUAL_ISA
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        let mut fused = 0usize;
        let body = std::mem::replace(&mut func.body, Stmt::empty());
        func.body = body.map_exprs(&mut |e| {
            e.transform(&mut |e| match e {
                Expr::Isa(inst) => {
                    match self.rules.iter().find_map(|r| r.apply(&inst, cx.target).map(|e| (r, e))) {
                        Some((rule, out)) => {
                            log::trace!("`{}`: applied `{}` ({})", func.name, rule.name, rule.note);
                            fused += 1;
                            out
                        }
                        None => Expr::Isa(inst),
                    }
                }
                other => other,
            })
        });
        if fused > 0 {
            log::debug!("`{}`: combined {fused} instruction pair(s)", func.name);
        }
        Ok(func)
    }
}
