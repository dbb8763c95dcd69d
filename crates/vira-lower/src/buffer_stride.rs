//! Gen-buffer-stride pass: computes the byte stride of every buffer
//! dimension from its shape and layout.
//!
//! The layout is the buffer's own, else the first matching target override
//! rule, else row-major. Strides already present are kept.

use vira_ir::{Buffer, Expr, Function, Layout, PropertySet, StmtPath};
use vira_target::TargetDescriptor;

use crate::util::mul;
use crate::{LoweringError, Pass, PassContext};

#[derive(Debug)]
pub struct GenBufferStride;

impl Pass for GenBufferStride {
    fn name(&self) -> &'static str {
        "gen-buffer-stride"
    }

    fn establishes(&self) -> PropertySet {
        PropertySet::STRIDES_COMPUTED
    }

    fn run_on_function(
        &self,
        mut func: Function,
        cx: &PassContext<'_>,
    ) -> Result<Function, LoweringError> {
        for (_, buf) in func.buffers.iter_mut() {
            if buf.strides.is_some() {
                continue;
            }
            let strides = byte_strides(buf, cx.target).ok_or_else(|| {
                cx.unsupported(
                    &StmtPath::root(),
                    format!("layout of buffer `{}` does not fit its rank {}", buf.name, buf.rank()),
                )
            })?;
            log::trace!("`{}`: strides of `{}` are {strides:?}", func.name, buf.name);
            buf.strides = Some(strides);
        }
        Ok(func)
    }
}

/// Byte strides for `buf` under the layout it resolves to.
fn byte_strides(buf: &Buffer, target: &TargetDescriptor) -> Option<Vec<Expr>> {
    let layout = buf
        .layout
        .as_ref()
        .or_else(|| target.layout_for(buf))
        .unwrap_or(&Layout::RowMajor);
    let order = layout.dim_order(buf.rank())?;

    let mut strides = vec![Expr::i32(0); buf.rank()];
    let mut acc = Expr::i32(buf.elem_bytes() as i64);
    for &d in order.iter().rev() {
        strides[d] = acc.clone();
        acc = mul(acc, buf.shape[d].to_expr());
    }
    Some(strides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{run_pass, run_pass_on, target};
    use vira_ir::{AddressSpace, DataType, Dim, Var};

    fn strides_of(func: &Function, index: usize) -> Vec<i64> {
        let (_, buf) = func.buffers.iter().nth(index).unwrap();
        buf.const_strides().unwrap()
    }

    #[test]
    fn row_major_f32() {
        let mut func = Function::new("k");
        func.add_buffer_param(Buffer::fixed("a", DataType::F32, &[2, 3, 4], AddressSpace::Global));
        let out = run_pass(&GenBufferStride, func).unwrap();
        assert_eq!(strides_of(&out, 0), vec![48, 16, 4]);
    }

    #[test]
    fn explicit_layouts() {
        let mut func = Function::new("k");
        let mut col = Buffer::fixed("c", DataType::F32, &[2, 3], AddressSpace::Global);
        col.layout = Some(Layout::ColumnMajor);
        func.add_buffer_param(col);
        let mut perm = Buffer::fixed("p", DataType::F32, &[2, 3, 4], AddressSpace::Global);
        perm.layout = Some(Layout::Permuted(vec![2, 0, 1]));
        func.add_buffer_param(perm);
        let out = run_pass(&GenBufferStride, func).unwrap();
        assert_eq!(strides_of(&out, 0), vec![4, 8]);
        // Dimension 1 is innermost, then 0, then 2.
        assert_eq!(strides_of(&out, 1), vec![12, 4, 24]);
    }

    #[test]
    fn target_override_applies_unless_buffer_overrides() {
        let mut func = Function::new("k");
        func.add_buffer_param(Buffer::fixed("weight0", DataType::F32, &[2, 3], AddressSpace::Shared));
        let mut own = Buffer::fixed("weight1", DataType::F32, &[2, 3], AddressSpace::Shared);
        own.layout = Some(Layout::RowMajor);
        func.add_buffer_param(own);
        let out = run_pass_on(&GenBufferStride, func, &target("v3")).unwrap();
        assert_eq!(strides_of(&out, 0), vec![4, 8]);
        assert_eq!(strides_of(&out, 1), vec![12, 4]);
    }

    #[test]
    fn symbolic_extents() {
        let n = Var::new("n", DataType::I32);
        let mut func = Function::new("k");
        func.add_buffer_param(Buffer::new(
            "a",
            DataType::F32,
            vec![Dim::Fixed(8), Dim::Size(n.clone())],
            AddressSpace::Global,
        ));
        let out = run_pass(&GenBufferStride, func).unwrap();
        let (_, buf) = out.buffers.iter().next().unwrap();
        assert_eq!(
            buf.strides.as_deref().unwrap(),
            &[Expr::mul(Expr::i32(4), Expr::var(&n)), Expr::i32(4)]
        );
    }

    #[test]
    fn existing_strides_are_kept() {
        let mut func = Function::new("k");
        let mut padded = Buffer::fixed("a", DataType::F32, &[2, 3], AddressSpace::Global);
        padded.strides = Some(vec![Expr::i32(64), Expr::i32(4)]);
        func.add_buffer_param(padded);
        let out = run_pass(&GenBufferStride, func).unwrap();
        assert_eq!(strides_of(&out, 0), vec![64, 4]);
    }

    #[test]
    fn bad_permutation_is_unsupported() {
        let mut func = Function::new("k");
        let mut buf = Buffer::fixed("a", DataType::F32, &[2, 3], AddressSpace::Global);
        buf.layout = Some(Layout::Permuted(vec![0, 0]));
        func.add_buffer_param(buf);
        assert!(run_pass(&GenBufferStride, func).is_err());
    }
}
