//! Buffers, address spaces, memory layouts and DMA events.

use serde::{Deserialize, Serialize};

use crate::expr::{Expr, Var};
use crate::types::DataType;

/// Memory address space of a buffer.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum AddressSpace {
    /// Off-chip device memory.
    Global,
    /// Per-core scratchpad memory.
    Local,
    /// On-chip memory shared by all cores.
    Shared,
}

/// Order in which the dimensions of a buffer are laid out in memory.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Layout {
    /// Last dimension is contiguous.
    RowMajor,
    /// First dimension is contiguous.
    ColumnMajor,
    /// Dimension indices from outermost to innermost in memory.
    Permuted(Vec<usize>),
}

impl Layout {
    /// Dimension order from outermost to innermost for a buffer of `rank`
    /// dimensions, or `None` if a permutation does not cover `0..rank`.
    pub fn dim_order(&self, rank: usize) -> Option<Vec<usize>> {
        match self {
            Self::RowMajor => Some((0..rank).collect()),
            Self::ColumnMajor => Some((0..rank).rev().collect()),
            Self::Permuted(order) => {
                let mut seen = vec![false; rank];
                if order.len() != rank {
                    return None;
                }
                for &d in order {
                    if d >= rank || seen[d] {
                        return None;
                    }
                    seen[d] = true;
                }
                Some(order.clone())
            }
        }
    }
}

/// One dimension extent of a buffer shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Dim {
    /// A concrete extent.
    Fixed(u64),
    /// A symbolic size variable bound at kernel launch.
    Size(Var),
}

impl Dim {
    pub fn as_fixed(&self) -> Option<u64> {
        match self {
            Self::Fixed(n) => Some(*n),
            Self::Size(_) => None,
        }
    }

    /// The extent as an `i32` expression.
    pub fn to_expr(&self) -> Expr {
        match self {
            Self::Fixed(n) => Expr::i32(*n as i64),
            Self::Size(var) => Expr::Var(var.clone()),
        }
    }
}

/// A multi-dimensional buffer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Buffer {
    pub name: String,
    /// Element type (single lane).
    pub dtype: DataType,
    pub shape: Vec<Dim>,
    /// Byte stride per dimension, filled in by stride generation.
    #[serde(default)]
    pub strides: Option<Vec<Expr>>,
    pub space: AddressSpace,
    /// Explicit layout; takes precedence over target layout rules.
    #[serde(default)]
    pub layout: Option<Layout>,
}

impl Buffer {
    /// Creates a buffer without strides or explicit layout.
    pub fn new(name: impl Into<String>, dtype: DataType, shape: Vec<Dim>, space: AddressSpace) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
            strides: None,
            space,
            layout: None,
        }
    }

    /// Convenience constructor for fully static shapes.
    pub fn fixed(
        name: impl Into<String>,
        dtype: DataType,
        shape: &[u64],
        space: AddressSpace,
    ) -> Self {
        Self::new(name, dtype, shape.iter().map(|&n| Dim::Fixed(n)).collect(), space)
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn elem_bytes(&self) -> u64 {
        u64::from(self.dtype.scalar.width)
    }

    /// Number of elements when every extent is static.
    pub fn num_elements(&self) -> Option<u64> {
        self.shape
            .iter()
            .try_fold(1u64, |acc, d| d.as_fixed().and_then(|n| acc.checked_mul(n)))
    }

    /// Strides as integers when they have been generated and are all constant.
    pub fn const_strides(&self) -> Option<Vec<i64>> {
        self.strides
            .as_ref()?
            .iter()
            .map(Expr::as_int)
            .collect::<Option<Vec<_>>>()
    }
}

/// A synchronization handle signaled when a DMA transfer completes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
}

/// Hardware resources assigned to one event.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventSlot {
    /// DMA queue the transfer is issued on.
    pub queue: u32,
    /// Index of the event register within the queue.
    pub slot: u32,
}

/// Per-function event table filled in by event-state initialization.
///
/// `slots[i]` belongs to the event with handle index `i`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventState {
    pub slots: Vec<EventSlot>,
    /// Highest number of events simultaneously outstanding on any queue.
    pub max_in_flight: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scalar;

    #[test]
    fn layout_dim_order() {
        assert_eq!(Layout::RowMajor.dim_order(3), Some(vec![0, 1, 2]));
        assert_eq!(Layout::ColumnMajor.dim_order(3), Some(vec![2, 1, 0]));
        assert_eq!(
            Layout::Permuted(vec![1, 0, 2]).dim_order(3),
            Some(vec![1, 0, 2])
        );
        assert_eq!(Layout::Permuted(vec![0, 0, 2]).dim_order(3), None);
        assert_eq!(Layout::Permuted(vec![0, 1]).dim_order(3), None);
    }

    #[test]
    fn buffer_element_count() {
        let buf = Buffer::fixed("a", DataType::F32, &[2, 3, 4], AddressSpace::Global);
        assert_eq!(buf.rank(), 3);
        assert_eq!(buf.elem_bytes(), 4);
        assert_eq!(buf.num_elements(), Some(24));
        assert!(buf.const_strides().is_none());
    }

    #[test]
    fn symbolic_buffer_has_no_static_size() {
        let n = Var::new("n", DataType::scalar(Scalar::I32));
        let buf = Buffer::new(
            "a",
            DataType::F32,
            vec![Dim::Size(n), Dim::Fixed(4)],
            AddressSpace::Global,
        );
        assert_eq!(buf.num_elements(), None);
    }
}
