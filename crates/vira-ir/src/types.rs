//! Type system for the VIRA IR.

use serde::{Deserialize, Serialize};

/// Bytes per lane.
pub type Bytes = u8;

/// Numeric class of a lane.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum ScalarKind {
    /// Boolean (predicate lane).
    Bool,
    /// Signed integer.
    Sint,
    /// Unsigned integer.
    Uint,
    /// Floating point.
    Float,
    /// No value (result type of stores and side-effecting intrinsics).
    Void,
}

/// One lane's type.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Scalar {
    pub kind: ScalarKind,
    pub width: Bytes,
}

impl Scalar {
    pub const BOOL: Self = Self {
        kind: ScalarKind::Bool,
        width: 1,
    };
    pub const I8: Self = Self {
        kind: ScalarKind::Sint,
        width: 1,
    };
    pub const I16: Self = Self {
        kind: ScalarKind::Sint,
        width: 2,
    };
    pub const I32: Self = Self {
        kind: ScalarKind::Sint,
        width: 4,
    };
    pub const U8: Self = Self {
        kind: ScalarKind::Uint,
        width: 1,
    };
    pub const U16: Self = Self {
        kind: ScalarKind::Uint,
        width: 2,
    };
    pub const U32: Self = Self {
        kind: ScalarKind::Uint,
        width: 4,
    };
    pub const F16: Self = Self {
        kind: ScalarKind::Float,
        width: 2,
    };
    pub const F32: Self = Self {
        kind: ScalarKind::Float,
        width: 4,
    };
    pub const VOID: Self = Self {
        kind: ScalarKind::Void,
        width: 0,
    };

    /// Width of one lane in bits.
    pub fn bits(self) -> u32 {
        u32::from(self.width) * 8
    }

    pub fn is_int(self) -> bool {
        matches!(self.kind, ScalarKind::Sint | ScalarKind::Uint)
    }

    pub fn is_float(self) -> bool {
        self.kind == ScalarKind::Float
    }

    pub fn is_bool(self) -> bool {
        self.kind == ScalarKind::Bool
    }

    /// The same kind at a different byte width.
    pub fn with_width(self, width: Bytes) -> Self {
        Self {
            kind: self.kind,
            width,
        }
    }
}

/// A possibly-vector data type: one scalar type repeated over `lanes` lanes.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct DataType {
    pub scalar: Scalar,
    pub lanes: u16,
}

impl DataType {
    pub const BOOL: Self = Self::scalar(Scalar::BOOL);
    pub const I32: Self = Self::scalar(Scalar::I32);
    pub const U32: Self = Self::scalar(Scalar::U32);
    pub const F32: Self = Self::scalar(Scalar::F32);
    pub const VOID: Self = Self::scalar(Scalar::VOID);

    /// A single-lane type.
    pub const fn scalar(scalar: Scalar) -> Self {
        Self { scalar, lanes: 1 }
    }

    pub const fn vector(scalar: Scalar, lanes: u16) -> Self {
        Self { scalar, lanes }
    }

    pub fn is_vector(self) -> bool {
        self.lanes > 1
    }

    pub fn is_scalar(self) -> bool {
        self.lanes == 1
    }

    pub fn is_void(self) -> bool {
        self.scalar.kind == ScalarKind::Void
    }

    pub fn with_lanes(self, lanes: u16) -> Self {
        Self {
            scalar: self.scalar,
            lanes,
        }
    }

    pub fn with_scalar(self, scalar: Scalar) -> Self {
        Self {
            scalar,
            lanes: self.lanes,
        }
    }

    /// The bool vector type with the same lane count (comparison result type).
    pub fn to_bool(self) -> Self {
        self.with_scalar(Scalar::BOOL)
    }

    /// Total bits occupied by one value of this type.
    pub fn total_bits(self) -> u32 {
        self.scalar.bits() * u32::from(self.lanes)
    }
}
