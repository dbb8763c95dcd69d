//! Pipeline properties established on a module.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bitflags naming facts about a module that later passes may rely on.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PropertySet(u32);

impl PropertySet {
    /// No properties.
    pub const EMPTY: Self = Self(0);
    /// Every buffer carries byte strides.
    pub const STRIDES_COMPUTED: Self = Self(1 << 0);
    /// Cross-address-space copy loops are DMA descriptors.
    pub const DMA_INSERTED: Self = Self(1 << 1);
    /// No vectorized loop kinds remain; vector code is explicit.
    pub const LOOPS_PARTITIONED: Self = Self(1 << 2);
    /// Every predicate has exactly its operation's lane count.
    pub const PREDICATES_LOWERED: Self = Self(1 << 3);
    /// No vector operation is wider than the native vector width.
    pub const VECTORS_WITHIN_NATIVE_WIDTH: Self = Self(1 << 4);
    /// Every vector operation is exactly the native vector width.
    pub const VECTORS_NATIVE_WIDTH: Self = Self(1 << 5);
    /// Vector casts are explicit widen/narrow/convert sequences.
    pub const VECTOR_CASTS_LOWERED: Self = Self(1 << 6);
    /// Vector loads and stores address memory through byte pointers.
    pub const VIRTUAL_POINTERS: Self = Self(1 << 7);
    /// Vector arithmetic is virtual-ISA instructions.
    pub const VIRTUAL_ISA: Self = Self(1 << 8);
    /// Every DMA has a queue slot and is waited on before use.
    pub const EVENTS_INITIALIZED: Self = Self(1 << 9);
    /// Only code-generator node kinds remain.
    pub const STANDARD_FORM: Self = Self(1 << 10);

    const NAMES: [(Self, &'static str); 11] = [
        (Self::STRIDES_COMPUTED, "strides-computed"),
        (Self::DMA_INSERTED, "dma-inserted"),
        (Self::LOOPS_PARTITIONED, "loops-partitioned"),
        (Self::PREDICATES_LOWERED, "predicates-lowered"),
        (Self::VECTORS_WITHIN_NATIVE_WIDTH, "vectors-within-native-width"),
        (Self::VECTORS_NATIVE_WIDTH, "vectors-native-width"),
        (Self::VECTOR_CASTS_LOWERED, "vector-casts-lowered"),
        (Self::VIRTUAL_POINTERS, "virtual-pointers"),
        (Self::VIRTUAL_ISA, "virtual-isa"),
        (Self::EVENTS_INITIALIZED, "events-initialized"),
        (Self::STANDARD_FORM, "standard-form"),
    ];

    /// Returns `true` if `self` contains all flags in `other`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no flags are set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Flags of `self` that are not in `other`.
    pub fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Iterates over the individual flags that are set.
    pub fn iter(self) -> impl Iterator<Item = Self> {
        Self::NAMES
            .into_iter()
            .map(|(flag, _)| flag)
            .filter(move |flag| self.contains(*flag))
    }

    /// Name of a single flag.
    pub fn name(self) -> Option<&'static str> {
        Self::NAMES
            .iter()
            .find(|(flag, _)| *flag == self)
            .map(|(_, name)| *name)
    }
}

impl std::ops::BitOr for PropertySet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for PropertySet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for PropertySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("{}");
        }
        let names: Vec<_> = self.iter().filter_map(Self::name).collect();
        f.write_str(&names.join(", "))
    }
}
