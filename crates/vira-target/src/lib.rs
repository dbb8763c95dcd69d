#![warn(missing_docs)]
//! Target descriptors for VIRA.
//!
//! A [`TargetDescriptor`] tells the lowering pipeline everything it needs to
//! know about one accelerator generation: the native vector width, which
//! address spaces exist and who can reach them, which optional instruction
//! variants are implemented, how many DMA queues and event registers there
//! are, and how buffers should be laid out. A [`TargetRegistry`] resolves
//! `--target` names to descriptors.

use std::fmt;

use serde::{Deserialize, Serialize};
use vira_ir::{AddressSpace, Buffer, Layout, Scalar};

/// Optional instruction variants implemented by a target.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct InstructionSet(u32);

impl InstructionSet {
    /// No optional instructions.
    pub const NONE: Self = Self(0);
    /// `vmla`: multiply-accumulate.
    pub const FUSED_MLA: Self = Self(1 << 0);
    /// `vmls`: multiply-subtract.
    pub const FUSED_MLS: Self = Self(1 << 1);
    /// `vload.s`: strided vector load.
    pub const STRIDED_LOAD: Self = Self(1 << 2);
    /// `vstore.s`: strided vector store.
    pub const STRIDED_STORE: Self = Self(1 << 3);
    /// `vrsub`: reverse subtract.
    pub const REVERSE_SUB: Self = Self(1 << 4);

    const NAMES: [(Self, &'static str); 5] = [
        (Self::FUSED_MLA, "fused-mla"),
        (Self::FUSED_MLS, "fused-mls"),
        (Self::STRIDED_LOAD, "strided-load"),
        (Self::STRIDED_STORE, "strided-store"),
        (Self::REVERSE_SUB, "reverse-sub"),
    ];

    /// Every optional instruction.
    pub fn all() -> Self {
        Self::NAMES.iter().fold(Self::NONE, |acc, (flag, _)| acc | *flag)
    }

    /// Returns `true` if `self` contains all flags in `other`.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Looks up a variant by its kebab-case name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(flag, _)| *flag)
    }
}

impl std::ops::BitOr for InstructionSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl TryFrom<Vec<String>> for InstructionSet {
    type Error = String;

    fn try_from(names: Vec<String>) -> Result<Self, Self::Error> {
        names.iter().try_fold(Self::NONE, |acc, name| {
            Self::from_name(name)
                .map(|flag| acc | flag)
                .ok_or_else(|| format!("unknown instruction variant `{name}`"))
        })
    }
}

impl From<InstructionSet> for Vec<String> {
    fn from(set: InstructionSet) -> Self {
        InstructionSet::NAMES
            .iter()
            .filter(|(flag, _)| set.contains(*flag))
            .map(|(_, name)| (*name).to_string())
            .collect()
    }
}

impl fmt::Display for InstructionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = (*self).into();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(", "))
        }
    }
}

/// Rounding behavior of the hardware multiply-accumulate.
#[derive(Clone, Copy, Debug, Default, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MlaRounding {
    /// The product is rounded before the addition, exactly like a separate
    /// multiply followed by an add.
    Chained,
    /// A single rounding after the addition.
    #[default]
    Fused,
}

/// One entry of the address-space catalogue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AddressSpaceInfo {
    /// Which IR address space this describes.
    pub space: AddressSpace,
    /// Hardware name of the memory.
    pub name: String,
    /// The DMA engine can read and write it.
    pub dma_capable: bool,
    /// Vector loads and stores can reach it.
    pub compute_accessible: bool,
    /// Size in bytes, when bounded.
    #[serde(default)]
    pub capacity_bytes: Option<u64>,
}

/// A layout rule: buffers matching every given criterion use `layout`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayoutOverride {
    /// Only buffers in this address space.
    #[serde(default)]
    pub space: Option<AddressSpace>,
    /// Only buffers whose name starts with this prefix.
    #[serde(default)]
    pub name_prefix: Option<String>,
    /// Layout to apply.
    pub layout: Layout,
}

impl LayoutOverride {
    /// Returns `true` if the rule applies to `buffer`.
    pub fn matches(&self, buffer: &Buffer) -> bool {
        self.space.is_none_or(|s| s == buffer.space)
            && self
                .name_prefix
                .as_deref()
                .is_none_or(|p| buffer.name.starts_with(p))
    }
}

/// Everything the pipeline knows about one accelerator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetDescriptor {
    /// Target identifier used for `--target` dispatch.
    pub name: String,
    /// Width of one vector register in bits.
    pub native_vector_bits: u32,
    /// Address-space catalogue.
    pub address_spaces: Vec<AddressSpaceInfo>,
    /// Optional instruction variants.
    #[serde(default)]
    pub instructions: InstructionSet,
    /// Rounding of `vmla`/`vmls`.
    #[serde(default)]
    pub mla_rounding: MlaRounding,
    /// Number of independent DMA queues.
    pub dma_queues: u32,
    /// Event registers per queue; bounds outstanding transfers per queue.
    pub max_events_per_queue: u32,
    /// Layout rules, first match wins.
    #[serde(default)]
    pub layout_overrides: Vec<LayoutOverride>,
}

impl TargetDescriptor {
    fn base(name: &str) -> Self {
        Self {
            name: name.into(),
            native_vector_bits: 256,
            address_spaces: vec![
                AddressSpaceInfo {
                    space: AddressSpace::Global,
                    name: "ddr".into(),
                    dma_capable: true,
                    compute_accessible: true,
                    capacity_bytes: None,
                },
                AddressSpaceInfo {
                    space: AddressSpace::Local,
                    name: "lsram".into(),
                    dma_capable: true,
                    compute_accessible: true,
                    capacity_bytes: Some(32 * 1024),
                },
                AddressSpaceInfo {
                    space: AddressSpace::Shared,
                    name: "gsram".into(),
                    dma_capable: true,
                    compute_accessible: true,
                    capacity_bytes: Some(256 * 1024),
                },
            ],
            instructions: InstructionSet::NONE,
            mla_rounding: MlaRounding::Fused,
            dma_queues: 1,
            max_events_per_queue: 4,
            layout_overrides: Vec::new(),
        }
    }

    /// First generation: one DMA queue, no fused arithmetic.
    pub fn v1() -> Self {
        Self {
            instructions: InstructionSet::STRIDED_LOAD,
            ..Self::base("v1")
        }
    }

    /// Second generation: chained multiply-accumulate, two DMA queues.
    pub fn v2() -> Self {
        Self {
            instructions: InstructionSet::all(),
            mla_rounding: MlaRounding::Chained,
            dma_queues: 2,
            ..Self::base("v2")
        }
    }

    /// Third generation: compute reaches on-chip memory only, weights in
    /// shared memory are column-major.
    pub fn v3() -> Self {
        let mut target = Self {
            instructions: InstructionSet::all(),
            mla_rounding: MlaRounding::Fused,
            dma_queues: 4,
            max_events_per_queue: 8,
            ..Self::base("v3")
        };
        for info in &mut target.address_spaces {
            if info.space == AddressSpace::Global {
                info.compute_accessible = false;
            }
        }
        target.layout_overrides.push(LayoutOverride {
            space: Some(AddressSpace::Shared),
            name_prefix: Some("weight".into()),
            layout: Layout::ColumnMajor,
        });
        target
    }

    /// Parses a descriptor from JSON and checks it.
    pub fn from_json(text: &str) -> Result<Self, TargetError> {
        let target: Self = serde_json::from_str(text)?;
        target.validate()?;
        Ok(target)
    }

    /// Checks that the descriptor is usable by the pipeline.
    pub fn validate(&self) -> Result<(), TargetError> {
        let invalid = |message: &str| TargetError::Invalid {
            name: self.name.clone(),
            message: message.into(),
        };
        if self.native_vector_bits == 0 || self.native_vector_bits % 8 != 0 {
            return Err(invalid("native vector width must be a positive multiple of 8 bits"));
        }
        if self.dma_queues == 0 {
            return Err(invalid("at least one DMA queue is required"));
        }
        if self.max_events_per_queue == 0 {
            return Err(invalid("at least one event per queue is required"));
        }
        for (i, info) in self.address_spaces.iter().enumerate() {
            if self.address_spaces[..i].iter().any(|o| o.space == info.space) {
                return Err(invalid(&format!("address space {} listed twice", info.space)));
            }
        }
        Ok(())
    }

    /// Number of lanes of `scalar` that fill one vector register.
    pub fn native_lanes(&self, scalar: Scalar) -> u16 {
        let bits = scalar.bits().max(1);
        u16::try_from((self.native_vector_bits / bits).max(1)).unwrap_or(u16::MAX)
    }

    /// Catalogue entry for `space`.
    pub fn space(&self, space: AddressSpace) -> Option<&AddressSpaceInfo> {
        self.address_spaces.iter().find(|i| i.space == space)
    }

    /// Returns `true` if vector loads and stores can reach `space`.
    pub fn is_compute_accessible(&self, space: AddressSpace) -> bool {
        self.space(space).is_some_and(|i| i.compute_accessible)
    }

    /// Returns `true` if the DMA engine can move data in or out of `space`.
    pub fn is_dma_capable(&self, space: AddressSpace) -> bool {
        self.space(space).is_some_and(|i| i.dma_capable)
    }

    /// Returns `true` if every variant in `instructions` is implemented.
    pub fn supports(&self, instructions: InstructionSet) -> bool {
        self.instructions.contains(instructions)
    }

    /// Layout imposed on `buffer` by the first matching override rule.
    pub fn layout_for(&self, buffer: &Buffer) -> Option<&Layout> {
        self.layout_overrides
            .iter()
            .find(|rule| rule.matches(buffer))
            .map(|rule| &rule.layout)
    }

    /// DMA queue for a transfer from `src` to `dst`.
    ///
    /// Transfers into on-chip memory, out of it, and between on-chip memories
    /// go to distinct queues when the target has enough of them.
    pub fn dma_queue(&self, src: AddressSpace, dst: AddressSpace) -> u32 {
        let direction = match (src, dst) {
            (AddressSpace::Global, _) => 0,
            (_, AddressSpace::Global) => 1,
            _ => 2,
        };
        direction % self.dma_queues.max(1)
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}-bit vectors, {} DMA queue(s) x {} events, instructions: {})",
            self.name,
            self.native_vector_bits,
            self.dma_queues,
            self.max_events_per_queue,
            self.instructions
        )
    }
}

/// Errors raised while resolving or loading a target.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// No registered target has the requested name.
    #[error("unknown target `{name}` (available: {available})")]
    UnknownTarget {
        /// Requested name.
        name: String,
        /// Comma-separated registered names.
        available: String,
    },
    /// The descriptor is inconsistent.
    #[error("invalid target `{name}`: {message}")]
    Invalid {
        /// Target name.
        name: String,
        /// What is wrong.
        message: String,
    },
    /// The descriptor file is not valid JSON for a descriptor.
    #[error("failed to parse target descriptor: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Registry of known targets, used for CLI `--target` dispatch.
pub struct TargetRegistry {
    targets: Vec<TargetDescriptor>,
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
        }
    }

    /// Creates a registry pre-populated with the built-in targets.
    pub fn with_builtins() -> Self {
        let mut reg = Self::new();
        reg.register(TargetDescriptor::v1());
        reg.register(TargetDescriptor::v2());
        reg.register(TargetDescriptor::v3());
        reg
    }

    /// Registers a target, replacing any previous one with the same name.
    pub fn register(&mut self, target: TargetDescriptor) {
        if let Some(existing) = self.targets.iter_mut().find(|t| t.name == target.name) {
            log::debug!("replacing target `{}`", target.name);
            *existing = target;
        } else {
            self.targets.push(target);
        }
    }

    /// Finds a target by name.
    pub fn find(&self, name: &str) -> Option<&TargetDescriptor> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Finds a target by name, reporting the available names on failure.
    pub fn resolve(&self, name: &str) -> Result<&TargetDescriptor, TargetError> {
        self.find(name).ok_or_else(|| TargetError::UnknownTarget {
            name: name.into(),
            available: self.list_targets().join(", "),
        })
    }

    /// Lists all registered target names.
    pub fn list_targets(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vira_ir::DataType;

    #[test]
    fn builtin_targets_are_valid() {
        let reg = TargetRegistry::with_builtins();
        assert_eq!(reg.list_targets(), vec!["v1", "v2", "v3"]);
        for name in reg.list_targets() {
            reg.find(name).unwrap().validate().unwrap();
        }
    }

    #[test]
    fn native_lanes_per_element_width() {
        let t = TargetDescriptor::v1();
        assert_eq!(t.native_lanes(Scalar::F32), 8);
        assert_eq!(t.native_lanes(Scalar::F16), 16);
        assert_eq!(t.native_lanes(Scalar::I8), 32);
    }

    #[test]
    fn resolve_unknown_lists_available() {
        let reg = TargetRegistry::with_builtins();
        let err = reg.resolve("v9").unwrap_err();
        assert_eq!(err.to_string(), "unknown target `v9` (available: v1, v2, v3)");
    }

    #[test]
    fn register_replaces_same_name() {
        let mut reg = TargetRegistry::with_builtins();
        let mut custom = TargetDescriptor::v1();
        custom.native_vector_bits = 512;
        reg.register(custom);
        assert_eq!(reg.list_targets().len(), 3);
        assert_eq!(reg.find("v1").unwrap().native_vector_bits, 512);
    }

    #[test]
    fn layout_override_first_match() {
        let t = TargetDescriptor::v3();
        let w = Buffer::fixed("weight0", DataType::F32, &[4, 4], AddressSpace::Shared);
        let a = Buffer::fixed("act", DataType::F32, &[4, 4], AddressSpace::Shared);
        assert_eq!(t.layout_for(&w), Some(&Layout::ColumnMajor));
        assert_eq!(t.layout_for(&a), None);
    }

    #[test]
    fn compute_access_by_generation() {
        assert!(TargetDescriptor::v2().is_compute_accessible(AddressSpace::Global));
        assert!(!TargetDescriptor::v3().is_compute_accessible(AddressSpace::Global));
        assert!(TargetDescriptor::v3().is_compute_accessible(AddressSpace::Local));
    }

    #[test]
    fn dma_queue_by_direction() {
        let v1 = TargetDescriptor::v1();
        let v3 = TargetDescriptor::v3();
        assert_eq!(v1.dma_queue(AddressSpace::Global, AddressSpace::Local), 0);
        assert_eq!(v1.dma_queue(AddressSpace::Local, AddressSpace::Global), 0);
        assert_eq!(v3.dma_queue(AddressSpace::Global, AddressSpace::Local), 0);
        assert_eq!(v3.dma_queue(AddressSpace::Local, AddressSpace::Global), 1);
        assert_eq!(v3.dma_queue(AddressSpace::Local, AddressSpace::Shared), 2);
    }

    #[test]
    fn json_descriptor_round_trip() {
        let text = serde_json::to_string(&TargetDescriptor::v2()).unwrap();
        assert!(text.contains("\"fused-mla\""));
        assert!(text.contains("\"chained\""));
        let back = TargetDescriptor::from_json(&text).unwrap();
        assert_eq!(back, TargetDescriptor::v2());
    }

    #[test]
    fn json_rejects_unknown_instruction() {
        let mut value = serde_json::to_value(TargetDescriptor::v1()).unwrap();
        value["instructions"] = serde_json::json!(["teleport"]);
        let err = TargetDescriptor::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, TargetError::Parse(_)));
    }

    #[test]
    fn zero_queue_target_is_invalid() {
        let mut t = TargetDescriptor::v1();
        t.dma_queues = 0;
        assert!(matches!(t.validate(), Err(TargetError::Invalid { .. })));
    }
}
