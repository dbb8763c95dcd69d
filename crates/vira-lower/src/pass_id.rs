//! Names of the built-in passes and the default pipeline order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::*;

/// A built-in pass, addressable by its pipeline name.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PassId {
    SubstituteSizeVar,
    ExchangeConstantToRight,
    CanonicalizeRamp,
    CanonicalizeDivMod,
    UniquifyVarName,
    EliminateGetLocalId,
    FoldConstant,
    Simplify,
    AlignParamWithBuffer,
    GenBufferStride,
    InsertDma,
    LoopPartition,
    LowerPred,
    AlignVectorWidthBySplit,
    AlignVectorWidthByPad,
    LowerVectorCast,
    LowerVirtualVectorPointer,
    LowerVirtualIsa,
    CombineInstructions,
    IsaAwareRewrite,
    MergeForWhere,
    InitializeEventState,
    RevertToStandard,
    Precodegen,
}

impl PassId {
    pub const ALL: [PassId; 24] = [
        Self::SubstituteSizeVar,
        Self::ExchangeConstantToRight,
        Self::CanonicalizeRamp,
        Self::CanonicalizeDivMod,
        Self::UniquifyVarName,
        Self::EliminateGetLocalId,
        Self::FoldConstant,
        Self::Simplify,
        Self::AlignParamWithBuffer,
        Self::GenBufferStride,
        Self::InsertDma,
        Self::LoopPartition,
        Self::LowerPred,
        Self::AlignVectorWidthBySplit,
        Self::AlignVectorWidthByPad,
        Self::LowerVectorCast,
        Self::LowerVirtualVectorPointer,
        Self::LowerVirtualIsa,
        Self::CombineInstructions,
        Self::IsaAwareRewrite,
        Self::MergeForWhere,
        Self::InitializeEventState,
        Self::RevertToStandard,
        Self::Precodegen,
    ];

    /// The full lowering pipeline, in order.
    pub const DEFAULT_PIPELINE: &'static [PassId] = &[
        Self::SubstituteSizeVar,
        Self::ExchangeConstantToRight,
        Self::CanonicalizeRamp,
        Self::CanonicalizeDivMod,
        Self::UniquifyVarName,
        Self::EliminateGetLocalId,
        Self::Simplify,
        Self::AlignParamWithBuffer,
        Self::GenBufferStride,
        Self::InsertDma,
        Self::LoopPartition,
        Self::CanonicalizeRamp,
        Self::Simplify,
        Self::LowerPred,
        Self::AlignVectorWidthBySplit,
        Self::AlignVectorWidthByPad,
        Self::LowerVectorCast,
        Self::LowerVirtualVectorPointer,
        Self::LowerVirtualIsa,
        Self::CombineInstructions,
        Self::IsaAwareRewrite,
        Self::MergeForWhere,
        Self::InitializeEventState,
        Self::RevertToStandard,
        Self::Precodegen,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::SubstituteSizeVar => "substitute-size-var",
            Self::ExchangeConstantToRight => "exchange-constant-to-right",
            Self::CanonicalizeRamp => "canonicalize-ramp",
            Self::CanonicalizeDivMod => "canonicalize-div-mod",
            Self::UniquifyVarName => "uniquify-var-name",
            Self::EliminateGetLocalId => "eliminate-get-local-id",
            Self::FoldConstant => "fold-constant",
            Self::Simplify => "simplify",
            Self::AlignParamWithBuffer => "align-param-with-buffer",
            Self::GenBufferStride => "gen-buffer-stride",
            Self::InsertDma => "insert-dma",
            Self::LoopPartition => "loop-partition",
            Self::LowerPred => "lower-pred",
            Self::AlignVectorWidthBySplit => "align-vector-width-by-split",
            Self::AlignVectorWidthByPad => "align-vector-width-by-pad",
            Self::LowerVectorCast => "lower-vector-cast",
            Self::LowerVirtualVectorPointer => "lower-virtual-vector-pointer",
            Self::LowerVirtualIsa => "lower-virtual-isa",
            Self::CombineInstructions => "combine-instructions",
            Self::IsaAwareRewrite => "isa-aware-rewrite",
            Self::MergeForWhere => "merge-for-where",
            Self::InitializeEventState => "initialize-event-state",
            Self::RevertToStandard => "revert-to-standard",
            Self::Precodegen => "precodegen",
        }
    }

    /// Instantiates the pass.
    pub fn create(self) -> Box<dyn Pass> {
        match self {
            Self::SubstituteSizeVar => Box::new(SubstituteSizeVar),
            Self::ExchangeConstantToRight => Box::new(ExchangeConstantToRight),
            Self::CanonicalizeRamp => Box::new(CanonicalizeRamp),
            Self::CanonicalizeDivMod => Box::new(CanonicalizeDivMod),
            Self::UniquifyVarName => Box::new(UniquifyVarName),
            Self::EliminateGetLocalId => Box::new(EliminateGetLocalId),
            Self::FoldConstant => Box::new(FoldConstant),
            Self::Simplify => Box::new(Simplify),
            Self::AlignParamWithBuffer => Box::new(AlignParamWithBuffer),
            Self::GenBufferStride => Box::new(GenBufferStride),
            Self::InsertDma => Box::new(InsertDma),
            Self::LoopPartition => Box::new(LoopPartition),
            Self::LowerPred => Box::new(LowerPred),
            Self::AlignVectorWidthBySplit => Box::new(AlignVectorWidthBySplit),
            Self::AlignVectorWidthByPad => Box::new(AlignVectorWidthByPad),
            Self::LowerVectorCast => Box::new(LowerVectorCast),
            Self::LowerVirtualVectorPointer => Box::new(LowerVirtualVectorPointer),
            Self::LowerVirtualIsa => Box::new(LowerVirtualIsa),
            Self::CombineInstructions => Box::new(CombineInstructions::with_builtin_rules()),
            Self::IsaAwareRewrite => Box::new(IsaAwareRewrite::with_builtin_rules()),
            Self::MergeForWhere => Box::new(MergeForWhere),
            Self::InitializeEventState => Box::new(InitializeEventState),
            Self::RevertToStandard => Box::new(RevertToStandard),
            Self::Precodegen => Box::new(Precodegen),
        }
    }
}

impl fmt::Display for PassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PassId {
    type Err = LoweringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| LoweringError::UnknownPass(s.to_string()))
    }
}
