use serde::{Deserialize, Serialize};

/// Identity of an operator overload whose sharding can be propagated.
///
/// The display form is the ATen overload name, which is what shows up in log records and
/// error messages.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
#[allow(missing_docs)]
pub enum OpId {
    #[strum(serialize = "aten._foreach_neg.default")]
    ForeachNeg,
    #[strum(serialize = "aten._foreach_reciprocal.default")]
    ForeachReciprocal,
    #[strum(serialize = "aten._foreach_sqrt.default")]
    ForeachSqrt,
    #[strum(serialize = "aten._foreach_add.List")]
    ForeachAddList,
    #[strum(serialize = "aten._foreach_div.List")]
    ForeachDivList,
    #[strum(serialize = "aten._foreach_mul.List")]
    ForeachMulList,
    #[strum(serialize = "aten._foreach_add.Scalar")]
    ForeachAddScalar,
    #[strum(serialize = "aten._foreach_div.Scalar")]
    ForeachDivScalar,
    #[strum(serialize = "aten._foreach_mul.Scalar")]
    ForeachMulScalar,
    #[strum(serialize = "aten._foreach_sub.Scalar")]
    ForeachSubScalar,
    #[strum(serialize = "aten._foreach_addcdiv.Scalar")]
    ForeachAddcdivScalar,
    #[strum(serialize = "aten._foreach_addcmul.Scalar")]
    ForeachAddcmulScalar,
    #[strum(serialize = "aten._foreach_pow.ScalarAndTensor")]
    ForeachPowScalarAndTensor,
    #[strum(serialize = "aten._fused_adam.default")]
    FusedAdam,
    #[strum(serialize = "aten.native_layer_norm.default")]
    NativeLayerNorm,
    #[strum(serialize = "aten.native_layer_norm_backward.default")]
    NativeLayerNormBackward,
    #[strum(serialize = "aten.slice_scatter.default")]
    SliceScatter,
    #[strum(serialize = "aten.nll_loss_forward.default")]
    NllLossForward,
    /// Generic element-wise binary operator, handled by a [`PointwiseRule`](super::PointwiseRule).
    #[strum(serialize = "aten.add.Tensor")]
    Add,
    /// Generic element-wise binary operator, handled by a [`PointwiseRule`](super::PointwiseRule).
    #[strum(serialize = "aten.mul.Tensor")]
    Mul,
}
