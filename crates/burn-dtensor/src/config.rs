//! Options of the sharding propagator.

use core::fmt::Display;

use serde::{Deserialize, Serialize};

/// Options shared by every propagation rule of a [`ShardingPropagator`](crate::ops::ShardingPropagator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationConfig {
    pub(crate) reject_partial_sqrt: bool,
    pub(crate) pointwise_linearity: bool,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for PropagationConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let reject_partial_sqrt = self.reject_partial_sqrt;
        let pointwise_linearity = self.pointwise_linearity;

        write!(
            f,
            r#"
PropagationConfig {{
    reject_partial_sqrt: {reject_partial_sqrt:?},
    pointwise_linearity: {pointwise_linearity:?},
}}
"#
        )
    }
}

impl PropagationConfig {
    fn new() -> Self {
        Self {
            reject_partial_sqrt: false,
            pointwise_linearity: false,
        }
    }

    /// Whether `_foreach_sqrt` refuses tensors holding a pending sum.
    ///
    /// The square root of a sum is not the sum of square roots, so running the operator on a
    /// `Partial` placement silently produces wrong values. When enabled, the rule suggests
    /// replicating those mesh dimensions first. Disabled by default, in which case the caller
    /// is trusted never to pass a `Partial` tensor.
    pub fn with_reject_partial_sqrt(mut self, reject: bool) -> Self {
        self.reject_partial_sqrt = reject;
        self
    }

    /// Whether the pointwise collaborator treats the operator as linear.
    ///
    /// A linear operator can run on `Partial` inputs as long as every input carries the same
    /// pending sums, deferring the reduction to its output.
    pub fn with_pointwise_linearity(mut self, linearity: bool) -> Self {
        self.pointwise_linearity = linearity;
        self
    }

    /// See [with_reject_partial_sqrt](Self::with_reject_partial_sqrt).
    pub fn reject_partial_sqrt(&self) -> bool {
        self.reject_partial_sqrt
    }

    /// See [with_pointwise_linearity](Self::with_pointwise_linearity).
    pub fn pointwise_linearity(&self) -> bool {
        self.pointwise_linearity
    }
}
