use core::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// The reduction applied when a [`Placement::Partial`] value is aggregated across a mesh
/// dimension.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum ReduceOp {
    /// Element-wise sum of all partial values.
    #[default]
    Sum,
    /// Element-wise mean of all partial values.
    Avg,
    /// Element-wise maximum.
    Max,
    /// Element-wise minimum.
    Min,
    /// Element-wise product.
    Product,
}

/// Describes how a tensor is laid out along one mesh dimension.
///
/// A [`DTensorSpec`](crate::sharding::DTensorSpec) holds exactly one placement per mesh
/// dimension.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Placement {
    /// Every rank along the mesh dimension holds a full copy.
    #[default]
    Replicate,
    /// The tensor is split along tensor dimension `dim` across the mesh dimension.
    Shard {
        /// The tensor dimension being split.
        dim: usize,
    },
    /// Every rank holds an unreduced contribution, to be combined with `reduce_op`.
    Partial {
        /// How the contributions are combined.
        reduce_op: ReduceOp,
    },
}

impl Placement {
    /// Full copy on every rank.
    pub const fn replicate() -> Self {
        Placement::Replicate
    }

    /// Split along the given tensor dimension.
    pub const fn shard(dim: usize) -> Self {
        Placement::Shard { dim }
    }

    /// Pending sum.
    pub const fn partial() -> Self {
        Placement::Partial {
            reduce_op: ReduceOp::Sum,
        }
    }

    /// Whether the placement is [`Placement::Replicate`].
    pub fn is_replicate(&self) -> bool {
        matches!(self, Placement::Replicate)
    }

    /// Whether the placement shards a tensor dimension.
    ///
    /// When `dim` is given, only a shard on that exact tensor dimension matches.
    pub fn is_shard(&self, dim: Option<usize>) -> bool {
        match (self, dim) {
            (Placement::Shard { .. }, None) => true,
            (Placement::Shard { dim: actual }, Some(expected)) => *actual == expected,
            _ => false,
        }
    }

    /// Whether the placement is a pending reduction.
    pub fn is_partial(&self) -> bool {
        matches!(self, Placement::Partial { .. })
    }
}

impl Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Replicate => write!(f, "R"),
            Placement::Shard { dim } => write!(f, "S({dim})"),
            Placement::Partial { reduce_op } => write!(f, "P({reduce_op})"),
        }
    }
}

/// Helper to render a placement list as `[S(0), R]` in log records.
pub(crate) struct DisplayPlacements<'a>(pub &'a [Placement]);

impl Display for DisplayPlacements<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (idx, placement) in self.0.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{placement}")?;
        }
        write!(f, "]")
    }
}
