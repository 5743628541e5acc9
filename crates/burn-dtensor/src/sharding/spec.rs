use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt::{self, Display};

use burn_tensor::DType;

use super::{DeviceMesh, DisplayPlacements, Placement};
use crate::error::{PropagationError, ensure_contract};

/// Memory layout tag of a tensor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFormat {
    /// Row-major, densely packed.
    #[default]
    Contiguous,
    /// Channels stored innermost (NHWC).
    ChannelsLast,
    /// Keep whatever layout the source tensor had.
    Preserve,
}

/// Global metadata of the logical (unsharded) tensor a spec describes.
///
/// Metadata is never mutated by the propagation rules: a rule that needs a different shape
/// builds a new value with [`TensorMeta::with_shape`].
#[derive(Debug, Clone, PartialEq)]
pub struct TensorMeta {
    /// Global shape.
    pub shape: Vec<usize>,
    /// Element type.
    pub dtype: DType,
    /// Whether autograd tracks the tensor.
    pub requires_grad: bool,
    /// Element strides of the global tensor.
    pub stride: Vec<usize>,
    /// Memory layout tag.
    pub memory_format: MemoryFormat,
    /// Whether the tensor holds quantized values.
    pub is_quantized: bool,
    /// Quantization parameters, by name.
    pub qparams: Vec<(String, f64)>,
}

impl TensorMeta {
    /// Metadata for a contiguous, non-quantized tensor.
    pub fn new<S: Into<Vec<usize>>>(shape: S, dtype: DType) -> Self {
        let shape = shape.into();
        let stride = contiguous_strides(&shape);

        Self {
            shape,
            dtype,
            requires_grad: false,
            stride,
            memory_format: MemoryFormat::Contiguous,
            is_quantized: false,
            qparams: Vec::new(),
        }
    }

    /// Marks the tensor as tracked by autograd.
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    /// Copy of the metadata with another shape; every other field is kept as is.
    pub fn with_shape<S: Into<Vec<usize>>>(&self, shape: S) -> Self {
        Self {
            shape: shape.into(),
            ..self.clone()
        }
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }
}

fn contiguous_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for idx in (0..shape.len().saturating_sub(1)).rev() {
        strides[idx] = strides[idx + 1] * shape[idx + 1];
    }
    strides
}

/// Describes how one logical tensor is distributed over a [`DeviceMesh`].
///
/// The spec holds exactly one [`Placement`] per mesh dimension. Specs are values: changing a
/// placement means building a new spec. Propagation rules compare specs with
/// [`DTensorSpec::same_placements`], which ignores the mesh and the metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct DTensorSpec {
    mesh: Arc<DeviceMesh>,
    placements: Vec<Placement>,
    tensor_meta: Option<TensorMeta>,
}

impl DTensorSpec {
    /// Creates a spec without metadata.
    ///
    /// Fails when the number of placements differs from the mesh dimensionality.
    pub fn new<P: Into<Vec<Placement>>>(
        mesh: Arc<DeviceMesh>,
        placements: P,
    ) -> Result<Self, PropagationError> {
        let placements = placements.into();
        ensure_contract!(
            placements.len() == mesh.ndim(),
            "expected {} placements for a {}-d mesh, got {}",
            mesh.ndim(),
            mesh.ndim(),
            placements.len()
        );

        Ok(Self {
            mesh,
            placements,
            tensor_meta: None,
        })
    }

    /// A fully replicated spec.
    pub fn replicated(mesh: Arc<DeviceMesh>) -> Self {
        let placements = vec![Placement::Replicate; mesh.ndim()];
        Self {
            mesh,
            placements,
            tensor_meta: None,
        }
    }

    /// Rebuilds a spec from a dim map: `dim_map[d] = Some(m)` shards tensor dim `d` over mesh
    /// dim `m`, and every mesh dim in `sums` holds a pending sum.
    pub fn from_dim_map(
        mesh: Arc<DeviceMesh>,
        dim_map: &[Option<usize>],
        sums: &[usize],
        tensor_meta: Option<TensorMeta>,
    ) -> Result<Self, PropagationError> {
        let mut placements = vec![Placement::Replicate; mesh.ndim()];

        for &mesh_dim in sums {
            ensure_contract!(
                mesh_dim < mesh.ndim(),
                "pending sum on mesh dim {mesh_dim} of a {}-d mesh",
                mesh.ndim()
            );
            placements[mesh_dim] = Placement::partial();
        }

        for (tensor_dim, mesh_dim) in dim_map.iter().enumerate() {
            let Some(mesh_dim) = *mesh_dim else {
                continue;
            };
            ensure_contract!(
                mesh_dim < mesh.ndim(),
                "tensor dim {tensor_dim} mapped to mesh dim {mesh_dim} of a {}-d mesh",
                mesh.ndim()
            );
            ensure_contract!(
                placements[mesh_dim].is_replicate(),
                "mesh dim {mesh_dim} cannot shard tensor dim {tensor_dim}, it already holds {}",
                placements[mesh_dim]
            );
            placements[mesh_dim] = Placement::shard(tensor_dim);
        }

        Ok(Self {
            mesh,
            placements,
            tensor_meta,
        })
    }

    /// Attaches global metadata.
    pub fn with_meta(mut self, tensor_meta: TensorMeta) -> Self {
        self.tensor_meta = Some(tensor_meta);
        self
    }

    /// Same mesh and metadata, other placements.
    pub fn with_placements<P: Into<Vec<Placement>>>(
        &self,
        placements: P,
    ) -> Result<Self, PropagationError> {
        let spec = Self::new(self.mesh.clone(), placements)?;
        Ok(Self {
            tensor_meta: self.tensor_meta.clone(),
            ..spec
        })
    }

    /// The mesh the tensor is distributed over.
    pub fn mesh(&self) -> &Arc<DeviceMesh> {
        &self.mesh
    }

    /// One placement per mesh dimension.
    pub fn placements(&self) -> &[Placement] {
        &self.placements
    }

    /// Global metadata, when known.
    pub fn tensor_meta(&self) -> Option<&TensorMeta> {
        self.tensor_meta.as_ref()
    }

    /// Global metadata, required.
    pub fn meta(&self) -> Result<&TensorMeta, PropagationError> {
        self.tensor_meta
            .as_ref()
            .ok_or_else(|| PropagationError::contract("spec carries no tensor metadata"))
    }

    /// Global shape, required.
    pub fn shape(&self) -> Result<&[usize], PropagationError> {
        Ok(&self.meta()?.shape)
    }

    /// Number of tensor dimensions, required.
    pub fn ndim(&self) -> Result<usize, PropagationError> {
        Ok(self.meta()?.ndim())
    }

    /// Whether both specs carry the same placements. Mesh and metadata are not compared.
    pub fn same_placements(&self, other: &DTensorSpec) -> bool {
        self.placements == other.placements
    }

    /// Whether every placement is [`Placement::Replicate`].
    pub fn is_replicated(&self) -> bool {
        self.placements.iter().all(Placement::is_replicate)
    }

    /// For each tensor dim, the mesh dim sharding it.
    pub fn dim_map(&self) -> Result<Vec<Option<usize>>, PropagationError> {
        let mut dim_map = vec![None; self.ndim()?];

        for (mesh_dim, placement) in self.placements.iter().enumerate() {
            if let Placement::Shard { dim } = *placement {
                ensure_contract!(
                    dim < dim_map.len(),
                    "placement {placement} on a {}-d tensor",
                    dim_map.len()
                );
                ensure_contract!(
                    dim_map[dim].is_none(),
                    "tensor dim {dim} is sharded on more than one mesh dim: {}",
                    DisplayPlacements(&self.placements)
                );
                dim_map[dim] = Some(mesh_dim);
            }
        }

        Ok(dim_map)
    }

    /// Mesh dims holding a pending reduction.
    pub fn sums(&self) -> Vec<usize> {
        self.placements
            .iter()
            .enumerate()
            .filter(|(_, placement)| placement.is_partial())
            .map(|(mesh_dim, _)| mesh_dim)
            .collect()
    }

    /// Shape held by each rank, splitting sharded dims evenly (the last rank may hold less).
    pub fn local_shape(&self) -> Result<Vec<usize>, PropagationError> {
        let mut shape = self.shape()?.to_vec();

        for (mesh_dim, placement) in self.placements.iter().enumerate() {
            if let Placement::Shard { dim } = *placement {
                ensure_contract!(
                    dim < shape.len(),
                    "placement {placement} on a {}-d tensor",
                    shape.len()
                );
                shape[dim] = shape[dim].div_ceil(self.mesh.size(mesh_dim));
            }
        }

        Ok(shape)
    }
}

impl Display for DTensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Spec({}", DisplayPlacements(&self.placements))?;
        if let Some(meta) = &self.tensor_meta {
            write!(f, " {:?} {:?}", meta.shape, meta.dtype)?;
        }
        write!(f, ")")
    }
}
