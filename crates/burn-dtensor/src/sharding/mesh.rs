use alloc::string::String;
use alloc::vec::Vec;
use hashbrown::{HashMap, HashSet};

/// Represents a logical mesh dimension, identified by a unique name.
///
/// Mesh dimensions are used to define the logical structure of a device mesh.
/// They help organize and partition parallel computation workloads, such as data,
/// tensor, or pipeline parallelism, across the mesh. Each dimension is named
/// to provide unambiguous mapping during sharding operations.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct MeshDim {
    /// A name that uniquely identifies the mesh dimension.
    name: String,
}

impl MeshDim {
    /// Constructs a new [`MeshDim`] with the given name.
    pub fn new<S: Into<String>>(name: S) -> Self {
        MeshDim { name: name.into() }
    }

    /// The name of the mesh dimension.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Represents a logical arrangement of ranks used for parallel computation.
///
/// A `DeviceMesh` defines a structured, N-dimensional topology over a set of participant
/// ranks, where each dimension is given a unique name (e.g., `"dp"`, `"tp"`). Placements of a
/// [`DTensorSpec`](crate::sharding::DTensorSpec) are expressed per mesh dimension, so a spec over
/// a 2D mesh always carries exactly two placements.
///
/// Ranks are stored in row-major order: the rank at coordinate `[i, j]` of a `[2, 4]` mesh is
/// `devices[i * 4 + j]`.
///
/// The mesh is immutable once built and is shared between specs through an
/// [`Arc`](alloc::sync::Arc).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceMesh {
    /// Global ranks in an n-dimensional logical arrangement
    devices: Vec<usize>,
    /// Shape of the logical mesh
    shape: Vec<usize>,
    /// Maps dimension names to their indices in the mesh
    dims: HashMap<MeshDim, usize>,
}

/// Represents errors that can occur when constructing a `DeviceMesh`.
///
/// These errors are typically related to invalid dimension mappings or mismatches
/// between the device count and the mesh shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceMeshError {
    /// An invalid dimension was specified.
    #[error("invalid mesh dimension: {0}")]
    InvalidDimension(String),
    /// The mesh configuration is invalid.
    #[error("invalid mesh: {0}")]
    InvalidMesh(String),
}

impl DeviceMesh {
    /// Builds a one-dimensional mesh over the given ranks, with a single `"dp"` dimension.
    pub fn from_devices(devices: Vec<usize>) -> Result<Self, DeviceMeshError> {
        let len = devices.len();
        DeviceMeshBuilder::new(devices, [len])
            .with_dim(0, MeshDim::new("dp"))
            .build()
    }

    /// Number of mesh dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Shape of the logical mesh.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of ranks along the given mesh dimension.
    pub fn size(&self, mesh_dim: usize) -> usize {
        self.shape[mesh_dim]
    }

    /// Total number of ranks in the mesh.
    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    /// Ranks in row-major mesh order.
    pub fn devices(&self) -> &[usize] {
        &self.devices
    }

    /// Index of the named dimension in the mesh shape.
    pub fn dim_index(&self, dim: &MeshDim) -> Option<usize> {
        self.dims.get(dim).copied()
    }

    /// Whether the rank participates in this mesh.
    pub fn contains(&self, rank: usize) -> bool {
        self.devices.contains(&rank)
    }

    /// Coordinate of the given rank in the mesh, or `None` when it does not participate.
    pub fn coordinate_of(&self, rank: usize) -> Option<Vec<usize>> {
        let mut flat = self.devices.iter().position(|&device| device == rank)?;
        let mut coordinate = alloc::vec![0; self.shape.len()];

        for (idx, &size) in self.shape.iter().enumerate().rev() {
            coordinate[idx] = flat % size;
            flat /= size;
        }

        Some(coordinate)
    }
}

/// A builder for constructing a [`DeviceMesh`].
///
/// This builder allows you to define a logical mesh structure with a shape and
/// specific dimension mappings. Once all dimensions are mapped, the builder can
/// be used to construct the [`DeviceMesh`] instance.
#[derive(Clone, Debug)]
pub struct DeviceMeshBuilder {
    /// Global ranks in an n-dimensional logical arrangement.
    devices: Vec<usize>,
    /// Shape of the logical mesh.
    shape: Vec<usize>,
    /// Maps dimension names to their indices in the mesh.
    dims: HashMap<MeshDim, usize>,
}

impl DeviceMeshBuilder {
    /// Creates a new [`DeviceMeshBuilder`] with the given ranks and shape.
    ///
    /// # Arguments
    /// * `devices` - The global ranks to be arranged in the mesh, in row-major order.
    /// * `shape` - A vector representing the shape (dimensions) of the mesh.
    pub fn new<S: Into<Vec<usize>>>(devices: Vec<usize>, shape: S) -> Self {
        Self {
            devices,
            shape: shape.into(),
            dims: HashMap::new(),
        }
    }

    /// Adds a dimension to the logical mesh, associating it with a specific index.
    ///
    /// Each dimension represents a logical axis of parallelism and should correspond to a
    /// unique index in the shape of the mesh. This can be called multiple times to map
    /// various dimensions to indices in the mesh.
    ///
    /// # Example
    ///
    /// ```rust
    /// use burn_dtensor::sharding::{DeviceMeshBuilder, MeshDim};
    ///
    /// let mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
    ///     .with_dim(0, MeshDim::new("data_parallel"))
    ///     .with_dim(1, MeshDim::new("tensor_parallel"))
    ///     .build()
    ///     .unwrap();
    ///
    /// assert_eq!(mesh.ndim(), 2);
    /// ```
    ///
    /// In the example above, the first dimension (`"data_parallel"`) is assigned to index 0
    /// and the second dimension (`"tensor_parallel"`) is assigned to index 1 in the 2D mesh shape
    /// `[2, 2]`. A spec over this mesh carries one placement for each of them.
    pub fn with_dim(mut self, idx: usize, dim: MeshDim) -> Self {
        self.dims.insert(dim, idx);
        self
    }

    /// Builds a [`DeviceMesh`] from the current configuration.
    ///
    /// This method performs validation to ensure that all dimensions are correctly
    /// mapped and that the number of ranks matches the expected shape. If the
    /// validation fails, an error is returned.
    pub fn build(self) -> Result<DeviceMesh, DeviceMeshError> {
        let ndim = self.shape.len();
        let mut seen_indices = HashSet::new();

        for &idx in self.dims.values() {
            if idx >= ndim {
                return Err(DeviceMeshError::InvalidDimension(alloc::format!(
                    "Index {} exceeds mesh shape {:?}",
                    idx, self.shape
                )));
            }
            if !seen_indices.insert(idx) {
                return Err(DeviceMeshError::InvalidDimension(alloc::format!(
                    "Dimension {} already mapped",
                    idx
                )));
            }
        }

        if seen_indices.len() != ndim {
            return Err(DeviceMeshError::InvalidMesh(alloc::format!(
                "Not all mesh dimensions are mapped. Got {}, expected {}",
                seen_indices.len(),
                ndim
            )));
        }

        if let Some(idx) = self.shape.iter().position(|&size| size == 0) {
            return Err(DeviceMeshError::InvalidMesh(alloc::format!(
                "Mesh dimension {} is empty in shape {:?}",
                idx, self.shape
            )));
        }

        let expected_devices = self.shape.iter().product::<usize>();
        if self.devices.len() != expected_devices {
            return Err(DeviceMeshError::InvalidMesh(alloc::format!(
                "Device count ({}) doesn't match mesh shape {:?}",
                self.devices.len(),
                self.shape,
            )));
        }

        let mut seen_ranks = HashSet::new();
        if let Some(rank) = self.devices.iter().find(|&&rank| !seen_ranks.insert(rank)) {
            return Err(DeviceMeshError::InvalidMesh(alloc::format!(
                "Rank {} appears more than once",
                rank
            )));
        }

        Ok(DeviceMesh {
            devices: self.devices,
            shape: self.shape,
            dims: self.dims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    #[test]
    fn test_device_mesh_2x2() {
        let mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(1, MeshDim::new("y"))
            .build()
            .unwrap();

        assert_eq!(mesh.ndim(), 2);
        assert_eq!(mesh.size(1), 2);
        assert_eq!(mesh.num_devices(), 4);
        assert_eq!(mesh.dim_index(&MeshDim::new("y")), Some(1));
    }

    #[test]
    fn test_device_mesh_coordinates_are_row_major() {
        let mesh = DeviceMeshBuilder::new(vec![4, 5, 6, 7, 8, 9], [2, 3])
            .with_dim(0, MeshDim::new("dp"))
            .with_dim(1, MeshDim::new("tp"))
            .build()
            .unwrap();

        assert_eq!(mesh.coordinate_of(4), Some(vec![0, 0]));
        assert_eq!(mesh.coordinate_of(6), Some(vec![0, 2]));
        assert_eq!(mesh.coordinate_of(8), Some(vec![1, 1]));
        assert_eq!(mesh.coordinate_of(0), None);
        assert!(!mesh.contains(3));
    }

    #[test]
    fn test_device_mesh_from_devices() {
        let mesh = DeviceMesh::from_devices(vec![0, 1]).unwrap();

        assert_eq!(mesh.ndim(), 1);
        assert_eq!(mesh.shape(), &[2]);
        assert_eq!(mesh.dim_index(&MeshDim::new("dp")), Some(0));
    }

    #[test]
    #[should_panic = "InvalidDimension(\"Index 2 exceeds mesh shape [2, 2]\")"]
    fn test_device_mesh_dim_should_be_in_bound() {
        let _mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(2, MeshDim::new("y")) // out of bounds
            .build()
            .unwrap();
    }

    #[test]
    #[should_panic = "InvalidDimension(\"Dimension 0 already mapped\")"]
    fn test_device_mesh_dim_should_be_unique() {
        let _mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(0, MeshDim::new("y")) // already mapped
            .build()
            .unwrap();
    }

    #[test]
    #[should_panic = "InvalidMesh(\"Not all mesh dimensions are mapped."]
    fn test_device_mesh_dim_name_should_be_unique() {
        let _mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(1, MeshDim::new("x")) // same name is invalid
            .build()
            .unwrap();
    }

    #[test]
    #[should_panic = "InvalidMesh(\"Device count (4) doesn't match mesh shape [3, 2]"]
    fn test_device_mesh_devices_should_match_shape() {
        let _mesh = DeviceMeshBuilder::new(vec![0, 1, 2, 3], [3, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(1, MeshDim::new("y"))
            .build()
            .unwrap();
    }

    #[test]
    #[should_panic = "InvalidMesh(\"Mesh dimension 1 is empty in shape [2, 0]"]
    fn test_device_mesh_dims_should_not_be_empty() {
        let _mesh = DeviceMeshBuilder::new(vec![], [2, 0])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(1, MeshDim::new("y"))
            .build()
            .unwrap();
    }

    #[test]
    fn test_device_mesh_from_no_devices_is_an_error() {
        assert!(matches!(
            DeviceMesh::from_devices(vec![]),
            Err(DeviceMeshError::InvalidMesh(_))
        ));
    }

    #[test]
    #[should_panic = "InvalidMesh(\"Rank 1 appears more than once"]
    fn test_device_mesh_ranks_should_be_unique() {
        let _mesh = DeviceMeshBuilder::new(vec![0, 1, 1, 3], [2, 2])
            .with_dim(0, MeshDim::new("x"))
            .with_dim(1, MeshDim::new("y"))
            .build()
            .unwrap();
    }
}
