use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use burn_tensor::DType;

use crate::ops::{ArgSchema, OutputSharding};
use crate::sharding::{DTensorSpec, DeviceMesh, DeviceMeshBuilder, MeshDim, Placement, TensorMeta};

pub(crate) fn mesh_1d() -> Arc<DeviceMesh> {
    Arc::new(DeviceMesh::from_devices(vec![0, 1]).unwrap())
}

pub(crate) fn mesh_2d() -> Arc<DeviceMesh> {
    Arc::new(
        DeviceMeshBuilder::new(vec![0, 1, 2, 3], [2, 2])
            .with_dim(0, MeshDim::new("dp"))
            .with_dim(1, MeshDim::new("tp"))
            .build()
            .unwrap(),
    )
}

pub(crate) fn spec(mesh: &Arc<DeviceMesh>, placements: &[Placement], shape: &[usize]) -> DTensorSpec {
    DTensorSpec::new(mesh.clone(), placements.to_vec())
        .unwrap()
        .with_meta(TensorMeta::new(shape, DType::F32))
}

pub(crate) fn spec_list(mesh: &Arc<DeviceMesh>, placements: &[Placement]) -> ArgSchema {
    let specs: Vec<DTensorSpec> = placements
        .iter()
        .map(|placement| spec(mesh, &[*placement], &[4, 4]))
        .collect();
    ArgSchema::SpecList(specs)
}

pub(crate) fn placements_of(arg: &ArgSchema) -> Vec<Vec<Placement>> {
    match arg {
        ArgSchema::Spec(spec) => vec![spec.placements().to_vec()],
        ArgSchema::SpecList(specs) => specs.iter().map(|spec| spec.placements().to_vec()).collect(),
        ArgSchema::Value(_) => Vec::new(),
    }
}

pub(crate) fn first_suggestion(output: &OutputSharding) -> &crate::ops::OpSchema {
    let suggestions = output.schema_suggestions();
    assert_eq!(suggestions.len(), 1, "expected one suggestion, got {output:?}");
    &suggestions[0]
}
