use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec;
use alloc::vec::Vec;

use super::{ArgSchema, OpSchema, OutputSharding, OutputSpec};
use crate::error::{PropagationError, ensure_contract};
use crate::sharding::{DTensorSpec, DisplayPlacements, Placement};

/// Propagation for element-wise operators whose operands broadcast against each other.
///
/// The sharding engine consumes this rule as a collaborator: rules for operators that behave
/// element-wise except on one dimension (see [`refine_sharding`]) delegate to it instead of
/// re-implementing broadcasting.
pub trait PointwiseRule: Send + Sync {
    /// Propagates the specs of `op_schema` through an element-wise operator.
    ///
    /// With `linearity`, inputs that all carry the same pending sums stay `Partial` and the
    /// output inherits them; otherwise every pending sum has to be reduced first.
    fn propagate(
        &self,
        op_schema: &OpSchema,
        linearity: bool,
    ) -> Result<OutputSharding, PropagationError>;
}

/// Label of one dimension of a broadcast operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DimLabel {
    /// The operand's dim lines up with output dim `n`.
    Axis(usize),
    /// The operand has extent 1 here and is broadcast.
    Singleton,
}

/// Default [`PointwiseRule`], labelling every operand dimension against the broadcast output
/// and merging shardings label by label, einsum style.
///
/// Merge policy per label:
/// - replicated and sharded operands: reshard the replicated one to match;
/// - two different mesh dims: keep the first operand's;
/// - one mesh dim sharding two labels: keep the label with the largest communication volume;
/// - in-place invocations: the first operand's sharding is enforced.
#[derive(Debug, Default, Clone, Copy)]
pub struct EinsumPointwiseRule;

impl PointwiseRule for EinsumPointwiseRule {
    fn propagate(
        &self,
        op_schema: &OpSchema,
        linearity: bool,
    ) -> Result<OutputSharding, PropagationError> {
        let specs: Vec<&DTensorSpec> = op_schema.arg_specs().collect();
        ensure_contract!(!specs.is_empty(), "element-wise operator without tensor operands");

        let shapes = specs
            .iter()
            .map(|spec| spec.shape())
            .collect::<Result<Vec<_>, _>>()?;
        let max_dim = shapes.iter().map(|shape| shape.len()).max().unwrap_or(0);

        let mut singleton_counter = vec![0usize; max_dim];
        let mut labels: Vec<Vec<DimLabel>> = Vec::with_capacity(specs.len());
        for shape in &shapes {
            let start_dim = max_dim - shape.len();
            let mut input_labels: Vec<DimLabel> = (start_dim..max_dim).map(DimLabel::Axis).collect();

            if specs.len() > 1 {
                for (out_dim, counter) in singleton_counter.iter_mut().enumerate() {
                    if out_dim < start_dim {
                        *counter += 1;
                    } else if shape[out_dim - start_dim] == 1 {
                        *counter += 1;
                        input_labels[out_dim - start_dim] = DimLabel::Singleton;
                    }
                }
            }
            labels.push(input_labels);
        }

        let output_labels: Vec<DimLabel> = (0..max_dim)
            .map(|out_dim| {
                if singleton_counter[out_dim] == specs.len() {
                    DimLabel::Singleton
                } else {
                    DimLabel::Axis(out_dim)
                }
            })
            .collect();

        let mut enforce_sharding = BTreeMap::new();
        if op_schema.is_inplace {
            for (label, mesh_dim) in output_labels.iter().zip(specs[0].dim_map()?) {
                enforce_sharding.insert(*label, mesh_dim);
            }
        }

        let mut merger = ShardingMerger::default();
        for (input_labels, spec) in labels.iter().zip(&specs) {
            merger.merge_input(input_labels, spec, &enforce_sharding)?;
        }
        merger.resolve_conflicts(&labels, &specs, linearity)?;

        if !merger.pending_sums.is_empty() && !linearity {
            log::trace!(
                "{}: pending sums on mesh dims {:?} must be reduced first",
                op_schema.op,
                merger.pending_sums.keys().collect::<Vec<_>>()
            );
            return merger.suggest(op_schema, &labels, &specs, &[]);
        }
        if merger
            .pending_sums
            .values()
            .any(|&count| count != specs.len())
        {
            merger.needs_reshard = true;
        }

        let mut pending_sums: Vec<usize> = merger.pending_sums.keys().copied().collect();
        if merger.needs_reshard {
            return merger.suggest(op_schema, &labels, &specs, &pending_sums);
        }

        // A sharded label absent from the output is summed over.
        for (label, mesh_dim) in &merger.dim_to_sharding {
            if let Some(mesh_dim) = *mesh_dim {
                if !output_labels.contains(label) && !pending_sums.contains(&mesh_dim) {
                    pending_sums.push(mesh_dim);
                }
            }
        }

        let mut output_dim_map = Vec::with_capacity(max_dim);
        let mut output_shape = Vec::with_capacity(max_dim);
        for label in &output_labels {
            match label {
                DimLabel::Singleton => {
                    output_dim_map.push(None);
                    output_shape.push(1);
                }
                DimLabel::Axis(_) => {
                    output_dim_map.push(merger.dim_to_sharding.get(label).copied().flatten());
                    output_shape.push(merger.dim_to_size.get(label).copied().unwrap_or(1));
                }
            }
        }

        let output_meta = specs[0]
            .tensor_meta()
            .map(|meta| meta.with_shape(output_shape));
        let output = DTensorSpec::from_dim_map(
            specs[0].mesh().clone(),
            &dedup_mesh_dims(output_dim_map),
            &pending_sums,
            output_meta,
        )?;

        Ok(OutputSharding::resolved(output))
    }
}

#[derive(Default)]
struct ShardingMerger {
    dim_to_sharding: BTreeMap<DimLabel, Option<usize>>,
    dim_to_size: BTreeMap<DimLabel, usize>,
    /// Mesh dim holding a pending sum, to the number of inputs carrying it.
    pending_sums: BTreeMap<usize, usize>,
    /// Mesh dim, to the labels it shards.
    seen_shardings: BTreeMap<usize, Vec<DimLabel>>,
    needs_reshard: bool,
}

impl ShardingMerger {
    fn merge_input(
        &mut self,
        labels: &[DimLabel],
        spec: &DTensorSpec,
        enforce_sharding: &BTreeMap<DimLabel, Option<usize>>,
    ) -> Result<(), PropagationError> {
        for mesh_dim in spec.sums() {
            *self.pending_sums.entry(mesh_dim).or_default() += 1;
        }

        let shape = spec.shape()?;
        for (idx, (label, mesh_dim)) in labels.iter().zip(spec.dim_map()?).enumerate() {
            let merged = if let Some(&enforced) = enforce_sharding.get(label) {
                if enforced != mesh_dim {
                    self.needs_reshard = true;
                }
                enforced
            } else {
                let current = self.dim_to_sharding.get(label).copied();
                match current {
                    None => mesh_dim,
                    Some(current) => self.merge(current, mesh_dim),
                }
            };
            self.dim_to_sharding.insert(*label, merged);

            if let DimLabel::Axis(out_dim) = label {
                let size = *self.dim_to_size.entry(*label).or_insert(shape[idx]);
                ensure_contract!(
                    size == shape[idx],
                    "operands do not broadcast: output dim {out_dim} has extents {size} and {}",
                    shape[idx]
                );
            }

            if let Some(mesh_dim) = merged {
                let seen = self.seen_shardings.entry(mesh_dim).or_default();
                if !seen.contains(label) {
                    if !seen.is_empty() {
                        self.needs_reshard = true;
                    }
                    seen.push(*label);
                }
            }
        }

        Ok(())
    }

    fn merge(&mut self, current: Option<usize>, incoming: Option<usize>) -> Option<usize> {
        if current == incoming {
            return current;
        }

        self.needs_reshard = true;
        log::trace!("merging shardings {current:?} and {incoming:?}");
        current.or(incoming)
    }

    /// Keeps a single label per mesh dim. When pending sums are kept, a mesh dim holding one
    /// cannot shard anything.
    fn resolve_conflicts(
        &mut self,
        labels: &[Vec<DimLabel>],
        specs: &[&DTensorSpec],
        keep_sums: bool,
    ) -> Result<(), PropagationError> {
        for (&mesh_dim, dims) in &self.seen_shardings {
            if keep_sums && self.pending_sums.contains_key(&mesh_dim) {
                self.needs_reshard = true;
                for dim in dims {
                    self.dim_to_sharding.insert(*dim, None);
                }
                continue;
            }
            if dims.len() < 2 {
                continue;
            }

            let mut costs = Vec::with_capacity(dims.len());
            for dim in dims {
                let mut cost = 0;
                for (input_labels, spec) in labels.iter().zip(specs) {
                    let dim_map = spec.dim_map()?;
                    let sharded_here = input_labels
                        .iter()
                        .position(|label| label == dim)
                        .is_some_and(|idx| dim_map[idx] == Some(mesh_dim));
                    if sharded_here {
                        let local_numel: usize = spec.local_shape()?.iter().product();
                        cost += local_numel * spec.mesh().size(mesh_dim);
                    }
                }
                costs.push(cost);
            }

            let max_cost = costs.iter().copied().max().unwrap_or(0);
            let keep = costs.iter().position(|&cost| cost == max_cost).unwrap_or(0);
            for (idx, dim) in dims.iter().enumerate() {
                if idx != keep {
                    self.dim_to_sharding.insert(*dim, None);
                }
            }
        }

        Ok(())
    }

    fn suggest(
        &self,
        op_schema: &OpSchema,
        labels: &[Vec<DimLabel>],
        specs: &[&DTensorSpec],
        pending_sums: &[usize],
    ) -> Result<OutputSharding, PropagationError> {
        let mut suggested = Vec::with_capacity(specs.len());
        for (input_labels, spec) in labels.iter().zip(specs) {
            let dim_map = input_labels
                .iter()
                .map(|label| self.dim_to_sharding.get(label).copied().flatten())
                .collect();
            let spec = DTensorSpec::from_dim_map(
                spec.mesh().clone(),
                &dedup_mesh_dims(dim_map),
                pending_sums,
                spec.tensor_meta().cloned(),
            )?;
            log::trace!(
                "{}: suggesting {}",
                op_schema.op,
                DisplayPlacements(spec.placements())
            );
            suggested.push(spec);
        }

        let mut suggested = suggested.into_iter();
        let args = op_schema
            .args_schema
            .iter()
            .map(|arg| match arg {
                ArgSchema::Spec(_) => suggested.next().map_or(ArgSchema::NONE, ArgSchema::Spec),
                other => other.clone(),
            })
            .collect();

        Ok(OutputSharding::suggest(op_schema.with_args(args)))
    }
}

/// Broadcast singletons share a label, so the same mesh dim can come back for several dims of
/// one operand. Only the first keeps it.
fn dedup_mesh_dims(mut dim_map: Vec<Option<usize>>) -> Vec<Option<usize>> {
    let mut used = BTreeSet::new();
    for mesh_dim in dim_map.iter_mut() {
        if let Some(dim) = *mesh_dim {
            if !used.insert(dim) {
                *mesh_dim = None;
            }
        }
    }
    dim_map
}

/// Placements an element-wise operator would settle on for the first two arguments of
/// `op_schema`, ignoring the extent of `active_dim`.
///
/// Operators like `slice_scatter` behave element-wise except along one dimension, where the
/// two operands legitimately differ in size. That dimension is collapsed to a broadcastable
/// singleton in both operands before asking `pointwise`. With `active_dim = None` the shapes
/// are taken as they are.
///
/// The placements come from the resolved output, or from the first operand of the first
/// suggestion when the pointwise rule asks for a redistribution.
pub fn refine_sharding(
    op_schema: &OpSchema,
    active_dim: Option<usize>,
    pointwise: &dyn PointwiseRule,
) -> Result<Vec<Placement>, PropagationError> {
    let mut args_schema = Vec::with_capacity(2);
    for idx in 0..2 {
        let spec = op_schema.arg(idx)?.as_spec()?;
        let meta = spec.meta()?;
        let meta = match active_dim {
            Some(dim) => {
                ensure_contract!(
                    dim < meta.ndim(),
                    "active dim {dim} out of range for a {}-d tensor",
                    meta.ndim()
                );
                let mut shape = meta.shape.clone();
                shape[dim] = 1;
                meta.with_shape(shape)
            }
            None => meta.clone(),
        };
        args_schema.push(ArgSchema::Spec(spec.clone().with_meta(meta)));
    }

    let schema = OpSchema::new(op_schema.op, args_schema)
        .with_inplace(op_schema.is_inplace)
        .with_out_variant(op_schema.is_out_variant);

    match pointwise.propagate(&schema, false)? {
        OutputSharding::Resolved(OutputSpec::Spec(spec)) => Ok(spec.placements().to_vec()),
        OutputSharding::Resolved(other) => Err(PropagationError::contract(alloc::format!(
            "pointwise rule resolved to a non-tensor output: {other:?}"
        ))),
        OutputSharding::Suggestions(schemas) => {
            let first = schemas
                .first()
                .ok_or_else(|| PropagationError::contract("pointwise rule gave no suggestion"))?;
            Ok(first.arg(0)?.as_spec()?.placements().to_vec())
        }
    }
}
