use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use super::{OpId, OpSchema, OutputSharding, OutputSpec, RuleContext, ShardingPropagator};
use crate::error::{PropagationError, ensure_contract};
use crate::sharding::{DTensorSpec, DeviceMesh, DisplayPlacements, Placement};

pub(crate) fn register(propagator: &mut ShardingPropagator) {
    propagator.register(&[OpId::NativeLayerNorm], native_layer_norm_rule);
    propagator.register(&[OpId::NativeLayerNormBackward], native_layer_norm_backward_rule);
}

/// Affine parameters are shared by every normalized row, so they cannot be split.
fn ensure_replicated(name: &str, spec: Option<&DTensorSpec>) -> Result<(), PropagationError> {
    if let Some(spec) = spec {
        ensure_contract!(
            spec.is_replicated(),
            "{name} must be replicated, got {}",
            DisplayPlacements(spec.placements())
        );
    }
    Ok(())
}

/// `input`, `normalized_shape`, `weight?`, `bias?`, `eps`.
///
/// The statistics are computed over the trailing `normalized_shape` dims, so only the leading
/// (batch) dims of `input` may be sharded. The output and both statistics (`mean`, `rstd`) keep
/// the input placements.
fn native_layer_norm_rule(
    op_schema: &OpSchema,
    _context: &RuleContext<'_>,
) -> Result<OutputSharding, PropagationError> {
    let input = op_schema.arg(0)?.as_spec()?;
    let normalized_shape = op_schema.arg(1)?.as_int_list()?;
    let weight = op_schema.arg(2)?.as_optional_spec()?;
    let bias = op_schema.arg(3)?.as_optional_spec()?;

    ensure_replicated("weight", weight)?;
    ensure_replicated("bias", bias)?;

    let ndim = input.ndim()?;
    ensure_contract!(
        normalized_shape.len() <= ndim,
        "cannot normalize {} dims of a {ndim}-d input",
        normalized_shape.len()
    );
    let batch_ndim = ndim - normalized_shape.len();
    let shardable = input.placements().iter().all(|placement| match placement {
        Placement::Replicate => true,
        Placement::Shard { dim } => *dim < batch_ndim,
        Placement::Partial { .. } => false,
    });
    ensure_contract!(
        shardable,
        "only the leading {batch_ndim} dims of the input can be sharded, got {}",
        DisplayPlacements(input.placements())
    );

    let mesh = weight.map_or(input.mesh(), DTensorSpec::mesh).clone();
    let stats = DTensorSpec::new(mesh, input.placements())?;

    Ok(OutputSharding::resolved(OutputSpec::Tuple(vec![
        Some(input.clone().into()),
        Some(stats.clone().into()),
        Some(stats.into()),
    ])))
}

/// `grad`, `input`, `normalized_shape`, `mean`, `rstd`, `weight?`, `bias?`, `output_mask`.
///
/// The weight and bias gradients sum over the batch, which is only possible locally when
/// `grad` is split along dim 0: each rank then holds a partial sum of those gradients. The
/// input gradient keeps the placements of `grad`. Outputs not selected by `output_mask` are
/// absent.
fn native_layer_norm_backward_rule(
    op_schema: &OpSchema,
    _context: &RuleContext<'_>,
) -> Result<OutputSharding, PropagationError> {
    let grad = op_schema.arg(0)?.as_spec()?;
    let weight = op_schema.arg(5)?.as_optional_spec()?;
    let bias = op_schema.arg(6)?.as_optional_spec()?;
    let output_mask = op_schema.arg(7)?.as_bool_list()?;

    ensure_contract!(
        output_mask.len() == 3,
        "output mask selects among 3 gradients, got {} flags",
        output_mask.len()
    );
    ensure_replicated("weight", weight)?;
    ensure_replicated("bias", bias)?;
    ensure_contract!(
        grad.placements().iter().any(|placement| placement.is_shard(Some(0))),
        "grad must be sharded on the batch dim, got {}",
        DisplayPlacements(grad.placements())
    );

    let grad_input = output_mask[0].then(|| OutputSpec::Spec(grad.clone()));
    let grad_weight = partial_grad("weight", output_mask[1], weight, grad)?;
    let grad_bias = partial_grad("bias", output_mask[2], bias, grad)?;

    Ok(OutputSharding::resolved(OutputSpec::Tuple(vec![
        grad_input,
        grad_weight,
        grad_bias,
    ])))
}

fn partial_grad(
    name: &str,
    requested: bool,
    param: Option<&DTensorSpec>,
    grad: &DTensorSpec,
) -> Result<Option<OutputSpec>, PropagationError> {
    if !requested {
        return Ok(None);
    }

    let param = param.ok_or_else(|| {
        PropagationError::contract(alloc::format!("{name} gradient requested without a {name}"))
    })?;
    let mesh: &Arc<DeviceMesh> = param.mesh();
    ensure_contract!(
        mesh.ndim() == grad.mesh().ndim(),
        "{name} lives on a {}-d mesh but grad on a {}-d mesh",
        mesh.ndim(),
        grad.mesh().ndim()
    );
    let placements: Vec<Placement> = vec![Placement::partial(); mesh.ndim()];

    Ok(Some(DTensorSpec::new(mesh.clone(), placements)?.into()))
}
