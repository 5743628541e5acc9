use alloc::vec::Vec;

use super::{
    ArgSchema, OpId, OpSchema, OutputSharding, RuleContext, ShardingPropagator, refine_sharding,
};
use crate::error::{PropagationError, ensure_contract};
use crate::sharding::{DTensorSpec, DisplayPlacements, Placement};

const DEFAULT_DIM: ArgSchema = ArgSchema::Value(crate::ops::ScalarValue::Int(0));
const DEFAULT_STEP: ArgSchema = ArgSchema::Value(crate::ops::ScalarValue::Int(1));

pub(crate) fn register(propagator: &mut ShardingPropagator) {
    propagator.register(&[OpId::SliceScatter], slice_scatter_rule);
}

/// `input`, `src`, `dim = 0`, `start = None`, `end = None`, `step = 1`.
///
/// Both tensors follow the element-wise sharding of the pair, except that the scatter
/// dimension cannot stay sharded: `src` only covers a slice of it, so it is replicated. When
/// `src` spans the whole dimension the scatter is a plain copy and no exception applies; the
/// slice must then be given explicitly, starting at 0 and ending at or past the extent.
fn slice_scatter_rule(
    op_schema: &OpSchema,
    context: &RuleContext<'_>,
) -> Result<OutputSharding, PropagationError> {
    let input = op_schema.arg(0)?.as_spec()?;
    let src = op_schema.arg(1)?.as_spec()?;
    let dim = op_schema.arg_or(2, &DEFAULT_DIM).as_int()?;
    let start = op_schema.arg_or(3, &ArgSchema::NONE).as_optional_int()?;
    let end = op_schema.arg_or(4, &ArgSchema::NONE).as_optional_int()?;
    op_schema.arg_or(5, &DEFAULT_STEP).as_int()?;

    let input_shape = input.shape()?;
    let src_shape = src.shape()?;
    let dim = normalize_dim(dim, input_shape.len())?;
    ensure_contract!(
        dim < src_shape.len(),
        "scatter dim {dim} out of range for a {}-d source",
        src_shape.len()
    );

    let active_dim = if input_shape[dim] == src_shape[dim] {
        let extent = src_shape[dim] as i64;
        ensure_contract!(
            start == Some(0),
            "a source spanning dim {dim} must be scattered from 0, got start {start:?}"
        );
        ensure_contract!(
            end.is_some_and(|end| end >= extent),
            "a source spanning dim {dim} must be scattered up to {extent}, got end {end:?}"
        );
        None
    } else {
        Some(dim)
    };

    let placements: Vec<Placement> = refine_sharding(op_schema, active_dim, context.pointwise)?
        .into_iter()
        .map(|placement| match (placement, active_dim) {
            (Placement::Shard { dim }, Some(active)) if dim == active => Placement::Replicate,
            (placement, _) => placement,
        })
        .collect();

    if input.placements() == placements.as_slice() && src.placements() == placements.as_slice() {
        let output = DTensorSpec::new(input.mesh().clone(), placements)?;
        return Ok(OutputSharding::resolved(output));
    }

    log::debug!(
        "slice_scatter over dim {dim}: moving input {} and src {} to {}",
        DisplayPlacements(input.placements()),
        DisplayPlacements(src.placements()),
        DisplayPlacements(&placements)
    );

    let mut args_schema = Vec::with_capacity(op_schema.args_schema.len());
    args_schema.push(input.with_placements(placements.clone())?.into());
    args_schema.push(src.with_placements(placements)?.into());
    args_schema.extend(op_schema.args_schema.iter().skip(2).cloned());

    Ok(OutputSharding::suggest(op_schema.with_args(args_schema)))
}

fn normalize_dim(dim: i64, ndim: usize) -> Result<usize, PropagationError> {
    let normalized = if dim < 0 { dim + ndim as i64 } else { dim };
    ensure_contract!(
        (0..ndim as i64).contains(&normalized),
        "scatter dim {dim} out of range for a {ndim}-d input"
    );
    Ok(normalized as usize)
}
