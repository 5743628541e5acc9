use alloc::vec;
use alloc::vec::Vec;

use super::{OpId, OpSchema, OutputSharding, OutputSpec, RuleContext, ShardingPropagator};
use crate::error::{PropagationError, ensure_contract};
use crate::sharding::{DTensorSpec, DisplayPlacements, Placement};

pub(crate) fn register(propagator: &mut ShardingPropagator) {
    propagator.register(&[OpId::NllLossForward], nll_loss_forward_rule);
}

/// How the per-sample losses are combined, as passed to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reduction {
    None,
    Mean,
    Sum,
}

impl TryFrom<i64> for Reduction {
    type Error = PropagationError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Reduction::None),
            1 => Ok(Reduction::Mean),
            2 => Ok(Reduction::Sum),
            other => Err(PropagationError::contract(alloc::format!(
                "unknown loss reduction {other}"
            ))),
        }
    }
}

/// `input`, `target`, `weight?`, `reduction`, `ignore_index`.
///
/// Only the batch dim can stay sharded, with `target` split the same way. A mean needs the
/// global count of non-ignored targets, so it runs replicated. A sum leaves each rank with a
/// partial loss.
fn nll_loss_forward_rule(
    op_schema: &OpSchema,
    _context: &RuleContext<'_>,
) -> Result<OutputSharding, PropagationError> {
    let input = op_schema.arg(0)?.as_spec()?;
    let target = op_schema.arg(1)?.as_spec()?;
    let weight = op_schema.arg(2)?.as_optional_spec()?;
    let reduction = Reduction::try_from(op_schema.arg(3)?.as_int()?)?;
    op_schema.arg(4)?.as_int()?;

    let input_ndim = input.ndim()?;
    let target_ndim = target.ndim()?;
    ensure_contract!(
        input_ndim == 1 || input_ndim == 2,
        "input must be 1-d or 2-d, got {input_ndim}-d"
    );
    ensure_contract!(
        target_ndim + 1 == input_ndim,
        "a {input_ndim}-d input needs a {}-d target, got {target_ndim}-d",
        input_ndim - 1
    );
    if let Some(weight) = weight {
        ensure_contract!(
            weight.is_replicated(),
            "class weights must be replicated, got {}",
            DisplayPlacements(weight.placements())
        );
    }

    let batched = input_ndim == 2 && reduction != Reduction::Mean;
    let placements: Vec<Placement> = input
        .placements()
        .iter()
        .map(|placement| match placement {
            Placement::Shard { dim: 0 } if batched => Placement::shard(0),
            _ => Placement::Replicate,
        })
        .collect();

    log::debug!(
        "nll_loss_forward with {reduction:?} reduction: input {} target {}, wanted {}",
        DisplayPlacements(input.placements()),
        DisplayPlacements(target.placements()),
        DisplayPlacements(&placements)
    );

    if input.placements() != placements.as_slice() || target.placements() != placements.as_slice()
    {
        let mut args_schema = op_schema.args_schema.clone();
        args_schema[0] = input.with_placements(placements.clone())?.into();
        args_schema[1] = target.with_placements(placements)?.into();
        return Ok(OutputSharding::suggest(op_schema.with_args(args_schema)));
    }

    let mesh = input.mesh().clone();
    let (result, total_weight) = match reduction {
        Reduction::None => (placements, vec![Placement::Replicate; mesh.ndim()]),
        Reduction::Sum => {
            let partial: Vec<Placement> = placements
                .iter()
                .map(|placement| match placement {
                    Placement::Shard { .. } => Placement::partial(),
                    other => *other,
                })
                .collect();
            (partial.clone(), partial)
        }
        Reduction::Mean => (placements.clone(), placements),
    };

    Ok(OutputSharding::resolved(OutputSpec::Tuple(vec![
        Some(DTensorSpec::new(mesh.clone(), result)?.into()),
        Some(DTensorSpec::new(mesh, total_weight)?.into()),
    ])))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    use crate::ops::ArgSchema;
    use crate::test_utils::{first_suggestion, mesh_1d, mesh_2d, placements_of, spec};

    const R: Placement = Placement::Replicate;
    const S0: Placement = Placement::Shard { dim: 0 };
    const S1: Placement = Placement::Shard { dim: 1 };
    const P: Placement = Placement::partial();

    fn nll(input: &[Placement], target: &[Placement], reduction: i64) -> OpSchema {
        let mesh = if input.len() == 1 { mesh_1d() } else { mesh_2d() };
        OpSchema::new(
            OpId::NllLossForward,
            vec![
                spec(&mesh, input, &[8, 10]).into(),
                spec(&mesh, target, &[8]).into(),
                ArgSchema::NONE,
                reduction.into(),
                (-100i64).into(),
            ],
        )
    }

    fn outputs(output: &OutputSharding) -> (Vec<Placement>, Vec<Placement>) {
        let outputs = output.output_spec().unwrap().as_tuple().unwrap();
        assert_eq!(outputs.len(), 2);
        let placements = |idx: usize| {
            outputs[idx]
                .as_ref()
                .and_then(OutputSpec::as_spec)
                .unwrap()
                .placements()
                .to_vec()
        };
        (placements(0), placements(1))
    }

    #[rstest]
    #[case(&[S0], 0, (vec![S0], vec![R]))]
    #[case(&[S0], 2, (vec![P], vec![P]))]
    #[case(&[R], 0, (vec![R], vec![R]))]
    #[case(&[R], 1, (vec![R], vec![R]))]
    #[case(&[S0, R], 2, (vec![P, R], vec![P, R]))]
    #[case(&[R, S0], 0, (vec![R, S0], vec![R, R]))]
    fn batch_sharded_loss(
        #[case] placements: &[Placement],
        #[case] reduction: i64,
        #[case] expected: (Vec<Placement>, Vec<Placement>),
    ) {
        let schema = nll(placements, placements, reduction);

        let output = ShardingPropagator::default().propagate(&schema).unwrap();

        assert_eq!(outputs(&output), expected);
    }

    #[rstest]
    #[case(&[S1], &[R], 0, &[R])]
    #[case(&[S0], &[S0], 1, &[R])]
    #[case(&[S0], &[R], 2, &[S0])]
    #[case(&[P], &[R], 0, &[R])]
    #[case(&[S0, S1], &[S0, R], 0, &[S0, R])]
    fn redistributes_to_batch_sharding(
        #[case] input: &[Placement],
        #[case] target: &[Placement],
        #[case] reduction: i64,
        #[case] expected: &[Placement],
    ) {
        let propagator = ShardingPropagator::default();
        let schema = nll(input, target, reduction);

        let output = propagator.propagate(&schema).unwrap();

        let suggestion = first_suggestion(&output);
        assert_eq!(placements_of(&suggestion.args_schema[0]), vec![expected.to_vec()]);
        assert_eq!(placements_of(&suggestion.args_schema[1]), vec![expected.to_vec()]);
        assert_eq!(&suggestion.args_schema[2..], &schema.args_schema[2..]);
        assert!(!propagator.propagate(suggestion).unwrap().needs_redistribute());
    }

    #[test]
    fn unbatched_input_is_replicated() {
        let mesh = mesh_1d();
        let schema = OpSchema::new(
            OpId::NllLossForward,
            vec![
                spec(&mesh, &[S0], &[10]).into(),
                spec(&mesh, &[R], &[]).into(),
                ArgSchema::NONE,
                2i64.into(),
                (-100i64).into(),
            ],
        );

        let output = ShardingPropagator::default().propagate(&schema).unwrap();

        let suggestion = first_suggestion(&output);
        assert_eq!(placements_of(&suggestion.args_schema[0]), vec![vec![R]]);
    }

    #[rstest]
    #[case(3)]
    #[case(-1)]
    fn unknown_reduction_is_a_contract_violation(#[case] reduction: i64) {
        let schema = nll(&[S0], &[S0], reduction);

        assert!(ShardingPropagator::default().propagate(&schema).is_err());
    }

    #[test]
    fn sharded_class_weights_are_a_contract_violation() {
        let mesh = mesh_1d();
        let mut schema = nll(&[S0], &[S0], 0);
        schema.args_schema[2] = spec(&mesh, &[S0], &[10]).into();

        assert!(ShardingPropagator::default().propagate(&schema).is_err());

        schema.args_schema[2] = spec(&mesh, &[R], &[10]).into();
        assert!(ShardingPropagator::default().propagate(&schema).is_ok());
    }

    #[test]
    fn target_rank_must_match() {
        let mesh = mesh_1d();
        let mut schema = nll(&[S0], &[S0], 0);
        schema.args_schema[1] = spec(&mesh, &[S0], &[8, 1]).into();

        assert!(ShardingPropagator::default().propagate(&schema).is_err());
    }
}
