//! Rules for the foreach operators, which apply the same element-wise operation to every
//! tensor of a list, and for the fused Adam step built on top of them.
//!
//! Element `i` of every operand list is combined with element `i` of the others, so the rules
//! only need the placements to agree index by index. When they do not, the first operand wins:
//! the other lists are re-specced with its placements, which makes the runtime redistribute
//! them (e.g. all-reduce a `Partial` operand when the first one is replicated).

use alloc::vec::Vec;

use super::{ArgSchema, OpId, OpSchema, OutputSharding, OutputSpec, RuleContext, ShardingPropagator};
use crate::error::{PropagationError, ensure_contract};
use crate::sharding::{DTensorSpec, Placement};

/// Number of tensor-list arguments of `_fused_adam`: params, grads, exp_avgs, exp_avg_sqs and
/// max_exp_avg_sqs.
const FUSED_ADAM_LISTS: usize = 5;

pub(crate) fn register(propagator: &mut ShardingPropagator) {
    propagator.register(
        &[OpId::ForeachNeg, OpId::ForeachReciprocal, OpId::ForeachSqrt],
        foreach_unary_rule,
    );
    propagator.register(
        &[OpId::ForeachAddList, OpId::ForeachDivList, OpId::ForeachMulList],
        foreach_binary_list_rule,
    );
    propagator.register(
        &[
            OpId::ForeachAddScalar,
            OpId::ForeachDivScalar,
            OpId::ForeachMulScalar,
            OpId::ForeachSubScalar,
        ],
        foreach_binary_scalar_rule,
    );
    propagator.register(
        &[OpId::ForeachAddcdivScalar, OpId::ForeachAddcmulScalar],
        foreach_addc_scalar_rule,
    );
    propagator.register(&[OpId::ForeachPowScalarAndTensor], foreach_pow_scalar_and_tensor_rule);
    propagator.register(&[OpId::FusedAdam], fused_adam_rule);
}

/// `self` (a list), output placed like the input.
///
/// Only exact for `Replicate` and `Shard` inputs when the operator is not linear: `sqrt` of a
/// `Partial` tensor is not the sum of per-rank square roots. Unless
/// [`reject_partial_sqrt`](crate::config::PropagationConfig::with_reject_partial_sqrt) is set,
/// such inputs are trusted not to occur.
fn foreach_unary_rule(
    op_schema: &OpSchema,
    context: &RuleContext<'_>,
) -> Result<OutputSharding, PropagationError> {
    let inputs = op_schema.arg(0)?.as_spec_list()?;

    let has_partial = inputs
        .iter()
        .any(|spec| spec.placements().iter().any(Placement::is_partial));
    if op_schema.op == OpId::ForeachSqrt && context.config.reject_partial_sqrt() && has_partial {
        let reduced = inputs
            .iter()
            .map(|spec| {
                let placements: Vec<Placement> = spec
                    .placements()
                    .iter()
                    .map(|placement| match placement {
                        Placement::Partial { .. } => Placement::Replicate,
                        other => *other,
                    })
                    .collect();
                spec.with_placements(placements)
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut args = op_schema.args_schema.clone();
        args[0] = ArgSchema::SpecList(reduced);
        return Ok(OutputSharding::suggest(op_schema.with_args(args)));
    }

    Ok(OutputSharding::resolved(inputs.to_vec()))
}

/// `self`, `other` (lists of equal length), optional `alpha`-like scalar.
fn foreach_binary_list_rule(
    op_schema: &OpSchema,
    _context: &RuleContext<'_>,
) -> Result<OutputSharding, PropagationError> {
    let inputs = op_schema.arg(0)?.as_spec_list()?;
    let others = op_schema.arg(1)?.as_spec_list()?;
    ensure_contract!(
        inputs.len() == others.len(),
        "two tensor lists must match in length, but got {} and {}",
        inputs.len(),
        others.len()
    );

    let mismatch = inputs
        .iter()
        .zip(others)
        .any(|(input, other)| !input.same_placements(other));
    if !mismatch {
        return Ok(OutputSharding::resolved(inputs.to_vec()));
    }

    let mut args = op_schema.args_schema.clone();
    args[1] = ArgSchema::SpecList(follow_placements(inputs, others)?);
    Ok(OutputSharding::suggest(op_schema.with_args(args)))
}

/// `self` (a list) and one scalar: only one tensor operand, so nothing can disagree.
fn foreach_binary_scalar_rule(
    op_schema: &OpSchema,
    _context: &RuleContext<'_>,
) -> Result<OutputSharding, PropagationError> {
    ensure_contract!(
        op_schema.args_schema.len() == 2,
        "expected a tensor list and a scalar, got {} arguments",
        op_schema.args_schema.len()
    );
    let inputs = op_schema.arg(0)?.as_spec_list()?;
    ensure_contract!(
        op_schema.arg(1)?.is_plain_scalar(),
        "expected a scalar as second operand, got {:?}",
        op_schema.arg(1)?
    );

    Ok(OutputSharding::resolved(inputs.to_vec()))
}

/// `self`, `tensor1`, `tensor2` (lists of equal length), optional `value` scalar.
fn foreach_addc_scalar_rule(
    op_schema: &OpSchema,
    _context: &RuleContext<'_>,
) -> Result<OutputSharding, PropagationError> {
    let inputs = op_schema.arg(0)?.as_spec_list()?;
    let tensors1 = op_schema.arg(1)?.as_spec_list()?;
    let tensors2 = op_schema.arg(2)?.as_spec_list()?;
    ensure_contract!(
        inputs.len() == tensors1.len() && inputs.len() == tensors2.len(),
        "three tensor lists must match in length, but got {}, {} and {}",
        inputs.len(),
        tensors1.len(),
        tensors2.len()
    );

    let mismatch = inputs
        .iter()
        .zip(tensors1)
        .zip(tensors2)
        .any(|((input, t1), t2)| !input.same_placements(t1) || !input.same_placements(t2));
    if !mismatch {
        return Ok(OutputSharding::resolved(inputs.to_vec()));
    }

    let mut args = op_schema.args_schema.clone();
    args[1] = ArgSchema::SpecList(follow_placements(inputs, tensors1)?);
    args[2] = ArgSchema::SpecList(follow_placements(inputs, tensors2)?);
    Ok(OutputSharding::suggest(op_schema.with_args(args)))
}

/// Scalar base, list of exponents: the output is placed like the exponents.
fn foreach_pow_scalar_and_tensor_rule(
    op_schema: &OpSchema,
    _context: &RuleContext<'_>,
) -> Result<OutputSharding, PropagationError> {
    ensure_contract!(
        op_schema.args_schema.len() == 2,
        "expected a scalar base and a tensor list, got {} arguments",
        op_schema.args_schema.len()
    );
    let exponents = op_schema.arg(1)?.as_spec_list()?;

    Ok(OutputSharding::resolved(exponents.to_vec()))
}

/// Five tensor lists followed by the optimizer hyper-parameters.
///
/// Unused state lists are passed empty; every other list has the same length. The step
/// updates the states in place, so the output is the distribution those states keep: the
/// placement of the first used list (the params in practice), once for each list.
fn fused_adam_rule(
    op_schema: &OpSchema,
    _context: &RuleContext<'_>,
) -> Result<OutputSharding, PropagationError> {
    let mut lists = Vec::with_capacity(FUSED_ADAM_LISTS);
    for idx in 0..FUSED_ADAM_LISTS {
        lists.push(op_schema.arg(idx)?.as_spec_list()?);
    }

    let used: Vec<&[DTensorSpec]> = lists.iter().copied().filter(|list| !list.is_empty()).collect();
    let Some(reference) = used.first().copied() else {
        return Ok(adam_output(lists[0]));
    };
    ensure_contract!(
        used.iter().all(|list| list.len() == reference.len()),
        "expect the same number of gradients and states, but got {:?}",
        lists.iter().map(|list| list.len()).collect::<Vec<_>>()
    );

    let mismatch = (0..reference.len()).any(|idx| {
        used.iter()
            .any(|list| !list[idx].same_placements(&reference[idx]))
    });
    if !mismatch {
        return Ok(adam_output(reference));
    }

    let mut args = op_schema.args_schema.clone();
    for (idx, list) in lists.iter().enumerate() {
        if !list.is_empty() {
            args[idx] = ArgSchema::SpecList(follow_placements(reference, list)?);
        }
    }
    Ok(OutputSharding::suggest(op_schema.with_args(args)))
}

fn adam_output(params: &[DTensorSpec]) -> OutputSharding {
    let slots = (0..FUSED_ADAM_LISTS)
        .map(|_| Some(OutputSpec::List(params.to_vec())))
        .collect();
    OutputSharding::resolved(OutputSpec::Tuple(slots))
}

/// Re-specs every tensor of `targets` with the placements of the tensor at the same index in
/// `leaders`. Each tensor keeps its own mesh and metadata.
fn follow_placements(
    leaders: &[DTensorSpec],
    targets: &[DTensorSpec],
) -> Result<Vec<DTensorSpec>, PropagationError> {
    leaders
        .iter()
        .zip(targets)
        .map(|(leader, target)| target.with_placements(leader.placements()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;
    use rstest::rstest;

    use crate::config::PropagationConfig;
    use crate::ops::ScalarValue;
    use crate::test_utils::{first_suggestion, mesh_1d, placements_of, spec_list};

    const R: Placement = Placement::Replicate;
    const S0: Placement = Placement::Shard { dim: 0 };
    const S1: Placement = Placement::Shard { dim: 1 };
    const P: Placement = Placement::partial();

    fn propagate(schema: &OpSchema) -> Result<OutputSharding, PropagationError> {
        ShardingPropagator::default().propagate(schema)
    }

    #[rstest]
    #[case(OpId::ForeachNeg)]
    #[case(OpId::ForeachReciprocal)]
    #[case(OpId::ForeachSqrt)]
    fn unary_passes_placements_through(#[case] op: OpId) {
        let mesh = mesh_1d();
        let inputs = spec_list(&mesh, &[S0, R, S1]);
        let schema = OpSchema::new(op, vec![inputs.clone()]);

        let output = propagate(&schema).unwrap();

        assert_eq!(
            output.output_spec(),
            Some(&OutputSpec::List(inputs.as_spec_list().unwrap().to_vec()))
        );
    }

    #[test]
    fn unary_accepts_an_empty_list() {
        let schema = OpSchema::new(OpId::ForeachNeg, vec![ArgSchema::SpecList(vec![])]);

        let output = propagate(&schema).unwrap();

        assert_eq!(output.output_spec(), Some(&OutputSpec::List(vec![])));
    }

    #[test]
    fn sqrt_of_partial_is_trusted_by_default() {
        let schema = OpSchema::new(OpId::ForeachSqrt, vec![spec_list(&mesh_1d(), &[P])]);

        let output = propagate(&schema).unwrap();

        assert!(!output.needs_redistribute());
    }

    #[test]
    fn sqrt_of_partial_can_be_rejected() {
        let propagator =
            ShardingPropagator::new(PropagationConfig::default().with_reject_partial_sqrt(true));
        let schema = OpSchema::new(OpId::ForeachSqrt, vec![spec_list(&mesh_1d(), &[P, S0])]);

        let output = propagator.propagate(&schema).unwrap();

        let suggestion = first_suggestion(&output);
        assert_eq!(placements_of(&suggestion.args_schema[0]), vec![vec![R], vec![S0]]);
        assert!(!propagator.propagate(suggestion).unwrap().needs_redistribute());
    }

    #[test]
    fn neg_of_partial_is_never_rejected() {
        let propagator =
            ShardingPropagator::new(PropagationConfig::default().with_reject_partial_sqrt(true));
        let schema = OpSchema::new(OpId::ForeachNeg, vec![spec_list(&mesh_1d(), &[P])]);

        assert!(!propagator.propagate(&schema).unwrap().needs_redistribute());
    }

    #[rstest]
    #[case(OpId::ForeachAddList)]
    #[case(OpId::ForeachDivList)]
    #[case(OpId::ForeachMulList)]
    fn binary_list_matching_placements_resolve(#[case] op: OpId) {
        let mesh = mesh_1d();
        let inputs = spec_list(&mesh, &[S0, R]);
        let schema = OpSchema::new(op, vec![inputs.clone(), spec_list(&mesh, &[S0, R])]);

        let output = propagate(&schema).unwrap();

        assert_eq!(
            output.output_spec(),
            Some(&OutputSpec::List(inputs.as_spec_list().unwrap().to_vec()))
        );
    }

    #[rstest]
    #[case(&[S0, R], &[R, R])]
    #[case(&[R, R], &[P, R])]
    #[case(&[S1, S0], &[S0, S1])]
    fn binary_list_mismatch_follows_self(#[case] inputs: &[Placement], #[case] others: &[Placement]) {
        let mesh = mesh_1d();
        let schema = OpSchema::new(
            OpId::ForeachMulList,
            vec![spec_list(&mesh, inputs), spec_list(&mesh, others)],
        );

        let output = propagate(&schema).unwrap();

        let suggestion = first_suggestion(&output);
        let expected: Vec<Vec<Placement>> = inputs.iter().map(|p| vec![*p]).collect();
        assert_eq!(placements_of(&suggestion.args_schema[0]), expected);
        assert_eq!(placements_of(&suggestion.args_schema[1]), expected);
        assert!(!propagate(suggestion).unwrap().needs_redistribute());
    }

    #[test]
    fn binary_list_keeps_the_trailing_scalar() {
        let mesh = mesh_1d();
        let schema = OpSchema::new(
            OpId::ForeachAddList,
            vec![spec_list(&mesh, &[S0]), spec_list(&mesh, &[R]), 0.5.into()],
        );

        let output = propagate(&schema).unwrap();

        let suggestion = first_suggestion(&output);
        assert_eq!(suggestion.args_schema.len(), 3);
        assert_eq!(suggestion.args_schema[2], ArgSchema::from(0.5));
    }

    #[test]
    fn binary_list_length_mismatch_is_a_contract_violation() {
        let mesh = mesh_1d();
        let schema = OpSchema::new(
            OpId::ForeachAddList,
            vec![spec_list(&mesh, &[S0, S0]), spec_list(&mesh, &[S0])],
        );

        assert!(matches!(
            propagate(&schema),
            Err(PropagationError::ContractViolation { .. })
        ));
    }

    #[rstest]
    #[case(OpId::ForeachAddScalar)]
    #[case(OpId::ForeachDivScalar)]
    #[case(OpId::ForeachMulScalar)]
    #[case(OpId::ForeachSubScalar)]
    fn binary_scalar_passes_through(#[case] op: OpId) {
        let mesh = mesh_1d();
        let inputs = spec_list(&mesh, &[P, S0]);
        let schema = OpSchema::new(op, vec![inputs.clone(), 2.0.into()]);

        let output = propagate(&schema).unwrap();

        assert_eq!(
            output.output_spec(),
            Some(&OutputSpec::List(inputs.as_spec_list().unwrap().to_vec()))
        );
    }

    #[test]
    fn binary_scalar_rejects_a_list_operand() {
        let mesh = mesh_1d();
        let schema = OpSchema::new(
            OpId::ForeachAddScalar,
            vec![
                spec_list(&mesh, &[S0]),
                ArgSchema::Value(ScalarValue::FloatList(vec![1.0])),
            ],
        );

        assert!(propagate(&schema).is_err());
    }

    #[rstest]
    #[case(&[S0], &[S0], &[R])]
    #[case(&[R], &[S0], &[R])]
    #[case(&[S0, R], &[S0, R], &[S0, P])]
    fn addc_mismatch_follows_self(
        #[case] inputs: &[Placement],
        #[case] tensors1: &[Placement],
        #[case] tensors2: &[Placement],
    ) {
        let mesh = mesh_1d();
        let schema = OpSchema::new(
            OpId::ForeachAddcmulScalar,
            vec![
                spec_list(&mesh, inputs),
                spec_list(&mesh, tensors1),
                spec_list(&mesh, tensors2),
                1.0.into(),
            ],
        );

        let output = propagate(&schema).unwrap();

        let suggestion = first_suggestion(&output);
        let expected: Vec<Vec<Placement>> = inputs.iter().map(|p| vec![*p]).collect();
        for idx in 0..3 {
            assert_eq!(placements_of(&suggestion.args_schema[idx]), expected);
        }
        assert_eq!(suggestion.args_schema[3], ArgSchema::from(1.0));
        assert!(!propagate(suggestion).unwrap().needs_redistribute());
    }

    #[test]
    fn addc_matching_placements_resolve() {
        let mesh = mesh_1d();
        let inputs = spec_list(&mesh, &[S0, R]);
        let schema = OpSchema::new(
            OpId::ForeachAddcdivScalar,
            vec![inputs.clone(), inputs.clone(), inputs.clone()],
        );

        let output = propagate(&schema).unwrap();

        assert_eq!(
            output.output_spec(),
            Some(&OutputSpec::List(inputs.as_spec_list().unwrap().to_vec()))
        );
    }

    #[test]
    fn pow_follows_the_exponents() {
        let mesh = mesh_1d();
        let exponents = spec_list(&mesh, &[S1, R]);
        let schema = OpSchema::new(
            OpId::ForeachPowScalarAndTensor,
            vec![2.0.into(), exponents.clone()],
        );

        let output = propagate(&schema).unwrap();

        assert_eq!(
            output.output_spec(),
            Some(&OutputSpec::List(exponents.as_spec_list().unwrap().to_vec()))
        );
    }

    fn adam_schema(lists: [&[Placement]; FUSED_ADAM_LISTS]) -> OpSchema {
        let mesh = mesh_1d();
        let mut args: Vec<ArgSchema> = lists.iter().map(|list| spec_list(&mesh, list)).collect();
        let hyper_parameters: [ArgSchema; 7] = [
            1e-3.into(),
            0.9.into(),
            0.999.into(),
            0.0.into(),
            1e-8.into(),
            false.into(),
            false.into(),
        ];
        args.extend(hyper_parameters);
        OpSchema::new(OpId::FusedAdam, args)
    }

    #[test]
    fn fused_adam_agreeing_lists_resolve_to_params() {
        let schema = adam_schema([&[S0, R], &[S0, R], &[S0, R], &[S0, R], &[]]);

        let output = propagate(&schema).unwrap();

        let params = schema.args_schema[0].as_spec_list().unwrap().to_vec();
        let expected = OutputSpec::Tuple(vec![Some(OutputSpec::List(params)); FUSED_ADAM_LISTS]);
        assert_eq!(output.output_spec(), Some(&expected));
    }

    #[test]
    fn fused_adam_mismatch_rewrites_used_lists_only() {
        let schema = adam_schema([&[S0, R], &[P, R], &[S0, S0], &[S0, R], &[]]);

        let output = propagate(&schema).unwrap();

        let suggestion = first_suggestion(&output);
        for idx in 0..4 {
            assert_eq!(
                placements_of(&suggestion.args_schema[idx]),
                vec![vec![S0], vec![R]]
            );
        }
        assert_eq!(suggestion.args_schema[4], ArgSchema::SpecList(vec![]));
        assert_eq!(suggestion.args_schema[5..], schema.args_schema[5..]);
        assert!(!propagate(suggestion).unwrap().needs_redistribute());
    }

    #[test]
    fn fused_adam_length_mismatch_is_a_contract_violation() {
        let schema = adam_schema([&[S0, R], &[S0], &[S0, R], &[S0, R], &[]]);

        assert!(matches!(
            propagate(&schema),
            Err(PropagationError::ContractViolation {
                op: Some(OpId::FusedAdam),
                ..
            })
        ));
    }
}
