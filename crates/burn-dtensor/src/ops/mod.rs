//! Operator schemas and the rules propagating shardings through them.

mod foreach;
mod layer_norm;
mod nll_loss;
mod op;
mod pointwise;
mod registry;
mod schema;
mod slice_scatter;

pub use op::*;
pub use pointwise::*;
pub use registry::*;
pub use schema::*;

/// Registers every rule of this crate, covering each [`OpId`].
pub(crate) fn register_rules(propagator: &mut ShardingPropagator) {
    propagator.register(&[OpId::Add, OpId::Mul], pointwise_rule);
    foreach::register(propagator);
    layer_norm::register(propagator);
    nll_loss::register(propagator);
    slice_scatter::register(propagator);
}

fn pointwise_rule(
    op_schema: &OpSchema,
    context: &RuleContext<'_>,
) -> Result<OutputSharding, crate::error::PropagationError> {
    context
        .pointwise
        .propagate(op_schema, context.config.pointwise_linearity())
}
