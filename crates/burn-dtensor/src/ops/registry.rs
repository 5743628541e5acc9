use alloc::sync::Arc;

use derive_new::new;
use hashbrown::HashMap;

use super::{EinsumPointwiseRule, OpId, OpSchema, OutputSharding, PointwiseRule};
use crate::config::PropagationConfig;
use crate::error::PropagationError;
use crate::sharding::DisplayPlacements;

/// A sharding propagation rule: decides how an invocation's outputs are distributed, or which
/// redistribution of its inputs it needs.
pub type PropagationRule =
    fn(&OpSchema, &RuleContext<'_>) -> Result<OutputSharding, PropagationError>;

/// What a [`PropagationRule`] may consult besides the schema.
#[derive(new, Clone, Copy)]
pub struct RuleContext<'a> {
    /// Options of the propagator running the rule.
    pub config: &'a PropagationConfig,
    /// Broadcasting rule for the element-wise part of an operator.
    pub pointwise: &'a dyn PointwiseRule,
}

/// Maps operator overloads to their propagation rules.
///
/// The propagator is populated once and only read afterwards. Rules are pure functions of the
/// schema, so a shared propagator can be used from any number of threads without locking.
#[derive(Clone)]
pub struct ShardingPropagator {
    rules: HashMap<OpId, PropagationRule>,
    config: PropagationConfig,
    pointwise: Arc<dyn PointwiseRule>,
}

impl Default for ShardingPropagator {
    fn default() -> Self {
        Self::new(PropagationConfig::default())
    }
}

impl core::fmt::Debug for ShardingPropagator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut ops: alloc::vec::Vec<_> = self.rules.keys().collect();
        ops.sort();
        f.debug_struct("ShardingPropagator")
            .field("rules", &ops)
            .field("config", &self.config)
            .finish()
    }
}

impl ShardingPropagator {
    /// A propagator holding every rule of this crate.
    pub fn new(config: PropagationConfig) -> Self {
        let mut propagator = Self::empty(config);
        super::register_rules(&mut propagator);
        propagator
    }

    /// A propagator without any rule.
    pub fn empty(config: PropagationConfig) -> Self {
        Self {
            rules: HashMap::new(),
            config,
            pointwise: Arc::new(EinsumPointwiseRule),
        }
    }

    /// Replaces the broadcasting rule used for element-wise operators.
    pub fn with_pointwise(mut self, pointwise: Arc<dyn PointwiseRule>) -> Self {
        self.pointwise = pointwise;
        self
    }

    /// Registers `rule` for every operator in `ops`.
    ///
    /// Overloads with the same propagation behavior share one rule. Registering an operator
    /// twice replaces the previous rule.
    pub fn register(&mut self, ops: &[OpId], rule: PropagationRule) {
        for &op in ops {
            if self.rules.insert(op, rule).is_some() {
                log::warn!("Replacing the sharding propagation rule of {op}");
            }
        }
    }

    /// The rule registered for `op`.
    pub fn rule(&self, op: OpId) -> Option<PropagationRule> {
        self.rules.get(&op).copied()
    }

    /// Whether a rule is registered for `op`.
    pub fn is_registered(&self, op: OpId) -> bool {
        self.rules.contains_key(&op)
    }

    /// The options the rules run with.
    pub fn config(&self) -> &PropagationConfig {
        &self.config
    }

    /// Propagates shardings through one invocation.
    ///
    /// When the result holds suggestions, the caller is expected to redistribute its inputs to
    /// match the first one and call this again with the new schema.
    pub fn propagate(&self, op_schema: &OpSchema) -> Result<OutputSharding, PropagationError> {
        let op = op_schema.op;
        let rule = self
            .rule(op)
            .ok_or(PropagationError::UnregisteredOperator(op))?;

        log::debug!("Propagating sharding through {op}");
        let context = RuleContext::new(&self.config, self.pointwise.as_ref());
        let output = rule(op_schema, &context).map_err(|err| err.with_op(op))?;

        if let OutputSharding::Suggestions(schemas) = &output {
            let suggested = schemas.first().and_then(|schema| schema.arg_specs().next());
            match suggested {
                Some(spec) => log::debug!(
                    "{op} needs redistribution, first operand suggested as {}",
                    DisplayPlacements(spec.placements())
                ),
                None => log::debug!("{op} needs redistribution"),
            }
        }

        Ok(output)
    }

    /// The process-wide propagator, holding every rule of this crate with the default options.
    ///
    /// It is built on first use and never modified afterwards.
    #[cfg(feature = "std")]
    pub fn global() -> &'static ShardingPropagator {
        static GLOBAL: std::sync::OnceLock<ShardingPropagator> = std::sync::OnceLock::new();
        GLOBAL.get_or_init(ShardingPropagator::default)
    }
}
