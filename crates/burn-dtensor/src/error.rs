//! Errors raised by sharding propagation.

use alloc::format;
use alloc::string::String;

use crate::ops::OpId;
use crate::sharding::DeviceMeshError;

/// Errors raised while propagating shardings through an operator.
///
/// A sharding *incompatibility* is never an error: rules report it as a schema suggestion in
/// [`OutputSharding`](crate::ops::OutputSharding). Errors are reserved for malformed schemas
/// and missing rules, both of which indicate a bug on the caller's side.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PropagationError {
    /// The schema does not satisfy the operator's contract: wrong argument kind, mismatched
    /// list lengths, or a placement the rule refuses to handle.
    #[error("contract violation{}: {reason}", op_context(.op))]
    ContractViolation {
        /// The operator being propagated, when known.
        op: Option<OpId>,
        /// What was wrong with the schema.
        reason: String,
    },
    /// No rule was registered for the operator.
    #[error("no sharding propagation rule registered for `{0}`")]
    UnregisteredOperator(OpId),
    /// The device mesh could not be built.
    #[error(transparent)]
    Mesh(#[from] DeviceMeshError),
}

impl PropagationError {
    /// A contract violation with no operator context attached yet.
    pub fn contract<S: Into<String>>(reason: S) -> Self {
        PropagationError::ContractViolation {
            op: None,
            reason: reason.into(),
        }
    }

    /// Attach the operator to a contract violation that does not carry one.
    pub fn with_op(self, op: OpId) -> Self {
        match self {
            PropagationError::ContractViolation { op: None, reason } => {
                PropagationError::ContractViolation {
                    op: Some(op),
                    reason,
                }
            }
            other => other,
        }
    }
}

fn op_context(op: &Option<OpId>) -> String {
    match op {
        Some(op) => format!(" in `{op}`"),
        None => String::new(),
    }
}

/// Returns a [`PropagationError::ContractViolation`] from the enclosing function when the
/// condition does not hold.
macro_rules! ensure_contract {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::PropagationError::contract(alloc::format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_contract;
