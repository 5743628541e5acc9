use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use super::OpId;
use crate::error::PropagationError;
use crate::sharding::DTensorSpec;

/// A non-tensor argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    /// An absent optional argument.
    None,
    /// A boolean flag.
    Bool(bool),
    /// An integer, also used for dimensions and enum-like codes.
    Int(i64),
    /// A floating-point hyper-parameter.
    Float(f64),
    /// A sequence of integers, e.g. a shape.
    IntList(Vec<i64>),
    /// A sequence of flags, e.g. an output mask.
    BoolList(Vec<bool>),
    /// A sequence of floating-point values.
    FloatList(Vec<f64>),
}

impl ScalarValue {
    /// Whether the value is a sequence.
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            ScalarValue::IntList(_) | ScalarValue::BoolList(_) | ScalarValue::FloatList(_)
        )
    }
}

/// One argument slot of an [`OpSchema`].
#[derive(Debug, Clone, PartialEq)]
pub enum ArgSchema {
    /// A distributed tensor.
    Spec(DTensorSpec),
    /// A list of distributed tensors, as taken by the foreach operators.
    SpecList(Vec<DTensorSpec>),
    /// Anything that is not a distributed tensor.
    Value(ScalarValue),
}

impl ArgSchema {
    /// The absent optional argument.
    pub const NONE: ArgSchema = ArgSchema::Value(ScalarValue::None);

    /// The argument as a single spec.
    pub fn as_spec(&self) -> Result<&DTensorSpec, PropagationError> {
        match self {
            ArgSchema::Spec(spec) => Ok(spec),
            other => Err(unexpected("a tensor spec", other)),
        }
    }

    /// The argument as a list of specs.
    pub fn as_spec_list(&self) -> Result<&[DTensorSpec], PropagationError> {
        match self {
            ArgSchema::SpecList(specs) => Ok(specs),
            other => Err(unexpected("a list of tensor specs", other)),
        }
    }

    /// The argument as a spec that may be absent.
    pub fn as_optional_spec(&self) -> Result<Option<&DTensorSpec>, PropagationError> {
        match self {
            ArgSchema::Spec(spec) => Ok(Some(spec)),
            ArgSchema::Value(ScalarValue::None) => Ok(None),
            other => Err(unexpected("an optional tensor spec", other)),
        }
    }

    /// The argument as an integer.
    pub fn as_int(&self) -> Result<i64, PropagationError> {
        match self {
            ArgSchema::Value(ScalarValue::Int(value)) => Ok(*value),
            other => Err(unexpected("an integer", other)),
        }
    }

    /// The argument as an integer that may be absent.
    pub fn as_optional_int(&self) -> Result<Option<i64>, PropagationError> {
        match self {
            ArgSchema::Value(ScalarValue::Int(value)) => Ok(Some(*value)),
            ArgSchema::Value(ScalarValue::None) => Ok(None),
            other => Err(unexpected("an optional integer", other)),
        }
    }

    /// The argument as a list of integers.
    pub fn as_int_list(&self) -> Result<&[i64], PropagationError> {
        match self {
            ArgSchema::Value(ScalarValue::IntList(values)) => Ok(values),
            other => Err(unexpected("a list of integers", other)),
        }
    }

    /// The argument as a list of flags.
    pub fn as_bool_list(&self) -> Result<&[bool], PropagationError> {
        match self {
            ArgSchema::Value(ScalarValue::BoolList(values)) => Ok(values),
            other => Err(unexpected("a list of booleans", other)),
        }
    }

    /// Whether the argument is a plain, non-sequence value.
    pub fn is_plain_scalar(&self) -> bool {
        matches!(self, ArgSchema::Value(value) if !value.is_list())
    }

    fn kind(&self) -> &'static str {
        match self {
            ArgSchema::Spec(_) => "tensor spec",
            ArgSchema::SpecList(_) => "list of tensor specs",
            ArgSchema::Value(ScalarValue::None) => "None",
            ArgSchema::Value(value) if value.is_list() => "list value",
            ArgSchema::Value(_) => "scalar value",
        }
    }
}

fn unexpected(expected: &str, got: &ArgSchema) -> PropagationError {
    PropagationError::contract(alloc::format!("expected {expected}, got a {}", got.kind()))
}

impl From<DTensorSpec> for ArgSchema {
    fn from(spec: DTensorSpec) -> Self {
        ArgSchema::Spec(spec)
    }
}

impl From<Vec<DTensorSpec>> for ArgSchema {
    fn from(specs: Vec<DTensorSpec>) -> Self {
        ArgSchema::SpecList(specs)
    }
}

impl From<ScalarValue> for ArgSchema {
    fn from(value: ScalarValue) -> Self {
        ArgSchema::Value(value)
    }
}

impl From<i64> for ArgSchema {
    fn from(value: i64) -> Self {
        ArgSchema::Value(ScalarValue::Int(value))
    }
}

impl From<f64> for ArgSchema {
    fn from(value: f64) -> Self {
        ArgSchema::Value(ScalarValue::Float(value))
    }
}

impl From<bool> for ArgSchema {
    fn from(value: bool) -> Self {
        ArgSchema::Value(ScalarValue::Bool(value))
    }
}

impl From<Option<DTensorSpec>> for ArgSchema {
    fn from(spec: Option<DTensorSpec>) -> Self {
        spec.map_or(ArgSchema::NONE, ArgSchema::Spec)
    }
}

/// One invocation of an operator, described by the distribution of its arguments.
///
/// Schemas are built fresh for every call. Rules never modify the schema they receive; a
/// suggestion is a new schema derived with [`OpSchema::with_args`].
#[derive(Debug, Clone, PartialEq)]
pub struct OpSchema {
    /// The operator overload.
    pub op: OpId,
    /// Positional arguments.
    pub args_schema: Vec<ArgSchema>,
    /// Keyword arguments.
    pub kwargs_schema: BTreeMap<String, ArgSchema>,
    /// Whether the result is written into the first argument.
    pub is_inplace: bool,
    /// Whether the result is written into an `out=` argument.
    pub is_out_variant: bool,
}

impl OpSchema {
    /// A functional invocation with positional arguments only.
    pub fn new(op: OpId, args_schema: Vec<ArgSchema>) -> Self {
        Self {
            op,
            args_schema,
            kwargs_schema: BTreeMap::new(),
            is_inplace: false,
            is_out_variant: false,
        }
    }

    /// Adds a keyword argument.
    pub fn with_kwarg<S: Into<String>, A: Into<ArgSchema>>(mut self, name: S, value: A) -> Self {
        self.kwargs_schema.insert(name.into(), value.into());
        self
    }

    /// Marks the invocation as in-place.
    pub fn with_inplace(mut self, is_inplace: bool) -> Self {
        self.is_inplace = is_inplace;
        self
    }

    /// Marks the invocation as an `out=` variant.
    pub fn with_out_variant(mut self, is_out_variant: bool) -> Self {
        self.is_out_variant = is_out_variant;
        self
    }

    /// Same operator, keyword arguments and flags, other positional arguments.
    pub fn with_args(&self, args_schema: Vec<ArgSchema>) -> Self {
        Self {
            op: self.op,
            args_schema,
            kwargs_schema: self.kwargs_schema.clone(),
            is_inplace: self.is_inplace,
            is_out_variant: self.is_out_variant,
        }
    }

    /// Positional argument `idx`, required.
    pub fn arg(&self, idx: usize) -> Result<&ArgSchema, PropagationError> {
        self.args_schema.get(idx).ok_or_else(|| {
            PropagationError::contract(alloc::format!(
                "missing positional argument {idx}, got {} arguments",
                self.args_schema.len()
            ))
        })
    }

    /// Positional argument `idx`, falling back to `default` when the caller omitted it.
    pub fn arg_or<'a>(&'a self, idx: usize, default: &'a ArgSchema) -> &'a ArgSchema {
        self.args_schema.get(idx).unwrap_or(default)
    }

    /// Every spec passed as a single-tensor positional argument, in order.
    pub fn arg_specs(&self) -> impl Iterator<Item = &DTensorSpec> {
        self.args_schema.iter().filter_map(|arg| match arg {
            ArgSchema::Spec(spec) => Some(spec),
            _ => None,
        })
    }
}

/// The distribution of an operator's result(s).
#[derive(Debug, Clone, PartialEq)]
pub enum OutputSpec {
    /// A single result tensor.
    Spec(DTensorSpec),
    /// A list of result tensors, as returned by the foreach operators.
    List(Vec<DTensorSpec>),
    /// A fixed-size tuple of results; `None` marks an output that is not produced.
    Tuple(Vec<Option<OutputSpec>>),
}

impl OutputSpec {
    /// The output as a single spec.
    pub fn as_spec(&self) -> Option<&DTensorSpec> {
        match self {
            OutputSpec::Spec(spec) => Some(spec),
            _ => None,
        }
    }

    /// The output as a list of specs.
    pub fn as_list(&self) -> Option<&[DTensorSpec]> {
        match self {
            OutputSpec::List(specs) => Some(specs),
            _ => None,
        }
    }

    /// The output as a tuple.
    pub fn as_tuple(&self) -> Option<&[Option<OutputSpec>]> {
        match self {
            OutputSpec::Tuple(items) => Some(items),
            _ => None,
        }
    }
}

impl From<DTensorSpec> for OutputSpec {
    fn from(spec: DTensorSpec) -> Self {
        OutputSpec::Spec(spec)
    }
}

impl From<Vec<DTensorSpec>> for OutputSpec {
    fn from(specs: Vec<DTensorSpec>) -> Self {
        OutputSpec::List(specs)
    }
}

/// The verdict of a propagation rule.
///
/// Either the operator can run as distributed and its outputs are described, or it cannot and
/// the caller should redistribute its inputs to match one of the suggested schemas (the first
/// one is preferred) before trying again. The engine never applies suggestions itself.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputSharding {
    /// The operator runs on the given placements; this is how its outputs are distributed.
    Resolved(OutputSpec),
    /// The operator cannot run on the given placements. Never empty.
    Suggestions(Vec<OpSchema>),
}

impl OutputSharding {
    /// Runs as is, producing `output_spec`.
    pub fn resolved<O: Into<OutputSpec>>(output_spec: O) -> Self {
        OutputSharding::Resolved(output_spec.into())
    }

    /// Needs redistribution to match `schema`.
    pub fn suggest(schema: OpSchema) -> Self {
        OutputSharding::Suggestions(alloc::vec![schema])
    }

    /// The output distribution, `None` when a redistribution is needed first.
    pub fn output_spec(&self) -> Option<&OutputSpec> {
        match self {
            OutputSharding::Resolved(output_spec) => Some(output_spec),
            OutputSharding::Suggestions(_) => None,
        }
    }

    /// Suggested schemas, most preferred first; empty when resolved.
    pub fn schema_suggestions(&self) -> &[OpSchema] {
        match self {
            OutputSharding::Resolved(_) => &[],
            OutputSharding::Suggestions(schemas) => schemas,
        }
    }

    /// Whether the caller must redistribute before running the operator.
    pub fn needs_redistribute(&self) -> bool {
        matches!(self, OutputSharding::Suggestions(_))
    }
}
