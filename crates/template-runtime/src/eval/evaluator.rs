// Contract with the external expression evaluator

use rustc_hash::FxHashMap;

use crate::error::EvalError;
use crate::schema::ExprRef;

use super::value::Value;
use super::variable::Slot;
use super::Runtime;

/// A constructor argument: a plain value, or a variable that can be bound
/// by reference.
#[derive(Debug, Clone, PartialEq)]
pub enum Argument {
    Value(Value),
    Variable(Slot),
}

/// Externally evaluated parts of a declaration, ready for materialization.
#[derive(Debug, Clone, Default)]
pub struct Evaluated {
    /// One entry per declared dimension; only dynamic ones are consulted
    pub dims: Vec<Option<u64>>,
    /// Evaluated width of a dynamic bitfield width
    pub bit_width: Option<i128>,
    pub args: Vec<Argument>,
    pub initializer: Option<Value>,
}

/// Computes the values of opaque expressions.
///
/// The runtime hands itself to the evaluator so expressions can look up,
/// read and assign variables, or move the cursor.
pub trait ExprEvaluator {
    fn evaluate(&mut self, expr: ExprRef, rt: &mut Runtime<'_>) -> Result<Value, EvalError>;

    /// Evaluate a constructor argument. Evaluators that can resolve lvalues
    /// should return `Argument::Variable` for them.
    fn argument(&mut self, expr: ExprRef, rt: &mut Runtime<'_>) -> Result<Argument, EvalError> {
        self.evaluate(expr, rt).map(Argument::Value)
    }
}

/// Evaluator for schemas without expressions. Every request fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoExpressions;

impl ExprEvaluator for NoExpressions {
    fn evaluate(&mut self, expr: ExprRef, _rt: &mut Runtime<'_>) -> Result<Value, EvalError> {
        Err(EvalError::evaluator(format!(
            "expression #{} needs an evaluator",
            expr.0
        )))
    }
}

type ValueFn<'f> = Box<dyn FnMut(&mut Runtime<'_>) -> Result<Value, EvalError> + 'f>;
type ArgumentFn<'f> = Box<dyn FnMut(&mut Runtime<'_>) -> Result<Argument, EvalError> + 'f>;

/// Evaluator backed by one closure per expression handle
#[derive(Default)]
pub struct ClosureEvaluator<'f> {
    values: FxHashMap<ExprRef, ValueFn<'f>>,
    arguments: FxHashMap<ExprRef, ArgumentFn<'f>>,
}

impl<'f> ClosureEvaluator<'f> {
    pub fn new() -> Self {
        Self {
            values: FxHashMap::default(),
            arguments: FxHashMap::default(),
        }
    }

    pub fn on<F>(mut self, expr: ExprRef, f: F) -> Self
    where
        F: FnMut(&mut Runtime<'_>) -> Result<Value, EvalError> + 'f,
    {
        self.values.insert(expr, Box::new(f));
        self
    }

    /// Expression that always evaluates to `value`
    pub fn constant(self, expr: ExprRef, value: Value) -> Self {
        self.on(expr, move |_| Ok(value.clone()))
    }

    /// Expression used as a constructor argument
    pub fn on_argument<F>(mut self, expr: ExprRef, f: F) -> Self
    where
        F: FnMut(&mut Runtime<'_>) -> Result<Argument, EvalError> + 'f,
    {
        self.arguments.insert(expr, Box::new(f));
        self
    }
}

impl ExprEvaluator for ClosureEvaluator<'_> {
    fn evaluate(&mut self, expr: ExprRef, rt: &mut Runtime<'_>) -> Result<Value, EvalError> {
        match self.values.get_mut(&expr) {
            Some(f) => f(rt),
            None => Err(EvalError::evaluator(format!(
                "no closure for expression #{}",
                expr.0
            ))),
        }
    }

    fn argument(&mut self, expr: ExprRef, rt: &mut Runtime<'_>) -> Result<Argument, EvalError> {
        if let Some(f) = self.arguments.get_mut(&expr) {
            return f(rt);
        }
        self.evaluate(expr, rt).map(Argument::Value)
    }
}
