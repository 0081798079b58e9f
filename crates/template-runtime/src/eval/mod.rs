// Template runtime: builds the variable tree by executing a schema
//
// `Runtime` owns the variable arena and the execution context. Its methods
// are split across the submodules by concern (materialization, statements,
// name resolution, value access, reflection).

mod access;
pub mod context;
pub mod evaluator;
mod materialize;
pub mod observer;
mod reflect;
mod scope;
mod stmt;
pub mod value;
pub mod variable;

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::config::EngineConfig;
use crate::error::EvalError;
use crate::name::{Name, StringInterner};
use crate::reader::data_source::DataSource;
use crate::reader::ReaderState;
use crate::registry::Registry;
use crate::schema::Stmt;
use crate::types::{BasicKind, TypeDefinition, TypeRef};

use context::Context;
pub use evaluator::{Argument, ClosureEvaluator, Evaluated, ExprEvaluator, NoExpressions};
pub use observer::Observer;
pub use reflect::PathStep;
use value::Value;
use variable::{ScopeData, StreamId, VarId, Variable, VariableKind};

/// The materialized tree plus everything needed to keep navigating it
pub struct Runtime<'a> {
    pub(crate) ctx: Context<'a>,
    pub(crate) vars: Vec<Variable>,
    root: VarId,
    /// Innermost struct/union being executed is last
    scope_stack: Vec<VarId>,
    pub(crate) interner: StringInterner,
    registry: Rc<Registry>,
    /// Registry constants, materialized as `Const` variables
    globals: FxHashMap<Name, VarId>,
    pub(crate) config: EngineConfig,
    depth: u32,
    /// Source text for error locations
    source: Option<String>,
    /// Nonzero while a lazy array element is being materialized
    materializing: u32,
    /// First arena slot of the trailing run that holds only lazy elements
    scratch_start: Option<usize>,
    /// Lazy arrays whose `last` points into the arena
    cached_arrays: Vec<VarId>,
}

impl<'a> Runtime<'a> {
    pub fn new(
        data: &'a dyn DataSource,
        mut interner: StringInterner,
        registry: Rc<Registry>,
        config: EngineConfig,
    ) -> Self {
        let initial = ReaderState {
            endian: config.default_endian,
            bit_order: config.bit_order,
            padded: config.padded_bitfields,
            ..ReaderState::default()
        };
        let root_name = interner.intern("root");
        let root_type = TypeDefinition::compound(crate::schema::CompoundDefinition::structure(
            "root",
            Vec::new(),
        ));
        let mut rt = Self {
            ctx: Context::new(data, initial),
            vars: Vec::new(),
            root: VarId(0),
            scope_stack: Vec::new(),
            interner,
            registry,
            globals: FxHashMap::default(),
            config,
            depth: 0,
            source: None,
            materializing: 0,
            scratch_start: None,
            cached_arrays: Vec::new(),
        };
        rt.root = rt.alloc(Variable {
            name: root_name,
            ty: root_type,
            parent: None,
            kind: VariableKind::Scope(ScopeData::new(StreamId(0), Some(initial), false)),
        });
        rt.scope_stack.push(rt.root);

        let constants: Vec<(Name, Value)> = rt
            .registry
            .constants()
            .map(|(name, value)| (name, value.clone()))
            .collect();
        for (name, value) in constants {
            let id = rt.alloc(Variable {
                name,
                ty: natural_type(&value),
                parent: None,
                kind: VariableKind::Const { value },
            });
            rt.globals.insert(name, id);
        }
        rt
    }

    pub fn with_source(mut self, source: Option<String>) -> Self {
        self.source = source;
        self
    }

    /// Execute top-level statements in the root scope. Execution stops at the
    /// first error; everything built up to that point stays in the tree.
    pub fn run(&mut self, statements: &[Stmt], ev: &mut dyn ExprEvaluator) -> Vec<EvalError> {
        tracing::debug!("running template: {} top-level statements", statements.len());
        let mut errors = Vec::new();
        if let Err(e) = self.exec_block(statements, ev) {
            let e = match &self.source {
                Some(source) => e.resolve_location(source),
                None => e,
            };
            tracing::debug!("template aborted: {}", e);
            errors.push(e);
        }
        // Restore the root as current in case an error unwound nested scopes
        self.scope_stack.truncate(1);
        self.depth = 0;
        tracing::debug!(
            "template finished: {} variables, cursor at {:#x}",
            self.vars.len(),
            self.ctx.position()
        );
        errors
    }

    pub fn root(&self) -> VarId {
        self.root
    }

    /// Struct or union whose body is executing (the root outside of any)
    pub fn current_scope(&self) -> VarId {
        self.scope_stack.last().copied().unwrap_or(self.root)
    }

    pub fn interner(&self) -> &StringInterner {
        &self.interner
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn context(&self) -> &Context<'a> {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut Context<'a> {
        &mut self.ctx
    }

    pub fn variable(&self, id: VarId) -> &Variable {
        &self.vars[id.index()]
    }

    pub fn variable_count(&self) -> usize {
        self.vars.len()
    }

    pub(crate) fn var_mut(&mut self, id: VarId) -> &mut Variable {
        &mut self.vars[id.index()]
    }

    pub(crate) fn alloc(&mut self, var: Variable) -> VarId {
        let id = VarId(self.vars.len() as u32);
        if self.materializing == 0 {
            self.scratch_start = None;
        }
        self.vars.push(var);
        id
    }

    pub(crate) fn push_scope(&mut self, id: VarId) {
        tracing::debug!("enter scope '{}'", self.name_of(id));
        self.scope_stack.push(id);
    }

    pub(crate) fn pop_scope(&mut self) {
        if self.scope_stack.len() > 1 {
            if let Some(id) = self.scope_stack.pop() {
                tracing::debug!("leave scope '{}'", self.name_of(id));
            }
        }
    }

    /// Run `f` with the cursor of `stream` moved to `state`, then put both
    /// the cursor and the active stream back exactly as they were.
    pub(crate) fn divert<T>(
        &mut self,
        stream: StreamId,
        state: ReaderState,
        f: impl FnOnce(&mut Self) -> Result<T, EvalError>,
    ) -> Result<T, EvalError> {
        let previous = self.ctx.active();
        self.ctx.set_active(stream)?;
        let saved = self.ctx.reader().save_state();
        self.ctx.reader_mut().load_state(state);
        let result = f(self);
        self.ctx.reader_mut().load_state(saved);
        self.ctx.set_active(previous)?;
        result
    }
}

/// Type given to registry constants
fn natural_type(value: &Value) -> TypeRef {
    let kind = match value {
        Value::Signed(_) => BasicKind::S64,
        Value::Float(_) => BasicKind::Double,
        Value::Bool(_) => BasicKind::Bool,
        Value::Char(_) => BasicKind::Char,
        _ => BasicKind::U64,
    };
    TypeDefinition::basic(kind)
}
