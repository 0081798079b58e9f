// Lazy binary template runtime
//
// Executes a schema of structs, unions, arrays, bitfields and enums against
// a byte stream and builds a navigable tree of variables that decode their
// values on demand.

pub mod config;
pub mod error;
pub mod eval;
pub mod name;
pub mod reader;
pub mod registry;
pub mod schema;
pub mod span;
pub mod types;

pub use name::{Name, StringInterner};

// Re-export key types for public API
pub use config::EngineConfig;
pub use error::{ConfigError, ErrorCategory, ErrorKind, EvalError};
pub use eval::value::Value;
pub use eval::variable::{Slot, StreamId, VarId, Variable, VariableKind};
pub use eval::{
    Argument, ClosureEvaluator, Evaluated, ExprEvaluator, NoExpressions, Observer, PathStep,
    Runtime,
};
pub use reader::data_source::{DataSource, MmapDataSource, SliceDataSource};
pub use reader::{BitOrder, BitReader, Endianness, ReaderState};
pub use registry::{Registry, RegistryBuilder};
pub use schema::{CompoundDefinition, Dim, ExprRef, Param, Stmt, Template, VariableDeclaration};
pub use types::{BasicKind, EnumDefinition, TypeClass, TypeDefinition, TypeRef};

/// Result of running a template: the tree built so far and any errors.
pub struct Execution<'a> {
    pub runtime: Runtime<'a>,
    pub errors: Vec<EvalError>,
}

impl<'a> Execution<'a> {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn root(&self) -> VarId {
        self.runtime.root()
    }

    pub fn runtime(&mut self) -> &mut Runtime<'a> {
        &mut self.runtime
    }
}

/// Main entry point: runs templates against data sources.
#[derive(Debug, Clone, Default)]
pub struct TemplateEngine {
    config: EngineConfig,
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut config: EngineConfig) -> Self {
        config.validate();
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute `template` against `data`. Never fails outright: errors are
    /// collected in the returned `Execution` next to the partial tree.
    pub fn run<'a>(
        &self,
        template: &Template,
        data: &'a dyn DataSource,
        evaluator: &mut dyn ExprEvaluator,
    ) -> Execution<'a> {
        self.run_observed(template, data, evaluator, Vec::new())
    }

    /// Like `run`, notifying `observers` around every materialization.
    pub fn run_observed<'a>(
        &self,
        template: &Template,
        data: &'a dyn DataSource,
        evaluator: &mut dyn ExprEvaluator,
        observers: Vec<Box<dyn Observer + 'a>>,
    ) -> Execution<'a> {
        let mut runtime = Runtime::new(
            data,
            template.interner.clone(),
            template.registry.clone(),
            self.config.clone(),
        )
        .with_source(template.source.clone());
        for observer in observers {
            runtime.context_mut().add_observer(observer);
        }
        let errors = runtime.run(&template.statements, evaluator);
        Execution { runtime, errors }
    }
}
