// Schema tree handed to the runtime by an external parser
//
// Expressions are opaque `ExprRef` handles. The runtime never looks inside
// them; it asks an `ExprEvaluator` for their values when a declaration or
// statement needs one.

use std::cell::OnceCell;
use std::fmt;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::error::EvalError;
use crate::eval::evaluator::Evaluated;
use crate::eval::variable::VarId;
use crate::eval::{ExprEvaluator, Runtime};
use crate::name::{Name, StringInterner};
use crate::registry::Registry;
use crate::span::Span;
use crate::types::{compound_static_size, TypeDefinition, TypeRef};

/// Handle to an expression owned by the external evaluator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExprRef(pub u32);

/// An array dimension or bitfield width
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dim {
    Const(u64),
    /// Needs a runtime value from the evaluator
    Dynamic(ExprRef),
}

impl Dim {
    pub fn as_const(&self) -> Option<u64> {
        match self {
            Dim::Const(n) => Some(*n),
            Dim::Dynamic(_) => None,
        }
    }
}

/// A field or local declaration inside a compound (or at top level)
#[derive(Debug, Clone)]
pub struct VariableDeclaration {
    pub name: Name,
    /// Element type, before dimensions and bitfield width are applied
    pub ty: TypeRef,
    /// Array dimensions, outermost first
    pub dims: SmallVec<[Dim; 2]>,
    pub bit_width: Option<Dim>,
    pub is_const: bool,
    pub is_local: bool,
    pub is_reference: bool,
    pub initializer: Option<ExprRef>,
    /// Constructor arguments for parameterized structs
    pub args: Vec<ExprRef>,
    pub span: Option<Span>,
}

impl VariableDeclaration {
    pub fn new(name: Name, ty: TypeRef) -> Self {
        Self {
            name,
            ty,
            dims: SmallVec::new(),
            bit_width: None,
            is_const: false,
            is_local: false,
            is_reference: false,
            initializer: None,
            args: Vec::new(),
            span: None,
        }
    }

    pub fn array(mut self, dim: Dim) -> Self {
        self.dims.push(dim);
        self
    }

    pub fn bits(mut self, width: Dim) -> Self {
        self.bit_width = Some(width);
        self
    }

    pub fn local(mut self) -> Self {
        self.is_local = true;
        self
    }

    /// A const declaration is also local: it never occupies stream bytes.
    pub fn constant(mut self) -> Self {
        self.is_const = true;
        self.is_local = true;
        self
    }

    pub fn reference(mut self) -> Self {
        self.is_reference = true;
        self
    }

    pub fn init(mut self, expr: ExprRef) -> Self {
        self.initializer = Some(expr);
        self
    }

    pub fn args(mut self, args: Vec<ExprRef>) -> Self {
        self.args = args;
        self
    }

    pub fn at(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn has_dynamic_dims(&self) -> bool {
        self.dims.iter().any(|d| matches!(d, Dim::Dynamic(_)))
            || matches!(self.bit_width, Some(Dim::Dynamic(_)))
    }

    /// The type as far as it is known without evaluating anything.
    /// Dynamic dimensions and widths stay unresolved (`None`).
    pub fn declared_type(&self) -> TypeRef {
        let mut ty = self.ty.clone();
        if let Some(width) = &self.bit_width {
            ty = Rc::new(TypeDefinition::Bitfield {
                base: ty,
                width: width.as_const(),
            });
        }
        for dim in self.dims.iter().rev() {
            ty = TypeDefinition::array(ty, dim.as_const());
        }
        ty
    }

    /// Create this declaration's variable in `scope` from already evaluated
    /// dimensions, width, constructor arguments and initializer.
    pub fn materialize(
        &self,
        rt: &mut Runtime<'_>,
        scope: VarId,
        evaluated: Evaluated,
        ev: &mut dyn ExprEvaluator,
    ) -> Result<VarId, EvalError> {
        rt.materialize(self, scope, evaluated, ev)
    }
}

/// A struct/union constructor parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    pub name: Name,
    pub is_reference: bool,
}

/// Body of a struct or union type
pub struct CompoundDefinition {
    pub name: String,
    pub is_union: bool,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    static_size: OnceCell<Option<u64>>,
}

impl CompoundDefinition {
    pub fn structure(name: impl Into<String>, body: Vec<Stmt>) -> Self {
        Self::new(name, false, body)
    }

    pub fn union(name: impl Into<String>, body: Vec<Stmt>) -> Self {
        Self::new(name, true, body)
    }

    fn new(name: impl Into<String>, is_union: bool, body: Vec<Stmt>) -> Self {
        Self {
            name: name.into(),
            is_union,
            params: Vec::new(),
            body,
            static_size: OnceCell::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<Param>) -> Self {
        self.params = params;
        self.static_size = OnceCell::new();
        self
    }

    /// Size of the body when every member is fixed, computed once.
    pub fn static_size(&self) -> Option<u64> {
        *self.static_size.get_or_init(|| compound_static_size(self))
    }

    pub fn contains_bitfields(&self) -> bool {
        fn walk(stmts: &[Stmt]) -> bool {
            stmts.iter().any(|s| match s {
                Stmt::Declare(d) => !d.is_local && d.declared_type().contains_bitfields(),
                Stmt::If {
                    then_body,
                    else_body,
                    ..
                } => walk(then_body) || walk(else_body),
                Stmt::While { body, .. } => walk(body),
                Stmt::Eval(_) => false,
            })
        }
        walk(&self.body)
    }
}

impl fmt::Debug for CompoundDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompoundDefinition")
            .field("name", &self.name)
            .field("is_union", &self.is_union)
            .field("params", &self.params.len())
            .field("members", &self.body.len())
            .finish()
    }
}

/// One statement of a template or compound body
#[derive(Debug, Clone)]
pub enum Stmt {
    Declare(VariableDeclaration),
    If {
        cond: ExprRef,
        then_body: Vec<Stmt>,
        else_body: Vec<Stmt>,
    },
    While {
        cond: ExprRef,
        body: Vec<Stmt>,
    },
    /// Expression evaluated for its side effects (assignments, seeks, calls)
    Eval(ExprRef),
}

/// A complete schema ready to execute
pub struct Template {
    pub interner: StringInterner,
    pub registry: Rc<Registry>,
    pub statements: Vec<Stmt>,
    /// Source text used to turn error spans into line/column
    pub source: Option<String>,
}

impl Template {
    pub fn new(interner: StringInterner, registry: Registry, statements: Vec<Stmt>) -> Self {
        Self {
            interner,
            registry: Rc::new(registry),
            statements,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}
