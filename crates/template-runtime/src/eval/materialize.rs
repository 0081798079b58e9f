// Turning declarations into variables
//
// Positional variables reserve their bytes through the context and record
// where they live; only small byte/char arrays are decoded up front.

use super::*;
use crate::error::ErrorKind;
use crate::schema::{CompoundDefinition, Dim, VariableDeclaration};
use crate::types;
use super::evaluator::{Argument, Evaluated};
use smallvec::SmallVec;
use super::variable::{ArrayData, EagerArray, LazyArray, Slot};

impl<'a> Runtime<'a> {
    /// Create the variable for `decl` inside `scope`.
    ///
    /// On failure, a struct or array that was already partly built is still
    /// attached to `scope` so the tree shows how far decoding got.
    pub fn materialize(
        &mut self,
        decl: &VariableDeclaration,
        scope: VarId,
        evaluated: Evaluated,
        ev: &mut dyn ExprEvaluator,
    ) -> Result<VarId, EvalError> {
        let first = self.vars.len();
        match self.materialize_declaration(decl, scope, evaluated, ev) {
            Ok(id) => Ok(id),
            Err(e) => {
                let partial = self
                    .vars
                    .get(first)
                    .is_some_and(|v| v.parent == Some(scope) && v.name == decl.name);
                if partial {
                    self.insert_member(scope, VarId(first as u32));
                }
                Err(e.with_span_if_none(decl.span))
            }
        }
    }

    fn materialize_declaration(
        &mut self,
        decl: &VariableDeclaration,
        scope: VarId,
        evaluated: Evaluated,
        ev: &mut dyn ExprEvaluator,
    ) -> Result<VarId, EvalError> {
        let ty = self.resolve_declared_type(decl, &evaluated)?;
        let name = self.interner.resolve(decl.name).to_string();
        self.ctx.notify_creating(decl, &name);

        let id = if decl.is_local && decl.is_reference {
            self.create_local_reference(decl, evaluated.initializer, scope)?
        } else if decl.is_local {
            self.create_local(decl, ty, evaluated.initializer, scope)?
        } else {
            if decl.is_reference {
                return Err(ErrorKind::InvalidDeclaration {
                    name,
                    reason: "a positional variable cannot be a reference".to_string(),
                }
                .into());
            }
            if decl.initializer.is_some() {
                return Err(ErrorKind::InvalidDeclaration {
                    name,
                    reason: "only local variables take an initializer".to_string(),
                }
                .into());
            }
            self.create_positional(decl.name, &ty, scope, &evaluated.args, ev)?
        };

        tracing::trace!(
            "materialized '{}': {} ({})",
            name,
            self.vars[id.index()].ty,
            self.vars[id.index()].kind.describe()
        );
        self.ctx
            .notify_created(decl, &name, id, &self.vars[id.index()]);
        self.insert_member(scope, id);
        if !decl.is_local {
            self.track_extent(scope);
        }
        Ok(id)
    }

    /// Apply evaluated dimensions and width to the declared element type.
    fn resolve_declared_type(
        &self,
        decl: &VariableDeclaration,
        evaluated: &Evaluated,
    ) -> Result<TypeRef, EvalError> {
        let incomplete = || ErrorKind::IncompleteType(self.interner.resolve(decl.name).to_string());

        let mut dims: SmallVec<[u64; 2]> = SmallVec::new();
        for (i, dim) in decl.dims.iter().enumerate() {
            let length = match dim {
                Dim::Const(n) => *n,
                Dim::Dynamic(_) => evaluated
                    .dims
                    .get(i)
                    .copied()
                    .flatten()
                    .ok_or_else(incomplete)?,
            };
            if length > self.config.max_array_length {
                return Err(ErrorKind::Limit {
                    what: "array length",
                    limit: self.config.max_array_length,
                }
                .into());
            }
            dims.push(length);
        }

        let width = match decl.bit_width {
            None => None,
            Some(Dim::Const(w)) => Some(w as i128),
            Some(Dim::Dynamic(_)) => Some(evaluated.bit_width.ok_or_else(incomplete)?),
        };
        types::resolve(&decl.ty, &dims, width, &self.interner, decl.name)
    }

    fn create_local(
        &mut self,
        decl: &VariableDeclaration,
        ty: TypeRef,
        initializer: Option<Value>,
        scope: VarId,
    ) -> Result<VarId, EvalError> {
        let value = match initializer {
            Some(value) => local_value(&ty, value)?,
            None => zero_value(&ty).ok_or_else(|| ErrorKind::InvalidDeclaration {
                name: self.interner.resolve(decl.name).to_string(),
                reason: format!("a local '{}' needs an initializer", ty.name()),
            })?,
        };
        let kind = if decl.is_const {
            VariableKind::Const { value }
        } else {
            VariableKind::Local { value }
        };
        Ok(self.alloc(Variable {
            name: decl.name,
            ty,
            parent: Some(scope),
            kind,
        }))
    }

    /// A local alias of the variable its initializer names.
    fn create_local_reference(
        &mut self,
        decl: &VariableDeclaration,
        initializer: Option<Value>,
        scope: VarId,
    ) -> Result<VarId, EvalError> {
        let Some(Value::Ref(target)) = initializer else {
            return Err(ErrorKind::InvalidDeclaration {
                name: self.interner.resolve(decl.name).to_string(),
                reason: "a reference must be initialized with a variable".to_string(),
            }
            .into());
        };
        let target = self.follow(target);
        let ty = self.variable(target).ty.clone();
        Ok(self.alloc(Variable {
            name: decl.name,
            ty,
            parent: Some(scope),
            kind: VariableKind::Reference {
                target: Slot::Var(target),
            },
        }))
    }

    /// Reserve (or, for compounds, execute) a positional variable of type
    /// `ty` at the cursor of the active stream.
    pub(crate) fn create_positional(
        &mut self,
        name: Name,
        ty: &TypeRef,
        parent: VarId,
        args: &[Argument],
        ev: &mut dyn ExprEvaluator,
    ) -> Result<VarId, EvalError> {
        match ty.resolved() {
            TypeDefinition::Compound(def) => {
                let def = def.clone();
                self.create_compound(name, ty, &def, parent, args, ev)
            }
            TypeDefinition::Array { element, length } => {
                let length = length.ok_or_else(|| ErrorKind::IncompleteType(ty.name()))?;
                let element = element.clone();
                self.create_array(name, ty, &element, length, parent, args, ev)
            }
            TypeDefinition::Void => Err(ErrorKind::NoDecoder(ty.name()).into()),
            _ => {
                if !args.is_empty() {
                    return Err(ErrorKind::ArityMismatch {
                        ty: ty.name(),
                        expected: 0,
                        found: args.len(),
                    }
                    .into());
                }
                let state = self.ctx.reserve_range(ty)?;
                Ok(self.alloc(Variable {
                    name,
                    ty: ty.clone(),
                    parent: Some(parent),
                    kind: VariableKind::Scalar {
                        stream: self.ctx.active(),
                        state,
                    },
                }))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create_array(
        &mut self,
        name: Name,
        ty: &TypeRef,
        element: &TypeRef,
        length: u64,
        parent: VarId,
        args: &[Argument],
        ev: &mut dyn ExprEvaluator,
    ) -> Result<VarId, EvalError> {
        let stream = self.ctx.active();
        let total_size = |size: u64| {
            size.checked_mul(length).ok_or(ErrorKind::Limit {
                what: "array size",
                limit: u64::MAX,
            })
        };

        // Small byte and char arrays: decode now
        if let TypeDefinition::Basic(kind) = element.resolved() {
            let kind = *kind;
            let total = total_size(kind.size())?;
            if (kind.is_byte_like() || kind == BasicKind::Char16)
                && total < self.config.eager_array_threshold
            {
                let start = self.ctx.reader_mut().skip_bytes(total)?;
                let buffer = self.ctx.reader().source().read_bytes(start.position, total)?;
                return Ok(self.alloc(Variable {
                    name,
                    ty: ty.clone(),
                    parent: Some(parent),
                    kind: VariableKind::EagerArray(EagerArray {
                        stream,
                        start,
                        element: kind,
                        endian: start.endian,
                        buffer,
                    }),
                }));
            }
        }

        // Fixed-size elements: reserve the whole range, decode on access
        if let Some(size) = element.size().filter(|_| !element.contains_bitfields()) {
            if args.is_empty() {
                let start = self.ctx.reader_mut().skip_bytes(total_size(size)?)?;
                return Ok(self.alloc(Variable {
                    name,
                    ty: ty.clone(),
                    parent: Some(parent),
                    kind: VariableKind::LazyArray(LazyArray {
                        stream,
                        start,
                        element_size: size,
                        length,
                        last: None,
                    }),
                }));
            }
        }

        // Element offsets are only known by decoding each one in turn
        self.ctx.reader_mut().align();
        let start = self.ctx.reader().save_state();
        let id = self.alloc(Variable {
            name,
            ty: ty.clone(),
            parent: Some(parent),
            kind: VariableKind::Array(ArrayData {
                stream,
                start,
                size: 0,
                elements: Vec::with_capacity(length.min(1024) as usize),
            }),
        });
        let mut result = Ok(());
        for _ in 0..length {
            match self.create_positional(name, element, id, args, ev) {
                Ok(element_id) => {
                    if let VariableKind::Array(data) = &mut self.var_mut(id).kind {
                        data.elements.push(element_id);
                    }
                }
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        let end = self.ctx.reader().save_state().aligned_end();
        if let VariableKind::Array(data) = &mut self.var_mut(id).kind {
            data.size = end.saturating_sub(start.position);
        }
        result.map(|_| id)
    }

    fn create_compound(
        &mut self,
        name: Name,
        ty: &TypeRef,
        def: &Rc<CompoundDefinition>,
        parent: VarId,
        args: &[Argument],
        ev: &mut dyn ExprEvaluator,
    ) -> Result<VarId, EvalError> {
        if def.params.len() != args.len() {
            return Err(ErrorKind::ArityMismatch {
                ty: def.name.clone(),
                expected: def.params.len(),
                found: args.len(),
            }
            .into());
        }
        for (param, arg) in def.params.iter().zip(args) {
            if param.is_reference && !matches!(arg, Argument::Variable(_)) {
                return Err(ErrorKind::NotAddressable {
                    ty: def.name.clone(),
                    param: self.interner.resolve(param.name).to_string(),
                }
                .into());
            }
        }
        if self.depth >= self.config.max_recursion_depth {
            return Err(ErrorKind::Limit {
                what: "recursion depth",
                limit: self.config.max_recursion_depth as u64,
            }
            .into());
        }

        let stream = self.ctx.active();
        self.ctx.reader_mut().align();
        let start = self.ctx.reader().save_state();
        let id = self.alloc(Variable {
            name,
            ty: ty.clone(),
            parent: Some(parent),
            kind: VariableKind::Scope(ScopeData::new(stream, Some(start), def.is_union)),
        });

        for (param, arg) in def.params.iter().zip(args) {
            let (kind, param_ty) = match arg {
                Argument::Variable(slot) if param.is_reference => (
                    VariableKind::Reference { target: *slot },
                    self.slot_type(*slot)?,
                ),
                Argument::Variable(slot) => {
                    let value = self.load(*slot)?;
                    (VariableKind::Local { value }, self.slot_type(*slot)?)
                }
                Argument::Value(value) => (
                    VariableKind::Local {
                        value: value.clone(),
                    },
                    natural_type(value),
                ),
            };
            let param_id = self.alloc(Variable {
                name: param.name,
                ty: param_ty,
                parent: Some(id),
                kind,
            });
            self.bind_param(id, param_id);
        }

        self.push_scope(id);
        self.depth += 1;
        let result = self.exec_block(&def.body, ev);
        self.depth -= 1;
        self.pop_scope();
        self.finish_compound(id);
        result.map(|_| id)
    }

    /// Settle the cursor after a struct or union body: a struct ends on the
    /// next byte boundary, a union at `start + size`.
    fn finish_compound(&mut self, id: VarId) {
        let end = self.ctx.reader().save_state().aligned_end();
        let resume = match &mut self.var_mut(id).kind {
            VariableKind::Scope(data) if data.is_union => {
                data.start.map(|start| start.position + data.size)
            }
            VariableKind::Scope(data) => {
                data.grow_to(end);
                Some(end)
            }
            _ => None,
        };
        if let Some(position) = resume {
            self.ctx.set_position(position);
        }
    }
}

/// Zero value of a local of type `ty`; `None` for types locals cannot hold
/// without an initializer.
fn zero_value(ty: &TypeDefinition) -> Option<Value> {
    match ty.resolved() {
        TypeDefinition::Array { element, length } => {
            let item = zero_value(element)?;
            Some(Value::Array(vec![item; (*length)? as usize]))
        }
        TypeDefinition::Compound(_) | TypeDefinition::Void => None,
        other => other.basic_kind().map(Value::zero),
    }
}

/// Convert an initializer to what a local of type `ty` stores.
fn local_value(ty: &TypeDefinition, value: Value) -> Result<Value, EvalError> {
    match ty.resolved() {
        TypeDefinition::Array { element, .. } => match value {
            Value::Array(items) => items
                .into_iter()
                .map(|item| local_value(element, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            other => Ok(other),
        },
        TypeDefinition::Compound(_) | TypeDefinition::Void => Ok(value),
        other => match other.basic_kind() {
            Some(kind) => value.coerce(kind),
            None => Ok(value),
        },
    }
}
