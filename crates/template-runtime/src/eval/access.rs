// Reading, indexing and assigning variables
use super::*;
use crate::error::ErrorKind;
use crate::reader::BitReader;
use super::variable::{decode_text, Slot};

impl<'a> Runtime<'a> {
    /// Current value of a variable.
    ///
    /// Scalars are decoded from the stream on every call. Char arrays read
    /// as strings; other arrays and compounds as `Value::Ref`.
    pub fn value(&mut self, id: VarId) -> Result<Value, EvalError> {
        let var = self.variable(id);
        match &var.kind {
            VariableKind::Scalar { stream, state } => {
                let (stream, state, ty) = (*stream, *state, var.ty.clone());
                self.ctx
                    .stream_mut(stream)?
                    .with_state_at(state, |r| decode_scalar(r, &ty))
            }
            VariableKind::EagerArray(arr) if arr.element.is_char() => {
                Ok(Value::String(arr.text()))
            }
            VariableKind::LazyArray(arr) => {
                let element = array_element(&var.ty);
                match element.resolved() {
                    TypeDefinition::Basic(kind) if kind.is_char() => {
                        let (kind, stream, start, size) = (*kind, arr.stream, arr.start, arr.size());
                        let bytes = self
                            .ctx
                            .stream_mut(stream)?
                            .with_state_at(start, |r| r.read_bytes(size))?;
                        Ok(Value::String(decode_text(kind, &bytes, start.endian)))
                    }
                    _ => Ok(Value::Ref(id)),
                }
            }
            VariableKind::Duplicated { members } => match members.last() {
                Some(&last) => self.value(last),
                None => Ok(Value::Null),
            },
            VariableKind::Local { value } | VariableKind::Const { value } => Ok(value.clone()),
            VariableKind::Reference { target } => {
                let target = *target;
                self.load(target)
            }
            VariableKind::EagerArray(_) | VariableKind::Array(_) | VariableKind::Scope(_) => {
                Ok(Value::Ref(id))
            }
        }
    }

    /// Value of a whole variable or of one array element
    pub fn load(&mut self, slot: Slot) -> Result<Value, EvalError> {
        match slot {
            Slot::Var(id) => self.value(id),
            Slot::Element { array, index } => self.element_value(array, index),
        }
    }

    fn element_value(&mut self, array: VarId, index: u64) -> Result<Value, EvalError> {
        let len = self.len(array)?;
        if index >= len {
            return Err(self.out_of_range(array, index, len));
        }
        let var = self.variable(array);
        match &var.kind {
            VariableKind::EagerArray(arr) => arr
                .get(index)
                .ok_or_else(|| self.out_of_range(array, index, len)),
            VariableKind::LazyArray(arr) => {
                let (stream, state) = (arr.stream, arr.element_state(index));
                let element = array_element(&var.ty).clone();
                self.ctx
                    .stream_mut(stream)?
                    .with_state_at(state, |r| decode_scalar(r, &element))
            }
            VariableKind::Local { value: Value::Array(items) }
            | VariableKind::Const { value: Value::Array(items) } => Ok(items[index as usize].clone()),
            _ => match self.element(array, index)? {
                Slot::Var(id) => self.value(id),
                Slot::Element { .. } => Err(ErrorKind::NotIndexable(self.name_of(array).to_string()).into()),
            },
        }
    }

    /// Address element `index` of an array-like variable.
    ///
    /// Elements of eager arrays, lazy arrays of scalars and local arrays have
    /// no variable of their own and come back as `Slot::Element`. Lazily
    /// stored compound or array elements are materialized on demand; only
    /// the most recent one is kept.
    pub fn element(&mut self, var: VarId, index: u64) -> Result<Slot, EvalError> {
        let var = self.follow(var);
        let len = self.len(var)?;
        if index >= len {
            return Err(self.out_of_range(var, index, len));
        }
        let v = self.variable(var);
        match &v.kind {
            VariableKind::Array(data) => Ok(Slot::Var(data.elements[index as usize])),
            VariableKind::Duplicated { members } => Ok(Slot::Var(members[index as usize])),
            VariableKind::LazyArray(arr) => {
                let element = array_element(&v.ty).clone();
                if element.basic_kind().is_some() {
                    return Ok(Slot::Element { array: var, index });
                }
                if let Some((cached, id)) = arr.last {
                    if cached == index {
                        return Ok(Slot::Var(id));
                    }
                }
                let previous = arr.last.map(|(_, id)| id);
                let (name, stream, state) = (v.name, arr.stream, arr.element_state(index));
                if let Some(previous) = previous {
                    self.release_scratch(previous);
                }
                let id = self.materialize_element(var, name, &element, stream, state)?;
                let fresh = match &mut self.var_mut(var).kind {
                    VariableKind::LazyArray(arr) => arr.last.replace((index, id)).is_none(),
                    _ => false,
                };
                if fresh {
                    self.cached_arrays.push(var);
                }
                Ok(Slot::Var(id))
            }
            _ => Ok(Slot::Element { array: var, index }),
        }
    }

    fn materialize_element(
        &mut self,
        array: VarId,
        name: Name,
        element: &TypeRef,
        stream: StreamId,
        state: ReaderState,
    ) -> Result<VarId, EvalError> {
        let start = self.vars.len();
        if self.scratch_start.is_none() {
            self.scratch_start = Some(start);
        }
        self.materializing += 1;
        let result = self.divert(stream, state, |rt| {
            rt.create_positional(name, element, array, &[], &mut NoExpressions)
        });
        self.materializing -= 1;
        if result.is_err() {
            self.release_scratch(VarId(start as u32));
        }
        result
    }

    /// Drop every variable from `first` to the end of the arena, provided
    /// that range holds nothing but lazily materialized elements. Caches
    /// pointing into the dropped range are cleared.
    fn release_scratch(&mut self, first: VarId) {
        let start = first.index();
        if !self.scratch_start.is_some_and(|s| s <= start) || start >= self.vars.len() {
            return;
        }
        let vars = &mut self.vars;
        self.cached_arrays.retain(|&array| {
            if array.index() >= start {
                return false;
            }
            match &mut vars[array.index()].kind {
                VariableKind::LazyArray(arr) => match arr.last {
                    Some((_, id)) if id.index() >= start => {
                        arr.last = None;
                        false
                    }
                    Some(_) => true,
                    None => false,
                },
                _ => false,
            }
        });
        tracing::trace!("releasing {} lazy element variables", vars.len() - start);
        self.vars.truncate(start);
    }

    /// Convenience for walking the tree: element `index` as a variable.
    /// Fails for elements that are plain values.
    pub fn element_var(&mut self, var: VarId, index: u64) -> Result<VarId, EvalError> {
        match self.element(var, index)? {
            Slot::Var(id) => Ok(id),
            Slot::Element { array, .. } => {
                Err(ErrorKind::NotIndexable(self.name_of(array).to_string()).into())
            }
        }
    }

    /// Store into a local variable or array element. Consts and variables
    /// backed by stream bytes (other than eager array elements) reject writes.
    pub fn assign(&mut self, slot: Slot, value: Value) -> Result<(), EvalError> {
        match slot {
            Slot::Var(id) => {
                let var = self.variable(id);
                match &var.kind {
                    VariableKind::Local { .. } => {
                        let value = match var.ty.basic_kind() {
                            Some(kind) if var.ty.array_parts().is_none() => value.coerce(kind)?,
                            _ => value,
                        };
                        if let VariableKind::Local { value: stored } = &mut self.var_mut(id).kind {
                            *stored = value;
                        }
                        Ok(())
                    }
                    VariableKind::Reference { target } => {
                        let target = *target;
                        self.assign(target, value)
                    }
                    VariableKind::Const { .. } => {
                        Err(ErrorKind::AssignConst(self.name_of(id).to_string()).into())
                    }
                    _ => Err(ErrorKind::AssignNonLocal(self.name_of(id).to_string()).into()),
                }
            }
            Slot::Element { array, index } => {
                let len = self.len(array)?;
                if index >= len {
                    return Err(self.out_of_range(array, index, len));
                }
                let name = self.name_of(array).to_string();
                let element_kind = array_element(&self.variable(array).ty).basic_kind();
                match &mut self.var_mut(array).kind {
                    VariableKind::EagerArray(arr) => arr.set(index, &value),
                    VariableKind::Local {
                        value: Value::Array(items),
                    } => {
                        items[index as usize] = match element_kind {
                            Some(kind) => value.coerce(kind)?,
                            None => value,
                        };
                        Ok(())
                    }
                    VariableKind::Const { .. } => Err(ErrorKind::AssignConst(name).into()),
                    _ => Err(ErrorKind::AssignNonLocal(name).into()),
                }
            }
        }
    }

    /// Number of elements of an array-like variable (or members of a scope)
    pub fn len(&self, var: VarId) -> Result<u64, EvalError> {
        let var = self.follow(var);
        match &self.variable(var).kind {
            VariableKind::EagerArray(arr) => Ok(arr.len()),
            VariableKind::LazyArray(arr) => Ok(arr.length),
            VariableKind::Array(data) => Ok(data.elements.len() as u64),
            VariableKind::Duplicated { members } => Ok(members.len() as u64),
            VariableKind::Scope(data) => Ok(data.members.len() as u64),
            VariableKind::Local {
                value: Value::Array(items),
            }
            | VariableKind::Const {
                value: Value::Array(items),
            } => Ok(items.len() as u64),
            _ => Err(ErrorKind::NotIndexable(self.name_of(var).to_string()).into()),
        }
    }

    /// Child variables in declaration order. Elements that are not variables
    /// of their own (eager and lazy scalar arrays) are not listed.
    pub fn members(&self, var: VarId) -> &[VarId] {
        match &self.variable(self.follow(var)).kind {
            VariableKind::Scope(data) => &data.members,
            VariableKind::Array(data) => &data.elements,
            VariableKind::Duplicated { members } => members,
            _ => &[],
        }
    }

    pub fn name_of(&self, id: VarId) -> &str {
        self.interner.resolve(self.variable(id).name)
    }

    pub fn type_of(&self, id: VarId) -> &TypeRef {
        &self.variable(id).ty
    }

    /// Type stored in a slot: the variable's type, or the element type
    pub(crate) fn slot_type(&self, slot: Slot) -> Result<TypeRef, EvalError> {
        Ok(match slot {
            Slot::Var(id) => self.variable(id).ty.clone(),
            Slot::Element { array, .. } => array_element(&self.variable(array).ty).clone(),
        })
    }

    /// Label of the enum member matching the variable's current value
    pub fn enum_label(&mut self, id: VarId) -> Result<Option<String>, EvalError> {
        let Some(def) = self.variable(id).ty.as_enum().cloned() else {
            return Ok(None);
        };
        let raw = self.value(id)?.to_signed()?;
        Ok(def
            .label(raw)
            .map(|name| self.interner.resolve(name).to_string()))
    }

    fn out_of_range(&self, var: VarId, index: u64, len: u64) -> EvalError {
        ErrorKind::IndexOutOfRange {
            name: self.name_of(var).to_string(),
            index,
            len,
        }
        .into()
    }
}

/// Element type of an array type; other types are returned unchanged
fn array_element(ty: &TypeRef) -> &TypeRef {
    match ty.array_parts() {
        Some((element, _)) => element,
        None => ty,
    }
}

/// Decode a basic, enum or bitfield value at the reader's cursor.
fn decode_scalar(r: &mut BitReader<'_>, ty: &TypeDefinition) -> Result<Value, EvalError> {
    let kind = ty
        .basic_kind()
        .ok_or_else(|| ErrorKind::NoDecoder(ty.name()))?;
    match ty.resolved() {
        TypeDefinition::Bitfield { width, .. } => {
            let width = width.ok_or_else(|| ErrorKind::IncompleteType(ty.name()))?;
            let raw = r.read_bits(kind.is_signed(), width as u32, kind.size() as u8)?;
            match kind {
                BasicKind::Bool | BasicKind::Char | BasicKind::Char16 => raw.coerce(kind),
                _ => Ok(raw),
            }
        }
        _ => r.read_basic(kind),
    }
}
