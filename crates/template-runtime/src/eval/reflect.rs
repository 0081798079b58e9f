// Reflective queries: startof, sizeof, parentof, exists
use super::*;
use crate::error::ErrorKind;
use super::variable::Slot;

/// One step of an `exists` path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStep {
    Name(Name),
    Index(u64),
}

impl<'a> Runtime<'a> {
    /// Byte offset at which a variable or element starts in its stream
    pub fn start_of(&self, slot: Slot) -> Result<u64, EvalError> {
        match slot {
            Slot::Var(id) => self.var_start(id),
            Slot::Element { array, index } => {
                let array = self.follow(array);
                match &self.variable(array).kind {
                    VariableKind::EagerArray(arr) => {
                        Ok(arr.start.position + index * arr.element.size())
                    }
                    VariableKind::LazyArray(arr) => Ok(arr.element_state(index).position),
                    _ => Err(ErrorKind::NoStart(self.name_of(array).to_string()).into()),
                }
            }
        }
    }

    fn var_start(&self, id: VarId) -> Result<u64, EvalError> {
        let no_start = || -> EvalError { ErrorKind::NoStart(self.name_of(id).to_string()).into() };
        match &self.variable(id).kind {
            VariableKind::Scalar { state, .. } => Ok(state.position),
            VariableKind::EagerArray(arr) => Ok(arr.start.position),
            VariableKind::LazyArray(arr) => Ok(arr.start.position),
            VariableKind::Array(data) => Ok(data.start.position),
            VariableKind::Scope(data) => data.start.map(|s| s.position).ok_or_else(no_start),
            VariableKind::Duplicated { members } => match members.first() {
                Some(&first) => self.var_start(first),
                None => Err(no_start()),
            },
            VariableKind::Reference { target } => self.start_of(*target),
            VariableKind::Local { .. } | VariableKind::Const { .. } => Err(no_start()),
        }
    }

    /// Number of stream bytes a variable or element occupies.
    ///
    /// A bitfield reports the bytes its bits touch: the whole unit in padded
    /// mode, the spanned bytes otherwise.
    pub fn size_of(&self, slot: Slot) -> Result<u64, EvalError> {
        match slot {
            Slot::Var(id) => self.var_size(id),
            Slot::Element { array, .. } => {
                let array = self.follow(array);
                match &self.variable(array).kind {
                    VariableKind::EagerArray(arr) => Ok(arr.element.size()),
                    VariableKind::LazyArray(arr) => Ok(arr.element_size),
                    _ => Err(ErrorKind::NoSize(self.name_of(array).to_string()).into()),
                }
            }
        }
    }

    fn var_size(&self, id: VarId) -> Result<u64, EvalError> {
        let var = self.variable(id);
        let no_size = || -> EvalError { ErrorKind::NoSize(self.name_of(id).to_string()).into() };
        match &var.kind {
            VariableKind::Scalar { state, .. } => match var.ty.resolved() {
                TypeDefinition::Bitfield {
                    width: Some(width), ..
                } => Ok(if state.padded {
                    state.pack_width as u64
                } else {
                    (state.bit_offset as u64 + width).div_ceil(8)
                }),
                ty => ty.size().ok_or_else(no_size),
            },
            VariableKind::EagerArray(arr) => Ok(arr.buffer.len() as u64),
            VariableKind::LazyArray(arr) => Ok(arr.size()),
            VariableKind::Array(data) => Ok(data.size),
            VariableKind::Scope(data) if data.start.is_some() => Ok(data.size),
            VariableKind::Duplicated { members } => members
                .iter()
                .try_fold(0u64, |total, &m| -> Result<u64, EvalError> {
                    Ok(total + self.var_size(m)?)
                }),
            VariableKind::Reference { target } => self.size_of(*target),
            _ => Err(no_size()),
        }
    }

    /// Variable whose body or element list contains `id`
    pub fn parent_of(&self, id: VarId) -> Result<VarId, EvalError> {
        self.variable(id)
            .parent
            .ok_or_else(|| ErrorKind::NoParent(self.name_of(id).to_string()).into())
    }

    /// Whether `path` can be walked from `scope`. The first name step is
    /// resolved like an ordinary lookup, later ones as members. Any failure
    /// along the way yields `false`.
    pub fn exists(&mut self, scope: VarId, path: &[PathStep]) -> bool {
        let saved = self.ctx.reader().save_state();
        let found = self.walk(scope, path).is_ok();
        self.ctx.reader_mut().load_state(saved);
        found
    }

    fn walk(&mut self, scope: VarId, path: &[PathStep]) -> Result<(), EvalError> {
        let mut current: Option<Slot> = None;
        for step in path {
            let next = match (current, step) {
                (None, PathStep::Name(name)) => Slot::Var(self.lookup(scope, *name)?),
                (None, PathStep::Index(i)) => self.element(scope, *i)?,
                (Some(Slot::Var(id)), PathStep::Name(name)) => Slot::Var(self.member(id, *name)?),
                (Some(Slot::Var(id)), PathStep::Index(i)) => self.element(id, *i)?,
                (Some(Slot::Element { array, .. }), _) => {
                    return Err(ErrorKind::NotIndexable(self.name_of(array).to_string()).into())
                }
            };
            current = Some(next);
        }
        Ok(())
    }
}
