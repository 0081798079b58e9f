// Name resolution and scope membership

use super::variable::Slot;
use super::*;
use crate::error::ErrorKind;

impl<'a> Runtime<'a> {
    /// Resolve `name` as seen from `scope`: the scope's own members first
    /// (`this` is the scope itself), then each enclosing scope, and finally
    /// the registry's global constants.
    pub fn lookup(&self, scope: VarId, name: Name) -> Result<VarId, EvalError> {
        if name == Name::THIS {
            return Ok(scope);
        }
        let mut current = Some(scope);
        while let Some(id) = current {
            let var = self.variable(id);
            if let VariableKind::Scope(data) = &var.kind {
                if let Some(found) = data.get(name) {
                    return Ok(found);
                }
            }
            current = var.parent;
        }
        self.globals
            .get(&name)
            .copied()
            .ok_or_else(|| ErrorKind::NotFound(self.interner.resolve(name).to_string()).into())
    }

    pub fn lookup_str(&self, scope: VarId, name: &str) -> Result<VarId, EvalError> {
        let name = self
            .interner
            .lookup(name)
            .ok_or_else(|| ErrorKind::NotFound(name.to_string()))?;
        self.lookup(scope, name)
    }

    /// Named member of a struct or union. References are followed, and a
    /// duplicated name resolves to its most recent member.
    pub fn member(&self, var: VarId, name: Name) -> Result<VarId, EvalError> {
        let target = self.follow(var);
        match &self.variable(target).kind {
            VariableKind::Scope(data) => data.get(name).ok_or_else(|| {
                ErrorKind::NoMember {
                    owner: self.name_of(target).to_string(),
                    member: self.interner.resolve(name).to_string(),
                }
                .into()
            }),
            VariableKind::Duplicated { members } => match members.last() {
                Some(&last) => self.member(last, name),
                None => Err(ErrorKind::NotFound(self.name_of(target).to_string()).into()),
            },
            _ => Err(ErrorKind::NoMember {
                owner: self.name_of(target).to_string(),
                member: self.interner.resolve(name).to_string(),
            }
            .into()),
        }
    }

    pub fn member_str(&self, var: VarId, name: &str) -> Result<VarId, EvalError> {
        let member = self.interner.lookup(name).ok_or_else(|| ErrorKind::NoMember {
            owner: self.name_of(var).to_string(),
            member: name.to_string(),
        })?;
        self.member(var, member)
    }

    /// Follow whole-variable references to the variable they name.
    pub(crate) fn follow(&self, mut id: VarId) -> VarId {
        while let VariableKind::Reference {
            target: Slot::Var(target),
        } = self.variable(id).kind
        {
            id = target;
        }
        id
    }

    /// Add `id` to `scope` under its own name. A second variable with the
    /// same name turns the entry into a duplicated array of both.
    pub(crate) fn insert_member(&mut self, scope: VarId, id: VarId) {
        let name = self.variable(id).name;
        let existing = match &self.variable(scope).kind {
            VariableKind::Scope(data) => data.get(name),
            _ => return,
        };
        let entry = match existing {
            None => Some(id),
            Some(prev) => {
                if let VariableKind::Duplicated { members } = &mut self.var_mut(prev).kind {
                    members.push(id);
                    None
                } else {
                    let ty = self.variable(prev).ty.clone();
                    Some(self.alloc(Variable {
                        name,
                        ty,
                        parent: Some(scope),
                        kind: VariableKind::Duplicated {
                            members: vec![prev, id],
                        },
                    }))
                }
            }
        };
        if let VariableKind::Scope(data) = &mut self.var_mut(scope).kind {
            data.members.push(id);
            if let Some(entry) = entry {
                data.index.insert(name, entry);
            }
        }
    }

    /// Bind a constructor parameter: visible by name, but not a member.
    pub(crate) fn bind_param(&mut self, scope: VarId, id: VarId) {
        let name = self.variable(id).name;
        if let VariableKind::Scope(data) = &mut self.var_mut(scope).kind {
            data.index.insert(name, id);
        }
    }

    /// Account for a positional member that just finished: the scope grows
    /// to cover it and a union rewinds the cursor for its next member.
    pub(crate) fn track_extent(&mut self, scope: VarId) {
        let end = self.ctx.reader().save_state().aligned_end();
        let rewind = match &mut self.var_mut(scope).kind {
            VariableKind::Scope(data) => {
                data.grow_to(end);
                match (data.is_union, data.start) {
                    (true, Some(start)) => Some(start.position),
                    _ => None,
                }
            }
            _ => None,
        };
        if let Some(position) = rewind {
            self.ctx.set_position(position);
        }
    }
}
