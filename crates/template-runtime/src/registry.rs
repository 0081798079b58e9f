// Builtin and global name tables
//
// A `Registry` is built once per template and then shared read-only by the
// runtime; nothing in it changes while a template executes.

use rustc_hash::FxHashMap;

use crate::error::{ErrorKind, EvalError};
use crate::eval::value::Value;
use crate::name::{Name, StringInterner};
use crate::types::{BasicKind, EnumDefinition, TypeDefinition, TypeRef};

/// Named types and global constants visible from the root scope
#[derive(Debug, Default)]
pub struct Registry {
    types: FxHashMap<String, TypeRef>,
    constants: FxHashMap<Name, Value>,
}

impl Registry {
    /// Registry holding only the builtin types and constants
    pub fn builtin(interner: &mut StringInterner) -> Self {
        RegistryBuilder::new(interner).build()
    }

    pub fn get_type(&self, name: &str) -> Option<TypeRef> {
        self.types.get(name).cloned()
    }

    pub fn constant(&self, name: Name) -> Option<&Value> {
        self.constants.get(&name)
    }

    pub fn constants(&self) -> impl Iterator<Item = (Name, &Value)> {
        self.constants.iter().map(|(name, value)| (*name, value))
    }

    pub fn type_count(&self) -> usize {
        self.types.len()
    }
}

/// Collects type and constant definitions, rejecting incompatible
/// redefinitions.
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    pub fn new(interner: &mut StringInterner) -> Self {
        let mut registry = Registry::default();
        for kind in BasicKind::ALL {
            registry
                .types
                .insert(kind.name().to_string(), TypeDefinition::basic(kind));
        }
        registry
            .constants
            .insert(interner.intern("true"), Value::Bool(true));
        registry
            .constants
            .insert(interner.intern("false"), Value::Bool(false));
        Self { registry }
    }

    /// Register `ty` under `name`. Redefining a name with an equivalent type
    /// returns the existing definition.
    pub fn define_type(&mut self, name: &str, ty: TypeRef) -> Result<TypeRef, EvalError> {
        if let Some(existing) = self.registry.types.get(name) {
            if existing.same_as(&ty) {
                return Ok(existing.clone());
            }
            return Err(ErrorKind::Redefinition(name.to_string()).into());
        }
        self.registry.types.insert(name.to_string(), ty.clone());
        Ok(ty)
    }

    /// Register an enum type and its members as global constants.
    pub fn define_enum(
        &mut self,
        def: EnumDefinition,
        interner: &StringInterner,
    ) -> Result<TypeRef, EvalError> {
        let members = def.members.clone();
        let base = def.base;
        let name = def.name.clone();
        let ty = self.define_type(&name, TypeDefinition::enumeration(def))?;
        for (member, value) in members {
            let value = if base.is_signed() {
                Value::Signed(value)
            } else {
                Value::Unsigned(value as u64)
            };
            self.define_constant(member, value, interner)?;
        }
        Ok(ty)
    }

    pub fn define_constant(
        &mut self,
        name: Name,
        value: Value,
        interner: &StringInterner,
    ) -> Result<(), EvalError> {
        match self.registry.constants.get(&name) {
            Some(existing) if *existing != value => Err(ErrorKind::Redefinition(
                interner.resolve(name).to_string(),
            )
            .into()),
            _ => {
                self.registry.constants.insert(name, value);
                Ok(())
            }
        }
    }

    pub fn build(self) -> Registry {
        self.registry
    }
}
