// Type definitions and the size algebra
//
// Type descriptors are immutable and shared through `Rc`. Sizes are `None`
// whenever they depend on values only known while executing against a
// stream (dynamic dimensions, conditional members, constructor parameters).

use std::fmt;
use std::rc::Rc;

use crate::error::{ErrorKind, EvalError};
use crate::name::{Name, StringInterner};
use crate::schema::{CompoundDefinition, Stmt};

/// Fixed-width scalar kinds the stream reader can decode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicKind {
    U8,
    U16,
    U32,
    U64,
    S8,
    S16,
    S32,
    S64,
    Float,
    Double,
    Char,
    Char16,
    Bool,
}

impl BasicKind {
    pub const ALL: [BasicKind; 13] = [
        BasicKind::U8,
        BasicKind::U16,
        BasicKind::U32,
        BasicKind::U64,
        BasicKind::S8,
        BasicKind::S16,
        BasicKind::S32,
        BasicKind::S64,
        BasicKind::Float,
        BasicKind::Double,
        BasicKind::Char,
        BasicKind::Char16,
        BasicKind::Bool,
    ];

    pub fn from_name(s: &str) -> Option<BasicKind> {
        BasicKind::ALL.into_iter().find(|k| k.name() == s)
    }

    pub fn name(self) -> &'static str {
        match self {
            BasicKind::U8 => "u8",
            BasicKind::U16 => "u16",
            BasicKind::U32 => "u32",
            BasicKind::U64 => "u64",
            BasicKind::S8 => "s8",
            BasicKind::S16 => "s16",
            BasicKind::S32 => "s32",
            BasicKind::S64 => "s64",
            BasicKind::Float => "float",
            BasicKind::Double => "double",
            BasicKind::Char => "char",
            BasicKind::Char16 => "char16",
            BasicKind::Bool => "bool",
        }
    }

    pub fn size(self) -> u64 {
        match self {
            BasicKind::U8 | BasicKind::S8 | BasicKind::Char | BasicKind::Bool => 1,
            BasicKind::U16 | BasicKind::S16 | BasicKind::Char16 => 2,
            BasicKind::U32 | BasicKind::S32 | BasicKind::Float => 4,
            BasicKind::U64 | BasicKind::S64 | BasicKind::Double => 8,
        }
    }

    pub fn bit_capacity(self) -> u64 {
        self.size() * 8
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            BasicKind::S8 | BasicKind::S16 | BasicKind::S32 | BasicKind::S64
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, BasicKind::Float | BasicKind::Double)
    }

    /// Single-byte kinds small arrays of which are decoded eagerly
    pub fn is_byte_like(self) -> bool {
        matches!(self, BasicKind::U8 | BasicKind::S8 | BasicKind::Char)
    }

    pub fn is_char(self) -> bool {
        matches!(self, BasicKind::Char | BasicKind::Char16)
    }
}

/// Coarse classification of a type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeClass {
    Integer,
    Float,
    Enum,
    Array,
    Struct,
    Union,
    Void,
}

/// An enum type: named integer constants over a basic kind
#[derive(Debug)]
pub struct EnumDefinition {
    pub name: String,
    pub base: BasicKind,
    pub members: Vec<(Name, i64)>,
}

impl EnumDefinition {
    pub fn new(name: impl Into<String>, base: BasicKind, members: Vec<(Name, i64)>) -> Self {
        Self {
            name: name.into(),
            base,
            members,
        }
    }

    /// Name of the first member whose value equals `value`
    pub fn label(&self, value: i64) -> Option<Name> {
        self.members
            .iter()
            .find(|(_, v)| *v == value)
            .map(|(n, _)| *n)
    }
}

pub type TypeRef = Rc<TypeDefinition>;

/// Schema-level type descriptor
#[derive(Debug)]
pub enum TypeDefinition {
    Void,
    Basic(BasicKind),
    Enum(Rc<EnumDefinition>),
    /// `width: None` until the width expression has been evaluated
    Bitfield { base: TypeRef, width: Option<u64> },
    /// `length: None` until the dimension has been evaluated
    Array { element: TypeRef, length: Option<u64> },
    Compound(Rc<CompoundDefinition>),
    /// Transparent for size, class and equality; keeps its own display name
    Alias { name: String, target: TypeRef },
}

impl TypeDefinition {
    pub fn basic(kind: BasicKind) -> TypeRef {
        Rc::new(TypeDefinition::Basic(kind))
    }

    pub fn array(element: TypeRef, length: Option<u64>) -> TypeRef {
        Rc::new(TypeDefinition::Array { element, length })
    }

    pub fn alias(name: impl Into<String>, target: TypeRef) -> TypeRef {
        Rc::new(TypeDefinition::Alias {
            name: name.into(),
            target,
        })
    }

    pub fn compound(def: CompoundDefinition) -> TypeRef {
        Rc::new(TypeDefinition::Compound(Rc::new(def)))
    }

    pub fn enumeration(def: EnumDefinition) -> TypeRef {
        Rc::new(TypeDefinition::Enum(Rc::new(def)))
    }

    /// Follow aliases to the underlying definition
    pub fn resolved(&self) -> &TypeDefinition {
        let mut ty = self;
        while let TypeDefinition::Alias { target, .. } = ty {
            ty = target.as_ref();
        }
        ty
    }

    pub fn class(&self) -> TypeClass {
        match self.resolved() {
            TypeDefinition::Void => TypeClass::Void,
            TypeDefinition::Basic(k) if k.is_float() => TypeClass::Float,
            TypeDefinition::Basic(_) => TypeClass::Integer,
            TypeDefinition::Enum(_) => TypeClass::Enum,
            TypeDefinition::Bitfield { base, .. } => base.class(),
            TypeDefinition::Array { .. } => TypeClass::Array,
            TypeDefinition::Compound(def) if def.is_union => TypeClass::Union,
            TypeDefinition::Compound(_) => TypeClass::Struct,
            TypeDefinition::Alias { .. } => unreachable!("resolved() strips aliases"),
        }
    }

    pub fn is_alias(&self) -> bool {
        matches!(self, TypeDefinition::Alias { .. })
    }

    pub fn is_bitfield(&self) -> bool {
        matches!(self.resolved(), TypeDefinition::Bitfield { .. })
    }

    pub fn as_compound(&self) -> Option<&Rc<CompoundDefinition>> {
        match self.resolved() {
            TypeDefinition::Compound(def) => Some(def),
            _ => None,
        }
    }

    pub fn as_enum(&self) -> Option<&Rc<EnumDefinition>> {
        match self.resolved() {
            TypeDefinition::Enum(def) => Some(def),
            TypeDefinition::Bitfield { base, .. } => base.as_enum(),
            _ => None,
        }
    }

    /// The scalar kind stored by basic, enum and bitfield types
    pub fn basic_kind(&self) -> Option<BasicKind> {
        match self.resolved() {
            TypeDefinition::Basic(k) => Some(*k),
            TypeDefinition::Enum(def) => Some(def.base),
            TypeDefinition::Bitfield { base, .. } => base.basic_kind(),
            _ => None,
        }
    }

    pub fn array_parts(&self) -> Option<(&TypeRef, Option<u64>)> {
        match self.resolved() {
            TypeDefinition::Array { element, length } => Some((element, *length)),
            _ => None,
        }
    }

    /// Byte size, or `None` when not fixed. Bitfields have no byte size of
    /// their own; see `bit_size`.
    pub fn size(&self) -> Option<u64> {
        match self.resolved() {
            TypeDefinition::Void => Some(0),
            TypeDefinition::Basic(k) => Some(k.size()),
            TypeDefinition::Enum(def) => Some(def.base.size()),
            TypeDefinition::Bitfield { .. } => None,
            TypeDefinition::Array { element, length } => {
                element.size().and_then(|s| s.checked_mul((*length)?))
            }
            TypeDefinition::Compound(def) => def.static_size(),
            TypeDefinition::Alias { .. } => unreachable!("resolved() strips aliases"),
        }
    }

    /// Size in bits. Bitfields report their width; everything else with a
    /// fixed byte size reports eight times that.
    pub fn bit_size(&self) -> Option<u64> {
        match self.resolved() {
            TypeDefinition::Bitfield { width, .. } => *width,
            other => other.size().map(|s| s * 8),
        }
    }

    pub fn is_fixed_size(&self) -> bool {
        if self.is_bitfield() {
            self.bit_size().is_some()
        } else {
            self.size().is_some()
        }
    }

    /// True if this type (or any nested member type) packs bitfields
    pub fn contains_bitfields(&self) -> bool {
        match self.resolved() {
            TypeDefinition::Bitfield { .. } => true,
            TypeDefinition::Array { element, .. } => element.contains_bitfields(),
            TypeDefinition::Compound(def) => def.contains_bitfields(),
            _ => false,
        }
    }

    /// Structural equality looking through aliases
    pub fn same_as(&self, other: &TypeDefinition) -> bool {
        match (self.resolved(), other.resolved()) {
            (TypeDefinition::Void, TypeDefinition::Void) => true,
            (TypeDefinition::Basic(a), TypeDefinition::Basic(b)) => a == b,
            (TypeDefinition::Enum(a), TypeDefinition::Enum(b)) => {
                Rc::ptr_eq(a, b) || (a.name == b.name && a.base == b.base)
            }
            (
                TypeDefinition::Bitfield { base: a, width: wa },
                TypeDefinition::Bitfield { base: b, width: wb },
            ) => wa == wb && a.same_as(b),
            (
                TypeDefinition::Array {
                    element: a,
                    length: la,
                },
                TypeDefinition::Array {
                    element: b,
                    length: lb,
                },
            ) => la == lb && a.same_as(b),
            (TypeDefinition::Compound(a), TypeDefinition::Compound(b)) => {
                Rc::ptr_eq(a, b) || (a.name == b.name && a.is_union == b.is_union)
            }
            _ => false,
        }
    }

    /// Display name (aliases keep their own)
    pub fn name(&self) -> String {
        match self {
            TypeDefinition::Void => "void".to_string(),
            TypeDefinition::Basic(k) => k.name().to_string(),
            TypeDefinition::Enum(def) => def.name.clone(),
            TypeDefinition::Bitfield { base, width } => match width {
                Some(w) => format!("{} : {}", base.name(), w),
                None => format!("{} : ?", base.name()),
            },
            TypeDefinition::Array { .. } => {
                let mut dims = String::new();
                let mut ty = self;
                while let TypeDefinition::Array { element, length } = ty {
                    match length {
                        Some(n) => dims.push_str(&format!("[{}]", n)),
                        None => dims.push_str("[]"),
                    }
                    ty = element.as_ref();
                }
                format!("{}{}", ty.name(), dims)
            }
            TypeDefinition::Compound(def) => def.name.clone(),
            TypeDefinition::Alias { name, .. } => name.clone(),
        }
    }
}

impl fmt::Display for TypeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Running size of a struct or union, fed one member at a time.
///
/// Byte-sized members and bitfields are tracked separately; bits are merged
/// into whole bytes only when the compound is finished.
#[derive(Debug, Clone, Copy, Default)]
pub struct SizeAccumulator {
    is_union: bool,
    bytes: u64,
    bits: u64,
}

impl SizeAccumulator {
    pub fn new(is_union: bool) -> Self {
        Self {
            is_union,
            bytes: 0,
            bits: 0,
        }
    }

    /// Add a member; returns false if its size is not fixed.
    pub fn add(&mut self, ty: &TypeDefinition) -> bool {
        if ty.is_bitfield() {
            let Some(bits) = ty.bit_size() else {
                return false;
            };
            self.bits = if self.is_union {
                self.bits.max(bits)
            } else {
                self.bits + bits
            };
        } else {
            let Some(bytes) = ty.size() else {
                return false;
            };
            self.bytes = if self.is_union {
                self.bytes.max(bytes)
            } else {
                self.bytes + bytes
            };
        }
        true
    }

    pub fn finish(&self) -> u64 {
        let bit_bytes = self.bits.div_ceil(8);
        if self.is_union {
            self.bytes.max(bit_bytes)
        } else {
            self.bytes + bit_bytes
        }
    }
}

/// Compute the static size of a compound body, or `None` if any member
/// depends on runtime values.
pub(crate) fn compound_static_size(def: &CompoundDefinition) -> Option<u64> {
    if !def.params.is_empty() {
        return None;
    }
    let mut acc = SizeAccumulator::new(def.is_union);
    for stmt in &def.body {
        let Stmt::Declare(decl) = stmt else {
            return None;
        };
        // Initializers and arguments need an evaluator, which lazily
        // materialized elements do not get
        if decl.initializer.is_some() || !decl.args.is_empty() {
            return None;
        }
        if decl.is_local {
            continue;
        }
        if !acc.add(&decl.declared_type()) {
            return None;
        }
    }
    Some(acc.finish())
}

/// Build the concrete type of a declaration from its element type and the
/// evaluated array dimensions (outermost first) and bitfield width.
pub fn resolve(
    element: &TypeRef,
    dims: &[u64],
    bit_width: Option<i128>,
    interner: &StringInterner,
    name: Name,
) -> Result<TypeRef, EvalError> {
    let mut ty = element.clone();
    if let Some(width) = bit_width {
        if width < 0 {
            return Err(ErrorKind::Negative {
                what: "bit width",
                value: width,
            }
            .into());
        }
        let base = element
            .basic_kind()
            .filter(|k| !k.is_float() && element.array_parts().is_none() && !element.is_bitfield())
            .ok_or_else(|| ErrorKind::InvalidDeclaration {
                name: interner.resolve(name).to_string(),
                reason: format!("'{}' cannot be a bitfield", element.name()),
            })?;
        if width as u64 > base.bit_capacity() {
            return Err(ErrorKind::BitWidthOverflow {
                ty: element.name(),
                width: width as u64,
                capacity: base.bit_capacity(),
            }
            .into());
        }
        if !dims.is_empty() {
            return Err(ErrorKind::InvalidDeclaration {
                name: interner.resolve(name).to_string(),
                reason: "arrays of bitfields are not supported".to_string(),
            }
            .into());
        }
        ty = Rc::new(TypeDefinition::Bitfield {
            base: ty,
            width: Some(width as u64),
        });
    }
    for &length in dims.iter().rev() {
        ty = TypeDefinition::array(ty, Some(length));
    }
    Ok(ty)
}
