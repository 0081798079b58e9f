// Runtime variables: the nodes of the materialized tree
//
// Variables live in an arena owned by the `Runtime` and refer to each other
// (parent, members, elements) through `VarId` handles.

use rustc_hash::FxHashMap;

use crate::error::{ErrorKind, EvalError};
use crate::name::Name;
use crate::reader::{Endianness, ReaderState};
use crate::types::{BasicKind, TypeRef};

use super::value::Value;

/// Handle to a variable in the runtime arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub(crate) u32);

impl VarId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index of an attached data stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamId(pub(crate) u16);

/// Something that can be read or assigned: a whole variable, or one element
/// of an array that does not keep per-element variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Var(VarId),
    Element { array: VarId, index: u64 },
}

impl From<VarId> for Slot {
    fn from(id: VarId) -> Self {
        Slot::Var(id)
    }
}

/// A node of the variable tree
#[derive(Debug)]
pub struct Variable {
    pub name: Name,
    pub ty: TypeRef,
    pub parent: Option<VarId>,
    pub kind: VariableKind,
}

#[derive(Debug)]
pub enum VariableKind {
    /// Basic, enum or bitfield value; decoded from `state` on every read
    Scalar { stream: StreamId, state: ReaderState },
    EagerArray(EagerArray),
    LazyArray(LazyArray),
    /// Array whose elements were materialized one by one
    Array(ArrayData),
    /// Struct or union instance
    Scope(ScopeData),
    /// Same name declared more than once in one scope
    Duplicated { members: Vec<VarId> },
    Local { value: Value },
    Const { value: Value },
    /// By-reference constructor parameter
    Reference { target: Slot },
}

impl VariableKind {
    pub fn describe(&self) -> &'static str {
        match self {
            VariableKind::Scalar { .. } => "scalar",
            VariableKind::EagerArray(_) => "eager array",
            VariableKind::LazyArray(_) => "lazy array",
            VariableKind::Array(_) => "array",
            VariableKind::Scope(s) if s.is_union => "union",
            VariableKind::Scope(_) => "struct",
            VariableKind::Duplicated { .. } => "duplicated array",
            VariableKind::Local { .. } => "local",
            VariableKind::Const { .. } => "const",
            VariableKind::Reference { .. } => "reference",
        }
    }
}

/// Small array decoded at creation into a native buffer
#[derive(Debug)]
pub struct EagerArray {
    pub stream: StreamId,
    pub start: ReaderState,
    pub element: BasicKind,
    pub endian: Endianness,
    pub buffer: Vec<u8>,
}

impl EagerArray {
    pub fn len(&self) -> u64 {
        self.buffer.len() as u64 / self.element.size()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn range(&self, index: u64) -> Option<std::ops::Range<usize>> {
        if index >= self.len() {
            return None;
        }
        let size = self.element.size() as usize;
        let at = index as usize * size;
        Some(at..at + size)
    }

    pub fn get(&self, index: u64) -> Option<Value> {
        self.range(index)
            .map(|r| Value::decode(self.element, &self.buffer[r], self.endian))
    }

    pub fn set(&mut self, index: u64, value: &Value) -> Result<(), EvalError> {
        let len = self.len();
        let range = self.range(index).ok_or(ErrorKind::IndexOutOfRange {
            name: "array".to_string(),
            index,
            len,
        })?;
        value.encode(self.element, &mut self.buffer[range], self.endian)
    }

    /// Text of a char array up to the first NUL
    pub fn text(&self) -> String {
        decode_text(self.element, &self.buffer, self.endian)
    }
}

/// Decode a char or char16 buffer as text, stopping at the first NUL.
pub(crate) fn decode_text(kind: BasicKind, bytes: &[u8], endian: Endianness) -> String {
    match kind {
        BasicKind::Char16 => {
            let encoding = match endian {
                Endianness::Little => encoding_rs::UTF_16LE,
                Endianness::Big => encoding_rs::UTF_16BE,
            };
            let (text, _) = encoding.decode_without_bom_handling(bytes);
            text.split('\0').next().unwrap_or_default().to_string()
        }
        _ => {
            let end = memchr::memchr(0, bytes).unwrap_or(bytes.len());
            bytes[..end].iter().map(|&b| b as char).collect()
        }
    }
}

/// Array of fixed-size elements decoded only when indexed
#[derive(Debug)]
pub struct LazyArray {
    pub stream: StreamId,
    pub start: ReaderState,
    pub element_size: u64,
    pub length: u64,
    /// Most recently materialized non-scalar element
    pub(crate) last: Option<(u64, VarId)>,
}

impl LazyArray {
    /// Cursor state at which element `index` begins
    pub fn element_state(&self, index: u64) -> ReaderState {
        let mut state = self.start;
        state.position += index * self.element_size;
        state.bit_offset = 0;
        state
    }

    pub fn size(&self) -> u64 {
        self.element_size * self.length
    }
}

/// Array of individually materialized elements
#[derive(Debug)]
pub struct ArrayData {
    pub stream: StreamId,
    pub start: ReaderState,
    pub size: u64,
    pub elements: Vec<VarId>,
}

/// A struct or union instance: an ordered namespace of members
#[derive(Debug)]
pub struct ScopeData {
    pub stream: StreamId,
    pub start: Option<ReaderState>,
    pub size: u64,
    pub is_union: bool,
    /// Positional and local members in declaration order
    pub members: Vec<VarId>,
    /// Name index; duplicated names map to their `Duplicated` variable
    pub(crate) index: FxHashMap<Name, VarId>,
}

impl ScopeData {
    pub fn new(stream: StreamId, start: Option<ReaderState>, is_union: bool) -> Self {
        Self {
            stream,
            start,
            size: 0,
            is_union,
            members: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    pub fn get(&self, name: Name) -> Option<VarId> {
        self.index.get(&name).copied()
    }

    /// Extend the size so it covers everything up to byte `end`.
    pub fn grow_to(&mut self, end: u64) {
        if let Some(start) = &self.start {
            self.size = self.size.max(end.saturating_sub(start.position));
        }
    }
}
