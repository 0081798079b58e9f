// Interned identifiers for declarations and scope members
//
// A `Name` is a u32 index into a `StringInterner`, so scope lookups hash and
// compare integers. The interner is created by whoever builds the schema and
// travels with the `Template` into the runtime.

use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// An interned identifier. Copy semantics; equality is an integer comparison.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(u32);

impl Name {
    /// `this`, pre-interned at index 0 of every interner.
    pub const THIS: Name = Name(0);
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self.0)
    }
}

/// Maps identifier strings to unique `Name`s and back.
#[derive(Clone)]
pub struct StringInterner {
    strings: Vec<Arc<str>>,
    lookup: FxHashMap<Arc<str>, u32>,
}

impl Default for StringInterner {
    fn default() -> Self {
        Self::new()
    }
}

impl StringInterner {
    pub fn new() -> Self {
        let mut interner = Self {
            strings: Vec::new(),
            lookup: FxHashMap::default(),
        };
        let this = interner.intern("this");
        debug_assert_eq!(this, Name::THIS);
        interner
    }

    /// Intern a string, returning the existing `Name` if already present.
    #[inline]
    pub fn intern(&mut self, s: &str) -> Name {
        if let Some(&idx) = self.lookup.get(s) {
            return Name(idx);
        }
        let idx = self.strings.len() as u32;
        let arc: Arc<str> = Arc::from(s);
        self.strings.push(arc.clone());
        self.lookup.insert(arc, idx);
        Name(idx)
    }

    /// Find a string without interning it.
    pub fn lookup(&self, s: &str) -> Option<Name> {
        self.lookup.get(s).map(|&idx| Name(idx))
    }

    /// Resolve a `Name` back to its text.
    /// Names from a different interner resolve to `"?"`.
    #[inline]
    pub fn resolve(&self, name: Name) -> &str {
        self.strings
            .get(name.0 as usize)
            .map(|s| &**s)
            .unwrap_or("?")
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
