// Error types for template execution

use crate::span::Span;
use std::fmt;
use thiserror::Error;

/// Broad classification of an error, used by callers to decide recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed or inconsistent schema (arity, incomplete types, redefinitions)
    Schema,
    /// The stream could not be decoded as requested
    Decode,
    /// A name, member or parent could not be found
    Lookup,
    /// A write was rejected
    Mutation,
    /// A configured resource limit was exceeded
    Limit,
    /// Raised by the external expression evaluator
    Evaluator,
}

/// What went wrong.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ErrorKind {
    #[error("'{ty}' expects {expected} argument(s), got {found}")]
    ArityMismatch {
        ty: String,
        expected: usize,
        found: usize,
    },
    #[error("argument '{param}' of '{ty}' is passed by reference and needs an addressable expression")]
    NotAddressable { ty: String, param: String },
    #[error("incomplete type: '{0}' has a dimension that was not evaluated")]
    IncompleteType(String),
    #[error("type '{0}' redefined with an incompatible definition")]
    Redefinition(String),
    #[error("invalid declaration '{name}': {reason}")]
    InvalidDeclaration { name: String, reason: String },

    #[error("bit width {width} exceeds the {capacity} bits of '{ty}'")]
    BitWidthOverflow { ty: String, width: u64, capacity: u64 },
    #[error("negative {what}: {value}")]
    Negative { what: &'static str, value: i128 },
    #[error("no decoder for type '{0}'")]
    NoDecoder(String),
    #[error("index {index} out of range for '{name}' of length {len}")]
    IndexOutOfRange { name: String, index: u64, len: u64 },
    #[error("read out of bounds: offset={offset}, size={size}, data_len={len}")]
    ReadOutOfBounds { offset: u64, size: u64, len: u64 },
    #[error("cannot convert {from} to {to}")]
    Conversion { from: String, to: &'static str },

    #[error("undefined name '{0}'")]
    NotFound(String),
    #[error("'{owner}' has no member '{member}'")]
    NoMember { owner: String, member: String },
    #[error("'{0}' is not indexable")]
    NotIndexable(String),
    #[error("'{0}' has no start position")]
    NoStart(String),
    #[error("'{0}' has no size")]
    NoSize(String),
    #[error("'{0}' has no parent")]
    NoParent(String),

    #[error("cannot assign to const '{0}'")]
    AssignConst(String),
    #[error("cannot assign to '{0}': not a local variable")]
    AssignNonLocal(String),

    #[error("{what} limit of {limit} exceeded")]
    Limit { what: &'static str, limit: u64 },

    #[error("{0}")]
    Evaluator(String),
}

impl ErrorKind {
    pub fn category(&self) -> ErrorCategory {
        use ErrorKind::*;
        match self {
            ArityMismatch { .. }
            | NotAddressable { .. }
            | IncompleteType(_)
            | Redefinition(_)
            | InvalidDeclaration { .. } => ErrorCategory::Schema,
            BitWidthOverflow { .. }
            | Negative { .. }
            | NoDecoder(_)
            | IndexOutOfRange { .. }
            | ReadOutOfBounds { .. }
            | Conversion { .. } => ErrorCategory::Decode,
            NotFound(_)
            | NoMember { .. }
            | NotIndexable(_)
            | NoStart(_)
            | NoSize(_)
            | NoParent(_) => ErrorCategory::Lookup,
            AssignConst(_) | AssignNonLocal(_) => ErrorCategory::Mutation,
            Limit { .. } => ErrorCategory::Limit,
            Evaluator(_) => ErrorCategory::Evaluator,
        }
    }
}

/// Error raised while executing a template, with an optional source location
#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    pub kind: ErrorKind,
    pub span: Option<Span>,
    pub line: Option<u32>,
    pub col: Option<u32>,
}

impl EvalError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            span: None,
            line: None,
            col: None,
        }
    }

    /// Error reported by an external evaluator or library function
    pub fn evaluator(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Evaluator(message.into()))
    }

    pub fn with_span(kind: ErrorKind, span: Span) -> Self {
        Self {
            span: Some(span),
            ..Self::new(kind)
        }
    }

    pub fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// True for errors caused by reading past the end of the stream.
    pub fn is_read_oob(&self) -> bool {
        matches!(self.kind, ErrorKind::ReadOutOfBounds { .. })
    }

    /// Set span if not already present
    pub fn with_span_if_none(mut self, span: Option<Span>) -> Self {
        if self.span.is_none() {
            self.span = span;
        }
        self
    }

    /// Compute line/col from source text (if span is set but line/col are not)
    pub fn resolve_location(mut self, source: &str) -> Self {
        if let (Some(span), None) = (&self.span, &self.line) {
            let (line, col) = crate::span::offset_to_line_col(source, span.start);
            self.line = Some(line);
            self.col = Some(col);
        }
        self
    }
}

impl From<ErrorKind> for EvalError {
    fn from(kind: ErrorKind) -> Self {
        EvalError::new(kind)
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.line, self.col) {
            (Some(line), Some(col)) => write!(f, "error at {}:{}: {}", line, col, self.kind),
            _ => write!(f, "error: {}", self.kind),
        }
    }
}

impl std::error::Error for EvalError {}

/// Failure to load an `EngineConfig`
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}
