//! Engine configuration
//!
//! Settings can be built in code or loaded from a TOML file:
//!
//! ```toml
//! default_endian = "big"
//! bit_order = "left_to_right"
//! padded_bitfields = false
//! eager_array_threshold = 512
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::reader::{BitOrder, Endianness};

const DEFAULT_EAGER_ARRAY_THRESHOLD: u64 = 256;
const DEFAULT_MAX_ARRAY_LENGTH: u64 = 0x0100_0000;
const DEFAULT_MAX_RECURSION_DEPTH: u32 = 256;
const DEFAULT_MAX_LOOP_ITERATIONS: u64 = 0x10_0000;
/// Recursion is capped to keep native stack usage bounded
const RECURSION_DEPTH_CAP: u32 = 1024;

/// Runtime settings for template execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Byte order the cursor starts with
    pub default_endian: Endianness,
    /// Bit order the cursor starts with
    pub bit_order: BitOrder,
    /// Whether bitfields start out padded to their declared type's width
    pub padded_bitfields: bool,
    /// Byte/char arrays smaller than this many bytes are decoded eagerly
    pub eager_array_threshold: u64,
    /// Largest element count accepted for a single array
    pub max_array_length: u64,
    /// Deepest allowed struct nesting
    pub max_recursion_depth: u32,
    /// Iterations after which a `while` statement is aborted
    pub max_loop_iterations: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_endian: Endianness::Little,
            bit_order: BitOrder::RightToLeft,
            padded_bitfields: true,
            eager_array_threshold: DEFAULT_EAGER_ARRAY_THRESHOLD,
            max_array_length: DEFAULT_MAX_ARRAY_LENGTH,
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            max_loop_iterations: DEFAULT_MAX_LOOP_ITERATIONS,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: EngineConfig = toml::from_str(content)?;
        config.validate();
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Replace values that cannot work with their defaults
    pub fn validate(&mut self) {
        if self.max_array_length == 0 {
            self.max_array_length = DEFAULT_MAX_ARRAY_LENGTH;
        }
        if self.max_recursion_depth == 0 {
            self.max_recursion_depth = DEFAULT_MAX_RECURSION_DEPTH;
        }
        self.max_recursion_depth = self.max_recursion_depth.min(RECURSION_DEPTH_CAP);
        if self.max_loop_iterations == 0 {
            self.max_loop_iterations = DEFAULT_MAX_LOOP_ITERATIONS;
        }
    }
}
