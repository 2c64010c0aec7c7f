//! Secret-leak detection and redaction.
//!
//! - [`patterns`]: versioned table of named leak signatures
//! - [`scanner`]: `SecretScanner` (regex scan, entropy check, redaction)

pub mod patterns;
pub mod scanner;

pub use patterns::{default_patterns, LeakPattern, PatternDef, DEFAULT_PATTERNS, TABLE_VERSION};
pub use scanner::{shannon_entropy, SecretScanner, ENTROPY_THRESHOLD, MIN_ENTROPY_VALUE_LEN};
