//! Result and error types representing the outcome of compiling a function.

use thiserror::Error;

/// A compilation error.
///
/// Everything in the core is fatal: either a complete, correct schedule and
/// allocation is produced, or compilation of the function stops with one of
/// these. There is no partial recovery.
#[derive(Error, Debug)]
pub enum CodegenError {
    /// An inconsistency in the target description tables, e.g. an opcode
    /// used with an operand kind its descriptor does not allow.
    #[error("target table inconsistency in {pass}: {msg}")]
    TargetTable {
        /// The pass that detected the inconsistency.
        pass: &'static str,
        /// Description of the inconsistency.
        msg: String,
    },

    /// The pattern matcher found no rule covering a construct.
    #[error("no pattern for {what} (value {value})")]
    NoPattern {
        /// The construct that could not be matched.
        what: String,
        /// Display form of the IR value at fault.
        value: String,
    },

    /// The register allocator could not colour a live range that does not
    /// interfere with a call in a class with free registers. This indicates
    /// a bug in interference construction, not a program property.
    #[error("allocator failure in class {class}: no colour for non-call-interfering range")]
    Allocator {
        /// Register class name.
        class: &'static str,
    },
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error
/// type.
pub type CodegenResult<T> = Result<T, CodegenError>;
