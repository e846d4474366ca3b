//! Error types for Charlar
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for Charlar operations
pub type Result<T> = std::result::Result<T, CharlarError>;

/// Error type for all Charlar operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CharlarError {
    /// Model file does not start with the expected magic bytes
    #[error("model file is broken (bad magic: {found:?}, expected \"ggml\")")]
    BadMagic {
        /// The four bytes actually found
        found: [u8; 4],
    },

    /// Model type tag is not present in the registry
    #[error("invalid model type: 0x{0:X}")]
    UnknownModelType(i32),

    /// File version does not match what the registry entry supports
    #[error("{model}: only version {expected} is supported, got {actual}")]
    UnsupportedVersion {
        /// Display name of the model family
        model: String,
        /// Version the registry entry supports
        expected: i32,
        /// Version found in the file
        actual: i32,
    },

    /// A tensor record did not match what the transformer expected
    #[error("tensor mismatch: expected '{expected}', got '{actual}'")]
    TensorMismatch {
        /// Name the transformer asked for
        expected: String,
        /// Name found in the file
        actual: String,
    },

    /// Tensor payload size disagrees with its declared shape
    #[error("tensor '{name}': {elements} elements do not match shape {shape:?}")]
    TensorShapeMismatch {
        /// Tensor name
        name: String,
        /// Element count implied by the expected shape
        elements: usize,
        /// Shape declared in the file
        shape: Vec<usize>,
    },

    /// A forward-pass arena ran out of budget
    #[error("{arena} arena exhausted: requested {requested} bytes, capacity {capacity}")]
    ArenaExhausted {
        /// Arena name ("mem" or "scratch")
        arena: &'static str,
        /// Bytes requested by the failing allocation
        requested: usize,
        /// Total arena capacity in bytes
        capacity: usize,
    },

    /// Compute graph node budget exceeded
    #[error("graph capacity exceeded: {nodes} nodes, capacity {capacity}")]
    GraphCapacity {
        /// Nodes recorded so far
        nodes: usize,
        /// Fixed node capacity
        capacity: usize,
    },

    /// Requested generation length exceeds what the model was built for
    #[error("requested max_length ({requested}) is larger than model's max_length ({model_max})")]
    MaxLengthExceeded {
        /// Caller-requested cap
        requested: usize,
        /// Model's max_length from its config
        model_max: usize,
    },

    /// Embedding / ranker output had the wrong shape
    #[error("output shape mismatch: expected {expected} element(s), got {actual}")]
    OutputShapeMismatch {
        /// Expected element count
        expected: usize,
        /// Actual element count
        actual: usize,
    },

    /// Sampling algorithm name not recognized
    #[error("unknown sampling algorithm: {0}")]
    UnknownSampling(String),

    /// I/O failure while opening or mapping a model file
    #[error("I/O error: {message}")]
    Io {
        /// Human-readable description with path context
        message: String,
    },

    /// File contents could not be parsed past the header
    #[error("malformed model file: {reason}")]
    Malformed {
        /// What went wrong
        reason: String,
    },
}
