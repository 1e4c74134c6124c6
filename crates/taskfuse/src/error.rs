//! Error types for taskfuse.

use thiserror::Error;

/// Errors raised while assembling or running a computation graph.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Two nodes were registered under the same label.
    #[error("a node named {label} already exists")]
    DuplicateLabel { label: String },

    /// An argument id referred to a node or component that does not exist.
    #[error("unknown value {node}/{comp} passed as argument to {label}")]
    UnknownValue {
        label: String,
        node: usize,
        comp: usize,
    },

    /// A kernel was registered with no arguments where at least one is required.
    #[error("{label} requires at least one argument")]
    MissingArguments { label: String },

    /// A kernel received an argument of the wrong rank.
    #[error("argument {arg} of {label} has rank {found}, expected rank {expected}")]
    ArgumentRank {
        label: String,
        arg: String,
        expected: usize,
        found: usize,
    },

    /// Arguments that must share a length do not.
    #[error("argument {arg} of {label} has {found} elements, expected {expected}")]
    ArgumentLength {
        label: String,
        arg: String,
        expected: usize,
        found: usize,
    },

    /// Arguments that must share a periodic domain do not.
    #[error("arguments of {label} have mismatched periodic domains")]
    PeriodicityMismatch { label: String },

    /// Data of the wrong length was pushed into a leaf value.
    #[error("cannot set {label}: expected {expected} elements, got {found}")]
    DataLength {
        label: String,
        expected: usize,
        found: usize,
    },

    /// Only leaf values accept external data.
    #[error("values of {label} are computed, not set")]
    NotSettable { label: String },

    /// Streamed components in one chain disagree on the task count.
    #[error("mismatched numbers of tasks in streamed quantities for {label}")]
    TaskCountMismatch { label: String },

    /// A chain was assembled with a dependency after its consumer.
    #[error("must calculate {before} before {after}")]
    ChainOrder { before: String, after: String },

    /// Forces cannot stream through values with per-element derivatives.
    #[error("cannot propagate forces through grid value {label}")]
    GridForce { label: String },

    /// A runner was used after the graph it was built for changed.
    #[error("stream layout is stale: the graph changed after the runner was built")]
    StaleLayout,

    /// The thread pool for a parallel pass could not be created.
    #[error("failed to build thread pool: {message}")]
    ThreadPool { message: String },
}
