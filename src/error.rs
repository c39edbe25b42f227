//! Error types for the script lifecycle core.
//!
//! Every error here is local to the operation or pipeline that produced it: the
//! audio thread itself never fails, it degrades the affected unit to silent
//! output instead. There are no retries — a client that wants its script
//! published after a failure has to resubmit the command.

use thiserror::Error;

/// Failures while splitting a script source into its sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScriptError {
    /// At least one section marker was present but `@sample` was missing. A
    /// script without any markers is fine (the whole text becomes the sample
    /// section), but as soon as markers are used the sample section is
    /// mandatory.
    #[error("script requires a @sample section")]
    MissingSampleSection,

    /// The section markers appeared out of order. Sections must appear as
    /// `@init`, `@block`, `@sample`.
    #[error("wrong script section order, required order is @init, @block, @sample")]
    SectionOrder,
}

/// A VM backend rejected a script. Carries the backend's diagnostic string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("script compile failed: {0}")]
pub struct CompileError(pub String);

/// A command's argument list did not match its signature. The command is
/// dropped without submitting a pipeline; any partially built payload is
/// released.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command \"{0}\"")]
    UnknownCommand(String),

    #[error("missing {what} argument")]
    MissingArg { what: &'static str },

    #[error("expected {expected} for {what} argument")]
    WrongType {
        what: &'static str,
        expected: &'static str,
    },

    #[error("negative count for {what} argument")]
    NegativeCount { what: &'static str },
}

/// Failures of the world's bounded real-time pools and queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WorldError {
    /// A bounded slab (the stand-in for the host's real-time allocator) is out
    /// of free slots.
    #[error("real-time pool exhausted while allocating {what}")]
    PoolExhausted { what: &'static str },
}
