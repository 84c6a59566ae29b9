//! Typed error taxonomy for conditions callers are expected to branch on.
//!
//! Control flow that is not an error (try-again retries, cursor outcomes,
//! reactivity) uses dedicated result enums instead; everything genuinely
//! fatal travels as `eyre::Report` with one of these at the root so callers
//! can `downcast_ref::<EngineError>()`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// `insert_no_overwrite` against a key with a live visible value.
    #[error("key already exists")]
    KeyExists,

    /// A snapshot cursor was opened against a dictionary created after the
    /// snapshot was taken.
    #[error("dictionary is too new for the requested snapshot")]
    DictionaryTooNewForSnapshot,

    /// The engine hit a non-recoverable error earlier; the code and message
    /// recorded in the header poison every subsequent operation.
    #[error("engine poisoned (code {code}): {msg}")]
    Poisoned { code: i32, msg: String },
}
