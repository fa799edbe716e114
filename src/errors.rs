use std::path::PathBuf;

use thiserror::Error;

/// Recoverable failures the orchestrator classifies per §7: skip-and-continue,
/// never partial output of a successful application.
#[derive(Error, Debug)]
pub(crate) enum EngineError {
    /// (a) a library artifact in the corpus is unreadable; the library is skipped.
    #[error("failed to decode library artifact {path}: {reason}")]
    CorpusDecode { path: PathBuf, reason: String },

    /// (b) an application artifact is unreadable; the application is skipped.
    #[error("failed to decode application {path}: {reason}")]
    ApplicationDecode { path: PathBuf, reason: String },

    /// (d) an opcode mnemonic is absent from the configured alphabet.
    #[error("opcode `{0}` is not present in the configured alphabet")]
    UnknownOpcode(String),
}
