//! Pipeline error taxonomy. Every expected failure mode maps to a variant
//! consumed by the batch loop; nothing here aborts a pass except
//! `BackupMissing`, which is fatal for the one record being applied.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// File unreadable as Python source. Non-fatal: skip the file.
    #[error("cannot parse {file}: {source}")]
    Parse {
        file: String,
        #[source]
        source: crate::parse::ParseError,
    },

    /// Empty, sentinel-marked, or transport-failed oracle reply. Skip the unit.
    #[error("oracle failure: {0}")]
    Oracle(String),

    /// Candidate failed a validation gate. Skip the unit, log the reason.
    #[error("validation rejected: {0}")]
    Rejected(RejectReason),

    /// Sandbox test command failed or timed out. Discard the candidate.
    #[error("sandbox test failed for {file}: {reason}")]
    SandboxTest { file: String, reason: String },

    /// No verifiable pre-patch snapshot. Abort this application, leave the
    /// live file untouched.
    #[error("backup missing or unverifiable for {file}: {reason}")]
    BackupMissing { file: String, reason: String },
}

/// Why the validator refused a candidate. Gates apply in this order and
/// short-circuit on first failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    Syntax(String),
    UnauthorizedImport(String),
    MissingProvides(Vec<String>),
}

impl RejectReason {
    /// Stable machine-readable code for ledger entries.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Syntax(_) => "syntax_error",
            Self::UnauthorizedImport(_) => "unauthorized_import",
            Self::MissingProvides(_) => "missing_provides",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax(msg) => write!(f, "candidate does not parse ({msg})"),
            Self::UnauthorizedImport(root) => {
                write!(f, "unauthorized import of module '{root}'")
            }
            Self::MissingProvides(names) => {
                write!(f, "candidate no longer defines: {}", names.join(", "))
            }
        }
    }
}
