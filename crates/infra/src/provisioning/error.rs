use thiserror::Error;

use provisioner_core::{DomainError, InstallId, InstallStatus};
use provisioner_crypto::CryptoError;

use crate::external::{NotifyError, PlatformError};
use crate::ledger::LedgerError;

/// Failure of one queued step. Always retryable from the queue's point of
/// view; the retry budget decides when to give up.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("install {0} not found")]
    InstallNotFound(InstallId),

    #[error("{0}")]
    Precondition(String),

    #[error("template is misconfigured: {0}")]
    Misconfigured(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Notify(#[from] NotifyError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

/// Why a customer could not finish setup.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{0}")]
    InvalidPassword(String),

    #[error("invalid setup link")]
    InvalidToken,

    #[error("setup link has already been used")]
    AlreadyUsed,

    #[error("setup link has expired")]
    Expired,

    #[error("install is not ready for setup (status: {0})")]
    NotReady(InstallStatus),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl SetupError {
    /// The caller supplied something unusable, as opposed to an internal failure.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SetupError::InvalidPassword(_)
                | SetupError::InvalidToken
                | SetupError::AlreadyUsed
                | SetupError::Expired
                | SetupError::NotReady(_)
        )
    }
}

/// Operator actions on installs.
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("install {0} not found")]
    NotFound(InstallId),

    #[error("install {id} is {status}; only failed installs can be retried")]
    NotRetryable { id: InstallId, status: InstallStatus },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}
