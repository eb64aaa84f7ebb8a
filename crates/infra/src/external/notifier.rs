//! Outbound customer notifications. Delivery itself (email) is external.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::info;

use provisioner_core::InstallId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("notification failed: {0}")]
pub struct NotifyError(pub String);

/// A one-time setup link for a freshly configured install.
#[derive(Clone, PartialEq, Eq)]
pub struct SetupLink {
    pub install_id: InstallId,
    pub email: String,
    pub name: String,
    pub url: String,
    pub domain: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for SetupLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetupLink")
            .field("install_id", &self.install_id)
            .field("email", &self.email)
            .field("domain", &self.domain)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_setup_link(&self, link: &SetupLink) -> Result<(), NotifyError>;
}

/// Records that a link was issued. The URL carries a bearer token and is not logged.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_setup_link(&self, link: &SetupLink) -> Result<(), NotifyError> {
        info!(
            install_id = %link.install_id,
            email = %link.email,
            domain = %link.domain,
            expires_at = %link.expires_at,
            "setup link issued"
        );
        Ok(())
    }
}

/// Keeps issued links in memory. Used by tests and local development, where
/// the link would otherwise only exist in the customer's inbox.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    links: Mutex<Vec<SetupLink>>,
    failing: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every send fails.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn links(&self) -> Vec<SetupLink> {
        self.links.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn last_for(&self, install_id: InstallId) -> Option<SetupLink> {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find(|l| l.install_id == install_id)
            .cloned()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_setup_link(&self, link: &SetupLink) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError("mail relay unavailable".into()));
        }
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(link.clone());
        Ok(())
    }
}
