//! Customer setup via the one-time link.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, instrument, warn};

use provisioner_core::{Install, InstallStatus, SetupToken, validate_admin_password};
use provisioner_crypto::hash_token;

use crate::external::ServiceTarget;

use super::steps::SETUP_TOKEN_BYTES;
use super::{Provisioner, SetupError};

/// What the setup page needs to render before the customer submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupTokenStatus {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SetupTokenStatus {
    fn invalid(error: &SetupError) -> Self {
        Self {
            valid: false,
            domain: None,
            expires_at: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupCompletion {
    pub domain: String,
    pub login_url: String,
}

fn is_well_formed(token: &str) -> bool {
    token.len() == SETUP_TOKEN_BYTES * 2 && token.bytes().all(|b| b.is_ascii_hexdigit())
}

impl Provisioner {
    /// Resolve a presented token to its row and install, rejecting unknown,
    /// used and expired links.
    async fn resolve_token(&self, token: &str) -> Result<(SetupToken, Install), SetupError> {
        if !is_well_formed(token) {
            return Err(SetupError::InvalidToken);
        }
        let row = self
            .ledger
            .find_setup_token(&hash_token(&token.to_ascii_lowercase()))
            .await?
            .ok_or(SetupError::InvalidToken)?;
        if row.used {
            return Err(SetupError::AlreadyUsed);
        }
        if row.is_expired(Utc::now()) {
            return Err(SetupError::Expired);
        }
        let install = self
            .ledger
            .get_install(row.install_id)
            .await?
            .ok_or(SetupError::InvalidToken)?;
        Ok((row, install))
    }

    /// Check a link without consuming it.
    pub async fn inspect_setup_token(&self, token: &str) -> Result<SetupTokenStatus, SetupError> {
        match self.resolve_token(token).await {
            Ok((row, install)) => Ok(SetupTokenStatus {
                valid: true,
                domain: install.domain,
                expires_at: Some(row.expires_at),
                error: None,
            }),
            Err(e) if e.is_rejection() => Ok(SetupTokenStatus::invalid(&e)),
            Err(e) => Err(e),
        }
    }

    /// Set the admin password on the instance and activate the install.
    /// Irreversible per token once it succeeds; a platform failure releases
    /// the link so the customer can try again.
    #[instrument(skip_all, err(Display))]
    pub async fn complete_setup(
        &self,
        token: &str,
        password: &str,
        confirm_password: &str,
    ) -> Result<SetupCompletion, SetupError> {
        validate_admin_password(password, confirm_password)
            .map_err(|e| SetupError::InvalidPassword(e.message().to_string()))?;

        let (row, install) = self.resolve_token(token).await?;
        match install.status {
            InstallStatus::SetupPending => {}
            InstallStatus::Active => return Err(SetupError::AlreadyUsed),
            other => return Err(SetupError::NotReady(other)),
        }

        let domain = match (install.deployment_targets(), install.domain.clone()) {
            (Some(_), Some(domain)) => domain,
            _ => return Err(SetupError::NotReady(install.status)),
        };

        // Claim first: only the caller holding the claim touches the instance.
        let claimed_at = Utc::now();
        if !self.ledger.consume_setup_token(row.id, claimed_at).await? {
            warn!(install_id = %install.id, "setup token consumed concurrently");
            return Err(SetupError::AlreadyUsed);
        }

        if let Err(e) = self.activate(&install, password).await {
            warn!(install_id = %install.id, error = %e, "setup failed; releasing the link");
            if let Err(release) = self.ledger.release_setup_token(row.id, claimed_at).await {
                warn!(install_id = %install.id, error = %release, "could not release setup link");
            }
            return Err(e);
        }
        info!(install_id = %install.id, "install activated");

        Ok(SetupCompletion {
            login_url: format!("https://{domain}/login"),
            domain,
        })
    }

    /// Push the admin credentials, redeploy the web service, mark active.
    async fn activate(&self, install: &Install, password: &str) -> Result<(), SetupError> {
        let targets = install
            .deployment_targets()
            .ok_or(SetupError::NotReady(install.status))?;
        let web = ServiceTarget {
            project_id: targets.project_id,
            environment_id: targets.environment_id,
            service_id: targets.web_service_id,
        };

        let mut vars = BTreeMap::from([("ADMIN_PASSWORD".to_string(), password.to_string())]);
        if let Some(customer) = self.ledger.get_customer(install.customer_id).await? {
            vars.insert("ADMIN_EMAIL".to_string(), customer.email);
        }
        self.platform.upsert_variables(web, &vars).await?;
        self.platform.deploy_service(web).await?;

        let mut active = install.clone();
        active.transition_to(InstallStatus::Active, Utc::now())?;
        self.ledger.update_install(&active).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_shape_is_checked_before_lookup() {
        assert!(is_well_formed(&"a".repeat(64)));
        assert!(is_well_formed(&"AB".repeat(32)));
        assert!(!is_well_formed(&"a".repeat(63)));
        assert!(!is_well_formed(&"g".repeat(64)));
        assert!(!is_well_formed(""));
    }

    #[test]
    fn invalid_status_carries_the_reason() {
        let status = SetupTokenStatus::invalid(&SetupError::Expired);
        assert!(!status.valid);
        assert_eq!(status.error.as_deref(), Some("setup link has expired"));
    }
}
