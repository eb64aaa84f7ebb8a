//! `provisioner-core`: domain foundation for install provisioning.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, lifecycle states, ledger records and the admin password policy.

pub mod error;
pub mod id;
pub mod model;
pub mod password;
pub mod status;

pub use error::{DomainError, DomainResult};
pub use id::{CustomerId, InstallId, JobId, PurchaseId, SetupTokenId, WebhookEventId};
pub use model::{
    Customer, DeploymentTargets, Install, ProvisioningJob, Purchase, SetupToken, WebhookEvent,
};
pub use password::validate_admin_password;
pub use status::{InstallStatus, JobStatus, JobType, PurchaseStatus, WebhookEventStatus};
