//! Infrastructure layer: ledger storage, job queue, external adapters and the
//! provisioning services built on them.

pub mod checkout;
pub mod config;
pub mod external;
pub mod installs;
pub mod jobs;
pub mod ledger;
pub mod provisioning;
pub mod rate_limit;
pub mod webhooks;
