//! Lifecycle states for ledger records.
//!
//! Every status is stored as a snake_case string; `as_str` / `FromStr` are the
//! only conversions used by storage adapters.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

macro_rules! string_enum {
    ($t:ident, $name:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $t {
            pub const ALL: &'static [$t] = &[$($t::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($t::$variant => $text),+
                }
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $t {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($t::$variant),)+
                    other => Err(DomainError::validation(format!(
                        "unknown {}: {other}",
                        $name
                    ))),
                }
            }
        }
    };
}

/// Payment state of a purchase.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

string_enum!(PurchaseStatus, "purchase status", {
    Pending => "pending",
    Paid => "paid",
    Failed => "failed",
    Refunded => "refunded",
});

/// Processing state of a stored webhook event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventStatus {
    Received,
    Processed,
    Ignored,
    Failed,
}

string_enum!(WebhookEventStatus, "webhook event status", {
    Received => "received",
    Processed => "processed",
    Ignored => "ignored",
    Failed => "failed",
});

impl WebhookEventStatus {
    /// Events in a settled state are acknowledged as duplicates without side effects.
    pub fn is_settled(&self) -> bool {
        matches!(self, WebhookEventStatus::Processed | WebhookEventStatus::Ignored)
    }
}

/// Lifecycle of a provisioned instance.
///
/// ```text
/// pending -> provisioning -> setup_pending -> active
///    \____________\_______________\-> failed -> pending (operator retry)
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Pending,
    Provisioning,
    SetupPending,
    Active,
    Failed,
}

string_enum!(InstallStatus, "install status", {
    Pending => "pending",
    Provisioning => "provisioning",
    SetupPending => "setup_pending",
    Active => "active",
    Failed => "failed",
});

impl InstallStatus {
    /// Whether `self -> next` is a legal lifecycle move.
    ///
    /// Staying in the same state is legal: a reaped step re-runs from its start.
    pub fn can_transition_to(&self, next: InstallStatus) -> bool {
        use InstallStatus::*;

        if *self == next {
            return true;
        }

        match (self, next) {
            (Pending, Provisioning) => true,
            (Provisioning, SetupPending) => true,
            (SetupPending, Active) => true,
            (Failed, Pending) => true,
            (Active, _) => false,
            (_, Failed) => true,
            _ => false,
        }
    }
}

/// Kind of provisioning step a job executes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Provision,
    Configure,
    Deploy,
}

string_enum!(JobType, "job type", {
    Provision => "provision",
    Configure => "configure",
    Deploy => "deploy",
});

impl JobType {
    /// The step enqueued after this one succeeds, if any.
    pub fn next(&self) -> Option<JobType> {
        match self {
            JobType::Provision => Some(JobType::Configure),
            JobType::Configure => Some(JobType::Deploy),
            JobType::Deploy => None,
        }
    }
}

/// Execution state of a provisioning job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

string_enum!(JobStatus, "job status", {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}
