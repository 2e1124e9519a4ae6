//! Typed job commands.
//!
//! Job records carry a type string plus a JSON payload. [`JobCommand`] is the
//! typed view of that pair: one variant per handler, each with its own payload
//! struct. Decoding happens at dispatch time; validation of a typed command
//! happens at enqueue time.

use core::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::JobError;

/// Known job types, one per external service handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    #[serde(rename = "service.provision")]
    Provision,
    #[serde(rename = "service.renew")]
    Renew,
    #[serde(rename = "service.suspend")]
    Suspend,
    #[serde(rename = "service.sync")]
    Sync,
    #[serde(rename = "service.change_password")]
    ChangePassword,
    #[serde(rename = "service.change_plan")]
    ChangePlan,
}

impl JobKind {
    pub const ALL: [JobKind; 6] = [
        JobKind::Provision,
        JobKind::Renew,
        JobKind::Suspend,
        JobKind::Sync,
        JobKind::ChangePassword,
        JobKind::ChangePlan,
    ];

    /// Type string stored on job records.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Provision => "service.provision",
            JobKind::Renew => "service.renew",
            JobKind::Suspend => "service.suspend",
            JobKind::Sync => "service.sync",
            JobKind::ChangePassword => "service.change_password",
            JobKind::ChangePlan => "service.change_plan",
        }
    }
}

impl core::fmt::Display for JobKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| JobError::not_implemented(format!("unknown job type '{s}'")))
    }
}

/// Create an account on the external service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionAccount {
    pub username: String,
    pub plan: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Invite that led to this account, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_code: Option<String>,
}

/// Extend a subscription on the external service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewSubscription {
    pub account_ref: String,
    #[serde(default = "default_renewal_months")]
    pub months: u32,
}

fn default_renewal_months() -> u32 {
    1
}

/// Disable an account on the external service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspendAccount {
    pub account_ref: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Reconcile portal state with the external service.
///
/// Without `account_ref` the sync covers every account of the owner, or the
/// whole service for system-initiated jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAccounts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_ref: Option<String>,
}

/// Set a new password on the external account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePassword {
    pub account_ref: String,
    pub new_password: String,
}

impl core::fmt::Debug for ChangePassword {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChangePassword")
            .field("account_ref", &self.account_ref)
            .field("new_password", &"<redacted>")
            .finish()
    }
}

/// Move the external account to another plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePlan {
    pub account_ref: String,
    pub plan: String,
}

/// A job type together with its typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCommand {
    Provision(ProvisionAccount),
    Renew(RenewSubscription),
    Suspend(SuspendAccount),
    Sync(SyncAccounts),
    ChangePassword(ChangePassword),
    ChangePlan(ChangePlan),
}

impl JobCommand {
    pub fn kind(&self) -> JobKind {
        match self {
            JobCommand::Provision(_) => JobKind::Provision,
            JobCommand::Renew(_) => JobKind::Renew,
            JobCommand::Suspend(_) => JobKind::Suspend,
            JobCommand::Sync(_) => JobKind::Sync,
            JobCommand::ChangePassword(_) => JobKind::ChangePassword,
            JobCommand::ChangePlan(_) => JobKind::ChangePlan,
        }
    }

    /// Decode a stored `(type, payload)` pair.
    ///
    /// Unknown types fail with `NOT_IMPLEMENTED`; payloads that do not fit the
    /// type's shape fail with `VALIDATION_ERROR`. Both are terminal.
    pub fn decode(job_type: &str, payload: &serde_json::Value) -> Result<Self, JobError> {
        let kind: JobKind = job_type.parse()?;
        let command = match kind {
            JobKind::Provision => JobCommand::Provision(decode_payload(kind, payload)?),
            JobKind::Renew => JobCommand::Renew(decode_payload(kind, payload)?),
            JobKind::Suspend => JobCommand::Suspend(decode_payload(kind, payload)?),
            JobKind::Sync => JobCommand::Sync(decode_payload(kind, payload)?),
            JobKind::ChangePassword => JobCommand::ChangePassword(decode_payload(kind, payload)?),
            JobKind::ChangePlan => JobCommand::ChangePlan(decode_payload(kind, payload)?),
        };
        Ok(command)
    }

    /// Serialize the payload half of the command for storage.
    pub fn payload(&self) -> Result<serde_json::Value, JobError> {
        let value = match self {
            JobCommand::Provision(p) => serde_json::to_value(p),
            JobCommand::Renew(p) => serde_json::to_value(p),
            JobCommand::Suspend(p) => serde_json::to_value(p),
            JobCommand::Sync(p) => serde_json::to_value(p),
            JobCommand::ChangePassword(p) => serde_json::to_value(p),
            JobCommand::ChangePlan(p) => serde_json::to_value(p),
        };
        value.map_err(|e| JobError::validation(format!("payload serialization failed: {e}")))
    }

    /// Field-level checks serde cannot express.
    pub fn validate(&self) -> Result<(), JobError> {
        match self {
            JobCommand::Provision(p) => {
                require("username", &p.username)?;
                require("plan", &p.plan)
            }
            JobCommand::Renew(p) => {
                require("account_ref", &p.account_ref)?;
                if p.months == 0 {
                    return Err(JobError::validation("months must be at least 1"));
                }
                Ok(())
            }
            JobCommand::Suspend(p) => require("account_ref", &p.account_ref),
            JobCommand::Sync(p) => match &p.account_ref {
                Some(account_ref) => require("account_ref", account_ref),
                None => Ok(()),
            },
            JobCommand::ChangePassword(p) => {
                require("account_ref", &p.account_ref)?;
                require("new_password", &p.new_password)
            }
            JobCommand::ChangePlan(p) => {
                require("account_ref", &p.account_ref)?;
                require("plan", &p.plan)
            }
        }
    }
}

fn decode_payload<T: DeserializeOwned>(
    kind: JobKind,
    payload: &serde_json::Value,
) -> Result<T, JobError> {
    T::deserialize(payload)
        .map_err(|e| JobError::validation(format!("invalid payload for {kind}: {e}")))
}

fn require(field: &str, value: &str) -> Result<(), JobError> {
    if value.trim().is_empty() {
        return Err(JobError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}
