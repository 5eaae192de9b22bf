//! Work, contract and task models.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::User;

/// How a work posting is priced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    Hourly,
    Monthly,
}

impl ContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractType::Hourly => "hourly",
            ContractType::Monthly => "monthly",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "monthly" => ContractType::Monthly,
            _ => ContractType::Hourly,
        }
    }
}

/// Work posting status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Active,
    Paused,
    Terminate,
}

impl WorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Active => "active",
            WorkStatus::Paused => "paused",
            WorkStatus::Terminate => "terminate",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "paused" => WorkStatus::Paused,
            "terminate" => WorkStatus::Terminate,
            _ => WorkStatus::Active,
        }
    }
}

/// A job posting owned by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Work {
    pub work_id: Uuid,
    pub client_id: Uuid,
    pub title: String,
    pub contract_type: ContractType,
    /// Per hour for hourly work, per month for monthly work.
    pub rate: Decimal,
    pub status: WorkStatus,
    pub weekly_time_limit: Option<Decimal>,
}

/// Assignment of one freelancer to one work posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub contract_id: Uuid,
    pub work_id: Uuid,
    pub freelancer_id: Uuid,
    /// Agency commission in percent, 0..=100.
    pub agency_rate: Decimal,
    pub created_utc: DateTime<Utc>,
}

/// Input for assigning a freelancer to a work posting.
#[derive(Debug, Clone)]
pub struct NewContract {
    pub work_id: Uuid,
    pub freelancer_id: Uuid,
    pub agency_rate: Decimal,
}

impl NewContract {
    /// Agency rate must be a percentage with at most two decimals.
    pub fn validate(&self) -> Result<(), String> {
        if self.agency_rate < Decimal::ZERO || self.agency_rate > Decimal::ONE_HUNDRED {
            return Err(format!(
                "Agency rate must be between 0 and 100, got {}",
                self.agency_rate
            ));
        }
        if self.agency_rate.scale() > 2 && self.agency_rate != self.agency_rate.round_dp(2) {
            return Err(format!(
                "Agency rate supports two decimal places, got {}",
                self.agency_rate
            ));
        }
        Ok(())
    }
}

/// A time entry logged by a freelancer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: Uuid,
    pub freelancer_id: Uuid,
    /// `None` for personal, non-billable entries.
    pub contract_id: Option<Uuid>,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub is_billable: bool,
    /// Hours to bill. Set independently of the wall-clock duration.
    pub billable_hours: Decimal,
    pub status: String,
}

impl Task {
    /// Wall-clock duration, when the task has been stopped.
    pub fn duration(&self) -> Option<Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// A contract with everything billing needs resolved up front.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContractBilling {
    pub contract: Contract,
    pub work: Work,
    pub freelancer: User,
    /// Billable tasks that started inside the billing period.
    pub tasks: Vec<Task>,
}
