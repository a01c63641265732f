//! # Data Models
//!
//! SeaORM entities for accounts, the credit ledger, jobs and rate-limit counters.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod account;
pub mod job;
pub mod ledger_entry;
pub mod rate_limit_counter;

pub use account::Entity as Account;
pub use job::Entity as Job;
pub use job::{JobKind, JobStatus};
pub use ledger_entry::Entity as LedgerEntry;
pub use ledger_entry::LedgerEntryKind;
pub use rate_limit_counter::Entity as RateLimitCounter;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "studio-credits".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
