//! LedgerEntry entity model
//!
//! Append-only record of every change to an account's credit balance.

use std::fmt;
use std::str::FromStr;

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// A single balance change
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "ledger_entries")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,

    pub account_id: i32,

    /// Signed change in credits. Zero only for audit entries.
    pub delta: i64,

    /// One of `purchase`, `consumption`, `refund`, `admin_adjustment`
    pub kind: String,

    pub description: String,

    /// Checkout session id for purchases, `job:<id>` for consumption and refunds
    pub external_ref: Option<String>,

    /// Amount paid in cents, purchases only
    pub amount_cents: Option<i64>,

    /// Account balance immediately after this entry was applied
    pub balance_after: i64,

    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::account::Entity",
        from = "Column::AccountId",
        to = "super::account::Column::Id"
    )]
    Account,
}

impl Related<super::account::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Account.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Typed view of the stored `kind` column
    pub fn entry_kind(&self) -> Option<LedgerEntryKind> {
        self.kind.parse().ok()
    }
}

/// Reason a ledger entry was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    Purchase,
    Consumption,
    Refund,
    AdminAdjustment,
}

impl LedgerEntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerEntryKind::Purchase => "purchase",
            LedgerEntryKind::Consumption => "consumption",
            LedgerEntryKind::Refund => "refund",
            LedgerEntryKind::AdminAdjustment => "admin_adjustment",
        }
    }

    /// Kinds guarded by the `(kind, external_ref)` unique index
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, LedgerEntryKind::AdminAdjustment)
    }
}

impl fmt::Display for LedgerEntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerEntryKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(LedgerEntryKind::Purchase),
            "consumption" => Ok(LedgerEntryKind::Consumption),
            "refund" => Ok(LedgerEntryKind::Refund),
            "admin_adjustment" => Ok(LedgerEntryKind::AdminAdjustment),
            other => Err(format!("unknown ledger entry kind '{other}'")),
        }
    }
}

/// External reference used for consumption and refund entries of a job
pub fn job_ref(job_id: i32) -> String {
    format!("job:{job_id}")
}
