//! RateLimitCounter entity model
//!
//! Fixed-window counters shared by every service instance pointed at the same database.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "rate_limit_counters")]
pub struct Model {
    /// Counter key, e.g. `credits:balance:42`
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,

    /// Requests admitted in the current window
    pub count: i32,

    /// Window start, unix epoch milliseconds
    pub window_started_at_ms: i64,

    /// Window end, unix epoch milliseconds
    pub expires_at_ms: i64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
