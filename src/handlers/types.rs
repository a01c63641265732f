//! # Common API Types
//!
//! Shared request types used across list endpoints.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

pub const DEFAULT_PAGE_LIMIT: u64 = 20;
pub const MAX_PAGE_LIMIT: u64 = 100;

/// Offset pagination for list endpoints
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize, IntoParams, ToSchema)]
#[into_params(parameter_in = Query)]
pub struct PageQuery {
    /// Maximum items to return (default 20, capped at 100)
    #[param(minimum = 1, maximum = 100)]
    pub limit: Option<u64>,
    /// Items to skip from the newest
    pub offset: Option<u64>,
}

impl PageQuery {
    /// Effective `(limit, offset)` after defaults and clamping
    pub fn bounds(&self) -> (u64, u64) {
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_LIMIT)
            .clamp(1, MAX_PAGE_LIMIT);
        (limit, self.offset.unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_defaults_and_clamps_limit() {
        assert_eq!(PageQuery::default().bounds(), (20, 0));
        assert_eq!(
            PageQuery {
                limit: Some(500),
                offset: Some(40)
            }
            .bounds(),
            (100, 40)
        );
        assert_eq!(
            PageQuery {
                limit: Some(0),
                offset: None
            }
            .bounds(),
            (1, 0)
        );
    }
}
