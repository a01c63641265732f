//! Credit packages sold through the payment provider.

use serde::Serialize;

/// A purchasable bundle of credits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CreditPackage {
    pub id: &'static str,
    pub name: &'static str,
    pub credits: i64,
    /// Price in US cents
    pub price_cents: i64,
}

pub static CREDIT_PACKAGES: [CreditPackage; 3] = [
    CreditPackage {
        id: "starter",
        name: "Starter",
        credits: 15,
        price_cents: 999,
    },
    CreditPackage {
        id: "popular",
        name: "Popular",
        credits: 45,
        price_cents: 2499,
    },
    CreditPackage {
        id: "professional",
        name: "Professional",
        credits: 100,
        price_cents: 4999,
    },
];

pub fn find_package(id: &str) -> Option<&'static CreditPackage> {
    CREDIT_PACKAGES.iter().find(|package| package.id == id)
}
