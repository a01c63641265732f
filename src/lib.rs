//! # Studio Credits Library
//!
//! Credit ledger, job store, webhook verification and job reconciliation for
//! the pet photo studio, plus the HTTP surface that exposes them.

pub mod admin;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod launcher;
pub mod ledger;
pub mod models;
pub mod packages;
pub mod payments;
pub mod rate_limit;
pub mod reconciler;
pub mod repositories;
pub mod server;
pub mod telemetry;
pub mod webhook_verification;
pub use migration;
