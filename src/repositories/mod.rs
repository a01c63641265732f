//! # Repository Layer
//!
//! Repository implementations that encapsulate SeaORM operations for accounts
//! and jobs. Balance mutations live in [`crate::ledger`], never here.

pub mod account;
pub mod job;

pub use account::AccountRepository;
pub use job::{JobStore, JobStoreError, NewJob, TransitionFields};
