//! `portal-core`: foundation building blocks shared by the portal crates.
//!
//! This crate contains **pure** primitives (no infrastructure concerns):
//! identifiers, the domain error model, and the clock abstraction used to keep
//! time-dependent logic deterministic under test.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::DomainError;
pub use id::{JobId, OwnerId};
