//! # Voteflow Testing
//!
//! In-memory fakes of every voteflow backend trait, for hermetic tests:
//!
//! - [`LockNetwork`] / [`InMemoryLock`]: a simulated coordination store
//!   shared by any number of fake "replicas", with a kill switch for
//!   failover scenarios
//! - [`InMemoryTicketFastTier`] / [`InMemoryTicketDurableTier`]: both ticket
//!   tiers, with the same atomicity and error semantics as the real ones
//! - [`InMemoryVoteCacheTier`] / [`InMemoryVoteDurableTier`]: the tally
//!   tiers, the durable one pre-seeded A..Z like the production schema
//! - [`RecordingPublisher`]: captures published vote events and can be
//!   switched into failure mode to drive the synchronous-settlement path
//!
//! Everything is cheaply cloneable; clones share state, so a test can keep
//! a handle for assertions while the service under test owns another.

#![forbid(unsafe_code)]

mod bus;
mod lock;
mod store;

pub use bus::RecordingPublisher;
pub use lock::{InMemoryLock, LockNetwork};
pub use store::{
    InMemoryTicketDurableTier, InMemoryTicketFastTier, InMemoryVoteCacheTier,
    InMemoryVoteDurableTier,
};
