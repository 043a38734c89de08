//! # Voteflow Core
//!
//! Core traits and domain types for the voteflow voting service.
//!
//! This crate defines the seams between the service logic and its backends:
//!
//! - [`model`]: tickets, per-user tallies, vote events, and the wire
//!   request/response shapes
//! - [`lock`]: the [`DistributedLock`](lock::DistributedLock) trait used for
//!   leader election and producer coordination
//! - [`ticket`]: fast-tier and durable-tier ticket storage traits plus the
//!   dual-tier [`TicketStore`](ticket::TicketStore) composition
//! - [`vote`]: tally storage traits plus the cache-aside
//!   [`VoteStore`](vote::VoteStore) composition
//! - [`bus`]: vote-event publishing, consumption, and dead-letter traits
//! - [`retry`]: bounded exponential backoff for settlement retries
//!
//! Backend crates (`voteflow-redis`, `voteflow-mysql`, `voteflow-etcd`,
//! `voteflow-kafka`) implement these traits; `voteflow-testing` provides
//! in-memory fakes of all of them for hermetic tests.
//!
//! ## Accounting model
//!
//! The load-bearing asymmetry of the whole system lives in these traits: a
//! ticket's `remaining_usages` is *authoritatively* decremented in the fast
//! tier (one atomic server-side script call) and *eventually* decremented in
//! the durable tier by the settlement path. The fast tier is the arbiter of
//! spend; the durable tier is the audit.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod error;
pub mod lock;
pub mod model;
pub mod retry;
pub mod ticket;
pub mod vote;

pub use bus::{DeadLetterSink, VoteEventHandler, VotePublisher};
pub use error::{BusError, LockError, StoreError, VoteError};
pub use lock::DistributedLock;
pub use model::{Ticket, TicketHistory, UserVote, VoteEvent, VoteRequest, VoteResponse};
pub use retry::RetryPolicy;
pub use ticket::{TicketDurableTier, TicketFastTier, TicketStore};
pub use vote::{VoteCacheTier, VoteDurableTier, VoteStore};
