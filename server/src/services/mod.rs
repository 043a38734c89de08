//! Ticket and vote services.

pub mod ticket;
pub mod vote;

pub use ticket::{Role, TicketService, PRODUCER_LOCK, SERVICE_START_LOCK, SERVICE_START_WAIT};
pub use vote::VoteService;
