//! Vote request handling and event settlement.
//!
//! The request path spends the ticket in the fast tier, then publishes the
//! vote event and returns; the durable tally work belongs to the consumer.
//! Only when the publish itself fails does the request path settle
//! synchronously, so a bus outage degrades throughput instead of dropping
//! votes.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;
use voteflow_core::model::{
    is_valid_username, validate_usernames, Ticket, UserVote, VoteEvent, VoteRequest, VoteResponse,
};
use voteflow_core::{TicketStore, VoteError, VoteEventHandler, VotePublisher, VoteStore};

use super::ticket::TicketService;

/// Vote operations over the ticket service, the tally store, and the bus.
#[derive(Clone)]
pub struct VoteService {
    tickets: Arc<TicketService>,
    ticket_store: TicketStore,
    votes: VoteStore,
    publisher: Arc<dyn VotePublisher>,
}

impl VoteService {
    /// Assemble the service.
    #[must_use]
    pub fn new(
        tickets: Arc<TicketService>,
        ticket_store: TicketStore,
        votes: VoteStore,
        publisher: Arc<dyn VotePublisher>,
    ) -> Self {
        Self {
            tickets,
            ticket_store,
            votes,
            publisher,
        }
    }

    /// The currently spendable ticket, for `getTicket`.
    ///
    /// # Errors
    ///
    /// As for [`TicketService::current_ticket`].
    pub async fn ticket(&self) -> Result<Ticket, VoteError> {
        self.tickets.current_ticket().await
    }

    /// Cast a vote. Rejections (bad input, stale or exhausted ticket) come
    /// back as a `success = false` response; only system-level failures are
    /// errors.
    ///
    /// # Errors
    ///
    /// Store or bus transport failures, including a failed synchronous
    /// settlement after a failed publish.
    pub async fn vote(&self, request: &VoteRequest) -> Result<VoteResponse, VoteError> {
        match self.try_vote(request).await {
            Ok(()) => Ok(VoteResponse::accepted(request.usernames.clone())),
            Err(error) if error.is_rejection() => Ok(VoteResponse::rejected(
                request.usernames.clone(),
                error.to_string(),
            )),
            Err(error) => Err(error),
        }
    }

    async fn try_vote(&self, request: &VoteRequest) -> Result<(), VoteError> {
        validate_usernames(&request.usernames)?;

        // The spend: bounded by the ticket's budget no matter how many
        // replicas are doing this concurrently.
        self.tickets.use_ticket(&request.ticket).await?;

        let event = VoteEvent {
            usernames: request.usernames.clone(),
            ticket_version: request.ticket.version.clone(),
            voted_at: Utc::now(),
        };

        if let Err(error) = self.publisher.publish(&event).await {
            // The ticket is already spent; losing the event here would lose
            // the vote. Settle in-line instead.
            warn!(%error, "publish failed, settling synchronously");
            self.settle(&event).await?;
        }
        Ok(())
    }

    /// Fetch a ticket and vote with it in one call, for thin clients.
    ///
    /// # Errors
    ///
    /// As for [`VoteService::vote`]; a failed ticket fetch surfaces as a
    /// rejection response when it is not a transport problem.
    pub async fn ticket_and_vote(&self, usernames: Vec<String>) -> Result<VoteResponse, VoteError> {
        let ticket = match self.tickets.current_ticket().await {
            Ok(ticket) => ticket,
            Err(error) if error.is_rejection() => {
                return Ok(VoteResponse::rejected(
                    usernames,
                    format!("ticket fetch failed: {error}"),
                ));
            }
            Err(error) => return Err(error),
        };
        self.vote(&VoteRequest { usernames, ticket }).await
    }

    /// Settle one vote event: durable tally increment, durable usage
    /// decrement, cache invalidation, in that order. Shared by the consumer
    /// path and the synchronous fallback, and safe to repeat for the bus's
    /// at-least-once redeliveries.
    ///
    /// # Errors
    ///
    /// The first failing durable write; the caller decides whether to
    /// retry (consumer) or fail the request (fallback).
    pub async fn process_vote_event(&self, event: &VoteEvent) -> Result<(), VoteError> {
        self.settle(event).await
    }

    async fn settle(&self, event: &VoteEvent) -> Result<(), VoteError> {
        self.votes
            .increment(&event.usernames, &event.ticket_version)
            .await?;
        self.ticket_store
            .settle_usage(&event.ticket_version)
            .await?;
        self.votes.invalidate(&event.usernames).await;
        Ok(())
    }

    /// One user's tally, cache-aside.
    ///
    /// # Errors
    ///
    /// [`VoteError::InvalidInput`] for a malformed username, otherwise the
    /// store outcome.
    pub async fn user_vote(&self, username: &str) -> Result<UserVote, VoteError> {
        if !is_valid_username(username) {
            return Err(VoteError::InvalidInput(format!(
                "invalid username {username:?}: must be a single letter A-Z"
            )));
        }
        Ok(self.votes.get(username).await?)
    }

    /// All 26 tallies, straight from the durable tier.
    ///
    /// # Errors
    ///
    /// Durable store failures.
    pub async fn all_user_votes(&self) -> Result<Vec<UserVote>, VoteError> {
        Ok(self.votes.get_all().await?)
    }
}

#[async_trait]
impl VoteEventHandler for VoteService {
    async fn handle(&self, event: &VoteEvent) -> Result<(), VoteError> {
        self.process_vote_event(event).await
    }
}
