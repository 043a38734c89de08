//! GraphQL schema: the contractual operations over the vote service.
//!
//! Query: `getTicket`, `getUserVotes`, `getAllUserVotes`.
//! Mutation: `vote`, `ticketAndVote`.
//!
//! Timestamps cross the wire as RFC 3339 strings. Input-validation failures
//! come back as a `VoteResponse` with `success = false`; only system-level
//! failures become GraphQL errors (carrying the attempted usernames in the
//! error extensions).

use async_graphql::{Context, EmptySubscription, ErrorExtensions, InputObject, Object, Schema, SimpleObject};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use voteflow_core::model::{Ticket, UserVote, VoteRequest, VoteResponse};
use voteflow_core::VoteError;

use crate::services::VoteService;

/// The executable schema.
pub type VoteSchema = Schema<QueryRoot, MutationRoot, EmptySubscription>;

/// Build the schema around a vote service.
#[must_use]
pub fn build_schema(service: Arc<VoteService>) -> VoteSchema {
    Schema::build(QueryRoot, MutationRoot, EmptySubscription)
        .data(service)
        .finish()
}

/// A ticket as exposed to clients.
#[derive(SimpleObject)]
#[graphql(name = "Ticket")]
pub struct TicketPayload {
    value: String,
    version: String,
    remaining_usages: i32,
    expires_at: String,
    created_at: String,
}

impl From<Ticket> for TicketPayload {
    fn from(ticket: Ticket) -> Self {
        Self {
            value: ticket.value,
            version: ticket.version,
            remaining_usages: ticket.remaining_usages,
            expires_at: ticket.expires_at.to_rfc3339(),
            created_at: ticket.created_at.to_rfc3339(),
        }
    }
}

/// A user's tally as exposed to clients.
#[derive(SimpleObject)]
#[graphql(name = "UserVote")]
pub struct UserVotePayload {
    username: String,
    votes: i64,
    updated_at: String,
}

impl From<UserVote> for UserVotePayload {
    fn from(vote: UserVote) -> Self {
        Self {
            username: vote.username,
            votes: vote.votes,
            updated_at: vote.updated_at.to_rfc3339(),
        }
    }
}

/// Vote outcome as exposed to clients.
#[derive(SimpleObject)]
#[graphql(name = "VoteResponse")]
pub struct VoteResponsePayload {
    success: bool,
    message: String,
    usernames: Vec<String>,
    timestamp: String,
}

impl From<VoteResponse> for VoteResponsePayload {
    fn from(response: VoteResponse) -> Self {
        Self {
            success: response.success,
            message: response.message,
            usernames: response.usernames,
            timestamp: response.timestamp.to_rfc3339(),
        }
    }
}

/// A ticket as presented by clients.
#[derive(InputObject)]
#[graphql(name = "TicketInput")]
pub struct TicketInput {
    value: String,
    version: String,
    remaining_usages: i32,
    expires_at: String,
    created_at: String,
}

impl TicketInput {
    /// Parse the wire shape back into a domain ticket.
    fn into_ticket(self) -> Result<Ticket, String> {
        let parse = |field: &str, raw: &str| -> Result<DateTime<Utc>, String> {
            DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| format!("invalid {field} timestamp: {e}"))
        };
        let expires_at = parse("expiresAt", &self.expires_at)?;
        let created_at = parse("createdAt", &self.created_at)?;
        Ok(Ticket {
            value: self.value,
            version: self.version,
            remaining_usages: self.remaining_usages,
            expires_at,
            created_at,
        })
    }
}

/// A vote: the voters plus the paying ticket.
#[derive(InputObject)]
#[graphql(name = "VoteInput")]
pub struct VoteInput {
    usernames: Vec<String>,
    ticket: TicketInput,
}

/// Wrap a system-level failure, echoing the attempted usernames.
fn system_error(error: &VoteError, usernames: &[String]) -> async_graphql::Error {
    let names = usernames.join(",");
    async_graphql::Error::new(error.to_string())
        .extend_with(|_, extensions| extensions.set("usernames", names.as_str()))
}

/// Read operations.
pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// The currently spendable ticket.
    async fn get_ticket(&self, ctx: &Context<'_>) -> async_graphql::Result<TicketPayload> {
        let service = ctx.data_unchecked::<Arc<VoteService>>();
        let ticket = service
            .ticket()
            .await
            .map_err(|e| async_graphql::Error::new(e.to_string()))?;
        Ok(ticket.into())
    }

    /// One user's tally; the username must match `^[A-Z]$`.
    async fn get_user_votes(
        &self,
        ctx: &Context<'_>,
        username: String,
    ) -> async_graphql::Result<UserVotePayload> {
        let service = ctx.data_unchecked::<Arc<VoteService>>();
        let vote = service
            .user_vote(&username)
            .await
            .map_err(|e| async_graphql::Error::new(e.to_string()))?;
        Ok(vote.into())
    }

    /// Every user's tally.
    async fn get_all_user_votes(
        &self,
        ctx: &Context<'_>,
    ) -> async_graphql::Result<Vec<UserVotePayload>> {
        let service = ctx.data_unchecked::<Arc<VoteService>>();
        let votes = service
            .all_user_votes()
            .await
            .map_err(|e| async_graphql::Error::new(e.to_string()))?;
        Ok(votes.into_iter().map(Into::into).collect())
    }
}

/// Write operations.
pub struct MutationRoot;

#[Object]
impl MutationRoot {
    /// Cast a vote with a previously fetched ticket.
    async fn vote(
        &self,
        ctx: &Context<'_>,
        input: VoteInput,
    ) -> async_graphql::Result<VoteResponsePayload> {
        let service = ctx.data_unchecked::<Arc<VoteService>>();

        let ticket = match input.ticket.into_ticket() {
            Ok(ticket) => ticket,
            // A malformed timestamp is client input, not a system failure.
            Err(message) => {
                return Ok(VoteResponse::rejected(input.usernames, message).into());
            }
        };

        let request = VoteRequest {
            usernames: input.usernames,
            ticket,
        };
        match service.vote(&request).await {
            Ok(response) => Ok(response.into()),
            Err(error) => Err(system_error(&error, &request.usernames)),
        }
    }

    /// Fetch a ticket and vote with it in one round trip.
    async fn ticket_and_vote(
        &self,
        ctx: &Context<'_>,
        usernames: Vec<String>,
    ) -> async_graphql::Result<VoteResponsePayload> {
        let service = ctx.data_unchecked::<Arc<VoteService>>();
        match service.ticket_and_vote(usernames.clone()).await {
            Ok(response) => Ok(response.into()),
            Err(error) => Err(system_error(&error, &usernames)),
        }
    }
}
