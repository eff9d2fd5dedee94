//! Mail search backends.

mod gmail;

use std::future::Future;

pub use gmail::{GMAIL_API_BASE, GmailClient};

/// Errors that can occur while searching a mailbox.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The request could not be sent or authenticated.
    #[error("got error executing gmail query {query}: {source}")]
    Transport {
        /// Search expression.
        query: String,
        /// Underlying error.
        source: gmailalert_oauth::Error,
    },

    /// The API answered with a non-success status.
    #[error("gmail query {query} failed with status {status}: {body}")]
    Status {
        /// Search expression.
        query: String,
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },

    /// The API response could not be decoded.
    #[error("gmail query {query} returned an unreadable response: {source}")]
    Decode {
        /// Search expression.
        query: String,
        /// Underlying decode error.
        source: serde_json::Error,
    },
}

/// Finds messages matching a search expression.
pub trait MailSearch {
    /// Returns the identifiers of all messages matching `query`.
    fn find(&self, query: &str) -> impl Future<Output = Result<Vec<String>, QueryError>> + Send;
}
