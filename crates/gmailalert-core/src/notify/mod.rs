//! Push notification backends.

mod pushover;

use std::future::Future;

pub use pushover::{PUSHOVER_MESSAGES_URL, PushoverClient};

use crate::alert::Notification;

/// Errors that can occur while delivering a notification.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// The notification is incomplete.
    #[error("invalid notification: {0}")]
    Invalid(String),

    /// The request could not be sent.
    #[error("failed to reach pushover: {0}")]
    Transport(#[from] reqwest::Error),

    /// Pushover refused the message.
    #[error("pushover rejected the message (status {status}): {errors}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Reasons reported by the API.
        errors: String,
    },
}

/// Delivers push notifications.
pub trait Notifier {
    /// Sends `notification`.
    fn notify(
        &self,
        notification: &Notification,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}
