//! # gmailalert-core
//!
//! Alert evaluation for `gmailalert`.
//!
//! This crate provides:
//! - Alert definitions and the JSON alert configuration
//! - Gmail search over an authorized client
//! - Pushover delivery
//! - Concurrent per-alert processing with a failure report

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod alert;
mod error;
pub mod notify;
pub mod processor;
pub mod search;

pub use alert::{Alert, AlertConfig, Notification};
pub use error::{Error, Result};
pub use notify::{DeliveryError, Notifier, PushoverClient};
pub use processor::{AlertFailure, Processor, Report};
pub use search::{GmailClient, MailSearch, QueryError};
