//! Concurrent alert evaluation.
//!
//! Every alert runs on its own task: validate, search, and notify when the
//! search matched anything. A failing alert is recorded in the [`Report`]
//! and never stops the others.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::alert::Alert;
use crate::error::{Error, Result};
use crate::notify::Notifier;
use crate::search::MailSearch;

/// An alert that could not be evaluated or delivered.
#[derive(Debug)]
pub struct AlertFailure {
    /// Title of the failed alert.
    pub title: String,
    /// Why it failed.
    pub error: Error,
}

/// Outcome of one [`Processor::process`] run.
#[derive(Debug, Default)]
pub struct Report {
    /// Number of notifications delivered.
    pub emitted: usize,
    /// Alerts that failed.
    pub failures: Vec<AlertFailure>,
}

impl Report {
    /// Returns true when no alert failed.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Evaluates alerts against a mail backend and a notification backend.
#[derive(Debug)]
pub struct Processor<M, N> {
    search: Arc<M>,
    notifier: Arc<N>,
}

impl<M, N> Clone for Processor<M, N> {
    fn clone(&self) -> Self {
        Self {
            search: Arc::clone(&self.search),
            notifier: Arc::clone(&self.notifier),
        }
    }
}

impl<M, N> Processor<M, N>
where
    M: MailSearch + Send + Sync + 'static,
    N: Notifier + Send + Sync + 'static,
{
    /// Creates a processor.
    pub fn new(search: M, notifier: N) -> Self {
        Self {
            search: Arc::new(search),
            notifier: Arc::new(notifier),
        }
    }

    /// Evaluates all `alerts` concurrently and waits for every one of them.
    pub async fn process(&self, alerts: Vec<Alert>) -> Report {
        info!(count = alerts.len(), "Processing email queries");

        let mut tasks = JoinSet::new();
        for alert in alerts {
            let search = Arc::clone(&self.search);
            let notifier = Arc::clone(&self.notifier);
            let span = info_span!("alert", title = %alert.pushover_title);
            tasks.spawn(
                async move {
                    let outcome = evaluate(&*search, &*notifier, &alert).await;
                    (alert.pushover_title, outcome)
                }
                .instrument(span),
            );
        }

        let mut report = Report::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(true))) => report.emitted += 1,
                Ok((_, Ok(false))) => {}
                Ok((title, Err(error))) => {
                    warn!(%title, %error, "Alert failed");
                    report.failures.push(AlertFailure { title, error });
                }
                Err(e) => {
                    warn!(error = %e, "Alert task did not complete");
                    report.failures.push(AlertFailure {
                        title: String::new(),
                        error: Error::Task(e.to_string()),
                    });
                }
            }
        }

        info!(
            emitted = report.emitted,
            failed = report.failures.len(),
            "Finished processing alerts"
        );
        report
    }
}

/// Returns whether a notification was sent.
async fn evaluate<M: MailSearch, N: Notifier>(
    search: &M,
    notifier: &N,
    alert: &Alert,
) -> Result<bool> {
    alert.validate()?;

    let matches = search.find(&alert.gmail_query).await?;
    if matches.is_empty() {
        debug!(query = %alert.gmail_query, "No matching emails, no alert");
        return Ok(false);
    }

    let notification = alert.notification(matches.len());
    debug!(message = %notification.message, "Sending alert");
    notifier.notify(&notification).await?;
    info!(matches = matches.len(), "Alert sent");
    Ok(true)
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::alert::Notification;
    use crate::notify::DeliveryError;
    use crate::search::QueryError;

    /// Returns a fixed number of matches per query; unknown queries fail.
    struct FakeSearch(HashMap<&'static str, usize>);

    impl MailSearch for FakeSearch {
        async fn find(&self, query: &str) -> std::result::Result<Vec<String>, QueryError> {
            match self.0.get(query) {
                Some(&n) => Ok((0..n).map(|i| format!("msg-{i}")).collect()),
                None => Err(QueryError::Status {
                    query: query.to_string(),
                    status: 400,
                    body: "Invalid query".into(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
        reject_recipient: Option<&'static str>,
    }

    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> std::result::Result<(), DeliveryError> {
            if self.reject_recipient == Some(notification.recipient.as_str()) {
                return Err(DeliveryError::Rejected {
                    status: 400,
                    errors: "user identifier is invalid".into(),
                });
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    fn alert(query: &str, title: &str) -> Alert {
        Alert {
            gmail_query: query.into(),
            pushover_target: "user-key".into(),
            pushover_title: title.into(),
            pushover_sound: "siren".into(),
        }
    }

    fn search() -> FakeSearch {
        FakeSearch(HashMap::from([("from:bank", 2), ("from:nobody", 0)]))
    }

    #[tokio::test]
    async fn test_matching_alert_notifies() {
        let processor = Processor::new(search(), RecordingNotifier::default());
        let report = processor
            .process(vec![alert("from:bank", "Bank"), alert("from:nobody", "Quiet")])
            .await;

        assert!(report.is_success());
        assert_eq!(report.emitted, 1);

        let sent = processor.notifier.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![Notification {
                recipient: "user-key".into(),
                title: "Bank".into(),
                message: "found 2 emails matching query \"from:bank\"".into(),
                sound: "siren".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_other_alerts() {
        let processor = Processor::new(search(), RecordingNotifier::default());
        let report = processor
            .process(vec![
                alert("bad query", "Broken"),
                alert("", "Invalid"),
                alert("from:bank", "Bank"),
            ])
            .await;

        assert_eq!(report.emitted, 1);
        let mut failed: Vec<_> = report.failures.iter().map(|f| f.title.as_str()).collect();
        failed.sort_unstable();
        assert_eq!(failed, vec!["Broken", "Invalid"]);

        for failure in &report.failures {
            match failure.title.as_str() {
                "Broken" => assert!(matches!(failure.error, Error::Query(_))),
                "Invalid" => assert!(matches!(failure.error, Error::Config(_))),
                other => panic!("unexpected failure {other}"),
            }
        }
    }

    #[tokio::test]
    async fn test_delivery_failure_is_reported() {
        let notifier = RecordingNotifier {
            reject_recipient: Some("user-key"),
            ..RecordingNotifier::default()
        };
        let report = Processor::new(search(), notifier)
            .process(vec![alert("from:bank", "Bank")])
            .await;

        assert_eq!(report.emitted, 0);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(report.failures[0].error, Error::Delivery(_)));
    }

    #[tokio::test]
    async fn test_no_alerts() {
        let report = Processor::new(search(), RecordingNotifier::default())
            .process(Vec::new())
            .await;
        assert!(report.is_success());
        assert_eq!(report.emitted, 0);
    }
}
