//! `gmailalert` - push a Pushover notification when Gmail has messages
//! matching saved queries.
//!
//! The first run walks the user through Google's consent screen and caches
//! the resulting token; later runs reuse it.

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use gmailalert_core::{AlertConfig, GmailClient, Processor, PushoverClient, Report};
use gmailalert_oauth::{
    AuthorizationRequest, AuthorizedClientFactory, CoordinatorConfig, FileTokenStore,
    GMAIL_READONLY_SCOPE, KeyringTokenStore, ListenerConfig, OAuth2Coordinator, OAuthClient,
    TokenBackend,
};

/// Checks Gmail for messages matching the configured queries and sends a
/// Pushover notification for every query with matches.
#[derive(Parser, Debug)]
#[command(name = "gmailalert", version, about)]
struct Cli {
    /// JSON file containing the alerting criteria.
    #[arg(long, default_value = "alerts.json", value_parser = non_empty_path)]
    alerts_cfg_file: PathBuf,

    /// JSON file containing your Google Developers Console credentials.
    #[arg(long, default_value = "credentials.json", value_parser = non_empty_path)]
    credentials_file: PathBuf,

    /// JSON file to read your Gmail OAuth2 token from (if present), or to
    /// save your Gmail OAuth2 token into (if not present).
    #[arg(long, default_value = "token.json", value_parser = non_empty_path)]
    token_file: PathBuf,

    /// Store the token in the system keyring under this account instead of
    /// the token file.
    #[arg(long, value_name = "ACCOUNT", conflicts_with = "token_file")]
    keyring: Option<String>,

    /// Local port to listen on for the OAuth2 redirect (1024-65535).
    #[arg(long, default_value_t = 9999)]
    port: u32,

    /// Open the authorization URL in the default browser.
    #[arg(long)]
    open_browser: bool,

    /// Give up waiting for the authorization redirect after this many seconds.
    #[arg(long, value_name = "SECONDS")]
    auth_timeout: Option<u64>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

fn non_empty_path(value: &str) -> Result<PathBuf, String> {
    if value.trim().is_empty() {
        Err("path must be non-empty".to_string())
    } else {
        Ok(PathBuf::from(value))
    }
}

fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("gmailalert=debug,gmailalert_core=debug,gmailalert_oauth=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "gmailalert=info,gmailalert_core=info,gmailalert_oauth=info".into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli).await {
        Ok(report) if report.is_success() => ExitCode::SUCCESS,
        Ok(report) => {
            for failure in &report.failures {
                eprintln!("Alert \"{}\" failed: {}", failure.title, failure.error);
            }
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<Report> {
    let alerts_document = tokio::fs::read(&cli.alerts_cfg_file)
        .await
        .with_context(|| format!("reading {}", cli.alerts_cfg_file.display()))?;
    let alert_config = AlertConfig::from_json(&alerts_document)
        .with_context(|| format!("decoding {}", cli.alerts_cfg_file.display()))?;
    let pushover = PushoverClient::new(alert_config.pushover_app)
        .context("alert configuration has no pushover application token")?;

    let credentials_document = tokio::fs::read(&cli.credentials_file)
        .await
        .with_context(|| format!("reading {}", cli.credentials_file.display()))?;
    let request = AuthorizationRequest::from_json(&credentials_document, &[GMAIL_READONLY_SCOPE])
        .with_context(|| format!("parsing {}", cli.credentials_file.display()))?;

    let mut config = CoordinatorConfig::new(request.clone(), ListenerConfig::new(cli.port)?)?
        .with_open_browser(cli.open_browser);
    if let Some(secs) = cli.auth_timeout {
        config = config.with_wait_timeout(Duration::from_secs(secs));
    }

    let store = match cli.keyring {
        Some(account) => TokenBackend::Keyring(KeyringTokenStore::new(account)),
        None => TokenBackend::File(FileTokenStore::new(cli.token_file)),
    };
    let coordinator = OAuth2Coordinator::new(config, store, OAuthClient::new(request.clone()));
    let credential = coordinator
        .resolve_token()
        .await
        .context("acquiring a Gmail token")?;

    let client = AuthorizedClientFactory::new().build_client(&request, credential)?;
    let gmail = GmailClient::new(Arc::new(client))?;

    println!(
        "Processing {} email queries to determine if any alerts will be emitted...",
        alert_config.alerts.len()
    );
    let report = Processor::new(gmail, pushover)
        .process(alert_config.alerts)
        .await;
    println!("Emitted {} alerts", report.emitted);
    info!(emitted = report.emitted, failed = report.failures.len(), "Done");

    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["gmailalert"]).unwrap();
        assert_eq!(cli.alerts_cfg_file, PathBuf::from("alerts.json"));
        assert_eq!(cli.credentials_file, PathBuf::from("credentials.json"));
        assert_eq!(cli.token_file, PathBuf::from("token.json"));
        assert_eq!(cli.port, 9999);
        assert!(cli.keyring.is_none());
        assert!(cli.auth_timeout.is_none());
        assert!(!cli.debug);
        assert!(!cli.open_browser);
    }

    #[test]
    fn test_all_flags() {
        let cli = Cli::try_parse_from([
            "gmailalert",
            "--alerts-cfg-file",
            "my-alerts.json",
            "--credentials-file",
            "creds.json",
            "--token-file",
            "/tmp/tok.json",
            "--port",
            "8081",
            "--auth-timeout",
            "120",
            "--open-browser",
            "--debug",
        ])
        .unwrap();
        assert_eq!(cli.alerts_cfg_file, PathBuf::from("my-alerts.json"));
        assert_eq!(cli.credentials_file, PathBuf::from("creds.json"));
        assert_eq!(cli.token_file, PathBuf::from("/tmp/tok.json"));
        assert_eq!(cli.port, 8081);
        assert_eq!(cli.auth_timeout, Some(120));
        assert!(cli.open_browser);
        assert!(cli.debug);
    }

    #[test]
    fn test_empty_paths_rejected() {
        for flag in ["--alerts-cfg-file", "--credentials-file", "--token-file"] {
            assert!(Cli::try_parse_from(["gmailalert", flag, ""]).is_err(), "{flag}");
        }
    }

    #[test]
    fn test_non_numeric_port_rejected() {
        assert!(Cli::try_parse_from(["gmailalert", "--port", "http"]).is_err());
    }

    #[test]
    fn test_keyring_conflicts_with_token_file() {
        assert!(
            Cli::try_parse_from(["gmailalert", "--keyring", "me", "--token-file", "t.json"])
                .is_err()
        );
        let cli = Cli::try_parse_from(["gmailalert", "--keyring", "me"]).unwrap();
        assert_eq!(cli.keyring.as_deref(), Some("me"));
    }
}
