//! Configuration loader.
//!
//! All configuration comes from environment variables (a `.env` file is
//! honoured for development). Validation collects every problem before
//! failing so operators see the full list at once; a validation failure is
//! fatal at startup.
//!
//! ## Environment variables
//! - `APP_PORT`: HTTP listen port (default 8080)
//! - `LOG_LEVEL`: log verbosity (default `info`)
//! - `DB_DSN`: PostgreSQL connection string (required)
//! - `DB_CONNECT_TIMEOUT`: initial connect timeout in seconds (default 10)
//! - `DB_OPERATION_RETRIES`: per-operation retry count (default 3)
//! - `DB_RECONNECT_DELAY` / `DB_MAX_RECONNECT_DELAY`: backoff bounds in
//!   seconds (defaults 1 / 30)
//! - `TRACKER_BASE_URL`, `TRACKER_API_KEY` (required),
//!   `TRACKER_WEBHOOK_SECRET`, `TRACKER_PROCESS_AFTER` (`DD.MM.YYYY`)
//! - `MAILBOX_BASE_URL`, `MAILBOX_API_KEY` (required),
//!   `MAILBOX_WEBHOOK_SECRET`, `MAILBOX_PROCESS_AFTER`
//! - `DOCS_BASE_URL` (optional; enables the docs source),
//!   `DOCS_WEBHOOK_SECRET`, `DOCS_POLL_INTERVAL` (seconds, default 300)
//! - `MAX_QUEUE_ATTEMPTS`: failures before dead-letter (default 3)
//! - `BACKFILL_OVERLAP_SECONDS`: overlap window (default 120)
//! - `PERIODIC_BACKFILL_INTERVAL`: reconciler period in seconds
//!   (default 60, or 5 in pure-polling mode)
//! - `DISABLE_WEBHOOKS`: pure-polling mode (default false)
//! - `TIMEZONE`: IANA zone for local process-after dates
//!   (default `Europe/Berlin`)
//! - `WEBHOOK_PUBLIC_URL`: public base URL for webhook auto-registration

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use inflow_domain::{
    AppConfig, BackfillConfig, DatabaseConfig, DocsConfig, HttpConfig, InflowError, QueueConfig,
    Result, Source, SourceConfig,
};
use tracing::info;

const DEFAULT_TIMEZONE: &str = "Europe/Berlin";

/// Load configuration, honouring a `.env` file when present.
pub fn load() -> Result<AppConfig> {
    if let Ok(path) = dotenvy::dotenv() {
        info!(path = %path.display(), "loaded environment from .env");
    }
    load_from_env()
}

/// Load configuration from environment variables only.
pub fn load_from_env() -> Result<AppConfig> {
    let mut errors: Vec<String> = Vec::new();

    let port = env_parse("APP_PORT", 8080_u16, &mut errors);
    let log_level = env_var("LOG_LEVEL").unwrap_or_else(|| "info".to_string());

    let dsn = require(&mut errors, "DB_DSN");
    let database = DatabaseConfig {
        dsn,
        connect_timeout: Duration::from_secs(env_parse("DB_CONNECT_TIMEOUT", 10_u64, &mut errors)),
        operation_retries: env_parse("DB_OPERATION_RETRIES", 3_u32, &mut errors),
        reconnect_delay: Duration::from_secs(env_parse("DB_RECONNECT_DELAY", 1_u64, &mut errors)),
        max_reconnect_delay: Duration::from_secs(env_parse(
            "DB_MAX_RECONNECT_DELAY",
            30_u64,
            &mut errors,
        )),
    };

    let timezone = env_var("TIMEZONE").unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
    let tz = match timezone.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            errors.push(format!("TIMEZONE is not a valid IANA zone: {timezone}"));
            chrono_tz::UTC
        }
    };

    let tracker = load_source(Source::Tracker, "TRACKER", tz, &mut errors);
    let mailbox = load_source(Source::Mailbox, "MAILBOX", tz, &mut errors);

    let docs = env_var("DOCS_BASE_URL").map(|base_url| DocsConfig {
        base_url,
        webhook_secret: env_var("DOCS_WEBHOOK_SECRET"),
    });

    let queue = QueueConfig {
        max_attempts: env_parse("MAX_QUEUE_ATTEMPTS", 3_i32, &mut errors),
        ..QueueConfig::default()
    };

    let disable_webhooks = env_bool("DISABLE_WEBHOOKS", false);
    // Pure-polling mode leans on the reconciler for freshness, so the
    // default period drops from a minute to seconds.
    let default_interval = if disable_webhooks { 5 } else { 60 };
    let backfill = BackfillConfig {
        overlap: Duration::from_secs(env_parse("BACKFILL_OVERLAP_SECONDS", 120_u64, &mut errors)),
        interval: Duration::from_secs(env_parse(
            "PERIODIC_BACKFILL_INTERVAL",
            default_interval,
            &mut errors,
        )),
        disable_webhooks,
        doc_poll_interval: Duration::from_secs(env_parse(
            "DOCS_POLL_INTERVAL",
            300_u64,
            &mut errors,
        )),
    };

    if !errors.is_empty() {
        return Err(InflowError::Config(format!(
            "configuration errors:\n  {}",
            errors.join("\n  ")
        )));
    }

    Ok(AppConfig {
        http: HttpConfig { port, ..HttpConfig::default() },
        log_level,
        database,
        queue,
        backfill,
        tracker,
        mailbox,
        docs,
        timezone,
        public_url: env_var("WEBHOOK_PUBLIC_URL"),
    })
}

fn load_source(source: Source, prefix: &str, tz: Tz, errors: &mut Vec<String>) -> SourceConfig {
    let base_url = require(errors, &format!("{prefix}_BASE_URL"));
    let api_key = require(errors, &format!("{prefix}_API_KEY"));
    let webhook_secret = env_var(&format!("{prefix}_WEBHOOK_SECRET"));

    let process_after_key = format!("{prefix}_PROCESS_AFTER");
    let process_after = match env_var(&process_after_key) {
        Some(raw) => match parse_process_after(&raw, tz) {
            Ok(instant) => Some(instant),
            Err(message) => {
                errors.push(format!("{process_after_key}: {message}"));
                None
            }
        },
        None => None,
    };

    SourceConfig { source, base_url, api_key, webhook_secret, process_after }
}

/// `DD.MM.YYYY`, interpreted as local midnight in the configured zone.
fn parse_process_after(raw: &str, tz: Tz) -> std::result::Result<DateTime<Utc>, String> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%d.%m.%Y")
        .map_err(|_| format!("expected DD.MM.YYYY, got {raw}"))?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| "invalid time of day".to_string())?;
    midnight
        .and_local_timezone(tz)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| format!("{raw} does not exist in zone {tz}"))
}

/// Environment variable, trimmed; empty counts as unset.
fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|value| value.trim().to_string()).filter(|value| !value.is_empty())
}

fn require(errors: &mut Vec<String>, key: &str) -> String {
    match env_var(key) {
        Some(value) => value,
        None => {
            errors.push(format!("{key} is required"));
            String::new()
        }
    }
}

fn env_parse<T>(key: &str, default: T, errors: &mut Vec<String>) -> T
where
    T: FromStr + Copy,
{
    match env_var(key) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                errors.push(format!("{key} has an invalid value: {raw}"));
                default
            }
        },
        None => default,
    }
}

/// Accepts `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off`.
fn env_bool(key: &str, default: bool) -> bool {
    env_var(key)
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use once_cell::sync::Lazy;

    use super::*;

    static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const ALL_KEYS: &[&str] = &[
        "APP_PORT",
        "LOG_LEVEL",
        "DB_DSN",
        "DB_CONNECT_TIMEOUT",
        "DB_OPERATION_RETRIES",
        "DB_RECONNECT_DELAY",
        "DB_MAX_RECONNECT_DELAY",
        "TRACKER_BASE_URL",
        "TRACKER_API_KEY",
        "TRACKER_WEBHOOK_SECRET",
        "TRACKER_PROCESS_AFTER",
        "MAILBOX_BASE_URL",
        "MAILBOX_API_KEY",
        "MAILBOX_WEBHOOK_SECRET",
        "MAILBOX_PROCESS_AFTER",
        "DOCS_BASE_URL",
        "DOCS_WEBHOOK_SECRET",
        "DOCS_POLL_INTERVAL",
        "MAX_QUEUE_ATTEMPTS",
        "BACKFILL_OVERLAP_SECONDS",
        "PERIODIC_BACKFILL_INTERVAL",
        "DISABLE_WEBHOOKS",
        "TIMEZONE",
        "WEBHOOK_PUBLIC_URL",
    ];

    fn clear_env() {
        for key in ALL_KEYS {
            std::env::remove_var(key);
        }
    }

    fn set_required() {
        std::env::set_var("DB_DSN", "postgres://inflow@localhost/inflow");
        std::env::set_var("TRACKER_BASE_URL", "https://tracker.example.com");
        std::env::set_var("TRACKER_API_KEY", "tk");
        std::env::set_var("MAILBOX_BASE_URL", "https://mail.example.com/v1");
        std::env::set_var("MAILBOX_API_KEY", "mk");
    }

    #[test]
    fn minimal_environment_loads_with_defaults() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();
        set_required();

        let config = load_from_env().expect("config should load");

        assert_eq!(config.http.port, 8080);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.database.operation_retries, 3);
        assert_eq!(config.database.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.database.max_reconnect_delay, Duration::from_secs(30));
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.backfill.overlap, Duration::from_secs(120));
        assert_eq!(config.backfill.interval, Duration::from_secs(60));
        assert!(!config.backfill.disable_webhooks);
        assert!(config.docs.is_none());
        assert!(config.tracker.process_after.is_none());

        clear_env();
    }

    #[test]
    fn missing_required_keys_are_all_reported() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();

        let err = load_from_env().expect_err("must fail without required keys");
        let message = err.to_string();
        assert!(message.contains("DB_DSN is required"));
        assert!(message.contains("TRACKER_BASE_URL is required"));
        assert!(message.contains("MAILBOX_API_KEY is required"));
    }

    #[test]
    fn pure_polling_mode_shrinks_the_backfill_interval() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();
        set_required();
        std::env::set_var("DISABLE_WEBHOOKS", "true");

        let config = load_from_env().expect("config should load");
        assert!(config.backfill.disable_webhooks);
        assert_eq!(config.backfill.interval, Duration::from_secs(5));

        clear_env();
    }

    #[test]
    fn process_after_is_local_midnight_in_the_configured_zone() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();
        set_required();
        std::env::set_var("TIMEZONE", "Europe/Berlin");
        std::env::set_var("TRACKER_PROCESS_AFTER", "15.01.2024");

        let config = load_from_env().expect("config should load");
        let instant = config.tracker.process_after.expect("process_after should be set");
        // Berlin midnight in January is 23:00 UTC the previous day
        assert_eq!(instant.to_rfc3339(), "2024-01-14T23:00:00+00:00");

        clear_env();
    }

    #[test]
    fn malformed_process_after_is_a_config_error() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();
        set_required();
        std::env::set_var("TRACKER_PROCESS_AFTER", "2024-01-15");

        let err = load_from_env().expect_err("must reject ISO dates here");
        assert!(err.to_string().contains("TRACKER_PROCESS_AFTER"));

        clear_env();
    }

    #[test]
    fn docs_source_is_enabled_by_its_base_url() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();
        set_required();
        std::env::set_var("DOCS_BASE_URL", "https://docs.example.com/links/abc/api/v1");
        std::env::set_var("DOCS_POLL_INTERVAL", "120");

        let config = load_from_env().expect("config should load");
        let docs = config.docs.expect("docs config should be present");
        assert_eq!(docs.base_url, "https://docs.example.com/links/abc/api/v1");
        assert_eq!(config.backfill.doc_poll_interval, Duration::from_secs(120));

        clear_env();
    }

    #[test]
    fn invalid_numbers_are_collected_as_errors() {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        clear_env();
        set_required();
        std::env::set_var("APP_PORT", "not-a-port");
        std::env::set_var("MAX_QUEUE_ATTEMPTS", "many");

        let err = load_from_env().expect_err("must reject invalid numbers");
        let message = err.to_string();
        assert!(message.contains("APP_PORT"));
        assert!(message.contains("MAX_QUEUE_ATTEMPTS"));

        clear_env();
    }
}
