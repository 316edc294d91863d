//! Runtime configuration loaded from environment variables.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;
use thiserror::Error;

use crate::models::MatterStatus;
use crate::notifier::{RecipientRole, StatusRoutes};
use crate::scheduler::CalendarZone;
use crate::urgency::{Thresholds, MAX_URGENT_WINDOW_DAYS};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}={value:?} is invalid: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Service configuration.
///
/// | Variable | Default |
/// |---|---|
/// | `DOCKET_DB_PATH` | platform data dir |
/// | `DOCKET_URGENT_WINDOW_DAYS` | `14` |
/// | `DOCKET_SCHEDULE_AT` | `08:00` |
/// | `DOCKET_TIMEZONE` | `local` (host time zone) or an IANA name |
/// | `DOCKET_IO_TIMEOUT_SECS` | `30` |
/// | `DOCKET_LOCK_TTL_SECS` | `3600` |
/// | `DOCKET_WEBHOOK_URL` | unset: notifications go to the log |
/// | `DOCKET_STATUS_ROUTES` | see [`StatusRoutes::default`] |
/// | `DOCKET_LOG_FILE` | unset: stdout |
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub db_path: Option<PathBuf>,
    pub thresholds: Thresholds,
    /// Wall-clock time of the daily urgent-task run, in `zone`.
    pub schedule_at: NaiveTime,
    /// Calendar for the daily trigger and for "once per day" keys.
    pub zone: CalendarZone,
    /// Upper bound for a single store load or dispatch.
    pub io_timeout: Duration,
    /// How long a run-lock lease lives before another run may reclaim it.
    pub lock_ttl: Duration,
    pub webhook_url: Option<String>,
    pub status_routes: StatusRoutes,
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            thresholds: Thresholds::default(),
            schedule_at: NaiveTime::from_hms_opt(8, 0, 0).unwrap_or(NaiveTime::MIN),
            zone: CalendarZone::Local,
            io_timeout: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(3600),
            webhook_url: None,
            status_routes: StatusRoutes::default(),
            log_file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unset and empty keys
    /// keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(path) = get("DOCKET_DB_PATH") {
            config.db_path = Some(PathBuf::from(path));
        }

        if let Some(raw) = get("DOCKET_URGENT_WINDOW_DAYS") {
            let days = parse_positive("DOCKET_URGENT_WINDOW_DAYS", &raw)?;
            if days > MAX_URGENT_WINDOW_DAYS as u64 {
                return Err(ConfigError::Invalid {
                    key: "DOCKET_URGENT_WINDOW_DAYS",
                    value: raw,
                    reason: format!("must be at most {MAX_URGENT_WINDOW_DAYS}"),
                });
            }
            config.thresholds = Thresholds::with_urgent_days(days as i64);
        }

        if let Some(raw) = get("DOCKET_SCHEDULE_AT") {
            config.schedule_at = NaiveTime::parse_from_str(raw.trim(), "%H:%M").map_err(|e| {
                ConfigError::Invalid {
                    key: "DOCKET_SCHEDULE_AT",
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        if let Some(raw) = get("DOCKET_TIMEZONE") {
            config.zone = CalendarZone::parse(&raw).map_err(|reason| ConfigError::Invalid {
                key: "DOCKET_TIMEZONE",
                value: raw.clone(),
                reason,
            })?;
        }

        if let Some(raw) = get("DOCKET_IO_TIMEOUT_SECS") {
            config.io_timeout = Duration::from_secs(parse_positive("DOCKET_IO_TIMEOUT_SECS", &raw)?);
        }

        if let Some(raw) = get("DOCKET_LOCK_TTL_SECS") {
            config.lock_ttl = Duration::from_secs(parse_positive("DOCKET_LOCK_TTL_SECS", &raw)?);
        }

        config.webhook_url = get("DOCKET_WEBHOOK_URL");

        if let Some(raw) = get("DOCKET_STATUS_ROUTES") {
            config.status_routes = parse_routes(&raw)?;
        }

        config.log_file = get("DOCKET_LOG_FILE").map(PathBuf::from);

        Ok(config)
    }
}

fn parse_positive(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    match raw.trim().parse::<u64>() {
        Ok(n) if n > 0 => Ok(n),
        Ok(_) => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: "must be greater than zero".to_string(),
        }),
        Err(e) => Err(ConfigError::Invalid {
            key,
            value: raw.to_string(),
            reason: e.to_string(),
        }),
    }
}

/// Parse `status=role` pairs, e.g. `granted=client,dead=responsible,filed=none`.
/// Statuses not listed are not notified.
fn parse_routes(raw: &str) -> Result<StatusRoutes, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        key: "DOCKET_STATUS_ROUTES",
        value: raw.to_string(),
        reason,
    };

    let mut routes = StatusRoutes::empty();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (status, role) = pair
            .split_once('=')
            .ok_or_else(|| invalid(format!("expected status=role, got '{pair}'")))?;
        let status = MatterStatus::from_str(status.trim())
            .ok_or_else(|| invalid(format!("unknown status '{}'", status.trim())))?;
        let role = RecipientRole::from_str(role.trim())
            .ok_or_else(|| invalid(format!("unknown recipient role '{}'", role.trim())))?;
        routes.set(status, role);
    }
    Ok(routes)
}
