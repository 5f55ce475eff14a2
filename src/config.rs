use std::env;
use std::time::Duration;

use crate::engine::scoring::RankingKind;
use crate::error::AppError;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub dispatch: DispatchSettings,
}

/// Knobs the matching engine and event gateway read at runtime.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub offer_ttl: Duration,
    pub fan_out: usize,
    pub ranking: RankingKind,
    pub sweep_interval: Duration,
    pub directory_retry: RetryPolicy,
    pub broker_retry: RetryPolicy,
    pub max_redeliveries: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            offer_ttl: Duration::from_secs(60),
            fan_out: 5,
            ranking: RankingKind::Distance,
            sweep_interval: Duration::from_secs(30),
            directory_retry: RetryPolicy::default(),
            broker_retry: RetryPolicy::new(5, Duration::from_millis(200), Duration::from_secs(5)),
            max_redeliveries: 5,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            Ok("compact") | Err(_) => LogFormat::Compact,
            Ok(other) => {
                return Err(AppError::Internal(format!(
                    "invalid LOG_FORMAT: {other}, expected compact or json"
                )));
            }
        };

        let fan_out: usize = parse_or_default("CANDIDATE_FAN_OUT", 5)?;
        if fan_out == 0 {
            return Err(AppError::Internal(
                "invalid CANDIDATE_FAN_OUT: must be > 0".to_string(),
            ));
        }

        let dispatch = DispatchSettings {
            offer_ttl: Duration::from_secs(parse_or_default("OFFER_TTL_SECS", 60)?),
            fan_out,
            ranking: parse_or_default("RANKING_STRATEGY", RankingKind::Distance)?,
            sweep_interval: Duration::from_secs(parse_or_default("SWEEP_INTERVAL_SECS", 30)?),
            directory_retry: RetryPolicy {
                max_retries: parse_or_default("DIRECTORY_MAX_RETRIES", 3)?,
                ..RetryPolicy::default()
            },
            broker_retry: RetryPolicy::new(
                parse_or_default("BROKER_MAX_RETRIES", 5)?,
                Duration::from_millis(parse_or_default("BROKER_INITIAL_BACKOFF_MS", 200)?),
                Duration::from_millis(parse_or_default("BROKER_MAX_BACKOFF_MS", 5000)?),
            ),
            max_redeliveries: parse_or_default("MAX_REDELIVERIES", 5)?,
        };

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            dispatch,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
