use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::ledger::CommitmentLevel;
use crate::sync::{FinalityConfig, ReconcileConfig, SubscriberConfig};

const DEFAULT_RPC_URL: &str = "https://api.devnet.solana.com";
const DEFAULT_PROGRAM_ID: &str = "kCBLrJxrFgB7yf8R8tMKZmsyaRDRq8YmdJSG9yjrSNe";
const DEFAULT_DATA_DIR: &str = "mirror-data";

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("Invalid value {value:?} for {key}: {reason}")]
	InvalidValue {
		key: &'static str,
		value: String,
		reason: String,
	},

	#[error("Cannot derive a websocket URL from {0}, set WS_URL")]
	UnderivableWsUrl(String),
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
	pub rpc_url: String,
	pub ws_url: String,
	pub program_id: String,
	pub commitment: CommitmentLevel,
	pub data_dir: PathBuf,
	pub reconcile_interval: Duration,
	pub rpc_timeout: Duration,
	pub subscriber: SubscriberConfig,
	pub finality: FinalityConfig,
	pub reconcile: ReconcileConfig,
}

impl AppConfig {
	/// Load from the process environment, honouring a `.env` file when present.
	pub fn from_env() -> Result<Self, ConfigError> {
		dotenvy::dotenv().ok();
		Self::from_lookup(|key| env::var(key).ok())
	}

	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let rpc_url = lookup("RPC_URL").unwrap_or_else(|| DEFAULT_RPC_URL.to_string());
		let ws_url = match lookup("WS_URL") {
			Some(url) => url,
			None => derive_ws_url(&rpc_url)?,
		};

		let rpc_timeout = Duration::from_secs(parse_nonzero_or(&lookup, "RPC_TIMEOUT_SECS", 30)?);
		let subscriber_defaults = SubscriberConfig::default();
		let finality_defaults = FinalityConfig::default();
		let reconcile_defaults = ReconcileConfig::default();

		Ok(Self {
			rpc_url,
			ws_url,
			program_id: lookup("PROGRAM_ID").unwrap_or_else(|| DEFAULT_PROGRAM_ID.to_string()),
			commitment: parse_or(&lookup, "COMMITMENT", CommitmentLevel::Confirmed)?,
			data_dir: lookup("MIRROR_DATA_DIR")
				.map(PathBuf::from)
				.unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
			reconcile_interval: Duration::from_secs(parse_nonzero_or(
				&lookup,
				"RECONCILE_INTERVAL_SECS",
				300,
			)?),
			rpc_timeout,
			subscriber: SubscriberConfig {
				max_reconnect_attempts: parse_or(
					&lookup,
					"MAX_RECONNECT_ATTEMPTS",
					subscriber_defaults.max_reconnect_attempts,
				)?,
				reconnect_base_delay: Duration::from_millis(parse_or(
					&lookup,
					"RECONNECT_BASE_DELAY_MS",
					subscriber_defaults.reconnect_base_delay.as_millis() as u64,
				)?),
				open_timeout: rpc_timeout,
			},
			finality: FinalityConfig {
				check_delay: Duration::from_secs(parse_or(
					&lookup,
					"FINALITY_CHECK_DELAY_SECS",
					finality_defaults.check_delay.as_secs(),
				)?),
				max_concurrent_checks: parse_or(
					&lookup,
					"MAX_CONCURRENT_FINALITY_CHECKS",
					finality_defaults.max_concurrent_checks,
				)?,
			},
			reconcile: ReconcileConfig {
				concurrency: parse_or(
					&lookup,
					"RECONCILE_CONCURRENCY",
					reconcile_defaults.concurrency,
				)?,
			},
		})
	}
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
	F: Fn(&str) -> Option<String>,
	T: FromStr,
	T::Err: Display,
{
	match lookup(key) {
		None => Ok(default),
		Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
			key,
			reason: e.to_string(),
			value,
		}),
	}
}

/// Like `parse_or`, for periods where zero would stall or panic a timer.
fn parse_nonzero_or<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
	F: Fn(&str) -> Option<String>,
{
	let value = parse_or(lookup, key, default)?;
	if value == 0 {
		return Err(ConfigError::InvalidValue {
			key,
			value: value.to_string(),
			reason: "must be greater than zero".to_string(),
		});
	}
	Ok(value)
}

/// Websocket endpoint served next to a JSON-RPC endpoint.
fn derive_ws_url(rpc_url: &str) -> Result<String, ConfigError> {
	if let Some(rest) = rpc_url.strip_prefix("https://") {
		Ok(format!("wss://{}", rest))
	} else if let Some(rest) = rpc_url.strip_prefix("http://") {
		Ok(format!("ws://{}", rest))
	} else {
		Err(ConfigError::UnderivableWsUrl(rpc_url.to_string()))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;

	fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
		let vars: HashMap<String, String> = vars
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect();
		AppConfig::from_lookup(|key| vars.get(key).cloned())
	}

	#[test]
	fn defaults_apply_when_unset() {
		let config = load(&[]).unwrap();
		assert_eq!(config.rpc_url, DEFAULT_RPC_URL);
		assert_eq!(config.ws_url, "wss://api.devnet.solana.com");
		assert_eq!(config.commitment, CommitmentLevel::Confirmed);
		assert_eq!(config.reconcile_interval, Duration::from_secs(300));
		assert_eq!(config.subscriber.max_reconnect_attempts, 10);
		assert_eq!(config.subscriber.reconnect_base_delay, Duration::from_secs(5));
		assert_eq!(config.subscriber.open_timeout, Duration::from_secs(30));
		assert_eq!(config.finality.check_delay, Duration::from_secs(35));
		assert_eq!(config.reconcile.concurrency, 4);
	}

	#[test]
	fn overrides_are_parsed() {
		let config = load(&[
			("RPC_URL", "http://127.0.0.1:8899"),
			("COMMITMENT", "Finalized"),
			("RECONNECT_BASE_DELAY_MS", "250"),
			("MAX_CONCURRENT_FINALITY_CHECKS", "2"),
		])
		.unwrap();
		assert_eq!(config.ws_url, "ws://127.0.0.1:8899");
		assert_eq!(config.commitment, CommitmentLevel::Finalized);
		assert_eq!(config.subscriber.reconnect_base_delay, Duration::from_millis(250));
		assert_eq!(config.finality.max_concurrent_checks, 2);
	}

	#[test]
	fn explicit_ws_url_wins() {
		let config = load(&[
			("RPC_URL", "localhost:8899"),
			("WS_URL", "ws://localhost:8900"),
		])
		.unwrap();
		assert_eq!(config.ws_url, "ws://localhost:8900");
		assert!(matches!(
			load(&[("RPC_URL", "localhost:8899")]),
			Err(ConfigError::UnderivableWsUrl(_))
		));
	}

	#[test]
	fn malformed_number_is_rejected() {
		let err = load(&[("RECONCILE_INTERVAL_SECS", "soon")]).unwrap_err();
		assert!(matches!(
			err,
			ConfigError::InvalidValue {
				key: "RECONCILE_INTERVAL_SECS",
				..
			}
		));
	}

	#[test]
	fn zero_periods_are_rejected() {
		for key in ["RECONCILE_INTERVAL_SECS", "RPC_TIMEOUT_SECS"] {
			match load(&[(key, "0")]) {
				Err(ConfigError::InvalidValue { key: rejected, value, .. }) => {
					assert_eq!(rejected, key);
					assert_eq!(value, "0");
				}
				other => panic!("expected {} = 0 to be rejected, got {:?}", key, other),
			}
		}
		assert!(load(&[("RECONCILE_INTERVAL_SECS", "1")]).is_ok());
	}
}
