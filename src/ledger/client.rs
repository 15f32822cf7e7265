//!
//! JSON-RPC client for the Solana ledger with log subscription management.
//!
//! This module provides an async client for the ledger endpoints the sync core consumes:
//! `logsSubscribe`/`logsUnsubscribe` over websocket, and `getSignatureStatuses` and
//! `getAccountInfo` over HTTP. All methods are async and designed for use with Tokio.

use super::codec::decode_account;
use super::types::*;
use crate::store::{EntityType, WatchedFields};

use backoff::{ExponentialBackoff, future::retry};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Buffered log batches per subscription before the pump applies backpressure.
const LOG_CHANNEL_CAPACITY: usize = 1024;

/// Solana JSON-RPC client
#[derive(Clone)]
pub struct SolanaRpcClient {
	/// The underlying HTTP client for RPC calls.
	http_client: Client,
	/// The HTTP JSON-RPC endpoint.
	rpc_url: String,
	/// The websocket endpoint for subscriptions.
	ws_url: String,
	/// Commitment used when reading account state.
	commitment: CommitmentLevel,
	request_id: Arc<AtomicU64>,
	/// Shutdown handles of the running subscription pumps.
	subscriptions: Arc<Mutex<HashMap<SubscriptionId, oneshot::Sender<()>>>>,
}

impl SolanaRpcClient {
	/// Create a new ledger client.
	///
	/// # Arguments
	/// * `rpc_url` - The HTTP endpoint for JSON-RPC calls.
	/// * `ws_url` - The websocket endpoint for subscriptions.
	/// * `timeout` - Per-request HTTP timeout.
	pub fn new(rpc_url: String, ws_url: String, timeout: Duration) -> Result<Self, LedgerError> {
		let http_client = Client::builder().timeout(timeout).build()?;

		Ok(Self {
			http_client,
			rpc_url,
			ws_url,
			commitment: CommitmentLevel::Confirmed,
			request_id: Arc::new(AtomicU64::new(1)),
			subscriptions: Arc::new(Mutex::new(HashMap::new())),
		})
	}

	/// Use `commitment` when reading account state.
	pub fn with_commitment(mut self, commitment: CommitmentLevel) -> Self {
		self.commitment = commitment;
		self
	}

	fn next_request_id(&self) -> u64 {
		self.request_id.fetch_add(1, Ordering::Relaxed)
	}

	/// Execute a JSON-RPC call and return its `result` member.
	///
	/// Transport failures, 429s and 5xx responses are retried with exponential backoff.
	/// RPC-level errors are returned as-is.
	pub async fn execute_rpc(
		&self,
		method: &str,
		params: serde_json::Value,
	) -> Result<serde_json::Value, LedgerError> {
		let request_body = json!({
			"jsonrpc": "2.0",
			"id": self.next_request_id(),
			"method": method,
			"params": params,
		});

		let policy = ExponentialBackoff {
			max_elapsed_time: Some(Duration::from_secs(30)),
			..ExponentialBackoff::default()
		};

		let response_json = retry(policy, || async {
			let response = self
				.http_client
				.post(&self.rpc_url)
				.json(&request_body)
				.send()
				.await
				.map_err(|e| {
					debug!("RPC {} send error: {}", method, e);
					backoff::Error::transient(LedgerError::from(e))
				})?;

			let status = response.status();
			if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
				return Err(backoff::Error::transient(LedgerError::RpcError(format!(
					"HTTP error: {}",
					status
				))));
			}
			if !status.is_success() {
				return Err(backoff::Error::permanent(LedgerError::RpcError(format!(
					"HTTP error: {}",
					status
				))));
			}

			response
				.json::<serde_json::Value>()
				.await
				.map_err(|e| backoff::Error::permanent(LedgerError::from(e)))
		})
		.await?;

		if let Some(error) = response_json.get("error") {
			return Err(LedgerError::RpcError(format!("{} failed: {}", method, error)));
		}

		response_json
			.get("result")
			.cloned()
			.ok_or(LedgerError::NoData)
	}
}

#[async_trait::async_trait]
impl LedgerClient for SolanaRpcClient {
	async fn subscribe_logs(
		&self,
		program_id: &str,
		commitment: CommitmentLevel,
	) -> Result<LogSubscription, LedgerError> {
		debug!("Attempting WebSocket connection to: {}", self.ws_url);

		let (ws_stream, response) = connect_async(self.ws_url.as_str()).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);
		let (mut ws_sender, mut ws_receiver) = ws_stream.split();

		let request_id = self.next_request_id();
		let subscribe_message = json!({
			"jsonrpc": "2.0",
			"id": request_id,
			"method": "logsSubscribe",
			"params": [
				{ "mentions": [program_id] },
				{ "commitment": commitment.as_str() }
			]
		});
		ws_sender
			.send(Message::Text(subscribe_message.to_string()))
			.await?;

		// Wait for the subscription id
		let subscription_id = loop {
			let Some(msg) = ws_receiver.next().await else {
				return Err(LedgerError::SubscriptionError(
					"Connection closed before subscription was confirmed".to_string(),
				));
			};
			let Message::Text(text) = msg? else {
				continue;
			};
			let parsed: serde_json::Value = serde_json::from_str(&text)?;
			if let Some(error) = parsed.get("error") {
				return Err(LedgerError::SubscriptionError(error.to_string()));
			}
			if parsed.get("id").and_then(|id| id.as_u64()) == Some(request_id) {
				break parsed
					.get("result")
					.and_then(|result| result.as_u64())
					.ok_or(LedgerError::NoData)?;
			}
		};

		let (batch_tx, batch_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
		let (shutdown_tx, shutdown_rx) = oneshot::channel();
		self.subscriptions
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.insert(subscription_id, shutdown_tx);

		tokio::spawn(pump_logs(
			subscription_id,
			ws_sender,
			ws_receiver,
			batch_tx,
			shutdown_rx,
			self.subscriptions.clone(),
		));

		info!(
			"Subscribed to logs of program {} with subscription ID: {}",
			program_id, subscription_id
		);
		Ok(LogSubscription {
			id: subscription_id,
			batches: batch_rx,
		})
	}

	async fn unsubscribe(&self, subscription_id: SubscriptionId) -> Result<(), LedgerError> {
		let shutdown = self
			.subscriptions
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&subscription_id);

		match shutdown {
			Some(shutdown) => {
				// The pump may already be gone
				let _ = shutdown.send(());
				debug!("Released log subscription {}", subscription_id);
			}
			None => debug!("Log subscription {} already released", subscription_id),
		}
		Ok(())
	}

	async fn get_signature_status(
		&self,
		signature: &str,
	) -> Result<Option<CommitmentLevel>, LedgerError> {
		let result = self
			.execute_rpc(
				"getSignatureStatuses",
				json!([[signature], { "searchTransactionHistory": true }]),
			)
			.await?;

		let entry = result
			.get("value")
			.and_then(|value| value.get(0))
			.cloned()
			.ok_or(LedgerError::NoData)?;

		if entry.is_null() {
			return Ok(None);
		}

		let status: RpcSignatureStatus = serde_json::from_value(entry)?;
		// Nodes that omit confirmationStatus only report processed transactions
		Ok(Some(
			status
				.confirmation_status
				.unwrap_or(CommitmentLevel::Processed),
		))
	}

	async fn fetch_account(
		&self,
		address: &str,
		entity_type: EntityType,
	) -> Result<WatchedFields, LedgerError> {
		let result = self
			.execute_rpc(
				"getAccountInfo",
				json!([address, { "encoding": "base64", "commitment": self.commitment.as_str() }]),
			)
			.await?;

		let value = result.get("value").ok_or(LedgerError::NoData)?;
		if value.is_null() {
			return Err(LedgerError::AccountNotFound(address.to_string()));
		}

		let encoded = value
			.get("data")
			.and_then(|data| data.get(0))
			.and_then(|data| data.as_str())
			.ok_or(LedgerError::NoData)?;
		let data = BASE64.decode(encoded).map_err(|e| {
			LedgerError::RpcError(format!("Invalid base64 account data for {}: {}", address, e))
		})?;

		Ok(decode_account(entity_type, &data)?)
	}
}

/// Forward `logsNotification` messages until shutdown or until the socket drops.
async fn pump_logs(
	subscription_id: SubscriptionId,
	mut ws_sender: SplitSink<WsStream, Message>,
	mut ws_receiver: SplitStream<WsStream>,
	batch_tx: mpsc::Sender<Result<LogBatch, LedgerError>>,
	mut shutdown_rx: oneshot::Receiver<()>,
	subscriptions: Arc<Mutex<HashMap<SubscriptionId, oneshot::Sender<()>>>>,
) {
	loop {
		tokio::select! {
			_ = &mut shutdown_rx => {
				let unsubscribe_message = json!({
					"jsonrpc": "2.0",
					"id": 0,
					"method": "logsUnsubscribe",
					"params": [subscription_id]
				});
				if let Err(e) = ws_sender
					.send(Message::Text(unsubscribe_message.to_string()))
					.await
				{
					debug!("Failed to send logsUnsubscribe for {}: {}", subscription_id, e);
				}
				let _ = ws_sender.close().await;
				break;
			}
			msg = ws_receiver.next() => {
				match msg {
					Some(Ok(Message::Text(text))) => match parse_logs_notification(&text) {
						Ok(Some(batch)) => {
							if batch_tx.send(Ok(batch)).await.is_err() {
								debug!("Log subscription {} has no consumer, closing", subscription_id);
								break;
							}
						}
						Ok(None) => debug!("Ignoring non-notification message"),
						Err(e) => warn!("Malformed logs notification on {}: {}", subscription_id, e),
					},
					Some(Ok(Message::Close(frame))) => {
						let _ = batch_tx
							.send(Err(LedgerError::SubscriptionError(format!(
								"Connection closed by server: {:?}",
								frame
							))))
							.await;
						break;
					}
					Some(Ok(_)) => {}
					Some(Err(e)) => {
						let _ = batch_tx.send(Err(LedgerError::WebSocketError(e))).await;
						break;
					}
					None => {
						let _ = batch_tx
							.send(Err(LedgerError::SubscriptionError(
								"Log stream ended".to_string(),
							)))
							.await;
						break;
					}
				}
			}
		}
	}

	subscriptions
		.lock()
		.unwrap_or_else(PoisonError::into_inner)
		.remove(&subscription_id);
}

fn parse_logs_notification(text: &str) -> Result<Option<LogBatch>, LedgerError> {
	let parsed: serde_json::Value = serde_json::from_str(text)?;
	if parsed.get("method").and_then(|m| m.as_str()) != Some("logsNotification") {
		return Ok(None);
	}

	let result = parsed
		.get("params")
		.and_then(|params| params.get("result"))
		.cloned()
		.ok_or(LedgerError::NoData)?;
	let result: RpcLogsResult = serde_json::from_value(result)?;
	Ok(Some(result.into()))
}
