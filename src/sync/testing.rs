//! In-crate fake of the ledger collaborator used by the sync tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::ledger::codec::{CouponMinted, Pubkey};
use crate::ledger::{
	CommitmentLevel, LedgerClient, LedgerError, LogBatch, LogSubscription, ProgramEvent,
	SubscriptionId,
};
use crate::store::{EntityType, WatchedFields};

type Feed = mpsc::Sender<Result<LogBatch, LedgerError>>;

#[derive(Default)]
pub struct FakeLedger {
	statuses: Mutex<HashMap<String, CommitmentLevel>>,
	unavailable_statuses: Mutex<HashSet<String>>,
	status_delay: Mutex<Duration>,
	accounts: Mutex<HashMap<String, WatchedFields>>,
	unreachable_accounts: Mutex<HashSet<String>>,
	subscribe_failures: AtomicUsize,
	hang_subscriptions: AtomicBool,
	feeds: Mutex<Vec<Feed>>,
	subscribe_calls: Mutex<Vec<Instant>>,
	unsubscribed: Mutex<Vec<SubscriptionId>>,
	pub status_calls: AtomicUsize,
	pub fetch_calls: AtomicUsize,
}

impl FakeLedger {
	pub fn set_status(&self, signature: &str, level: CommitmentLevel) {
		self.statuses.lock().unwrap().insert(signature.to_string(), level);
	}

	pub fn fail_status(&self, signature: &str) {
		self.unavailable_statuses
			.lock()
			.unwrap()
			.insert(signature.to_string());
	}

	/// Every status query takes `delay` to answer.
	pub fn delay_status(&self, delay: Duration) {
		*self.status_delay.lock().unwrap() = delay;
	}

	pub fn set_account(&self, address: &str, fields: WatchedFields) {
		self.accounts.lock().unwrap().insert(address.to_string(), fields);
	}

	pub fn remove_account(&self, address: &str) {
		self.accounts.lock().unwrap().remove(address);
	}

	pub fn fail_account(&self, address: &str) {
		self.unreachable_accounts
			.lock()
			.unwrap()
			.insert(address.to_string());
	}

	/// The next `count` subscription attempts fail.
	pub fn fail_subscriptions(&self, count: usize) {
		self.subscribe_failures.store(count, Ordering::SeqCst);
	}

	/// Subscription attempts never get confirmed while set.
	pub fn hang_subscriptions(&self, hang: bool) {
		self.hang_subscriptions.store(hang, Ordering::SeqCst);
	}

	pub fn subscribe_calls(&self) -> Vec<Instant> {
		self.subscribe_calls.lock().unwrap().clone()
	}

	pub fn unsubscribed(&self) -> Vec<SubscriptionId> {
		self.unsubscribed.lock().unwrap().clone()
	}

	/// Sender side of the `n`th successfully opened subscription.
	pub fn feed(&self, n: usize) -> Feed {
		self.feeds.lock().unwrap()[n].clone()
	}

	/// Drop every open feed, as a websocket disconnect would.
	pub fn drop_feeds(&self) {
		self.feeds.lock().unwrap().clear();
	}
}

#[async_trait::async_trait]
impl LedgerClient for FakeLedger {
	async fn subscribe_logs(
		&self,
		_program_id: &str,
		_commitment: CommitmentLevel,
	) -> Result<LogSubscription, LedgerError> {
		self.subscribe_calls.lock().unwrap().push(Instant::now());
		if self.hang_subscriptions.load(Ordering::SeqCst) {
			std::future::pending::<()>().await;
		}

		let remaining = self.subscribe_failures.load(Ordering::SeqCst);
		if remaining > 0 {
			self.subscribe_failures.store(remaining - 1, Ordering::SeqCst);
			return Err(LedgerError::SubscriptionError("connection refused".to_string()));
		}

		let (tx, rx) = mpsc::channel(64);
		let mut feeds = self.feeds.lock().unwrap();
		feeds.push(tx);
		Ok(LogSubscription {
			id: feeds.len() as SubscriptionId,
			batches: rx,
		})
	}

	async fn unsubscribe(&self, subscription_id: SubscriptionId) -> Result<(), LedgerError> {
		self.unsubscribed.lock().unwrap().push(subscription_id);
		Ok(())
	}

	async fn get_signature_status(
		&self,
		signature: &str,
	) -> Result<Option<CommitmentLevel>, LedgerError> {
		self.status_calls.fetch_add(1, Ordering::SeqCst);
		let delay = *self.status_delay.lock().unwrap();
		if !delay.is_zero() {
			tokio::time::sleep(delay).await;
		}
		if self.unavailable_statuses.lock().unwrap().contains(signature) {
			return Err(LedgerError::RpcError("node is behind".to_string()));
		}
		Ok(self.statuses.lock().unwrap().get(signature).copied())
	}

	async fn fetch_account(
		&self,
		address: &str,
		_entity_type: EntityType,
	) -> Result<WatchedFields, LedgerError> {
		self.fetch_calls.fetch_add(1, Ordering::SeqCst);
		if self.unreachable_accounts.lock().unwrap().contains(address) {
			return Err(LedgerError::RpcError("timeout".to_string()));
		}
		self.accounts
			.lock()
			.unwrap()
			.get(address)
			.cloned()
			.ok_or_else(|| LedgerError::AccountNotFound(address.to_string()))
	}
}

pub fn coupon_minted(coupon_id: u64) -> ProgramEvent {
	ProgramEvent::CouponMinted(CouponMinted {
		coupon: Pubkey([coupon_id as u8; 32]),
		promotion: Pubkey([7; 32]),
		owner: Pubkey([9; 32]),
		coupon_id,
	})
}

/// Let spawned tasks run until the runtime is idle.
pub async fn flush() {
	tokio::time::sleep(Duration::from_millis(1)).await;
}
