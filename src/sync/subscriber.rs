use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::events::{LivenessFlag, Notification, NotificationBus};
use super::parser::EventDispatcher;
use super::types::SyncError;
use crate::ledger::{CommitmentLevel, LedgerClient, LedgerError, LogSubscription, SubscriptionId};

/// Configuration for the log subscription
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
	/// Consecutive failed (re)connections tolerated before giving up
	pub max_reconnect_attempts: u32,
	/// Attempt `k` waits `reconnect_base_delay * k`
	pub reconnect_base_delay: Duration,
	/// Limit on connecting and awaiting the subscription confirmation
	pub open_timeout: Duration,
}

impl Default for SubscriberConfig {
	fn default() -> Self {
		Self {
			max_reconnect_attempts: 10,
			reconnect_base_delay: Duration::from_secs(5),
			open_timeout: Duration::from_secs(30),
		}
	}
}

/// Snapshot returned by [`EventSubscriber::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberStatus {
	pub is_listening: bool,
	pub reconnect_attempts: u32,
}

#[derive(Debug, Default)]
struct SubscriptionState {
	subscription_id: Option<SubscriptionId>,
	is_listening: bool,
	attempts: u32,
}

impl SubscriptionState {
	/// Count one more reconnect attempt, or `None` once the budget is spent.
	fn next_reconnect_delay(&mut self, config: &SubscriberConfig) -> Option<Duration> {
		if self.attempts >= config.max_reconnect_attempts {
			return None;
		}
		self.attempts += 1;
		Some(config.reconnect_base_delay * self.attempts)
	}
}

struct Inner {
	ledger: Arc<dyn LedgerClient>,
	dispatcher: EventDispatcher,
	bus: NotificationBus,
	liveness: LivenessFlag,
	program_id: String,
	commitment: CommitmentLevel,
	config: SubscriberConfig,
	state: Mutex<SubscriptionState>,
	supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Keeps one log subscription open for the watched program and feeds it to the dispatcher.
///
/// A dropped or refused subscription is retried with a linearly growing delay. After
/// `max_reconnect_attempts` consecutive failures the subscriber emits
/// [`Notification::MaxReconnectAttemptsReached`] and waits for an explicit `start()`.
#[derive(Clone)]
pub struct EventSubscriber {
	inner: Arc<Inner>,
}

impl EventSubscriber {
	pub fn new(
		ledger: Arc<dyn LedgerClient>,
		dispatcher: EventDispatcher,
		bus: NotificationBus,
		liveness: LivenessFlag,
		program_id: impl Into<String>,
		commitment: CommitmentLevel,
		config: SubscriberConfig,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				ledger,
				dispatcher,
				bus,
				liveness,
				program_id: program_id.into(),
				commitment,
				config,
				state: Mutex::new(SubscriptionState::default()),
				supervisor: tokio::sync::Mutex::new(None),
			}),
		}
	}

	/// Open the subscription and keep it open.
	///
	/// Returns [`SyncError::AlreadyListening`] without touching the running subscription when
	/// called while already started.
	pub async fn start(&self) -> Result<(), SyncError> {
		let mut supervisor = self.inner.supervisor.lock().await;
		if supervisor.as_ref().is_some_and(|handle| !handle.is_finished()) {
			warn!("Event subscriber already started");
			return Err(SyncError::AlreadyListening);
		}

		*self.inner.state() = SubscriptionState::default();
		self.inner.liveness.activate();
		info!(
			"Starting event subscriber for program {} at {} commitment",
			self.inner.program_id,
			self.inner.commitment.as_str()
		);

		let opened = self.inner.open().await;
		*supervisor = Some(tokio::spawn(supervise(self.inner.clone(), opened)));
		Ok(())
	}

	/// Release the subscription. Safe to call any number of times.
	pub async fn stop(&self) {
		let handle = self.inner.supervisor.lock().await.take();
		if let Some(handle) = handle {
			handle.abort();
			let _ = handle.await;
		}
		self.inner.liveness.deactivate();

		let subscription_id = {
			let mut state = self.inner.state();
			state.is_listening = false;
			state.subscription_id.take()
		};
		if let Some(id) = subscription_id {
			if let Err(e) = self.inner.ledger.unsubscribe(id).await {
				warn!("Failed to release log subscription {}: {}", id, e);
			}
			info!("Event subscriber stopped");
		}
	}

	pub fn status(&self) -> SubscriberStatus {
		let state = self.inner.state();
		SubscriberStatus {
			is_listening: state.is_listening,
			reconnect_attempts: state.attempts,
		}
	}
}

impl Inner {
	fn state(&self) -> MutexGuard<'_, SubscriptionState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// One subscription attempt. Running out of `open_timeout` counts as a failure.
	async fn open(&self) -> Result<LogSubscription, LedgerError> {
		let subscription = tokio::time::timeout(
			self.config.open_timeout,
			self.ledger.subscribe_logs(&self.program_id, self.commitment),
		)
		.await
		.map_err(|_| {
			LedgerError::SubscriptionError(format!(
				"no subscription confirmation within {:?}",
				self.config.open_timeout
			))
		})??;

		let mut state = self.state();
		state.subscription_id = Some(subscription.id);
		state.is_listening = true;
		state.attempts = 0;
		info!(subscription_id = subscription.id, "Subscribed to program logs");
		Ok(subscription)
	}

	async fn consume(&self, mut subscription: LogSubscription) {
		while let Some(item) = subscription.batches.recv().await {
			match item {
				Ok(batch) if batch.is_failed() => {
					debug!(signature = %batch.signature, "Skipping failed transaction");
				}
				Ok(batch) => {
					self.dispatcher.dispatch(&batch);
				}
				Err(e) => {
					warn!("Log subscription dropped: {}", e);
					return;
				}
			}
		}
		warn!("Log subscription closed by the ledger");
	}

	async fn mark_disconnected(&self) {
		let subscription_id = {
			let mut state = self.state();
			state.is_listening = false;
			state.subscription_id.take()
		};
		if let Some(id) = subscription_id {
			if let Err(e) = self.ledger.unsubscribe(id).await {
				debug!("Could not release dropped subscription {}: {}", id, e);
			}
		}
	}
}

async fn supervise(inner: Arc<Inner>, mut opened: Result<LogSubscription, LedgerError>) {
	loop {
		match opened {
			Ok(subscription) => {
				inner.consume(subscription).await;
				inner.mark_disconnected().await;
			}
			Err(e) => warn!("Failed to subscribe to program logs: {}", e),
		}

		let (delay, attempts) = {
			let mut state = inner.state();
			(state.next_reconnect_delay(&inner.config), state.attempts)
		};
		let Some(delay) = delay else {
			error!(
				"Giving up after {} reconnect attempts, restart required",
				attempts
			);
			inner
				.bus
				.emit(Notification::MaxReconnectAttemptsReached { attempts });
			return;
		};

		info!(
			"Reconnecting in {:?} (attempt {}/{})",
			delay, attempts, inner.config.max_reconnect_attempts
		);
		tokio::time::sleep(delay).await;
		opened = inner.open().await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ledger::LogBatch;
	use crate::sync::events::{NotificationKind, Topic};
	use crate::sync::finality::{FinalityConfig, FinalityTracker};
	use crate::sync::parser::EventParser;
	use crate::sync::testing::{coupon_minted, flush, FakeLedger};
	use base64::engine::general_purpose::STANDARD;
	use base64::Engine;

	const PROGRAM: &str = "kCBLrJxrFgB7yf8R8tMKZmsyaRDRq8YmdJSG9yjrSNe";

	fn subscriber(
		ledger: Arc<FakeLedger>,
		config: SubscriberConfig,
	) -> (EventSubscriber, NotificationBus, LivenessFlag) {
		let bus = NotificationBus::new();
		let liveness = LivenessFlag::new();
		let tracker = FinalityTracker::spawn(
			ledger.clone(),
			bus.clone(),
			liveness.clone(),
			FinalityConfig::default(),
		);
		let dispatcher = EventDispatcher::new(EventParser::new(PROGRAM), bus.clone(), tracker);
		let subscriber = EventSubscriber::new(
			ledger,
			dispatcher,
			bus.clone(),
			liveness.clone(),
			PROGRAM,
			CommitmentLevel::Confirmed,
			config,
		);
		(subscriber, bus, liveness)
	}

	fn batch(signature: &str, err: Option<serde_json::Value>) -> LogBatch {
		let data = STANDARD.encode(coupon_minted(1).encode().unwrap());
		LogBatch {
			signature: signature.to_string(),
			slot: 10,
			logs: vec![
				format!("Program {} invoke [1]", PROGRAM),
				format!("Program data: {}", data),
				format!("Program {} success", PROGRAM),
			],
			err,
		}
	}

	#[test]
	fn reconnect_delay_grows_linearly_until_budget_is_spent() {
		let config = SubscriberConfig {
			max_reconnect_attempts: 3,
			reconnect_base_delay: Duration::from_millis(100),
			..SubscriberConfig::default()
		};
		let mut state = SubscriptionState::default();

		let delays: Vec<Option<Duration>> =
			(0..4).map(|_| state.next_reconnect_delay(&config)).collect();
		assert_eq!(
			delays,
			vec![
				Some(Duration::from_millis(100)),
				Some(Duration::from_millis(200)),
				Some(Duration::from_millis(300)),
				None,
			]
		);
		assert_eq!(state.attempts, 3);
	}

	#[tokio::test(start_paused = true)]
	async fn failed_connections_back_off_and_reset_on_success() {
		let ledger = Arc::new(FakeLedger::default());
		ledger.fail_subscriptions(3);
		let (subscriber, _bus, _liveness) = subscriber(ledger.clone(), SubscriberConfig::default());

		subscriber.start().await.unwrap();
		assert_eq!(
			subscriber.status(),
			SubscriberStatus {
				is_listening: false,
				reconnect_attempts: 0,
			}
		);

		tokio::time::sleep(Duration::from_secs(20)).await;
		assert_eq!(
			subscriber.status(),
			SubscriberStatus {
				is_listening: false,
				reconnect_attempts: 3,
			}
		);

		tokio::time::sleep(Duration::from_secs(20)).await;
		let calls = ledger.subscribe_calls();
		assert_eq!(calls.len(), 4);
		let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
		assert_eq!(
			gaps,
			vec![
				Duration::from_secs(5),
				Duration::from_secs(10),
				Duration::from_secs(15),
			]
		);
		assert_eq!(
			subscriber.status(),
			SubscriberStatus {
				is_listening: true,
				reconnect_attempts: 0,
			}
		);
	}

	#[tokio::test(start_paused = true)]
	async fn exhausted_attempts_emit_terminal_signal() {
		let ledger = Arc::new(FakeLedger::default());
		ledger.fail_subscriptions(usize::MAX);
		let config = SubscriberConfig {
			max_reconnect_attempts: 3,
			reconnect_base_delay: Duration::from_secs(1),
			..SubscriberConfig::default()
		};
		let (subscriber, bus, _liveness) = subscriber(ledger.clone(), config);
		let mut terminal = bus.subscribe(Topic::Kind(NotificationKind::MaxReconnectAttemptsReached));

		subscriber.start().await.unwrap();
		assert_eq!(
			terminal.recv().await,
			Some(Notification::MaxReconnectAttemptsReached { attempts: 3 })
		);

		tokio::time::sleep(Duration::from_secs(600)).await;
		assert_eq!(ledger.subscribe_calls().len(), 4);
		assert!(!subscriber.status().is_listening);

		// an explicit start begins a fresh cycle
		ledger.fail_subscriptions(0);
		subscriber.start().await.unwrap();
		assert!(subscriber.status().is_listening);
	}

	#[tokio::test(start_paused = true)]
	async fn unconfirmed_subscription_times_out_and_is_retried() {
		let ledger = Arc::new(FakeLedger::default());
		ledger.hang_subscriptions(true);
		let config = SubscriberConfig {
			open_timeout: Duration::from_secs(2),
			..SubscriberConfig::default()
		};
		let (subscriber, _bus, _liveness) = subscriber(ledger.clone(), config);

		let begun = tokio::time::Instant::now();
		subscriber.start().await.unwrap();
		let waited = begun.elapsed();
		assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
		assert!(!subscriber.status().is_listening);

		ledger.hang_subscriptions(false);
		tokio::time::sleep(Duration::from_secs(6)).await;
		assert_eq!(ledger.subscribe_calls().len(), 2);
		assert_eq!(
			subscriber.status(),
			SubscriberStatus {
				is_listening: true,
				reconnect_attempts: 0,
			}
		);
	}

	#[tokio::test(start_paused = true)]
	async fn stop_during_hanging_start_returns() {
		let ledger = Arc::new(FakeLedger::default());
		ledger.hang_subscriptions(true);
		let config = SubscriberConfig {
			open_timeout: Duration::from_secs(2),
			..SubscriberConfig::default()
		};
		let (subscriber, _bus, liveness) = subscriber(ledger.clone(), config);

		let starting = tokio::spawn({
			let subscriber = subscriber.clone();
			async move { subscriber.start().await }
		});
		flush().await;

		let begun = tokio::time::Instant::now();
		subscriber.stop().await;
		assert!(begun.elapsed() <= Duration::from_secs(2));
		starting.await.unwrap().unwrap();
		assert!(!liveness.is_live());

		tokio::time::sleep(Duration::from_secs(120)).await;
		assert_eq!(ledger.subscribe_calls().len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn second_start_is_rejected() {
		let ledger = Arc::new(FakeLedger::default());
		let (subscriber, _bus, _liveness) = subscriber(ledger.clone(), SubscriberConfig::default());

		subscriber.start().await.unwrap();
		assert!(matches!(
			subscriber.start().await,
			Err(SyncError::AlreadyListening)
		));
		assert_eq!(ledger.subscribe_calls().len(), 1);
		assert!(subscriber.status().is_listening);
	}

	#[tokio::test(start_paused = true)]
	async fn stop_is_idempotent_and_ends_reconnects() {
		let ledger = Arc::new(FakeLedger::default());
		let (subscriber, _bus, liveness) = subscriber(ledger.clone(), SubscriberConfig::default());

		subscriber.start().await.unwrap();
		assert!(liveness.is_live());

		subscriber.stop().await;
		subscriber.stop().await;
		assert_eq!(ledger.unsubscribed(), vec![1]);
		assert!(!liveness.is_live());
		assert!(!subscriber.status().is_listening);

		ledger.drop_feeds();
		tokio::time::sleep(Duration::from_secs(120)).await;
		assert_eq!(ledger.subscribe_calls().len(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn dropped_stream_reconnects() {
		let ledger = Arc::new(FakeLedger::default());
		let (subscriber, _bus, _liveness) = subscriber(ledger.clone(), SubscriberConfig::default());

		subscriber.start().await.unwrap();
		ledger.drop_feeds();
		flush().await;
		assert_eq!(
			subscriber.status(),
			SubscriberStatus {
				is_listening: false,
				reconnect_attempts: 1,
			}
		);
		assert_eq!(ledger.unsubscribed(), vec![1]);

		tokio::time::sleep(Duration::from_secs(6)).await;
		assert_eq!(ledger.subscribe_calls().len(), 2);
		assert_eq!(
			subscriber.status(),
			SubscriberStatus {
				is_listening: true,
				reconnect_attempts: 0,
			}
		);
	}

	#[tokio::test(start_paused = true)]
	async fn failed_transactions_are_not_dispatched() {
		let ledger = Arc::new(FakeLedger::default());
		let (subscriber, bus, _liveness) = subscriber(ledger.clone(), SubscriberConfig::default());
		let mut events = bus.subscribe(Topic::Kind(NotificationKind::BlockchainEvent));

		subscriber.start().await.unwrap();
		let feed = ledger.feed(0);
		feed.send(Ok(batch(
			"sig-failed",
			Some(serde_json::json!({"InstructionError": [0, {"Custom": 6000}]})),
		)))
		.await
		.unwrap();
		feed.send(Ok(batch("sig-ok", None))).await.unwrap();
		flush().await;

		let Some(Notification::BlockchainEvent(envelope)) = events.try_recv() else {
			panic!("expected one blockchain event");
		};
		assert_eq!(envelope.signature, "sig-ok");
		assert!(events.try_recv().is_none());
	}
}
