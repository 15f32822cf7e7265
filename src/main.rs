use std::sync::Arc;
use tracing::{debug, error, info, warn};

use solana_mirror_sync::config::AppConfig;
use solana_mirror_sync::ledger::{LedgerClient, SolanaRpcClient};
use solana_mirror_sync::store::{FileMirrorStore, MirrorStore};
use solana_mirror_sync::sync::events::Subscription;
use solana_mirror_sync::sync::{
	EventDispatcher, EventParser, EventSubscriber, FinalityTracker, LivenessFlag, Notification,
	NotificationBus, ReconciliationEngine, Topic,
};

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env()
				.add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	if let Err(e) = run().await {
		error!("Mirror sync service failed: {}", e);
		std::process::exit(1);
	}
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::from_env()?;
	info!(
		"Starting mirror sync service for program {} via {}",
		config.program_id, config.rpc_url
	);

	let ledger: Arc<dyn LedgerClient> = Arc::new(
		SolanaRpcClient::new(
			config.rpc_url.clone(),
			config.ws_url.clone(),
			config.rpc_timeout,
		)?
		.with_commitment(config.commitment),
	);
	info!("Created ledger client");

	let store: Arc<dyn MirrorStore> = Arc::new(FileMirrorStore::open(config.data_dir.clone()).await?);
	info!("Opened mirror store at {:?}", config.data_dir);

	let bus = NotificationBus::new();
	let liveness = LivenessFlag::new();
	let tracker = FinalityTracker::spawn(
		ledger.clone(),
		bus.clone(),
		liveness.clone(),
		config.finality.clone(),
	);
	let dispatcher = EventDispatcher::new(
		EventParser::new(config.program_id.as_str()),
		bus.clone(),
		tracker.clone(),
	);
	let subscriber = EventSubscriber::new(
		ledger.clone(),
		dispatcher,
		bus.clone(),
		liveness,
		config.program_id.as_str(),
		config.commitment,
		config.subscriber.clone(),
	);
	let engine = ReconciliationEngine::new(ledger, store, config.reconcile.clone());

	let relay = tokio::spawn(log_notifications(
		bus.subscribe(Topic::All),
		tracker.clone(),
	));
	subscriber.start().await?;

	let mut ticker = tokio::time::interval(config.reconcile_interval);
	loop {
		tokio::select! {
			_ = ticker.tick() => {
				let reports = engine.reconcile_everything().await;
				let drifted = reports.iter().filter(|report| !report.is_clean()).count();
				let status = subscriber.status();
				info!(
					listening = status.is_listening,
					reconnect_attempts = status.reconnect_attempts,
					finality = ?tracker.stats(),
					"Reconciliation pass finished ({} sweeps, {} found drift)",
					reports.len(),
					drifted
				);
			}
			signal = tokio::signal::ctrl_c() => {
				if let Err(e) = signal {
					error!("Failed to listen for shutdown signal: {}", e);
				}
				info!("Shutting down");
				break;
			}
		}
	}

	subscriber.stop().await;
	relay.abort();
	Ok(())
}

/// Stand-in for a relay layer: logs every notification as JSON.
///
/// A suspected reorg is queried once more so late finalization is told apart
/// from a dropped transaction.
async fn log_notifications(mut subscription: Subscription, tracker: FinalityTracker) {
	while let Some(notification) = subscription.recv().await {
		match &notification {
			Notification::MaxReconnectAttemptsReached { attempts } => {
				error!(
					"Log subscription abandoned after {} attempts, live ingestion stopped",
					attempts
				);
				continue;
			}
			Notification::PotentialReorg(reorg) => {
				match tracker.is_finalized(&reorg.signature).await {
					Ok(true) => info!("Transaction {} finalized after its check", reorg.signature),
					Ok(false) => warn!(
						"Transaction {} still not finalized ({:?} at check), possible reorg",
						reorg.signature, reorg.observed
					),
					Err(e) => warn!("Failed to re-query transaction {}: {}", reorg.signature, e),
				}
			}
			_ => {}
		}
		match serde_json::to_string(&notification) {
			Ok(json) => debug!(channel = %notification.name(), "{}", json),
			Err(e) => warn!("Failed to serialize {} notification: {}", notification.name(), e),
		}
	}
}
