use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::report::SweepReport;
use super::types::SyncError;
use crate::ledger::{LedgerClient, LedgerError};
use crate::store::{EntityType, FieldChange, MirrorStore, StoreError};

/// Configuration for reconciliation sweeps
#[derive(Debug, Clone)]
pub struct ReconcileConfig {
	/// Records reconciled at the same time within one sweep
	pub concurrency: usize,
}

impl Default for ReconcileConfig {
	fn default() -> Self {
		Self { concurrency: 4 }
	}
}

/// Result of reconciling a single record against the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "changes", rename_all = "kebab-case")]
pub enum ReconcileOutcome {
	/// Local watched fields already match the ledger; nothing written
	InSync,
	/// Local watched fields were overwritten with these ledger values
	Healed(Vec<FieldChange>),
	/// The ledger account is gone; the record is flagged, not deleted
	Orphaned,
	/// No local record exists for the address
	MissingLocally,
}

/// Corrects drift between the local mirror and the ledger.
///
/// The ledger is authoritative: watched fields that differ are overwritten with ledger values,
/// and records whose account no longer exists are flagged as orphaned.
pub struct ReconciliationEngine {
	ledger: Arc<dyn LedgerClient>,
	store: Arc<dyn MirrorStore>,
	config: ReconcileConfig,
	sweeps_in_flight: Mutex<HashSet<EntityType>>,
}

impl ReconciliationEngine {
	pub fn new(
		ledger: Arc<dyn LedgerClient>,
		store: Arc<dyn MirrorStore>,
		config: ReconcileConfig,
	) -> Self {
		Self {
			ledger,
			store,
			config,
			sweeps_in_flight: Mutex::new(HashSet::new()),
		}
	}

	/// Bring one local record in line with the ledger.
	pub async fn reconcile_one(
		&self,
		entity_type: EntityType,
		address: &str,
	) -> Result<ReconcileOutcome, SyncError> {
		let ledger_fields = match self.ledger.fetch_account(address, entity_type).await {
			Ok(fields) => fields,
			Err(LedgerError::AccountNotFound(_)) => return self.orphan(entity_type, address).await,
			Err(e) => return Err(e.into()),
		};
		if ledger_fields.entity_type() != entity_type {
			return Err(SyncError::EntityMismatch {
				expected: entity_type,
				found: ledger_fields.entity_type(),
			});
		}

		let Some(local) = self.store.find_one(entity_type, address).await? else {
			warn!(
				entity_type = %entity_type,
				address = %address,
				"Ledger account has no local record"
			);
			return Ok(ReconcileOutcome::MissingLocally);
		};

		let changes = local.fields.diff(&ledger_fields);
		if changes.is_empty() {
			debug!(entity_type = %entity_type, address = %address, "Record in sync");
			return Ok(ReconcileOutcome::InSync);
		}

		self.store
			.update_fields(entity_type, address, &ledger_fields, Utc::now())
			.await?;
		for change in &changes {
			warn!(
				entity_type = %entity_type,
				address = %address,
				field = change.field,
				old = ?change.old,
				new = %change.new,
				"Mirror discrepancy healed from ledger"
			);
		}
		Ok(ReconcileOutcome::Healed(changes))
	}

	async fn orphan(
		&self,
		entity_type: EntityType,
		address: &str,
	) -> Result<ReconcileOutcome, SyncError> {
		match self
			.store
			.mark_orphaned(entity_type, address, Utc::now())
			.await
		{
			Ok(()) => {
				warn!(
					entity_type = %entity_type,
					address = %address,
					"Ledger account no longer exists, record marked orphaned"
				);
				Ok(ReconcileOutcome::Orphaned)
			}
			Err(StoreError::NotFound { .. }) => {
				warn!(
					entity_type = %entity_type,
					address = %address,
					"Address unknown both on the ledger and locally"
				);
				Ok(ReconcileOutcome::MissingLocally)
			}
			Err(e) => Err(e.into()),
		}
	}

	/// Reconcile every active record of one entity type.
	///
	/// Orphaned and pending records are skipped. A record that fails is logged and counted,
	/// and the sweep carries on with the rest. Only one sweep per entity type runs at a time.
	pub async fn reconcile_all(&self, entity_type: EntityType) -> Result<SweepReport, SyncError> {
		let _guard = SweepGuard::acquire(&self.sweeps_in_flight, entity_type)?;
		let started = Instant::now();
		let mut report = SweepReport::new(entity_type);

		let records = self.store.find_active(entity_type).await?;
		let mut addresses = Vec::with_capacity(records.len());
		for record in records {
			if record.is_pending() {
				report.record_skipped();
			} else {
				addresses.push(record.on_chain_address);
			}
		}
		info!("Reconciling {} {} records", addresses.len(), entity_type);

		let results: Vec<(String, Result<ReconcileOutcome, SyncError>)> = stream::iter(addresses)
			.map(|address| async move {
				let result = self.reconcile_one(entity_type, &address).await;
				(address, result)
			})
			.buffer_unordered(self.config.concurrency.max(1))
			.collect()
			.await;

		for (address, result) in results {
			match result {
				Ok(outcome) => report.record(&outcome),
				Err(e) => {
					error!(
						entity_type = %entity_type,
						address = %address,
						"Failed to reconcile record: {}",
						e
					);
					report.record_failure();
				}
			}
		}

		report.elapsed = started.elapsed();
		info!("{}", report.summary());
		Ok(report)
	}

	/// Sweep every entity type in turn.
	pub async fn reconcile_everything(&self) -> Vec<SweepReport> {
		let mut reports = Vec::with_capacity(EntityType::ALL.len());
		for entity_type in EntityType::ALL {
			match self.reconcile_all(entity_type).await {
				Ok(report) => reports.push(report),
				Err(e) => error!("{} sweep aborted: {}", entity_type, e),
			}
		}
		reports
	}
}

/// Marks an entity type as being swept until dropped.
struct SweepGuard<'a> {
	in_flight: &'a Mutex<HashSet<EntityType>>,
	entity_type: EntityType,
}

impl<'a> SweepGuard<'a> {
	fn acquire(
		in_flight: &'a Mutex<HashSet<EntityType>>,
		entity_type: EntityType,
	) -> Result<Self, SyncError> {
		let mut sweeps = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
		if !sweeps.insert(entity_type) {
			warn!("{} sweep requested while one is in flight", entity_type);
			return Err(SyncError::SweepInProgress(entity_type));
		}
		Ok(Self {
			in_flight,
			entity_type,
		})
	}
}

impl Drop for SweepGuard<'_> {
	fn drop(&mut self) {
		self.in_flight
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.remove(&self.entity_type);
	}
}
