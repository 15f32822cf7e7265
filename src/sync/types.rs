use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ledger::{LedgerError, ProgramEvent};
use crate::store::{EntityType, StoreError};

/// Finality state of a dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommitmentState {
	PendingConfirmation,
	Finalized,
	ReorgSuspected,
}

impl CommitmentState {
	/// Settle a pending state. Settled states never change again.
	pub fn resolve(self, finalized: bool) -> Result<CommitmentState, SyncError> {
		let target = if finalized {
			CommitmentState::Finalized
		} else {
			CommitmentState::ReorgSuspected
		};
		match self {
			CommitmentState::PendingConfirmation => Ok(target),
			from => Err(SyncError::InvalidTransition { from, to: target }),
		}
	}
}

/// An event awaiting its finality check.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEvent {
	pub signature: String,
	pub slot: u64,
	pub event: ProgramEvent,
	pub timestamp: DateTime<Utc>,
	pub commitment: CommitmentState,
}

impl TrackedEvent {
	pub fn new(signature: String, slot: u64, event: ProgramEvent, timestamp: DateTime<Utc>) -> Self {
		Self {
			signature,
			slot,
			event,
			timestamp,
			commitment: CommitmentState::PendingConfirmation,
		}
	}

	pub fn resolve(&mut self, finalized: bool) -> Result<CommitmentState, SyncError> {
		self.commitment = self.commitment.resolve(finalized)?;
		Ok(self.commitment)
	}
}

/// Error types for the sync core
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Ledger error: {0}")]
	LedgerError(#[from] LedgerError),

	#[error("Store error: {0}")]
	StoreError(#[from] StoreError),

	#[error("Subscriber is already listening")]
	AlreadyListening,

	#[error("A {0} reconciliation sweep is already in progress")]
	SweepInProgress(EntityType),

	#[error("Ledger returned {found} fields for a {expected} account")]
	EntityMismatch {
		expected: EntityType,
		found: EntityType,
	},

	#[error("Commitment cannot move from {from:?} to {to:?}")]
	InvalidTransition {
		from: CommitmentState,
		to: CommitmentState,
	},
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn pending_resolves_once() {
		let state = CommitmentState::PendingConfirmation;
		let finalized = state.resolve(true).unwrap();
		assert_eq!(finalized, CommitmentState::Finalized);

		assert!(matches!(
			finalized.resolve(false),
			Err(SyncError::InvalidTransition {
				from: CommitmentState::Finalized,
				to: CommitmentState::ReorgSuspected,
			})
		));
		assert_eq!(
			state.resolve(false).unwrap(),
			CommitmentState::ReorgSuspected
		);
	}

	#[test]
	fn commitment_serializes_kebab_case() {
		assert_eq!(
			serde_json::to_value(CommitmentState::PendingConfirmation).unwrap(),
			"pending-confirmation"
		);
	}
}
