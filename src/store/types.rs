use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Address placeholder used for records not yet created on chain.
pub const PENDING_ADDRESS: &str = "pending";

/// The kinds of ledger accounts mirrored locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
	Promotion,
	Coupon,
}

impl EntityType {
	/// Sweep order used when reconciling everything.
	pub const ALL: [EntityType; 2] = [EntityType::Promotion, EntityType::Coupon];

	pub fn as_str(&self) -> &'static str {
		match self {
			EntityType::Promotion => "promotion",
			EntityType::Coupon => "coupon",
		}
	}

	/// Account type name used by the program.
	pub fn account_name(&self) -> &'static str {
		match self {
			EntityType::Promotion => "Promotion",
			EntityType::Coupon => "Coupon",
		}
	}
}

impl fmt::Display for EntityType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Ledger-owned fields kept in the mirror. Each variant is the full watched set of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WatchedFields {
	Promotion {
		current_supply: u32,
		is_active: bool,
	},
	Coupon {
		owner: String,
		is_redeemed: bool,
	},
}

impl WatchedFields {
	pub fn entity_type(&self) -> EntityType {
		match self {
			WatchedFields::Promotion { .. } => EntityType::Promotion,
			WatchedFields::Coupon { .. } => EntityType::Coupon,
		}
	}

	/// Field names and values in a fixed order.
	pub fn values(&self) -> Vec<(&'static str, FieldValue)> {
		match self {
			WatchedFields::Promotion {
				current_supply,
				is_active,
			} => vec![
				("currentSupply", FieldValue::Count(*current_supply)),
				("isActive", FieldValue::Flag(*is_active)),
			],
			WatchedFields::Coupon { owner, is_redeemed } => vec![
				("owner", FieldValue::Address(owner.clone())),
				("isRedeemed", FieldValue::Flag(*is_redeemed)),
			],
		}
	}

	/// Field-level differences between this (local) set and the ledger's.
	///
	/// Sets of different entity types differ in every ledger field.
	pub fn diff(&self, ledger: &WatchedFields) -> Vec<FieldChange> {
		if self.entity_type() != ledger.entity_type() {
			return ledger
				.values()
				.into_iter()
				.map(|(field, new)| FieldChange {
					field,
					old: None,
					new,
				})
				.collect();
		}

		self.values()
			.into_iter()
			.zip(ledger.values())
			.filter(|((_, old), (_, new))| old != new)
			.map(|((field, old), (_, new))| FieldChange {
				field,
				old: Some(old),
				new,
			})
			.collect()
	}
}

/// A single watched field value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
	Count(u32),
	Flag(bool),
	Address(String),
}

impl fmt::Display for FieldValue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FieldValue::Count(v) => write!(f, "{}", v),
			FieldValue::Flag(v) => write!(f, "{}", v),
			FieldValue::Address(v) => f.write_str(v),
		}
	}
}

/// One healed discrepancy, kept for the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldChange {
	pub field: &'static str,
	pub old: Option<FieldValue>,
	pub new: FieldValue,
}

impl fmt::Display for FieldChange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match &self.old {
			Some(old) => write!(f, "{}: {} -> {}", self.field, old, self.new),
			None => write!(f, "{}: <unset> -> {}", self.field, self.new),
		}
	}
}

/// A locally mirrored ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirroredEntity {
	pub entity_type: EntityType,
	/// Ledger address; immutable key of the record.
	pub on_chain_address: String,
	pub fields: WatchedFields,
	pub last_synced_at: Option<DateTime<Utc>>,
	/// Set once the ledger account is gone. Never cleared by the sync core.
	#[serde(default)]
	pub is_orphaned: bool,
	#[serde(default)]
	pub orphaned_at: Option<DateTime<Utc>>,
}

impl MirroredEntity {
	pub fn new(on_chain_address: impl Into<String>, fields: WatchedFields) -> Self {
		Self {
			entity_type: fields.entity_type(),
			on_chain_address: on_chain_address.into(),
			fields,
			last_synced_at: None,
			is_orphaned: false,
			orphaned_at: None,
		}
	}

	/// The record has not been written to the ledger yet.
	pub fn is_pending(&self) -> bool {
		self.on_chain_address == PENDING_ADDRESS
	}

	/// Overwrite the watched fields with ledger values. Orphan state is left alone.
	pub(crate) fn apply_fields(
		&mut self,
		fields: &WatchedFields,
		synced_at: DateTime<Utc>,
	) -> Result<(), StoreError> {
		if fields.entity_type() != self.entity_type {
			return Err(StoreError::FieldTypeMismatch {
				expected: self.entity_type,
				found: fields.entity_type(),
			});
		}
		self.fields = fields.clone();
		self.last_synced_at = Some(synced_at);
		Ok(())
	}

	/// Carry an existing record's orphan flag over to its replacement.
	pub(crate) fn inherit_orphan_state(&mut self, existing: &MirroredEntity) {
		if existing.is_orphaned {
			self.is_orphaned = true;
			self.orphaned_at = existing.orphaned_at;
		}
	}

	/// Flag the record as orphaned. The first orphaning time is kept.
	pub(crate) fn mark_orphaned(&mut self, at: DateTime<Utc>) {
		if !self.is_orphaned {
			self.is_orphaned = true;
			self.orphaned_at = Some(at);
		}
	}
}

/// Local store of mirrored entities.
///
/// Every mutating call is applied as one atomic write of a single record, so a
/// reconciliation overwrite and a live-event update never interleave.
#[async_trait::async_trait]
pub trait MirrorStore: Send + Sync {
	async fn find_one(
		&self,
		entity_type: EntityType,
		address: &str,
	) -> Result<Option<MirroredEntity>, StoreError>;

	/// All records of `entity_type` that are not orphaned.
	async fn find_active(&self, entity_type: EntityType) -> Result<Vec<MirroredEntity>, StoreError>;

	/// Insert or replace a record; used by live-event handlers and seeding.
	/// A replacement never clears the orphan flag of the record it replaces.
	async fn upsert(&self, entity: MirroredEntity) -> Result<(), StoreError>;

	/// Overwrite the watched fields of an existing record and stamp `last_synced_at`.
	async fn update_fields(
		&self,
		entity_type: EntityType,
		address: &str,
		fields: &WatchedFields,
		synced_at: DateTime<Utc>,
	) -> Result<(), StoreError>;

	/// Flag an existing record as orphaned; the record itself is kept.
	async fn mark_orphaned(
		&self,
		entity_type: EntityType,
		address: &str,
		at: DateTime<Utc>,
	) -> Result<(), StoreError>;
}

/// Error types for local store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
	#[error("No {entity_type} record for address {address}")]
	NotFound {
		entity_type: EntityType,
		address: String,
	},

	#[error("Field set for {found} cannot be written to a {expected} record")]
	FieldTypeMismatch {
		expected: EntityType,
		found: EntityType,
	},

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	JsonError(#[from] serde_json::Error),
}
