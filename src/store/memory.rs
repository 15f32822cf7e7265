use super::types::*;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

type RecordKey = (EntityType, String);

/// In-memory implementation of MirrorStore
#[derive(Default)]
pub struct InMemoryMirrorStore {
	records: RwLock<BTreeMap<RecordKey, MirroredEntity>>,
	/// Number of mutating writes applied
	writes: AtomicU64,
}

impl InMemoryMirrorStore {
	pub fn new() -> Self {
		Self::default()
	}

	#[cfg(test)]
	pub fn write_count(&self) -> u64 {
		self.writes.load(Ordering::SeqCst)
	}

	async fn mutate<F>(&self, entity_type: EntityType, address: &str, f: F) -> Result<(), StoreError>
	where
		F: FnOnce(&mut MirroredEntity) -> Result<(), StoreError>,
	{
		let mut records = self.records.write().await;
		let record = records
			.get_mut(&(entity_type, address.to_string()))
			.ok_or_else(|| StoreError::NotFound {
				entity_type,
				address: address.to_string(),
			})?;
		f(record)?;
		self.writes.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}
}

#[async_trait::async_trait]
impl MirrorStore for InMemoryMirrorStore {
	async fn find_one(
		&self,
		entity_type: EntityType,
		address: &str,
	) -> Result<Option<MirroredEntity>, StoreError> {
		let records = self.records.read().await;
		Ok(records.get(&(entity_type, address.to_string())).cloned())
	}

	async fn find_active(&self, entity_type: EntityType) -> Result<Vec<MirroredEntity>, StoreError> {
		let records = self.records.read().await;
		Ok(records
			.values()
			.filter(|r| r.entity_type == entity_type && !r.is_orphaned)
			.cloned()
			.collect())
	}

	async fn upsert(&self, mut entity: MirroredEntity) -> Result<(), StoreError> {
		let mut records = self.records.write().await;
		let key = (entity.entity_type, entity.on_chain_address.clone());
		if let Some(existing) = records.get(&key) {
			entity.inherit_orphan_state(existing);
		}
		records.insert(key, entity);
		self.writes.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn update_fields(
		&self,
		entity_type: EntityType,
		address: &str,
		fields: &WatchedFields,
		synced_at: DateTime<Utc>,
	) -> Result<(), StoreError> {
		self.mutate(entity_type, address, |record| {
			record.apply_fields(fields, synced_at)
		})
		.await
	}

	async fn mark_orphaned(
		&self,
		entity_type: EntityType,
		address: &str,
		at: DateTime<Utc>,
	) -> Result<(), StoreError> {
		self.mutate(entity_type, address, |record| {
			record.mark_orphaned(at);
			Ok(())
		})
		.await
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn coupon(address: &str) -> MirroredEntity {
		MirroredEntity::new(
			address,
			WatchedFields::Coupon {
				owner: "owner-a".to_string(),
				is_redeemed: false,
			},
		)
	}

	#[tokio::test]
	async fn orphaned_records_are_not_active() {
		let store = InMemoryMirrorStore::new();
		store.upsert(coupon("c1")).await.unwrap();
		store.upsert(coupon("c2")).await.unwrap();
		store
			.mark_orphaned(EntityType::Coupon, "c1", Utc::now())
			.await
			.unwrap();

		let active = store.find_active(EntityType::Coupon).await.unwrap();
		assert_eq!(active.len(), 1);
		assert_eq!(active[0].on_chain_address, "c2");

		let orphan = store.find_one(EntityType::Coupon, "c1").await.unwrap().unwrap();
		assert!(orphan.is_orphaned);
		assert!(orphan.orphaned_at.is_some());
	}

	#[tokio::test]
	async fn upsert_keeps_orphan_flag_of_replaced_record() {
		let store = InMemoryMirrorStore::new();
		store.upsert(coupon("c1")).await.unwrap();
		let orphaned_at = Utc::now();
		store
			.mark_orphaned(EntityType::Coupon, "c1", orphaned_at)
			.await
			.unwrap();

		store.upsert(coupon("c1")).await.unwrap();

		let record = store.find_one(EntityType::Coupon, "c1").await.unwrap().unwrap();
		assert!(record.is_orphaned);
		assert_eq!(record.orphaned_at, Some(orphaned_at));
		assert!(store.find_active(EntityType::Coupon).await.unwrap().is_empty());
	}

	#[tokio::test]
	async fn update_of_missing_record_is_not_found() {
		let store = InMemoryMirrorStore::new();
		let result = store
			.update_fields(
				EntityType::Coupon,
				"nope",
				&WatchedFields::Coupon {
					owner: "x".to_string(),
					is_redeemed: true,
				},
				Utc::now(),
			)
			.await;

		assert!(matches!(result, Err(StoreError::NotFound { .. })));
		assert_eq!(store.write_count(), 0);
	}

	#[tokio::test]
	async fn field_update_does_not_clear_orphan_flag() {
		let store = InMemoryMirrorStore::new();
		store.upsert(coupon("c1")).await.unwrap();
		store
			.mark_orphaned(EntityType::Coupon, "c1", Utc::now())
			.await
			.unwrap();
		store
			.update_fields(
				EntityType::Coupon,
				"c1",
				&WatchedFields::Coupon {
					owner: "owner-b".to_string(),
					is_redeemed: true,
				},
				Utc::now(),
			)
			.await
			.unwrap();

		let record = store.find_one(EntityType::Coupon, "c1").await.unwrap().unwrap();
		assert!(record.is_orphaned);
		assert!(record.last_synced_at.is_some());
	}
}
