use super::types::*;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{debug, info};

type RecordKey = (EntityType, String);

/// File-based implementation of MirrorStore
///
/// Keeps one JSON document per entity type in `data_dir`. Each write replaces the document
/// through a temp file and a rename, under a lock held for the whole update.
pub struct FileMirrorStore {
	data_dir: PathBuf,
	records: Mutex<BTreeMap<RecordKey, MirroredEntity>>,
}

impl FileMirrorStore {
	/// Open (or create) a store rooted at `data_dir`.
	pub async fn open(data_dir: PathBuf) -> Result<Self, StoreError> {
		tokio::fs::create_dir_all(&data_dir).await?;

		let mut records = BTreeMap::new();
		for entity_type in EntityType::ALL {
			let filename = mirror_filename(&data_dir, entity_type);
			if !filename.exists() {
				continue;
			}

			let content = tokio::fs::read_to_string(&filename).await?;
			let entities: Vec<MirroredEntity> = serde_json::from_str(&content)?;
			info!(
				"Loaded {} {} records from {:?}",
				entities.len(),
				entity_type,
				filename
			);
			for entity in entities {
				records.insert((entity.entity_type, entity.on_chain_address.clone()), entity);
			}
		}

		Ok(Self {
			data_dir,
			records: Mutex::new(records),
		})
	}

	async fn persist(
		&self,
		entity_type: EntityType,
		records: &BTreeMap<RecordKey, MirroredEntity>,
	) -> Result<(), StoreError> {
		let entities: Vec<&MirroredEntity> = records
			.values()
			.filter(|r| r.entity_type == entity_type)
			.collect();
		let content = serde_json::to_string_pretty(&entities)?;

		let filename = mirror_filename(&self.data_dir, entity_type);
		let tmp_filename = filename.with_extension("json.tmp");
		tokio::fs::write(&tmp_filename, content).await?;
		tokio::fs::rename(&tmp_filename, &filename).await?;

		debug!("Persisted {} {} records", entities.len(), entity_type);
		Ok(())
	}

	/// Apply `f` to a copy of the record and commit it only once it is on disk.
	async fn mutate<F>(&self, entity_type: EntityType, address: &str, f: F) -> Result<(), StoreError>
	where
		F: FnOnce(&mut MirroredEntity) -> Result<(), StoreError>,
	{
		let mut records = self.records.lock().await;
		let key = (entity_type, address.to_string());
		let mut updated = records
			.get(&key)
			.cloned()
			.ok_or_else(|| StoreError::NotFound {
				entity_type,
				address: address.to_string(),
			})?;
		f(&mut updated)?;

		let previous = records.insert(key.clone(), updated);
		if let Err(e) = self.persist(entity_type, &records).await {
			if let Some(previous) = previous {
				records.insert(key, previous);
			}
			return Err(e);
		}
		Ok(())
	}
}

fn mirror_filename(data_dir: &Path, entity_type: EntityType) -> PathBuf {
	data_dir.join(format!("mirror_{}.json", entity_type))
}

#[async_trait::async_trait]
impl MirrorStore for FileMirrorStore {
	async fn find_one(
		&self,
		entity_type: EntityType,
		address: &str,
	) -> Result<Option<MirroredEntity>, StoreError> {
		let records = self.records.lock().await;
		Ok(records.get(&(entity_type, address.to_string())).cloned())
	}

	async fn find_active(&self, entity_type: EntityType) -> Result<Vec<MirroredEntity>, StoreError> {
		let records = self.records.lock().await;
		Ok(records
			.values()
			.filter(|r| r.entity_type == entity_type && !r.is_orphaned)
			.cloned()
			.collect())
	}

	async fn upsert(&self, mut entity: MirroredEntity) -> Result<(), StoreError> {
		let mut records = self.records.lock().await;
		let entity_type = entity.entity_type;
		let key = (entity_type, entity.on_chain_address.clone());
		if let Some(existing) = records.get(&key) {
			entity.inherit_orphan_state(existing);
		}

		let previous = records.insert(key.clone(), entity);
		if let Err(e) = self.persist(entity_type, &records).await {
			match previous {
				Some(previous) => records.insert(key, previous),
				None => records.remove(&key),
			};
			return Err(e);
		}
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
