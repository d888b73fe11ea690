//! Embedded key-value storage (ambient §2.K) backing the Inference Request Store (§4.F).
//!
//! Two `redb` tables realize the "inference_requests by id, state_snapshots" shape: a primary
//! table keyed by `inference_request_id` holding the serialized request, and a multimap secondary
//! index from lifecycle state to id so `scan_by_state` never has to deserialize the whole table.
//! Both are updated inside a single `redb` write transaction, so a crash between them is
//! impossible and every write is flushed (`commit`) before the call returns, satisfying §4.F's
//! "writes are flushed before acknowledgement" requirement.

use crate::types::{InferenceRequest, RequestState};
use redb::{Database, MultimapTableDefinition, ReadableMultimapTable, ReadableTable, TableDefinition};
use std::path::Path;
use thiserror::Error;
use uuid::Uuid;

const REQUESTS: TableDefinition<&str, &[u8]> = TableDefinition::new("inference_requests");
const STATE_SNAPSHOTS: MultimapTableDefinition<&str, &str> =
	MultimapTableDefinition::new("state_snapshots");

#[derive(Debug, Error)]
pub enum KvError {
	#[error("storage engine error: {0}")]
	Database(#[from] redb::DatabaseError),
	#[error("transaction error: {0}")]
	Transaction(#[from] redb::TransactionError),
	#[error("table error: {0}")]
	Table(#[from] redb::TableError),
	#[error("storage error: {0}")]
	Storage(#[from] redb::StorageError),
	#[error("commit error: {0}")]
	Commit(#[from] redb::CommitError),
	#[error("failed to (de)serialize inference request: {0}")]
	Serde(#[from] serde_json::Error),
}

fn state_key(state: RequestState) -> &'static str {
	match state {
		RequestState::Queued => "queued",
		RequestState::InProcess => "in-process",
		RequestState::Completed => "completed",
	}
}

/// Persistence seam for the Inference Request Store. Kept as a trait, rather than calling `redb`
/// directly from `store`, so the store's unit tests can substitute an in-memory fake.
pub trait KvStore: Send + Sync {
	fn put(&self, request: &InferenceRequest) -> Result<(), KvError>;
	fn get(&self, id: Uuid) -> Result<Option<InferenceRequest>, KvError>;
	fn scan_by_state(&self, state: RequestState) -> Result<Vec<InferenceRequest>, KvError>;
}

/// `redb`-backed implementation, the concrete default per §4.F.
pub struct RedbKvStore {
	db: Database,
}

impl RedbKvStore {
	pub fn open(path: &Path) -> Result<Self, KvError> {
		let db = Database::create(path)?;
		let write = db.begin_write()?;
		{
			// Touch both tables so an empty store still has them, rather than lazily creating
			// one and not the other on the first write.
			write.open_table(REQUESTS)?;
			write.open_multimap_table(STATE_SNAPSHOTS)?;
		}
		write.commit()?;
		Ok(Self { db })
	}
}

impl KvStore for RedbKvStore {
	fn put(&self, request: &InferenceRequest) -> Result<(), KvError> {
		let id = request.inference_request_id.to_string();
		let bytes = serde_json::to_vec(request)?;

		let write = self.db.begin_write()?;
		{
			let mut requests = write.open_table(REQUESTS)?;
			let mut states = write.open_multimap_table(STATE_SNAPSHOTS)?;

			if let Some(previous) = requests.get(id.as_str())?.map(|value| value.value().to_vec()) {
				if let Ok(previous) = serde_json::from_slice::<InferenceRequest>(&previous) {
					states.remove(state_key(previous.state), id.as_str())?;
				}
			}

			requests.insert(id.as_str(), bytes.as_slice())?;
			states.insert(state_key(request.state), id.as_str())?;
		}
		write.commit()?;
		Ok(())
	}

	fn get(&self, id: Uuid) -> Result<Option<InferenceRequest>, KvError> {
		let id = id.to_string();
		let read = self.db.begin_read()?;
		let requests = read.open_table(REQUESTS)?;
		match requests.get(id.as_str())? {
			Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
			None => Ok(None),
		}
	}

	fn scan_by_state(&self, state: RequestState) -> Result<Vec<InferenceRequest>, KvError> {
		let read = self.db.begin_read()?;
		let requests = read.open_table(REQUESTS)?;
		let states = read.open_multimap_table(STATE_SNAPSHOTS)?;

		let mut found = Vec::new();
		for id in states.get(state_key(state))? {
			let id = id?;
			if let Some(value) = requests.get(id.value())? {
				found.push(serde_json::from_slice(value.value())?);
			}
		}
		Ok(found)
	}
}

#[cfg(any(test, feature = "test-util"))]
pub mod fake {
	use super::{InferenceRequest, KvError, KvStore, RequestState, Uuid};
	use std::collections::HashMap;
	use std::sync::Mutex;

	/// In-memory [`KvStore`] used by the Store's and Worker's own unit tests.
	#[derive(Default)]
	pub struct FakeKvStore {
		requests: Mutex<HashMap<Uuid, InferenceRequest>>,
	}

	impl FakeKvStore {
		pub fn new() -> Self {
			Self::default()
		}
	}

	impl KvStore for FakeKvStore {
		fn put(&self, request: &InferenceRequest) -> Result<(), KvError> {
			self.requests
				.lock()
				.unwrap()
				.insert(request.inference_request_id, request.clone());
			Ok(())
		}

		fn get(&self, id: Uuid) -> Result<Option<InferenceRequest>, KvError> {
			Ok(self.requests.lock().unwrap().get(&id).cloned())
		}

		fn scan_by_state(&self, state: RequestState) -> Result<Vec<InferenceRequest>, KvError> {
			Ok(self
				.requests
				.lock()
				.unwrap()
				.values()
				.filter(|request| request.state == state)
				.cloned()
				.collect())
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{EnqueueInferenceRequest, InputMetadata, InputMetadataDetails};

	fn sample() -> InferenceRequest {
		InferenceRequest::new(EnqueueInferenceRequest {
			transaction_id: String::from("txn-1"),
			priority: 128,
			input_metadata: InputMetadata {
				details: InputMetadataDetails::default(),
			},
			input_resources: vec![],
			output_resources: vec![],
		})
	}

	#[test]
	fn put_then_get_round_trips() {
		let tmp = tempfile::NamedTempFile::new().unwrap();
		let store = RedbKvStore::open(tmp.path()).unwrap();
		let request = sample();
		store.put(&request).unwrap();

		let loaded = store.get(request.inference_request_id).unwrap().unwrap();
		assert_eq!(loaded.transaction_id, request.transaction_id);
	}

	#[test]
	fn scan_by_state_reflects_transitions() {
		let tmp = tempfile::NamedTempFile::new().unwrap();
		let store = RedbKvStore::open(tmp.path()).unwrap();
		let mut request = sample();
		store.put(&request).unwrap();

		assert_eq!(store.scan_by_state(RequestState::Queued).unwrap().len(), 1);
		assert_eq!(store.scan_by_state(RequestState::InProcess).unwrap().len(), 0);

		request.state = RequestState::InProcess;
		store.put(&request).unwrap();

		assert_eq!(store.scan_by_state(RequestState::Queued).unwrap().len(), 0);
		assert_eq!(store.scan_by_state(RequestState::InProcess).unwrap().len(), 1);
	}

	#[test]
	fn get_unknown_id_returns_none() {
		let tmp = tempfile::NamedTempFile::new().unwrap();
		let store = RedbKvStore::open(tmp.path()).unwrap();
		assert!(store.get(Uuid::new_v4()).unwrap().is_none());
	}
}
