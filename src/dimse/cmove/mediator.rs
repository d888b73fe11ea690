use crate::dimse::cmove::movescu::MoveError;
use crate::dimse::cmove::MoveSubOperation;
use crate::types::{AE, US};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::Sender;

/// Correlates C-STORE pushes arriving at the Association Handler's own SCP with the retrieval
/// that requested them via C-MOVE (§4.G step 2, §4.I). Keyed by the move originator AE title and,
/// when present, the originating C-MOVE's message id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
	Identified { originator: AE, message_id: US },
	Unidentified { originator: AE },
}

impl TaskKey {
	pub const fn new(originator: AE, message_id: Option<US>) -> Self {
		match message_id {
			None => Self::Unidentified { originator },
			Some(message_id) => Self::Identified {
				originator,
				message_id,
			},
		}
	}

	pub fn originator(&self) -> &str {
		match self {
			Self::Unidentified { originator } | Self::Identified { originator, .. } => originator,
		}
	}
}

pub type Callback = Sender<Result<MoveSubOperation, MoveError>>;

pub struct MoveTask {
	key: TaskKey,
	callback: Callback,
}

impl MoveTask {
	pub const fn new(key: TaskKey, callback: Callback) -> Self {
		Self { key, callback }
	}
}

#[derive(Debug, Error)]
pub enum MediatorError {
	#[error("no retrieval is currently waiting for sub-operations from {0}")]
	MissingCallback(AE),
	#[error("the waiting retrieval's channel is closed")]
	ChannelClosed,
}

/// A mediator between the ingest SCP (publisher, one per C-STORE received) and the retrieval
/// client's C-MOVE callers (subscribers, one per in-flight retrieval), grounded on the teacher's
/// `MoveMediator` callback-registration pattern.
#[derive(Default)]
pub struct MoveMediator {
	callbacks: Mutex<HashMap<TaskKey, Callback>>,
}

impl MoveMediator {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers interest in sub-operations destined for `task.key`. Must happen before the
	/// C-MOVE-RQ that triggers the matching pushes is sent.
	pub fn add(&self, task: MoveTask) {
		self.callbacks.lock().unwrap().insert(task.key, task.callback);
	}

	pub fn remove(&self, key: &TaskKey) {
		self.callbacks.lock().unwrap().remove(key);
	}

	/// Forwards one received sub-operation to the waiting retrieval, preferring an exact
	/// `(originator, message_id)` match and falling back to an unidentified subscription for the
	/// same originator.
	pub async fn publish(
		&self,
		topic: &TaskKey,
		result: Result<MoveSubOperation, MoveError>,
	) -> Result<(), MediatorError> {
		let callback = {
			let callbacks = self.callbacks.lock().unwrap();
			callbacks
				.get(topic)
				.or_else(|| {
					callbacks.get(&TaskKey::Unidentified {
						originator: topic.originator().to_string(),
					})
				})
				.cloned()
		};

		match callback {
			Some(callback) => callback
				.send(result)
				.await
				.map_err(|_| MediatorError::ChannelClosed),
			None => Err(MediatorError::MissingCallback(topic.originator().to_string())),
		}
	}
}
