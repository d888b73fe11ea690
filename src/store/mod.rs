//! Inference Request Store (§4.F): a durable FIFO queue of inference requests, with
//! random-access update by `inference_request_id`, layered over the `KvStore` trait.
//!
//! Serializing `claim_next` across workers (§5 "the Inference Request Store serializes
//! `claim_next` across workers") is done with a single in-process `Mutex` guarding the
//! claim-then-update sequence — `redb`'s own transactions already make each individual
//! `put`/`get` atomic, but "pick the oldest Queued request and flip it to InProcess" is a
//! read-modify-write that needs to be serialized at a higher level to guarantee at most one
//! worker ever holds a given request `InProcess`.

use crate::kv::{KvError, KvStore};
use crate::types::{
	EnqueueInferenceRequest, InferenceRequest, InputMetadataType, RequestState, RequestStatus,
	ResourceInterface,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("request failed validation: {0:?}")]
	Validation(Vec<String>),
	#[error(transparent)]
	Kv(#[from] KvError),
}

/// Durable queue of inference requests (§4.F). Generic over [`KvStore`] so the adapter's own
/// tests can substitute [`crate::kv::fake::FakeKvStore`].
pub struct InferenceRequestStore<K: KvStore> {
	kv: K,
	/// Serializes the claim-then-update read-modify-write across concurrent worker tasks.
	claim_lock: Mutex<()>,
}

impl<K: KvStore> InferenceRequestStore<K> {
	pub fn new(kv: K) -> Self {
		Self {
			kv,
			claim_lock: Mutex::new(()),
		}
	}

	/// Validates and persists a new request in `Queued` state, per §4.F's enqueue-time rules.
	/// Returns every violated rule, not just the first, so the caller can report them all at once.
	pub fn enqueue(&self, body: EnqueueInferenceRequest) -> Result<InferenceRequest, StoreError> {
		let errors = Self::validate(&body);
		if !errors.is_empty() {
			return Err(StoreError::Validation(errors));
		}

		let request = InferenceRequest::new(body);
		self.kv.put(&request)?;
		info!(
			inference_request_id = %request.inference_request_id,
			transaction_id = request.transaction_id,
			"Enqueued inference request"
		);
		Ok(request)
	}

	/// Validation rules per §4.F. Collects every violation rather than short-circuiting on the
	/// first, so API callers see the complete list of problems in one round trip.
	fn validate(body: &EnqueueInferenceRequest) -> Vec<String> {
		let mut errors = Vec::new();

		if body.transaction_id.trim().is_empty() {
			errors.push(String::from("transactionID must not be empty"));
		}

		let algorithm_count = body
			.input_resources
			.iter()
			.filter(|resource| resource.interface == ResourceInterface::Algorithm)
			.count();
		match algorithm_count {
			1 => {}
			0 => errors.push(String::from(
				"exactly one Algorithm input resource is required, found none",
			)),
			n => errors.push(format!(
				"exactly one Algorithm input resource is required, found {n}"
			)),
		}

		let data_source_count = body
			.input_resources
			.iter()
			.filter(|resource| resource.interface != ResourceInterface::Algorithm)
			.count();
		if data_source_count == 0 {
			errors.push(String::from(
				"at least one non-Algorithm input resource is required",
			));
		}

		match body.input_metadata.details.kind {
			None => errors.push(String::from("inputMetadata.details.type is required")),
			Some(InputMetadataType::DicomUid) => {
				if body
					.input_metadata
					.details
					.studies
					.as_ref()
					.is_none_or(|studies| studies.is_empty())
				{
					errors.push(String::from(
						"inputMetadata.details.studies must be non-empty for type DICOM_UID",
					));
				}
			}
			Some(InputMetadataType::DicomPatientId) => {
				if body
					.input_metadata
					.details
					.patient_id
					.as_ref()
					.is_none_or(|id| id.trim().is_empty())
				{
					errors.push(String::from(
						"inputMetadata.details.patientId must be non-empty for type DICOM_PATIENT_ID",
					));
				}
			}
			Some(InputMetadataType::AccessionNumber) => {
				if body
					.input_metadata
					.details
					.accession_numbers
					.as_ref()
					.is_none_or(|accessions| accessions.is_empty())
				{
					errors.push(String::from(
						"inputMetadata.details.accessionNumbers must be non-empty for type ACCESSION_NUMBER",
					));
				}
			}
		}

		for resource in body
			.input_resources
			.iter()
			.chain(body.output_resources.iter())
		{
			if resource.interface != ResourceInterface::DicomWeb {
				continue;
			}
			let details = &resource.connection_details;
			match details.uri.as_deref().map(Url::parse) {
				Some(Ok(uri)) if uri.cannot_be_a_base() => {
					errors.push(format!("DICOMweb resource URI '{uri}' must be absolute"));
				}
				Some(Ok(_)) => {}
				Some(Err(err)) => {
					errors.push(format!("DICOMweb resource has a malformed URI: {err}"));
				}
				None => errors.push(String::from("DICOMweb resource is missing a URI")),
			}

			let requires_auth_id = details
				.auth_type
				.is_some_and(|auth| auth != crate::types::AuthType::None);
			if requires_auth_id && details.auth_id.as_deref().is_none_or(str::is_empty) {
				errors.push(String::from(
					"DICOMweb resource with a non-None authType must specify authId",
				));
			}
		}

		errors
	}

	/// Claims the oldest `Queued` request, if any, and transitions it to `InProcess`. Returns
	/// `None` if no request is waiting. At most one caller may hold a given request `InProcess` at
	/// a time (§4.F invariant), guaranteed by serializing this whole sequence.
	pub async fn claim_next(&self) -> Result<Option<InferenceRequest>, StoreError> {
		let _guard = self.claim_lock.lock().await;

		let mut queued = self.kv.scan_by_state(RequestState::Queued)?;
		queued.sort_by(|a, b| {
			a.enqueued_at
				.cmp(&b.enqueued_at)
				.then_with(|| a.inference_request_id.cmp(&b.inference_request_id))
		});
		let Some(mut request) = queued.into_iter().next() else {
			return Ok(None);
		};

		request.state = RequestState::InProcess;
		self.kv.put(&request)?;
		Ok(Some(request))
	}

	/// Persists an updated request. Callers are responsible for only moving `state` forward and
	/// never decreasing `try_count` — the invariants are enforced by construction in the Worker,
	/// not re-checked here.
	pub fn update(&self, request: &InferenceRequest) -> Result<(), StoreError> {
		self.kv.put(request)?;
		Ok(())
	}

	pub fn get(&self, id: Uuid) -> Result<Option<InferenceRequest>, StoreError> {
		Ok(self.kv.get(id)?)
	}

	pub fn scan_by_state(&self, state: RequestState) -> Result<Vec<InferenceRequest>, StoreError> {
		Ok(self.kv.scan_by_state(state)?)
	}

	/// Cancels a request that is still `Queued` (§4.G "Cancellation"). Returns `false` if the
	/// request is unknown or has already left `Queued` — cancellation of an `InProcess` request is
	/// best-effort and handled by the Worker via its cancellation token, not here.
	pub fn cancel_if_queued(&self, id: Uuid) -> Result<bool, StoreError> {
		let Some(mut request) = self.get(id)? else {
			return Ok(false);
		};
		if request.state != RequestState::Queued {
			return Ok(false);
		}
		request.state = RequestState::Completed;
		request.status = RequestStatus::Fail;
		self.update(&request)?;
		Ok(true)
	}

	/// Restart recovery (§4.F): any request left `InProcess` across a process restart is reset to
	/// `Queued` with `try_count` incremented, since whatever worker held it is gone.
	pub fn recover_in_process(&self) -> Result<usize, StoreError> {
		let mut recovered = 0usize;
		for mut request in self.kv.scan_by_state(RequestState::InProcess)? {
			warn!(
				inference_request_id = %request.inference_request_id,
				"Resetting in-process request to queued after restart"
			);
			request.state = RequestState::Queued;
			request.try_count += 1;
			self.kv.put(&request)?;
			recovered += 1;
		}
		Ok(recovered)
	}
}

pub type SharedInferenceRequestStore<K> = Arc<InferenceRequestStore<K>>;

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::fake::FakeKvStore;
	use crate::types::{
		ConnectionDetails, InputMetadata, InputMetadataDetails, InputResource, OutputResource,
	};

	fn algorithm_resource() -> InputResource {
		InputResource {
			interface: ResourceInterface::Algorithm,
			connection_details: ConnectionDetails {
				pipeline_id: Some(String::from("pipeline-1")),
				..Default::default()
			},
		}
	}

	fn dimse_resource() -> InputResource {
		InputResource {
			interface: ResourceInterface::Dimse,
			connection_details: ConnectionDetails {
				source_id: Some(String::from("src1")),
				..Default::default()
			},
		}
	}

	fn valid_body() -> EnqueueInferenceRequest {
		EnqueueInferenceRequest {
			transaction_id: String::from("txn-1"),
			priority: 128,
			input_metadata: InputMetadata {
				details: InputMetadataDetails {
					kind: Some(InputMetadataType::DicomUid),
					studies: Some(vec![String::from("1.2.3")]),
					..Default::default()
				},
			},
			input_resources: vec![algorithm_resource(), dimse_resource()],
			output_resources: Vec::<OutputResource>::new(),
		}
	}

	#[test]
	fn enqueue_accepts_a_valid_request() {
		let store = InferenceRequestStore::new(FakeKvStore::new());
		let request = store.enqueue(valid_body()).unwrap();
		assert_eq!(request.state, RequestState::Queued);
	}

	#[test]
	fn enqueue_rejects_missing_transaction_id() {
		let store = InferenceRequestStore::new(FakeKvStore::new());
		let mut body = valid_body();
		body.transaction_id = String::new();
		let err = store.enqueue(body).unwrap_err();
		assert!(matches!(err, StoreError::Validation(_)));
	}

	#[test]
	fn enqueue_rejects_multiple_algorithm_resources() {
		let store = InferenceRequestStore::new(FakeKvStore::new());
		let mut body = valid_body();
		body.input_resources.push(algorithm_resource());
		let err = store.enqueue(body).unwrap_err();
		let StoreError::Validation(messages) = err else {
			panic!("expected validation error")
		};
		assert!(messages.iter().any(|m| m.contains("exactly one Algorithm")));
	}

	#[test]
	fn enqueue_rejects_missing_data_source() {
		let store = InferenceRequestStore::new(FakeKvStore::new());
		let mut body = valid_body();
		body.input_resources = vec![algorithm_resource()];
		let err = store.enqueue(body).unwrap_err();
		assert!(matches!(err, StoreError::Validation(_)));
	}

	#[test]
	fn enqueue_rejects_dicomweb_resource_without_absolute_uri() {
		let store = InferenceRequestStore::new(FakeKvStore::new());
		let mut body = valid_body();
		body.input_resources.push(InputResource {
			interface: ResourceInterface::DicomWeb,
			connection_details: ConnectionDetails {
				uri: Some(String::from("not-a-url")),
				..Default::default()
			},
		});
		let err = store.enqueue(body).unwrap_err();
		assert!(matches!(err, StoreError::Validation(_)));
	}

	#[tokio::test]
	async fn claim_next_returns_oldest_queued_and_marks_in_process() {
		let store = InferenceRequestStore::new(FakeKvStore::new());
		let first = store.enqueue(valid_body()).unwrap();
		let mut second_body = valid_body();
		second_body.transaction_id = String::from("txn-2");
		store.enqueue(second_body).unwrap();

		let claimed = store.claim_next().await.unwrap().unwrap();
		assert_eq!(claimed.inference_request_id, first.inference_request_id);
		assert_eq!(
			store.get(first.inference_request_id).unwrap().unwrap().state,
			RequestState::InProcess
		);
	}

	#[tokio::test]
	async fn claim_next_returns_none_when_queue_is_empty() {
		let store = InferenceRequestStore::new(FakeKvStore::new());
		assert!(store.claim_next().await.unwrap().is_none());
	}

	#[test]
	fn restart_recovery_resets_in_process_to_queued() {
		let store = InferenceRequestStore::new(FakeKvStore::new());
		let mut request = store.enqueue(valid_body()).unwrap();
		request.state = RequestState::InProcess;
		store.update(&request).unwrap();

		let recovered = store.recover_in_process().unwrap();
		assert_eq!(recovered, 1);

		let reloaded = store.get(request.inference_request_id).unwrap().unwrap();
		assert_eq!(reloaded.state, RequestState::Queued);
		assert_eq!(reloaded.try_count, 1);
	}

	#[test]
	fn cancel_if_queued_marks_completed_fail() {
		let store = InferenceRequestStore::new(FakeKvStore::new());
		let request = store.enqueue(valid_body()).unwrap();
		assert!(store.cancel_if_queued(request.inference_request_id).unwrap());

		let reloaded = store.get(request.inference_request_id).unwrap().unwrap();
		assert_eq!(reloaded.state, RequestState::Completed);
		assert_eq!(reloaded.status, RequestStatus::Fail);
	}

	#[test]
	fn cancel_if_queued_is_false_once_in_process() {
		let store = InferenceRequestStore::new(FakeKvStore::new());
		let mut request = store.enqueue(valid_body()).unwrap();
		request.state = RequestState::InProcess;
		store.update(&request).unwrap();

		assert!(!store.cancel_if_queued(request.inference_request_id).unwrap());
	}
}
