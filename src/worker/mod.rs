//! Inference Request Worker (§4.G): a claim loop driving each request through
//! `Queued -> InProcess -> Completed`, retrieving its data via §4.I and submitting a job via §4.H.
//!
//! The pool is a fixed number of tasks (`worker.concurrency`, default 1), each pulling from the
//! shared [`InferenceRequestStore`] in a loop; [`InferenceRequestStore::claim_next`] already
//! serializes the claim across the whole pool, so no further coordination is needed here beyond
//! per-request cancellation bookkeeping.

use crate::config::WorkerConfig;
use crate::kv::KvStore;
use crate::platform::PlatformClient;
use crate::retrieval::{RetrievalError, RetrievalOutcome};
use crate::staging::StagingStore;
use crate::store::InferenceRequestStore;
use crate::submitter::{JobSubmissionRequest, SubmitError, Submitter};
use crate::types::{InferenceRequest, InputMetadataDetails, InputResource, RequestState, RequestStatus};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Dispatches one `inputResources[]` entry to the retrieval implementation appropriate for its
/// `interface`, per §4.G step 2. A separate trait from [`crate::retrieval::RetrievalClient`] so
/// the Worker can hold a fixed set of concrete clients without needing trait objects over an
/// `impl Future`-returning trait.
pub trait ResourceRetriever: Send + Sync {
	fn retrieve(
		&self,
		resource: &InputResource,
		selector: &InputMetadataDetails,
		destination: &Path,
		cancellation: &CancellationToken,
	) -> impl std::future::Future<Output = Result<RetrievalOutcome, RetrievalError>> + Send;
}

/// Production [`ResourceRetriever`]: holds the configured DIMSE and/or DICOMweb clients and picks
/// between them by the resource's `interface`.
pub struct CompositeRetriever {
	pub dimse: Option<crate::retrieval::DimseRetrievalClient>,
	pub dicomweb: Option<crate::retrieval::DicomWebRetrievalClient>,
}

impl ResourceRetriever for CompositeRetriever {
	async fn retrieve(
		&self,
		resource: &InputResource,
		selector: &InputMetadataDetails,
		destination: &Path,
		cancellation: &CancellationToken,
	) -> Result<RetrievalOutcome, RetrievalError> {
		use crate::retrieval::{RetrievalClient, ResourceDescriptor};
		use crate::types::ResourceInterface;

		match resource.interface {
			ResourceInterface::Dimse => {
				let client = self.dimse.as_ref().ok_or_else(|| {
					RetrievalError::Permanent(String::from("no DIMSE retrieval client configured"))
				})?;
				let descriptor = ResourceDescriptor::DimseQueryRetrieve {
					source_id: resource
						.connection_details
						.source_id
						.as_deref()
						.ok_or_else(|| RetrievalError::Permanent(String::from("DIMSE resource has no sourceId")))?,
					called_ae: resource.connection_details.called_ae.as_deref(),
				};
				client.retrieve(&descriptor, selector, destination, cancellation).await
			}
			ResourceInterface::DicomWeb => {
				let client = self.dicomweb.as_ref().ok_or_else(|| {
					RetrievalError::Permanent(String::from("no DICOMweb retrieval client configured"))
				})?;
				let descriptor = ResourceDescriptor::DicomWeb {
					details: &resource.connection_details,
				};
				client.retrieve(&descriptor, selector, destination, cancellation).await
			}
			ResourceInterface::Algorithm => Err(RetrievalError::Permanent(String::from(
				"the Algorithm resource is not retrievable",
			))),
		}
	}
}

/// Tracks a [`CancellationToken`] per in-flight request id so an external cancellation request
/// can reach a request's retrieval loop at its next suspension point (§4.G "Cancellation", §5).
#[derive(Default, Clone)]
pub struct CancellationRegistry {
	tokens: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl CancellationRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	fn register(&self, id: Uuid) -> CancellationToken {
		let token = CancellationToken::new();
		self.tokens.lock().unwrap().insert(id, token.clone());
		token
	}

	fn unregister(&self, id: Uuid) {
		self.tokens.lock().unwrap().remove(&id);
	}

	/// Best-effort cancellation of an in-process request (§4.G "Cancellation"). No-op if the
	/// request is not currently held by any worker.
	pub fn cancel(&self, id: Uuid) {
		if let Some(token) = self.tokens.lock().unwrap().get(&id) {
			token.cancel();
		}
	}
}

/// The Inference Request Worker pool (§4.G, §5 "task pool (default 1)").
pub struct WorkerPool<K: KvStore, C: PlatformClient, R: ResourceRetriever> {
	store: Arc<InferenceRequestStore<K>>,
	staging: Arc<StagingStore>,
	submitter: Arc<Submitter<C>>,
	retriever: Arc<R>,
	config: WorkerConfig,
	cancellations: CancellationRegistry,
}

impl<K, C, R> WorkerPool<K, C, R>
where
	K: KvStore + 'static,
	C: PlatformClient + Send + Sync + 'static,
	R: ResourceRetriever + 'static,
{
	pub fn new(
		store: Arc<InferenceRequestStore<K>>,
		staging: Arc<StagingStore>,
		submitter: Arc<Submitter<C>>,
		retriever: Arc<R>,
		config: WorkerConfig,
	) -> Self {
		Self {
			store,
			staging,
			submitter,
			retriever,
			config,
			cancellations: CancellationRegistry::new(),
		}
	}

	pub fn cancellations(&self) -> CancellationRegistry {
		self.cancellations.clone()
	}

	/// Spawns `worker.concurrency` claim-loop tasks. Each task owns one request end-to-end
	/// before claiming the next (§5).
	pub fn spawn(self: &Arc<Self>) {
		for index in 0..self.config.concurrency.max(1) {
			let pool = Arc::clone(self);
			tokio::spawn(async move { pool.run_claim_loop(index).await });
		}
	}

	async fn run_claim_loop(self: Arc<Self>, worker_index: usize) {
		loop {
			match self.store.claim_next().await {
				Ok(Some(request)) => {
					self.process(request).await;
				}
				Ok(None) => {
					tokio::time::sleep(Duration::from_millis(250)).await;
				}
				Err(err) => {
					error!(worker_index, "Failed to claim next inference request: {err}");
					tokio::time::sleep(Duration::from_secs(1)).await;
				}
			}
		}
	}

	#[instrument(skip_all, fields(inference_request_id = %request.inference_request_id))]
	async fn process(&self, mut request: InferenceRequest) {
		let token = self.cancellations.register(request.inference_request_id);

		if request.storage_path.is_none() {
			match self.staging.acquire(&request.inference_request_id.to_string()).await {
				Ok(handle) => request.storage_path = Some(handle.path().to_path_buf()),
				Err(err) => {
					error!("Failed to acquire staging directory: {err}");
					request.status = RequestStatus::Fail;
					request.state = RequestState::Completed;
					self.persist(&request);
					self.cancellations.unregister(request.inference_request_id);
					return;
				}
			}
		}
		let destination = request.storage_path.clone().expect("just set above");

		match self.retrieve_and_submit(&request, &destination, &token).await {
			Outcome::Success { job_id, payload_id } => {
				request.job_id = Some(job_id);
				request.payload_id = Some(payload_id);
				request.status = RequestStatus::Success;
				request.state = RequestState::Completed;
				info!("Inference request completed successfully");
			}
			Outcome::Transient(reason) => {
				request.try_count += 1;
				if request.try_count < self.config.max_retries {
					warn!(try_count = request.try_count, "Transient failure, re-queueing: {reason}");
					let backoff = Self::backoff(&self.config, request.try_count);
					request.state = RequestState::Queued;
					self.persist(&request);
					self.cancellations.unregister(request.inference_request_id);
					tokio::time::sleep(backoff).await;
					return;
				}
				warn!(try_count = request.try_count, "Exhausted retry budget: {reason}");
				request.status = RequestStatus::Fail;
				request.state = RequestState::Completed;
			}
			Outcome::Permanent(reason) => {
				warn!("Permanent failure: {reason}");
				request.status = RequestStatus::Fail;
				request.state = RequestState::Completed;
			}
			Outcome::Cancelled => {
				info!("Inference request cancelled");
				request.status = RequestStatus::Fail;
				request.state = RequestState::Completed;
			}
		}

		self.persist(&request);
		self.cancellations.unregister(request.inference_request_id);
	}

	fn persist(&self, request: &InferenceRequest) {
		if let Err(err) = self.store.update(request) {
			error!(
				inference_request_id = %request.inference_request_id,
				"Failed to persist inference request: {err}"
			);
		}
	}

	/// Retrieval (§4.G step 2-3) followed by submission (§4.G step 4), collapsed into the single
	/// transient/permanent/cancelled/success outcome the claim loop branches on.
	async fn retrieve_and_submit(
		&self,
		request: &InferenceRequest,
		destination: &Path,
		token: &CancellationToken,
	) -> Outcome {
		let selector = &request.input_metadata.details;
		let retrieval_timeout = Duration::from_millis(self.config.retrieval_timeout_ms);

		let mut total_instances = 0usize;
		for resource in request.data_source_resources() {
			if token.is_cancelled() {
				return Outcome::Cancelled;
			}

			let attempt = tokio::time::timeout(
				retrieval_timeout,
				self.retriever.retrieve(resource, selector, destination, token),
			)
			.await;

			let yielded = match attempt {
				Ok(Ok(outcome)) => {
					total_instances += outcome.instance_count;
					outcome.instance_count
				}
				Ok(Err(RetrievalError::Cancelled)) => return Outcome::Cancelled,
				Ok(Err(RetrievalError::Transient(reason))) => return Outcome::Transient(reason),
				Ok(Err(RetrievalError::Permanent(reason))) => return Outcome::Permanent(reason),
				Err(_elapsed) => {
					return Outcome::Transient(String::from("retrieval timed out"));
				}
			};

			// §4.G step 3: proceed to the next resource only if this one yielded an instance,
			// unless the called-AE config marks fallback.
			if yielded == 0 && !self.config.fallback_on_empty_resource {
				break;
			}
		}

		if total_instances == 0 {
			return Outcome::Permanent(String::from(
				"no instances were retrieved from any data-source resource",
			));
		}

		let Some(pipeline_id) = request.pipeline_id() else {
			return Outcome::Permanent(String::from("request has no usable Algorithm pipeline id"));
		};

		let mut metadata = HashMap::new();
		metadata.insert(String::from("transaction_id"), request.transaction_id.clone());
		metadata.insert(
			String::from("inference_request_id"),
			request.inference_request_id.to_string(),
		);

		let submission = JobSubmissionRequest {
			pipeline_id: pipeline_id.to_string(),
			name_base: pipeline_id.to_string(),
			priority: request.priority,
			metadata,
			payload_files: vec![destination.to_path_buf()],
		};

		match self.submitter.submit(submission).await {
			Ok(result) => Outcome::Success {
				job_id: result.job_id,
				payload_id: result.payload_id,
			},
			Err(SubmitError::Transient(reason)) => Outcome::Transient(reason.to_string()),
			Err(SubmitError::Permanent(reason)) => Outcome::Permanent(reason),
		}
	}

	/// Exponential backoff schedule per §7/§9: base, factor, capped.
	fn backoff(config: &WorkerConfig, try_count: u32) -> Duration {
		let base = Duration::from_millis(config.backoff_base_ms);
		let cap = Duration::from_millis(config.backoff_cap_ms);
		let exponent = try_count.saturating_sub(1).min(31);
		base.saturating_mul(config.backoff_factor.saturating_pow(exponent)).min(cap)
	}
}

enum Outcome {
	Success { job_id: String, payload_id: String },
	Transient(String),
	Permanent(String),
	Cancelled,
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kv::fake::FakeKvStore;
	use crate::platform::fake::FakePlatformClient;
	use crate::types::{
		ConnectionDetails, InputMetadata, InputMetadataDetails, InputMetadataType, InputResource,
		OutputResource, ResourceInterface,
	};
	use std::sync::atomic::{AtomicUsize, Ordering};

	struct FakeRetriever {
		instances_per_call: usize,
		transient_failures: AtomicUsize,
		/// Leading calls that yield zero instances before `instances_per_call` kicks in, for
		/// exercising the §4.G step 3 per-resource gate.
		empty_leading_calls: AtomicUsize,
		calls: AtomicUsize,
	}

	impl FakeRetriever {
		fn succeeding(instances_per_call: usize) -> Self {
			Self {
				instances_per_call,
				transient_failures: AtomicUsize::new(0),
				empty_leading_calls: AtomicUsize::new(0),
				calls: AtomicUsize::new(0),
			}
		}

		fn failing_n_times(instances_per_call: usize, n: usize) -> Self {
			Self {
				instances_per_call,
				transient_failures: AtomicUsize::new(n),
				empty_leading_calls: AtomicUsize::new(0),
				calls: AtomicUsize::new(0),
			}
		}

		fn empty_then_succeeding(instances_per_call: usize, empty_leading_calls: usize) -> Self {
			Self {
				instances_per_call,
				transient_failures: AtomicUsize::new(0),
				empty_leading_calls: AtomicUsize::new(empty_leading_calls),
				calls: AtomicUsize::new(0),
			}
		}
	}

	impl ResourceRetriever for FakeRetriever {
		async fn retrieve(
			&self,
			_resource: &InputResource,
			_selector: &InputMetadataDetails,
			_destination: &Path,
			_cancellation: &CancellationToken,
		) -> Result<RetrievalOutcome, RetrievalError> {
			self.calls.fetch_add(1, Ordering::SeqCst);
			if self
				.transient_failures
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 0).then_some(n - 1))
				.is_ok()
			{
				return Err(RetrievalError::Transient(String::from("simulated network blip")));
			}
			if self
				.empty_leading_calls
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > 0).then_some(n - 1))
				.is_ok()
			{
				return Ok(RetrievalOutcome {
					instance_count: 0,
					sop_instance_uids: Vec::new(),
				});
			}
			Ok(RetrievalOutcome {
				instance_count: self.instances_per_call,
				sop_instance_uids: vec![String::from("1.2.3")],
			})
		}
	}

	fn sample_request() -> InferenceRequest {
		InferenceRequest::new(crate::types::EnqueueInferenceRequest {
			transaction_id: String::from("txn-1"),
			priority: 200,
			input_metadata: InputMetadata {
				details: InputMetadataDetails {
					kind: Some(InputMetadataType::DicomUid),
					studies: Some(vec![String::from("1.2.3")]),
					..Default::default()
				},
			},
			input_resources: vec![
				InputResource {
					interface: ResourceInterface::Algorithm,
					connection_details: ConnectionDetails {
						pipeline_id: Some(String::from("pipeline-1")),
						..Default::default()
					},
				},
				InputResource {
					interface: ResourceInterface::Dimse,
					connection_details: ConnectionDetails {
						source_id: Some(String::from("src1")),
						..Default::default()
					},
				},
			],
			output_resources: Vec::<OutputResource>::new(),
		})
	}

	fn sample_request_two_resources() -> InferenceRequest {
		let mut request = sample_request();
		request.input_resources.push(InputResource {
			interface: ResourceInterface::Dimse,
			connection_details: ConnectionDetails {
				source_id: Some(String::from("src2")),
				..Default::default()
			},
		});
		request
	}

	async fn make_pool(
		retriever: FakeRetriever,
		transient_platform_failures: usize,
	) -> (Arc<WorkerPool<FakeKvStore, FakePlatformClient, FakeRetriever>>, tempfile::TempDir) {
		make_pool_with_fallback(retriever, transient_platform_failures, false).await
	}

	async fn make_pool_with_fallback(
		retriever: FakeRetriever,
		transient_platform_failures: usize,
		fallback_on_empty_resource: bool,
	) -> (Arc<WorkerPool<FakeKvStore, FakePlatformClient, FakeRetriever>>, tempfile::TempDir) {
		let tmp = tempfile::tempdir().unwrap();
		let staging = Arc::new(StagingStore::new(crate::config::StagingConfig {
			root: tmp.path().to_path_buf(),
			retention_hours: 24,
			high_water_bytes: u64::MAX,
		}));
		let store = Arc::new(InferenceRequestStore::new(FakeKvStore::new()));
		let submitter = Arc::new(Submitter::new(FakePlatformClient::new(transient_platform_failures), 64));
		let pool = Arc::new(WorkerPool::new(
			store,
			staging,
			submitter,
			Arc::new(retriever),
			WorkerConfig {
				concurrency: 1,
				max_retries: 3,
				backoff_base_ms: 1,
				backoff_factor: 2,
				backoff_cap_ms: 20,
				retrieval_timeout_ms: 5_000,
				fallback_on_empty_resource,
			},
		));
		(pool, tmp)
	}

	#[tokio::test]
	async fn round_trip_succeeds_and_sets_fields_once() {
		let (pool, _tmp) = make_pool(FakeRetriever::succeeding(2), 0).await;
		let request = pool.store.enqueue(crate::types::EnqueueInferenceRequest {
			transaction_id: sample_request().transaction_id,
			priority: sample_request().priority,
			input_metadata: sample_request().input_metadata,
			input_resources: sample_request().input_resources,
			output_resources: sample_request().output_resources,
		}).unwrap();

		let claimed = pool.store.claim_next().await.unwrap().unwrap();
		assert_eq!(claimed.inference_request_id, request.inference_request_id);
		pool.process(claimed).await;

		let reloaded = pool.store.get(request.inference_request_id).unwrap().unwrap();
		assert_eq!(reloaded.state, RequestState::Completed);
		assert_eq!(reloaded.status, RequestStatus::Success);
		assert!(reloaded.storage_path.is_some());
		assert!(reloaded.job_id.is_some());
	}

	#[tokio::test]
	async fn transient_submit_failure_retries_then_succeeds() {
		let (pool, _tmp) = make_pool(FakeRetriever::succeeding(1), 2).await;
		let request = pool.store.enqueue(crate::types::EnqueueInferenceRequest {
			transaction_id: String::from("txn-retry"),
			priority: 128,
			input_metadata: sample_request().input_metadata,
			input_resources: sample_request().input_resources,
			output_resources: sample_request().output_resources,
		}).unwrap();

		for _ in 0..3 {
			let claimed = pool.store.claim_next().await.unwrap();
			let Some(claimed) = claimed else { break };
			pool.process(claimed).await;
		}

		let reloaded = pool.store.get(request.inference_request_id).unwrap().unwrap();
		assert_eq!(reloaded.state, RequestState::Completed);
		assert_eq!(reloaded.status, RequestStatus::Success);
		assert_eq!(reloaded.try_count, 2);
	}

	#[tokio::test]
	async fn no_instances_retrieved_fails_permanently() {
		let (pool, _tmp) = make_pool(FakeRetriever::succeeding(0), 0).await;
		let request = pool.store.enqueue(crate::types::EnqueueInferenceRequest {
			transaction_id: String::from("txn-empty"),
			priority: 128,
			input_metadata: sample_request().input_metadata,
			input_resources: sample_request().input_resources,
			output_resources: sample_request().output_resources,
		}).unwrap();

		let claimed = pool.store.claim_next().await.unwrap().unwrap();
		pool.process(claimed).await;

		let reloaded = pool.store.get(request.inference_request_id).unwrap().unwrap();
		assert_eq!(reloaded.state, RequestState::Completed);
		assert_eq!(reloaded.status, RequestStatus::Fail);
		assert_eq!(reloaded.try_count, 0);
	}

	#[tokio::test]
	async fn empty_resource_without_fallback_skips_remaining_resources() {
		let retriever = FakeRetriever::empty_then_succeeding(1, 1);
		let (pool, _tmp) = make_pool_with_fallback(retriever, 0, false).await;
		let sample = sample_request_two_resources();
		let request = pool
			.store
			.enqueue(crate::types::EnqueueInferenceRequest {
				transaction_id: sample.transaction_id,
				priority: sample.priority,
				input_metadata: sample.input_metadata,
				input_resources: sample.input_resources,
				output_resources: sample.output_resources,
			})
			.unwrap();

		let claimed = pool.store.claim_next().await.unwrap().unwrap();
		pool.process(claimed).await;

		assert_eq!(pool.retriever.calls.load(Ordering::SeqCst), 1);
		let reloaded = pool.store.get(request.inference_request_id).unwrap().unwrap();
		assert_eq!(reloaded.state, RequestState::Completed);
		assert_eq!(reloaded.status, RequestStatus::Fail);
	}

	#[tokio::test]
	async fn empty_resource_with_fallback_tries_remaining_resources() {
		let retriever = FakeRetriever::empty_then_succeeding(1, 1);
		let (pool, _tmp) = make_pool_with_fallback(retriever, 0, true).await;
		let sample = sample_request_two_resources();
		let request = pool
			.store
			.enqueue(crate::types::EnqueueInferenceRequest {
				transaction_id: sample.transaction_id,
				priority: sample.priority,
				input_metadata: sample.input_metadata,
				input_resources: sample.input_resources,
				output_resources: sample.output_resources,
			})
			.unwrap();

		let claimed = pool.store.claim_next().await.unwrap().unwrap();
		pool.process(claimed).await;

		assert_eq!(pool.retriever.calls.load(Ordering::SeqCst), 2);
		let reloaded = pool.store.get(request.inference_request_id).unwrap().unwrap();
		assert_eq!(reloaded.state, RequestState::Completed);
		assert_eq!(reloaded.status, RequestStatus::Success);
	}

	#[tokio::test]
	async fn exhausting_retry_budget_fails_terminally() {
		let (pool, _tmp) = make_pool(FakeRetriever::failing_n_times(1, 10), 0).await;
		let request = pool.store.enqueue(crate::types::EnqueueInferenceRequest {
			transaction_id: String::from("txn-exhaust"),
			priority: 128,
			input_metadata: sample_request().input_metadata,
			input_resources: sample_request().input_resources,
			output_resources: sample_request().output_resources,
		}).unwrap();

		loop {
			let Some(claimed) = pool.store.claim_next().await.unwrap() else {
				break;
			};
			pool.process(claimed).await;
		}

		let reloaded = pool.store.get(request.inference_request_id).unwrap().unwrap();
		assert_eq!(reloaded.state, RequestState::Completed);
		assert_eq!(reloaded.status, RequestStatus::Fail);
		assert_eq!(reloaded.try_count, 3);
	}
}
