//! Grouping Engine (§4.E): buckets stored instances into jobs by a configurable grouping key
//! and a sliding quiet-period timer.
//!
//! Concurrency follows §5 and the "grouping timers" design note (§9): the bucket table is
//! sharded so that distinct keys proceed in parallel while a single key serializes; a single
//! dedicated scheduler task owns the timer wheel ([`tokio_util::time::DelayQueue`]) so that a
//! sliding-reset key never allocates a second timer, and timer callbacks never run under the
//! bucket table lock — they only enqueue close-work onto a bounded channel.

use crate::config::CalledAeConfig;
use crate::notifier::{Observer, ObserverError};
use crate::submitter::{JobSubmissionRequest, SubmitError, Submitter};
use crate::platform::PlatformClient;
use crate::types::{GroupingKey, GroupingKeyKind, Instance};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{error, info, warn};
use uuid::Uuid;

const SHARD_COUNT: usize = 16;
const CLOSE_CHANNEL_CAPACITY: usize = 256;
const CLOSE_WORKER_COUNT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketState {
	Open,
	Closing,
}

#[derive(Debug, Clone)]
pub struct Bucket {
	pub key: GroupingKey,
	pub created_at: Instant,
	pub last_instance_at: Instant,
	/// Ordered by receive order; deduplicated by `sop_instance_uid`.
	pub instances: Vec<Instance>,
	pub state: BucketState,
	pub pipeline_ids: Vec<String>,
	pub priority: u8,
}

impl Bucket {
	fn upsert_instance(&mut self, instance: Instance) {
		self.last_instance_at = Instant::now();
		if !self
			.instances
			.iter()
			.any(|existing| existing.sop_instance_uid == instance.sop_instance_uid)
		{
			self.instances.push(instance);
		}
	}
}

struct BucketEntry {
	bucket: Bucket,
}

type Shard = Mutex<HashMap<GroupingKey, BucketEntry>>;

enum TimerCommand {
	Arm {
		key: GroupingKey,
		deadline: Instant,
	},
	Reset {
		key: GroupingKey,
		deadline: Instant,
	},
}

struct CloseWork {
	key: GroupingKey,
}

pub struct GroupingEngine {
	shards: Arc<Vec<Shard>>,
	timer_tx: mpsc::UnboundedSender<TimerCommand>,
}

impl GroupingEngine {
	pub fn new<C>(submitter: Arc<Submitter<C>>) -> Self
	where
		C: PlatformClient + Send + Sync + 'static,
	{
		let shards: Arc<Vec<Shard>> = Arc::new((0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect());
		let (timer_tx, timer_rx) = mpsc::unbounded_channel();
		let (close_tx, close_rx) = mpsc::channel(CLOSE_CHANNEL_CAPACITY);

		tokio::spawn(Self::run_scheduler(timer_rx, close_tx));

		let close_rx = Arc::new(Mutex::new(close_rx));
		for _ in 0..CLOSE_WORKER_COUNT {
			tokio::spawn(Self::run_close_worker(
				Arc::clone(&shards),
				Arc::clone(&close_rx),
				Arc::clone(&submitter),
			));
		}

		Self { shards, timer_tx }
	}

	/// Computes the grouping key for an instance under the given called-AE configuration,
	/// per §4.E's key variants.
	pub fn compute_key(config: &CalledAeConfig, instance: &Instance) -> GroupingKey {
		match config.grouping_key {
			GroupingKeyKind::None => GroupingKey::PerInstance(Uuid::new_v4()),
			GroupingKeyKind::PatientId => GroupingKey::PatientId {
				called_ae: instance.called_ae.clone(),
				patient_id: instance.patient_id.clone(),
			},
			GroupingKeyKind::StudyInstanceUid => GroupingKey::StudyInstanceUid {
				called_ae: instance.called_ae.clone(),
				study_instance_uid: instance.study_instance_uid.clone(),
			},
			GroupingKeyKind::CallingAet => GroupingKey::CallingAet {
				called_ae: instance.called_ae.clone(),
				calling_ae: instance.calling_ae.clone(),
			},
		}
	}

	fn shard_for(&self, key: &GroupingKey) -> &Shard {
		let mut hasher = std::collections::hash_map::DefaultHasher::new();
		key.hash(&mut hasher);
		let index = (hasher.finish() as usize) % self.shards.len();
		&self.shards[index]
	}

	/// Handles one Instance event, per §4.E steps 1-5.
	pub async fn on_instance(&self, config: &CalledAeConfig, instance: Instance) {
		let key = Self::compute_key(config, &instance);
		let timeout = Duration::from_millis(config.timeout_ms);
		let max_age = Duration::from_millis(config.max_age_ms);

		let shard = self.shard_for(&key);
		let mut table = shard.lock().await;

		match table.get_mut(&key) {
			Some(entry) => {
				entry.bucket.upsert_instance(instance);
				let deadline = Self::next_deadline(entry.bucket.created_at, timeout, max_age);
				let _ = self.timer_tx.send(TimerCommand::Reset {
					key: key.clone(),
					deadline,
				});
			}
			None => {
				let now = Instant::now();
				let mut bucket = Bucket {
					key: key.clone(),
					created_at: now,
					last_instance_at: now,
					instances: Vec::new(),
					state: BucketState::Open,
					pipeline_ids: config.pipeline_ids.clone(),
					priority: config.priority,
				};
				bucket.upsert_instance(instance);

				let deadline = Self::next_deadline(now, timeout, max_age);
				table.insert(key.clone(), BucketEntry { bucket });
				let _ = self.timer_tx.send(TimerCommand::Arm { key, deadline });
			}
		}
	}

	/// Computes the next sliding-reset deadline, bounded by `max_age` from `created_at` so a
	/// single timer entry also enforces the bound in step 5 without a second timer.
	fn next_deadline(created_at: Instant, timeout: Duration, max_age: Duration) -> Instant {
		let slide = Instant::now() + timeout;
		let bound = created_at + max_age;
		slide.min(bound)
	}

	async fn run_scheduler(
		mut commands: mpsc::UnboundedReceiver<TimerCommand>,
		close_tx: mpsc::Sender<CloseWork>,
	) {
		let mut queue: DelayQueue<GroupingKey> = DelayQueue::new();
		let mut handles: HashMap<GroupingKey, delay_queue::Key> = HashMap::new();

		loop {
			tokio::select! {
				command = commands.recv() => {
					match command {
						Some(TimerCommand::Arm { key, deadline }) => {
							let duration = deadline.saturating_duration_since(Instant::now());
							let handle = queue.insert(key.clone(), duration);
							handles.insert(key, handle);
						}
						Some(TimerCommand::Reset { key, deadline }) => {
							let duration = deadline.saturating_duration_since(Instant::now());
							if let Some(handle) = handles.get(&key) {
								queue.reset(handle, duration);
							} else {
								let handle = queue.insert(key.clone(), duration);
								handles.insert(key, handle);
							}
						}
						None => return,
					}
				}
				Some(expired) = futures::StreamExt::next(&mut queue) => {
					let key = expired.into_inner();
					handles.remove(&key);
					if close_tx.send(CloseWork { key }).await.is_err() {
						error!("Close-work channel closed; grouping engine scheduler shutting down");
						return;
					}
				}
			}
		}
	}

	async fn run_close_worker<C>(
		shards: Arc<Vec<Shard>>,
		close_rx: Arc<Mutex<mpsc::Receiver<CloseWork>>>,
		submitter: Arc<Submitter<C>>,
	) where
		C: PlatformClient + Send + Sync + 'static,
	{
		loop {
			let work = {
				let mut rx = close_rx.lock().await;
				rx.recv().await
			};
			let Some(work) = work else {
				return;
			};

			let mut hasher = std::collections::hash_map::DefaultHasher::new();
			work.key.hash(&mut hasher);
			let index = (hasher.finish() as usize) % shards.len();
			let entry = { shards[index].lock().await.remove(&work.key) };

			let Some(BucketEntry { mut bucket, .. }) = entry else {
				continue;
			};
			bucket.state = BucketState::Closing;

			// §8: manifest lists instances in receive order, ties broken by sop_instance_uid.
			bucket.instances.sort_by(|a, b| {
				a.received_at
					.cmp(&b.received_at)
					.then_with(|| a.sop_instance_uid.cmp(&b.sop_instance_uid))
			});

			Self::close_bucket(&bucket, &submitter).await;
		}
	}

	async fn close_bucket<C>(bucket: &Bucket, submitter: &Submitter<C>)
	where
		C: PlatformClient + Send + Sync + 'static,
	{
		let manifest: Vec<_> = bucket
			.instances
			.iter()
			.map(|instance| instance.file_path.clone())
			.collect();

		let mut metadata = HashMap::new();
		if let Some(first) = bucket.instances.first() {
			metadata.insert(String::from("patient_id"), first.patient_id.clone());
			metadata.insert(String::from("study_uid"), first.study_instance_uid.clone());
		}
		metadata.insert(
			String::from("instance_count"),
			bucket.instances.len().to_string(),
		);

		for pipeline_id in &bucket.pipeline_ids {
			let request = JobSubmissionRequest {
				pipeline_id: pipeline_id.clone(),
				name_base: pipeline_id.clone(),
				priority: bucket.priority,
				metadata: metadata.clone(),
				payload_files: manifest.clone(),
			};

			match Self::submit_with_retry(submitter, request).await {
				Ok(result) => {
					info!(
						pipeline_id,
						job_id = result.job_id,
						instance_count = bucket.instances.len(),
						"Closed bucket and submitted job"
					);
				}
				Err(err) => {
					error!(pipeline_id, "Bucket submission failed permanently: {err}");
				}
			}
		}
	}

	/// Retries a transient submission failure with exponential backoff (base 1s, factor 2,
	/// cap 60s, max 5 attempts), per §4.E step 3.
	async fn submit_with_retry<C>(
		submitter: &Submitter<C>,
		request: JobSubmissionRequest,
	) -> Result<crate::submitter::JobSubmissionResult, SubmitError>
	where
		C: PlatformClient + Send + Sync + 'static,
	{
		const MAX_ATTEMPTS: u32 = 5;
		const BASE: Duration = Duration::from_secs(1);
		const CAP: Duration = Duration::from_secs(60);

		let mut attempt = 0;
		loop {
			match submitter.submit(request.clone()).await {
				Ok(result) => return Ok(result),
				Err(SubmitError::Transient(err)) => {
					attempt += 1;
					if attempt >= MAX_ATTEMPTS {
						return Err(SubmitError::Transient(err));
					}
					let backoff = BASE.saturating_mul(1 << (attempt - 1)).min(CAP);
					warn!(attempt, ?backoff, "Retrying job submission after transient failure");
					tokio::time::sleep(backoff).await;
				}
				Err(err @ SubmitError::Permanent(_)) => return Err(err),
			}
		}
	}
}

/// Adapts the Grouping Engine as a Notifier observer: enqueues onto its own task rather than
/// performing I/O inline, per the "pub/sub over observers" design note (§9).
pub struct GroupingObserver<C: PlatformClient + Send + Sync + 'static> {
	engine: Arc<GroupingEngine>,
	config: Arc<CalledAeConfig>,
	_marker: std::marker::PhantomData<C>,
}

impl<C: PlatformClient + Send + Sync + 'static> GroupingObserver<C> {
	pub fn new(engine: Arc<GroupingEngine>, config: Arc<CalledAeConfig>) -> Self {
		Self {
			engine,
			config,
			_marker: std::marker::PhantomData,
		}
	}
}

impl<C: PlatformClient + Send + Sync + 'static> Observer for GroupingObserver<C> {
	async fn notify(&self, instance: &Instance) -> Result<(), ObserverError> {
		if instance.called_ae == self.config.aet {
			self.engine.on_instance(&self.config, instance.clone()).await;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::platform::fake::FakePlatformClient;

	fn sample_config(pipelines: Vec<&str>) -> CalledAeConfig {
		CalledAeConfig {
			aet: String::from("CLARA1"),
			grouping_key: GroupingKeyKind::StudyInstanceUid,
			timeout_ms: 50,
			max_age_ms: 5_000,
			allowed_sops: vec![],
			allowed_sources: vec![],
			pipeline_ids: pipelines.into_iter().map(String::from).collect(),
			priority: 128,
		}
	}

	fn sample_instance(sop: &str, study: &str) -> Instance {
		Instance {
			sop_instance_uid: sop.to_string(),
			series_instance_uid: String::from("1.2.3.4"),
			study_instance_uid: study.to_string(),
			patient_id: String::from("P1"),
			called_ae: String::from("CLARA1"),
			calling_ae: String::from("PACS1"),
			received_at: chrono::Utc::now(),
			file_path: std::path::PathBuf::from(format!("/tmp/{sop}.dcm")),
			transfer_syntax: String::from("1.2.840.10008.1.2.1"),
		}
	}

	#[tokio::test]
	async fn single_bucket_closes_once_quiet_period_elapses() {
		let submitter = Arc::new(Submitter::new(FakePlatformClient::new(0), 64));
		let engine = GroupingEngine::new(Arc::clone(&submitter));
		let config = sample_config(vec!["pipeline-1"]);

		engine.on_instance(&config, sample_instance("1", "study-1")).await;
		engine.on_instance(&config, sample_instance("2", "study-1")).await;

		tokio::time::sleep(Duration::from_millis(300)).await;

		let created = submitter.client.created_jobs.lock().unwrap();
		assert_eq!(created.len(), 1);
	}

	#[tokio::test]
	async fn distinct_study_uids_close_into_distinct_buckets() {
		let submitter = Arc::new(Submitter::new(FakePlatformClient::new(0), 64));
		let engine = GroupingEngine::new(Arc::clone(&submitter));
		let config = sample_config(vec!["pipeline-1"]);

		engine.on_instance(&config, sample_instance("1", "study-1")).await;
		engine.on_instance(&config, sample_instance("2", "study-2")).await;

		tokio::time::sleep(Duration::from_millis(300)).await;

		let created = submitter.client.created_jobs.lock().unwrap();
		assert_eq!(created.len(), 2);
	}
}
