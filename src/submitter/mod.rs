//! Job Submitter (§4.H): priority mapping, job naming, and the single call path into the
//! external platform shared by the Grouping Engine and the Inference Request Worker.

use crate::platform::{PlatformClient, PlatformError};
use crate::types::JobPriority;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Debug, Error)]
pub enum SubmitError {
	#[error(transparent)]
	Transient(#[from] TransientSubmitError),
	#[error("{0}")]
	Permanent(String),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TransientSubmitError(pub String);

impl From<PlatformError> for SubmitError {
	fn from(err: PlatformError) -> Self {
		match err {
			PlatformError::Transient(msg) => Self::Transient(TransientSubmitError(msg)),
			PlatformError::Permanent(msg) => Self::Permanent(msg),
		}
	}
}

#[derive(Debug, Clone)]
pub struct JobSubmissionRequest {
	pub pipeline_id: String,
	/// Basis for the derived job name — the algorithm name for Worker-driven jobs, the pipeline
	/// id for Grouping-Engine-driven jobs.
	pub name_base: String,
	pub priority: u8,
	pub metadata: HashMap<String, String>,
	pub payload_files: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct JobSubmissionResult {
	pub job_id: String,
	pub payload_id: String,
}

pub struct Submitter<C: PlatformClient> {
	pub(crate) client: C,
	max_job_name_len: usize,
}

impl<C: PlatformClient> Submitter<C> {
	pub const fn new(client: C, max_job_name_len: usize) -> Self {
		Self {
			client,
			max_job_name_len,
		}
	}

	/// Maps a byte priority to the platform's job priority, per §4.H. Total over all 256 values.
	pub fn map_priority(priority: u8) -> JobPriority {
		JobPriority::from(priority)
	}

	/// Derives `"{name_base}-{DD-HHMMSS}"` in UTC, sanitized to `[A-Za-z0-9_-]` and truncated.
	pub fn job_name(&self, name_base: &str) -> String {
		let timestamp = Utc::now().format("%d-%H%M%S");
		let raw = format!("{name_base}-{timestamp}");
		let sanitized: String = raw
			.chars()
			.map(|c| {
				if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
					c
				} else {
					'_'
				}
			})
			.collect();
		sanitized.chars().take(self.max_job_name_len).collect()
	}

	#[instrument(skip_all, fields(pipeline_id = %request.pipeline_id))]
	pub async fn submit(
		&self,
		request: JobSubmissionRequest,
	) -> Result<JobSubmissionResult, SubmitError> {
		let priority = Self::map_priority(request.priority);
		let job_name = self.job_name(&request.name_base);

		let created = self
			.client
			.create_job(&request.pipeline_id, &job_name, priority, &request.metadata)
			.await?;

		self.client
			.upload_payload(&created.payload_id, &request.payload_files)
			.await?;

		self.client.start_job(&created.job_id).await?;

		info!(job_id = created.job_id, job_name, "Submitted job");

		Ok(JobSubmissionResult {
			job_id: created.job_id,
			payload_id: created.payload_id,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::platform::fake::FakePlatformClient;

	#[test]
	fn priority_mapping_is_total_and_matches_table() {
		for priority in 0u8..=255 {
			let mapped = Submitter::<FakePlatformClient>::map_priority(priority);
			let expected = match priority {
				0..=127 => JobPriority::Lower,
				128 => JobPriority::Normal,
				129..=254 => JobPriority::Higher,
				255 => JobPriority::Immediate,
			};
			assert_eq!(mapped, expected, "priority byte {priority}");
		}
	}

	#[test]
	fn job_name_is_sanitized_and_truncated() {
		let submitter = Submitter::new(FakePlatformClient::new(0), 12);
		let name = submitter.job_name("algo name!!");
		assert!(name.len() <= 12);
		assert!(name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
	}

	#[tokio::test]
	async fn submit_calls_platform_in_order() {
		let submitter = Submitter::new(FakePlatformClient::new(0), 64);
		let result = submitter
			.submit(JobSubmissionRequest {
				pipeline_id: String::from("pipeline-1"),
				name_base: String::from("algo"),
				priority: 200,
				metadata: HashMap::new(),
				payload_files: vec![],
			})
			.await
			.unwrap();

		assert_eq!(result.job_id, "job-1");
		assert_eq!(submitter.client.started.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn transient_platform_failure_surfaces_as_transient() {
		let submitter = Submitter::new(FakePlatformClient::new(1), 64);
		let err = submitter
			.submit(JobSubmissionRequest {
				pipeline_id: String::from("pipeline-1"),
				name_base: String::from("algo"),
				priority: 128,
				metadata: HashMap::new(),
				payload_files: vec![],
			})
			.await
			.unwrap_err();
		assert!(matches!(err, SubmitError::Transient(_)));
	}
}
