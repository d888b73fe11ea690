//! `PlatformClient` (§6 "Platform client"): the adapter's only outbound dependency on the
//! external inference platform. The core never talks to the platform directly — it only ever
//! goes through this trait, so the adapter's own tests can substitute [`FakePlatformClient`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::JobPriority;

#[derive(Debug, Clone)]
pub struct CreatedJob {
	pub job_id: String,
	pub payload_id: String,
}

#[derive(Debug, Error)]
pub enum PlatformError {
	#[error("platform request timed out or the platform returned a server error: {0}")]
	Transient(String),
	#[error("the platform rejected the request: {0}")]
	Permanent(String),
}

/// Outbound calls the Job Submitter makes against the external inference platform.
/// Implementations are responsible for distinguishing transient (5xx, timeout) from permanent
/// (4xx, malformed reply) failures, per §7.
pub trait PlatformClient: Send + Sync {
	fn create_job(
		&self,
		pipeline_id: &str,
		job_name: &str,
		priority: JobPriority,
		metadata: &HashMap<String, String>,
	) -> impl std::future::Future<Output = Result<CreatedJob, PlatformError>> + Send;

	fn upload_payload(
		&self,
		payload_id: &str,
		files: &[PathBuf],
	) -> impl std::future::Future<Output = Result<(), PlatformError>> + Send;

	fn start_job(
		&self,
		job_id: &str,
	) -> impl std::future::Future<Output = Result<(), PlatformError>> + Send;
}

/// HTTP implementation of [`PlatformClient`], grounded on the adapter's own outbound reqwest use.
pub struct HttpPlatformClient {
	client: reqwest::Client,
	base_url: url::Url,
}

impl HttpPlatformClient {
	pub fn new(base_url: url::Url, timeout: Duration) -> Result<Self, reqwest::Error> {
		let client = reqwest::Client::builder().timeout(timeout).build()?;
		Ok(Self { client, base_url })
	}

	fn categorize(status: reqwest::StatusCode, body: String) -> PlatformError {
		if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
			PlatformError::Transient(format!("{status}: {body}"))
		} else {
			PlatformError::Permanent(format!("{status}: {body}"))
		}
	}
}

#[derive(serde::Serialize)]
struct CreateJobRequest<'a> {
	pipeline_id: &'a str,
	job_name: &'a str,
	priority: JobPriority,
	metadata: &'a HashMap<String, String>,
}

#[derive(serde::Deserialize)]
struct CreateJobResponse {
	job_id: String,
	payload_id: String,
}

impl PlatformClient for HttpPlatformClient {
	async fn create_job(
		&self,
		pipeline_id: &str,
		job_name: &str,
		priority: JobPriority,
		metadata: &HashMap<String, String>,
	) -> Result<CreatedJob, PlatformError> {
		let url = self
			.base_url
			.join("jobs")
			.map_err(|err| PlatformError::Permanent(err.to_string()))?;

		let response = self
			.client
			.post(url)
			.json(&CreateJobRequest {
				pipeline_id,
				job_name,
				priority,
				metadata,
			})
			.send()
			.await
			.map_err(|err| PlatformError::Transient(err.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(Self::categorize(status, body));
		}

		let parsed: CreateJobResponse = response
			.json()
			.await
			.map_err(|err| PlatformError::Permanent(err.to_string()))?;

		Ok(CreatedJob {
			job_id: parsed.job_id,
			payload_id: parsed.payload_id,
		})
	}

	async fn upload_payload(
		&self,
		payload_id: &str,
		files: &[PathBuf],
	) -> Result<(), PlatformError> {
		let url = self
			.base_url
			.join(&format!("payloads/{payload_id}"))
			.map_err(|err| PlatformError::Permanent(err.to_string()))?;

		let mut form = reqwest::multipart::Form::new();
		for file in files {
			let bytes = tokio::fs::read(file)
				.await
				.map_err(|err| PlatformError::Transient(err.to_string()))?;
			let file_name = file
				.file_name()
				.and_then(|name| name.to_str())
				.unwrap_or("file.dcm")
				.to_string();
			form = form.part(file_name.clone(), reqwest::multipart::Part::bytes(bytes).file_name(file_name));
		}

		let response = self
			.client
			.post(url)
			.multipart(form)
			.send()
			.await
			.map_err(|err| PlatformError::Transient(err.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(Self::categorize(status, body));
		}
		Ok(())
	}

	async fn start_job(&self, job_id: &str) -> Result<(), PlatformError> {
		let url = self
			.base_url
			.join(&format!("jobs/{job_id}/start"))
			.map_err(|err| PlatformError::Permanent(err.to_string()))?;

		let response = self
			.client
			.post(url)
			.send()
			.await
			.map_err(|err| PlatformError::Transient(err.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_default();
			return Err(Self::categorize(status, body));
		}
		Ok(())
	}
}

/// In-memory fake used by the core's own tests (§8 scenarios 5 and 6).
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
	use super::{CreatedJob, PlatformClient, PlatformError};
	use crate::types::JobPriority;
	use std::collections::HashMap;
	use std::path::PathBuf;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::sync::Mutex;

	/// A fake platform that can be scripted to fail N times before succeeding, to exercise the
	/// Worker's and Grouping Engine's retry/backoff paths (§8 scenario 6).
	pub struct FakePlatformClient {
		transient_failures_remaining: AtomicUsize,
		pub created_jobs: Mutex<Vec<(String, String, JobPriority)>>,
		pub uploaded: Mutex<Vec<(String, Vec<PathBuf>)>>,
		pub started: Mutex<Vec<String>>,
		next_id: AtomicUsize,
	}

	impl FakePlatformClient {
		pub fn new(transient_failures: usize) -> Self {
			Self {
				transient_failures_remaining: AtomicUsize::new(transient_failures),
				created_jobs: Mutex::new(Vec::new()),
				uploaded: Mutex::new(Vec::new()),
				started: Mutex::new(Vec::new()),
				next_id: AtomicUsize::new(1),
			}
		}
	}

	impl PlatformClient for FakePlatformClient {
		async fn create_job(
			&self,
			pipeline_id: &str,
			job_name: &str,
			priority: JobPriority,
			_metadata: &HashMap<String, String>,
		) -> Result<CreatedJob, PlatformError> {
			if self
				.transient_failures_remaining
				.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
					if n > 0 {
						Some(n - 1)
					} else {
						None
					}
				})
				.is_ok()
			{
				return Err(PlatformError::Transient(String::from("simulated 5xx")));
			}

			let id = self.next_id.fetch_add(1, Ordering::SeqCst);
			self.created_jobs
				.lock()
				.unwrap()
				.push((pipeline_id.to_string(), job_name.to_string(), priority));
			Ok(CreatedJob {
				job_id: format!("job-{id}"),
				payload_id: format!("payload-{id}"),
			})
		}

		async fn upload_payload(
			&self,
			payload_id: &str,
			files: &[PathBuf],
		) -> Result<(), PlatformError> {
			self.uploaded
				.lock()
				.unwrap()
				.push((payload_id.to_string(), files.to_vec()));
			Ok(())
		}

		async fn start_job(&self, job_id: &str) -> Result<(), PlatformError> {
			self.started.lock().unwrap().push(job_id.to_string());
			Ok(())
		}
	}
}
