//! DICOM Retrieval Client (§4.I): outbound DICOM operations driven by the Inference Request
//! Worker (§4.G step 2). Given a resource descriptor and a metadata selector, deposits files into
//! a caller-provided directory and returns the count and per-instance identifiers. Retries at the
//! DIMSE level are internal to the client; the Worker only ever sees a transient/permanent split.

use crate::config::RetrievalConfig;
use crate::dimse::association::pool::AssociationPool;
use crate::dimse::cfind::findscu::{FindError, FindServiceClassUser, FindServiceClassUserOptions};
use crate::dimse::cmove::movescu::{MoveError, MoveServiceClassUser};
use crate::dimse::cmove::{CompositeMoveRequest, MoveMediator, MoveSubOperation, MoveTask, TaskKey};
use crate::dimse::{association, next_message_id};
use crate::types::{ConnectionDetails, InputMetadataDetails, Priority, QueryInformationModel, QueryRetrieveLevel, UI};
use bytes::Bytes;
use dicom::core::VR;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use futures::StreamExt;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

#[derive(Debug, Error)]
pub enum RetrievalError {
	#[error("transient retrieval failure: {0}")]
	Transient(String),
	#[error("permanent retrieval failure: {0}")]
	Permanent(String),
	#[error("retrieval was cancelled")]
	Cancelled,
}

impl From<FindError> for RetrievalError {
	fn from(err: FindError) -> Self {
		Self::Transient(err.to_string())
	}
}

impl From<MoveError> for RetrievalError {
	fn from(err: MoveError) -> Self {
		match err {
			MoveError::Cancelled => Self::Cancelled,
			other => Self::Transient(other.to_string()),
		}
	}
}

#[derive(Debug, Clone)]
pub struct RetrievalOutcome {
	pub instance_count: usize,
	pub sop_instance_uids: Vec<UI>,
}

/// One `inputResources[]` entry's data, already split from its sibling `connectionDetails` and
/// the request-wide `inputMetadata.details` selector (§4.G step 2).
pub enum ResourceDescriptor<'a> {
	DimseQueryRetrieve {
		source_id: &'a str,
		called_ae: Option<&'a str>,
	},
	DicomWeb {
		details: &'a ConnectionDetails,
	},
}

/// Retrieves instances described by `descriptor`/`selector` into `destination`, per §4.I's
/// unchanged contract.
pub trait RetrievalClient: Send + Sync {
	fn retrieve(
		&self,
		descriptor: &ResourceDescriptor<'_>,
		selector: &InputMetadataDetails,
		destination: &Path,
		cancellation: &CancellationToken,
	) -> impl std::future::Future<Output = Result<RetrievalOutcome, RetrievalError>> + Send;
}

/// DIMSE implementation: C-FIND per metadata selector (when the selector isn't already a set of
/// study UIDs), then C-MOVE into `destination` via the adapter's own retrieval-push SCP, per
/// §4.I's first bullet.
pub struct DimseRetrievalClient {
	pools: association::pool::AssociationPools,
	mediator: Arc<MoveMediator>,
	move_destination_aet: String,
	calling_aet: String,
	find_timeout: Duration,
	move_timeout: Duration,
}

impl DimseRetrievalClient {
	pub fn new(
		pools: association::pool::AssociationPools,
		mediator: Arc<MoveMediator>,
		config: &RetrievalConfig,
		calling_aet: String,
		find_timeout: Duration,
		move_timeout: Duration,
	) -> Self {
		Self {
			pools,
			mediator,
			move_destination_aet: config
				.move_destination_aet
				.clone()
				.unwrap_or_else(|| calling_aet.clone()),
			calling_aet,
			find_timeout,
			move_timeout,
		}
	}

	fn pool(&self, source_id: &str) -> Result<AssociationPool, RetrievalError> {
		self.pools
			.get(source_id)
			.cloned()
			.ok_or_else(|| RetrievalError::Permanent(format!("unknown DIMSE source '{source_id}'")))
	}

	/// Resolves the set of `StudyInstanceUID`s matching `selector` — directly, for the `DicomUid`
	/// selector, or via a Study-level C-FIND for `DicomPatientId`/`AccessionNumber` (§4.G step 2).
	async fn resolve_study_uids(
		&self,
		pool: AssociationPool,
		selector: &InputMetadataDetails,
	) -> Result<Vec<UI>, RetrievalError> {
		if let Some(studies) = &selector.studies {
			if !studies.is_empty() {
				return Ok(studies.clone());
			}
		}

		let mut identifier = InMemDicomObject::new_empty();
		identifier.put_str(
			tags::QUERY_RETRIEVE_LEVEL,
			VR::CS,
			QueryRetrieveLevel::Study.to_string(),
		);
		identifier.put_str(tags::STUDY_INSTANCE_UID, VR::UI, "");

		if let Some(patient_id) = &selector.patient_id {
			identifier.put_str(tags::PATIENT_ID, VR::LO, patient_id.clone());
		} else if let Some(accessions) = &selector.accession_numbers {
			let joined = accessions.join("\\");
			identifier.put_str(tags::ACCESSION_NUMBER, VR::SH, joined);
		} else {
			return Err(RetrievalError::Permanent(String::from(
				"inputMetadata selector has no studies, patientId, or accessionNumbers",
			)));
		}

		let findscu = FindServiceClassUser::new(pool, self.find_timeout);
		let options = FindServiceClassUserOptions {
			query_information_model: QueryInformationModel::Study,
			identifier,
			message_id: next_message_id(),
			priority: Priority::Medium,
		};

		let mut uids = Vec::new();
		let mut stream = std::pin::pin!(findscu.invoke(options));
		while let Some(result) = stream.next().await {
			let dataset = result?;
			if let Some(uid) = dataset
				.get(tags::STUDY_INSTANCE_UID)
				.map(InMemElement::to_str)
				.and_then(Result::ok)
			{
				let uid = uid.trim_end_matches('\0').to_string();
				if !uids.contains(&uid) {
					uids.push(uid);
				}
			}
		}
		Ok(uids)
	}

	/// Issues one C-MOVE for `study_instance_uid`, collecting every pushed instance into
	/// `destination` while the move is in flight.
	async fn move_study(
		&self,
		pool: AssociationPool,
		originator_aet: &str,
		study_instance_uid: &str,
		destination: &Path,
		cancellation: &CancellationToken,
	) -> Result<Vec<UI>, RetrievalError> {
		let message_id = next_message_id();
		let (tx, mut rx) = mpsc::channel::<Result<MoveSubOperation, MoveError>>(16);
		let key = TaskKey::new(originator_aet.to_string(), Some(message_id));
		self.mediator.add(MoveTask::new(key.clone(), tx.clone()));

		let mut identifier = InMemDicomObject::new_empty();
		identifier.put_str(
			tags::QUERY_RETRIEVE_LEVEL,
			VR::CS,
			QueryRetrieveLevel::Study.to_string(),
		);
		identifier.put_str(tags::STUDY_INSTANCE_UID, VR::UI, study_instance_uid);

		let movescu = MoveServiceClassUser::new(pool, self.move_timeout);
		let request = CompositeMoveRequest {
			identifier,
			message_id,
			priority: Priority::Medium as crate::types::US,
			destination: self.move_destination_aet.clone(),
		};

		let invocation = tokio::spawn(async move {
			let outcome = movescu.invoke(request).await;
			let _ = tx.send(outcome.map(|()| MoveSubOperation::Completed)).await;
		});

		let mut uids = Vec::new();
		let result = loop {
			tokio::select! {
				biased;
				() = cancellation.cancelled() => {
					break Err(RetrievalError::Cancelled);
				}
				message = rx.recv() => {
					match message {
						Some(Ok(MoveSubOperation::Pending(file))) => {
							let sop_instance_uid = file
								.meta()
								.media_storage_sop_instance_uid
								.trim_end_matches('\0')
								.to_string();
							let path = destination.join(format!("{sop_instance_uid}.dcm"));
							let write_result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
								let mut handle = std::fs::File::create(&path)?;
								file.write_all(&mut handle)
									.map_err(|err| std::io::Error::other(err.to_string()))
							})
							.await;
							match write_result {
								Ok(Ok(())) => uids.push(sop_instance_uid),
								Ok(Err(err)) => {
									warn!("Failed to write retrieved instance {sop_instance_uid}: {err}");
								}
								Err(err) => {
									warn!("Write task for {sop_instance_uid} panicked: {err}");
								}
							}
						}
						Some(Ok(MoveSubOperation::Completed)) => break Ok(()),
						Some(Err(err)) => break Err(RetrievalError::from(err)),
						None => break Ok(()),
					}
				}
			}
		};

		self.mediator.remove(&key);
		invocation.abort();
		result.map(|()| uids)
	}
}

impl RetrievalClient for DimseRetrievalClient {
	async fn retrieve(
		&self,
		descriptor: &ResourceDescriptor<'_>,
		selector: &InputMetadataDetails,
		destination: &Path,
		cancellation: &CancellationToken,
	) -> Result<RetrievalOutcome, RetrievalError> {
		let ResourceDescriptor::DimseQueryRetrieve {
			source_id,
			called_ae,
		} = descriptor
		else {
			return Err(RetrievalError::Permanent(String::from(
				"DimseRetrievalClient invoked with a non-DIMSE resource descriptor",
			)));
		};

		let pool = self.pool(source_id)?;
		let study_uids = self.resolve_study_uids(pool.clone(), selector).await?;
		if study_uids.is_empty() {
			return Ok(RetrievalOutcome {
				instance_count: 0,
				sop_instance_uids: Vec::new(),
			});
		}

		let originator = called_ae.unwrap_or(self.calling_aet.as_str());
		let mut sop_instance_uids = Vec::new();
		for study_instance_uid in &study_uids {
			if cancellation.is_cancelled() {
				return Err(RetrievalError::Cancelled);
			}
			let mut uids = self
				.move_study(pool.clone(), originator, study_instance_uid, destination, cancellation)
				.await?;
			sop_instance_uids.append(&mut uids);
		}

		trace!(count = sop_instance_uids.len(), "DIMSE retrieval complete");
		Ok(RetrievalOutcome {
			instance_count: sop_instance_uids.len(),
			sop_instance_uids,
		})
	}
}

/// DICOMweb implementation: QIDO-RS to resolve study/series/instance UIDs when the selector is
/// patient-id/accession-number based, then WADO-RS to fetch the actual instances (§4.I second
/// bullet, §4.G step 2).
pub struct DicomWebRetrievalClient {
	client: reqwest::Client,
}

impl DicomWebRetrievalClient {
	pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
		Ok(Self {
			client: reqwest::Client::builder().timeout(timeout).build()?,
		})
	}

	fn authorize(
		&self,
		request: reqwest::RequestBuilder,
		details: &ConnectionDetails,
	) -> reqwest::RequestBuilder {
		match details.auth_type {
			Some(crate::types::AuthType::Bearer) => {
				if let Some(token) = &details.auth_id {
					return request.bearer_auth(token);
				}
				request
			}
			Some(crate::types::AuthType::Basic) => {
				if let Some(credentials) = &details.auth_id {
					return request.header(
						reqwest::header::AUTHORIZATION,
						format!("Basic {credentials}"),
					);
				}
				request
			}
			_ => request,
		}
	}

	async fn qido_resolve_studies(
		&self,
		base: &url::Url,
		details: &ConnectionDetails,
		selector: &InputMetadataDetails,
	) -> Result<Vec<UI>, RetrievalError> {
		if let Some(studies) = &selector.studies {
			if !studies.is_empty() {
				return Ok(studies.clone());
			}
		}

		let mut url = base
			.join("studies")
			.map_err(|err| RetrievalError::Permanent(err.to_string()))?;
		{
			let mut pairs = url.query_pairs_mut();
			if let Some(patient_id) = &selector.patient_id {
				pairs.append_pair("PatientID", patient_id);
			} else if let Some(accessions) = &selector.accession_numbers {
				for accession in accessions {
					pairs.append_pair("AccessionNumber", accession);
				}
			} else {
				drop(pairs);
				return Err(RetrievalError::Permanent(String::from(
					"inputMetadata selector has no studies, patientId, or accessionNumbers",
				)));
			}
		}

		let response = self
			.authorize(self.client.get(url), details)
			.send()
			.await
			.map_err(|err| RetrievalError::Transient(err.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			return Err(Self::categorize(status, response.text().await.unwrap_or_default()));
		}

		let body: Vec<dicom_json::DicomJson<InMemDicomObject>> = response
			.json()
			.await
			.map_err(|err| RetrievalError::Permanent(err.to_string()))?;

		let mut uids = Vec::new();
		for item in body {
			let object = item.into_inner();
			if let Some(uid) = object
				.get(tags::STUDY_INSTANCE_UID)
				.map(InMemElement::to_str)
				.and_then(Result::ok)
			{
				let uid = uid.trim_end_matches('\0').to_string();
				if !uids.contains(&uid) {
					uids.push(uid);
				}
			}
		}
		Ok(uids)
	}

	async fn wado_retrieve_study(
		&self,
		base: &url::Url,
		details: &ConnectionDetails,
		study_instance_uid: &str,
		destination: &Path,
	) -> Result<Vec<UI>, RetrievalError> {
		let url = base
			.join(&format!("studies/{study_instance_uid}"))
			.map_err(|err| RetrievalError::Permanent(err.to_string()))?;

		let response = self
			.authorize(
				self.client
					.get(url)
					.header(reqwest::header::ACCEPT, "multipart/related; type=\"application/dicom\""),
				details,
			)
			.send()
			.await
			.map_err(|err| RetrievalError::Transient(err.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			return Err(Self::categorize(status, response.text().await.unwrap_or_default()));
		}

		let content_type = response
			.headers()
			.get(reqwest::header::CONTENT_TYPE)
			.and_then(|value| value.to_str().ok())
			.unwrap_or_default()
			.to_string();
		let boundary = multipart_boundary(&content_type).ok_or_else(|| {
			RetrievalError::Permanent(String::from("WADO-RS response is missing a multipart boundary"))
		})?;

		let body = response
			.bytes()
			.await
			.map_err(|err| RetrievalError::Transient(err.to_string()))?;

		parse_multipart_dicom_parts(body, boundary, destination).await
	}

	fn categorize(status: reqwest::StatusCode, body: String) -> RetrievalError {
		if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
			RetrievalError::Transient(format!("{status}: {body}"))
		} else {
			RetrievalError::Permanent(format!("{status}: {body}"))
		}
	}
}

/// Extracts the `boundary=` parameter from a `multipart/related` content-type header, the same
/// way the teacher's `DicomMultipart::parse_boundary` does for inbound STOW-RS requests
/// (`src/utils/multipart.rs`), just without the axum extractor wrapping.
fn multipart_boundary(content_type: &str) -> Option<String> {
	let mime: mime::Mime = content_type.parse().ok()?;
	if mime.type_() != mime::MULTIPART || mime.subtype().as_str() != "related" {
		return None;
	}
	mime.get_param(mime::BOUNDARY).map(|name| name.as_str().to_owned())
}

/// Parses a `multipart/related; type="application/dicom"` body (a WADO-RS response) into its
/// constituent DICOM Part-10 files, writing each into `destination` and returning the SOP
/// instance UIDs actually written. Each part carries its own preamble, `DICM` marker, file-meta
/// group and dataset, so it's read with the file-meta-aware `dicom::object::from_reader` rather
/// than a bare-dataset reader with a hard-coded transfer syntax.
async fn parse_multipart_dicom_parts(
	body: Bytes,
	boundary: String,
	destination: &Path,
) -> Result<Vec<UI>, RetrievalError> {
	let mut multipart = multer::Multipart::new(
		futures::stream::once(futures::future::ready(Ok::<_, std::io::Error>(body))),
		boundary,
	);

	let mut uids = Vec::new();
	while let Some(field) = multipart
		.next_field()
		.await
		.map_err(|err| RetrievalError::Permanent(format!("malformed WADO-RS multipart body: {err}")))?
	{
		let data = field
			.bytes()
			.await
			.map_err(|err| RetrievalError::Permanent(format!("failed to read WADO-RS part: {err}")))?;

		let object = match dicom::object::from_reader(Cursor::new(data.as_ref())) {
			Ok(object) => object,
			Err(err) => {
				warn!("Skipped unparsable WADO-RS part: {err}");
				continue;
			}
		};

		let sop_instance_uid = object
			.meta()
			.media_storage_sop_instance_uid
			.trim_end_matches('\0')
			.to_string();

		let path = destination.join(format!("{sop_instance_uid}.dcm"));
		if let Err(err) = tokio::fs::write(&path, &data).await {
			warn!("Failed to write WADO-RS instance {sop_instance_uid}: {err}");
			continue;
		}
		uids.push(sop_instance_uid);
	}
	Ok(uids)
}

impl RetrievalClient for DicomWebRetrievalClient {
	async fn retrieve(
		&self,
		descriptor: &ResourceDescriptor<'_>,
		selector: &InputMetadataDetails,
		destination: &Path,
		cancellation: &CancellationToken,
	) -> Result<RetrievalOutcome, RetrievalError> {
		let ResourceDescriptor::DicomWeb { details } = descriptor else {
			return Err(RetrievalError::Permanent(String::from(
				"DicomWebRetrievalClient invoked with a non-DICOMweb resource descriptor",
			)));
		};

		let uri = details
			.uri
			.as_deref()
			.ok_or_else(|| RetrievalError::Permanent(String::from("DICOMweb resource has no URI")))?;
		let base = url::Url::parse(uri).map_err(|err| RetrievalError::Permanent(err.to_string()))?;

		let study_uids = self.qido_resolve_studies(&base, details, selector).await?;
		if study_uids.is_empty() {
			return Ok(RetrievalOutcome {
				instance_count: 0,
				sop_instance_uids: Vec::new(),
			});
		}

		let mut sop_instance_uids = Vec::new();
		for study_instance_uid in &study_uids {
			if cancellation.is_cancelled() {
				return Err(RetrievalError::Cancelled);
			}
			let mut uids = self
				.wado_retrieve_study(&base, details, study_instance_uid, destination)
				.await?;
			sop_instance_uids.append(&mut uids);
		}

		Ok(RetrievalOutcome {
			instance_count: sop_instance_uids.len(),
			sop_instance_uids,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn multipart_boundary_extracts_quoted_value() {
		let header = "multipart/related; type=\"application/dicom\"; boundary=\"abc123\"";
		assert_eq!(multipart_boundary(header).as_deref(), Some("abc123"));
	}

	#[test]
	fn multipart_boundary_rejects_non_related_content_type() {
		let header = "multipart/form-data; boundary=\"abc123\"";
		assert_eq!(multipart_boundary(header), None);
	}

	#[tokio::test]
	async fn parse_multipart_dicom_parts_extracts_part10_files() {
		let meta = dicom::object::FileMetaTableBuilder::new()
			.media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
			.media_storage_sop_instance_uid("1.2.3.4")
			.transfer_syntax("1.2.840.10008.1.2.1")
			.build()
			.unwrap();
		let file = InMemDicomObject::new_empty().with_exact_meta(meta);
		let mut encoded = Vec::new();
		file.write_all(&mut encoded).unwrap();

		let boundary = "TESTBOUNDARY";
		let mut body = Vec::new();
		body.extend_from_slice(
			format!("--{boundary}\r\nContent-Type: application/dicom\r\n\r\n").as_bytes(),
		);
		body.extend_from_slice(&encoded);
		body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

		let tmp = tempfile::tempdir().unwrap();
		let uids = parse_multipart_dicom_parts(Bytes::from(body), boundary.to_string(), tmp.path())
			.await
			.unwrap();

		assert_eq!(uids, vec![String::from("1.2.3.4")]);
		assert!(tmp.path().join("1.2.3.4.dcm").exists());
	}

	#[tokio::test]
	async fn parse_multipart_dicom_parts_skips_unparsable_part_but_keeps_others() {
		let meta = dicom::object::FileMetaTableBuilder::new()
			.media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
			.media_storage_sop_instance_uid("5.6.7.8")
			.transfer_syntax("1.2.840.10008.1.2.1")
			.build()
			.unwrap();
		let file = InMemDicomObject::new_empty().with_exact_meta(meta);
		let mut encoded = Vec::new();
		file.write_all(&mut encoded).unwrap();

		let boundary = "TESTBOUNDARY";
		let mut body = Vec::new();
		body.extend_from_slice(
			format!("--{boundary}\r\nContent-Type: application/dicom\r\n\r\n").as_bytes(),
		);
		body.extend_from_slice(b"not a dicom file");
		body.extend_from_slice(
			format!("\r\n--{boundary}\r\nContent-Type: application/dicom\r\n\r\n").as_bytes(),
		);
		body.extend_from_slice(&encoded);
		body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

		let tmp = tempfile::tempdir().unwrap();
		let uids = parse_multipart_dicom_parts(Bytes::from(body), boundary.to_string(), tmp.path())
			.await
			.unwrap();

		assert_eq!(uids, vec![String::from("5.6.7.8")]);
	}
}
