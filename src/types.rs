use dicom::core::PrimitiveValue;
use dicom::dictionary_std::uids;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// UL (Unsigned Long) value representation.
pub type UL = u32;

/// US (Unsigned Short) value representation.
pub type US = u16;

/// AE (Application Entity) value representation.
pub type AE = String;

/// Priority (0000,0700) values for DIMSE operations.
#[derive(Debug, Copy, Clone)]
pub enum Priority {
	Low = 0x0002,
	Medium = 0x0000,
	High = 0x0001,
}

impl Default for Priority {
	fn default() -> Self {
		Self::Medium
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryInformationModel {
	Study,
	Patient,
	Worklist,
}

impl Default for QueryInformationModel {
	fn default() -> Self {
		Self::Study
	}
}

impl QueryInformationModel {
	pub const fn as_sop_class(&self) -> &str {
		match self {
			Self::Study => uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			Self::Patient => uids::PATIENT_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND,
			Self::Worklist => uids::MODALITY_WORKLIST_INFORMATION_MODEL_FIND,
		}
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum QueryRetrieveLevel {
	Patient,
	Study,
	Series,
	Image,
	Frame,
}

impl Display for QueryRetrieveLevel {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			Self::Patient => write!(f, "PATIENT"),
			Self::Study => write!(f, "STUDY"),
			Self::Series => write!(f, "SERIES"),
			Self::Image => write!(f, "IMAGE"),
			Self::Frame => write!(f, "FRAME"),
		}
	}
}

impl From<QueryRetrieveLevel> for PrimitiveValue {
	fn from(level: QueryRetrieveLevel) -> Self {
		Self::Str(level.to_string())
	}
}

/// Grouping key strategy for a called AE, per §4.E.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GroupingKeyKind {
	None,
	PatientId,
	StudyInstanceUid,
	CallingAet,
}

impl Default for GroupingKeyKind {
	fn default() -> Self {
		Self::StudyInstanceUid
	}
}

/// The actual computed grouping key for one received instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GroupingKey {
	/// `None` strategy: unique per instance, carries a random discriminator.
	PerInstance(uuid::Uuid),
	PatientId { called_ae: AE, patient_id: String },
	StudyInstanceUid { called_ae: AE, study_instance_uid: UI },
	CallingAet { called_ae: AE, calling_ae: AE },
}

/// Platform-facing job priority, mapped from the inference request's byte priority (§4.H).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobPriority {
	Lower,
	Normal,
	Higher,
	Immediate,
}

impl From<u8> for JobPriority {
	fn from(priority: u8) -> Self {
		match priority {
			0..=127 => Self::Lower,
			128 => Self::Normal,
			129..=254 => Self::Higher,
			255 => Self::Immediate,
		}
	}
}

/// Inference request lifecycle state. Monotonic: Queued -> InProcess -> Completed.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestState {
	Queued,
	InProcess,
	Completed,
}

impl Default for RequestState {
	fn default() -> Self {
		Self::Queued
	}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestStatus {
	Unknown,
	Success,
	Fail,
}

impl Default for RequestStatus {
	fn default() -> Self {
		Self::Unknown
	}
}

/// The `inputMetadata.details.type` discriminator (§6).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputMetadataType {
	DicomUid,
	DicomPatientId,
	AccessionNumber,
}

/// The `inputResources[].interface` / `outputResources[].interface` discriminator.
/// One received DICOM object, per §3 Data Model. `file_path` refers to a file inside a staging
/// directory owned by the triggering association and is not moved until the grouping engine
/// claims the enclosing bucket or a retention deadline expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
	pub sop_instance_uid: UI,
	pub series_instance_uid: UI,
	pub study_instance_uid: UI,
	pub patient_id: String,
	pub called_ae: AE,
	pub calling_ae: AE,
	pub received_at: chrono::DateTime<chrono::Utc>,
	pub file_path: std::path::PathBuf,
	pub transfer_syntax: UI,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceInterface {
	Algorithm,
	#[serde(rename = "DIMSE")]
	Dimse,
	#[serde(rename = "DICOMweb")]
	DicomWeb,
}

/// Authentication scheme for a DICOMweb `connectionDetails`. Non-`None` requires `auth_id`
/// (§4.F validation).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthType {
	None,
	Basic,
	Bearer,
}

impl Default for AuthType {
	fn default() -> Self {
		Self::None
	}
}

/// The `inputResources[].connectionDetails` / `outputResources[].connectionDetails` object.
/// Which fields are populated is determined by the sibling `interface` discriminator: the
/// `Algorithm` resource carries only `pipeline_id`; `DIMSE` resources carry `source_id` (and
/// optionally `called_ae` to override the configured default); `DICOMweb` resources carry `uri`,
/// `auth_type`, and `auth_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetails {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pipeline_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub source_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub called_ae: Option<AE>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub uri: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub auth_type: Option<AuthType>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub auth_id: Option<String>,
}

/// One entry of `inputResources` / `outputResources` (§3, §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputResource {
	pub interface: ResourceInterface,
	pub connection_details: ConnectionDetails,
}

/// Output resources share the input resource shape (§6).
pub type OutputResource = InputResource;

/// `inputMetadata.details` (§6): a tagged selector naming which instances to retrieve.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputMetadataDetails {
	#[serde(rename = "type")]
	pub kind: Option<InputMetadataType>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub studies: Option<Vec<UI>>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub patient_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub accession_numbers: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputMetadata {
	pub details: InputMetadataDetails,
}

fn default_priority() -> u8 {
	128
}

/// The body accepted by `POST /inference-requests` (§6). A separate type from
/// [`InferenceRequest`] because the caller supplies neither an id nor lifecycle fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueInferenceRequest {
	pub transaction_id: String,
	#[serde(default = "default_priority")]
	pub priority: u8,
	pub input_metadata: InputMetadata,
	pub input_resources: Vec<InputResource>,
	#[serde(default)]
	pub output_resources: Vec<OutputResource>,
}

/// Inference Request (§3 Data Model). Invariants enforced by the Inference Request Store at
/// enqueue time and preserved by the Worker thereafter: exactly one `Algorithm` input resource;
/// at least one non-`Algorithm` input resource; `storage_path` is set at most once and never
/// cleared; `state` is monotonically non-decreasing along Queued -> InProcess -> Completed;
/// `try_count` is non-decreasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceRequest {
	pub inference_request_id: uuid::Uuid,
	pub transaction_id: String,
	/// Enqueue timestamp; `claim_next` orders the FIFO queue by this field, not by id (uuid v4
	/// carries no temporal ordering).
	pub enqueued_at: chrono::DateTime<chrono::Utc>,
	pub priority: u8,
	pub input_metadata: InputMetadata,
	pub input_resources: Vec<InputResource>,
	pub output_resources: Vec<OutputResource>,
	#[serde(default)]
	pub state: RequestState,
	#[serde(default)]
	pub status: RequestStatus,
	#[serde(default)]
	pub try_count: u32,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub storage_path: Option<PathBuf>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub job_id: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub payload_id: Option<String>,
}

impl InferenceRequest {
	/// Builds a freshly-enqueued request from a validated API body. `pipeline_id` is the
	/// connection details of the single `Algorithm` input resource, already pulled out by the
	/// caller's validation pass.
	pub fn new(body: EnqueueInferenceRequest) -> Self {
		Self {
			inference_request_id: uuid::Uuid::new_v4(),
			transaction_id: body.transaction_id,
			enqueued_at: chrono::Utc::now(),
			priority: body.priority,
			input_metadata: body.input_metadata,
			input_resources: body.input_resources,
			output_resources: body.output_resources,
			state: RequestState::Queued,
			status: RequestStatus::Unknown,
			try_count: 0,
			storage_path: None,
			job_id: None,
			payload_id: None,
		}
	}

	/// The single `Algorithm` resource's pipeline id, if present and well-formed.
	pub fn pipeline_id(&self) -> Option<&str> {
		self.input_resources
			.iter()
			.find(|resource| resource.interface == ResourceInterface::Algorithm)
			.and_then(|resource| resource.connection_details.pipeline_id.as_deref())
	}

	/// Input resources other than the `Algorithm` designator, in declared order (§4.G step 2).
	pub fn data_source_resources(&self) -> impl Iterator<Item = &InputResource> {
		self.input_resources
			.iter()
			.filter(|resource| resource.interface != ResourceInterface::Algorithm)
	}
}
