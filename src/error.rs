use thiserror::Error;

/// Error kinds the ingest/grouping core distinguishes, per §7. Every module-local error enum
/// converts into this one at the boundary where a component hands control back to a caller that
/// only needs the policy bucket, not the low-level cause (e.g. the HTTP API, §6).
#[derive(Debug, Error)]
pub enum AdapterError {
	#[error("invalid configuration: {0}")]
	ConfigInvalid(String),

	#[error("rejected at the DICOM association layer: {0}")]
	PolicyReject(String),

	#[error("staging storage is full or unwritable: {0}")]
	StagingFull(String),

	#[error("transient I/O failure: {0}")]
	TransientIo(String),

	#[error("transient remote failure: {0}")]
	TransientRemote(String),

	#[error("permanent remote failure: {0}")]
	PermanentRemote(String),

	#[error("inference request failed validation: {0:?}")]
	ValidationFailed(Vec<String>),

	#[error("operation was cancelled")]
	Cancelled,
}

impl AdapterError {
	/// Whether this error class is eligible for local retry with backoff (§7).
	pub const fn is_transient(&self) -> bool {
		matches!(self, Self::TransientIo(_) | Self::TransientRemote(_))
	}
}

impl From<crate::store::StoreError> for AdapterError {
	fn from(err: crate::store::StoreError) -> Self {
		match err {
			crate::store::StoreError::Validation(errors) => Self::ValidationFailed(errors),
			crate::store::StoreError::Kv(err) => Self::TransientIo(err.to_string()),
		}
	}
}

impl From<crate::staging::StagingError> for AdapterError {
	fn from(err: crate::staging::StagingError) -> Self {
		Self::StagingFull(err.to_string())
	}
}

impl From<crate::retrieval::RetrievalError> for AdapterError {
	fn from(err: crate::retrieval::RetrievalError) -> Self {
		match err {
			crate::retrieval::RetrievalError::Transient(reason) => Self::TransientRemote(reason),
			crate::retrieval::RetrievalError::Permanent(reason) => Self::PermanentRemote(reason),
			crate::retrieval::RetrievalError::Cancelled => Self::Cancelled,
		}
	}
}

impl From<crate::submitter::SubmitError> for AdapterError {
	fn from(err: crate::submitter::SubmitError) -> Self {
		match err {
			crate::submitter::SubmitError::Transient(reason) => Self::TransientRemote(reason.to_string()),
			crate::submitter::SubmitError::Permanent(reason) => Self::PermanentRemote(reason),
		}
	}
}
