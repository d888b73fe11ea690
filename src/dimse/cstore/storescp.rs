//! Association Handler (§4.C): the ingest SCP. Negotiates each incoming association against the
//! Source & AE Registry, then serves C-ECHO and C-STORE on it until the peer releases or aborts.
//!
//! Two kinds of traffic share this one listener. Ordinary ingest associations are negotiated
//! against a called AE configured in `called_aets`: every stored instance is written to a fresh
//! staging scope and published to the [`Notifier`] before the C-STORE-RSP is sent (step 6).
//! Associations dialing the configured `retrieval.move-destination-aet` instead carry C-MOVE
//! sub-operation pushes destined for an in-flight retrieval (§4.I); those bypass staging and the
//! notifier entirely and are handed straight to the [`MoveMediator`].

use crate::config::DimseServerConfig;
use crate::dimse::association;
use crate::dimse::cmove::{MoveMediator, MoveSubOperation, TaskKey};
use crate::dimse::cstore::{
	CompositeStoreResponse, COMMAND_FIELD_COMPOSITE_STORE_REQUEST, STATUS_OUT_OF_RESOURCES,
	STATUS_PROCESSING_FAILURE, STATUS_SOP_CLASS_NOT_SUPPORTED, STATUS_SUCCESS,
};
use crate::dimse::{DicomMessageReader, DicomMessageWriter};
use crate::notifier::Notifier;
use crate::registry::Registry;
use crate::staging::StagingStore;
use crate::types::{Instance, AE, UI, US};
use association::server::{RegistryAccessControl, ServerAssociation, ServerAssociationOptions};
use association::Association;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::{FileMetaTableBuilder, InMemDicomObject};
use dicom::ul::pdu::{
	AssociationRJResult, AssociationRJServiceProviderPresentationReason, AssociationRJSource,
};
use dicom::ul::Pdu;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

const COMMAND_FIELD_COMPOSITE_ECHO_REQUEST: US = 0x0030;
const COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE: US = 0x8030;

pub struct StoreServiceClassProvider {
	inner: Arc<Inner>,
}

struct Inner {
	local_aet: AE,
	config: DimseServerConfig,
	registry: Arc<Registry>,
	staging: Arc<StagingStore>,
	notifier: Arc<Notifier>,
	mediator: Arc<MoveMediator>,
	/// The AE title reserved for C-MOVE retrieval pushes, if retrieval is configured (§4.I).
	retrieval_aet: Option<AE>,
	associations: Arc<Semaphore>,
}

impl StoreServiceClassProvider {
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		local_aet: AE,
		config: DimseServerConfig,
		max_associations: usize,
		registry: Arc<Registry>,
		staging: Arc<StagingStore>,
		notifier: Arc<Notifier>,
		mediator: Arc<MoveMediator>,
		retrieval_aet: Option<AE>,
	) -> Self {
		Self {
			inner: Arc::new(Inner {
				local_aet,
				config,
				registry,
				staging,
				notifier,
				mediator,
				retrieval_aet,
				associations: Arc::new(Semaphore::new(max_associations)),
			}),
		}
	}

	pub async fn spawn(&self) -> anyhow::Result<()> {
		let address = SocketAddr::from((self.inner.config.interface, self.inner.config.port));
		let listener = TcpListener::bind(&address).await?;
		info!("Started Association Handler on {}", address);

		loop {
			match listener.accept().await {
				Ok((stream, peer)) => {
					let span = info_span!("association", peer = %peer);
					let inner = Arc::clone(&self.inner);
					tokio::spawn(
						async move {
							if let Err(err) = Self::process(stream, inner).await {
								error!("Association ended with error: {err}");
							}
						}
						.instrument(span),
					);
				}
				Err(err) => error!("Failed to accept incoming connection: {err}"),
			}
		}
	}

	#[instrument(skip_all)]
	async fn process(stream: TcpStream, inner: Arc<Inner>) -> anyhow::Result<()> {
		let permit = match Arc::clone(&inner.associations).try_acquire_owned() {
			Ok(permit) => permit,
			Err(_) => {
				warn!("Rejecting association: max_associations limit reached");
				Self::reject_overloaded(stream).await?;
				return Ok(());
			}
		};

		let tcp_stream = stream.into_std()?;
		// `dicom-ul` does its own blocking reads/writes on a dedicated thread; the stream must
		// stay in blocking mode for that thread to work correctly.
		tcp_stream.set_nonblocking(false)?;

		let access_control = RegistryAccessControl::new(Arc::clone(&inner.registry));
		let called_ae_slot = access_control.called_ae_slot();

		let options = ServerAssociationOptions {
			aet: inner.local_aet.clone(),
			tcp_stream,
			uncompressed: inner.config.uncompressed,
			access_control,
			called_ae_slot: Some(called_ae_slot),
		};

		let association = match ServerAssociation::new(options).await {
			Ok(association) => association,
			Err(err) => {
				// Policy rejection or handshake failure: no staging directory created, no
				// instance published, per §8 scenarios 1-2.
				info!("Association not established: {err}");
				drop(permit);
				return Ok(());
			}
		};

		let calling_ae = association.calling_ae_title().to_string();
		let called_ae = association.called_ae_title().to_string();
		info!(calling_ae, called_ae, "Association established");

		let result = if inner.retrieval_aet.as_deref() == Some(called_ae.as_str()) {
			Self::serve_retrieval_pushes(&association, &inner, &calling_ae).await
		} else {
			Self::serve_ingest(&association, &inner, &calling_ae, &called_ae).await
		};

		drop(permit);
		result
	}

	/// Writes a bare A-ASSOCIATE-RJ with a transient, service-provider-presentation reason,
	/// before the upper-layer handshake even begins (§5 backpressure: excess associations are
	/// rejected, not queued).
	async fn reject_overloaded(stream: TcpStream) -> anyhow::Result<()> {
		let mut tcp_stream = stream.into_std()?;
		tcp_stream.set_nonblocking(false)?;
		tokio::task::spawn_blocking(move || {
			dicom::ul::write_pdu(
				&mut tcp_stream,
				&Pdu::AssociationRJ {
					result: AssociationRJResult::Transient,
					source: AssociationRJSource::ServiceProviderPresentation(
						AssociationRJServiceProviderPresentationReason::LocalLimitExceeded,
					),
				},
			)
		})
		.await??;
		Ok(())
	}

	/// Ordinary ingest path (§4.C steps 3-7): validates the called-AE policy per instance, stages
	/// received files, and publishes to the [`Notifier`] ahead of each success response.
	async fn serve_ingest(
		association: &ServerAssociation,
		inner: &Inner,
		calling_ae: &str,
		called_ae: &str,
	) -> anyhow::Result<()> {
		let Some(called_config) = inner.registry.resolve_called(called_ae) else {
			// Registry reloaded mid-negotiation; treat as if rejected at step 1.
			warn!(called_ae, "Called AE no longer configured, aborting association");
			return Ok(());
		};

		let scope_id = uuid::Uuid::new_v4().to_string();
		let staging = match inner.staging.acquire(&scope_id).await {
			Ok(handle) => handle,
			Err(err) => {
				error!("Failed to acquire staging directory: {err}");
				return Ok(());
			}
		};

		let idle_timeout = Duration::from_millis(inner.config.idle_timeout_ms);

		loop {
			let message = match association.read_message(idle_timeout).await {
				Ok(message) => message,
				Err(err) => {
					debug!("Association read loop ended: {err}");
					break;
				}
			};

			let command_field = message
				.command
				.get(tags::COMMAND_FIELD)
				.map(InMemElement::to_int::<US>)
				.and_then(Result::ok);

			match command_field {
				Some(COMMAND_FIELD_COMPOSITE_ECHO_REQUEST) => {
					Self::respond_echo(association, &message, inner).await?;
				}
				Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST) => {
					Self::handle_store(
						association,
						inner,
						&message,
						&staging,
						calling_ae,
						called_ae,
						&called_config,
					)
					.await?;
				}
				_ => {
					warn!(?command_field, "Ignoring unsupported DIMSE command");
				}
			}
		}

		Ok(())
	}

	#[allow(clippy::too_many_arguments)]
	async fn handle_store(
		association: &ServerAssociation,
		inner: &Inner,
		message: &crate::dimse::DicomMessage,
		staging: &crate::staging::StagingHandle,
		calling_ae: &str,
		called_ae: &str,
		called_config: &crate::config::CalledAeConfig,
	) -> anyhow::Result<()> {
		let message_id = message
			.command
			.get(tags::MESSAGE_ID)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.unwrap_or(0);
		let sop_class_uid: UI = message
			.command
			.get(tags::AFFECTED_SOP_CLASS_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|v| v.trim_end_matches('\0').to_string())
			.unwrap_or_default();
		let sop_instance_uid: UI = message
			.command
			.get(tags::AFFECTED_SOP_INSTANCE_UID)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|v| v.trim_end_matches('\0').to_string())
			.unwrap_or_default();

		info!(sop_instance_uid, sop_class_uid, "Received instance");

		if !Registry::is_sop_allowed(called_config, &sop_class_uid) {
			warn!(sop_class_uid, "SOP class not allowed for this called AE");
			Self::respond_store(
				association,
				inner,
				message,
				message_id,
				&sop_class_uid,
				&sop_instance_uid,
				STATUS_SOP_CLASS_NOT_SUPPORTED,
			)
			.await?;
			return Ok(());
		}

		let presentation_context_id = message.presentation_context_id;
		let transfer_syntax = association
			.presentation_contexts()
			.iter()
			.find(|pctx| Some(pctx.id) == presentation_context_id)
			.map(|pctx| pctx.transfer_syntax.clone())
			.unwrap_or_default();

		let Some(data_set) = &message.data else {
			warn!("C-STORE-RQ carried no data set");
			Self::respond_store(
				association,
				inner,
				message,
				message_id,
				&sop_class_uid,
				&sop_instance_uid,
				STATUS_PROCESSING_FAILURE,
			)
			.await?;
			return Ok(());
		};

		let patient_id = Self::element_str(data_set, tags::PATIENT_ID).unwrap_or_default();
		let study_instance_uid =
			Self::element_str(data_set, tags::STUDY_INSTANCE_UID).unwrap_or_default();
		let series_instance_uid =
			Self::element_str(data_set, tags::SERIES_INSTANCE_UID).unwrap_or_default();

		let meta = FileMetaTableBuilder::new()
			.media_storage_sop_class_uid(sop_class_uid.as_str())
			.media_storage_sop_instance_uid(sop_instance_uid.as_str())
			.transfer_syntax(&transfer_syntax)
			.build()
			.expect("mandatory file meta fields are all present");

		let file = data_set.clone().with_exact_meta(meta);
		let file_path = staging.instance_path(&sop_instance_uid);
		let write_path = file_path.clone();

		let write_result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
			let mut handle = std::fs::File::create(&write_path)?;
			file.write_all(&mut handle)
				.map_err(|err| std::io::Error::other(err.to_string()))
		})
		.await;

		match write_result {
			Ok(Ok(())) => {}
			Ok(Err(err)) => {
				error!("Failed to write staged instance: {err}");
				Self::respond_store(
					association,
					inner,
					message,
					message_id,
					&sop_class_uid,
					&sop_instance_uid,
					STATUS_OUT_OF_RESOURCES,
				)
				.await?;
				return Ok(());
			}
			Err(err) => {
				error!("Staging write task panicked: {err}");
				Self::respond_store(
					association,
					inner,
					message,
					message_id,
					&sop_class_uid,
					&sop_instance_uid,
					STATUS_OUT_OF_RESOURCES,
				)
				.await?;
				return Ok(());
			}
		}

		let instance = Instance {
			sop_instance_uid: sop_instance_uid.clone(),
			series_instance_uid,
			study_instance_uid,
			patient_id,
			called_ae: called_ae.to_string(),
			calling_ae: calling_ae.to_string(),
			received_at: chrono::Utc::now(),
			file_path,
			transfer_syntax,
		};

		// Publish before the success response is sent, per §4.C step 6.
		inner.notifier.publish(&instance).await;

		Self::respond_store(
			association,
			inner,
			message,
			message_id,
			&sop_class_uid,
			&sop_instance_uid,
			STATUS_SUCCESS,
		)
		.await
	}

	#[allow(clippy::too_many_arguments)]
	async fn respond_store(
		association: &ServerAssociation,
		inner: &Inner,
		message: &crate::dimse::DicomMessage,
		message_id: US,
		sop_class_uid: &str,
		sop_instance_uid: &str,
		status: US,
	) -> anyhow::Result<()> {
		let response = CompositeStoreResponse {
			message_id,
			sop_class_uid: sop_class_uid.to_string(),
			sop_instance_uid: sop_instance_uid.to_string(),
			status,
		};
		let dimse_timeout = Duration::from_millis(inner.config.dimse_timeout_ms);
		association
			.write_message(response, message.presentation_context_id, dimse_timeout)
			.await?;
		Ok(())
	}

	async fn respond_echo(
		association: &ServerAssociation,
		message: &crate::dimse::DicomMessage,
		inner: &Inner,
	) -> anyhow::Result<()> {
		use dicom::core::{DataElement, VR};
		use dicom::dicom_value;
		use dicom::dictionary_std::uids;

		let message_id = message
			.command
			.get(tags::MESSAGE_ID)
			.map(InMemElement::to_int::<US>)
			.and_then(Result::ok)
			.unwrap_or(0);

		#[rustfmt::skip]
		let command = InMemDicomObject::command_from_element_iter([
			DataElement::new(tags::AFFECTED_SOP_CLASS_UID, VR::UI, dicom_value!(Str, uids::VERIFICATION)),
			DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [COMMAND_FIELD_COMPOSITE_ECHO_RESPONSE])),
			DataElement::new(tags::MESSAGE_ID_BEING_RESPONDED_TO, VR::US, dicom_value!(U16, [message_id])),
			DataElement::new(tags::COMMAND_DATA_SET_TYPE, VR::US, dicom_value!(U16, [crate::dimse::DATA_SET_MISSING])),
			DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [STATUS_SUCCESS])),
		]);

		let response = crate::dimse::DicomMessage {
			command,
			data: None,
			presentation_context_id: None,
		};
		let dimse_timeout = Duration::from_millis(inner.config.dimse_timeout_ms);
		association
			.write_message(response, message.presentation_context_id, dimse_timeout)
			.await?;
		Ok(())
	}

	/// C-MOVE sub-operation push path (§4.I): the remote source opens this association to
	/// deliver instances it was asked to move. Every C-STORE here is handed to the
	/// [`MoveMediator`], keyed by the move originator tags it carries, instead of going through
	/// staging/registry/notifier.
	async fn serve_retrieval_pushes(
		association: &ServerAssociation,
		inner: &Inner,
		calling_ae: &str,
	) -> anyhow::Result<()> {
		let idle_timeout = Duration::from_millis(inner.config.idle_timeout_ms);

		loop {
			let message = match association.read_message(idle_timeout).await {
				Ok(message) => message,
				Err(err) => {
					debug!("Retrieval push association read loop ended: {err}");
					break;
				}
			};

			let command_field = message
				.command
				.get(tags::COMMAND_FIELD)
				.map(InMemElement::to_int::<US>)
				.and_then(Result::ok);

			if command_field != Some(COMMAND_FIELD_COMPOSITE_STORE_REQUEST) {
				warn!(?command_field, "Ignoring unsupported command on retrieval association");
				continue;
			}

			let message_id = message
				.command
				.get(tags::MESSAGE_ID)
				.map(InMemElement::to_int::<US>)
				.and_then(Result::ok)
				.unwrap_or(0);
			let sop_class_uid = message
				.command
				.get(tags::AFFECTED_SOP_CLASS_UID)
				.map(InMemElement::to_str)
				.and_then(Result::ok)
				.map(|v| v.trim_end_matches('\0').to_string())
				.unwrap_or_default();
			let sop_instance_uid = message
				.command
				.get(tags::AFFECTED_SOP_INSTANCE_UID)
				.map(InMemElement::to_str)
				.and_then(Result::ok)
				.map(|v| v.trim_end_matches('\0').to_string())
				.unwrap_or_default();
			let move_originator_message_id = message
				.command
				.get(tags::MOVE_ORIGINATOR_MESSAGE_ID)
				.map(InMemElement::to_int::<US>)
				.and_then(Result::ok);
			let move_originator_aet = message
				.command
				.get(tags::MOVE_ORIGINATOR_APPLICATION_ENTITY_TITLE)
				.map(InMemElement::to_str)
				.and_then(Result::ok)
				.map(|v| v.trim_end_matches('\0').to_string())
				.unwrap_or_else(|| calling_ae.to_string());

			let presentation_context_id = message.presentation_context_id;
			let transfer_syntax = association
				.presentation_contexts()
				.iter()
				.find(|pctx| Some(pctx.id) == presentation_context_id)
				.map(|pctx| pctx.transfer_syntax.clone())
				.unwrap_or_default();

			if let Some(data_set) = &message.data {
				let meta = FileMetaTableBuilder::new()
					.media_storage_sop_class_uid(sop_class_uid.as_str())
					.media_storage_sop_instance_uid(sop_instance_uid.as_str())
					.transfer_syntax(&transfer_syntax)
					.build()
					.expect("mandatory file meta fields are all present");
				let file = Arc::new(data_set.clone().with_exact_meta(meta));

				let topic = TaskKey::new(move_originator_aet, move_originator_message_id);
				if let Err(err) = inner
					.mediator
					.publish(&topic, Ok(MoveSubOperation::Pending(file)))
					.await
				{
					warn!("No retrieval is waiting for this push: {err}");
				}
			}

			Self::respond_store(
				association,
				inner,
				&message,
				message_id,
				&sop_class_uid,
				&sop_instance_uid,
				STATUS_SUCCESS,
			)
			.await?;
		}

		Ok(())
	}

	fn element_str(obj: &InMemDicomObject, tag: dicom::object::Tag) -> Option<String> {
		obj.get(tag)
			.map(InMemElement::to_str)
			.and_then(Result::ok)
			.map(|v| v.trim_end_matches('\0').to_string())
	}
}
