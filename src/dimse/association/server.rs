use super::{oneshot, AskPattern, Association, AssociationError, ChannelError, Command, Sender};
use dicom::transfer_syntax::TransferSyntaxRegistry;
use dicom::ul::association::server::AcceptAny;
pub use dicom::ul::association::server::AccessControl;
use dicom::ul::pdu::Pdu;
use dicom::ul::pdu::PresentationContextNegotiated;
use std::convert::identity;
use std::io::ErrorKind;
use std::{net::TcpStream, thread, time::Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct ServerAssociation {
	channel: Sender<Command>,
	presentation_contexts: Vec<PresentationContextNegotiated>,
	tcp_stream: TcpStream,
	/// The calling AE title negotiated for this association, for the caller's own bookkeeping.
	calling_ae_title: String,
	/// The called AE title the remote peer dialed, i.e. which local AE policy applies (§4.C step 1).
	called_ae_title: String,
}

pub struct ServerAssociationOptions<A = AcceptAny> {
	pub aet: String,
	pub tcp_stream: TcpStream,
	pub uncompressed: bool,
	pub access_control: A,
	/// Shared slot the access control writes the negotiated called AE title into, read back once
	/// `ServerAssociation::new` resolves. `None` when the caller does not need it (e.g. outbound
	/// client associations never hit this path).
	pub called_ae_slot: Option<std::sync::Arc<std::sync::Mutex<Option<String>>>>,
}

impl ServerAssociation {
	pub fn calling_ae_title(&self) -> &str {
		&self.calling_ae_title
	}

	pub fn called_ae_title(&self) -> &str {
		&self.called_ae_title
	}

	pub async fn new<A>(options: ServerAssociationOptions<A>) -> Result<Self, AssociationError>
	where
		A: AccessControl + Send + 'static,
	{
		let uuid = Uuid::new_v4();
		let mut server_options = dicom::ul::ServerAssociationOptions::new()
			.ae_title(options.aet.clone())
			.ae_access_control(options.access_control)
			.promiscuous(true);

		for syntax in TransferSyntaxRegistry.iter() {
			if (options.uncompressed && syntax.is_codec_free())
				|| (!options.uncompressed && !syntax.is_unsupported())
			{
				server_options = server_options.with_transfer_syntax(syntax.uid());
			}
		}

		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let _handle = thread::Builder::new()
			.name(format!("{}-server", options.aet))
			.spawn(move || {
				let span =
					tracing::info_span!("ServerAssociation", association_id = uuid.to_string());
				let _enter = span.enter();

				let mut association = match server_options.establish(options.tcp_stream) {
					Ok(mut association) => {
						let calling_ae_title = association.client_ae_title().to_string();
						info!(
							calling_aet = calling_ae_title,
							called_aet = options.aet,
							"Established new server association"
						);

						let pcs = association.presentation_contexts().to_vec();

						let stream = association
							.inner_stream()
							.try_clone()
							.expect("TcpStream::clone");

						connect_tx
							.send(Ok((stream, pcs, calling_ae_title)))
							.map_err(|_value| ())?;
						association
					}
					Err(e) => {
						connect_tx.send(Err(e.into())).map_err(|_value| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, response) => {
							let send_result = association
								.send(&pdu)
								.map_err(AssociationError::Association);
							response
								.send(send_result)
								.map_err(|_value| ChannelError::Closed)
						}
						Command::Receive(response) => {
							let receive_result =
								association.receive().map_err(AssociationError::Association);
							response
								.send(receive_result)
								.map_err(|_value| ChannelError::Closed)
						}
					};

					if let Some(err) = result.err() {
						error!("Error in ServerAssociation: {err}");
						return Err(());
					}
				}

				rx.close();

				if let Err(e) = association.abort() {
					match e {
						dicom::ul::association::Error::WireSend { source, .. }
							if source.kind() == ErrorKind::BrokenPipe =>
						{
							// no-op, happens on MacOS if the TCP stream is already closed
						}
						_ => {
							warn!("ServerAssociation.abort() returned error: {e}");
						}
					}
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts, calling_ae_title) =
			connect_result.await.expect("connect_result.await")?;

		let called_ae_title = options
			.called_ae_slot
			.as_ref()
			.and_then(|slot| slot.lock().unwrap().clone())
			.unwrap_or_else(|| options.aet.clone());

		Ok(Self {
			channel: tx,
			calling_ae_title,
			called_ae_title,
			presentation_contexts,
			tcp_stream,
		})
	}
}

impl Association for ServerAssociation {
	async fn receive(&self, timeout: Duration) -> Result<Pdu, AssociationError> {
		self.channel
			.ask(Command::Receive, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	async fn send(&self, pdu: Pdu, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(|reply_to| Command::Send(pdu, reply_to), timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}

	fn close(&mut self) {
		debug!("Closing TcpStream from outside");

		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			warn!("TcpStream::shutdown failed: {err}");
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}

impl Drop for ServerAssociation {
	fn drop(&mut self) {
		self.close();
	}
}

/// [`AccessControl`] policy backed by the Source & AE Registry (§4.B, §4.C steps 1-2): rejects
/// associations whose called AE is not configured (`CalledAETitleNotRecognized`), whose calling
/// AE is not a registered source (`CallingAETitleNotRecognized`), or whose calling source is not
/// allowed for the called AE it dialed (`NoReasonGiven` — no dedicated reason code exists for
/// this case in the DICOM upper-layer protocol).
///
/// The called AE title is not retained by `dicom-ul`'s own `ServerAssociation` once negotiation
/// completes (it only tracks the calling/peer AE), so this control captures it into a shared slot
/// as a side effect of a successful check — read back by the caller via [`Self::called_ae_slot`]
/// once `ServerAssociation::new` returns.
#[derive(Clone)]
pub struct RegistryAccessControl {
	registry: std::sync::Arc<crate::registry::Registry>,
	called_ae: std::sync::Arc<std::sync::Mutex<Option<String>>>,
}

impl RegistryAccessControl {
	pub fn new(registry: std::sync::Arc<crate::registry::Registry>) -> Self {
		Self {
			registry,
			called_ae: std::sync::Arc::new(std::sync::Mutex::new(None)),
		}
	}

	/// A handle that, after a successful negotiation, holds the called AE title the peer dialed.
	pub fn called_ae_slot(&self) -> std::sync::Arc<std::sync::Mutex<Option<String>>> {
		std::sync::Arc::clone(&self.called_ae)
	}
}

impl AccessControl for RegistryAccessControl {
	fn check_access(
		&self,
		_this_ae_title: &str,
		calling_ae_title: &str,
		called_ae_title: &str,
		_user_identity: Option<&dicom::ul::pdu::UserIdentity>,
	) -> Result<(), dicom::ul::pdu::AssociationRJServiceUserReason> {
		let Some(called) = self.registry.resolve_called(called_ae_title) else {
			return Err(dicom::ul::pdu::AssociationRJServiceUserReason::CalledAETitleNotRecognized);
		};
		let Some(source_id) = self.registry.resolve_calling(calling_ae_title) else {
			return Err(dicom::ul::pdu::AssociationRJServiceUserReason::CallingAETitleNotRecognized);
		};
		if !crate::registry::Registry::is_source_allowed(&called, &source_id) {
			return Err(dicom::ul::pdu::AssociationRJServiceUserReason::NoReasonGiven);
		}

		*self.called_ae.lock().unwrap() = Some(called_ae_title.to_string());
		Ok(())
	}
}
