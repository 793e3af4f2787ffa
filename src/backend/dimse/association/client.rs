use dicom::ul::pdu::{PDataValueType, PresentationContextNegotiated};
use dicom::ul::Pdu;
use std::convert::identity;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tokio_rustls::rustls::ClientConfig;
use tracing::{debug, error};
use uuid::Uuid;

use super::{tls, AskPattern, Association, AssociationError, ChannelError, Command};

pub struct ClientAssociation {
	channel: Sender<Command>,
	uuid: Uuid,
	tcp_stream: TcpStream,
	presentation_contexts: Vec<PresentationContextNegotiated>,
}

pub struct ClientAssociationOptions {
	pub calling_aet: String,
	pub called_aet: String,
	pub abstract_syntax: String,
	pub transfer_syntaxes: Vec<String>,
	pub address: SocketAddr,
	/// Host name the TLS certificate of the peer is verified against.
	pub server_name: String,
	pub tls: Option<Arc<ClientConfig>>,
}

impl ClientAssociation {
	fn chunked_send(
		association: &mut dicom::ul::ClientAssociation<TcpStream>,
		pdu: &Pdu,
	) -> Result<(), AssociationError> {
		match &pdu {
			Pdu::PData { data } => {
				let is_command = data
					.first()
					.is_some_and(|pdv| pdv.value_type == PDataValueType::Command);
				let data_length: usize = data.iter().map(|pdv| pdv.data.len()).sum();
				if is_command || data_length <= association.acceptor_max_pdu_length() as usize {
					association.send(pdu).map_err(AssociationError::from)
				} else {
					for pdv in data {
						let mut writer = association.send_pdata(pdv.presentation_context_id);
						writer
							.write_all(&pdv.data)
							.map_err(AssociationError::ChunkWriter)?;
					}
					Ok(())
				}
			}
			_ => association.send(pdu).map_err(AssociationError::from),
		}
	}

	pub async fn new(options: ClientAssociationOptions) -> Result<Self, AssociationError> {
		let uuid = Uuid::new_v4();
		let (tx, mut rx) = tokio::sync::mpsc::channel::<Command>(1);
		let (connect_tx, connect_result) = oneshot::channel::<Result<_, AssociationError>>();

		let address = match options.tls {
			Some(config) => tls::tunnel(options.address, &options.server_name, config).await?,
			None => options.address,
		};
		let thread_name = options.calling_aet.clone();
		let options = dicom::ul::ClientAssociationOptions::new()
			.calling_ae_title(options.calling_aet)
			.called_ae_title(options.called_aet)
			.with_presentation_context(options.abstract_syntax, options.transfer_syntaxes);

		thread::Builder::new()
			.name(thread_name)
			.spawn(move || {
				let mut association = match options.establish(address) {
					Ok(mut association) => {
						let presentation_contexts = Vec::from(association.presentation_contexts());
						match association.inner_stream().try_clone() {
							Ok(stream) => {
								connect_tx
									.send(Ok((stream, presentation_contexts)))
									.map_err(|_| ())?;
							}
							Err(err) => {
								let _ = association.abort();
								connect_tx
									.send(Err(AssociationError::Stream(err)))
									.map_err(|_| ())?;
								return Err(());
							}
						}
						association
					}
					Err(e) => {
						error!(backend_uuid = uuid.to_string(), "Failed to connect: {e}");
						connect_tx.send(Err(e.into())).map_err(|_| ())?;
						return Err(());
					}
				};

				while let Some(command) = rx.blocking_recv() {
					let result = match command {
						Command::Send(pdu, reply_to) => {
							let send_result = Self::chunked_send(&mut association, &pdu);
							reply_to.send(send_result).map_err(|_| ChannelError::Closed)
						}
						Command::Receive(reply_to) => {
							let receive_result =
								association.receive().map_err(AssociationError::from);
							reply_to
								.send(receive_result)
								.map_err(|_| ChannelError::Closed)
						}
						Command::Release(reply_to) => {
							let release_result = association.release().map_err(AssociationError::from);
							let _ = reply_to.send(release_result);
							return Ok(());
						}
					};
					if let Some(err) = result.err() {
						error!(
							backend_uuid = uuid.to_string(),
							"Error in ClientAssociation backend: {err}"
						);
						return Err(());
					}
				}

				rx.close();

				if let Err(err) = association.abort() {
					debug!(
						backend_uuid = uuid.to_string(),
						"Failed to abort ClientAssociation: {err}"
					);
				}

				Ok(())
			})
			.map_err(AssociationError::OsThread)?;

		let (tcp_stream, presentation_contexts) = connect_result
			.await
			.map_err(|_| ChannelError::Closed)??;

		Ok(Self {
			channel: tx,
			uuid,
			tcp_stream,
			presentation_contexts,
		})
	}

	pub const fn uuid(&self) -> &Uuid {
		&self.uuid
	}

	/// Sends an A-RELEASE-RQ and waits for the peer to confirm it.
	pub async fn release(self, timeout: Duration) -> Result<(), AssociationError> {
		self.channel
			.ask(Command::Release, timeout)
			.await
			.map_err(AssociationError::Channel)
			.and_then(identity)
	}
}

impl Drop for ClientAssociation {
	fn drop(&mut self) {
		self.close();
	}
}

impl Association for ClientAssociation {
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
		if let Err(err) = self.tcp_stream.shutdown(std::net::Shutdown::Both) {
			debug!(
				backend_uuid = self.uuid.to_string(),
				"Failed to shutdown TcpStream: {err}"
			);
		}
	}

	fn presentation_contexts(&self) -> &[PresentationContextNegotiated] {
		&self.presentation_contexts
	}
}
