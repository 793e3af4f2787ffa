//! TLS transport for client associations.
//!
//! The upper layer runs over a plain socket on a worker thread, so TLS is terminated by a
//! loopback relay: the association connects to a local port that forwards every byte through
//! an established TLS session with the peer.

use std::fs::File;
use std::io::BufReader;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::crypto::ring;
use tokio_rustls::rustls::pki_types::{CertificateDer, InvalidDnsNameError, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

const CA_FILE: &str = "ca.pem";
const CERTIFICATE_FILE: &str = "tls.pem";
const KEY_FILE: &str = "tls.key";

#[derive(Debug, Error)]
pub enum TlsError {
	#[error("Failed to read {path}: {source}")]
	File {
		path: PathBuf,
		source: std::io::Error,
	},
	#[error("No private key found in {0}")]
	MissingKey(PathBuf),
	#[error(transparent)]
	Rustls(#[from] tokio_rustls::rustls::Error),
	#[error("Invalid server name: {0}")]
	ServerName(#[from] InvalidDnsNameError),
	#[error("TLS transport failed: {0}")]
	Io(#[from] std::io::Error),
}

/// Builds client TLS configurations from a directory holding `ca.pem` and optionally a client
/// certificate (`tls.pem`) with its key (`tls.key`).
#[derive(Debug, Clone)]
pub struct TlsLoader {
	certs_dir: PathBuf,
}

impl TlsLoader {
	pub fn new(certs_dir: impl Into<PathBuf>) -> Self {
		Self {
			certs_dir: certs_dir.into(),
		}
	}

	pub fn client_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
		let mut roots = RootCertStore::empty();
		for certificate in read_certificates(&self.certs_dir.join(CA_FILE))? {
			roots.add(certificate)?;
		}

		let builder = ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
			.with_safe_default_protocol_versions()?
			.with_root_certificates(roots);

		let certificate_path = self.certs_dir.join(CERTIFICATE_FILE);
		let key_path = self.certs_dir.join(KEY_FILE);
		let config = if certificate_path.exists() && key_path.exists() {
			let chain = read_certificates(&certificate_path)?;
			let key = rustls_pemfile::private_key(&mut open(&key_path)?)
				.map_err(|source| TlsError::File {
					path: key_path.clone(),
					source,
				})?
				.ok_or(TlsError::MissingKey(key_path))?;
			builder.with_client_auth_cert(chain, key)?
		} else {
			builder.with_no_client_auth()
		};

		Ok(Arc::new(config))
	}
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
	File::open(path)
		.map(BufReader::new)
		.map_err(|source| TlsError::File {
			path: path.to_path_buf(),
			source,
		})
}

fn read_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
	rustls_pemfile::certs(&mut open(path)?)
		.collect::<Result<Vec<_>, _>>()
		.map_err(|source| TlsError::File {
			path: path.to_path_buf(),
			source,
		})
}

/// Performs the TLS handshake with `remote` and returns a loopback address that relays a single
/// connection through the established session.
pub async fn tunnel(
	remote: SocketAddr,
	server_name: &str,
	config: Arc<ClientConfig>,
) -> Result<SocketAddr, TlsError> {
	let server_name = ServerName::try_from(server_name.to_owned())?;
	let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
	let local = listener.local_addr()?;

	let upstream = TcpStream::connect(remote).await?;
	let mut upstream = TlsConnector::from(config)
		.connect(server_name, upstream)
		.await?;

	tokio::spawn(async move {
		match listener.accept().await {
			Ok((mut downstream, _)) => {
				match copy_bidirectional(&mut downstream, &mut upstream).await {
					Ok((sent, received)) => {
						debug!(sent, received, "TLS relay closed");
					}
					Err(err) => debug!("TLS relay closed: {err}"),
				}
			}
			Err(err) => warn!("Failed to accept relay connection: {err}"),
		}
	});

	Ok(local)
}
