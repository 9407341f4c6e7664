//! Runtime-switchable transport security.
//!
//! A [`SecureChannel`] sits between the raw socket bytes and a connection's
//! buffers. In plain mode it passes bytes through untouched. Once activated it
//! runs a rustls session over the same byte stream:
//!
//! ```text
//!             receive()                         send()
//!  socket ──▶ [pending records] ──▶ rustls ──▶ inbound FramingBuffer
//!  socket ◀── outbound queue ◀── rustls ◀── application bytes
//! ```
//!
//! Activation treats every byte that is still unconsumed in the inbound buffer
//! as the start of the TLS record stream; bytes the application has already
//! read stay plaintext. Switching is only safe at a message boundary that both
//! peers agree on (for example right after a STARTTLS-style command).
//!
//! Deactivation sends `close_notify` and writes plaintext from then on. Inbound
//! records are fed to rustls one at a time, so when the peer's `close_notify`
//! arrives every byte after it is handed to the application as plaintext.

use std::{
    fmt, fs,
    io::{Read, Write},
    path::Path,
    sync::Arc,
};

use bytes::{BufMut, BytesMut};
use rustls::{
    crypto::CryptoProvider,
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName},
    ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection,
};
use tracing::{debug, trace};

use crate::{
    error::{Error, Result},
    framing::FramingBuffer,
};

const TLS_HEADER_LEN: usize = 5;

/// Security state of a connection as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureState {
    Plain,
    Handshaking,
    Secured,
}

/// Which side of the TLS handshake a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRole {
    Server,
    Client,
}

/// TLS material for servers and clients.
#[derive(Clone, Default)]
pub struct SecureContext {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
    server_name: Option<ServerName<'static>>,
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn pem_error(what: &str, err: impl fmt::Display) -> Error {
    Error::Configuration(format!("invalid {}: {}", what, err))
}

impl SecureContext {
    pub fn server(config: Arc<ServerConfig>) -> Self {
        Self::default().with_server(config)
    }

    pub fn client(config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        Self::default().with_client(config, server_name)
    }

    pub fn with_server(mut self, config: Arc<ServerConfig>) -> Self {
        self.server = Some(config);
        self
    }

    pub fn with_client(mut self, config: Arc<ClientConfig>, server_name: &str) -> Result<Self> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| pem_error("server name", e))?;
        self.client = Some(config);
        self.server_name = Some(name);
        Ok(self)
    }

    /// Server context from a PEM certificate chain and private key.
    pub fn from_pem(cert_chain_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let certs = CertificateDer::pem_slice_iter(cert_chain_pem)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| pem_error("certificate", e))?;
        if certs.is_empty() {
            return Err(Error::Configuration("no certificate found in PEM input".into()));
        }
        let key = PrivateKeyDer::from_pem_slice(key_pem).map_err(|e| pem_error("private key", e))?;
        Ok(Self::server(Self::server_config(certs, key)?))
    }

    pub fn from_pem_files(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let certs = fs::read(cert_path)?;
        let key = fs::read(key_path)?;
        Self::from_pem(&certs, &key)
    }

    /// Client context trusting the PEM certificates in `ca_pem`.
    pub fn client_from_pem_roots(ca_pem: &[u8], server_name: &str) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        for cert in CertificateDer::pem_slice_iter(ca_pem) {
            roots.add(cert.map_err(|e| pem_error("CA certificate", e))?)?;
        }
        Self::client(Self::client_config(roots)?, server_name)
    }

    pub fn server_config(
        cert_chain: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Arc<ServerConfig>> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(cert_chain, key)?;
        Ok(Arc::new(config))
    }

    pub fn client_config(roots: RootCertStore) -> Result<Arc<ClientConfig>> {
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
        Ok(Arc::new(config))
    }

    /// Whether this context can start a session in `role`.
    pub fn supports(&self, role: TlsRole) -> bool {
        match role {
            TlsRole::Server => self.server.is_some(),
            TlsRole::Client => self.client.is_some() && self.server_name.is_some(),
        }
    }

    fn session(&self, role: TlsRole) -> Result<Connection> {
        let conn: Connection = match role {
            TlsRole::Server => {
                let config = self.server.clone().ok_or(Error::SecureModeUnavailable)?;
                ServerConnection::new(config)?.into()
            }
            TlsRole::Client => {
                let config = self.client.clone().ok_or(Error::SecureModeUnavailable)?;
                let name = self.server_name.clone().ok_or(Error::SecureModeUnavailable)?;
                ClientConnection::new(config, name)?.into()
            }
        };
        Ok(conn)
    }
}

impl fmt::Debug for SecureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureContext")
            .field("server", &self.server.is_some())
            .field("client", &self.client.is_some())
            .field("server_name", &self.server_name)
            .finish()
    }
}

/// Sans-IO security layer of one connection.
///
/// All methods are called with the connection's I/O state locked, so a
/// single `send` is encrypted (or not) as a whole.
pub struct SecureChannel {
    context: Option<SecureContext>,
    role: TlsRole,
    tls: Option<Connection>,
    // false once close_notify has been sent
    write_secure: bool,
    // received ciphertext not yet forming a whole record
    pending: BytesMut,
}

impl SecureChannel {
    pub fn new(context: Option<SecureContext>, role: TlsRole) -> Self {
        Self {
            context,
            role,
            tls: None,
            write_secure: false,
            pending: BytesMut::new(),
        }
    }

    pub fn role(&self) -> TlsRole {
        self.role
    }

    pub fn is_available(&self) -> bool {
        self.context
            .as_ref()
            .map(|c| c.supports(self.role))
            .unwrap_or(false)
    }

    pub fn state(&self) -> SecureState {
        match &self.tls {
            Some(tls) if tls.is_handshaking() => SecureState::Handshaking,
            Some(_) if self.write_secure => SecureState::Secured,
            _ => SecureState::Plain,
        }
    }

    /// Starts a TLS session. Unconsumed bytes in `inbound` become the first
    /// bytes of the record stream. No-op while handshaking or secured.
    pub fn activate(&mut self, inbound: &mut FramingBuffer, outbound: &mut BytesMut) -> Result<()> {
        if self.tls.is_some() {
            if self.write_secure {
                return Ok(());
            }
            return Err(Error::Protocol(
                "previous secure session is still shutting down".into(),
            ));
        }
        let context = self.context.as_ref().ok_or(Error::SecureModeUnavailable)?;
        let mut tls = context.session(self.role)?;
        // plaintext written during the handshake is queued, not rejected
        tls.set_buffer_limit(None);
        self.tls = Some(tls);
        self.write_secure = true;

        let leftover = inbound.read_available();
        debug!(role = ?self.role, leftover = leftover.len(), "secure mode activated");
        self.receive(&leftover, inbound, outbound)?;
        if let Some(tls) = self.tls.as_mut() {
            drain_tls(tls, outbound)?;
        }
        Ok(())
    }

    /// Sends `close_notify`; later writes are plaintext. Inbound stays
    /// encrypted until the peer's `close_notify` arrives.
    pub fn deactivate(&mut self, outbound: &mut BytesMut) -> Result<()> {
        match self.tls.as_mut() {
            Some(tls) if self.write_secure => {
                tls.send_close_notify();
                self.write_secure = false;
                drain_tls(tls, outbound)?;
                debug!(role = ?self.role, "secure mode deactivated");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Queues application bytes for the socket, encrypting them if secured.
    pub fn send(&mut self, data: &[u8], outbound: &mut BytesMut) -> Result<()> {
        match self.tls.as_mut() {
            Some(tls) if self.write_secure => {
                tls.writer().write_all(data)?;
                drain_tls(tls, outbound)
            }
            _ => {
                outbound.extend_from_slice(data);
                Ok(())
            }
        }
    }

    /// Processes bytes read from the socket. Plaintext goes to `inbound`,
    /// handshake and alert records to `outbound`. Returns the number of
    /// application bytes appended to `inbound`.
    ///
    /// ## Errors
    ///
    /// A TLS failure is returned after any alert has been queued; the
    /// connection is expected to close.
    pub fn receive(
        &mut self,
        data: &[u8],
        inbound: &mut FramingBuffer,
        outbound: &mut BytesMut,
    ) -> Result<usize> {
        if self.tls.is_none() {
            inbound.append(data);
            return Ok(data.len());
        }

        self.pending.extend_from_slice(data);
        let mut appended = 0;

        while let Some(tls) = self.tls.as_mut() {
            let Some(record_len) = next_record_len(&self.pending) else {
                break;
            };
            let record = self.pending.split_to(record_len);
            let was_handshaking = tls.is_handshaking();

            let mut rd: &[u8] = &record;
            while !rd.is_empty() {
                if tls.read_tls(&mut rd)? == 0 {
                    break;
                }
            }
            let state = match tls.process_new_packets() {
                Ok(state) => state,
                Err(e) => {
                    let _ = drain_tls(tls, outbound);
                    return Err(e.into());
                }
            };

            let plain = state.plaintext_bytes_to_read();
            if plain > 0 {
                let mut buf = vec![0u8; plain];
                tls.reader().read_exact(&mut buf)?;
                inbound.append(&buf);
                appended += plain;
            }
            if was_handshaking && !tls.is_handshaking() {
                debug!(
                    role = ?self.role,
                    version = ?tls.protocol_version(),
                    "secure handshake complete"
                );
            }

            if state.peer_has_closed() {
                if self.write_secure {
                    tls.send_close_notify();
                    self.write_secure = false;
                }
                drain_tls(tls, outbound)?;
                self.tls = None;

                let rest = self.pending.split();
                appended += rest.len();
                inbound.append(&rest);
                debug!(role = ?self.role, "peer closed secure session, inbound is plain");
            }
        }

        if let Some(tls) = self.tls.as_mut() {
            drain_tls(tls, outbound)?;
        }
        trace!(appended, "secure channel received");
        Ok(appended)
    }
}

/// Length of the first complete TLS record in `buf`, header included.
fn next_record_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < TLS_HEADER_LEN {
        return None;
    }
    let len = TLS_HEADER_LEN + u16::from_be_bytes([buf[3], buf[4]]) as usize;
    (buf.len() >= len).then_some(len)
}

fn drain_tls(tls: &mut Connection, outbound: &mut BytesMut) -> Result<()> {
    let mut writer = (&mut *outbound).writer();
    while tls.wants_write() {
        tls.write_tls(&mut writer)?;
    }
    Ok(())
}
