//! Socket transport: non-blocking TCP, optionally wrapped in rustls.
//!
//! The OS socket is always in non-blocking mode. Blocking behaviour is
//! layered on top by waiting in [`wait_socket`], so the same code paths
//! serve both the blocking API and callers that drive the connection from
//! their own event loop.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Instant;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned,
};
use rustls_pki_types::{CertificateDer, ServerName, UnixTime};

use crate::conninfo::SslMode;

/// Raw socket descriptor as reported to callers.
pub type Socket = i32;

// ── Stream Abstraction ─────────────────────────────────────────────────

/// A PostgreSQL connection stream that may be plain TCP or TLS-wrapped.
pub enum PgStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

/// What a non-blocking step is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Done,
    WantRead,
    WantWrite,
}

impl PgStream {
    pub fn tcp(&self) -> &TcpStream {
        match self {
            PgStream::Plain(s) => s,
            PgStream::Tls(s) => &s.sock,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, PgStream::Tls(_))
    }

    pub fn socket(&self) -> Socket {
        raw_socket(self.tcp())
    }

    /// Read whatever is available. `Ok(0)` means the server closed the
    /// connection; `WouldBlock` means nothing is available yet.
    pub fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            PgStream::Plain(s) => s.read(buf),
            PgStream::Tls(tls) => loop {
                match tls.conn.reader().read(buf) {
                    Ok(n) => return Ok(n),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(e),
                }
                match tls.conn.read_tls(&mut tls.sock) {
                    Ok(0) => return Ok(0),
                    Ok(_) => {
                        tls.conn
                            .process_new_packets()
                            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    }
                    Err(e) => return Err(e),
                }
            },
        }
    }

    /// Write as much of `data` as the socket accepts without blocking.
    pub fn write_some(&mut self, data: &[u8]) -> io::Result<usize> {
        if !self.flush_pending()? {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        match self {
            PgStream::Plain(s) => s.write(data),
            PgStream::Tls(tls) => {
                let n = tls.conn.writer().write(data)?;
                // The plaintext is already accepted; a socket error
                // resurfaces on the next flush.
                let _ = self.flush_pending();
                Ok(n)
            }
        }
    }

    /// Push buffered TLS records to the socket. Returns `true` once nothing
    /// is left inside the TLS layer.
    pub fn flush_pending(&mut self) -> io::Result<bool> {
        match self {
            PgStream::Plain(_) => Ok(true),
            PgStream::Tls(tls) => {
                while tls.conn.wants_write() {
                    match tls.conn.write_tls(&mut tls.sock) {
                        Ok(_) => {}
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                        Err(e) => return Err(e),
                    }
                }
                Ok(true)
            }
        }
    }

    /// Advance the TLS handshake as far as the socket allows.
    pub fn handshake(&mut self) -> io::Result<Progress> {
        let tls = match self {
            PgStream::Plain(_) => return Ok(Progress::Done),
            PgStream::Tls(tls) => tls,
        };
        loop {
            if tls.conn.wants_write() {
                match tls.conn.write_tls(&mut tls.sock) {
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(Progress::WantWrite)
                    }
                    Err(e) => return Err(e),
                }
            }
            if !tls.conn.is_handshaking() {
                return Ok(Progress::Done);
            }
            match tls.conn.read_tls(&mut tls.sock) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(_) => {
                    tls.conn
                        .process_new_packets()
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Progress::WantRead),
                Err(e) => return Err(e),
            }
        }
    }

    pub fn shutdown(&mut self) {
        if let PgStream::Tls(tls) = self {
            tls.conn.send_close_notify();
            let _ = self.flush_pending();
        }
        let _ = self.tcp().shutdown(std::net::Shutdown::Both);
    }
}

// ── TLS Negotiation ────────────────────────────────────────────────────

/// Certificate verifier for the sslmodes that encrypt without
/// authenticating the server (allow, prefer, require).
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn tls_config(sslmode: SslMode) -> ClientConfig {
    match sslmode {
        SslMode::VerifyCa | SslMode::VerifyFull => {
            let root_store =
                RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        }
        _ => {
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
                .with_no_client_auth()
        }
    }
}

/// Wrap a connected TCP stream in a client-side TLS session. The handshake
/// itself is driven by [`PgStream::handshake`].
pub fn upgrade_to_tls(
    stream: TcpStream,
    hostname: &str,
    sslmode: SslMode,
) -> Result<PgStream, String> {
    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|_| format!("invalid hostname for TLS: {}", hostname))?;
    let conn = ClientConnection::new(Arc::new(tls_config(sslmode)), server_name)
        .map_err(|e| format!("TLS connection: {}", e))?;
    Ok(PgStream::Tls(Box::new(StreamOwned::new(conn, stream))))
}

// ── Socket Primitives ──────────────────────────────────────────────────

#[cfg(unix)]
fn raw_socket(stream: &TcpStream) -> Socket {
    use std::os::unix::io::AsRawFd;
    stream.as_raw_fd()
}

#[cfg(not(unix))]
fn raw_socket(stream: &TcpStream) -> Socket {
    use std::os::windows::io::AsRawSocket;
    stream.as_raw_socket() as Socket
}

#[cfg(unix)]
fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // SAFETY: sockaddr_storage is plain data; all-zero is a valid value and
    // is large and aligned enough for both address families.
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(a) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = a.port().to_be();
            sin.sin_addr.s_addr = u32::from_ne_bytes(a.ip().octets());
            (storage, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(a) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = a.port().to_be();
            sin6.sin6_addr.s6_addr = a.ip().octets();
            sin6.sin6_flowinfo = a.flowinfo();
            sin6.sin6_scope_id = a.scope_id();
            (storage, std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Begin a TCP connect without waiting for it to complete.
#[cfg(unix)]
pub fn start_connect(addr: &SocketAddr) -> io::Result<TcpStream> {
    use std::os::unix::io::FromRawFd;

    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly created socket owned by nobody else. Wrapping
    // it immediately closes it on every error path below.
    let stream = unsafe { TcpStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;

    let (storage, len) = sockaddr_of(addr);
    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
    }
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

#[cfg(not(unix))]
pub fn start_connect(addr: &SocketAddr) -> io::Result<TcpStream> {
    let stream = TcpStream::connect_timeout(addr, std::time::Duration::from_secs(30))?;
    stream.set_nonblocking(true)?;
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// Check the outcome of a connect started with [`start_connect`] once the
/// socket reports writable.
pub fn connect_finished(stream: &TcpStream) -> io::Result<()> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    stream.peer_addr().map(|_| ())
}

/// Wait until the socket is readable and/or writable.
///
/// Returns `Ok(false)` if `deadline` passed first.
#[cfg(unix)]
pub fn wait_socket(
    socket: Socket,
    for_read: bool,
    for_write: bool,
    deadline: Option<Instant>,
) -> io::Result<bool> {
    let mut events = 0;
    if for_read {
        events |= libc::POLLIN;
    }
    if for_write {
        events |= libc::POLLOUT;
    }
    loop {
        let timeout_ms = match deadline {
            None => -1,
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return Ok(false);
                }
                (d - now).as_millis().min(i32::MAX as u128) as i32
            }
        };
        let mut pfd = libc::pollfd {
            fd: socket,
            events,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            continue;
        }
        return Ok(true);
    }
}

#[cfg(not(unix))]
pub fn wait_socket(
    _socket: Socket,
    _for_read: bool,
    _for_write: bool,
    deadline: Option<Instant>,
) -> io::Result<bool> {
    if deadline.is_some_and(|d| Instant::now() >= d) {
        return Ok(false);
    }
    std::thread::sleep(std::time::Duration::from_millis(1));
    Ok(true)
}
