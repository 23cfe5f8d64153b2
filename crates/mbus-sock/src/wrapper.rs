//! Transport wrappers: bind one stub to one byte stream.
//!
//! A wrapper owns the descriptor, watches it on the event manager, feeds
//! received bytes to the stub and drains the stub's coder on notify.
//! Plain mode scatter-writes frames; TLS mode drives a rustls connection
//! sans-io; WebSocket mode maps frames one-to-one onto binary messages.
//!
//! Reception keeps a tail buffer for partial frames. While the stub
//! processes bytes, a nested teardown (a verb replying and closing the
//! connection, a protocol error) marks the state `dropped`; the wrapper
//! re-reads that flag after the stub returns before touching the buffer
//! again.

use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use mbus_evloop::{EvFd, EvMgr, EV_HUP, EV_IN};
use mbus_rpc::Stub;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, trace, warn};

use crate::error::SockError;
use crate::uri::SockSpec;

const READ_CHUNK: usize = 4096;

// ---------------------------------------------------------------------------
// Nonblocking stream over an owned descriptor
// ---------------------------------------------------------------------------

struct FdStream {
    fd: OwnedFd,
}

impl FdStream {
    fn new(fd: OwnedFd) -> FdStream {
        FdStream { fd }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<(), SockError> {
        let fd = self.fd.as_raw_fd();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(SockError::Io(std::io::Error::last_os_error()));
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
            return Err(SockError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Wait until the descriptor accepts more bytes.
    fn wait_writable(&self) {
        let mut fds = [PollFd::new(self.fd.as_fd(), PollFlags::POLLOUT)];
        let _ = poll(&mut fds, PollTimeout::from(100u16));
    }
}

impl Read for FdStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        nix::unistd::read(self.fd.as_raw_fd(), buf).map_err(std::io::Error::from)
    }
}

impl Write for FdStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        nix::unistd::write(&self.fd, buf).map_err(std::io::Error::from)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Write the whole buffer, waiting out `WouldBlock` episodes.
fn write_full(stream: &mut FdStream, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => stream.wait_writable(),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Transport forms
// ---------------------------------------------------------------------------

enum Transport {
    Plain(FdStream),
    Tls {
        stream: FdStream,
        conn: Box<rustls::Connection>,
    },
    Ws(Box<tungstenite::WebSocket<FdStream>>),
}

/// Reconnection hooks of a robustified wrapper.
pub struct Robustify {
    /// Produce a fresh connected descriptor, or a negative code.
    pub reopen: Box<dyn FnMut() -> Result<OwnedFd, i32> + Send>,
    /// Run when the wrapper is destroyed.
    pub release: Option<Box<dyn FnOnce() + Send>>,
}

struct TlsParams {
    host: Option<String>,
    cert: Option<String>,
    key: Option<String>,
    trust: Option<String>,
}

struct WrapState {
    transport: Option<Transport>,
    /// Transport temporarily taken out by the running read/write path.
    busy: bool,
    efd: Option<EvFd>,
    buffer: Vec<u8>,
    dropped: bool,
}

struct WrapInner {
    evmgr: EvMgr,
    stub: Stub,
    websocket: bool,
    tls: bool,
    mutual: bool,
    server: bool,
    tls_params: TlsParams,
    state: Mutex<WrapState>,
    robust: Mutex<Option<Robustify>>,
    destroyed: AtomicBool,
}

/// One transport wrapper owning one stub and one byte stream.
#[derive(Clone)]
pub struct Wrapper {
    inner: Arc<WrapInner>,
}

impl Wrapper {
    /// Wrap `fd` according to the URI's transport flags and query
    /// arguments (`host=`, `cert=`, `key=`, `trust=`).
    pub fn create(
        evmgr: &EvMgr,
        stub: Stub,
        fd: OwnedFd,
        server: bool,
        spec: &SockSpec,
    ) -> Result<Wrapper, SockError> {
        let host_from_rest = spec
            .rest
            .split([':', '/'])
            .next()
            .filter(|h| !h.is_empty())
            .map(str::to_string);
        let inner = Arc::new(WrapInner {
            evmgr: evmgr.clone(),
            stub,
            websocket: spec.flags.websocket,
            tls: spec.flags.tls,
            mutual: spec.flags.mutual,
            server,
            tls_params: TlsParams {
                host: spec
                    .query_arg("host")
                    .filter(|h| !h.is_empty())
                    .map(str::to_string)
                    .or(host_from_rest),
                cert: spec.query_arg("cert").map(str::to_string),
                key: spec.query_arg("key").map(str::to_string),
                trust: spec.query_arg("trust").map(str::to_string),
            },
            state: Mutex::new(WrapState {
                transport: None,
                busy: false,
                efd: None,
                buffer: Vec::new(),
                dropped: false,
            }),
            robust: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });
        let wrapper = Wrapper { inner };
        let transport = wrapper.open_transport(fd)?;
        wrapper.install_transport(transport)?;

        let weak = Arc::downgrade(&wrapper.inner);
        wrapper.inner.stub.set_notify(move |_stub| match weak.upgrade() {
            Some(inner) => Wrapper { inner }.flush(),
            None => -(libc::EPIPE),
        });
        Ok(wrapper)
    }

    pub fn stub(&self) -> &Stub {
        &self.inner.stub
    }

    /// Declare the stub's imports locally and send the version offer.
    pub fn start_client(&self) -> Result<(), mbus_core::CoreError> {
        self.inner.stub.client_add()?;
        self.inner.stub.offer_version();
        Ok(())
    }

    /// Install the reconnection hooks.
    pub fn robustify(&self, robust: Robustify) {
        let old = self.inner.robust.lock().unwrap().replace(robust);
        if let Some(old) = old {
            if let Some(release) = old.release {
                release();
            }
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Transport lifecycle
    // ------------------------------------------------------------------

    /// Build the per-mode transport over a fresh descriptor. Handshakes
    /// (TLS, WebSocket upgrade) run blocking, then the stream turns
    /// nonblocking for the loop.
    fn open_transport(&self, fd: OwnedFd) -> Result<Transport, SockError> {
        let stream = FdStream::new(fd);
        stream.set_nonblocking(false)?;
        let transport = if self.inner.websocket {
            self.inner.stub.set_unpack(true);
            let ws = if self.inner.server {
                tungstenite::accept(stream)
                    .map_err(|e| SockError::WebSocket(e.to_string()))?
            } else {
                let host = self.inner.tls_params.host.as_deref().unwrap_or("localhost");
                let url = format!("ws://{host}/");
                let (ws, _response) = tungstenite::client(url.as_str(), stream)
                    .map_err(|e| SockError::WebSocket(e.to_string()))?;
                ws
            };
            Transport::Ws(Box::new(ws))
        } else if self.inner.tls {
            let mut conn = crate::wrapper::tls::connection(
                self.inner.server,
                self.inner.mutual,
                &self.inner.tls_params,
            )?;
            let mut stream = stream;
            while conn.is_handshaking() {
                if conn.wants_write() {
                    conn.write_tls(&mut stream).map_err(SockError::Io)?;
                    continue;
                }
                if conn.read_tls(&mut stream).map_err(SockError::Io)? == 0 {
                    return Err(SockError::Tls("peer closed during handshake".into()));
                }
                conn.process_new_packets()
                    .map_err(|e| SockError::Tls(e.to_string()))?;
            }
            Transport::Tls {
                stream,
                conn: Box::new(conn),
            }
        } else {
            Transport::Plain(stream)
        };
        transport_stream(&transport).set_nonblocking(true)?;
        Ok(transport)
    }

    /// Register the transport's descriptor and store it.
    fn install_transport(&self, transport: Transport) -> Result<(), SockError> {
        let raw = transport_stream(&transport).fd.as_raw_fd();
        let weak = Arc::downgrade(&self.inner);
        let efd = self.inner.evmgr.add_fd(
            raw,
            EV_IN,
            move |_efd, revents| {
                if let Some(inner) = weak.upgrade() {
                    Wrapper { inner }.on_fd_event(revents);
                }
            },
            false,
            false,
        )?;
        let mut st = self.inner.state.lock().unwrap();
        st.transport = Some(transport);
        st.efd = Some(efd);
        st.dropped = false;
        Ok(())
    }

    /// Tear the connection down; the stub fails its in-flight calls.
    pub fn disconnect(&self) {
        {
            let mut st = self.inner.state.lock().unwrap();
            st.transport = None;
            st.efd = None;
            st.buffer.clear();
            st.dropped = true;
        }
        let _ = self.inner.stub.coder().drain();
        self.inner.stub.disconnected();
        debug!("wrapper disconnected");
    }

    fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.disconnect();
        if let Some(robust) = self.inner.robust.lock().unwrap().take() {
            if let Some(release) = robust.release {
                release();
            }
        }
    }

    /// HUP policy: reconnectable wrappers only disconnect, the others die.
    fn hangup(&self) {
        let has_reopen = self.inner.robust.lock().unwrap().is_some();
        if has_reopen {
            self.disconnect();
        } else {
            self.destroy();
        }
    }

    fn reconnect(&self) -> Result<Transport, i32> {
        let fd = {
            let mut robust = self.inner.robust.lock().unwrap();
            match robust.as_mut() {
                None => return Err(-(libc::EPIPE)),
                Some(r) => match (r.reopen)() {
                    Ok(fd) => fd,
                    Err(rc) => {
                        debug!(rc, "reopen failed");
                        return Err(if rc < 0 { rc } else { -(libc::EPIPE) });
                    }
                },
            }
        };
        let transport = self.open_transport(fd).map_err(|e| {
            warn!(error = %e, "reopen handshake failed");
            e.raw_code()
        })?;
        // Register the new descriptor; the transport itself stays out,
        // the caller is about to use it.
        let raw = transport_stream(&transport).fd.as_raw_fd();
        let weak = Arc::downgrade(&self.inner);
        let efd = self
            .inner
            .evmgr
            .add_fd(
                raw,
                EV_IN,
                move |_efd, revents| {
                    if let Some(inner) = weak.upgrade() {
                        Wrapper { inner }.on_fd_event(revents);
                    }
                },
                false,
                false,
            )
            .map_err(|_| -(libc::EIO))?;
        {
            let mut st = self.inner.state.lock().unwrap();
            st.efd = Some(efd);
            st.dropped = false;
        }
        // The fresh connection negotiates before any application frame.
        let queued = self.inner.stub.coder().drain();
        self.inner.stub.offer_version();
        self.inner.stub.coder().requeue(queued);
        debug!("wrapper reconnected");
        Ok(transport)
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    /// Drain the stub's coder into the transport. Returns 0 or a
    /// negative code; on transport failure the wrapper hangs up.
    fn flush(&self) -> i32 {
        if self.is_destroyed() {
            // Calls queued after destruction still deserve their failure
            // reply; the in-flight map must not retain them.
            self.inner.stub.disconnected();
            return -(libc::EPIPE);
        }
        let taken = {
            let mut st = self.inner.state.lock().unwrap();
            if st.busy {
                // Reentrant notify from inside the read path: the frames
                // stay queued, the owner flushes them on return.
                return 0;
            }
            st.busy = true;
            st.transport.take()
        };
        let mut transport = match taken {
            Some(t) => t,
            None => match self.reconnect() {
                Ok(t) => t,
                Err(rc) => {
                    self.release_busy(None);
                    return rc;
                }
            },
        };

        let bufs = self.inner.stub.coder().drain();
        let result = write_frames(&mut transport, &bufs);
        match result {
            Ok(()) => {
                self.release_busy(Some(transport));
                0
            }
            Err(e) => {
                warn!(error = %e, "transport write failed");
                self.release_busy(None);
                self.hangup();
                -(libc::EPIPE)
            }
        }
    }

    /// Clear the busy flag, restoring the transport unless a nested
    /// teardown dropped the connection meanwhile.
    fn release_busy(&self, transport: Option<Transport>) {
        let mut st = self.inner.state.lock().unwrap();
        st.busy = false;
        if let Some(t) = transport {
            if st.dropped {
                st.dropped = false;
            } else {
                st.transport = Some(t);
            }
        }
    }

    // ------------------------------------------------------------------
    // Input
    // ------------------------------------------------------------------

    fn on_fd_event(&self, revents: u32) {
        if revents & EV_IN != 0 {
            self.on_readable();
        }
        if revents & EV_HUP != 0 && !self.is_destroyed() {
            // Remaining bytes were drained above; the peer is gone.
            let connected = self.inner.state.lock().unwrap().transport.is_some();
            if connected {
                self.hangup();
            }
        }
    }

    fn on_readable(&self) {
        let taken = {
            let mut st = self.inner.state.lock().unwrap();
            if st.busy {
                return;
            }
            st.busy = true;
            st.transport.take()
        };
        let Some(mut transport) = taken else {
            self.release_busy(None);
            return;
        };

        let outcome = match &mut transport {
            Transport::Plain(stream) => self.read_plain(stream),
            Transport::Tls { stream, conn } => self.read_tls(stream, conn),
            Transport::Ws(ws) => self.read_ws(ws),
        };

        match outcome {
            ReadOutcome::Keep => {
                self.release_busy(Some(transport));
                // Frames the stub produced while we held the transport.
                self.flush();
            }
            ReadOutcome::Hangup => {
                drop(transport);
                self.release_busy(None);
                self.hangup();
            }
        }
    }

    /// Plain stream: append every readable byte, then let the stub
    /// consume whole frames, keeping the unconsumed tail.
    fn read_plain(&self, stream: &mut FdStream) -> ReadOutcome {
        let mut fresh = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => return ReadOutcome::Hangup,
                Ok(n) => fresh.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => return ReadOutcome::Hangup,
            }
        }
        self.consume(fresh)
    }

    fn read_tls(&self, stream: &mut FdStream, conn: &mut rustls::Connection) -> ReadOutcome {
        let mut fresh = Vec::new();
        loop {
            match conn.read_tls(stream) {
                Ok(0) => return ReadOutcome::Hangup,
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => return ReadOutcome::Hangup,
            }
            if conn.process_new_packets().is_err() {
                return ReadOutcome::Hangup;
            }
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match conn.reader().read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => fresh.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                    Err(_) => break,
                }
            }
        }
        self.consume(fresh)
    }

    /// WebSocket: every binary message carries whole frames and must be
    /// consumed entirely.
    fn read_ws(&self, ws: &mut tungstenite::WebSocket<FdStream>) -> ReadOutcome {
        loop {
            match ws.read() {
                Ok(tungstenite::Message::Binary(payload)) => {
                    match self.inner.stub.receive(&payload) {
                        Ok(used) if used == payload.len() => {}
                        Ok(_) => {
                            warn!("partial websocket message");
                            return ReadOutcome::Hangup;
                        }
                        Err(e) => {
                            warn!(error = %e, "protocol failure");
                            return ReadOutcome::Hangup;
                        }
                    }
                }
                Ok(tungstenite::Message::Close(_)) => return ReadOutcome::Hangup,
                Ok(_) => {}
                Err(tungstenite::Error::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return ReadOutcome::Keep;
                }
                Err(_) => return ReadOutcome::Hangup,
            }
        }
    }

    /// Feed `fresh` bytes after the pending tail into the stub.
    fn consume(&self, fresh: Vec<u8>) -> ReadOutcome {
        let mut buffer = {
            let mut st = self.inner.state.lock().unwrap();
            let mut pending = std::mem::take(&mut st.buffer);
            pending.extend_from_slice(&fresh);
            st.dropped = false;
            pending
        };
        if buffer.is_empty() {
            return ReadOutcome::Keep;
        }
        let consumed = match self.inner.stub.receive(&buffer) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "protocol failure");
                return ReadOutcome::Hangup;
            }
        };
        trace!(received = buffer.len(), consumed, "stub consumed bytes");
        let mut st = self.inner.state.lock().unwrap();
        if st.dropped {
            // A nested teardown discarded the connection state; the tail
            // dies with it and release_busy sees the flag next.
        } else {
            buffer.drain(..consumed);
            st.buffer = buffer;
        }
        ReadOutcome::Keep
    }
}

enum ReadOutcome {
    Keep,
    Hangup,
}

fn transport_stream(transport: &Transport) -> &FdStream {
    match transport {
        Transport::Plain(stream) => stream,
        Transport::Tls { stream, .. } => stream,
        Transport::Ws(ws) => ws.get_ref(),
    }
}

fn write_frames(transport: &mut Transport, bufs: &[Vec<u8>]) -> std::io::Result<()> {
    match transport {
        Transport::Plain(stream) => {
            for buf in bufs {
                write_full(stream, buf)?;
            }
            Ok(())
        }
        Transport::Tls { stream, conn } => {
            for buf in bufs {
                conn.writer().write_all(buf)?;
                while conn.wants_write() {
                    match conn.write_tls(stream) {
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            stream.wait_writable();
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Ok(())
        }
        Transport::Ws(ws) => {
            for buf in bufs {
                let msg = tungstenite::Message::Binary(buf.clone().into());
                let mut result = ws.send(msg);
                loop {
                    match result {
                        Ok(()) => break,
                        Err(tungstenite::Error::Io(e))
                            if e.kind() == std::io::ErrorKind::WouldBlock =>
                        {
                            ws.get_ref().wait_writable();
                            result = ws.flush().map(|()| ());
                        }
                        Err(tungstenite::Error::Io(e)) => return Err(e),
                        Err(e) => {
                            return Err(std::io::Error::new(std::io::ErrorKind::Other, e));
                        }
                    }
                }
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// TLS material
// ---------------------------------------------------------------------------

mod tls {
    use std::sync::Arc;

    use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
    use rustls::RootCertStore;

    use super::TlsParams;
    use crate::error::SockError;

    fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, SockError> {
        let file = std::fs::File::open(path)?;
        let mut reader = std::io::BufReader::new(file);
        rustls_pemfile::certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SockError::Tls(format!("bad certificate {path}: {e}")))
    }

    fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, SockError> {
        let file = std::fs::File::open(path)?;
        let mut reader = std::io::BufReader::new(file);
        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| SockError::Tls(format!("bad key {path}: {e}")))?
            .ok_or_else(|| SockError::Tls(format!("no private key in {path}")))
    }

    fn trust_store(trust: Option<&str>) -> Result<RootCertStore, SockError> {
        let mut roots = RootCertStore::empty();
        match trust {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| SockError::Tls(e.to_string()))?;
                }
            }
            None => {
                // Default system trust fallback.
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }
        Ok(roots)
    }

    pub(super) fn connection(
        server: bool,
        mutual: bool,
        params: &TlsParams,
    ) -> Result<rustls::Connection, SockError> {
        if server {
            let certs = load_certs(
                params
                    .cert
                    .as_deref()
                    .ok_or_else(|| SockError::Tls("server needs cert=".into()))?,
            )?;
            let key = load_key(
                params
                    .key
                    .as_deref()
                    .ok_or_else(|| SockError::Tls("server needs key=".into()))?,
            )?;
            let builder = rustls::ServerConfig::builder();
            let config = if mutual {
                let roots = trust_store(params.trust.as_deref())?;
                let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|e| SockError::Tls(e.to_string()))?;
                builder
                    .with_client_cert_verifier(verifier)
                    .with_single_cert(certs, key)
            } else {
                builder.with_no_client_auth().with_single_cert(certs, key)
            }
            .map_err(|e| SockError::Tls(e.to_string()))?;
            let conn = rustls::ServerConnection::new(Arc::new(config))
                .map_err(|e| SockError::Tls(e.to_string()))?;
            Ok(rustls::Connection::Server(conn))
        } else {
            let roots = trust_store(params.trust.as_deref())?;
            let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
            let config = if mutual {
                let certs = load_certs(
                    params
                        .cert
                        .as_deref()
                        .ok_or_else(|| SockError::Tls("mutual client needs cert=".into()))?,
                )?;
                let key = load_key(
                    params
                        .key
                        .as_deref()
                        .ok_or_else(|| SockError::Tls("mutual client needs key=".into()))?,
                )?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| SockError::Tls(e.to_string()))?
            } else {
                builder.with_no_client_auth()
            };
            let host = params.host.clone().unwrap_or_else(|| "localhost".into());
            let name = ServerName::try_from(host)
                .map_err(|_| SockError::Tls("bad tls host name".into()))?;
            let conn = rustls::ClientConnection::new(Arc::new(config), name)
                .map_err(|e| SockError::Tls(e.to_string()))?;
            Ok(rustls::Connection::Client(conn))
        }
    }
}
