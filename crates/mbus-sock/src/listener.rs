//! Server listeners, client connectors and the directory auto-import.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

use mbus_auth::Cred;
use mbus_core::{OnLackResolver, Runtime};
use mbus_evloop::{EvFd, EV_IN};
use mbus_rpc::{RpcSpec, Stub};
use tracing::{debug, info, warn};

use crate::error::SockError;
use crate::socket::{open_spec, set_nonblocking, Side};
use crate::uri::{SockScheme, SockSpec};
use crate::wrapper::Wrapper;

struct ListenInner {
    runtime: Runtime,
    spec: SockSpec,
    rpc_spec: Arc<RpcSpec>,
    efd: Mutex<Option<EvFd>>,
    /// Accepted connections; pruned of dead wrappers on each accept.
    wrappers: Mutex<Vec<Wrapper>>,
}

/// A listening socket exporting APIs to remote peers.
#[derive(Clone)]
pub struct Listener {
    inner: Arc<ListenInner>,
}

impl Listener {
    /// Bind the sockspec `uri` and serve the APIs it names.
    pub fn bind(runtime: &Runtime, uri: &str) -> Result<Listener, SockError> {
        let spec = SockSpec::parse(uri)?;
        let names = spec.api_names(true)?;
        let rpc_spec = RpcSpec::make("", &names.join(","));
        let fd = open_spec(&spec, Side::Server)?;
        set_nonblocking(&fd)?;

        let inner = Arc::new(ListenInner {
            runtime: runtime.clone(),
            spec,
            rpc_spec,
            efd: Mutex::new(None),
            wrappers: Mutex::new(Vec::new()),
        });
        let listener = Listener { inner };

        let weak = Arc::downgrade(&listener.inner);
        let raw = fd.as_raw_fd();
        // The listener owns the fd through auto_close.
        std::mem::forget(fd);
        let efd = runtime.evmgr().add_fd(
            raw,
            EV_IN,
            move |efd, revents| {
                if revents & EV_IN != 0 {
                    if let Some(inner) = weak.upgrade() {
                        Listener { inner }.accept_pending(efd.fd());
                    }
                }
            },
            false,
            true,
        )?;
        *listener.inner.efd.lock().unwrap() = Some(efd);
        info!(uri = %uri, "listening");
        Ok(listener)
    }

    /// Names exported by this listener.
    pub fn exported(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.inner.rpc_spec.for_each(false, |local, _| {
            names.push(local.to_string());
        });
        names
    }

    pub fn connection_count(&self) -> usize {
        let mut wrappers = self.inner.wrappers.lock().unwrap();
        wrappers.retain(|w| !w.is_destroyed());
        wrappers.len()
    }

    fn accept_pending(&self, listen_fd: std::os::unix::io::RawFd) {
        loop {
            match nix::sys::socket::accept4(listen_fd, nix::sys::socket::SockFlag::SOCK_CLOEXEC) {
                Ok(conn) => {
                    let conn = unsafe {
                        <OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(conn)
                    };
                    if let Err(e) = self.take_connection(conn) {
                        warn!(error = %e, "dropping incoming connection");
                    }
                }
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(nix::errno::Errno::EINTR) => {}
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn take_connection(&self, conn: OwnedFd) -> Result<(), SockError> {
        let stub = Stub::new(&self.inner.runtime, self.inner.rpc_spec.clone());
        if self.inner.spec.scheme == SockScheme::Unix {
            match Cred::from_peer_of(&conn) {
                Ok(cred) => stub.set_cred(cred),
                Err(e) => debug!(error = %e, "no peer credentials"),
            }
        }
        let wrapper = Wrapper::create(
            self.inner.runtime.evmgr(),
            stub,
            conn,
            true,
            &self.inner.spec,
        )?;
        debug!("connection accepted");
        let mut wrappers = self.inner.wrappers.lock().unwrap();
        wrappers.retain(|w| !w.is_destroyed());
        wrappers.push(wrapper);
        Ok(())
    }
}

/// Dial the sockspec `uri` and import its APIs as local proxies.
/// The returned wrapper keeps the connection alive.
pub fn connect(runtime: &Runtime, uri: &str) -> Result<Wrapper, SockError> {
    let spec = SockSpec::parse(uri)?;
    let names = spec.api_names(true)?;
    let rpc_spec = RpcSpec::make(&names.join(","), "");
    let fd = open_spec(&spec, Side::Client)?;
    let stub = Stub::new(runtime, rpc_spec);
    let wrapper = Wrapper::create(runtime.evmgr(), stub, fd, false, &spec)?;
    wrapper
        .start_client()
        .map_err(|_| SockError::BadUri("duplicate api declaration"))?;
    info!(uri = %uri, "connected");
    Ok(wrapper)
}

/// Holder parking a wrapper inside the proxy API's user data, so the
/// connection lives exactly as long as the imported API.
struct WrapperHolder(#[allow(dead_code)] Wrapper);

/// Resolver importing unknown APIs from sockets under `basedir`: asking
/// for api `x` tries `unix:basedir/x`.
pub fn autoset_resolver(runtime: &Runtime, basedir: &str) -> OnLackResolver {
    let runtime = runtime.clone();
    let basedir = basedir.trim_end_matches('/').to_string();
    Arc::new(move |set, name| {
        let uri = format!("unix:{basedir}/{name}");
        match connect(&runtime, &uri) {
            Ok(wrapper) => {
                let api = set.lookup(name)?;
                api.set_userdata(Arc::new(WrapperHolder(wrapper)));
                Some(api)
            }
            Err(e) => {
                debug!(api = %name, uri = %uri, error = %e, "auto-import failed");
                None
            }
        }
    })
}
