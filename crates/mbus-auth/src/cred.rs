//! Client credentials: uid/gid/pid plus an optional security label,
//! importable from the socket peer or from the serialised on-behalf form.

use std::os::unix::io::{AsFd, BorrowedFd};
use std::sync::Arc;

use crate::error::AuthError;

struct CredInner {
    uid: u32,
    gid: u32,
    pid: i32,
    label: Option<String>,
}

/// Reference-counted credentials attached to a request or a transport.
#[derive(Clone)]
pub struct Cred {
    inner: Arc<CredInner>,
}

impl Cred {
    pub fn new(uid: u32, gid: u32, pid: i32, label: Option<String>) -> Cred {
        Cred {
            inner: Arc::new(CredInner {
                uid,
                gid,
                pid,
                label,
            }),
        }
    }

    /// Credentials of the current process.
    pub fn current() -> Cred {
        Cred::new(
            nix::unistd::getuid().as_raw(),
            nix::unistd::getgid().as_raw(),
            std::process::id() as i32,
            None,
        )
    }

    /// Credentials of the peer of a connected unix socket (`SO_PEERCRED`).
    pub fn from_peer_of<F: AsFd>(socket: &F) -> Result<Cred, AuthError> {
        let creds = nix::sys::socket::getsockopt(socket, nix::sys::socket::sockopt::PeerCredentials)?;
        Ok(Cred::new(creds.uid(), creds.gid(), creds.pid(), None))
    }

    /// Same, from a borrowed raw descriptor.
    pub fn from_peer_fd(fd: BorrowedFd<'_>) -> Result<Cred, AuthError> {
        Self::from_peer_of(&fd)
    }

    pub fn uid(&self) -> u32 {
        self.inner.uid
    }

    pub fn gid(&self) -> u32 {
        self.inner.gid
    }

    pub fn pid(&self) -> i32 {
        self.inner.pid
    }

    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// Serialised on-behalf form: `hex-uid:hex-gid:hex-pid-label`.
    pub fn export(&self) -> String {
        format!(
            "{:x}:{:x}:{:x}-{}",
            self.inner.uid,
            self.inner.gid,
            self.inner.pid,
            self.inner.label.as_deref().unwrap_or("")
        )
    }

    /// Parse the serialised on-behalf form.
    pub fn import(exported: &str) -> Result<Cred, AuthError> {
        let (uid_s, rest) = exported
            .split_once(':')
            .ok_or(AuthError::BadCredentialString)?;
        let (gid_s, rest) = rest.split_once(':').ok_or(AuthError::BadCredentialString)?;
        let (pid_s, label) = rest.split_once('-').ok_or(AuthError::BadCredentialString)?;
        let uid = u32::from_str_radix(uid_s, 16).map_err(|_| AuthError::BadCredentialString)?;
        let gid = u32::from_str_radix(gid_s, 16).map_err(|_| AuthError::BadCredentialString)?;
        let pid = i32::from_str_radix(pid_s, 16).map_err(|_| AuthError::BadCredentialString)?;
        let label = if label.is_empty() {
            None
        } else {
            Some(label.to_string())
        };
        Ok(Cred::new(uid, gid, pid, label))
    }

    pub fn same(&self, other: &Cred) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Cred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cred")
            .field("uid", &self.inner.uid)
            .field("gid", &self.inner.gid)
            .field("pid", &self.inner.pid)
            .field("label", &self.inner.label)
            .finish()
    }
}
