//! Privilege separation for RSA private-key operations.
//!
//! A TLS-terminating process should never hold raw private keys in the
//! address space that parses untrusted network bytes. keyward forks a key
//! daemon once at startup; the daemon loads private keys from disk and
//! performs every private-key primitive on the parent's behalf over an
//! `AF_UNIX` socket in a private, owner-only directory. The parent keeps
//! only the public components, wrapped in a [`ProxyKey`] that plugs into a
//! TLS stack through the [`RsaOps`] capability set.
//!
//! ```no_run
//! use keyward::{KeyDaemon, RsaOps};
//! use openssl::nid::Nid;
//!
//! let daemon = KeyDaemon::spawn()?;
//! let key = daemon.load_key("server.pem".as_ref())?;
//! let digest = [0u8; 32]; // SHA-256 of the handshake transcript
//! let signature = key.sign(Nid::SHA256, &digest)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! The daemon's lifetime is tied to the parent through a liveness pipe:
//! when the parent exits (or drops its last [`KeyDaemon`] reference), the
//! daemon removes its socket directory and exits. There is no shutdown
//! RPC and no fallback: if the daemon becomes unreachable, the parent
//! aborts rather than degrade to in-process keys.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keyward_core::buffer::WireBuf;
use keyward_core::proto::Command;
use keyward_core::socket::{create_socket_dir, remove_socket_dir, socket_path};

mod conn;
mod daemon;
mod proxy;
mod registry;

pub use proxy::{KeyOpError, ProxyKey, RsaOps};
pub use registry::KeyHandle;

/// Fatal-path helper: transport and response-parse failures mean the
/// daemon is gone or corrupt, and continuing would hang handshakes or
/// invite a fallback that defeats the separation.
pub(crate) fn die(msg: &str) -> ! {
    tracing::error!("{msg}");
    eprintln!("keyward: fatal: {msg}");
    std::process::abort()
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to create the socket directory: {0}")]
    SocketDir(#[source] io::Error),

    #[error("failed to bind {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("pipe(2) failed: {0}")]
    Pipe(#[source] io::Error),

    #[error("fork(2) failed: {0}")]
    Fork(#[source] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum LoadKeyError {
    /// The daemon reported the failure in-band: file missing, unreadable,
    /// or not a PEM RSA private key. The message names the path.
    #[error("{0}")]
    Daemon(String),

    #[error("key path is not valid UTF-8")]
    InvalidPath,

    /// The caller's TLS context refused the proxy key.
    #[error("the TLS context rejected the key")]
    Rejected(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Where a loaded key gets installed.
///
/// The one hook keyward needs from a TLS stack, mirroring
/// `SSL_CTX_use_PrivateKey`: accept the key or reject it with a reason.
pub trait PrivateKeySink {
    fn use_private_key(
        &mut self,
        key: Arc<ProxyKey>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(0);

/// A running key daemon.
///
/// Created once per process at startup, before worker threads exist. Holds
/// the write end of the liveness pipe: dropping the last reference closes
/// it, upon which the daemon removes its socket directory and exits.
pub struct KeyDaemon {
    id: u64,
    socket_dir: PathBuf,
    socket_path: PathBuf,
    _liveness: OwnedFd,
}

impl KeyDaemon {
    /// Create the socket, fork the daemon, and return the parent-side
    /// instance.
    ///
    /// Directory, listener, and liveness pipe are created before the fork
    /// so both processes share them; the write end of the pipe is marked
    /// close-on-exec so an `exec` in the parent also releases the daemon.
    /// On failure everything created so far is unwound.
    pub fn spawn() -> Result<Arc<Self>, SpawnError> {
        let dir = create_socket_dir().map_err(SpawnError::SocketDir)?;
        let sock = socket_path(&dir);

        let listener = match UnixListener::bind(&sock) {
            Ok(l) => l,
            Err(source) => {
                remove_socket_dir(&dir);
                return Err(SpawnError::Bind { path: sock, source });
            }
        };

        let (read_end, write_end) = match liveness_pipe() {
            Ok(p) => p,
            Err(e) => {
                remove_socket_dir(&dir);
                return Err(SpawnError::Pipe(e));
            }
        };

        match unsafe { libc::fork() } {
            -1 => {
                let e = io::Error::last_os_error();
                remove_socket_dir(&dir);
                Err(SpawnError::Fork(e))
            }
            0 => {
                drop(write_end);
                daemon::daemon_main(listener, read_end, dir)
            }
            _child => {
                drop(listener);
                drop(read_end);
                Ok(Arc::new(Self {
                    id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
                    socket_dir: dir,
                    socket_path: sock,
                    _liveness: write_end,
                }))
            }
        }
    }

    /// Ask the daemon to load a PEM RSA private key from `path` and build
    /// the parent-side proxy for it.
    ///
    /// Failures to read or parse the key are recoverable and leave no
    /// state behind in either process.
    pub fn load_key(self: &Arc<Self>, path: &Path) -> Result<ProxyKey, LoadKeyError> {
        let path = path.to_str().ok_or(LoadKeyError::InvalidPath)?;

        let mut buf = WireBuf::new();
        buf.push_str(Command::LoadKey.token());
        buf.push_str(path);
        conn::exchange(self, &mut buf);

        let ok = parse_or_die(buf.shift_num());
        let handle = parse_or_die(buf.shift_num());
        let e_hex = parse_or_die(buf.shift_str());
        let n_hex = parse_or_die(buf.shift_str());
        let err = parse_or_die(buf.shift_str());

        if ok != 1 {
            return Err(LoadKeyError::Daemon(err));
        }
        match ProxyKey::from_components(self.clone(), KeyHandle(handle), &e_hex, &n_hex) {
            Ok(key) => Ok(key),
            Err(_) => die("daemon returned unparsable public components"),
        }
    }

    /// The private runtime directory holding the daemon's socket.
    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub(crate) fn instance_id(&self) -> u64 {
        self.id
    }
}

/// Load a key and install it into a TLS context in one step.
pub fn load_private_key_file(
    daemon: &Arc<KeyDaemon>,
    ctx: &mut dyn PrivateKeySink,
    path: &Path,
) -> Result<(), LoadKeyError> {
    let key = daemon.load_key(path)?;
    ctx.use_private_key(Arc::new(key))
        .map_err(LoadKeyError::Rejected)
}

fn parse_or_die<T, E>(r: Result<T, E>) -> T {
    match r {
        Ok(v) => v,
        Err(_) => die("failed to parse daemon response"),
    }
}

fn liveness_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0i32; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    if unsafe { libc::fcntl(write_end.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok((read_end, write_end))
}
