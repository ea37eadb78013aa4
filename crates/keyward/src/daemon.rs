//! The key daemon: accept loop, per-connection workers, command stubs.
//!
//! Entered in the forked child and never returned from. Two long-lived
//! flows run here: a liveness watcher that blocks on the pipe inherited
//! from the parent and tears the daemon down when the parent dies, and the
//! acceptor, which spawns one detached worker thread per connection.
//!
//! Workers share nothing but the key registry. A malformed request or an
//! unknown command costs the offending connection its socket; the daemon
//! keeps accepting.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;

use keyward_core::buffer::{WireBuf, WireError};
use keyward_core::frame::{read_frame, write_frame, FrameError};
use keyward_core::peer::peer_creds;
use keyward_core::proto::{bound_error_message, Command, NO_HANDLE};
use keyward_core::socket::remove_socket_dir;
use openssl::error::ErrorStack;
use openssl::md::Md;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::pkey_ctx::PkeyCtx;
use openssl::rsa::{Padding, Rsa};
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::registry::KeyRegistry;

/// Why a worker gave up on its connection.
#[derive(Debug, thiserror::Error)]
enum StubError {
    #[error("malformed request: {0}")]
    Malformed(#[from] WireError),

    #[error("no key registered under handle {0}")]
    NoSuchKey(u64),
}

/// Daemon entry point, called in the forked child.
///
/// `liveness` is the read end of the pipe whose write end the parent holds
/// open for its lifetime.
pub(crate) fn daemon_main(listener: UnixListener, liveness: OwnedFd, dir: PathBuf) -> ! {
    let registry = Arc::new(KeyRegistry::new());
    info!("key daemon serving in {}", dir.display());

    std::thread::spawn(move || {
        watch_parent(liveness.as_raw_fd());
        remove_socket_dir(&dir);
        // Keys and sockets are reclaimed by process exit; a teardown path
        // here would only add a mis-sequencing window.
        unsafe { libc::_exit(0) }
    });

    loop {
        match listener.accept() {
            Ok((stream, _addr)) => {
                let registry = registry.clone();
                std::thread::spawn(move || serve_conn(&registry, stream));
            }
            Err(e) => {
                warn!("accept failed: {e}");
            }
        }
    }
}

/// Block until the parent's end of the liveness pipe closes.
///
/// The parent never writes to the pipe; a successful read is tolerated and
/// re-entered, EINTR is retried, and EOF or any other error means the
/// parent is gone.
fn watch_parent(fd: i32) {
    let mut byte = 0u8;
    loop {
        let r = unsafe { libc::read(fd, std::ptr::addr_of_mut!(byte).cast(), 1) };
        if r > 0 {
            continue;
        }
        if r < 0 && std::io::Error::last_os_error().kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return;
    }
}

/// Per-connection worker loop: read a frame, dispatch, write the response.
fn serve_conn(registry: &KeyRegistry, mut stream: UnixStream) {
    match peer_creds(stream.as_raw_fd()) {
        Ok(creds) if creds.is_same_user() => {}
        Ok(creds) => {
            warn!(uid = creds.uid, "refusing connection from foreign uid");
            return;
        }
        Err(e) => {
            warn!("peer credential lookup failed: {e}");
            return;
        }
    }

    let mut buf = WireBuf::new();
    loop {
        match read_frame(&mut buf, &mut stream) {
            Ok(()) => {}
            Err(FrameError::ClosedByPeer) => break,
            Err(e) => {
                warn!("read error: {e}");
                break;
            }
        }

        let token = match buf.shift_str() {
            Ok(t) => t,
            Err(_) => {
                warn!("failed to parse request");
                break;
            }
        };
        let cmd = match Command::from_token(&token) {
            Some(cmd) => cmd,
            None => {
                warn!("unknown command: {token}");
                break;
            }
        };

        let handled = match cmd {
            Command::LoadKey => load_key_stub(registry, &mut buf),
            Command::PrivEnc | Command::PrivDec => priv_encdec_stub(cmd, registry, &mut buf),
            Command::Sign => sign_stub(registry, &mut buf),
        };
        if let Err(e) = handled {
            warn!("{cmd}: {e}");
            break;
        }

        match write_frame(&buf, &mut stream) {
            Ok(()) => buf.dispose(),
            Err(e) => {
                warn!("write error: {e}");
                break;
            }
        }
    }
    // buf scrubs itself on drop; the socket closes with the thread.
}

/// `load_key(path)` → `{ok, handle, e_hex, n_hex, err}`.
///
/// Load failures are reported in-band: `ok=0`, no handle, empty hex
/// strings, and a bounded error message. Only an unparsable request drops
/// the connection.
fn load_key_stub(registry: &KeyRegistry, buf: &mut WireBuf) -> Result<(), StubError> {
    let path = buf.shift_str()?;
    buf.dispose();

    match read_private_key(registry, &path) {
        Ok((handle, e_hex, n_hex)) => {
            buf.push_num(1);
            buf.push_num(handle);
            buf.push_str(&e_hex);
            buf.push_str(&n_hex);
            buf.push_str("");
        }
        Err(err) => {
            warn!("load_key failed: {err}");
            buf.push_num(0);
            buf.push_num(NO_HANDLE);
            buf.push_str("");
            buf.push_str("");
            buf.push_str(bound_error_message(&err));
        }
    }
    Ok(())
}

fn read_private_key(registry: &KeyRegistry, path: &str) -> Result<(u64, String, String), String> {
    let pem = Zeroizing::new(std::fs::read(path).map_err(|e| format!("{path}: {e}"))?);
    let rsa = Rsa::private_key_from_pem(&pem)
        .map_err(|_| format!("{path}: failed to parse the private key"))?;

    let e_hex = rsa.e().to_hex_str().map_err(|e| e.to_string())?.to_string();
    let n_hex = rsa.n().to_hex_str().map_err(|e| e.to_string())?.to_string();
    let handle = registry.register(rsa);
    Ok((handle.as_u64(), e_hex, n_hex))
}

/// `priv_enc`/`priv_dec(from, handle, padding)` → `{ret, to}`.
///
/// `ret` mirrors the primitive: the output length, or negative on crypto
/// failure. `to` carries exactly `ret` bytes on success and is empty
/// otherwise.
fn priv_encdec_stub(
    cmd: Command,
    registry: &KeyRegistry,
    buf: &mut WireBuf,
) -> Result<(), StubError> {
    let from = buf.shift_bytes()?;
    let handle = buf.shift_num()?;
    let padding = Padding::from_raw(buf.shift_num()? as i32);
    let rsa = registry.get(handle).ok_or(StubError::NoSuchKey(handle))?;
    buf.dispose();

    // Scratch sized by the modulus: always large enough for the primitive's
    // output on this key.
    let mut to = Zeroizing::new(vec![0u8; rsa.size() as usize]);
    let ret: i64 = match cmd {
        Command::PrivEnc => rsa.private_encrypt(&from, &mut to, padding),
        _ => rsa.private_decrypt(&from, &mut to, padding),
    }
    .map(|n| n as i64)
    .unwrap_or(-1);

    buf.push_num(ret as u64);
    if ret >= 0 {
        buf.push_bytes(&to[..ret as usize]);
    } else {
        buf.push_bytes(&[]);
    }
    Ok(())
}

/// `sign(type, msg, handle)` → `{ret, sig}` with `ret` 1 on success, 0
/// otherwise. `type` is a raw digest NID and `msg` the digest itself.
fn sign_stub(registry: &KeyRegistry, buf: &mut WireBuf) -> Result<(), StubError> {
    let digest_nid = buf.shift_num()?;
    let msg = buf.shift_bytes()?;
    let handle = buf.shift_num()?;
    let rsa = registry.get(handle).ok_or(StubError::NoSuchKey(handle))?;
    buf.dispose();

    match sign_digest(&rsa, digest_nid as i32, &msg) {
        Ok(sig) => {
            buf.push_num(1);
            buf.push_bytes(&sig);
        }
        Err(e) => {
            warn!("sign with handle {handle} failed: {e}");
            buf.push_num(0);
            buf.push_bytes(&[]);
        }
    }
    Ok(())
}

/// PKCS#1 v1.5 signature of a precomputed digest, with the digest
/// algorithm bound so the DigestInfo prefix is applied by the library.
fn sign_digest(rsa: &Rsa<Private>, nid_raw: i32, digest: &[u8]) -> Result<Vec<u8>, SignError> {
    let nid = Nid::from_raw(nid_raw);
    let md = Md::from_nid(nid).ok_or(SignError::UnsupportedDigest(nid_raw))?;

    let pkey = PKey::from_rsa(rsa.clone())?;
    let mut ctx = PkeyCtx::new(&pkey)?;
    ctx.sign_init()?;
    ctx.set_rsa_padding(Padding::PKCS1)?;
    ctx.set_signature_md(md)?;

    let mut sig = vec![0u8; rsa.size() as usize];
    let len = ctx.sign(digest, Some(&mut sig))?;
    sig.truncate(len);
    Ok(sig)
}

#[derive(Debug, thiserror::Error)]
enum SignError {
    #[error("unsupported digest nid {0}")]
    UnsupportedDigest(i32),

    #[error(transparent)]
    OpenSsl(#[from] ErrorStack),
}
