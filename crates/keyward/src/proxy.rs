//! Parent-side proxy key.
//!
//! A [`ProxyKey`] is the RSA-shaped object the parent hands to its TLS
//! stack: it carries only the key handle and the public components. The
//! private half of the capability set is routed through the per-thread
//! daemon connection; the public half delegates to the crypto library's
//! default operations on the locally-reconstructed public key.

use std::sync::Arc;

use keyward_core::buffer::WireBuf;
use keyward_core::proto::Command;
use openssl::bn::BigNum;
use openssl::error::ErrorStack;
use openssl::md::Md;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::pkey_ctx::PkeyCtx;
use openssl::rsa::{Padding, Rsa};

use crate::registry::KeyHandle;
use crate::{conn, die, KeyDaemon};

/// The RSA capability set.
///
/// TLS stacks consume keys through a method table of six operations; this
/// trait is that table. [`ProxyKey`] overrides the three private-key
/// members with network-routed variants and keeps the library defaults for
/// the rest.
pub trait RsaOps: Send + Sync {
    /// Modulus size in bytes; output buffers must be at least this large.
    fn size(&self) -> usize;

    fn public_encrypt(&self, from: &[u8], to: &mut [u8], padding: Padding)
        -> Result<usize, KeyOpError>;

    fn public_decrypt(&self, from: &[u8], to: &mut [u8], padding: Padding)
        -> Result<usize, KeyOpError>;

    fn private_encrypt(&self, from: &[u8], to: &mut [u8], padding: Padding)
        -> Result<usize, KeyOpError>;

    fn private_decrypt(&self, from: &[u8], to: &mut [u8], padding: Padding)
        -> Result<usize, KeyOpError>;

    /// PKCS#1 v1.5 signature over a precomputed digest; `digest_alg` names
    /// the algorithm that produced it.
    fn sign(&self, digest_alg: Nid, digest: &[u8]) -> Result<Vec<u8>, KeyOpError>;

    fn verify(&self, digest_alg: Nid, digest: &[u8], sig: &[u8]) -> Result<bool, KeyOpError>;
}

#[derive(Debug, thiserror::Error)]
pub enum KeyOpError {
    /// The RSA primitive reported failure; carries its raw return value.
    #[error("rsa primitive failed (ret {0})")]
    Primitive(i64),

    /// The daemon could not produce a signature for this request.
    #[error("signing failed in the key daemon")]
    SignRejected,

    #[error("output buffer too small: need {need} bytes, have {have}")]
    OutputTooSmall { need: usize, have: usize },

    #[error("digest algorithm {0:?} is not supported")]
    UnsupportedDigest(Nid),

    #[error(transparent)]
    OpenSsl(#[from] ErrorStack),
}

/// A private key whose secret half lives in the daemon.
pub struct ProxyKey {
    daemon: Arc<KeyDaemon>,
    handle: KeyHandle,
    public: Rsa<openssl::pkey::Public>,
}

impl std::fmt::Debug for ProxyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyKey")
            .field("handle", &self.handle)
            .field("modulus_bits", &(self.public.size() * 8))
            .finish_non_exhaustive()
    }
}

impl ProxyKey {
    /// Reassemble a key from a `load_key` response.
    pub(crate) fn from_components(
        daemon: Arc<KeyDaemon>,
        handle: KeyHandle,
        e_hex: &str,
        n_hex: &str,
    ) -> Result<Self, ErrorStack> {
        let e = BigNum::from_hex_str(e_hex)?;
        let n = BigNum::from_hex_str(n_hex)?;
        let public = Rsa::from_public_components(n, e)?;
        Ok(Self {
            daemon,
            handle,
            public,
        })
    }

    pub fn handle(&self) -> KeyHandle {
        self.handle
    }

    /// The public components held by the parent.
    pub fn public(&self) -> &Rsa<openssl::pkey::Public> {
        &self.public
    }

    fn priv_op(
        &self,
        cmd: Command,
        from: &[u8],
        to: &mut [u8],
        padding: Padding,
    ) -> Result<usize, KeyOpError> {
        let mut buf = WireBuf::new();
        buf.push_str(cmd.token());
        buf.push_bytes(from);
        buf.push_num(self.handle.0);
        buf.push_num(padding.as_raw() as u64);
        conn::exchange(&self.daemon, &mut buf);

        let ret = buf
            .shift_num()
            .unwrap_or_else(|_| die("failed to parse daemon response")) as i64;
        let out = buf
            .shift_bytes()
            .unwrap_or_else(|_| die("failed to parse daemon response"));

        if ret < 0 {
            return Err(KeyOpError::Primitive(ret));
        }
        if to.len() < out.len() {
            return Err(KeyOpError::OutputTooSmall {
                need: out.len(),
                have: to.len(),
            });
        }
        to[..out.len()].copy_from_slice(&out);
        Ok(ret as usize)
    }
}

impl RsaOps for ProxyKey {
    fn size(&self) -> usize {
        self.public.size() as usize
    }

    fn public_encrypt(
        &self,
        from: &[u8],
        to: &mut [u8],
        padding: Padding,
    ) -> Result<usize, KeyOpError> {
        Ok(self.public.public_encrypt(from, to, padding)?)
    }

    fn public_decrypt(
        &self,
        from: &[u8],
        to: &mut [u8],
        padding: Padding,
    ) -> Result<usize, KeyOpError> {
        Ok(self.public.public_decrypt(from, to, padding)?)
    }

    fn private_encrypt(
        &self,
        from: &[u8],
        to: &mut [u8],
        padding: Padding,
    ) -> Result<usize, KeyOpError> {
        self.priv_op(Command::PrivEnc, from, to, padding)
    }

    fn private_decrypt(
        &self,
        from: &[u8],
        to: &mut [u8],
        padding: Padding,
    ) -> Result<usize, KeyOpError> {
        self.priv_op(Command::PrivDec, from, to, padding)
    }

    fn sign(&self, digest_alg: Nid, digest: &[u8]) -> Result<Vec<u8>, KeyOpError> {
        let mut buf = WireBuf::new();
        buf.push_str(Command::Sign.token());
        buf.push_num(digest_alg.as_raw() as u64);
        buf.push_bytes(digest);
        buf.push_num(self.handle.0);
        conn::exchange(&self.daemon, &mut buf);

        let ret = buf
            .shift_num()
            .unwrap_or_else(|_| die("failed to parse daemon response"));
        let sig = buf
            .shift_bytes()
            .unwrap_or_else(|_| die("failed to parse daemon response"));

        if ret != 1 {
            return Err(KeyOpError::SignRejected);
        }
        Ok(sig.to_vec())
    }

    fn verify(&self, digest_alg: Nid, digest: &[u8], sig: &[u8]) -> Result<bool, KeyOpError> {
        let md = Md::from_nid(digest_alg).ok_or(KeyOpError::UnsupportedDigest(digest_alg))?;
        let pkey = PKey::from_rsa(self.public.clone())?;
        let mut ctx = PkeyCtx::new(&pkey)?;
        ctx.verify_init()?;
        ctx.set_rsa_padding(Padding::PKCS1)?;
        ctx.set_signature_md(md)?;
        Ok(ctx.verify(digest, sig)?)
    }
}
