//! Expanding wire buffer with scrub-on-drop.
//!
//! `WireBuf` is the single buffer type used on both sides of the daemon
//! socket: a request is built with the `push_*` accessors and written out as
//! one frame, a response is read into the same buffer and consumed with the
//! `shift_*` accessors. Because the buffer transiently holds private-key
//! material (plaintexts, signatures), the full backing allocation is zeroed
//! whenever it is disposed or dropped.
//!
//! Three atom types exist on the wire:
//!
//! - *number*: `u64`, little-endian;
//! - *string*: UTF-8 bytes up to and including a terminating NUL;
//! - *bytes*: a number `L` followed by exactly `L` raw bytes.

use std::io::Read;

use zeroize::{Zeroize, Zeroizing};

/// Encoded width of a wire number.
pub const NUM_WIDTH: usize = 8;

/// First allocation made by an empty buffer.
const INITIAL_CAPACITY: usize = 4096;

/// Error consuming an atom from the front of a buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("payload truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("string atom is missing its NUL terminator")]
    MissingNul,

    #[error("string atom is not valid UTF-8")]
    InvalidUtf8,
}

/// Growable byte region holding the live payload `[start, end)`.
///
/// `push_*` appends at the end, `shift_*` consumes from the front. The two
/// halves are never interleaved in practice: a buffer is either being filled
/// for sending or drained after receiving.
#[derive(Default)]
pub struct WireBuf {
    data: Vec<u8>,
    start: usize,
}

impl WireBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live payload bytes.
    pub fn size(&self) -> usize {
        self.data.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// The live payload.
    pub fn payload(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Ensure room for `extra` more bytes at the end.
    ///
    /// Growth doubles the allocation from an initial 4 KiB until the extra
    /// fits, so repeated pushes stay amortized-constant.
    pub fn reserve(&mut self, extra: usize) {
        let needed = self.data.len() + extra;
        if needed <= self.data.capacity() {
            return;
        }
        let mut cap = self.data.capacity().max(INITIAL_CAPACITY);
        while cap < needed {
            cap *= 2;
        }
        self.data.reserve_exact(cap - self.data.len());
    }

    pub fn push_num(&mut self, v: u64) {
        self.reserve(NUM_WIDTH);
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    /// Append a string atom. Wire strings never contain interior NULs; all
    /// strings this crate sends are command tokens, paths, hex numbers, or
    /// error messages.
    pub fn push_str(&mut self, s: &str) {
        debug_assert!(!s.as_bytes().contains(&0));
        self.reserve(s.len() + 1);
        self.data.extend_from_slice(s.as_bytes());
        self.data.push(0);
    }

    pub fn push_bytes(&mut self, p: &[u8]) {
        self.push_num(p.len() as u64);
        self.reserve(p.len());
        self.data.extend_from_slice(p);
    }

    pub fn shift_num(&mut self) -> Result<u64, WireError> {
        if self.size() < NUM_WIDTH {
            return Err(WireError::Truncated {
                needed: NUM_WIDTH,
                available: self.size(),
            });
        }
        let mut raw = [0u8; NUM_WIDTH];
        raw.copy_from_slice(&self.data[self.start..self.start + NUM_WIDTH]);
        self.start += NUM_WIDTH;
        Ok(u64::from_le_bytes(raw))
    }

    /// Consume a string atom. Fails if no NUL is found in the live region.
    pub fn shift_str(&mut self) -> Result<String, WireError> {
        let live = &self.data[self.start..];
        let nul = live
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::MissingNul)?;
        let s = std::str::from_utf8(&live[..nul])
            .map_err(|_| WireError::InvalidUtf8)?
            .to_owned();
        self.start += nul + 1;
        Ok(s)
    }

    /// Consume a bytes atom.
    ///
    /// The copy is returned in a [`Zeroizing`] vec: blob atoms are the ones
    /// that carry plaintexts and signatures, and the caller's copy must not
    /// outlive its use unscrubbed any more than the buffer itself does.
    pub fn shift_bytes(&mut self) -> Result<Zeroizing<Vec<u8>>, WireError> {
        let len = self.shift_num()? as usize;
        if self.size() < len {
            return Err(WireError::Truncated {
                needed: len,
                available: self.size(),
            });
        }
        let out = Zeroizing::new(self.data[self.start..self.start + len].to_vec());
        self.start += len;
        Ok(out)
    }

    /// Append exactly `n` bytes read from `r`.
    ///
    /// On failure the buffer is restored to its previous length (the
    /// partially-filled tail is scrubbed).
    pub fn fill_from<R: Read>(&mut self, r: &mut R, n: usize) -> std::io::Result<()> {
        self.reserve(n);
        let old = self.data.len();
        self.data.resize(old + n, 0);
        if let Err(e) = r.read_exact(&mut self.data[old..]) {
            self.data[old..].zeroize();
            self.data.truncate(old);
            return Err(e);
        }
        Ok(())
    }

    /// Scrub the backing storage and return the buffer to empty.
    pub fn dispose(&mut self) {
        self.data.zeroize();
        self.start = 0;
    }
}

impl Drop for WireBuf {
    fn drop(&mut self) {
        // Zeroizes the full allocated capacity, not just the live region.
        self.data.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_atoms_round_trip_in_order() {
        let mut buf = WireBuf::new();
        buf.push_str("load_key");
        buf.push_num(42);
        buf.push_bytes(b"\x00\x01\x02secret");
        buf.push_str("");
        buf.push_num(u64::MAX);

        assert_eq!(buf.shift_str().unwrap(), "load_key");
        assert_eq!(buf.shift_num().unwrap(), 42);
        assert_eq!(&*buf.shift_bytes().unwrap(), b"\x00\x01\x02secret");
        assert_eq!(buf.shift_str().unwrap(), "");
        assert_eq!(buf.shift_num().unwrap(), u64::MAX);
        assert!(buf.is_empty());
    }

    #[test]
    fn shift_num_fails_short() {
        let mut buf = WireBuf::new();
        buf.push_bytes(b"abc");
        buf.shift_num().unwrap();
        assert_eq!(
            buf.shift_num(),
            Err(WireError::Truncated {
                needed: NUM_WIDTH,
                available: 3
            })
        );
    }

    #[test]
    fn shift_str_fails_without_nul() {
        let mut buf = WireBuf::new();
        buf.push_num(7);
        assert_eq!(buf.shift_str(), Err(WireError::MissingNul));
    }

    #[test]
    fn shift_bytes_fails_when_length_exceeds_payload() {
        let mut buf = WireBuf::new();
        buf.push_num(1000);
        buf.push_num(0); // only 8 bytes follow the length
        assert!(matches!(
            buf.shift_bytes(),
            Err(WireError::Truncated { needed: 1000, .. })
        ));
    }

    #[test]
    fn empty_bytes_atom() {
        let mut buf = WireBuf::new();
        buf.push_bytes(b"");
        assert_eq!(buf.shift_bytes().unwrap().len(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn dispose_scrubs_live_region() {
        let mut buf = WireBuf::new();
        buf.push_bytes(b"very secret key material");
        buf.dispose();
        assert!(buf.is_empty());
        // The vec was cleared; pushing again must not resurface old bytes.
        buf.push_num(0);
        assert_eq!(buf.shift_num().unwrap(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn payloads_beyond_the_initial_allocation_fit() {
        let mut buf = WireBuf::new();
        buf.push_num(1);
        buf.push_bytes(&vec![0xA5u8; 10_000]);
        assert_eq!(buf.size(), NUM_WIDTH + NUM_WIDTH + 10_000);
        assert_eq!(buf.shift_num().unwrap(), 1);
        assert_eq!(buf.shift_bytes().unwrap().len(), 10_000);
    }

    #[test]
    fn numbers_are_little_endian_u64() {
        let mut buf = WireBuf::new();
        buf.push_num(0x0102_0304);
        assert_eq!(buf.payload(), &[0x04, 0x03, 0x02, 0x01, 0, 0, 0, 0]);
    }
}
