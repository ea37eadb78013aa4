//! Length-prefixed framing over a stream socket.
//!
//! Every message on the daemon socket is one frame: a wire number carrying
//! the payload length, then the payload itself. [`write_frame`] emits the
//! header and payload as a single vectored write, resuming partial writes;
//! [`read_frame`] reads the header and then exactly that many payload bytes
//! into the buffer. `EINTR` is retried transparently on both paths.

use std::io::{ErrorKind, IoSlice, Read, Write};

use crate::buffer::{WireBuf, NUM_WIDTH};

/// Upper bound on a single frame's payload, as a guard against a corrupt or
/// hostile peer claiming an enormous length. Far above any RSA payload.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer closed the connection, possibly mid-frame.
    #[error("connection closed by peer")]
    ClosedByPeer,

    #[error("frame length {0} exceeds the {MAX_FRAME_LEN}-byte limit")]
    Oversize(u64),

    #[error("socket i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Write the buffer's live payload as one frame.
///
/// Header and payload go out through a single vectored write where the
/// transport allows it; short writes resume at the remaining offset.
pub fn write_frame<W: Write>(buf: &WireBuf, w: &mut W) -> Result<(), FrameError> {
    let header = (buf.size() as u64).to_le_bytes();
    let payload = buf.payload();
    let total = header.len() + payload.len();

    let mut written = 0;
    while written < total {
        let slices = if written < header.len() {
            [IoSlice::new(&header[written..]), IoSlice::new(payload)]
        } else {
            [
                IoSlice::new(&payload[written - header.len()..]),
                IoSlice::new(&[]),
            ]
        };
        match w.write_vectored(&slices) {
            Ok(0) => return Err(FrameError::ClosedByPeer),
            Ok(n) => written += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Read one frame, appending its payload to `buf`.
pub fn read_frame<R: Read>(buf: &mut WireBuf, r: &mut R) -> Result<(), FrameError> {
    let mut header = [0u8; NUM_WIDTH];
    r.read_exact(&mut header).map_err(eof_is_close)?;

    let len = u64::from_le_bytes(header);
    if len > MAX_FRAME_LEN as u64 {
        return Err(FrameError::Oversize(len));
    }
    buf.fill_from(r, len as usize).map_err(eof_is_close)?;
    Ok(())
}

fn eof_is_close(e: std::io::Error) -> FrameError {
    if e.kind() == ErrorKind::UnexpectedEof {
        FrameError::ClosedByPeer
    } else {
        FrameError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use super::*;

    fn round_trip(len: usize) {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();

        let writer = {
            let payload = payload.clone();
            std::thread::spawn(move || {
                let mut buf = WireBuf::new();
                buf.push_bytes(&payload);
                write_frame(&buf, &mut a).unwrap();
            })
        };

        let mut buf = WireBuf::new();
        read_frame(&mut buf, &mut b).unwrap();
        assert_eq!(&*buf.shift_bytes().unwrap(), &payload[..]);
        assert!(buf.is_empty());
        writer.join().unwrap();
    }

    #[test]
    fn frame_sizes_around_the_initial_allocation() {
        for len in [0, 1, 4095, 4096, 4097] {
            round_trip(len);
        }
    }

    #[test]
    fn one_mebibyte_frame() {
        round_trip(1024 * 1024);
    }

    #[test]
    fn sequential_frames_on_one_socket() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let writer = std::thread::spawn(move || {
            for i in 0..10u64 {
                let mut buf = WireBuf::new();
                buf.push_num(i);
                buf.push_str("frame");
                write_frame(&buf, &mut a).unwrap();
            }
        });

        for i in 0..10u64 {
            let mut buf = WireBuf::new();
            read_frame(&mut buf, &mut b).unwrap();
            assert_eq!(buf.shift_num().unwrap(), i);
            assert_eq!(buf.shift_str().unwrap(), "frame");
        }
        writer.join().unwrap();
    }

    #[test]
    fn eof_before_header_is_closed_by_peer() {
        let (a, mut b) = UnixStream::pair().unwrap();
        drop(a);
        let mut buf = WireBuf::new();
        assert!(matches!(
            read_frame(&mut buf, &mut b),
            Err(FrameError::ClosedByPeer)
        ));
    }

    #[test]
    fn eof_mid_payload_is_closed_by_peer() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        // Header promises 100 bytes, only 3 arrive.
        a.write_all(&100u64.to_le_bytes()).unwrap();
        a.write_all(b"abc").unwrap();
        drop(a);

        let mut buf = WireBuf::new();
        assert!(matches!(
            read_frame(&mut buf, &mut b),
            Err(FrameError::ClosedByPeer)
        ));
    }

    #[test]
    fn oversize_header_is_rejected_without_reading_payload() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        a.write_all(&u64::MAX.to_le_bytes()).unwrap();

        let mut buf = WireBuf::new();
        assert!(matches!(
            read_frame(&mut buf, &mut b),
            Err(FrameError::Oversize(u64::MAX))
        ));
    }
}
