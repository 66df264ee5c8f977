//! Framed, lock-guarded byte-stream channels between callers and the worker.
//!
//! Every message travels as one frame: a 4-byte big-endian payload length
//! followed by the payload. Framing keeps message boundaries intact no matter
//! how the underlying stream splits reads and writes.
//!
//! A [`Channel`] is one direction of the transport. The context owns two of
//! them (requests towards the worker, results back from it), each with its
//! own write lock and read lock, so callers submitting queries never wait
//! behind a thread that is draining results.

use crate::error::ChannelError;
use crate::util;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Size of the length prefix.
pub const HEADER_LEN: usize = 4;

/// Writes one frame carrying `payload`.
///
/// # Errors
///
/// Returns [`ChannelError::Protocol`] if the payload exceeds `max_len`, or
/// [`ChannelError::Io`] if the stream fails.
pub fn write_frame<W: Write>(
    stream: &mut W,
    payload: &[u8],
    max_len: usize,
) -> Result<(), ChannelError> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|_| payload.len() <= max_len)
        .ok_or_else(|| {
            ChannelError::Protocol(format!(
                "frame of {} bytes exceeds limit of {max_len}",
                payload.len()
            ))
        })?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32(len);
    buf.put_slice(payload);
    stream.write_all(&buf)?;
    stream.flush()?;
    Ok(())
}

/// Reads one frame and returns its payload.
///
/// Blocks until a whole frame is available.
///
/// # Errors
///
/// Returns [`ChannelError::Closed`] if the stream ends cleanly before a new
/// frame starts, [`ChannelError::Protocol`] if it ends inside a frame or the
/// announced length exceeds `max_len`, and [`ChannelError::Io`] otherwise.
pub fn read_frame<R: Read>(stream: &mut R, max_len: usize) -> Result<Vec<u8>, ChannelError> {
    let mut header = [0u8; HEADER_LEN];
    match fill(stream, &mut header)? {
        0 => return Err(ChannelError::Closed),
        HEADER_LEN => {}
        n => {
            return Err(ChannelError::Protocol(format!(
                "stream ended after {n} of {HEADER_LEN} header bytes"
            )));
        }
    }

    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(ChannelError::Protocol(format!(
            "announced frame of {len} bytes exceeds limit of {max_len}"
        )));
    }

    let mut payload = vec![0u8; len];
    let got = fill(stream, &mut payload)?;
    if got < len {
        return Err(ChannelError::Protocol(format!(
            "stream ended after {got} of {len} payload bytes"
        )));
    }
    Ok(payload)
}

/// Reads until `buf` is full or the stream ends; returns the bytes read.
fn fill<R: Read>(stream: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// One unidirectional pipe with independent write and read locks.
#[derive(Debug)]
pub struct Channel {
    reader: Mutex<Option<File>>,
    writer: Mutex<Option<File>>,
    read_fd: RawFd,
    read_open: AtomicBool,
    max_frame_len: usize,
}

impl Channel {
    /// Creates a channel backed by a fresh OS pipe.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the pipe cannot be created.
    pub fn new(max_frame_len: usize) -> io::Result<Self> {
        let (reader, writer) = util::pipe()?;
        Ok(Self {
            read_fd: reader.as_raw_fd(),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            read_open: AtomicBool::new(true),
            max_frame_len,
        })
    }

    /// Writes one frame while holding the write lock.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the write end was closed, or the
    /// error from [`write_frame`].
    pub fn send(&self, payload: &[u8]) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock();
        let stream = writer.as_mut().ok_or(ChannelError::Closed)?;
        write_frame(stream, payload, self.max_frame_len)
    }

    /// Reads one frame while holding the read lock.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::Closed`] if the read end was closed, or the
    /// error from [`read_frame`].
    pub fn recv(&self) -> Result<Vec<u8>, ChannelError> {
        let mut reader = self.reader.lock();
        let stream = reader.as_mut().ok_or(ChannelError::Closed)?;
        read_frame(stream, self.max_frame_len)
    }

    /// Writes bytes as-is, bypassing framing.
    #[cfg(test)]
    pub(crate) fn send_raw(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock();
        writer.as_mut().map_or(Ok(()), |w| w.write_all(bytes))
    }

    /// Closes the write end; readers see end-of-stream once drained.
    ///
    /// Returns `false` if it was already closed.
    pub fn close_writer(&self) -> bool {
        self.writer.lock().take().is_some()
    }

    /// Closes the read end; writers then fail with a broken pipe.
    pub fn close_reader(&self) -> bool {
        let mut reader = self.reader.lock();
        self.read_open.store(false, Ordering::Release);
        reader.take().is_some()
    }

    /// Returns `true` if a read would not block, waiting up to `timeout`.
    ///
    /// A closed read end never reports readable.
    #[must_use]
    pub fn poll_readable(&self, timeout: Option<Duration>) -> bool {
        self.read_open.load(Ordering::Acquire) && util::poll_readable(self.read_fd, timeout)
    }
}

impl AsRawFd for Channel {
    /// Descriptor of the read end, for event-loop integration.
    fn as_raw_fd(&self) -> RawFd {
        self.read_fd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Seek, SeekFrom};
    use std::sync::Arc;
    use std::thread;

    const MAX: usize = 1024;

    /// Accepts at most `chunk` bytes per write call.
    struct ChunkedWriter<W> {
        inner: W,
        chunk: usize,
    }

    impl<W: Write> Write for ChunkedWriter<W> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.inner.write(&buf[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            self.inner.flush()
        }
    }

    /// Returns at most `chunk` bytes per read call.
    struct ChunkedReader<R> {
        inner: R,
        chunk: usize,
    }

    impl<R: Read> Read for ChunkedReader<R> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.inner.read(&mut buf[..n])
        }
    }

    #[test]
    fn boundaries_survive_partial_writes_and_reads() {
        let frames: [&[u8]; 4] = [b"first", b"", b"a somewhat longer third frame", &[0xff; 300]];

        let mut w = ChunkedWriter {
            inner: Vec::new(),
            chunk: 3,
        };
        for f in frames {
            write_frame(&mut w, f, MAX).unwrap();
        }

        let mut r = ChunkedReader {
            inner: Cursor::new(w.inner),
            chunk: 2,
        };
        for f in frames {
            assert_eq!(read_frame(&mut r, MAX).unwrap(), f);
        }
        assert!(matches!(read_frame(&mut r, MAX), Err(ChannelError::Closed)));
    }

    #[test]
    fn frames_through_a_file() {
        let mut file = tempfile::tempfile().unwrap();
        {
            let mut w = ChunkedWriter {
                inner: &mut file,
                chunk: 1,
            };
            write_frame(&mut w, b"on disk", MAX).unwrap();
            write_frame(&mut w, b"twice", MAX).unwrap();
        }
        file.seek(SeekFrom::Start(0)).unwrap();
        assert_eq!(read_frame(&mut file, MAX).unwrap(), b"on disk");
        assert_eq!(read_frame(&mut file, MAX).unwrap(), b"twice");
        assert!(matches!(read_frame(&mut file, MAX), Err(ChannelError::Closed)));
    }

    #[test]
    fn truncation_is_a_protocol_error_not_eof() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"complete", MAX).unwrap();

        let short_header = &buf[..2];
        assert!(matches!(
            read_frame(&mut Cursor::new(short_header), MAX),
            Err(ChannelError::Protocol(_))
        ));

        let short_body = &buf[..buf.len() - 1];
        assert!(matches!(
            read_frame(&mut Cursor::new(short_body), MAX),
            Err(ChannelError::Protocol(_))
        ));

        assert!(matches!(
            read_frame(&mut Cursor::new(&[][..]), MAX),
            Err(ChannelError::Closed)
        ));
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut buf = Vec::new();
        assert!(matches!(
            write_frame(&mut buf, &[0; 16], 8),
            Err(ChannelError::Protocol(_))
        ));
        assert!(buf.is_empty());

        let announced = 9u32.to_be_bytes();
        assert!(matches!(
            read_frame(&mut Cursor::new(&announced[..]), 8),
            Err(ChannelError::Protocol(_))
        ));
    }

    #[test]
    fn channel_send_and_recv() {
        let ch = Channel::new(MAX).unwrap();
        ch.send(b"hello").unwrap();
        assert!(ch.poll_readable(Some(Duration::ZERO)));
        assert_eq!(ch.recv().unwrap(), b"hello");
    }

    #[test]
    fn closed_writer_yields_end_of_stream() {
        let ch = Channel::new(MAX).unwrap();
        ch.send(b"last").unwrap();
        assert!(ch.close_writer());
        assert!(!ch.close_writer());

        assert_eq!(ch.recv().unwrap(), b"last");
        assert!(matches!(ch.recv(), Err(ChannelError::Closed)));
        assert!(matches!(ch.send(b"late"), Err(ChannelError::Closed)));
    }

    #[test]
    fn closed_reader_breaks_the_pipe() {
        let ch = Channel::new(MAX).unwrap();
        assert!(ch.close_reader());
        assert!(!ch.poll_readable(Some(Duration::ZERO)));
        assert!(matches!(ch.recv(), Err(ChannelError::Closed)));
        match ch.send(b"nobody listens") {
            Err(ChannelError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected broken pipe, got {other:?}"),
        }
    }

    #[test]
    fn concurrent_senders_never_interleave() {
        let ch = Arc::new(Channel::new(MAX).unwrap());
        let reader = {
            let ch = Arc::clone(&ch);
            thread::spawn(move || {
                let mut seen = Vec::new();
                while let Ok(frame) = ch.recv() {
                    seen.push(frame);
                }
                seen
            })
        };

        let senders: Vec<_> = (0u8..4)
            .map(|t| {
                let ch = Arc::clone(&ch);
                thread::spawn(move || {
                    for _ in 0..50 {
                        ch.send(&[t; 700]).unwrap();
                    }
                })
            })
            .collect();
        for s in senders {
            s.join().unwrap();
        }
        ch.close_writer();

        let seen = reader.join().unwrap();
        assert_eq!(seen.len(), 200);
        for frame in seen {
            assert_eq!(frame.len(), 700);
            assert!(frame.iter().all(|b| *b == frame[0]));
        }
    }
}
