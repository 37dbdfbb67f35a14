//! Caller-supplied byte transports
//!
//! A session never opens sockets. It moves encrypted records through a
//! [`Transport`], which may be blocking or non-blocking. Non-blocking
//! transports signal "not ready" with [`io::ErrorKind::WouldBlock`].

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

/// Byte pipe between a session and its peer
pub trait Transport: Send {
    /// Read available bytes into `buf`
    ///
    /// `Ok(0)` means the peer closed the stream.
    fn pull(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write bytes from `buf`, returning how many were accepted
    fn push(&mut self, buf: &[u8]) -> io::Result<usize>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn pull(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).pull(buf)
    }

    fn push(&mut self, buf: &[u8]) -> io::Result<usize> {
        (**self).push(buf)
    }
}

/// Transport over any `Read + Write` stream such as a `TcpStream`
#[derive(Debug)]
pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S> {
    /// Wrap a stream
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Borrow the wrapped stream
    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Unwrap the stream
    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write + Send> Transport for StreamTransport<S> {
    fn pull(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn push(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.stream.write(buf)?;
        self.stream.flush()?;
        Ok(written)
    }
}

/// Pull hook: fill the buffer from the handle
pub type PullFn<H> = fn(&mut H, &mut [u8]) -> io::Result<usize>;
/// Push hook: send the buffer through the handle
pub type PushFn<H> = fn(&mut H, &[u8]) -> io::Result<usize>;

/// Transport built from an opaque handle and a pair of hook functions
pub struct HookTransport<H> {
    handle: H,
    pull: PullFn<H>,
    push: PushFn<H>,
}

impl<H> HookTransport<H> {
    /// Combine a handle with its pull and push hooks
    pub fn new(handle: H, pull: PullFn<H>, push: PushFn<H>) -> Self {
        Self { handle, pull, push }
    }

    /// Borrow the handle
    pub fn handle(&self) -> &H {
        &self.handle
    }
}

impl<H> fmt::Debug for HookTransport<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookTransport").finish_non_exhaustive()
    }
}

impl<H: Send> Transport for HookTransport<H> {
    fn pull(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (self.pull)(&mut self.handle, buf)
    }

    fn push(&mut self, buf: &[u8]) -> io::Result<usize> {
        (self.push)(&mut self.handle, buf)
    }
}

#[derive(Debug, Default)]
struct Pipe {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-memory, non-blocking duplex pipe
///
/// `pull` reports `WouldBlock` while nothing is buffered and `Ok(0)` once
/// either end has called [`MemoryTransport::close`]. Pushing into a closed
/// pipe fails with `BrokenPipe`.
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    incoming: Arc<Mutex<Pipe>>,
    outgoing: Arc<Mutex<Pipe>>,
}

impl MemoryTransport {
    /// Create two connected ends
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Mutex::new(Pipe::default()));
        let b_to_a = Arc::new(Mutex::new(Pipe::default()));
        (
            Self {
                incoming: Arc::clone(&b_to_a),
                outgoing: Arc::clone(&a_to_b),
            },
            Self {
                incoming: a_to_b,
                outgoing: b_to_a,
            },
        )
    }

    /// Hang up both directions
    ///
    /// The other end reads end of stream once it has drained what was already
    /// sent, and its pushes fail.
    pub fn close(&self) {
        lock(&self.outgoing).closed = true;
        lock(&self.incoming).closed = true;
    }

    /// Bytes waiting to be pulled at this end
    #[must_use]
    pub fn pending(&self) -> usize {
        lock(&self.incoming).bytes.len()
    }
}

impl Transport for MemoryTransport {
    fn pull(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut pipe = lock(&self.incoming);
        if pipe.bytes.is_empty() {
            if pipe.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(pipe.bytes.len());
        for (slot, byte) in buf.iter_mut().zip(pipe.bytes.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn push(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut pipe = lock(&self.outgoing);
        if pipe.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        pipe.bytes.extend(buf);
        Ok(buf.len())
    }
}

fn lock(pipe: &Mutex<Pipe>) -> MutexGuard<'_, Pipe> {
    match pipe.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// `Read` view over a transport, for the engine's record reader
pub(crate) struct PullAdapter<'a>(pub(crate) &'a mut dyn Transport);

impl Read for PullAdapter<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.pull(buf)
    }
}

/// `Write` view over a transport, for the engine's record writer
pub(crate) struct PushAdapter<'a>(pub(crate) &'a mut dyn Transport);

impl Write for PushAdapter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.push(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_pair_is_duplex_and_non_blocking() {
        let (mut a, mut b) = MemoryTransport::pair();
        let mut buf = [0u8; 8];

        let err = b.pull(&mut buf).expect_err("empty pipe must not block");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        assert_eq!(a.push(b"ping").expect("push"), 4);
        assert_eq!(b.pending(), 4);
        assert_eq!(b.pull(&mut buf).expect("pull"), 4);
        assert_eq!(&buf[..4], b"ping");

        b.push(b"pong").expect("push");
        assert_eq!(a.pull(&mut buf).expect("pull"), 4);
        assert_eq!(&buf[..4], b"pong");
    }

    #[test]
    fn close_reads_as_end_of_stream() {
        let (a, mut b) = MemoryTransport::pair();
        a.close();
        let mut buf = [0u8; 4];
        assert_eq!(b.pull(&mut buf).expect("closed pipe reads zero"), 0);
    }

    #[test]
    fn close_breaks_the_peers_writes() {
        let (mut a, mut b) = MemoryTransport::pair();
        a.push(b"late").expect("push before close");
        a.close();

        let err = b.push(b"hello").expect_err("push into a hung-up pipe");
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let mut buf = [0u8; 8];
        assert_eq!(b.pull(&mut buf).expect("buffered bytes survive close"), 4);
        assert_eq!(b.pull(&mut buf).expect("then end of stream"), 0);
    }

    #[test]
    fn hook_transport_calls_through_to_handle() {
        fn pull(handle: &mut Vec<u8>, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(handle.len());
            buf[..n].copy_from_slice(&handle[..n]);
            handle.drain(..n);
            Ok(n)
        }
        fn push(handle: &mut Vec<u8>, buf: &[u8]) -> io::Result<usize> {
            handle.extend_from_slice(buf);
            Ok(buf.len())
        }

        let mut transport = HookTransport::new(Vec::new(), pull, push);
        transport.push(b"abc").expect("push");
        assert_eq!(transport.handle().as_slice(), b"abc");
        let mut buf = [0u8; 3];
        assert_eq!(transport.pull(&mut buf).expect("pull"), 3);
        assert_eq!(&buf, b"abc");
    }
}
