//! Connection wrapper enforcing per-operation deadlines and an idle ceiling.
//!
//! Each read or write arms its own deadline at `now + timeout` when the
//! operation starts and disarms it when the operation completes. Completion
//! re-arms the idle ceiling at `now + long_timeout`; an operation that starts
//! after the ceiling has passed fails immediately. Expiry surfaces as an
//! [`io::ErrorKind::TimedOut`] error, indistinguishable from any other I/O
//! failure to the layers above.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::{Instant, Sleep, sleep_until};

/// A stream whose reads and writes are bounded by deadlines.
#[derive(Debug)]
pub struct TimeoutConn<T> {
    inner: T,
    timeout: Duration,
    long_timeout: Duration,
    idle_deadline: Instant,
    read_deadline: Pin<Box<Sleep>>,
    write_deadline: Pin<Box<Sleep>>,
    reading: bool,
    writing: bool,
}

impl<T> TimeoutConn<T> {
    /// Wraps `inner`, arming the idle ceiling immediately.
    pub fn new(inner: T, timeout: Duration, long_timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            inner,
            timeout,
            long_timeout,
            idle_deadline: now + long_timeout,
            read_deadline: Box::pin(sleep_until(now + timeout)),
            write_deadline: Box::pin(sleep_until(now + timeout)),
            reading: false,
            writing: false,
        }
    }

    /// Overrides the idle ceiling.
    pub fn set_idle_deadline(&mut self, deadline: Instant) {
        self.idle_deadline = deadline;
    }

    /// Moves the deadline of the in-flight (or next) read.
    pub fn set_read_deadline(&mut self, deadline: Instant) {
        self.read_deadline.as_mut().reset(deadline);
        self.reading = true;
    }

    /// Moves the deadline of the in-flight (or next) write.
    pub fn set_write_deadline(&mut self, deadline: Instant) {
        self.write_deadline.as_mut().reset(deadline);
        self.writing = true;
    }

    /// Moves both operation deadlines.
    pub fn set_deadline(&mut self, deadline: Instant) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Current idle ceiling.
    pub fn idle_deadline(&self) -> Instant {
        self.idle_deadline
    }

    /// Borrows the wrapped stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Unwraps the stream, discarding deadlines.
    pub fn into_inner(self) -> T {
        self.inner
    }

    fn touch(&mut self) {
        self.idle_deadline = Instant::now() + self.long_timeout;
    }
}

impl TimeoutConn<TcpStream> {
    /// Local address of the socket.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Remote address of the socket.
    ///
    /// # Errors
    ///
    /// Propagates the socket error.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out"))
}

/// Starts an operation: fails past the idle ceiling, else arms its deadline.
fn begin(
    active: &mut bool,
    deadline: &mut Pin<Box<Sleep>>,
    idle_deadline: Instant,
    timeout: Duration,
) -> io::Result<()> {
    if *active {
        return Ok(());
    }
    let now = Instant::now();
    if now >= idle_deadline {
        return Err(timed_out("idle connection"));
    }
    deadline.as_mut().reset(now + timeout);
    *active = true;
    Ok(())
}

impl<T: AsyncRead + Unpin> AsyncRead for TimeoutConn<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Err(err) = begin(
            &mut this.reading,
            &mut this.read_deadline,
            this.idle_deadline,
            this.timeout,
        ) {
            return Poll::Ready(Err(err));
        }

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.reading = false;
                this.touch();
                Poll::Ready(result)
            }
            Poll::Pending => {
                if this.read_deadline.as_mut().poll(cx).is_ready() {
                    this.reading = false;
                    this.touch();
                    return Poll::Ready(Err(timed_out("read")));
                }
                Poll::Pending
            }
        }
    }
}

impl<T: AsyncWrite + Unpin> TimeoutConn<T> {
    fn poll_write_op<R>(
        &mut self,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut T>, &mut Context<'_>) -> Poll<io::Result<R>>,
    ) -> Poll<io::Result<R>> {
        if let Err(err) = begin(
            &mut self.writing,
            &mut self.write_deadline,
            self.idle_deadline,
            self.timeout,
        ) {
            return Poll::Ready(Err(err));
        }

        match op(Pin::new(&mut self.inner), cx) {
            Poll::Ready(result) => {
                self.writing = false;
                self.touch();
                Poll::Ready(result)
            }
            Poll::Pending => {
                if self.write_deadline.as_mut().poll(cx).is_ready() {
                    self.writing = false;
                    self.touch();
                    return Poll::Ready(Err(timed_out("write")));
                }
                Poll::Pending
            }
        }
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for TimeoutConn<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_write_op(cx, |inner, cx| inner.poll_write(cx, buf))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_write_op(cx, |inner, cx| inner.poll_write_vectored(cx, bufs))
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .poll_write_op(cx, |inner, cx| inner.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
