//! Self-synchronizing XOR obfuscation over an async byte stream
//!
//! The first byte sent in each direction is a random key seed transmitted
//! raw; every following byte is XORed with a running key that tracks the
//! previous plaintext byte. The read side reseeds its key from the decoded
//! value, the write side from the original value, so both ends evolve in
//! lockstep. Swapping which value reseeds the key breaks decryption after
//! the first byte.
//!
//! This scrambles the stream against casual inspection and fingerprinting;
//! it is not confidentiality-grade encryption.

use rand::{thread_rng, Rng};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Byte-stream wrapper applying the per-direction rolling-key XOR cipher.
pub struct ObfuscatedStream<S> {
    inner: S,
    read_key: Option<u8>,
    write_key: Option<u8>,
    /// Encoded bytes accepted but not yet written to the inner stream.
    /// Staging them keeps the cipher state consistent across partial writes.
    pending: Vec<u8>,
    pending_pos: usize,
}

impl<S> ObfuscatedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_key: None,
            write_key: None,
            pending: Vec::new(),
            pending_pos: 0,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncWrite + Unpin> ObfuscatedStream<S> {
    fn poll_drain_pending(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.pending_pos < self.pending.len() {
            let n = ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.pending[self.pending_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "stream closed while draining cipher buffer",
                )));
            }
            self.pending_pos += n;
        }
        self.pending.clear();
        self.pending_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ObfuscatedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut key = match this.read_key {
            Some(key) => key,
            None => {
                let mut seed = [0u8; 1];
                let mut seed_buf = ReadBuf::new(&mut seed);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut seed_buf))?;
                if seed_buf.filled().is_empty() {
                    // EOF before the key byte arrived: report stream end.
                    return Poll::Ready(Ok(()));
                }
                this.read_key = Some(seed[0]);
                seed[0]
            }
        };

        let start = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        for byte in &mut buf.filled_mut()[start..] {
            *byte ^= key;
            key = *byte;
        }
        this.read_key = Some(key);
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ObfuscatedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain_pending(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut key = match this.write_key {
            Some(key) => key,
            None => {
                // Key seed must be non-zero and goes out raw ahead of the data.
                let key = thread_rng().gen_range(1..=254u8);
                this.pending.push(key);
                this.write_key = Some(key);
                key
            }
        };
        for &byte in buf {
            this.pending.push(byte ^ key);
            key = byte;
        }
        this.write_key = Some(key);

        // Push what we can now; anything left drains on the next write or
        // flush. The caller's bytes are already committed to the cipher.
        if let Poll::Ready(Err(e)) = this.poll_drain_pending(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_pending(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain_pending(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
