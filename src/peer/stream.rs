use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf},
    net::TcpStream,
};

use crate::crypto::Cipher;

/// A byte stream with a replayable prefix. Bytes consumed while sniffing an
/// inbound connection (PE detection) are handed back through here so the
/// plain or MSE path sees an untouched stream.
#[derive(Debug)]
pub(crate) struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let remaining = &this.prefix[this.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            this.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// The concrete transport every peer connection runs over.
pub(crate) type Transport = PrefixedStream<TcpStream>;

/// Read half of a connection, transparently decrypting when a cipher was
/// negotiated. The cipher's incoming keystream is touched exclusively by
/// the task that owns this reader.
pub(crate) struct SecureReader {
    inner: ReadHalf<Transport>,
    cipher: Option<Cipher>,
}

impl SecureReader {
    pub fn new(inner: ReadHalf<Transport>, cipher: Option<Cipher>) -> Self {
        Self { inner, cipher }
    }

    /// Read available bytes, decrypted. Returns 0 at EOF.
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf).await?;
        if let Some(cipher) = &mut self.cipher {
            cipher.decrypt_in_place(&mut buf[..n]);
        }
        Ok(n)
    }

    /// Fill the whole buffer, decrypted.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_exact(buf).await?;
        if let Some(cipher) = &mut self.cipher {
            cipher.decrypt_in_place(buf);
        }
        Ok(())
    }
}

/// Write half of a connection, transparently encrypting when a cipher was
/// negotiated.
pub(crate) struct SecureWriter {
    inner: WriteHalf<Transport>,
    cipher: Option<Cipher>,
}

impl SecureWriter {
    pub fn new(inner: WriteHalf<Transport>, cipher: Option<Cipher>) -> Self {
        Self { inner, cipher }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.cipher {
            Some(cipher) => {
                let encrypted = cipher.encrypt(data);
                self.inner.write_all(&encrypted).await
            }
            None => self.inner.write_all(data).await,
        }
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.inner.shutdown().await
    }
}
