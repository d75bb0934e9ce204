//! Channel abstraction, exclusive takeover leases and framed peer links.
//!
//! # Architecture
//!
//! - [`Channel`]: a bidirectional byte stream with blocking read/write/close.
//!   [`StreamChannel`] adapts any tokio `AsyncRead + AsyncWrite` stream.
//! - [`SharedChannel`]: a channel that several components may reference but
//!   only one may drive at a time. [`SharedChannel::lease`] hands out an
//!   exclusive [`ChannelLease`]; a second concurrent lease fails with
//!   [`AuthError::ChannelBusy`]. Dropping the lease releases the channel.
//! - [`PeerLink`]: the driver's view of the peer during blob-mediated
//!   exchange, one blob per frame. [`FramedLink`] implements it over a
//!   channel with a 4-byte big-endian length prefix.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::error::AuthError;

/// Bidirectional byte-stream connection to the peer.
#[async_trait]
pub trait Channel: Send {
    /// Read up to `buf.len()` bytes; `Ok(0)` means the peer closed.
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Write the whole buffer.
    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()>;

    /// Flush and close the write side.
    async fn close(&mut self) -> std::io::Result<()>;
}

#[async_trait]
impl<C: Channel + ?Sized> Channel for &mut C {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        (**self).read(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        (**self).write_all(buf).await
    }

    async fn close(&mut self) -> std::io::Result<()> {
        (**self).close().await
    }
}

#[async_trait]
impl<C: Channel + ?Sized> Channel for Box<C> {
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        (**self).read(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        (**self).write_all(buf).await
    }

    async fn close(&mut self) -> std::io::Result<()> {
        (**self).close().await
    }
}

/// [`Channel`] over a tokio stream such as `TcpStream` or `DuplexStream`.
pub struct StreamChannel<S> {
    stream: S,
}

impl<S> StreamChannel<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[async_trait]
impl<S> Channel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.read(buf).await
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await
    }

    async fn close(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}

/// Channel shared between the driver and the handlers it invokes.
pub struct SharedChannel<C> {
    inner: Arc<Mutex<C>>,
}

impl<C> Clone for SharedChannel<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Channel> SharedChannel<C> {
    pub fn new(channel: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(channel)),
        }
    }

    /// Take exclusive ownership of the channel until the lease is dropped.
    pub fn lease(&self) -> Result<ChannelLease<C>, AuthError> {
        let guard = self
            .inner
            .clone()
            .try_lock_owned()
            .map_err(|_| AuthError::ChannelBusy)?;
        debug!("Channel leased");
        Ok(ChannelLease { guard })
    }

    /// Whether some component currently holds a lease.
    pub fn is_leased(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

/// Exclusive access to a [`SharedChannel`].
pub struct ChannelLease<C> {
    guard: OwnedMutexGuard<C>,
}

impl<C> Deref for ChannelLease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.guard
    }
}

impl<C> DerefMut for ChannelLease<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.guard
    }
}

impl<C> Drop for ChannelLease<C> {
    fn drop(&mut self) {
        debug!("Channel lease released");
    }
}

/// Read exactly `buf.len()` bytes, mapping EOF to [`AuthError::ChannelClosed`].
pub(crate) async fn read_exact<C: Channel + ?Sized>(
    channel: &mut C,
    buf: &mut [u8],
) -> Result<(), AuthError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = channel.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(AuthError::ChannelClosed);
        }
        filled += n;
    }
    Ok(())
}

/// Write one length-prefixed frame.
pub(crate) async fn write_frame<C: Channel + ?Sized>(
    channel: &mut C,
    payload: &[u8],
) -> Result<(), AuthError> {
    let len = u32::try_from(payload.len()).map_err(|_| AuthError::FrameTooLarge {
        len: payload.len(),
        capacity: u32::MAX as usize,
    })?;
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(payload);
    channel.write_all(&frame).await?;
    Ok(())
}

/// Read one length-prefixed frame no larger than `max_len`.
pub(crate) async fn read_frame<C: Channel + ?Sized>(
    channel: &mut C,
    max_len: usize,
) -> Result<Vec<u8>, AuthError> {
    let mut header = [0u8; 4];
    read_exact(channel, &mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > max_len {
        return Err(AuthError::FrameTooLarge {
            len,
            capacity: max_len,
        });
    }
    let mut payload = vec![0u8; len];
    read_exact(channel, &mut payload).await?;
    Ok(payload)
}

/// Blob-at-a-time transport to the peer used by the negotiation driver.
#[async_trait]
pub trait PeerLink: Send {
    /// Send the contents of one blob.
    async fn send(&mut self, payload: &[u8]) -> Result<(), AuthError>;

    /// Receive the contents of one blob, at most `max_len` bytes.
    async fn recv(&mut self, max_len: usize) -> Result<Vec<u8>, AuthError>;
}

/// [`PeerLink`] that frames blobs over a [`Channel`].
pub struct FramedLink<C> {
    channel: C,
}

impl<C: Channel> FramedLink<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    pub fn into_inner(self) -> C {
        self.channel
    }
}

#[async_trait]
impl<C: Channel> PeerLink for FramedLink<C> {
    async fn send(&mut self, payload: &[u8]) -> Result<(), AuthError> {
        write_frame(&mut self.channel, payload).await
    }

    async fn recv(&mut self, max_len: usize) -> Result<Vec<u8>, AuthError> {
        read_frame(&mut self.channel, max_len).await
    }
}
