//! Length-prefixed MessagePack framing over TCP, plus bind/connect helpers
//! with retrying.

use std::marker::Unpin;
use std::net::SocketAddr;

use crate::utils::LeaseKvError;

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};

/// Receives one frame (u64 big-endian length, then a MessagePack-encoded
/// object) from `conn_read`, using `read_buf` to hold partial reads.
///
/// CANCELLATION SAFETY: this function is meant to be used as a
/// `tokio::select!` branch. `read_u64()`/`read_exact()` are not
/// cancellation-safe, so all reads go through `read_buf()` and bytes
/// received before a cancellation stay in `read_buf` for the next call to
/// continue from.
pub(crate) async fn framed_recv<T, Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
) -> Result<T, LeaseKvError>
where
    T: DeserializeOwned,
    Conn: AsyncReadExt + Unpin,
{
    // length prefix first
    while read_buf.len() < 8 {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(LeaseKvError::msg("connection closed by peer"));
        }
    }
    let frame_len = u64::from_be_bytes(read_buf[..8].try_into().unwrap());

    // then the object body
    let frame_end = 8 + frame_len as usize;
    if read_buf.capacity() < frame_end {
        read_buf.reserve(frame_end - read_buf.capacity());
    }
    while read_buf.len() < frame_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(LeaseKvError::msg("connection closed mid-frame"));
        }
    }
    let obj = rmp_serde::from_slice(&read_buf[8..frame_end])?;

    // no more awaits past this point, so consume the frame's bytes now and
    // preserve any bytes of the next frame already received
    if read_buf.len() > frame_end {
        let tail = Bytes::copy_from_slice(&read_buf[frame_end..]);
        read_buf.clear();
        read_buf.extend_from_slice(&tail);
    } else {
        read_buf.clear();
    }

    Ok(obj)
}

/// Sends one frame carrying `obj` through `conn_write`. Must be called from
/// a context that owns the write half exclusively (a dedicated writer task
/// or a servant's select-branch body), never from a `select!` branch head.
pub(crate) async fn framed_send<T, Conn>(
    conn_write: &mut Conn,
    obj: &T,
) -> Result<(), LeaseKvError>
where
    T: Serialize,
    Conn: AsyncWriteExt + Unpin,
{
    let frame = rmp_serde::to_vec(obj)?;
    conn_write.write_u64(frame.len() as u64).await?;
    conn_write.write_all(&frame).await?;
    Ok(())
}

/// `TcpListener::bind()` with a fixed-interval retrying loop, for racing
/// against a lingering socket from a previous process.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, LeaseKvError> {
    loop {
        match TcpListener::bind(bind_addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// `TcpStream::connect()` with a fixed-interval retrying loop, for dialing
/// a peer that may not be listening yet.
pub(crate) async fn tcp_connect_with_retry(
    conn_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpStream, LeaseKvError> {
    loop {
        match TcpStream::connect(conn_addr).await {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}
