//! Framed memcached binary wire I/O
//!
//! A wire message is a fixed 24-byte header followed by a body whose
//! length is the unsigned 32-bit big-endian integer at header offsets
//! 8-11. Nothing else in the frame is interpreted; the proxy moves
//! opaque bytes.
//!
//! Every fatal error shuts the socket down before surfacing: a partial
//! read leaves the upstream protocol state ambiguous, so the only safe
//! recovery is to evict the connection and let the pool replace it.

use crate::error::WireError;
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fixed size of a memcached binary header.
pub const HEADER_LEN: usize = 24;

/// Bytes of a frame shown in debug logs.
const HEX_PREVIEW_LEN: usize = 64;

/// Decode `total_body_length` from a complete header.
fn body_length(header: &[u8; HEADER_LEN]) -> usize {
    u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize
}

/// Compose the effective deadline: the earlier of `now + timeout` and the
/// context deadline. Absent values mean no bound from that side.
pub fn effective_deadline(
    timeout: Option<Duration>,
    ctx_deadline: Option<Instant>,
) -> Option<Instant> {
    let local = timeout.map(|t| Instant::now() + t);
    match (local, ctx_deadline) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take(HEX_PREVIEW_LEN)
        .map(|b| format!("{:02x}", b))
        .collect()
}

enum FrameReadError {
    /// End-of-stream before any header byte
    Eof,
    Header(io::Error),
    Body(io::Error),
}

enum Outcome<T> {
    Done(T),
    TimedOut,
    Cancelled,
}

/// Read until `buf` is full or the stream ends. Returns the bytes read;
/// anything short of `buf.len()` means EOF.
async fn read_full<S>(stream: &mut S, buf: &mut [u8]) -> io::Result<usize>
where
    S: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn read_frame_inner<S>(stream: &mut S, buf: &mut BytesMut) -> Result<(), FrameReadError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match read_full(stream, &mut header).await {
        Ok(0) => return Err(FrameReadError::Eof),
        Ok(n) if n < HEADER_LEN => {
            return Err(FrameReadError::Header(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} of {} header bytes", n, HEADER_LEN),
            )))
        }
        Ok(_) => {}
        Err(e) => return Err(FrameReadError::Header(e)),
    }

    let body_len = body_length(&header);

    buf.clear();
    buf.reserve(HEADER_LEN + body_len);
    buf.extend_from_slice(&header);

    if body_len > 0 {
        buf.resize(HEADER_LEN + body_len, 0);
        match read_full(stream, &mut buf[HEADER_LEN..]).await {
            Ok(n) if n == body_len => {}
            Ok(n) => {
                return Err(FrameReadError::Body(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} of {} body bytes", n, body_len),
                )))
            }
            Err(e) => return Err(FrameReadError::Body(e)),
        }
    }

    Ok(())
}

/// Read one complete wire message into `buf` (cleared first, capacity
/// reused across messages).
///
/// Cancellation is checked before any I/O and honored during the read;
/// the effective deadline is the minimum of `read_timeout` and
/// `ctx_deadline`. Every failure except a pre-I/O cancellation check has
/// already shut the socket down when it surfaces; end-of-stream before
/// the first header byte is the distinguished [`WireError::Eof`].
pub async fn read_frame<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    cancel: &CancellationToken,
    read_timeout: Option<Duration>,
    ctx_deadline: Option<Instant>,
    address: &str,
    id: u64,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if cancel.is_cancelled() {
        // an unread message may be sitting on the wire
        let _ = stream.shutdown().await;
        return Err(WireError::Cancelled {
            address: address.to_string(),
            id,
        });
    }

    let deadline = effective_deadline(read_timeout, ctx_deadline);

    let outcome = {
        let io = async {
            match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, read_frame_inner(stream, buf)).await {
                        Ok(res) => Outcome::Done(res),
                        Err(_) => Outcome::TimedOut,
                    }
                }
                None => Outcome::Done(read_frame_inner(stream, buf).await),
            }
        };
        tokio::select! {
            outcome = io => outcome,
            _ = cancel.cancelled() => Outcome::Cancelled,
        }
    };

    match outcome {
        Outcome::Done(Ok(())) => {
            debug!(
                address,
                id,
                length = buf.len(),
                hex = %hex_preview(buf),
                "read wire message"
            );
            Ok(())
        }
        Outcome::Done(Err(FrameReadError::Eof)) => {
            let _ = stream.shutdown().await;
            Err(WireError::Eof)
        }
        Outcome::Done(Err(FrameReadError::Header(source))) => {
            let _ = stream.shutdown().await;
            Err(WireError::IncompleteHeader {
                address: address.to_string(),
                id,
                source,
            })
        }
        Outcome::Done(Err(FrameReadError::Body(source))) => {
            let _ = stream.shutdown().await;
            Err(WireError::IncompleteBody {
                address: address.to_string(),
                id,
                source,
            })
        }
        Outcome::TimedOut => {
            let _ = stream.shutdown().await;
            Err(WireError::Timeout {
                address: address.to_string(),
                id,
                op: "read",
            })
        }
        Outcome::Cancelled => {
            let _ = stream.shutdown().await;
            Err(WireError::Cancelled {
                address: address.to_string(),
                id,
            })
        }
    }
}

/// Write one complete wire message.
///
/// A cancellation observed before any I/O leaves the socket alone (the
/// write never happened); any failure after the write started shuts the
/// socket down.
pub async fn write_frame<S>(
    stream: &mut S,
    frame: &[u8],
    cancel: &CancellationToken,
    write_timeout: Option<Duration>,
    ctx_deadline: Option<Instant>,
    address: &str,
    id: u64,
) -> Result<(), WireError>
where
    S: AsyncWrite + Unpin,
{
    if cancel.is_cancelled() {
        return Err(WireError::Cancelled {
            address: address.to_string(),
            id,
        });
    }

    let deadline = effective_deadline(write_timeout, ctx_deadline);

    let outcome = {
        let io = async {
            match deadline {
                Some(deadline) => {
                    let write = async {
                        stream.write_all(frame).await?;
                        stream.flush().await
                    };
                    match tokio::time::timeout_at(deadline, write).await {
                        Ok(res) => Outcome::Done(res),
                        Err(_) => Outcome::TimedOut,
                    }
                }
                None => {
                    let res = async {
                        stream.write_all(frame).await?;
                        stream.flush().await
                    }
                    .await;
                    Outcome::Done(res)
                }
            }
        };
        tokio::select! {
            outcome = io => outcome,
            _ = cancel.cancelled() => Outcome::Cancelled,
        }
    };

    match outcome {
        Outcome::Done(Ok(())) => {
            debug!(
                address,
                id,
                length = frame.len(),
                hex = %hex_preview(frame),
                "wrote wire message"
            );
            Ok(())
        }
        Outcome::Done(Err(source)) => {
            let _ = stream.shutdown().await;
            Err(WireError::WriteFailed {
                address: address.to_string(),
                id,
                source,
            })
        }
        Outcome::TimedOut => {
            let _ = stream.shutdown().await;
            Err(WireError::Timeout {
                address: address.to_string(),
                id,
                op: "write",
            })
        }
        Outcome::Cancelled => {
            // the write may have landed partially
            let _ = stream.shutdown().await;
            Err(WireError::Cancelled {
                address: address.to_string(),
                id,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn frame_with_body(body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0u8; HEADER_LEN];
        frame[0] = 0x80; // request magic
        frame[8..12].copy_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);
        frame
    }

    #[test]
    fn test_effective_deadline_takes_minimum() {
        let now = Instant::now();
        let ctx = now + Duration::from_secs(1);
        let composed = effective_deadline(Some(Duration::from_secs(10)), Some(ctx)).unwrap();
        assert_eq!(composed, ctx);

        let composed = effective_deadline(Some(Duration::from_millis(10)), Some(ctx)).unwrap();
        assert!(composed < ctx);

        assert_eq!(effective_deadline(None, None), None);
        assert_eq!(effective_deadline(None, Some(ctx)), Some(ctx));
    }

    #[tokio::test]
    async fn test_read_frame_with_body() {
        let (mut client, mut server) = duplex(1024);
        let frame = frame_with_body(b"0123456789");
        client.write_all(&frame).await.unwrap();

        let cancel = CancellationToken::new();
        let mut buf = BytesMut::new();
        read_frame(&mut server, &mut buf, &cancel, None, None, "test", 1)
            .await
            .unwrap();

        assert_eq!(buf.len(), 34);
        assert_eq!(&buf[..], &frame[..]);
    }

    #[tokio::test]
    async fn test_read_frame_without_body() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&frame_with_body(b"")).await.unwrap();

        let cancel = CancellationToken::new();
        let mut buf = BytesMut::new();
        read_frame(&mut server, &mut buf, &cancel, None, None, "test", 1)
            .await
            .unwrap();

        assert_eq!(buf.len(), HEADER_LEN);
    }

    #[tokio::test]
    async fn test_read_two_frames_reuses_buffer() {
        let (mut client, mut server) = duplex(1024);
        let first = frame_with_body(b"0123456789");
        let second = frame_with_body(b"");
        client.write_all(&first).await.unwrap();
        client.write_all(&second).await.unwrap();

        let cancel = CancellationToken::new();
        let mut buf = BytesMut::new();

        read_frame(&mut server, &mut buf, &cancel, None, None, "test", 1)
            .await
            .unwrap();
        assert_eq!(&buf[..], &first[..]);

        read_frame(&mut server, &mut buf, &cancel, None, None, "test", 1)
            .await
            .unwrap();
        assert_eq!(&buf[..], &second[..]);
    }

    #[tokio::test]
    async fn test_read_frame_eof_at_start() {
        let (client, mut server) = duplex(1024);
        drop(client);

        let cancel = CancellationToken::new();
        let mut buf = BytesMut::new();
        let err = read_frame(&mut server, &mut buf, &cancel, None, None, "test", 1)
            .await
            .unwrap_err();
        assert!(err.is_eof());
    }

    #[tokio::test]
    async fn test_read_frame_incomplete_header() {
        let (mut client, mut server) = duplex(1024);
        client.write_all(&[0x80, 0x00, 0x00]).await.unwrap();
        drop(client);

        let cancel = CancellationToken::new();
        let mut buf = BytesMut::new();
        let err = read_frame(&mut server, &mut buf, &cancel, None, None, "test", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::IncompleteHeader { .. }));
    }

    #[tokio::test]
    async fn test_read_frame_incomplete_body() {
        let (mut client, mut server) = duplex(1024);
        let frame = frame_with_body(b"0123456789");
        client.write_all(&frame[..HEADER_LEN + 4]).await.unwrap();
        drop(client);

        let cancel = CancellationToken::new();
        let mut buf = BytesMut::new();
        let err = read_frame(&mut server, &mut buf, &cancel, None, None, "test", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::IncompleteBody { .. }));
    }

    #[tokio::test]
    async fn test_read_frame_timeout_on_quiescent_peer() {
        let (_client, mut server) = duplex(1024);

        let cancel = CancellationToken::new();
        let mut buf = BytesMut::new();
        let err = read_frame(
            &mut server,
            &mut buf,
            &cancel,
            Some(Duration::from_millis(50)),
            None,
            "test",
            1,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, WireError::Timeout { op: "read", .. }));
    }

    #[tokio::test]
    async fn test_read_frame_precancelled() {
        let (_client, mut server) = duplex(1024);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut buf = BytesMut::new();
        let err = read_frame(&mut server, &mut buf, &cancel, None, None, "test", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_kill_aborts_read_before_timeout() {
        // a 10s read timeout must not delay the abort
        let (_client, mut server) = duplex(1024);
        let cancel = CancellationToken::new();

        let killer = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            killer.cancel();
        });

        let started = Instant::now();
        let mut buf = BytesMut::new();
        let err = read_frame(
            &mut server,
            &mut buf,
            &cancel,
            Some(Duration::from_secs(10)),
            None,
            "test",
            1,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, WireError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_write_frame_round_trip_verbatim() {
        let (mut client, mut server) = duplex(1024);
        let frame = frame_with_body(b"payload bytes");

        let cancel = CancellationToken::new();
        write_frame(&mut client, &frame, &cancel, None, None, "test", 1)
            .await
            .unwrap();

        let mut buf = BytesMut::new();
        read_frame(&mut server, &mut buf, &cancel, None, None, "test", 2)
            .await
            .unwrap();
        assert_eq!(&buf[..], &frame[..]);
    }

    #[tokio::test]
    async fn test_write_frame_precancelled_leaves_socket_open() {
        let (mut client, mut server) = duplex(1024);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = write_frame(&mut client, b"x", &cancel, None, None, "test", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::Cancelled { .. }));

        // the socket was not shut down: a later write still lands
        let open = CancellationToken::new();
        let frame = frame_with_body(b"");
        write_frame(&mut client, &frame, &open, None, None, "test", 1)
            .await
            .unwrap();
        let mut buf = BytesMut::new();
        read_frame(&mut server, &mut buf, &open, None, None, "test", 2)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_write_frame_failure_after_peer_gone() {
        let (mut client, server) = duplex(16);
        drop(server);

        let cancel = CancellationToken::new();
        let frame = frame_with_body(b"0123456789");
        let err = write_frame(&mut client, &frame, &cancel, None, None, "test", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, WireError::WriteFailed { .. }));
    }
}
