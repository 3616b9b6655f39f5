use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fleet_wire::{FRAME_HEADER_LEN, decode_envelope, frame_len};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use super::{INBOUND_DEPTH, Inbound, Link, OUTBOUND_DEPTH, next_link_id};
use crate::error::ProtocolError;

/// Splits `stream` into reader and writer tasks speaking length-prefixed
/// envelopes. Either task ending closes the whole link.
pub fn spawn_link<S>(stream: S, peer: impl Into<String>, write_timeout: Duration) -> (Link, Inbound)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = next_link_id();
    let peer: Arc<str> = Arc::from(peer.into());
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Bytes>(OUTBOUND_DEPTH);
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_DEPTH);
    let (closed_tx, closed_rx) = watch::channel(false);
    let closed_tx = Arc::new(closed_tx);
    let (mut reader, mut writer) = tokio::io::split(stream);

    let read_closed = closed_tx.clone();
    let mut read_shutdown = closed_rx.clone();
    let read_peer = peer.clone();
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = wait_closed(&mut read_shutdown) => break,
                frame = read_frame(&mut reader) => frame,
            };
            let item = match frame {
                Ok(Some(body)) => decode_envelope(&body).map_err(ProtocolError::Malformed),
                Ok(None) => {
                    debug!(target = "fleet::transport", link_id = id, peer = %read_peer, "peer closed stream");
                    break;
                }
                Err(ReadError::Io(err)) => {
                    debug!(target = "fleet::transport", link_id = id, peer = %read_peer, error = %err, "read failed");
                    break;
                }
                Err(ReadError::Frame(err)) => {
                    // The prefix is unusable so the stream cannot be resynchronised.
                    let _ = inbound_tx.send(Err(ProtocolError::Malformed(err))).await;
                    break;
                }
            };
            if inbound_tx.send(item).await.is_err() {
                break;
            }
        }
        read_closed.send_replace(true);
    });

    let write_closed = closed_tx.clone();
    let mut write_shutdown = closed_rx;
    let write_peer = peer.clone();
    tokio::spawn(async move {
        loop {
            // Frames queued before close() still go out.
            let frame = tokio::select! {
                biased;
                frame = outbound_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = wait_closed(&mut write_shutdown) => break,
            };
            let write = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            };
            match tokio::time::timeout(write_timeout, write).await {
                Ok(Ok(())) => trace!(target = "fleet::transport", link_id = id, bytes = frame.len(), "frame written"),
                Ok(Err(err)) => {
                    debug!(target = "fleet::transport", link_id = id, peer = %write_peer, error = %err, "write failed");
                    break;
                }
                Err(_) => {
                    debug!(target = "fleet::transport", link_id = id, peer = %write_peer, "write timed out");
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
        write_closed.send_replace(true);
    });

    let link = Link {
        id,
        peer,
        outbound: outbound_tx,
        write_timeout,
        closed: closed_tx,
    };
    let inbound = Inbound {
        link_id: id,
        rx: inbound_rx,
    };
    (link, inbound)
}

enum ReadError {
    Io(std::io::Error),
    Frame(fleet_wire::WireError),
}

/// Reads one frame body; `Ok(None)` on a clean end of stream between frames.
async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ReadError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(ReadError::Io(err)),
    }
    let len = frame_len(header).map_err(ReadError::Frame)?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(ReadError::Io)?;
    Ok(Some(body))
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    // An error means every sender is gone, which only happens once the link is dropped.
    let _ = rx.wait_for(|closed| *closed).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_pipe;

    #[test_timeout::tokio_timeout_test(10)]
    async fn garbage_prefix_surfaces_malformed_then_closes() {
        let (mut raw, theirs) = memory_pipe();
        let (_link, mut inbound) = spawn_link(theirs, "peer", Duration::from_secs(1));

        raw.write_all(&u32::MAX.to_be_bytes()).await.expect("write");
        match inbound.recv().await {
            Some(Err(ProtocolError::Malformed(_))) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(inbound.recv().await.is_none());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn undecodable_body_keeps_link_open() {
        let (mut raw, theirs) = memory_pipe();
        let (_link, mut inbound) = spawn_link(theirs, "peer", Duration::from_secs(1));

        raw.write_all(&3u32.to_be_bytes()).await.expect("write");
        raw.write_all(&[0xff, 0x00, 0x01]).await.expect("write");
        assert!(matches!(inbound.recv().await, Some(Err(ProtocolError::Malformed(_)))));

        let envelope = fleet_wire::Envelope::new("n", 1, fleet_wire::Message::Heartbeat { node_time_us: 5 });
        let frame = fleet_wire::encode_frame(&envelope).expect("frame");
        raw.write_all(&frame).await.expect("write");
        let decoded = inbound.recv().await.expect("open").expect("decoded");
        assert_eq!(decoded, envelope);
    }
}
