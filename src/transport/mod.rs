//! # Framed Peer Transport
//!
//! Carries [`Envelope`]s over TCP or Unix-domain-socket connections with
//! in-order, reliable, per-connection delivery. Frames are length-prefixed
//! (4-byte little-endian) bincode envelopes with a 16 MiB hard cap;
//! oversized frames are a protocol violation that drops the connection.
//!
//! ## Back-pressure
//!
//! Every outgoing connection owns a bounded envelope queue drained by a
//! dedicated writer task. Senders on the runtime use `try_send`; when the
//! queue is full, reliable traffic surfaces a transport error to the
//! caller while best-effort traffic (log forwarding) is dropped with a
//! warning. Senders off the runtime block cooperatively.

pub mod domain_socket;
pub mod tcp;

use crate::error::{IbError, IbResult};
use crate::types::ParticipantId;
use crate::wire::Envelope;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Upper bound for a single wire frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Depth of the per-connection outgoing queue.
pub const SEND_QUEUE_DEPTH: usize = 1024;

/// Socket options applied to every TCP connection, from the middleware
/// configuration.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub no_delay: bool,
    pub quick_ack: bool,
    pub send_buffer_size: Option<usize>,
    pub receive_buffer_size: Option<usize>,
}

impl From<&crate::config::MiddlewareConfig> for SocketOptions {
    fn from(config: &crate::config::MiddlewareConfig) -> Self {
        Self {
            no_delay: config.tcp_no_delay,
            quick_ack: config.tcp_quick_ack,
            send_buffer_size: config.tcp_send_buffer_size,
            receive_buffer_size: config.tcp_receive_buffer_size,
        }
    }
}

/// Delivery policy of one send on a bounded connection queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeliveryPolicy {
    /// Must not be dropped; a full queue is an error surfaced to the caller
    Reliable,
    /// May be dropped under congestion (log forwarding)
    BestEffort,
}

/// A connected stream to one peer, over either transport.
pub(crate) enum PeerStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

impl PeerStream {
    /// Split into independently owned read and write halves.
    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            PeerStream::Tcp(stream) => {
                let (reader, writer) = stream.into_split();
                (Box::new(reader), Box::new(writer))
            }
            #[cfg(unix)]
            PeerStream::Unix(stream) => {
                let (reader, writer) = stream.into_split();
                (Box::new(reader), Box::new(writer))
            }
        }
    }
}

/// Read one length-prefixed envelope.
pub(crate) async fn read_envelope<R: AsyncRead + Unpin>(reader: &mut R) -> IbResult<Envelope> {
    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes).await?;
    let frame_length = u32::from_le_bytes(length_bytes) as usize;

    if frame_length > MAX_FRAME_SIZE {
        return Err(IbError::Protocol(format!(
            "frame of {frame_length} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
        )));
    }

    let mut frame = vec![0u8; frame_length];
    reader.read_exact(&mut frame).await?;
    Envelope::from_bytes(&frame)
}

/// Write one length-prefixed envelope and flush.
pub(crate) async fn write_envelope<W: AsyncWrite + Unpin>(
    writer: &mut W,
    envelope: &Envelope,
) -> IbResult<()> {
    let frame = envelope.to_bytes()?;
    if frame.len() > MAX_FRAME_SIZE {
        return Err(IbError::Protocol(format!(
            "refusing to send a {} byte frame",
            frame.len()
        )));
    }
    writer.write_all(&(frame.len() as u32).to_le_bytes()).await?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Sending handle for one peer connection.
///
/// The writer task owns the socket's write half and drains the bounded
/// queue; the handle is cheap to clone and safe to use from the dispatch
/// task and from user threads alike.
#[derive(Clone)]
pub(crate) struct PeerLink {
    pub participant_id: ParticipantId,
    pub participant_name: String,
    tx: mpsc::Sender<Envelope>,
}

impl PeerLink {
    /// Spawn the writer task for a connection and return the handle.
    pub fn spawn(
        participant_id: ParticipantId,
        participant_name: String,
        mut writer: BoxedWriter,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Envelope>(SEND_QUEUE_DEPTH);
        let peer = participant_name.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(error) = write_envelope(&mut writer, &envelope).await {
                    warn!("write to peer '{}' failed: {}", peer, error);
                    break;
                }
            }
            let _ = writer.shutdown().await;
            debug!("writer task for peer '{}' finished", peer);
        });
        Self {
            participant_id,
            participant_name,
            tx,
        }
    }

    /// Enqueue an envelope according to the delivery policy.
    pub fn send(&self, envelope: Envelope, policy: DeliveryPolicy) -> IbResult<()> {
        match self.tx.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(IbError::Transport(format!(
                "connection to '{}' is closed",
                self.participant_name
            ))),
            Err(mpsc::error::TrySendError::Full(envelope)) => match policy {
                DeliveryPolicy::BestEffort => {
                    warn!(
                        "dropping best-effort message to '{}' (queue full)",
                        self.participant_name
                    );
                    Ok(())
                }
                DeliveryPolicy::Reliable => {
                    if tokio::runtime::Handle::try_current().is_err() {
                        // Off the runtime we may block cooperatively.
                        self.tx.blocking_send(envelope).map_err(|_| {
                            IbError::Transport(format!(
                                "connection to '{}' is closed",
                                self.participant_name
                            ))
                        })
                    } else {
                        Err(IbError::Transport(format!(
                            "outgoing queue to '{}' is full (back-pressure)",
                            self.participant_name
                        )))
                    }
                }
            },
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EndpointAddress;
    use crate::wire::{Payload, RegistryRejection};

    fn sample_envelope() -> Envelope {
        Envelope {
            interface_id: crate::wire::interface_ids::CONTROL,
            sender: EndpointAddress::new(1, 0),
            sequence: 1,
            timestamp_ns: 42,
            link: None,
            recipient: None,
            payload: Payload::RegistryRejection(RegistryRejection {
                reason: "test".to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_framing_round_trip() {
        let envelope = sample_envelope();
        let mut buffer = Vec::new();
        write_envelope(&mut buffer, &envelope).await.unwrap();

        // 4-byte little-endian length prefix
        let length = u32::from_le_bytes(buffer[0..4].try_into().unwrap()) as usize;
        assert_eq!(length, buffer.len() - 4);

        let mut cursor = std::io::Cursor::new(buffer);
        let decoded = read_envelope(&mut cursor).await.unwrap();
        assert_eq!(decoded.sender, envelope.sender);
        assert_eq!(decoded.timestamp_ns, 42);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_a_protocol_error() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&(MAX_FRAME_SIZE as u32 + 1).to_le_bytes());
        let mut cursor = std::io::Cursor::new(buffer);
        let result = read_envelope(&mut cursor).await;
        assert!(matches!(result, Err(IbError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_a_transport_error() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&100u32.to_le_bytes());
        buffer.extend_from_slice(&[1, 2, 3]); // far fewer than 100 bytes
        let mut cursor = std::io::Cursor::new(buffer);
        let result = read_envelope(&mut cursor).await;
        assert!(matches!(result, Err(IbError::Transport(_))));
    }
}
