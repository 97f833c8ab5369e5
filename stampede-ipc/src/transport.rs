//! Frame transport implementations
//!
//! Links are full duplex, so a transport is a split sink/source pair: the
//! owning connection runs the sink in its writer task and the source in its
//! reader task. Process and network links speak newline-delimited JSON with
//! a protocol version check on receive; the in-process channel transport
//! passes frames directly and backs tests and local mode.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::error::IpcError;
use crate::protocol::{Frame, WireEnvelope, PROTOCOL_VERSION};

/// Sending half of a frame transport
#[async_trait]
pub trait FrameSink: Send {
    /// Send a frame to the other end
    async fn send(&mut self, frame: Frame) -> Result<(), IpcError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), IpcError>;
}

/// Receiving half of a frame transport
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame from the other end
    async fn recv(&mut self) -> Result<Frame, IpcError>;
}

/// A connected sink/source pair.
pub type TransportPair = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Newline-delimited JSON sink over any async writer.
pub struct JsonLineSink<W> {
    writer: W,
}

impl<W> JsonLineSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for JsonLineSink<W> {
    async fn send(&mut self, frame: Frame) -> Result<(), IpcError> {
        let envelope = WireEnvelope::new(frame);
        let json = serde_json::to_string(&envelope)
            .map_err(|e| IpcError::SerializationError(e.to_string()))?;

        // Send with newline delimiter
        let line = format!("{json}\n");
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Newline-delimited JSON source over any buffered async reader.
///
/// The buffer lives in the source so bytes read ahead of a line boundary
/// survive across calls.
pub struct JsonLineSource<R> {
    reader: R,
    line: String,
}

impl<R: AsyncBufRead + Unpin> JsonLineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> FrameSource for JsonLineSource<R> {
    async fn recv(&mut self) -> Result<Frame, IpcError> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 {
                return Err(IpcError::ConnectionClosed);
            }
            let trimmed = self.line.trim_end();
            if trimmed.is_empty() {
                continue;
            }

            let envelope: WireEnvelope = serde_json::from_str(trimmed)?;

            // Check protocol version compatibility
            if !envelope.is_compatible() {
                return Err(IpcError::ProtocolVersionMismatch {
                    expected: PROTOCOL_VERSION,
                    actual: envelope.protocol_version,
                });
            }
            return Ok(envelope.frame);
        }
    }
}

/// Stdin/stdout transport for the worker side of a process link.
pub fn stdio_transport() -> TransportPair {
    (
        Box::new(JsonLineSink::new(tokio::io::stdout())),
        Box::new(JsonLineSource::new(BufReader::new(tokio::io::stdin()))),
    )
}

/// Parent-side transport over a child process' piped stdio.
pub fn child_transport(
    stdin: tokio::process::ChildStdin,
    stdout: tokio::process::ChildStdout,
) -> TransportPair {
    (
        Box::new(JsonLineSink::new(stdin)),
        Box::new(JsonLineSource::new(BufReader::new(stdout))),
    )
}

/// Transport over an established TCP stream (coordinator to agent).
pub fn tcp_transport(stream: TcpStream) -> TransportPair {
    let (read_half, write_half) = stream.into_split();
    (
        Box::new(JsonLineSink::new(write_half)),
        Box::new(JsonLineSource::new(BufReader::new(read_half))),
    )
}

/// In-process sink passing frames over an unbounded channel.
pub struct ChannelSink {
    tx: Option<mpsc::UnboundedSender<Frame>>,
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, frame: Frame) -> Result<(), IpcError> {
        let tx = self.tx.as_ref().ok_or(IpcError::ConnectionClosed)?;
        tx.send(frame).map_err(|_| IpcError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), IpcError> {
        self.tx.take();
        Ok(())
    }
}

/// In-process source reading frames from an unbounded channel.
pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameSource for ChannelSource {
    async fn recv(&mut self) -> Result<Frame, IpcError> {
        self.rx.recv().await.ok_or(IpcError::ConnectionClosed)
    }
}

/// A pair of connected in-process endpoints. Frames sent into one endpoint's
/// sink arrive at the other endpoint's source.
pub fn channel_transport_pair() -> (TransportPair, TransportPair) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let left: TransportPair = (
        Box::new(ChannelSink { tx: Some(a_tx) }),
        Box::new(ChannelSource { rx: b_rx }),
    );
    let right: TransportPair = (
        Box::new(ChannelSink { tx: Some(b_tx) }),
        Box::new(ChannelSource { rx: a_rx }),
    );
    (left, right)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Operation, OperationAck, OperationEnvelope};
    use stampede_core::Address;
    use uuid::Uuid;

    fn ping_frame() -> Frame {
        Frame::Operation(OperationEnvelope::request(
            Address::Coordinator,
            Address::agent(1),
            Operation::Ping,
        ))
    }

    #[tokio::test]
    async fn test_channel_pair_delivers_both_directions() {
        let ((mut left_sink, mut left_source), (mut right_sink, mut right_source)) =
            channel_transport_pair();

        left_sink.send(ping_frame()).await.unwrap();
        let received = right_source.recv().await.unwrap();
        assert!(matches!(received, Frame::Operation(_)));

        right_sink
            .send(Frame::Ack(OperationAck::new(Uuid::new_v4())))
            .await
            .unwrap();
        let received = left_source.recv().await.unwrap();
        assert!(matches!(received, Frame::Ack(_)));
    }

    #[tokio::test]
    async fn test_channel_close_surfaces_connection_closed() {
        let ((mut left_sink, _left_source), (_right_sink, mut right_source)) =
            channel_transport_pair();

        left_sink.close().await.unwrap();
        let err = right_source.recv().await.unwrap_err();
        assert!(matches!(err, IpcError::ConnectionClosed));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_json_line_round_trip_over_duplex() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, _server_write) = tokio::io::split(server);

        let mut sink = JsonLineSink::new(client_write);
        let mut source = JsonLineSource::new(BufReader::new(server_read));
        drop(client_read);

        let frame = ping_frame();
        sink.send(frame.clone()).await.unwrap();
        let received = source.recv().await.unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test]
    async fn test_version_mismatch_is_rejected() {
        let (client, server) = tokio::io::duplex(4096);
        let (_client_read, mut client_write) = tokio::io::split(client);
        let (server_read, _server_write) = tokio::io::split(server);

        let mut envelope = WireEnvelope::new(ping_frame());
        envelope.protocol_version = PROTOCOL_VERSION + 9;
        let line = format!("{}\n", serde_json::to_string(&envelope).unwrap());
        client_write.write_all(line.as_bytes()).await.unwrap();

        let mut source = JsonLineSource::new(BufReader::new(server_read));
        let err = source.recv().await.unwrap_err();
        assert!(matches!(err, IpcError::ProtocolVersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_eof_surfaces_connection_closed() {
        let (client, server) = tokio::io::duplex(64);
        let (server_read, _server_write) = tokio::io::split(server);
        drop(client);

        let mut source = JsonLineSource::new(BufReader::new(server_read));
        let err = source.recv().await.unwrap_err();
        assert!(matches!(err, IpcError::ConnectionClosed));
    }
}
