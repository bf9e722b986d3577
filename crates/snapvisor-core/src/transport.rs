use serde_json::Value;
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("stream is closed")]
    Closed,
    #[error("{0} is not piped")]
    NotPiped(&'static str),
}

#[derive(Clone, Debug)]
pub struct MessageSink {
    tx: mpsc::UnboundedSender<Value>,
}

impl MessageSink {
    pub fn send(&self, frame: Value) -> Result<(), StreamError> {
        self.tx.send(frame).map_err(|_| StreamError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub fn message_channel() -> (MessageSink, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MessageSink { tx }, rx)
}

/// A duplex stream of JSON frames.
///
/// Queues are unbounded, so a stalled reader on one logical channel never
/// blocks writers of a sibling channel sharing the same physical transport.
#[derive(Debug)]
pub struct MessageStream {
    sink: MessageSink,
    source: mpsc::UnboundedReceiver<Value>,
}

impl MessageStream {
    pub fn from_parts(sink: MessageSink, source: mpsc::UnboundedReceiver<Value>) -> Self {
        Self { sink, source }
    }

    pub fn pair() -> (Self, Self) {
        let (left_sink, right_source) = message_channel();
        let (right_sink, left_source) = message_channel();
        (
            Self::from_parts(left_sink, left_source),
            Self::from_parts(right_sink, right_source),
        )
    }

    pub fn send(&self, frame: Value) -> Result<(), StreamError> {
        self.sink.send(frame)
    }

    pub async fn recv(&mut self) -> Option<Value> {
        self.source.recv().await
    }

    pub fn sink(&self) -> MessageSink {
        self.sink.clone()
    }

    pub fn split(self) -> (MessageSink, mpsc::UnboundedReceiver<Value>) {
        (self.sink, self.source)
    }
}

pub struct StdioTransport {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl StdioTransport {
    pub fn attach(child: &mut Child) -> Result<(Self, MessageStream), StreamError> {
        if child.stdin.is_none() {
            return Err(StreamError::NotPiped("worker stdin"));
        }
        let Some(stdout) = child.stdout.take() else {
            return Err(StreamError::NotPiped("worker stdout"));
        };
        let Some(stdin) = child.stdin.take() else {
            return Err(StreamError::NotPiped("worker stdin"));
        };
        Ok(Self::from_io(stdout, stdin))
    }

    pub fn from_io<R, W>(reader: R, writer: W) -> (Self, MessageStream)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (inbound_sink, inbound_source) = message_channel();
        let (outbound_sink, outbound_source) = message_channel();

        let reader = tokio::spawn(read_frames(reader, inbound_sink));
        let writer = tokio::spawn(write_frames(writer, outbound_source));

        (
            Self { reader, writer },
            MessageStream::from_parts(outbound_sink, inbound_source),
        )
    }

    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_frames<R: AsyncRead + Unpin>(reader: R, inbound: MessageSink) {
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                tracing::debug!("worker output closed");
                break;
            }
            Ok(_) => {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                match serde_json::from_slice::<Value>(&line) {
                    Ok(frame) => {
                        if inbound.send(frame).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, bytes = line.len(), "dropping unparseable worker frame");
                    }
                }
            }
            Err(err) if is_benign_close(&err) => {
                tracing::debug!(error = %err, "worker output closed during teardown");
                break;
            }
            Err(err) => {
                tracing::warn!(error = %err, "read worker output failed");
                break;
            }
        }
    }
}

async fn write_frames<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Value>,
) {
    while let Some(frame) = outbound.recv().await {
        let mut payload = match serde_json::to_vec(&frame) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "serialize worker frame failed");
                continue;
            }
        };
        payload.push(b'\n');

        let written = match writer.write_all(&payload).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            if is_benign_close(&err) {
                tracing::debug!(error = %err, "worker input closed during teardown");
            } else {
                tracing::warn!(error = %err, "write worker input failed");
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}

pub(crate) fn is_benign_close(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn memory_pair_delivers_frames_both_ways() {
        let (mut host, mut worker) = MessageStream::pair();

        host.send(json!({"hello": "worker"})).expect("send to worker");
        worker.send(json!({"hello": "host"})).expect("send to host");

        assert_eq!(worker.recv().await, Some(json!({"hello": "worker"})));
        assert_eq!(host.recv().await, Some(json!({"hello": "host"})));
    }

    #[tokio::test]
    async fn dropping_one_end_closes_the_other() {
        let (mut host, worker) = MessageStream::pair();
        let sink = worker.sink();
        drop(worker);
        drop(sink);

        assert_eq!(host.recv().await, None);
        assert_eq!(host.send(json!(1)), Err(StreamError::Closed));
    }

    #[tokio::test]
    async fn stdio_transport_writes_newline_delimited_frames() {
        let (host_side, mut worker_side) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (_transport, stream) = StdioTransport::from_io(host_read, host_write);

        stream
            .send(json!({"name": "command", "data": {"id": 1}}))
            .expect("queue frame");

        let mut buf = vec![0u8; 256];
        let read = worker_side.read(&mut buf).await.expect("read frame");
        let text = std::str::from_utf8(&buf[..read]).expect("utf8 frame");
        assert!(text.ends_with('\n'));
        let parsed: Value = serde_json::from_str(text.trim()).expect("parse frame");
        assert_eq!(parsed, json!({"name": "command", "data": {"id": 1}}));
    }

    #[tokio::test]
    async fn stdio_transport_skips_unparseable_lines() {
        let (host_side, mut worker_side) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (_transport, mut stream) = StdioTransport::from_io(host_read, host_write);

        worker_side
            .write_all(b"not json\n\n{\"ok\":true}\n")
            .await
            .expect("write worker output");

        assert_eq!(stream.recv().await, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn stdio_transport_skips_non_utf8_lines() {
        let (host_side, mut worker_side) = tokio::io::duplex(4096);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (_transport, mut stream) = StdioTransport::from_io(host_read, host_write);

        worker_side
            .write_all(b"\xff\xfe garbage\n{\"ok\":true}\n")
            .await
            .expect("write worker output");

        assert_eq!(stream.recv().await, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn stdio_transport_ends_stream_on_eof() {
        let (host_side, worker_side) = tokio::io::duplex(64);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (_transport, mut stream) = StdioTransport::from_io(host_read, host_write);

        drop(worker_side);
        assert_eq!(stream.recv().await, None);
    }
}
