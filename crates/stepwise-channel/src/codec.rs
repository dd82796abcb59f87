//! Newline-delimited JSON framing
//!
//! One envelope per line. Malformed lines and stale sequence numbers are
//! logged and dropped; only I/O failures end the stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::ControlMessage;
use crate::sequence::{Admission, Envelope, OrderingGuard, Sequencer};
use crate::ChannelError;

const MAX_LOG_LINE_CHARS: usize = 200;

/// Decode one line into an envelope.
pub fn decode_frame(line: &str) -> Result<Envelope, ChannelError> {
    serde_json::from_str(line).map_err(|err| ChannelError::Malformed(err.to_string()))
}

/// Encode an envelope as one line, newline included.
pub fn encode_frame(envelope: &Envelope) -> Result<String, ChannelError> {
    let mut line =
        serde_json::to_string(envelope).map_err(|err| ChannelError::Encode(err.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Count of frames a reader discarded, shared so owners can observe it.
#[derive(Debug, Clone, Default)]
pub struct DropCounter(Arc<AtomicU64>);

impl DropCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

pub struct FrameReader<R> {
    reader: R,
    buf: Vec<u8>,
    guard: OrderingGuard,
    dropped: DropCounter,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            guard: OrderingGuard::new(),
            dropped: DropCounter::default(),
        }
    }

    pub fn dropped(&self) -> DropCounter {
        self.dropped.clone()
    }

    /// Stop tracking a finished lane.
    pub fn forget(&mut self, lane: &str) {
        self.guard.forget(lane);
    }

    /// Next deliverable message, or `None` at end of stream.
    ///
    /// Cancel safe: a partly read line stays buffered for the next call.
    pub async fn next(&mut self) -> Result<Option<ControlMessage>, ChannelError> {
        loop {
            let read = self.reader.read_until(b'\n', &mut self.buf).await?;
            if read == 0 && self.buf.is_empty() {
                return Ok(None);
            }
            let bytes = std::mem::take(&mut self.buf);
            let line = match std::str::from_utf8(&bytes) {
                Ok(line) => line,
                Err(err) => {
                    self.dropped.bump();
                    tracing::warn!(
                        bytes = bytes.len(),
                        "dropping frame that is not valid UTF-8: {}",
                        err
                    );
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let envelope = match decode_frame(line.trim_end()) {
                Ok(envelope) => envelope,
                Err(err) => {
                    self.dropped.bump();
                    tracing::warn!(
                        line = %truncate(line.trim_end()),
                        "dropping malformed frame: {}",
                        err
                    );
                    continue;
                }
            };
            match self.guard.admit(&envelope) {
                Admission::Accept => {
                    if envelope.message.closes_lane() {
                        self.guard.forget(envelope.message.lane());
                    }
                    return Ok(Some(envelope.message));
                }
                Admission::Stale { last_seen } => {
                    self.dropped.bump();
                    tracing::warn!(
                        lane = %envelope.message.lane(),
                        kind = envelope.message.kind(),
                        seq = envelope.seq,
                        last_seen,
                        "dropping stale frame"
                    );
                }
            }
        }
    }
}

pub struct FrameWriter<W> {
    writer: W,
    sequencer: Sequencer,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            sequencer: Sequencer::new(),
        }
    }

    /// Sequence, encode and flush one message. Returns the sequence number.
    pub async fn send(&mut self, message: ControlMessage) -> Result<u64, ChannelError> {
        let envelope = self.sequencer.seal(message);
        if envelope.message.closes_lane() {
            self.sequencer.forget(envelope.message.lane());
        }
        let line = encode_frame(&envelope)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(envelope.seq)
    }

    pub async fn shutdown(&mut self) -> Result<(), ChannelError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn truncate(line: &str) -> String {
    let mut chars = line.chars();
    let head: String = chars.by_ref().take(MAX_LOG_LINE_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn cancel(task: &str) -> ControlMessage {
        ControlMessage::Cancel {
            task_id: task.to_string(),
        }
    }

    #[tokio::test]
    async fn test_writer_frames_are_read_back_in_order() {
        let mut buffer = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buffer);
            assert_eq!(writer.send(cancel("a")).await.unwrap(), 1);
            assert_eq!(writer.send(cancel("a")).await.unwrap(), 2);
            assert_eq!(writer.send(ControlMessage::probe()).await.unwrap(), 1);
        }
        let text = String::from_utf8(buffer.clone()).unwrap();
        assert_eq!(text.lines().count(), 3);
        assert!(text.starts_with(r#"{"seq":1,"message":{"kind":"cancel","task_id":"a"}}"#));

        let mut reader = FrameReader::new(BufReader::new(buffer.as_slice()));
        assert_eq!(reader.next().await.unwrap(), Some(cancel("a")));
        assert_eq!(reader.next().await.unwrap(), Some(cancel("a")));
        assert!(matches!(
            reader.next().await.unwrap(),
            Some(ControlMessage::HealthProbe { .. })
        ));
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_drops_malformed_and_stale_frames() {
        let input = concat!(
            "{\"seq\":1,\"message\":{\"kind\":\"cancel\",\"task_id\":\"a\"}}\n",
            "not json at all\n",
            "\n",
            "{\"seq\":2,\"message\":{\"kind\":\"launch_missiles\"}}\n",
            "{\"seq\":1,\"message\":{\"kind\":\"cancel\",\"task_id\":\"a\"}}\n",
            "{\"seq\":1,\"message\":{\"kind\":\"cancel\",\"task_id\":\"b\"}}\n",
        );
        let mut reader = FrameReader::new(BufReader::new(input.as_bytes()));
        let dropped = reader.dropped();

        assert_eq!(reader.next().await.unwrap(), Some(cancel("a")));
        assert_eq!(reader.next().await.unwrap(), Some(cancel("b")));
        assert_eq!(reader.next().await.unwrap(), None);
        assert_eq!(dropped.get(), 3);
    }

    #[tokio::test]
    async fn test_lane_restarts_after_completion() {
        let plan = stepwise_core::types::Plan::new("a", "", Vec::new());
        let summary = stepwise_core::types::RunSummary::rejected(&plan, "bad plan");
        let mut buffer = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buffer);
            assert_eq!(writer.send(cancel("a")).await.unwrap(), 1);
            assert_eq!(
                writer.send(ControlMessage::Completion(summary.clone())).await.unwrap(),
                2
            );
            assert_eq!(writer.send(cancel("a")).await.unwrap(), 1);
        }

        let mut reader = FrameReader::new(BufReader::new(buffer.as_slice()));
        let dropped = reader.dropped();
        assert_eq!(reader.next().await.unwrap(), Some(cancel("a")));
        assert_eq!(
            reader.next().await.unwrap(),
            Some(ControlMessage::Completion(summary))
        );
        assert_eq!(reader.next().await.unwrap(), Some(cancel("a")));
        assert_eq!(reader.next().await.unwrap(), None);
        assert_eq!(dropped.get(), 0);
    }

    #[tokio::test]
    async fn test_reader_survives_invalid_utf8_line() {
        let mut input = vec![0xff, 0xfe, b'\n'];
        input.extend_from_slice(b"{\"seq\":1,\"message\":{\"kind\":\"cancel\",\"task_id\":\"a\"}}\n");
        input.extend_from_slice(b"{\"seq\":2,\"message\":{\"kind\":\"cancel\",\"task_id\":\"a\"}}");
        let mut reader = FrameReader::new(BufReader::new(input.as_slice()));
        let dropped = reader.dropped();

        assert_eq!(reader.next().await.unwrap(), Some(cancel("a")));
        // Final line without a trailing newline is still delivered.
        assert_eq!(reader.next().await.unwrap(), Some(cancel("a")));
        assert_eq!(reader.next().await.unwrap(), None);
        assert_eq!(dropped.get(), 1);
    }

    #[test]
    fn test_decode_frame_reports_malformed() {
        assert!(matches!(
            decode_frame("{\"seq\":\"one\"}"),
            Err(ChannelError::Malformed(_))
        ));
    }
}
