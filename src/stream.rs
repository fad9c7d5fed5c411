//! Event stream reader.
//!
//! Turns the body of a `/download` response into [`TransferEvent`]s, one per
//! line, skipping lines it does not understand. Every read is bounded by the
//! idle and overall limits and aborts as soon as the import is cancelled.

use std::collections::VecDeque;
use std::fmt::Display;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use relay_protocol::{decode_line, LineBuffer, LineDecode, SkipReason, TransferEvent};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::timeout::{TimeoutConfig, TimeoutEnforcer, TimeoutStatus};

/// Errors while reading the event stream
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("connection lost while reading events: {0}")]
    Read(String),

    #[error("no events received for {0:?}")]
    IdleTimeout(Duration),

    #[error("event stream exceeded {0:?}")]
    OverallTimeout(Duration),

    #[error("cancelled")]
    Cancelled,
}

/// Reads events from a chunked byte stream.
pub struct EventReader<S> {
    stream: S,
    buffer: LineBuffer,
    lines: VecDeque<String>,
    enforcer: TimeoutEnforcer,
    cancel: CancellationToken,
    finished: bool,
    skipped: usize,
}

impl<S, E> EventReader<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: Display,
{
    pub fn new(stream: S, timeouts: TimeoutConfig, cancel: CancellationToken) -> Self {
        Self {
            stream,
            buffer: LineBuffer::new(),
            lines: VecDeque::new(),
            enforcer: TimeoutEnforcer::new(timeouts),
            cancel,
            finished: false,
            skipped: 0,
        }
    }

    /// Number of non-blank lines skipped so far.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Next event, or `None` once the exporter has closed the stream.
    pub async fn next_event(&mut self) -> Result<Option<TransferEvent>, StreamError> {
        loop {
            while let Some(line) = self.lines.pop_front() {
                match decode_line(&line) {
                    LineDecode::Event(event) => return Ok(Some(event)),
                    LineDecode::Skip(SkipReason::Blank) => {}
                    LineDecode::Skip(reason) => {
                        self.skipped += 1;
                        debug!(?reason, len = line.len(), "skipping line");
                    }
                }
            }

            if self.finished {
                return Ok(None);
            }

            let wait = self.enforcer.next_wait();
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(StreamError::Cancelled),
                next = tokio::time::timeout(wait, self.stream.next()) => next,
            };

            match next {
                Err(_) => return Err(self.timeout_error()),
                Ok(Some(Ok(chunk))) => {
                    self.enforcer.record_activity();
                    self.lines.extend(self.buffer.push(&chunk));
                }
                Ok(Some(Err(err))) => return Err(StreamError::Read(err.to_string())),
                Ok(None) => {
                    self.finished = true;
                    self.lines.extend(self.buffer.finish());
                }
            }
        }
    }

    fn timeout_error(&self) -> StreamError {
        let config = self.enforcer.config();
        match self.enforcer.check() {
            TimeoutStatus::OverallTimeout => {
                StreamError::OverallTimeout(Duration::from_secs(config.overall_seconds))
            }
            _ => StreamError::IdleTimeout(Duration::from_secs(config.idle_event_seconds)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::io;

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Bytes, io::Error>> + Unpin {
        let items: Vec<Result<Bytes, io::Error>> = parts
            .iter()
            .map(|p| Ok(Bytes::copy_from_slice(p.as_bytes())))
            .collect();
        stream::iter(items)
    }

    async fn collect<S>(mut reader: EventReader<S>) -> Vec<TransferEvent>
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Unpin,
    {
        let mut events = Vec::new();
        while let Some(event) = reader.next_event().await.unwrap() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let reader = EventReader::new(
            chunks(&[
                "{\"type\":\"log\",\"mess",
                "age\":\"pulled alpine\"}\n{\"type\":\"size\",\"size\":10",
                "00}\n",
                "{\"type\":\"url\",\"message\":\"http://h:30000/alpine_latest.tar\"}",
            ]),
            TimeoutConfig::default(),
            CancellationToken::new(),
        );

        assert_eq!(
            collect(reader).await,
            vec![
                TransferEvent::log("pulled alpine"),
                TransferEvent::size_known(1000),
                TransferEvent::url_ready("http://h:30000/alpine_latest.tar"),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_lines_are_skipped() {
        let mut reader = EventReader::new(
            chunks(&[
                "not json\n",
                "\n",
                "{\"type\":\"progress\",\"percent\":50}\n",
                "{\"type\":\"log\",\"message\":\"still here\"}\r\n",
            ]),
            TimeoutConfig::default(),
            CancellationToken::new(),
        );

        assert_eq!(
            reader.next_event().await.unwrap(),
            Some(TransferEvent::log("still here"))
        );
        assert_eq!(reader.next_event().await.unwrap(), None);
        assert_eq!(reader.skipped(), 2);
    }

    #[tokio::test]
    async fn test_read_error() {
        let items: Vec<Result<Bytes, io::Error>> = vec![
            Ok(Bytes::from_static(b"{\"type\":\"log\",\"message\":\"a\"}\n")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer")),
        ];
        let mut reader = EventReader::new(
            stream::iter(items),
            TimeoutConfig::default(),
            CancellationToken::new(),
        );

        assert!(reader.next_event().await.unwrap().is_some());
        let err = reader.next_event().await.unwrap_err();
        assert!(matches!(err, StreamError::Read(ref m) if m.contains("reset by peer")));
    }

    #[tokio::test]
    async fn test_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut reader = EventReader::new(
            stream::pending::<Result<Bytes, io::Error>>(),
            TimeoutConfig::default(),
            cancel,
        );
        assert!(matches!(
            reader.next_event().await,
            Err(StreamError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let timeouts = TimeoutConfig {
            overall_seconds: 10,
            idle_event_seconds: 1,
            ..Default::default()
        };
        let mut reader = EventReader::new(
            stream::pending::<Result<Bytes, io::Error>>(),
            timeouts,
            CancellationToken::new(),
        );
        assert!(matches!(
            reader.next_event().await,
            Err(StreamError::IdleTimeout(d)) if d == Duration::from_secs(1)
        ));
    }
}
