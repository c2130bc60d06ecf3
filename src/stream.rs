//! Captured job streams.
//!
//! Every job owns one [`StreamCollector`] multiplexing five independent
//! append-only channels. Channels accept records while the job runs and are
//! closed exactly once when the job finalizes; drains never consume records,
//! so repeated reads after completion see the same sequence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_stream::Stream;

use crate::error::StreamError;

/// One of the five captured channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Result objects produced by the script.
    Output,
    /// Error records.
    Error,
    /// Warning records.
    Warning,
    /// Verbose/debug diagnostics.
    Verbose,
    /// Progress reports.
    Progress,
}

impl Channel {
    /// All channels, in a fixed order.
    pub const ALL: [Channel; 5] = [
        Channel::Output,
        Channel::Error,
        Channel::Warning,
        Channel::Verbose,
        Channel::Progress,
    ];

    fn index(self) -> usize {
        match self {
            Self::Output => 0,
            Self::Error => 1,
            Self::Warning => 2,
            Self::Verbose => 3,
            Self::Progress => 4,
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Output => "output",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Verbose => "verbose",
            Self::Progress => "progress",
        };
        write!(f, "{s}")
    }
}

/// A single captured record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record payload.
    pub value: serde_json::Value,
    /// When the record was emitted.
    pub at: DateTime<Utc>,
}

impl Record {
    /// Create a record from a plain string.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            value: serde_json::Value::String(text.into()),
            at: Utc::now(),
        }
    }

    /// Create a record from an arbitrary JSON value.
    pub fn value(value: serde_json::Value) -> Self {
        Self {
            value,
            at: Utc::now(),
        }
    }

    /// Payload as a string slice, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        self.value.as_str()
    }
}

#[derive(Debug, Default)]
struct ChannelBuf {
    records: Vec<Record>,
    /// High-water mark of records handed out through `drain`.
    read: usize,
}

#[derive(Debug)]
struct CollectorInner {
    open: bool,
    channels: [ChannelBuf; 5],
}

/// Per-job multiplexer for the five captured channels.
#[derive(Debug, Clone)]
pub struct StreamCollector {
    inner: Arc<RwLock<CollectorInner>>,
    strict: bool,
}

impl StreamCollector {
    /// Create an open collector. `strict` controls whether appends after
    /// close surface [`StreamError::ChannelClosed`] or are dropped.
    pub fn new(strict: bool) -> Self {
        Self {
            inner: Arc::new(RwLock::new(CollectorInner {
                open: true,
                channels: std::array::from_fn(|_| ChannelBuf::default()),
            })),
            strict,
        }
    }

    /// Append a record to a channel.
    ///
    /// Valid only while the collector is open. Once closed, the record is
    /// dropped (lenient) or rejected (strict).
    pub async fn append(&self, channel: Channel, record: Record) -> Result<(), StreamError> {
        let mut inner = self.inner.write().await;
        if !inner.open {
            if self.strict {
                return Err(StreamError::ChannelClosed {
                    channel: channel.to_string(),
                });
            }
            tracing::warn!(%channel, "Record dropped: channel closed");
            return Ok(());
        }
        inner.channels[channel.index()].records.push(record);
        Ok(())
    }

    /// Close all channels. Further appends are rejected or dropped.
    pub async fn close(&self) {
        self.inner.write().await.open = false;
    }

    /// Whether the collector has been closed.
    pub async fn is_closed(&self) -> bool {
        !self.inner.read().await.open
    }

    /// Full recorded sequence of a channel, in emission order.
    ///
    /// Does not remove records; repeated drains return identical sequences.
    /// Marks the channel as read up to its current end.
    pub async fn drain(&self, channel: Channel) -> Vec<Record> {
        let mut inner = self.inner.write().await;
        let buf = &mut inner.channels[channel.index()];
        buf.read = buf.records.len();
        buf.records.clone()
    }

    /// Lazy iteration surface over a channel's current records.
    pub async fn drain_stream(&self, channel: Channel) -> impl Stream<Item = Record> {
        tokio_stream::iter(self.drain(channel).await)
    }

    /// Number of records currently captured on a channel.
    pub async fn len(&self, channel: Channel) -> usize {
        self.inner.read().await.channels[channel.index()].records.len()
    }

    /// Whether the error channel holds any record.
    pub async fn has_errors(&self) -> bool {
        self.len(Channel::Error).await > 0
    }

    /// Whether any channel holds records not yet handed out through `drain`.
    pub async fn has_unread(&self) -> bool {
        let inner = self.inner.read().await;
        inner.channels.iter().any(|b| b.records.len() > b.read)
    }

    /// Cheap append handle for the interpreter side.
    pub fn sink(&self) -> StreamSink {
        StreamSink {
            collector: self.clone(),
        }
    }
}

/// Append handle handed to the interpreter while a job runs.
#[derive(Debug, Clone)]
pub struct StreamSink {
    collector: StreamCollector,
}

impl StreamSink {
    /// Emit a result object.
    pub async fn output(&self, value: serde_json::Value) -> Result<(), StreamError> {
        self.collector.append(Channel::Output, Record::value(value)).await
    }

    /// Emit a result string.
    pub async fn output_text(&self, text: impl Into<String>) -> Result<(), StreamError> {
        self.collector.append(Channel::Output, Record::text(text)).await
    }

    /// Emit an error record.
    pub async fn error(&self, message: impl Into<String>) -> Result<(), StreamError> {
        self.collector.append(Channel::Error, Record::text(message)).await
    }

    /// Emit a warning record.
    pub async fn warning(&self, message: impl Into<String>) -> Result<(), StreamError> {
        self.collector.append(Channel::Warning, Record::text(message)).await
    }

    /// Emit a verbose/debug record.
    pub async fn verbose(&self, message: impl Into<String>) -> Result<(), StreamError> {
        self.collector.append(Channel::Verbose, Record::text(message)).await
    }

    /// Emit a progress record.
    pub async fn progress(&self, message: impl Into<String>) -> Result<(), StreamError> {
        self.collector.append(Channel::Progress, Record::text(message)).await
    }
}
