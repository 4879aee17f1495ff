use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    Supervisor,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::Supervisor => "supervisor",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent {
    pub server: String,
    pub stream: LogStream,
    pub line: String,
    pub timestamp: i64,
}

/// Fan-out for child process output: every line is mirrored to
/// tracing, broadcast to live subscribers, and kept in a bounded ring
/// (drop-oldest) so `logs.tail` can replay recent output. The pump
/// tasks never block on slow consumers.
pub struct LogSink {
    tx: broadcast::Sender<LogEvent>,
    ring: Mutex<VecDeque<LogEvent>>,
    capacity: usize,
}

impl LogSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self {
            tx,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn publish(&self, server: &str, stream: LogStream, line: String) {
        info!(server, stream = stream.as_str(), "{line}");
        let event = LogEvent {
            server: server.to_string(),
            stream,
            line,
            timestamp: OffsetDateTime::now_utc().unix_timestamp(),
        };
        {
            let mut ring = self.ring.lock();
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(event.clone());
        }
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.tx.subscribe()
    }

    /// Most recent `n` events, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEvent> {
        let ring = self.ring.lock();
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }
}
