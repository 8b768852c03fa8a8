//! Worker log capture, query and live subscriptions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use taskhost_core::{LogEntry, LogFilter, RunId};

struct Subscriber {
    filter: LogFilter,
    tx: mpsc::Sender<LogEntry>,
}

#[derive(Default)]
struct LogStoreInner {
    entries: Vec<LogEntry>,
    subscribers: HashMap<u64, Subscriber>,
    next_subscriber_id: u64,
}

/// Append-only buffer of worker output, kept for the life of the process.
///
/// Appending and subscribing share one lock, so a new subscription sees each
/// entry exactly once: either in its backlog or live.
pub struct LogStore {
    inner: Mutex<LogStoreInner>,
    subscriber_capacity: usize,
}

impl LogStore {
    /// Live subscribers buffer up to `subscriber_capacity` entries; beyond that
    /// entries are dropped for that subscriber only.
    pub fn new(subscriber_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LogStoreInner::default()),
            subscriber_capacity: subscriber_capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LogStoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_log(&self, entry: LogEntry) {
        let mut inner = self.lock();

        let mut closed = Vec::new();
        for (id, subscriber) in &inner.subscribers {
            if !subscriber.filter.matches(&entry) {
                continue;
            }
            match subscriber.tx.try_send(entry.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(subscriber = id, log_id = %entry.id, "Log subscriber full, dropping entry");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            inner.subscribers.remove(&id);
        }

        inner.entries.push(entry);
    }

    /// Register a live subscription.
    ///
    /// When the filter has a start time, matching entries already buffered are
    /// delivered first, followed by live entries in append order.
    pub fn log_chan(&self, filter: LogFilter) -> LogSubscription {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let mut inner = self.lock();

        let backlog: VecDeque<LogEntry> = if filter.start_time.is_some() {
            inner
                .entries
                .iter()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect()
        } else {
            VecDeque::new()
        };

        let id = inner.next_subscriber_id;
        inner.next_subscriber_id += 1;
        inner.subscribers.insert(id, Subscriber { filter, tx });

        debug!(subscriber = id, backlog = backlog.len(), "Log subscription added");
        LogSubscription {
            id,
            backlog,
            rx,
            closed: false,
        }
    }

    /// Unregister a subscription. Further reads report it closed.
    pub fn remove_log_chan(&self, subscription: &mut LogSubscription) {
        self.lock().subscribers.remove(&subscription.id);
        subscription.close();
        debug!(subscriber = subscription.id, "Log subscription removed");
    }

    /// Buffered entries matching `filter`, oldest first.
    pub fn get_logs(&self, filter: &LogFilter) -> Vec<LogEntry> {
        self.lock()
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// Live feed of log entries matching a filter.
pub struct LogSubscription {
    id: u64,
    backlog: VecDeque<LogEntry>,
    rx: mpsc::Receiver<LogEntry>,
    closed: bool,
}

impl LogSubscription {
    /// Next entry, or `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<LogEntry> {
        if self.closed {
            return None;
        }
        if let Some(entry) = self.backlog.pop_front() {
            return Some(entry);
        }
        self.rx.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn close(&mut self) {
        self.closed = true;
        self.backlog.clear();
        self.rx.close();
    }
}

/// Where intercepted output is copied besides the log store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Passthrough {
    Stdout,
    Stderr,
    Discard,
}

/// Longest single entry the interceptor buffers before flushing a partial line.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// Records a worker's output stream into the [`LogStore`], one entry per line.
///
/// Incomplete trailing lines are held until a newline or [`finish`](Self::finish).
/// A line longer than [`MAX_LINE_BYTES`] is split into several entries.
pub struct LogInterceptor {
    store: Arc<LogStore>,
    run_id: Option<RunId>,
    passthrough: Passthrough,
    pending: Vec<u8>,
}

impl LogInterceptor {
    pub fn new(store: Arc<LogStore>, run_id: Option<RunId>, passthrough: Passthrough) -> Self {
        Self {
            store,
            run_id,
            passthrough,
            pending: Vec::new(),
        }
    }

    /// Record every complete line in `bytes`. Returns the number of entries added.
    pub fn write(&mut self, bytes: &[u8]) -> usize {
        self.pending.extend_from_slice(bytes);

        let mut added = 0;
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.record(&line[..line.len() - 1]);
            added += 1;
        }
        while self.pending.len() >= MAX_LINE_BYTES {
            let cut = utf8_boundary(&self.pending[..MAX_LINE_BYTES]);
            let chunk: Vec<u8> = self.pending.drain(..cut).collect();
            self.record(&chunk);
            added += 1;
        }
        added
    }

    /// Record any buffered partial line.
    pub fn finish(&mut self) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.record(&line);
        }
    }

    fn record(&self, line: &[u8]) {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let message = String::from_utf8_lossy(line);
        self.store
            .add_log(LogEntry::new(self.run_id.clone(), message.into_owned()));
    }

    /// Copy `reader` to the passthrough target and the store until EOF.
    pub async fn pump<R>(mut self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; 8 * 1024];
        let mut echo_failed = false;

        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    warn!(run_id = ?self.run_id.as_ref().map(RunId::as_str), error = %e, "Failed to read worker output");
                    break;
                }
            };

            if !echo_failed {
                if let Err(e) = self.echo(&buf[..n]).await {
                    debug!(error = %e, "Worker output passthrough failed, disabling");
                    echo_failed = true;
                }
            }
            self.write(&buf[..n]);
        }

        self.finish();
    }

    async fn echo(&self, bytes: &[u8]) -> std::io::Result<()> {
        match self.passthrough {
            Passthrough::Stdout => {
                let mut out = tokio::io::stdout();
                out.write_all(bytes).await?;
                out.flush().await
            }
            Passthrough::Stderr => {
                let mut err = tokio::io::stderr();
                err.write_all(bytes).await?;
                err.flush().await
            }
            Passthrough::Discard => Ok(()),
        }
    }
}

/// Length of `bytes` without a multi-byte character cut off at the end.
fn utf8_boundary(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => e.valid_up_to(),
        _ => bytes.len(),
    }
}
