//! Output of a container process.
//!
//! The log keeps recent events for late attachers and feeds every attacher
//! through its own cursor. Entries past [`OUTPUT_HISTORY_LIMIT`] are dropped
//! only once every live attacher has read them; until then writers wait,
//! which stalls the process on its output pipe instead of losing output.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use garden_common::constants::OUTPUT_HISTORY_LIMIT;
use garden_common::types::ProcessEvent;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

/// Events an attacher copies out of the log at a time, and the depth of
/// its channel.
const ATTACH_BATCH: usize = 64;

#[derive(Debug, Default)]
struct Entries {
    events: VecDeque<ProcessEvent>,
    /// Sequence number of the oldest retained event.
    first: u64,
    /// Sequence number the next event gets.
    end: u64,
    bytes: usize,
    /// Next sequence number per attacher.
    cursors: HashMap<u64, u64>,
    next_attacher: u64,
}

impl Entries {
    fn append(&mut self, event: ProcessEvent) {
        self.bytes += payload_len(&event);
        self.events.push_back(event);
        self.end += 1;
        self.evict();
    }

    fn evict(&mut self) {
        let pinned = self.cursors.values().min().copied().unwrap_or(self.end);
        while self.bytes > OUTPUT_HISTORY_LIMIT && self.first < pinned {
            let Some(oldest) = self.events.pop_front() else {
                break;
            };
            self.bytes -= payload_len(&oldest);
            self.first += 1;
        }
    }

    fn full(&self) -> bool {
        self.bytes > OUTPUT_HISTORY_LIMIT
    }

    fn read(&self, from: u64) -> Vec<ProcessEvent> {
        let skip = usize::try_from(from.saturating_sub(self.first)).unwrap_or(usize::MAX);
        self.events.iter().skip(skip).take(ATTACH_BATCH).cloned().collect()
    }
}

const fn payload_len(event: &ProcessEvent) -> usize {
    match event {
        ProcessEvent::Stdout { data } | ProcessEvent::Stderr { data } => data.len(),
        ProcessEvent::Exited { .. } => 0,
    }
}

/// Replayable output of one process.
#[derive(Debug)]
pub struct OutputLog {
    entries: Mutex<Entries>,
    appended: watch::Sender<u64>,
    consumed: watch::Sender<()>,
}

impl Default for OutputLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            appended: watch::channel(0).0,
            consumed: watch::channel(()).0,
        }
    }

    /// Appends output, waiting while the log is over its limit with
    /// entries an attacher has not read yet.
    pub async fn push(&self, event: ProcessEvent) {
        let mut consumed = self.consumed.subscribe();
        loop {
            {
                let mut entries = self.entries.lock();
                entries.evict();
                if !entries.full() {
                    entries.append(event);
                    let _ = self.appended.send_replace(entries.end);
                    return;
                }
            }
            if consumed.changed().await.is_err() {
                return;
            }
        }
    }

    /// Appends the exit event. Never waits.
    pub fn finish(&self, status: i32) {
        let mut entries = self.entries.lock();
        entries.append(ProcessEvent::Exited { status });
        let _ = self.appended.send_replace(entries.end);
    }

    /// Bytes of output currently retained.
    #[must_use]
    pub fn retained_bytes(&self) -> usize {
        self.entries.lock().bytes
    }

    /// Streams every retained event followed by live output.
    ///
    /// The attacher holds its place from the moment this returns. The
    /// channel ends after [`ProcessEvent::Exited`]; dropping the receiver
    /// releases the place.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn attach(self: &Arc<Self>) -> mpsc::Receiver<ProcessEvent> {
        let id = {
            let mut entries = self.entries.lock();
            let id = entries.next_attacher;
            entries.next_attacher += 1;
            let first = entries.first;
            let _ = entries.cursors.insert(id, first);
            id
        };
        let (tx, rx) = mpsc::channel(ATTACH_BATCH);
        let cursor = Cursor {
            log: Arc::clone(self),
            id,
        };
        let _ = tokio::spawn(cursor.forward(tx));
        rx
    }

    fn read(&self, id: u64) -> Vec<ProcessEvent> {
        let entries = self.entries.lock();
        entries
            .cursors
            .get(&id)
            .map(|next| entries.read(*next))
            .unwrap_or_default()
    }

    fn advance(&self, id: u64) {
        if let Some(next) = self.entries.lock().cursors.get_mut(&id) {
            *next += 1;
        }
        let _ = self.consumed.send_replace(());
    }
}

/// One attacher's place in the log.
struct Cursor {
    log: Arc<OutputLog>,
    id: u64,
}

impl Cursor {
    async fn forward(self, tx: mpsc::Sender<ProcessEvent>) {
        let mut appended = self.log.appended.subscribe();
        loop {
            let batch = self.log.read(self.id);
            if batch.is_empty() {
                tokio::select! {
                    changed = appended.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    () = tx.closed() => return,
                }
                continue;
            }
            for event in batch {
                let last = matches!(event, ProcessEvent::Exited { .. });
                if tx.send(event).await.is_err() {
                    return;
                }
                self.log.advance(self.id);
                if last {
                    return;
                }
            }
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let _ = self.log.entries.lock().cursors.remove(&self.id);
        let _ = self.log.consumed.send_replace(());
    }
}
