//! Replay cache: the response produced for each accepted payment id.
//!
//! A second presentation of the same payment is answered from here with the
//! exact bytes of the first response. Records expire after a TTL and the
//! cache is bounded; above the bound the oldest records are evicted first.
//!
//! [`FileReplayStore`] persists the cache as
//! `{"entries":[[paymentId,{"value":..,"expiresAt":..}],...]}`. Writes are
//! coalesced: a mutation schedules one flush [`FLUSH_DEBOUNCE`] later, and
//! further mutations inside that window ride along with it.

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use scp::UnixTimestamp;
use scp::timestamp::Clock;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;

/// Delay between the first unflushed mutation and the write.
pub const FLUSH_DEBOUNCE: Duration = Duration::from_millis(75);

/// A cached response and when it stops being honoured.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayRecord {
    /// Response bytes, verbatim.
    pub value: Box<RawValue>,
    /// First instant the record is no longer served.
    pub expires_at: UnixTimestamp,
}

/// Idempotency ledger keyed by payment id.
#[async_trait]
pub trait ReplayStore: Send + Sync + Debug {
    /// The cached response for `payment_id`, if still live.
    async fn get(&self, payment_id: &str) -> Option<Box<RawValue>>;

    /// Records the response produced for `payment_id`.
    async fn insert(&self, payment_id: &str, response: Box<RawValue>);

    /// Whether `payment_id` has a live record.
    async fn contains(&self, payment_id: &str) -> bool {
        self.get(payment_id).await.is_some()
    }

    /// Persists anything pending. The store stays usable afterwards.
    async fn close(&self) {}
}

#[derive(Debug)]
struct Slot {
    record: ReplayRecord,
    seq: u64,
}

/// Records plus their insertion order.
#[derive(Debug)]
struct Records {
    map: HashMap<String, Slot>,
    order: VecDeque<(u64, String)>,
    next_seq: u64,
    ttl_secs: u64,
    max_entries: usize,
}

impl Records {
    fn new(ttl_secs: u64, max_entries: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            next_seq: 0,
            ttl_secs: ttl_secs.max(1),
            max_entries: max_entries.max(1),
        }
    }

    /// Looks up a record, dropping it if expired. The flag reports whether
    /// anything was removed.
    fn get(&mut self, key: &str, now: UnixTimestamp) -> (Option<Box<RawValue>>, bool) {
        let Some(slot) = self.map.get(key) else {
            return (None, false);
        };
        if slot.record.expires_at > now {
            return (Some(slot.record.value.clone()), false);
        }
        self.map.remove(key);
        (None, true)
    }

    /// Re-inserting a key refreshes its record but keeps its place in the
    /// eviction order.
    fn insert(&mut self, key: &str, value: Box<RawValue>, now: UnixTimestamp) {
        let record = ReplayRecord {
            value,
            expires_at: now + self.ttl_secs,
        };
        if let Some(slot) = self.map.get_mut(key) {
            slot.record = record;
        } else {
            self.push(key.to_owned(), record);
        }
        self.sweep(now);
    }

    fn push(&mut self, key: String, record: ReplayRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.push_back((seq, key.clone()));
        self.map.insert(key, Slot { record, seq });
    }

    fn is_current(&self, seq: u64, key: &str) -> bool {
        self.map.get(key).is_some_and(|slot| slot.seq == seq)
    }

    fn sweep(&mut self, now: UnixTimestamp) {
        self.map.retain(|_, slot| slot.record.expires_at > now);
        while self.map.len() > self.max_entries {
            let Some((seq, key)) = self.order.pop_front() else {
                break;
            };
            if self.is_current(seq, &key) {
                self.map.remove(&key);
            }
        }
        let map = &self.map;
        self.order
            .retain(|(seq, key)| map.get(key).is_some_and(|slot| slot.seq == *seq));
    }

    /// Live records, oldest first.
    fn entries(&self) -> Vec<(&str, &ReplayRecord)> {
        self.order
            .iter()
            .filter_map(|(seq, key)| {
                self.map
                    .get(key)
                    .filter(|slot| slot.seq == *seq)
                    .map(|slot| (key.as_str(), &slot.record))
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// In-process replay cache. Lost on restart.
#[derive(Debug)]
pub struct MemoryReplayStore {
    records: Mutex<Records>,
    clock: Arc<dyn Clock>,
}

impl MemoryReplayStore {
    /// An empty cache holding at most `max_entries` records for `ttl_secs`.
    #[must_use]
    pub fn new(ttl_secs: u64, max_entries: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: Mutex::new(Records::new(ttl_secs, max_entries)),
            clock,
        }
    }

    /// Number of live and not yet swept records.
    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl ReplayStore for MemoryReplayStore {
    async fn get(&self, payment_id: &str) -> Option<Box<RawValue>> {
        let now = self.clock.now();
        self.records.lock().await.get(payment_id, now).0
    }

    async fn insert(&self, payment_id: &str, response: Box<RawValue>) {
        let now = self.clock.now();
        self.records.lock().await.insert(payment_id, response, now);
    }
}

#[derive(Serialize)]
struct Snapshot<'a> {
    entries: Vec<(&'a str, &'a ReplayRecord)>,
}

#[derive(Deserialize)]
struct RawSnapshot {
    #[serde(default)]
    entries: Vec<Box<RawValue>>,
}

#[derive(Debug)]
struct FileInner {
    path: PathBuf,
    records: Mutex<Records>,
    clock: Arc<dyn Clock>,
    flush_pending: AtomicBool,
    write_lock: Mutex<()>,
    writes: AtomicU64,
}

impl FileInner {
    async fn flush(&self) {
        let bytes = {
            let mut records = self.records.lock().await;
            records.sweep(self.clock.now());
            serde_json::to_vec(&Snapshot {
                entries: records.entries(),
            })
        };
        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode replay cache");
                return;
            }
        };
        let _guard = self.write_lock.lock().await;
        let n = self.writes.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = write_atomic(&self.path, &bytes, n).await {
            tracing::error!(path = %self.path.display(), error = %e, "Replay cache flush failed");
        }
    }
}

/// Replay cache persisted to a JSON file.
#[derive(Debug)]
pub struct FileReplayStore {
    inner: Arc<FileInner>,
    tasks: TaskTracker,
}

impl FileReplayStore {
    /// Opens the cache at `path`, creating parent directories as needed.
    /// Expired records and malformed entries are dropped on load.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be created or the file
    /// exists but cannot be read. A file that is not a replay snapshot fails
    /// with [`std::io::ErrorKind::InvalidData`] rather than opening empty.
    pub async fn open(
        path: impl Into<PathBuf>,
        ttl_secs: u64,
        max_entries: usize,
        clock: Arc<dyn Clock>,
    ) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut records = Records::new(ttl_secs, max_entries);
        let now = clock.now();
        match tokio::fs::read(&path).await {
            Ok(raw) => load_into(&mut records, &raw, now)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        records.sweep(now);
        tracing::info!(path = %path.display(), entries = records.len(), "Opened replay cache");
        Ok(Self {
            inner: Arc::new(FileInner {
                path,
                records: Mutex::new(records),
                clock,
                flush_pending: AtomicBool::new(false),
                write_lock: Mutex::new(()),
                writes: AtomicU64::new(0),
            }),
            tasks: TaskTracker::new(),
        })
    }

    /// Number of live and not yet swept records.
    pub async fn len(&self) -> usize {
        self.inner.records.lock().await.len()
    }

    fn schedule_flush(&self) {
        if self.inner.flush_pending.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        self.tasks.spawn(async move {
            tokio::time::sleep(FLUSH_DEBOUNCE).await;
            inner.flush_pending.store(false, Ordering::Release);
            inner.flush().await;
        });
    }
}

fn load_into(records: &mut Records, raw: &[u8], now: UnixTimestamp) -> std::io::Result<()> {
    let snapshot: RawSnapshot = serde_json::from_slice(raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    for entry in snapshot.entries {
        let Ok((key, record)) = serde_json::from_str::<(String, ReplayRecord)>(entry.get()) else {
            tracing::warn!(entry = entry.get(), "Skipping malformed replay entry");
            continue;
        };
        if record.expires_at > now && !records.map.contains_key(&key) {
            records.push(key, record);
        }
    }
    Ok(())
}

#[async_trait]
impl ReplayStore for FileReplayStore {
    async fn get(&self, payment_id: &str) -> Option<Box<RawValue>> {
        let now = self.inner.clock.now();
        let (value, removed) = self.inner.records.lock().await.get(payment_id, now);
        if removed {
            self.schedule_flush();
        }
        value
    }

    async fn insert(&self, payment_id: &str, response: Box<RawValue>) {
        let now = self.inner.clock.now();
        self.inner
            .records
            .lock()
            .await
            .insert(payment_id, response, now);
        self.schedule_flush();
    }

    async fn close(&self) {
        self.inner.flush().await;
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }
}

async fn write_atomic(path: &Path, bytes: &[u8], n: u64) -> std::io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.{n}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}
