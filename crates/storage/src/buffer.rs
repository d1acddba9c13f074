//! Local spill buffer
//!
//! An append-only JSON-lines file holding one [`BufferedRecord`] per line,
//! plus a small sidecar (`<buffer>.commit`) holding the highest sequence
//! number the store has acknowledged.
//!
//! The writer is the only user: it appends whole batches while the store is
//! unavailable, replays them oldest first, and commits each replayed chunk.
//! A commit only moves the watermark; the data file is truncated once
//! everything is committed, or compacted once the committed prefix grows
//! past a threshold. On open, lines at or below the watermark are dropped.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use common::{BufferedRecord, GreekSnapshot};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{BufferError, BufferResult};

/// Committed bytes at the head of the file before it is compacted
pub const DEFAULT_COMPACT_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CommitMark {
    committed_through: u64,
}

/// Byte range of one uncommitted line
#[derive(Debug, Clone, Copy)]
struct Slot {
    seq: u64,
    start: u64,
    end: u64,
}

#[derive(Debug)]
pub struct BufferLog {
    path: PathBuf,
    mark_path: PathBuf,
    file: File,
    slots: VecDeque<Slot>,
    /// File length in bytes
    end: u64,
    committed_through: u64,
    next_seq: u64,
    compact_bytes: u64,
}

impl BufferLog {
    /// Open or create the buffer file and recover its state
    ///
    /// Lines that do not decode (a torn tail after a crash) and lines already
    /// committed are dropped, and the file is rewritten without them.
    pub async fn open(path: impl Into<PathBuf>) -> BufferResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| BufferError::io(parent, e))?;
        }

        let mark_path = commit_mark_path(&path);
        let committed_through = read_mark(&mark_path).await?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(BufferError::io(&path, e)),
        };

        let scan = scan(&bytes, committed_through);
        if scan.skipped > 0 {
            warn!(path = %path.display(), skipped = scan.skipped, "Dropped unreadable buffer lines");
        }

        let mut slots = scan.live;
        let mut end = bytes.len() as u64;
        if scan.skipped > 0 || scan.stale > 0 {
            let mut kept = Vec::with_capacity(bytes.len());
            for slot in slots.iter_mut() {
                let start = kept.len() as u64;
                kept.extend_from_slice(&bytes[slot.start as usize..slot.end as usize]);
                *slot = Slot {
                    seq: slot.seq,
                    start,
                    end: kept.len() as u64,
                };
            }
            rewrite(&path, &kept).await?;
            end = kept.len() as u64;
        }

        let next_seq = scan.high_water.max(committed_through) + 1;
        if !slots.is_empty() {
            info!(path = %path.display(), pending = slots.len(), next_seq, "Buffer holds records from a previous run");
        }

        Ok(Self {
            file: open_append(&path).await?,
            path,
            mark_path,
            slots,
            end,
            committed_through,
            next_seq,
            compact_bytes: DEFAULT_COMPACT_BYTES,
        })
    }

    /// Compact once this many committed bytes sit at the head of the file
    pub fn with_compact_bytes(mut self, bytes: u64) -> Self {
        self.compact_bytes = bytes.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended but not yet committed
    pub fn len(&self) -> u64 {
        self.slots.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Sequence number the next appended record will get
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Highest sequence number acknowledged by the store
    pub fn committed_through(&self) -> u64 {
        self.committed_through
    }

    /// Append a batch and fsync; returns the assigned sequence numbers
    pub async fn append(&mut self, snapshots: &[GreekSnapshot]) -> BufferResult<Vec<u64>> {
        if snapshots.is_empty() {
            return Ok(Vec::new());
        }

        let mut encoded = Vec::with_capacity(snapshots.len() * 512);
        let mut appended = Vec::with_capacity(snapshots.len());
        for (seq, snapshot) in (self.next_seq..).zip(snapshots) {
            let start = self.end + encoded.len() as u64;
            let record = BufferedRecord {
                seq,
                snapshot: snapshot.clone(),
            };
            serde_json::to_writer(&mut encoded, &record)?;
            encoded.push(b'\n');
            appended.push(Slot {
                seq,
                start,
                end: self.end + encoded.len() as u64,
            });
        }

        self.file.write_all(&encoded).await.map_err(|e| BufferError::io(&self.path, e))?;
        self.file.flush().await.map_err(|e| BufferError::io(&self.path, e))?;
        self.file.sync_data().await.map_err(|e| BufferError::io(&self.path, e))?;

        let seqs: Vec<u64> = appended.iter().map(|s| s.seq).collect();
        self.end += encoded.len() as u64;
        self.next_seq += seqs.len() as u64;
        self.slots.extend(appended);
        debug!(appended = seqs.len(), pending = self.slots.len(), "Buffered records");
        Ok(seqs)
    }

    /// Up to `limit` uncommitted records with `seq >= cursor`, in sequence order
    ///
    /// Reads only the byte range those records occupy.
    pub async fn read_from(&self, cursor: u64, limit: usize) -> BufferResult<Vec<BufferedRecord>> {
        let first = self.slots.partition_point(|s| s.seq < cursor);
        if limit == 0 || first >= self.slots.len() {
            return Ok(Vec::new());
        }
        let last = (first + limit).min(self.slots.len()) - 1;
        let (start, end) = (self.slots[first].start, self.slots[last].end);

        let mut file = File::open(&self.path).await.map_err(|e| BufferError::io(&self.path, e))?;
        file.seek(SeekFrom::Start(start)).await.map_err(|e| BufferError::io(&self.path, e))?;
        let mut bytes = vec![0u8; (end - start) as usize];
        file.read_exact(&mut bytes).await.map_err(|e| BufferError::io(&self.path, e))?;

        let mut records = Vec::with_capacity(last - first + 1);
        for line in bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            match serde_json::from_slice::<BufferedRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(path = %self.path.display(), error = %err, "Skipped unreadable buffer line"),
            }
        }
        Ok(records)
    }

    /// Mark every record with `seq <= through` as committed
    ///
    /// Moves the watermark and persists it; the data file is only touched
    /// when it becomes empty or its committed head needs compacting.
    /// Returns how many records were committed.
    pub async fn commit_through(&mut self, through: u64) -> BufferResult<u64> {
        let mut removed = 0u64;
        while let Some(slot) = self.slots.front().copied().filter(|s| s.seq <= through) {
            self.committed_through = slot.seq;
            self.slots.pop_front();
            removed += 1;
        }
        if removed == 0 {
            return Ok(0);
        }

        write_mark(&self.mark_path, self.committed_through).await?;

        match self.slots.front().map(|s| s.start) {
            None => self.truncate().await?,
            Some(head) if head >= self.compact_bytes => self.compact(head).await?,
            Some(_) => {}
        }
        debug!(
            through = self.committed_through,
            removed,
            pending = self.slots.len(),
            "Committed buffer prefix"
        );
        Ok(removed)
    }

    async fn truncate(&mut self) -> BufferResult<()> {
        self.file.set_len(0).await.map_err(|e| BufferError::io(&self.path, e))?;
        self.file.sync_data().await.map_err(|e| BufferError::io(&self.path, e))?;
        self.end = 0;
        Ok(())
    }

    /// Drop the committed head of the file
    async fn compact(&mut self, head: u64) -> BufferResult<()> {
        let mut file = File::open(&self.path).await.map_err(|e| BufferError::io(&self.path, e))?;
        file.seek(SeekFrom::Start(head)).await.map_err(|e| BufferError::io(&self.path, e))?;
        let mut tail = Vec::with_capacity((self.end - head) as usize);
        file.read_to_end(&mut tail).await.map_err(|e| BufferError::io(&self.path, e))?;

        rewrite(&self.path, &tail).await?;
        self.file = open_append(&self.path).await?;
        for slot in self.slots.iter_mut() {
            slot.start -= head;
            slot.end -= head;
        }
        self.end = tail.len() as u64;
        debug!(path = %self.path.display(), dropped_bytes = head, "Compacted buffer");
        Ok(())
    }
}

struct Scan {
    live: VecDeque<Slot>,
    high_water: u64,
    stale: usize,
    skipped: usize,
}

/// Index whole lines; a line without its newline is a torn write
fn scan(bytes: &[u8], committed_through: u64) -> Scan {
    let mut scan = Scan {
        live: VecDeque::new(),
        high_water: 0,
        stale: 0,
        skipped: 0,
    };

    let mut pos = 0usize;
    while pos < bytes.len() {
        let end = bytes[pos..]
            .iter()
            .position(|b| *b == b'\n')
            .map_or(bytes.len(), |i| pos + i + 1);
        let line = &bytes[pos..end];

        match line.strip_suffix(b"\n") {
            Some(body) if body.iter().all(u8::is_ascii_whitespace) => scan.stale += 1,
            Some(body) => match serde_json::from_slice::<BufferedRecord>(body) {
                Ok(record) if record.seq <= committed_through || record.seq <= scan.high_water => {
                    scan.high_water = scan.high_water.max(record.seq);
                    scan.stale += 1;
                }
                Ok(record) => {
                    scan.high_water = record.seq;
                    scan.live.push_back(Slot {
                        seq: record.seq,
                        start: pos as u64,
                        end: end as u64,
                    });
                }
                Err(err) => {
                    debug!(error = %err, "Unreadable buffer line");
                    scan.skipped += 1;
                }
            },
            None => scan.skipped += 1,
        }
        pos = end;
    }

    scan
}

fn commit_mark_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".commit");
    PathBuf::from(name)
}

async fn read_mark(path: &Path) -> BufferResult<u64> {
    match fs::read(path).await {
        Ok(bytes) => match serde_json::from_slice::<CommitMark>(&bytes) {
            Ok(mark) => Ok(mark.committed_through),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Unreadable commit mark; replaying from the start");
                Ok(0)
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(BufferError::io(path, e)),
    }
}

async fn write_mark(path: &Path, committed_through: u64) -> BufferResult<()> {
    let bytes = serde_json::to_vec(&CommitMark { committed_through })?;
    rewrite(path, &bytes).await
}

/// Replace `path` with `data` via a synced temporary file
async fn rewrite(path: &Path, data: &[u8]) -> BufferResult<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp).await.map_err(|e| BufferError::io(&tmp, e))?;
    file.write_all(data).await.map_err(|e| BufferError::io(&tmp, e))?;
    file.flush().await.map_err(|e| BufferError::io(&tmp, e))?;
    file.sync_all().await.map_err(|e| BufferError::io(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).await.map_err(|e| BufferError::io(path, e))
}

async fn open_append(path: &Path) -> BufferResult<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| BufferError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{ContractKey, Source};
    use uuid::Uuid;

    fn snapshot(key: &str) -> GreekSnapshot {
        GreekSnapshot {
            snapshot_id: Uuid::new_v4(),
            source: Source::Tastytrade,
            account_id: "5WT00001".into(),
            underlying_symbol: key.into(),
            contract_key: ContractKey::synthetic(key),
            event_time: Some(Utc::now()),
            received_at: Utc::now(),
            persisted_at: None,
            delta: Some(0.42),
            gamma: Some(0.01),
            theta: None,
            vega: None,
            rho: None,
            implied_volatility: Some(0.2),
            underlying_price: Some(470.0),
            raw_payload: "{}".into(),
            out_of_order: false,
        }
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_seqs() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = BufferLog::open(dir.path().join("buffer.jsonl")).await.unwrap();
        assert!(log.is_empty());

        assert_eq!(log.append(&[snapshot("SPY"), snapshot("QQQ")]).await.unwrap(), vec![1, 2]);
        assert_eq!(log.append(&[snapshot("IWM")]).await.unwrap(), vec![3]);
        assert_eq!(log.len(), 3);
        assert_eq!(log.next_seq(), 4);
        assert!(log.append(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_from_respects_cursor_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = BufferLog::open(dir.path().join("buffer.jsonl")).await.unwrap();
        log.append(&[snapshot("A"), snapshot("B"), snapshot("C"), snapshot("D")])
            .await
            .unwrap();

        let seqs: Vec<u64> = log.read_from(2, 2).await.unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert!(log.read_from(1, 0).await.unwrap().is_empty());
        assert!(log.read_from(9, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_through_drops_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = BufferLog::open(dir.path().join("buffer.jsonl")).await.unwrap();
        log.append(&[snapshot("A"), snapshot("B"), snapshot("C")]).await.unwrap();

        assert_eq!(log.commit_through(2).await.unwrap(), 2);
        assert_eq!(log.len(), 1);
        assert_eq!(log.committed_through(), 2);
        assert_eq!(log.read_from(0, 10).await.unwrap()[0].seq, 3);
        assert_eq!(log.commit_through(2).await.unwrap(), 0);

        assert_eq!(log.append(&[snapshot("D")]).await.unwrap(), vec![4]);
        let seqs: Vec<u64> = log.read_from(0, 10).await.unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn test_scan_skips_committed_and_torn_lines() {
        let line = |seq: u64| {
            let mut bytes = serde_json::to_vec(&BufferedRecord {
                seq,
                snapshot: snapshot("SPY"),
            })
            .unwrap();
            bytes.push(b'\n');
            bytes
        };
        let mut bytes = [line(1), line(2), line(3)].concat();
        bytes.extend_from_slice(br#"{"seq":4,"snap"#);

        let scan = scan(&bytes, 1);
        assert_eq!(scan.live.iter().map(|s| s.seq).collect::<Vec<_>>(), vec![2, 3]);
        assert_eq!(scan.stale, 1);
        assert_eq!(scan.skipped, 1);
        assert_eq!(scan.high_water, 3);
        assert_eq!(scan.live[1].end as usize, bytes.len() - br#"{"seq":4,"snap"#.len());
    }
}
