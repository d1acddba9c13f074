//! Buffer file recovery across restarts

use std::fs::OpenOptions;
use std::io::Write;

use chrono::Utc;
use common::{ContractKey, GreekSnapshot, Source};
use storage::BufferLog;
use uuid::Uuid;

fn snapshot(key: &str) -> GreekSnapshot {
    GreekSnapshot {
        snapshot_id: Uuid::new_v4(),
        source: Source::Ibkr,
        account_id: "U1234567".into(),
        underlying_symbol: key.into(),
        contract_key: ContractKey::synthetic(key),
        event_time: Some(Utc::now()),
        received_at: Utc::now(),
        persisted_at: None,
        delta: Some(-0.31),
        gamma: None,
        theta: Some(-0.05),
        vega: None,
        rho: None,
        implied_volatility: None,
        underlying_price: None,
        raw_payload: r#"{"topic":"smd+265598"}"#.into(),
        out_of_order: false,
    }
}

#[tokio::test]
async fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("spill").join("greeks.jsonl");

    let originals = vec![snapshot("SPY"), snapshot("QQQ"), snapshot("IWM")];
    {
        let mut log = BufferLog::open(&path).await.unwrap();
        log.append(&originals).await.unwrap();
        log.commit_through(1).await.unwrap();
    }

    let mut log = BufferLog::open(&path).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log.next_seq(), 4);

    let records = log.read_from(0, 10).await.unwrap();
    assert_eq!(records.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![2, 3]);
    assert_eq!(records[0].snapshot, originals[1]);
    assert_eq!(records[1].snapshot, originals[2]);

    assert_eq!(log.append(&[snapshot("DIA")]).await.unwrap(), vec![4]);
}

#[tokio::test]
async fn test_torn_tail_is_dropped_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("greeks.jsonl");
    {
        let mut log = BufferLog::open(&path).await.unwrap();
        log.append(&[snapshot("SPY"), snapshot("QQQ")]).await.unwrap();
    }

    let mut file = OpenOptions::new().append(true).open(&path).unwrap();
    file.write_all(br#"{"seq":3,"snapshot":{"snapshot_id":"#).unwrap();
    drop(file);

    let mut log = BufferLog::open(&path).await.unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(log.next_seq(), 3);

    // The rewritten file holds only whole lines, so new appends stay readable
    log.append(&[snapshot("IWM")]).await.unwrap();
    let seqs: Vec<u64> = log.read_from(0, 10).await.unwrap().iter().map(|r| r.seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 3);
}

#[tokio::test]
async fn test_commit_everything_leaves_empty_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("greeks.jsonl");
    let mut log = BufferLog::open(&path).await.unwrap();
    log.append(&[snapshot("SPY"), snapshot("QQQ")]).await.unwrap();

    assert_eq!(log.commit_through(u64::MAX).await.unwrap(), 2);
    assert!(log.is_empty());
    assert_eq!(log.committed_through(), 2);
    assert!(log.read_from(0, 10).await.unwrap().is_empty());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
}

#[tokio::test]
async fn test_seq_keeps_counting_after_full_commit_and_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("greeks.jsonl");
    {
        let mut log = BufferLog::open(&path).await.unwrap();
        log.append(&[snapshot("SPY"), snapshot("QQQ"), snapshot("IWM")]).await.unwrap();
        log.commit_through(3).await.unwrap();
    }

    let mut log = BufferLog::open(&path).await.unwrap();
    assert!(log.is_empty());
    assert_eq!(log.next_seq(), 4);
    assert_eq!(log.append(&[snapshot("DIA")]).await.unwrap(), vec![4]);
}

#[tokio::test]
async fn test_chunked_commits_leave_file_in_place() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("greeks.jsonl");
    let mut log = BufferLog::open(&path).await.unwrap();
    let rows: Vec<GreekSnapshot> = (0..200).map(|i| snapshot(&format!("SPY{i}"))).collect();
    log.append(&rows).await.unwrap();
    let full_len = std::fs::metadata(&path).unwrap().len();

    // Replay-sized commits move the watermark without rewriting the data file
    for through in [50, 100, 150] {
        let chunk = log.read_from(0, 50).await.unwrap();
        assert_eq!(chunk.first().unwrap().seq, through - 49);
        assert_eq!(chunk.last().unwrap().seq, through);
        assert_eq!(log.commit_through(through).await.unwrap(), 50);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), full_len);
    }
    assert_eq!(log.len(), 50);

    // A crash here leaves committed lines behind; reopening filters and drops them
    drop(log);
    let log = BufferLog::open(&path).await.unwrap();
    assert_eq!(log.len(), 50);
    assert_eq!(log.next_seq(), 201);
    let seqs: Vec<u64> = log.read_from(0, 100).await.unwrap().iter().map(|r| r.seq).collect();
    assert_eq!(seqs, (151..=200).collect::<Vec<_>>());
    assert!(std::fs::metadata(&path).unwrap().len() < full_len);
}

#[tokio::test]
async fn test_committed_head_is_compacted_past_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("greeks.jsonl");
    let mut log = BufferLog::open(&path).await.unwrap().with_compact_bytes(1);
    let rows: Vec<GreekSnapshot> = (0..10).map(|i| snapshot(&format!("QQQ{i}"))).collect();
    log.append(&rows).await.unwrap();
    let full_len = std::fs::metadata(&path).unwrap().len();

    log.commit_through(6).await.unwrap();
    assert!(std::fs::metadata(&path).unwrap().len() < full_len);
    assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 4);

    // Offsets follow the compacted file, for reads and for later appends
    log.append(&[snapshot("DIA")]).await.unwrap();
    let records = log.read_from(7, 10).await.unwrap();
    assert_eq!(records.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![7, 8, 9, 10, 11]);
    assert_eq!(records[0].snapshot, rows[6]);
}
