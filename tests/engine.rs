//! End-to-end engine tests: the write path through the log, snapshot
//! visibility, conflicts, and full-table scans straight off the log
//! tail (no GC involved here; see `gc.rs` for compaction coverage).

use deltastore::{
    AggFn, AggSpec, CmpOp, Field, FieldType, MainFormat, OwnedValue, PredValue, ScanQuery,
    ScanQueryBuilder, ScanRequest, Schema, Storage, StorageConfig, StorageError, Value,
};

fn test_schema() -> Schema {
    Schema::new(vec![
        Field::new("number", FieldType::Int),
        Field::new("text1", FieldType::Text),
        Field::new("largenumber", FieldType::BigInt),
        Field::new("text2", FieldType::Text),
    ])
    .unwrap()
}

fn storage() -> Storage {
    Storage::new(StorageConfig {
        pool_pages: 32,
        ..StorageConfig::default()
    })
}

const BIG: i64 = 0x7FFF_FFFF_0000_0001u64 as i64;

fn row(k: u64) -> [Value<'static>; 4] {
    [
        Value::Int((k % 8) as i32),
        Value::Text("text1-value"),
        Value::BigInt(BIG),
        Value::Text("text2-value"),
    ]
}

fn load_thousand(storage: &Storage, table: &str) -> eyre::Result<()> {
    let mut txn = storage.begin()?;
    for k in 0..1000 {
        txn.insert(table, k, &row(k), true)?;
    }
    txn.commit();
    Ok(())
}

fn number_ge(storage: &Storage, table: &str, bound: i32) -> eyre::Result<usize> {
    let txn = storage.begin()?;
    let buf = ScanQueryBuilder::new()
        .conjunct(0, CmpOp::GreaterEqual, PredValue::Int(bound))
        .build();
    let desc = storage.table(table).unwrap().desc().clone();
    let query = ScanQuery::parse(&buf, &desc)?;
    let result = txn.scan(table, &ScanRequest::new(query))?;
    Ok(result.len())
}

#[test]
fn insert_commit_get_round_trip() -> eyre::Result<()> {
    let storage = storage();
    storage.create_table("t", test_schema(), MainFormat::RowMajor)?;

    let mut txn = storage.begin()?;
    txn.insert("t", 42, &row(42), true)?;
    txn.commit();

    let txn = storage.begin()?;
    let got = txn.get("t", 42)?.expect("key visible after commit");
    let desc = storage.table("t").unwrap().desc().clone();
    let view = deltastore::TupleView::new(&got.tuple, &desc);
    assert_eq!(view.get(0)?, Value::Int(2));
    assert_eq!(view.get(1)?, Value::Text("text1-value"));
    assert_eq!(view.get(2)?, Value::BigInt(BIG));
    assert_eq!(view.get(3)?, Value::Text("text2-value"));
    assert!(got.is_newest);
    Ok(())
}

#[test]
fn predicate_scan_selectivity_over_log_tail() -> eyre::Result<()> {
    let storage = storage();
    storage.create_table("t", test_schema(), MainFormat::RowMajor)?;
    load_thousand(&storage, "t")?;

    // number = k mod 8: >= 0 keeps all, >= 4 half, >= 6 a quarter.
    assert_eq!(number_ge(&storage, "t", 0)?, 1000);
    assert_eq!(number_ge(&storage, "t", 4)?, 500);
    assert_eq!(number_ge(&storage, "t", 6)?, 250);
    Ok(())
}

#[test]
fn first_committer_wins_on_concurrent_update() -> eyre::Result<()> {
    let storage = storage();
    storage.create_table("t", test_schema(), MainFormat::RowMajor)?;
    let mut setup = storage.begin()?;
    setup.insert("t", 42, &row(42), true)?;
    setup.commit();

    let mut t1 = storage.begin()?;
    let mut t2 = storage.begin()?;
    // First publisher wins the newest-pointer CAS.
    t1.update("t", 42, &row(43))?;
    let err = t2.update("t", 42, &row(44)).unwrap_err();
    assert!(matches!(err, StorageError::WriteConflict { key: 42 }));
    t1.commit();
    t2.abort();
    Ok(())
}

#[test]
fn snapshots_read_their_version() -> eyre::Result<()> {
    let storage = storage();
    let schema = Schema::new(vec![Field::new("v", FieldType::Text)]).unwrap();
    storage.create_table("t", schema, MainFormat::RowMajor)?;

    let mut writer = storage.begin()?;
    writer.insert("t", 1, &[Value::Text("a")], true)?;
    writer.commit();

    // Snapshot taken between the two writes keeps reading "a".
    let old_snapshot = storage.begin()?;

    let mut writer = storage.begin()?;
    writer.update("t", 1, &[Value::Text("b")])?;
    writer.commit();

    let desc = storage.table("t").unwrap().desc().clone();
    let got = old_snapshot.get("t", 1)?.unwrap();
    let view = deltastore::TupleView::new(&got.tuple, &desc);
    assert_eq!(view.get(0)?, Value::Text("a"));
    assert!(!got.is_newest);

    let fresh = storage.begin()?;
    let got = fresh.get("t", 1)?.unwrap();
    let view = deltastore::TupleView::new(&got.tuple, &desc);
    assert_eq!(view.get(0)?, Value::Text("b"));
    assert!(got.is_newest);
    Ok(())
}

#[test]
fn uncommitted_writes_stay_invisible_and_own_reads_work() -> eyre::Result<()> {
    let storage = storage();
    let schema = Schema::new(vec![Field::new("v", FieldType::Int)]).unwrap();
    storage.create_table("t", schema, MainFormat::RowMajor)?;

    let mut writer = storage.begin()?;
    writer.insert("t", 9, &[Value::Int(1)], true)?;
    // The writer sees its own insert.
    assert!(writer.get("t", 9)?.is_some());
    // A concurrent snapshot does not.
    let reader = storage.begin()?;
    assert!(reader.get("t", 9)?.is_none());
    writer.commit();
    // The concurrent snapshot still does not (the version is in its
    // inflight set), a fresh one does.
    assert!(reader.get("t", 9)?.is_none());
    drop(reader);
    assert!(storage.begin()?.get("t", 9)?.is_some());
    Ok(())
}

#[test]
fn aborted_writes_never_become_visible() -> eyre::Result<()> {
    let storage = storage();
    let schema = Schema::new(vec![Field::new("v", FieldType::Int)]).unwrap();
    storage.create_table("t", schema, MainFormat::RowMajor)?;

    let mut txn = storage.begin()?;
    txn.insert("t", 5, &[Value::Int(1)], true)?;
    txn.abort();

    assert!(storage.begin()?.get("t", 5)?.is_none());

    // The key is insertable again afterwards.
    let mut txn = storage.begin()?;
    txn.insert("t", 5, &[Value::Int(2)], true)?;
    txn.commit();
    assert!(storage.begin()?.get("t", 5)?.is_some());
    Ok(())
}

#[test]
fn duplicate_insert_and_tombstone_reinsert() -> eyre::Result<()> {
    let storage = storage();
    let schema = Schema::new(vec![Field::new("v", FieldType::Int)]).unwrap();
    storage.create_table("t", schema, MainFormat::RowMajor)?;

    let mut txn = storage.begin()?;
    txn.insert("t", 7, &[Value::Int(1)], true)?;
    txn.commit();

    let mut txn = storage.begin()?;
    let err = txn.insert("t", 7, &[Value::Int(2)], true).unwrap_err();
    assert!(matches!(err, StorageError::DuplicateKey { key: 7 }));
    txn.commit();

    // Remove, then the key is free again.
    let mut txn = storage.begin()?;
    txn.remove("t", 7)?;
    txn.commit();
    assert!(storage.begin()?.get("t", 7)?.is_none());

    let mut txn = storage.begin()?;
    txn.insert("t", 7, &[Value::Int(3)], true)?;
    txn.commit();
    let got = storage.begin()?.get("t", 7)?.unwrap();
    let desc = storage.table("t").unwrap().desc().clone();
    assert_eq!(
        deltastore::TupleView::new(&got.tuple, &desc).get(0)?,
        Value::Int(3)
    );
    Ok(())
}

#[test]
fn remove_then_update_is_not_found() -> eyre::Result<()> {
    let storage = storage();
    let schema = Schema::new(vec![Field::new("v", FieldType::Int)]).unwrap();
    storage.create_table("t", schema, MainFormat::RowMajor)?;

    let mut txn = storage.begin()?;
    txn.insert("t", 3, &[Value::Int(1)], true)?;
    txn.commit();
    let mut txn = storage.begin()?;
    txn.remove("t", 3)?;
    txn.commit();

    let mut txn = storage.begin()?;
    assert!(matches!(
        txn.update("t", 3, &[Value::Int(2)]),
        Err(StorageError::NotFound { key: 3 })
    ));
    assert!(matches!(
        txn.remove("t", 3),
        Err(StorageError::NotFound { key: 3 })
    ));
    assert!(matches!(
        txn.update("t", 999, &[Value::Int(2)]),
        Err(StorageError::NotFound { key: 999 })
    ));
    Ok(())
}

#[test]
fn log_page_rollover_keeps_everything_readable() -> eyre::Result<()> {
    let storage = storage();
    let schema = Schema::new(vec![
        Field::new("n", FieldType::Int),
        Field::new("payload", FieldType::Blob),
    ])
    .unwrap();
    storage.create_table("t", schema, MainFormat::RowMajor)?;

    // ~600 x 4 KiB spills well past one 2 MiB log page.
    let blob = vec![0xA5u8; 4096];
    let mut txn = storage.begin()?;
    for k in 0..600 {
        txn.insert("t", k, &[Value::Int(k as i32), Value::Blob(&blob)], true)?;
    }
    txn.commit();

    let txn = storage.begin()?;
    for k in (0..600).step_by(97) {
        let got = txn.get("t", k)?.expect("key survived page rollover");
        let desc = storage.table("t").unwrap().desc().clone();
        let view = deltastore::TupleView::new(&got.tuple, &desc);
        assert_eq!(view.get_blob(1), blob.as_slice());
    }
    let result = txn.scan("t", &ScanRequest::new(ScanQuery::all()))?;
    assert_eq!(result.len(), 600, "scan across page boundary, no dupes");
    Ok(())
}

#[test]
fn sum_aggregation_over_thousand_rows() -> eyre::Result<()> {
    let storage = storage();
    storage.create_table("t", test_schema(), MainFormat::RowMajor)?;
    load_thousand(&storage, "t")?;

    let txn = storage.begin()?;
    let buf = ScanQueryBuilder::new()
        .conjunct(0, CmpOp::GreaterEqual, PredValue::Int(0))
        .build();
    let desc = storage.table("t").unwrap().desc().clone();
    let query = ScanQuery::parse(&buf, &desc)?;
    let request = ScanRequest::new(query).with_aggregates(vec![AggSpec {
        func: AggFn::Sum,
        field_id: 2,
    }]);
    let result = txn.scan("t", &request)?;
    assert!(result.is_empty());
    let expected = 0x7FFF_FFFF_0000_0001u64.wrapping_mul(1000) as i64;
    assert_eq!(result.aggregates, vec![OwnedValue::BigInt(expected)]);
    Ok(())
}

#[test]
fn projection_returns_selected_fields_only() -> eyre::Result<()> {
    let storage = storage();
    storage.create_table("t", test_schema(), MainFormat::RowMajor)?;
    load_thousand(&storage, "t")?;

    let txn = storage.begin()?;
    let request = ScanRequest::new(ScanQuery::all()).with_projection(vec![0, 2]);
    let result = txn.scan("t", &request)?;
    assert_eq!(result.len(), 1000);
    assert_eq!(result.output_desc.field_count(), 2);
    for tuple in result.tuples() {
        let n = tuple.get_int(0);
        assert!((0..8).contains(&n));
        assert_eq!(tuple.get_bigint(1), BIG);
    }
    Ok(())
}

#[test]
fn cancelled_scan_reports_cancelled() -> eyre::Result<()> {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let storage = storage();
    storage.create_table("t", test_schema(), MainFormat::RowMajor)?;
    load_thousand(&storage, "t")?;

    let flag = Arc::new(AtomicBool::new(false));
    flag.store(true, Ordering::Release);
    let txn = storage.begin()?;
    let request = ScanRequest::new(ScanQuery::all()).with_cancel(Arc::clone(&flag));
    assert!(matches!(
        txn.scan("t", &request),
        Err(StorageError::Cancelled)
    ));
    Ok(())
}

#[test]
fn unknown_table_is_invalid_argument() -> eyre::Result<()> {
    let storage = storage();
    let txn = storage.begin()?;
    assert!(matches!(
        txn.get("missing", 1),
        Err(StorageError::InvalidArgument(_))
    ));
    Ok(())
}

#[test]
fn schema_mismatch_is_rejected_before_publication() -> eyre::Result<()> {
    let storage = storage();
    storage.create_table("t", test_schema(), MainFormat::RowMajor)?;
    let mut txn = storage.begin()?;
    let err = txn
        .insert("t", 1, &[Value::Int(1), Value::Int(2)], true)
        .unwrap_err();
    assert!(matches!(err, StorageError::SchemaMismatch(_)));
    let err = txn
        .insert(
            "t",
            1,
            &[
                Value::Text("wrong"),
                Value::Text("a"),
                Value::BigInt(1),
                Value::Text("b"),
            ],
            true,
        )
        .unwrap_err();
    assert!(matches!(err, StorageError::SchemaMismatch(_)));
    txn.commit();
    Ok(())
}

#[test]
fn implicit_commit_on_drop() -> eyre::Result<()> {
    let storage = storage();
    let schema = Schema::new(vec![Field::new("v", FieldType::Int)]).unwrap();
    storage.create_table("t", schema, MainFormat::RowMajor)?;
    {
        let mut txn = storage.begin()?;
        txn.insert("t", 1, &[Value::Int(1)], true)?;
        // No explicit commit: the holder commits on drop.
    }
    assert!(storage.begin()?.get("t", 1)?.is_some());
    Ok(())
}
