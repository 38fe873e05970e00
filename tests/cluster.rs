use fluxframe::chunk::ColumnData;
use fluxframe::kv::Object;
use fluxframe::{
    AggKind, Aggregate, Data, Key, LocalCluster, MergeOptions, NaMode, NamedColumn, NodeConfig,
    StoreError,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn config(rows_per_chunk: usize) -> NodeConfig {
    NodeConfig {
        rows_per_chunk,
        ..NodeConfig::default()
    }
}

fn trips() -> Vec<NamedColumn> {
    vec![
        NamedColumn::string(
            "station",
            (0..10).map(|i| Some(format!("station-{}", i % 3))).collect(),
        ),
        NamedColumn::categorical_from_labels(
            "day",
            &[
                Some("mon"),
                Some("tue"),
                Some("mon"),
                Some("wed"),
                None,
                Some("tue"),
                Some("mon"),
                None,
                Some("fri"),
                Some("wed"),
            ],
        ),
        NamedColumn::numeric(
            "duration",
            vec![
                Some(12.0),
                Some(3.5),
                None,
                Some(8.0),
                Some(1.0),
                Some(30.0),
                Some(7.25),
                Some(2.0),
                Some(11.0),
                Some(4.0),
            ],
        ),
    ]
}

fn numbers(col: &NamedColumn) -> Vec<Option<f64>> {
    match &col.data {
        ColumnData::Numeric(v) => v.clone(),
        other => panic!("expected a numeric column, got {:?}", other.kind()),
    }
}

#[tokio::test]
async fn test_byte_size_is_the_sum_of_compressed_lengths() {
    let cluster = LocalCluster::new(3, config(3));
    let node = cluster.node(1);
    let key = node.write_frame("trips", trips()).await.unwrap();
    let synopsis = node.synopsis(&key).await.unwrap();
    assert_eq!(synopsis.frame_id, key);
    assert_eq!((synopsis.rows, synopsis.columns), (10, 3));
    assert!(!synopsis.is_text);

    let dir = node.directory();
    let frame = dir.get_frame(&key).await.unwrap();
    let mut total = 0;
    for vec_key in &frame.vecs {
        let vector = dir.get_vector(vec_key).await.unwrap();
        for c in &vector.chunks {
            // read from the owning node's own store
            let owner = cluster.node(c.key.home).directory();
            total += owner.get_chunk(&c.key).await.unwrap().compressed_len();
        }
    }
    assert_eq!(synopsis.byte_size, total as i64);
}

#[tokio::test]
async fn test_is_text_only_for_raw_bytes_frames() {
    let cluster = LocalCluster::new(2, config(4));
    let node = cluster.node(2);
    let text = node
        .write_frame(
            "log",
            vec![
                NamedColumn::raw_bytes("a", b"line one\nline two\n".to_vec()),
                NamedColumn::raw_bytes("b", b"LINE ONE\nLINE TWO\n".to_vec()),
            ],
        )
        .await
        .unwrap();
    assert!(node.synopsis(&text).await.unwrap().is_text);

    let mixed = node
        .write_frame(
            "mixed",
            vec![
                NamedColumn::raw_bytes("a", vec![0, 1, 2]),
                NamedColumn::string("s", vec![Some("x".into()), None, Some("z".into())]),
            ],
        )
        .await
        .unwrap();
    assert!(!node.synopsis(&mixed).await.unwrap().is_text);
}

#[tokio::test]
async fn test_group_by_count_by_day() {
    let cluster = LocalCluster::new(3, config(3));
    let node = cluster.node(1);
    let key = node.write_frame("trips", trips()).await.unwrap();
    let grouped = node
        .group_by(
            &key,
            &["day"],
            &[
                Aggregate::new(AggKind::Count, "duration"),
                Aggregate::new(AggKind::Sum, "duration").with_na(NaMode::Rm),
                Aggregate::new(AggKind::Max, "duration"),
            ],
        )
        .await
        .unwrap();
    let cols = node.read_frame(&grouped).await.unwrap();
    let names: Vec<&str> = cols.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["day", "count_duration", "sum_duration", "max_duration"]);

    // fri, mon, tue, wed and one group for the missing day
    assert_eq!(cols[0].len(), 5);
    let days: Vec<Option<Data>> = (0..5).map(|i| cols[0].label_at(i)).collect();
    assert_eq!(
        days,
        vec![
            Some(Data::Str("fri".into())),
            Some(Data::Str("mon".into())),
            Some(Data::Str("tue".into())),
            Some(Data::Str("wed".into())),
            Some(Data::Null),
        ]
    );
    let counts = numbers(&cols[1]);
    assert_eq!(counts.iter().flatten().sum::<f64>(), 10.0);
    assert_eq!(
        counts,
        vec![Some(1.0), Some(3.0), Some(2.0), Some(2.0), Some(2.0)]
    );
    assert_eq!(
        numbers(&cols[2]),
        vec![Some(11.0), Some(19.25), Some(33.5), Some(12.0), Some(3.0)]
    );
    // monday has a missing duration
    assert_eq!(
        numbers(&cols[3]),
        vec![Some(11.0), None, Some(30.0), Some(8.0), Some(2.0)]
    );
}

#[tokio::test]
async fn test_group_by_rejects_bad_columns() {
    let cluster = LocalCluster::new(2, config(3));
    let node = cluster.node(1);
    let key = node.write_frame("trips", trips()).await.unwrap();
    let unknown = node
        .group_by(&key, &["month"], &[Aggregate::new(AggKind::Count, "duration")])
        .await;
    assert!(matches!(unknown, Err(StoreError::SchemaMismatch { .. })));
    let not_numeric = node
        .group_by(&key, &["day"], &[Aggregate::new(AggKind::Mean, "station")])
        .await;
    assert!(matches!(not_numeric, Err(StoreError::SchemaMismatch { .. })));
}

#[tokio::test]
async fn test_merge_keeping_left_rows_preserves_the_row_count() {
    let cluster = LocalCluster::new(3, config(4));
    let node = cluster.node(1);
    let left = node
        .write_frame(
            "left",
            vec![
                NamedColumn::numeric("id", (0..20).map(|i| Some(i as f64)).collect()),
                NamedColumn::numeric("value", (0..20).map(|i| Some(i as f64 * 10.0)).collect()),
            ],
        )
        .await
        .unwrap();
    let right = cluster
        .node(2)
        .write_frame(
            "right",
            vec![
                NamedColumn::numeric("id", (0..5).map(|i| Some(i as f64 * 2.0)).collect()),
                NamedColumn::string("value", (0..5).map(|i| Some(format!("r{}", i))).collect()),
            ],
        )
        .await
        .unwrap();
    let merged = node
        .merge(
            &left,
            &right,
            &["id"],
            MergeOptions {
                keep_unmatched_left: true,
                keep_unmatched_right: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(node.synopsis(&merged).await.unwrap().rows, 20);
    let cols = node.read_frame(&merged).await.unwrap();
    let names: Vec<&str> = cols.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["id", "value", "value_right"]);
    assert_eq!(numbers(&cols[0]), (0..20).map(|i| Some(i as f64)).collect::<Vec<_>>());
    assert_eq!(cols[2].data.get(4), Some(Data::Str("r2".into())));
    assert_eq!(cols[2].data.get(5), Some(Data::Null));
}

#[tokio::test]
async fn test_merge_writes_result_chunks_where_the_larger_frame_lives() {
    let cluster = LocalCluster::new(3, config(4));
    let node = cluster.node(1);
    let large = node
        .write_frame(
            "large",
            vec![
                NamedColumn::numeric("id", (0..20).map(|i| Some((i % 4) as f64)).collect()),
                NamedColumn::numeric("x", (0..20).map(|i| Some(i as f64)).collect()),
            ],
        )
        .await
        .unwrap();
    let small = node
        .write_frame(
            "small",
            vec![
                NamedColumn::numeric("id", vec![Some(0.0), Some(1.0), Some(2.0), Some(3.0)]),
                NamedColumn::string("tag", (0..4).map(|i| Some(format!("t{}", i))).collect()),
            ],
        )
        .await
        .unwrap();
    let merged = node
        .merge(&large, &small, &["id"], MergeOptions::default())
        .await
        .unwrap();
    let source = node.directory().get_frame(&large).await.unwrap();
    let result = node.directory().get_frame(&merged).await.unwrap();
    assert_eq!(result.layout, source.layout);
    assert_eq!(result.layout.homes, vec![1, 2, 3, 1, 2]);
    for vec_key in &result.vecs {
        let vector = node.directory().get_vector(vec_key).await.unwrap();
        let homes: Vec<usize> = vector.chunks.iter().map(|c| c.key.home).collect();
        assert_eq!(homes, source.layout.homes);
    }
    let cols = node.read_frame(&merged).await.unwrap();
    assert_eq!(numbers(&cols[1]), (0..20).map(|i| Some(i as f64)).collect::<Vec<_>>());
    assert_eq!(cols[2].data.get(6), Some(Data::Str("t2".into())));
}

#[tokio::test]
async fn test_merge_fans_out_duplicate_keys() {
    let cluster = LocalCluster::new(2, config(2));
    let node = cluster.node(1);
    let left = node
        .write_frame(
            "left",
            vec![NamedColumn::numeric("id", vec![Some(1.0), Some(2.0), Some(3.0)])],
        )
        .await
        .unwrap();
    let right = node
        .write_frame(
            "right",
            vec![
                NamedColumn::numeric("id", vec![Some(1.0), Some(1.0), Some(2.0)]),
                NamedColumn::numeric("w", vec![Some(0.1), Some(0.2), Some(0.3)]),
            ],
        )
        .await
        .unwrap();
    let merged = node
        .merge(&left, &right, &["id"], MergeOptions::default())
        .await
        .unwrap();
    let cols = node.read_frame(&merged).await.unwrap();
    assert_eq!(numbers(&cols[0]), vec![Some(1.0), Some(1.0), Some(2.0)]);
    assert_eq!(numbers(&cols[1]), vec![Some(0.1), Some(0.2), Some(0.3)]);
}

#[tokio::test]
async fn test_merge_appends_unmatched_rows_of_the_smaller_frame() {
    let cluster = LocalCluster::new(2, config(2));
    let node = cluster.node(1);
    let left = node
        .write_frame(
            "small",
            vec![
                NamedColumn::categorical_from_labels("day", &[Some("mon"), Some("sun")]),
                NamedColumn::numeric("a", vec![Some(1.0), Some(2.0)]),
            ],
        )
        .await
        .unwrap();
    let right = node
        .write_frame(
            "large",
            vec![
                NamedColumn::categorical_from_labels(
                    "day",
                    &[Some("fri"), Some("mon"), Some("tue"), Some("mon")],
                ),
                NamedColumn::numeric("b", vec![Some(10.0), Some(20.0), Some(30.0), Some(40.0)]),
            ],
        )
        .await
        .unwrap();
    let merged = node
        .merge(
            &left,
            &right,
            &["day"],
            MergeOptions {
                keep_unmatched_left: true,
                keep_unmatched_right: false,
            },
        )
        .await
        .unwrap();
    let cols = node.read_frame(&merged).await.unwrap();
    let days: Vec<Option<Data>> = (0..3).map(|i| cols[0].label_at(i)).collect();
    assert_eq!(
        days,
        vec![
            Some(Data::Str("mon".into())),
            Some(Data::Str("mon".into())),
            Some(Data::Str("sun".into())),
        ]
    );
    assert_eq!(numbers(&cols[1]), vec![Some(1.0), Some(1.0), Some(2.0)]);
    assert_eq!(numbers(&cols[2]), vec![Some(20.0), Some(40.0), None]);
}

#[tokio::test]
async fn test_merge_rejects_mismatched_join_columns() {
    let cluster = LocalCluster::new(1, config(2));
    let node = cluster.node(1);
    let left = node
        .write_frame("l", vec![NamedColumn::numeric("k", vec![Some(1.0)])])
        .await
        .unwrap();
    let right = node
        .write_frame("r", vec![NamedColumn::string("k", vec![Some("1".into())])])
        .await
        .unwrap();
    let result = node.merge(&left, &right, &["k"], MergeOptions::default()).await;
    assert!(matches!(result, Err(StoreError::SchemaMismatch { .. })));
}

#[tokio::test]
async fn test_exactly_one_concurrent_writer_wins() {
    let cluster = LocalCluster::new(3, config(4));
    let key = cluster.node(1).write_frame("cas", trips()).await.unwrap();
    let current = cluster.node(1).directory().get(&key).await.unwrap();

    let mut attempts = Vec::new();
    for id in 1..=3 {
        for _ in 0..4 {
            let dir = cluster.node(id).directory().clone();
            let (key, value, version) = (key.clone(), current.value.clone(), current.version);
            attempts.push(tokio::spawn(async move { dir.put(&key, value, version).await }));
        }
    }
    let mut won = 0;
    let mut conflicts = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(v) => {
                assert_eq!(v, current.version + 1);
                won += 1;
            }
            Err(StoreError::VersionConflict { .. }) => conflicts += 1,
            Err(e) => panic!("unexpected error {}", e),
        }
    }
    assert_eq!((won, conflicts), (1, 11));

    // writers that re-read and retry all get through
    let mut renames = Vec::new();
    for id in 1..=3 {
        let node = cluster.node(id).clone();
        let key = key.clone();
        renames.push(tokio::spawn(async move {
            node.rename(&key, &format!("renamed-by-{}", id)).await
        }));
    }
    for r in renames {
        r.await.unwrap().unwrap();
    }
    let latest = cluster.node(2).directory().get_fresh(&key).await.unwrap();
    assert_eq!(latest.version, current.version + 4);
}

#[tokio::test]
async fn test_row_slice() {
    let cluster = LocalCluster::new(3, config(64));
    let node = cluster.node(3);
    let values: Vec<Option<f64>> = (0..1000).map(|i| Some(i as f64 * 0.5)).collect();
    let key = node
        .write_frame("big", vec![NamedColumn::numeric("x", values.clone())])
        .await
        .unwrap();
    let sliced = node.slice_rows(&key, 100..200).await.unwrap();
    assert_eq!(node.synopsis(&sliced).await.unwrap().rows, 100);
    let col = cluster.node(1).read_column(&sliced, "x").await.unwrap();
    assert_eq!(col.data, ColumnData::Numeric(values[100..200].to_vec()));
    assert_eq!(node.get(&sliced, 0, 0).await.unwrap(), Data::Num(50.0));
    assert!(matches!(
        node.slice_rows(&key, 900..1001).await,
        Err(StoreError::RowIndexOutOfBounds(_))
    ));
}

#[tokio::test]
async fn test_jobs_are_deterministic() {
    let cluster = LocalCluster::new(3, config(2));
    let node = cluster.node(1);
    let key = node.write_frame("trips", trips()).await.unwrap();
    let aggs = [
        Aggregate::new(AggKind::Mean, "duration").with_na(NaMode::Rm),
        Aggregate::new(AggKind::Sd, "duration").with_na(NaMode::Rm),
    ];
    let a = node.group_by(&key, &["station", "day"], &aggs).await.unwrap();
    let b = cluster
        .node(2)
        .group_by(&key, &["station", "day"], &aggs)
        .await
        .unwrap();
    assert_ne!(a, b);
    assert_eq!(node.read_frame(&a).await.unwrap(), node.read_frame(&b).await.unwrap());

    let m1 = node.merge(&key, &a, &["station", "day"], MergeOptions::default()).await.unwrap();
    let m2 = node.merge(&key, &a, &["station", "day"], MergeOptions::default()).await.unwrap();
    assert_eq!(node.read_frame(&m1).await.unwrap(), node.read_frame(&m2).await.unwrap());
}

#[tokio::test]
async fn test_losing_a_chunk_owner_fails_the_job() {
    let cluster = LocalCluster::new(3, config(2));
    let node = cluster.node(1);
    let key = node.write_frame("trips", trips()).await.unwrap();
    cluster.kill(2).await;
    let result = node
        .group_by(&key, &["day"], &[Aggregate::new(AggKind::Count, "duration")])
        .await;
    assert!(matches!(
        result,
        Err(StoreError::NodeUnavailable { node: 2, .. })
    ));
}

#[tokio::test]
async fn test_cancelled_job_fails_with_cancelled() {
    let cluster = LocalCluster::new(2, config(2));
    let node = cluster.node(1);
    let key = node.write_frame("trips", trips()).await.unwrap();
    let token = CancellationToken::new();
    token.cancel();
    let handle = node.spawn_group_by_with(
        &key,
        &["day"],
        &[Aggregate::new(AggKind::Count, "duration")],
        token,
    );
    let job: Key = handle.key().clone();
    assert!(matches!(handle.join().await, Err(StoreError::Cancelled { .. })));
    // nothing was published under the job's key
    assert!(matches!(
        node.synopsis(&job).await,
        Err(StoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_corrupted_chunk_fails_with_encoding_failure() {
    let cluster = LocalCluster::new(1, config(10));
    let node = cluster.node(1);
    let key = node
        .write_frame(
            "words",
            vec![NamedColumn::string(
                "w",
                vec![Some("alpha".into()), Some("beta".into()), Some("gamma".into())],
            )],
        )
        .await
        .unwrap();
    let dir = node.directory();
    let frame = dir.get_frame(&key).await.unwrap();
    let vector = dir.get_vector(&frame.vecs[0]).await.unwrap();
    let chunk_key = vector.chunks[0].key.clone();
    let stored = dir.get(&chunk_key).await.unwrap();
    let mut chunk = match &stored.value {
        Object::Chunk(c) => c.as_ref().clone(),
        other => panic!("expected a chunk, got {:?}", other.kind()),
    };
    let len = chunk.bytes.len();
    chunk.bytes.truncate(len - 3);
    dir.put(&chunk_key, Object::Chunk(Arc::new(chunk)), stored.version)
        .await
        .unwrap();

    assert!(matches!(
        node.read_column(&key, "w").await,
        Err(StoreError::EncodingFailure { .. })
    ));
    let result = node
        .group_by(&key, &["w"], &[Aggregate::new(AggKind::Count, "w")])
        .await;
    assert!(matches!(result, Err(StoreError::EncodingFailure { .. })));
}
