//! Metadata summaries of frames, computed from the committed `Frame` and
//! `Vector` objects without fetching or decoding any chunk.
use crate::chunk::ElementKind;
use crate::error::StoreError;
use crate::frame::fetch_vectors;
use crate::kv::{Directory, Key, KeyKind};
use futures::future;
use serde::{Deserialize, Serialize};

/// A summary of a frame
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Synopsis {
    pub frame_id: Key,
    pub rows: i64,
    pub columns: i64,
    /// The sum of the compressed length of every chunk of every column
    pub byte_size: i64,
    /// Whether every column holds raw bytes, `false` without columns
    pub is_text: bool,
}

/// Summarizes the most recently committed version of the frame at `frame`
pub async fn synopsize(dir: &Directory, frame: &Key) -> Result<Synopsis, StoreError> {
    let f = dir.get_frame(frame).await?;
    let vectors = fetch_vectors(dir, &f.vecs).await?;
    let byte_size: usize = vectors.iter().map(|v| v.byte_size()).sum();
    Ok(Synopsis {
        frame_id: f.key.clone(),
        rows: f.rows as i64,
        columns: f.num_cols() as i64,
        byte_size: byte_size as i64,
        is_text: !vectors.is_empty()
            && vectors.iter().all(|v| v.kind == ElementKind::RawBytes),
    })
}

/// Summarizes every frame in the cluster, sorted by key name
pub async fn list(dir: &Directory) -> Result<Vec<Synopsis>, StoreError> {
    let mut keys = dir.cluster_keys(KeyKind::Frame).await?;
    keys.sort_by(|a, b| a.name.cmp(&b.name));
    future::try_join_all(keys.iter().map(|k| synopsize(dir, k))).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{write_frame, NamedColumn, WriteOptions};
    use crate::node::LocalCluster;
    use crate::NodeConfig;

    #[tokio::test]
    async fn test_synopsis_of_text_and_mixed_frames() {
        let cluster = LocalCluster::new(2, NodeConfig::default());
        let dir = cluster.node(1).directory.clone();
        let opts = WriteOptions {
            rows_per_chunk: 4,
            lossy_digits: None,
        };
        let text = write_frame(
            &dir,
            "text",
            vec![NamedColumn::raw_bytes("b", b"hello, world".to_vec())],
            &opts,
        )
        .await
        .unwrap();
        let s = synopsize(&dir, &text).await.unwrap();
        assert_eq!((s.rows, s.columns), (12, 1));
        assert!(s.is_text);
        let v = dir.get_vector(&dir.get_frame(&text).await.unwrap().vecs[0]).await.unwrap();
        let mut expected = 0;
        for c in &v.chunks {
            expected += dir.get_chunk(&c.key).await.unwrap().compressed_len();
        }
        assert_eq!(s.byte_size, expected as i64);

        let mixed = write_frame(
            &dir,
            "mixed",
            vec![
                NamedColumn::raw_bytes("b", vec![1, 2]),
                NamedColumn::numeric("x", vec![Some(1.0), None]),
            ],
            &opts,
        )
        .await
        .unwrap();
        assert!(!synopsize(&dir, &mixed).await.unwrap().is_text);

        let empty = write_frame(&dir, "empty", vec![], &opts).await.unwrap();
        let s = synopsize(&dir, &empty).await.unwrap();
        assert_eq!((s.rows, s.columns, s.byte_size), (0, 0, 0));
        assert!(!s.is_text);

        // frames written from any node are listed
        let other = cluster.node(2).directory.clone();
        write_frame(&other, "remote", vec![NamedColumn::numeric("x", vec![Some(2.0)])], &opts)
            .await
            .unwrap();
        let all = list(&dir).await.unwrap();
        assert_eq!(all.len(), 4);
        let mut names: Vec<String> = all.iter().map(|s| s.frame_id.name.clone()).collect();
        let sorted = {
            let mut n = names.clone();
            n.sort();
            n
        };
        assert_eq!(names, sorted);
        names.dedup();
        assert_eq!(names.len(), 4);
    }
}
