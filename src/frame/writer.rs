//! Writing new `Frame`s: splitting columns into chunks, encoding them and
//! publishing them in an order that never exposes a `Frame` whose parts are
//! missing.
use crate::chunk::{Chunk, ElementKind, EncodeOptions};
use crate::config::ROWS_PER_CHUNK;
use crate::error::StoreError;
use crate::frame::{check_unique_names, ChunkRef, Frame, Layout, NamedColumn, Vector};
use crate::kv::{Directory, Key, KeyKind, Object};
use futures::future;
use log::{debug, info};
use std::sync::Arc;

/// How `write_frame` lays out and encodes a new frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WriteOptions {
    pub rows_per_chunk: usize,
    /// Allow lossy encoding of numeric columns to this many decimal digits
    pub lossy_digits: Option<u8>,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            rows_per_chunk: ROWS_PER_CHUNK,
            lossy_digits: None,
        }
    }
}

/// Writes `columns` as a new frame called `name` and returns its key.
///
/// The rows are split into chunks of `opts.rows_per_chunk` rows and chunk
/// `i` of every column is stored on node `(i % num_nodes) + 1`. Every chunk
/// is committed before any `Vector` referencing it, and every `Vector`
/// before the `Frame`.
///
/// ## Errors
/// `SchemaMismatch` if the columns have different lengths or duplicate
/// names, or a categorical column's levels fall outside its domain
pub async fn write_frame(
    dir: &Directory,
    name: &str,
    columns: Vec<NamedColumn>,
    opts: &WriteOptions,
) -> Result<Key, StoreError> {
    let rows = columns.first().map(|c| c.len()).unwrap_or(0);
    if let Some(c) = columns.iter().find(|c| c.len() != rows) {
        return Err(StoreError::schema(
            "write frame",
            format!(
                "column {} has {} rows, expected {}",
                c.name,
                c.len(),
                rows
            ),
        ));
    }
    let key = Key::generate("frame", dir.node_id(), KeyKind::Frame);
    let frame = write_frame_under(dir, key, name, columns, opts).await?;
    info!(
        "Wrote frame {} ({}) with {} rows and {} columns",
        frame.name,
        frame.key,
        frame.rows,
        frame.num_cols()
    );
    Ok(frame.key.clone())
}

/// Like `write_frame` but publishes the frame under the given `key`, used to
/// publish the result of a job under the job's key.
pub(crate) async fn write_frame_under(
    dir: &Directory,
    key: Key,
    name: &str,
    columns: Vec<NamedColumn>,
    opts: &WriteOptions,
) -> Result<Arc<Frame>, StoreError> {
    let rows = columns.first().map(|c| c.len()).unwrap_or(0);
    let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
    check_unique_names("write frame", &names)?;
    for c in &columns {
        c.validate("write frame")?;
    }

    let layout = Layout::uniform(rows, opts.rows_per_chunk, dir.num_nodes());
    let vecs = future::try_join_all(
        columns
            .iter()
            .map(|c| write_vector(dir, c, &layout, opts.lossy_digits)),
    )
    .await?;
    publish_frame(dir, key, name, names, vecs, layout, rows).await
}

/// Encodes and stores `column` as a new `Vector` whose chunks follow
/// `layout`, returning the key of the `Vector`.
pub(crate) async fn write_vector(
    dir: &Directory,
    column: &NamedColumn,
    layout: &Layout,
    lossy_digits: Option<u8>,
) -> Result<Key, StoreError> {
    if column.len() != layout.rows() {
        return Err(StoreError::schema(
            "write column",
            format!(
                "column {} has {} rows but the layout covers {}",
                column.name,
                column.len(),
                layout.rows()
            ),
        ));
    }
    let opts = EncodeOptions { lossy_digits };
    let mut chunks = Vec::with_capacity(layout.num_chunks());
    for i in 0..layout.num_chunks() {
        let range = layout.range(i);
        let data = column.data.slice(range.clone());
        let key = Key::generate("chunk", layout.homes[i], KeyKind::Chunk);
        let chunk = Chunk::encode(key, &data, &opts)?;
        chunks.push((range.start, data.na_count(), chunk));
    }
    let refs = future::try_join_all(chunks.into_iter().map(|(start, na_count, chunk)| {
        put_chunk(dir, start, na_count, chunk)
    }))
    .await?;

    let key = publish_vector(
        dir,
        column.data.kind(),
        column.domain.clone(),
        lossy_digits,
        refs,
    )
    .await?;
    debug!("Wrote column {} as {}", column.name, key);
    Ok(key)
}

/// Commits a new `Vector` made of already committed chunks, in row order.
/// The `start` of every reference is recomputed from the rows before it.
pub(crate) async fn publish_vector(
    dir: &Directory,
    kind: ElementKind,
    domain: Option<Vec<String>>,
    lossy_digits: Option<u8>,
    mut chunks: Vec<ChunkRef>,
) -> Result<Key, StoreError> {
    let mut len = 0;
    for c in chunks.iter_mut() {
        c.start = len;
        len += c.rows;
    }
    let key = Key::generate("vec", dir.node_id(), KeyKind::Vec);
    let vector = Vector {
        key: key.clone(),
        kind,
        len,
        domain,
        lossy_digits,
        chunks,
    };
    dir.put(&key, Object::Vector(Arc::new(vector)), 0).await?;
    Ok(key)
}

/// Stores a new chunk on its home node
pub(crate) async fn put_chunk(
    dir: &Directory,
    start: usize,
    na_count: usize,
    chunk: Chunk,
) -> Result<ChunkRef, StoreError> {
    let chunk_ref = ChunkRef {
        key: chunk.key.clone(),
        start,
        rows: chunk.rows,
        compressed_len: chunk.compressed_len(),
        na_count,
    };
    dir.put(&chunk_ref.key, Object::Chunk(Arc::new(chunk)), 0)
        .await?;
    Ok(chunk_ref)
}

/// Commits a new `Frame` under `key` made of already committed `Vector`s.
pub(crate) async fn publish_frame(
    dir: &Directory,
    key: Key,
    name: &str,
    names: Vec<String>,
    vecs: Vec<Key>,
    layout: Layout,
    rows: usize,
) -> Result<Arc<Frame>, StoreError> {
    let frame = Arc::new(Frame {
        key: key.clone(),
        name: name.to_string(),
        rows,
        names,
        vecs,
        layout,
    });
    dir.put(&key, Object::Frame(frame.clone()), 0).await?;
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ColumnData;
    use crate::frame::read_frame;
    use crate::node::LocalCluster;
    use crate::NodeConfig;

    #[tokio::test]
    async fn test_chunks_are_spread_round_robin() {
        let cluster = LocalCluster::new(3, NodeConfig::default());
        let dir = cluster.node(1).directory.clone();
        let opts = WriteOptions {
            rows_per_chunk: 10,
            lossy_digits: None,
        };
        let values: Vec<Option<f64>> = (0..45).map(|i| Some(i as f64)).collect();
        let key = write_frame(&dir, "nums", vec![NamedColumn::numeric("x", values.clone())], &opts)
            .await
            .unwrap();
        let frame = dir.get_frame(&key).await.unwrap();
        assert_eq!(frame.rows, 45);
        assert_eq!(frame.layout.homes, vec![1, 2, 3, 1, 2]);
        let vector = dir.get_vector(&frame.vecs[0]).await.unwrap();
        assert_eq!(vector.len, 45);
        for (i, c) in vector.chunks.iter().enumerate() {
            assert_eq!(c.key.home, frame.layout.homes[i]);
            assert_eq!(c.start, i * 10);
        }
        assert_eq!(
            cluster.node(2).directory.local_keys(KeyKind::Chunk).await.len(),
            2
        );
        let cols = read_frame(&dir, &key).await.unwrap();
        assert_eq!(cols[0].data, ColumnData::Numeric(values));
    }

    #[tokio::test]
    async fn test_mismatched_lengths_are_rejected() {
        let cluster = LocalCluster::new(1, NodeConfig::default());
        let dir = cluster.node(1).directory.clone();
        let result = write_frame(
            &dir,
            "bad",
            vec![
                NamedColumn::numeric("a", vec![Some(1.0), Some(2.0)]),
                NamedColumn::numeric("b", vec![Some(1.0)]),
            ],
            &WriteOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(StoreError::SchemaMismatch { .. })));
        // nothing was published
        assert!(dir.local_keys(KeyKind::Frame).await.is_empty());
    }
}
