//! Operations on published frames: assembling, slicing, renaming, removing
//! and reading them back.
use crate::chunk::{Chunk, ColumnData, Data, EncodeOptions};
use crate::error::StoreError;
use crate::frame::writer::{put_chunk, write_vector};
use crate::frame::{check_unique_names, publish_frame, Frame, Layout, NamedColumn, Vector};
use crate::kv::{Directory, Key, KeyKind, Object};
use futures::future;
use log::{debug, info};
use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

/// Fetches the `Vector` of every key in `keys`
pub(crate) async fn fetch_vectors(
    dir: &Directory,
    keys: &[Key],
) -> Result<Vec<Arc<Vector>>, StoreError> {
    future::try_join_all(keys.iter().map(|k| dir.get_vector(k))).await
}

/// Decodes every chunk of `vector` and concatenates them
pub(crate) async fn read_vector(
    dir: &Directory,
    vector: &Vector,
) -> Result<ColumnData, StoreError> {
    let chunks =
        future::try_join_all(vector.chunks.iter().map(|c| dir.get_chunk(&c.key))).await?;
    let mut data = ColumnData::empty(vector.kind);
    for chunk in chunks {
        if chunk.kind != vector.kind {
            return Err(StoreError::schema(
                "read column",
                format!(
                    "chunk {} holds {} values in a {} column",
                    chunk.key, chunk.kind, vector.kind
                ),
            ));
        }
        data.append(chunk.decode()?)?;
    }
    Ok(data)
}

/// Builds a new frame called `name` out of existing columns and returns its
/// key. Columns whose chunk layout differs from the first column's are
/// copied into new chunks following the first column's layout.
///
/// ## Errors
/// `SchemaMismatch` if the columns have different lengths, `names` and
/// `vecs` differ in length or a name is used twice
pub async fn assemble(
    dir: &Directory,
    name: &str,
    names: Vec<String>,
    vecs: Vec<Key>,
) -> Result<Key, StoreError> {
    if names.len() != vecs.len() {
        return Err(StoreError::schema(
            "assemble",
            format!("{} names for {} columns", names.len(), vecs.len()),
        ));
    }
    check_unique_names("assemble", &names)?;
    let vectors = fetch_vectors(dir, &vecs).await?;
    let (rows, layout) = match vectors.first() {
        Some(v) => (v.len, v.layout()),
        None => (0, Layout::empty()),
    };
    let mut keys = Vec::with_capacity(vectors.len());
    for (v, name) in vectors.iter().zip(names.iter()) {
        if v.len != rows {
            return Err(StoreError::schema(
                "assemble",
                format!("column {} has {} rows, expected {}", name, v.len, rows),
            ));
        }
        if v.layout() == layout {
            keys.push(v.key.clone());
        } else {
            debug!("Realigning column {} to the layout of the first column", name);
            let column = NamedColumn {
                name: name.clone(),
                data: read_vector(dir, v).await?,
                domain: v.domain.clone(),
            };
            keys.push(write_vector(dir, &column, &layout, v.lossy_digits).await?);
        }
    }
    let key = Key::generate("frame", dir.node_id(), KeyKind::Frame);
    let frame = publish_frame(dir, key, name, names, keys, layout, rows).await?;
    Ok(frame.key.clone())
}

/// Creates a new frame holding the rows `range` of `frame`. Chunks entirely
/// inside the range are shared with the original, the chunks cut by either
/// end of the range are re-encoded and stored on the node that owns the
/// original chunk.
///
/// ## Errors
/// `RowIndexOutOfBounds` if the range does not lie within the frame
pub async fn slice_rows(
    dir: &Directory,
    frame: &Key,
    range: Range<usize>,
) -> Result<Key, StoreError> {
    let frame = dir.get_frame(frame).await?;
    if range.end > frame.rows {
        return Err(StoreError::RowIndexOutOfBounds(range.end as u64));
    }
    if range.start > range.end {
        return Err(StoreError::RowIndexOutOfBounds(range.start as u64));
    }
    let old = &frame.layout;
    // the chunks overlapping the range and the part of each that is kept
    let mut kept: Vec<(usize, Range<usize>)> = Vec::new();
    let mut layout = Layout::empty();
    for i in 0..old.num_chunks() {
        let chunk = old.range(i);
        let start = chunk.start.max(range.start);
        let end = chunk.end.min(range.end);
        if start < end {
            kept.push((i, start..end));
            layout.starts.push(end - range.start);
            layout.homes.push(old.homes[i]);
        }
    }

    let vectors = fetch_vectors(dir, &frame.vecs).await?;
    let mut vecs = Vec::with_capacity(vectors.len());
    for v in &vectors {
        let opts = EncodeOptions {
            lossy_digits: v.lossy_digits,
        };
        let refs = future::try_join_all(kept.iter().map(|(i, part)| {
            let chunk_ref = v.chunks[*i].clone();
            let chunk_range = old.range(*i);
            let part = part.clone();
            let new_start = part.start - range.start;
            async move {
                if part == chunk_range {
                    let mut chunk_ref = chunk_ref;
                    chunk_ref.start = new_start;
                    return Ok(chunk_ref);
                }
                let chunk = dir.get_chunk(&chunk_ref.key).await?;
                let data = chunk.decode()?.slice(
                    (part.start - chunk_range.start)..(part.end - chunk_range.start),
                );
                let key = Key::generate("chunk", chunk_ref.key.home, KeyKind::Chunk);
                let chunk = Chunk::encode(key, &data, &opts)?;
                put_chunk(dir, new_start, data.na_count(), chunk).await
            }
        }))
        .await?;
        let key = Key::generate("vec", dir.node_id(), KeyKind::Vec);
        let vector = Vector {
            key: key.clone(),
            kind: v.kind,
            len: range.end - range.start,
            domain: v.domain.clone(),
            lossy_digits: v.lossy_digits,
            chunks: refs,
        };
        dir.put(&key, Object::Vector(Arc::new(vector)), 0).await?;
        vecs.push(key);
    }
    let key = Key::generate("frame", dir.node_id(), KeyKind::Frame);
    let sliced = publish_frame(
        dir,
        key,
        &frame.name,
        frame.names.clone(),
        vecs,
        layout,
        range.end - range.start,
    )
    .await?;
    debug!(
        "Sliced rows {:?} of {} into {}",
        range, frame.key, sliced.key
    );
    Ok(sliced.key.clone())
}

/// Creates a new frame holding the columns called `names` of `frame`, in
/// that order. No data is copied.
pub async fn slice_cols(
    dir: &Directory,
    frame: &Key,
    names: &[&str],
) -> Result<Key, StoreError> {
    let frame = dir.get_frame(frame).await?;
    let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
    check_unique_names("slice columns", &names)?;
    let mut vecs = Vec::with_capacity(names.len());
    for n in &names {
        let idx = frame.require_col("slice columns", n)?;
        vecs.push(frame.vecs[idx].clone());
    }
    let key = Key::generate("frame", dir.node_id(), KeyKind::Frame);
    let sliced = publish_frame(
        dir,
        key,
        &frame.name,
        names,
        vecs,
        frame.layout.clone(),
        frame.rows,
    )
    .await?;
    Ok(sliced.key.clone())
}

/// Renames `frame`, publishing a new version of it under the same key.
pub async fn rename(dir: &Directory, frame: &Key, name: &str) -> Result<(), StoreError> {
    dir.update(frame, |obj| {
        let mut f = obj.clone().into_frame(frame)?.as_ref().clone();
        f.name = name.to_string();
        Ok(Object::Frame(Arc::new(f)))
    })
    .await?;
    info!("Renamed frame {} to {}", frame, name);
    Ok(())
}

/// Renames the column `old` of `frame` to `new`, publishing a new version of
/// the frame under the same key.
pub async fn rename_column(
    dir: &Directory,
    frame: &Key,
    old: &str,
    new: &str,
) -> Result<(), StoreError> {
    dir.update(frame, |obj| {
        let mut f = obj.clone().into_frame(frame)?.as_ref().clone();
        let idx = f.require_col("rename column", old)?;
        if old != new && f.col_idx(new).is_some() {
            return Err(StoreError::schema(
                "rename column",
                format!("frame {} already has a column named {}", f.name, new),
            ));
        }
        f.names[idx] = new.to_string();
        Ok(Object::Frame(Arc::new(f)))
    })
    .await?;
    Ok(())
}

/// Removes `frame` and returns whether it existed. With `deep`, every
/// `Vector` and `Chunk` it references is removed too, except those another
/// frame of the cluster still references (slices and assembled frames
/// share them).
pub async fn remove_frame(dir: &Directory, frame: &Key, deep: bool) -> Result<bool, StoreError> {
    if !deep {
        return dir.remove(frame).await;
    }
    let f = match dir.get_frame(frame).await {
        Ok(f) => f,
        Err(StoreError::NotFound { .. }) => return Ok(false),
        Err(e) => return Err(e),
    };
    let (shared_vecs, shared_chunks) = referenced_elsewhere(dir, frame).await?;
    // the frame goes first so nobody can reach a partially removed column
    let existed = dir.remove(frame).await?;
    let owned: Vec<Key> = f
        .vecs
        .iter()
        .filter(|k| !shared_vecs.contains(*k))
        .cloned()
        .collect();
    let vectors = fetch_vectors(dir, &owned).await?;
    let mut kept = 0;
    for v in vectors {
        let chunks: Vec<&Key> = v
            .chunks
            .iter()
            .map(|c| &c.key)
            .filter(|k| !shared_chunks.contains(*k))
            .collect();
        kept += v.chunks.len() - chunks.len();
        future::try_join_all(chunks.into_iter().map(|k| dir.remove(k))).await?;
        dir.remove(&v.key).await?;
    }
    info!(
        "Removed frame {} and {} of its {} columns, keeping {} shared chunks",
        frame,
        owned.len(),
        f.num_cols(),
        kept
    );
    Ok(existed)
}

/// The keys of the `Vector`s and `Chunk`s referenced by every frame of the
/// cluster other than `frame`
async fn referenced_elsewhere(
    dir: &Directory,
    frame: &Key,
) -> Result<(HashSet<Key>, HashSet<Key>), StoreError> {
    let mut vecs = HashSet::new();
    for key in dir.cluster_keys(KeyKind::Frame).await? {
        if &key == frame {
            continue;
        }
        match dir.get_frame(&key).await {
            Ok(other) => vecs.extend(other.vecs.iter().cloned()),
            // removed since it was listed
            Err(StoreError::NotFound { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    let mut chunks = HashSet::new();
    for key in &vecs {
        match dir.get_vector(key).await {
            Ok(v) => chunks.extend(v.chunks.iter().map(|c| c.key.clone())),
            Err(StoreError::NotFound { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok((vecs, chunks))
}

/// Decodes every column of `frame`
pub async fn read_frame(dir: &Directory, frame: &Key) -> Result<Vec<NamedColumn>, StoreError> {
    let f = dir.get_frame(frame).await?;
    let vectors = fetch_vectors(dir, &f.vecs).await?;
    let mut columns = Vec::with_capacity(vectors.len());
    for (v, name) in vectors.iter().zip(f.names.iter()) {
        columns.push(NamedColumn {
            name: name.clone(),
            data: read_vector(dir, v).await?,
            domain: v.domain.clone(),
        });
    }
    Ok(columns)
}

/// Decodes the column called `name` of `frame`
pub async fn read_column(
    dir: &Directory,
    frame: &Key,
    name: &str,
) -> Result<NamedColumn, StoreError> {
    let f = dir.get_frame(frame).await?;
    let idx = f.require_col("read column", name)?;
    let v = dir.get_vector(&f.vecs[idx]).await?;
    Ok(NamedColumn {
        name: name.to_string(),
        data: read_vector(dir, &v).await?,
        domain: v.domain.clone(),
    })
}

/// The value at `row` of column `col` of `frame`. Only the chunk holding
/// the row is fetched.
pub async fn get(dir: &Directory, frame: &Key, col: usize, row: usize) -> Result<Data, StoreError> {
    let f = dir.get_frame(frame).await?;
    let vec_key = f.vecs.get(col).ok_or(StoreError::ColIndexOutOfBounds(col))?;
    let idx = f
        .layout
        .chunk_of(row)
        .ok_or(StoreError::RowIndexOutOfBounds(row as u64))?;
    let v = dir.get_vector(vec_key).await?;
    let chunk_ref = &v.chunks[idx];
    let chunk = dir.get_chunk(&chunk_ref.key).await?;
    chunk
        .decode()?
        .get(row - chunk_ref.start)
        .ok_or(StoreError::RowIndexOutOfBounds(row as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{write_frame, WriteOptions};
    use crate::node::LocalCluster;
    use crate::NodeConfig;

    fn opts(rows_per_chunk: usize) -> WriteOptions {
        WriteOptions {
            rows_per_chunk,
            lossy_digits: None,
        }
    }

    fn numbers(name: &str, n: usize) -> NamedColumn {
        NamedColumn::numeric(name, (0..n).map(|i| Some(i as f64)).collect())
    }

    #[tokio::test]
    async fn test_slice_rows_reuses_interior_chunks() {
        let cluster = LocalCluster::new(2, NodeConfig::default());
        let dir = cluster.node(1).directory.clone();
        let key = write_frame(&dir, "f", vec![numbers("x", 100)], &opts(10))
            .await
            .unwrap();
        let sliced = slice_rows(&dir, &key, 15..47).await.unwrap();
        let frame = dir.get_frame(&sliced).await.unwrap();
        assert_eq!(frame.rows, 32);
        assert_eq!(frame.layout.starts, vec![0, 5, 15, 25, 32]);
        assert_eq!(frame.layout.homes, vec![2, 1, 2, 1]);

        let original = dir.get_frame(&key).await.unwrap();
        let old = dir.get_vector(&original.vecs[0]).await.unwrap();
        let new = dir.get_vector(&frame.vecs[0]).await.unwrap();
        // chunks 2 and 3 lie inside the range
        assert_ne!(new.chunks[0].key, old.chunks[1].key);
        assert_eq!(new.chunks[1].key, old.chunks[2].key);
        assert_eq!(new.chunks[2].key, old.chunks[3].key);
        assert_ne!(new.chunks[3].key, old.chunks[4].key);
        assert_eq!(new.chunks[0].key.home, old.chunks[1].key.home);
        assert_eq!(new.chunks[3].key.home, old.chunks[4].key.home);

        let col = read_column(&dir, &sliced, "x").await.unwrap();
        let expected: Vec<Option<f64>> = (15..47).map(|i| Some(i as f64)).collect();
        assert_eq!(col.data, ColumnData::Numeric(expected));
        assert_eq!(get(&dir, &sliced, 0, 0).await.unwrap(), Data::Num(15.0));
        assert_eq!(get(&dir, &sliced, 0, 31).await.unwrap(), Data::Num(46.0));
    }

    #[tokio::test]
    async fn test_slice_rows_bounds() {
        let cluster = LocalCluster::new(1, NodeConfig::default());
        let dir = cluster.node(1).directory.clone();
        let key = write_frame(&dir, "f", vec![numbers("x", 10)], &opts(4))
            .await
            .unwrap();
        assert!(matches!(
            slice_rows(&dir, &key, 5..11).await,
            Err(StoreError::RowIndexOutOfBounds(11))
        ));
        let empty = slice_rows(&dir, &key, 3..3).await.unwrap();
        let frame = dir.get_frame(&empty).await.unwrap();
        assert_eq!(frame.rows, 0);
        assert_eq!(frame.num_cols(), 1);
    }

    #[tokio::test]
    async fn test_slice_cols_shares_vectors() {
        let cluster = LocalCluster::new(2, NodeConfig::default());
        let dir = cluster.node(2).directory.clone();
        let key = write_frame(
            &dir,
            "f",
            vec![numbers("a", 20), numbers("b", 20), numbers("c", 20)],
            &opts(8),
        )
        .await
        .unwrap();
        let sliced = slice_cols(&dir, &key, &["c", "a"]).await.unwrap();
        let original = dir.get_frame(&key).await.unwrap();
        let frame = dir.get_frame(&sliced).await.unwrap();
        assert_eq!(frame.names, vec!["c".to_string(), "a".to_string()]);
        assert_eq!(frame.vecs, vec![original.vecs[2].clone(), original.vecs[0].clone()]);
        assert_eq!(frame.rows, 20);
        assert!(matches!(
            slice_cols(&dir, &key, &["d"]).await,
            Err(StoreError::SchemaMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_assemble_realigns_layouts() {
        let cluster = LocalCluster::new(2, NodeConfig::default());
        let dir = cluster.node(1).directory.clone();
        let a = write_frame(&dir, "a", vec![numbers("x", 30)], &opts(10))
            .await
            .unwrap();
        let b = write_frame(&dir, "b", vec![numbers("y", 30)], &opts(7))
            .await
            .unwrap();
        let c = write_frame(&dir, "c", vec![numbers("z", 29)], &opts(10))
            .await
            .unwrap();
        let fa = dir.get_frame(&a).await.unwrap();
        let fb = dir.get_frame(&b).await.unwrap();
        let fc = dir.get_frame(&c).await.unwrap();

        let key = assemble(
            &dir,
            "both",
            vec!["x".into(), "y".into()],
            vec![fa.vecs[0].clone(), fb.vecs[0].clone()],
        )
        .await
        .unwrap();
        let frame = dir.get_frame(&key).await.unwrap();
        assert_eq!(frame.layout, fa.layout);
        assert_eq!(frame.vecs[0], fa.vecs[0]);
        assert_ne!(frame.vecs[1], fb.vecs[0]);
        let y = dir.get_vector(&frame.vecs[1]).await.unwrap();
        assert_eq!(y.layout(), fa.layout);
        let cols = read_frame(&dir, &key).await.unwrap();
        assert_eq!(cols[0].data, cols[1].data);

        assert!(matches!(
            assemble(
                &dir,
                "bad",
                vec!["x".into(), "z".into()],
                vec![fa.vecs[0].clone(), fc.vecs[0].clone()],
            )
            .await,
            Err(StoreError::SchemaMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_rename_bumps_version() {
        let cluster = LocalCluster::new(2, NodeConfig::default());
        let dir = cluster.node(2).directory.clone();
        let key = write_frame(&dir, "f", vec![numbers("a", 5), numbers("b", 5)], &opts(2))
            .await
            .unwrap();
        rename(&cluster.node(1).directory, &key, "g").await.unwrap();
        rename_column(&dir, &key, "a", "c").await.unwrap();
        let frame = dir.get(&key).await.unwrap();
        assert_eq!(frame.version, 3);
        let frame = dir.get_frame(&key).await.unwrap();
        assert_eq!(frame.name, "g");
        assert_eq!(frame.names, vec!["c".to_string(), "b".to_string()]);
        assert!(rename_column(&dir, &key, "c", "b").await.is_err());
        assert!(rename_column(&dir, &key, "zz", "y").await.is_err());
    }

    #[tokio::test]
    async fn test_deep_remove() {
        let cluster = LocalCluster::new(2, NodeConfig::default());
        let dir = cluster.node(1).directory.clone();
        let key = write_frame(&dir, "f", vec![numbers("a", 25)], &opts(10))
            .await
            .unwrap();
        assert!(remove_frame(&dir, &key, true).await.unwrap());
        for id in 1..=2 {
            let d = &cluster.node(id).directory;
            assert!(d.local_keys(KeyKind::Chunk).await.is_empty());
            assert!(d.local_keys(KeyKind::Vec).await.is_empty());
            assert!(d.local_keys(KeyKind::Frame).await.is_empty());
        }
        assert!(!remove_frame(&dir, &key, true).await.unwrap());
        assert!(matches!(
            read_frame(&dir, &key).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_deep_remove_keeps_what_other_frames_use() {
        let cluster = LocalCluster::new(2, NodeConfig::default());
        let dir = cluster.node(1).directory.clone();
        let key = write_frame(&dir, "src", vec![numbers("x", 100), numbers("y", 100)], &opts(10))
            .await
            .unwrap();
        let rows = slice_rows(&dir, &key, 15..47).await.unwrap();
        let cols = slice_cols(&dir, &key, &["x"]).await.unwrap();
        assert!(remove_frame(&dir, &key, true).await.unwrap());

        let sliced = read_frame(&dir, &rows).await.unwrap();
        assert_eq!(
            sliced[1].data,
            ColumnData::Numeric((15..47).map(|i| Some(i as f64)).collect())
        );
        let narrowed = read_frame(&dir, &cols).await.unwrap();
        assert_eq!(narrowed[0].data, numbers("x", 100).data);

        // only the y chunks outside the row slice were unreferenced
        let src_gone = matches!(dir.get_frame(&key).await, Err(StoreError::NotFound { .. }));
        assert!(src_gone);
        let mut chunks = 0;
        for id in 1..=2 {
            chunks += cluster.node(id).directory.local_keys(KeyKind::Chunk).await.len();
        }
        // 10 x chunks, 2 interior y chunks and 4 re-encoded boundary chunks
        assert_eq!(chunks, 16);

        assert!(remove_frame(&dir, &rows, true).await.unwrap());
        assert!(remove_frame(&dir, &cols, true).await.unwrap());
        for id in 1..=2 {
            let d = &cluster.node(id).directory;
            assert!(d.local_keys(KeyKind::Chunk).await.is_empty());
            assert!(d.local_keys(KeyKind::Vec).await.is_empty());
        }
    }
}
