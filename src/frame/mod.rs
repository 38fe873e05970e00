//! A module for `Frame`s and `Vector`s, the metadata objects that tie
//! `Chunk`s together into columns and columns into tables.
//!
//! A `Vector` is one logical column: an ordered list of references to the
//! `Chunk`s holding its values. A `Frame` is an ordered list of `Vector`
//! keys that all share one `Layout`, so chunk `i` of every column covers the
//! same rows and lives on the same node.
//!
//! Neither object holds a reference back to what contains it. Both are
//! immutable once published, a change is a new version under the same key
//! or a new object under a new key.
use crate::chunk::{ColumnData, Data, ElementKind};
use crate::error::StoreError;
use crate::kv::Key;
use deepsize::DeepSizeOf;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::ops::Range;

mod ops;
mod writer;

pub use ops::{
    assemble, get, read_column, read_frame, remove_frame, rename,
    rename_column, slice_cols, slice_rows,
};
pub(crate) use ops::{fetch_vectors, read_vector};
pub use writer::{write_frame, WriteOptions};
pub(crate) use writer::{publish_frame, publish_vector, put_chunk, write_frame_under};

/// The partition of a frame's rows into chunks and the owner of each chunk
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, DeepSizeOf)]
pub struct Layout {
    /// Chunk `i` covers the rows `starts[i]..starts[i + 1]`, the last entry
    /// is the number of rows
    pub starts: Vec<usize>,
    /// Chunk `i` of every column is owned by the node `homes[i]`
    pub homes: Vec<usize>,
}

impl Layout {
    /// A layout with no rows and no chunks
    pub fn empty() -> Self {
        Layout {
            starts: vec![0],
            homes: Vec::new(),
        }
    }

    /// Splits `rows` rows into chunks of `rows_per_chunk` rows, chunk `i`
    /// being owned by the node `(i % num_nodes) + 1`
    pub fn uniform(rows: usize, rows_per_chunk: usize, num_nodes: usize) -> Self {
        let rows_per_chunk = rows_per_chunk.max(1);
        let mut starts = vec![0];
        let mut homes = Vec::new();
        let mut start = 0;
        while start < rows {
            start = (start + rows_per_chunk).min(rows);
            homes.push((homes.len() % num_nodes.max(1)) + 1);
            starts.push(start);
        }
        Layout { starts, homes }
    }

    pub fn num_chunks(&self) -> usize {
        self.homes.len()
    }

    pub fn rows(&self) -> usize {
        self.starts.last().copied().unwrap_or(0)
    }

    /// The rows covered by chunk `idx`
    pub fn range(&self, idx: usize) -> Range<usize> {
        self.starts[idx]..self.starts[idx + 1]
    }

    /// The index of the chunk holding `row`
    pub fn chunk_of(&self, row: usize) -> Option<usize> {
        if row >= self.rows() {
            return None;
        }
        // the first start strictly greater than `row`, minus one
        Some(self.starts.partition_point(|s| *s <= row) - 1)
    }

    /// The indices of the chunks owned by `node`
    pub fn chunks_on(&self, node: usize) -> Vec<usize> {
        (0..self.num_chunks())
            .filter(|i| self.homes[*i] == node)
            .collect()
    }

    /// Every node that owns at least one chunk, in ascending order
    pub fn nodes(&self) -> Vec<usize> {
        self.homes
            .iter()
            .copied()
            .collect::<BTreeSet<usize>>()
            .into_iter()
            .collect()
    }
}

/// A reference from a `Vector` to one of its chunks, with the chunk
/// metadata needed without fetching the chunk itself
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, DeepSizeOf)]
pub struct ChunkRef {
    pub key: Key,
    /// The first row of the column this chunk holds
    pub start: usize,
    pub rows: usize,
    /// The length of the chunk's compressed payload in bytes
    pub compressed_len: usize,
    /// The number of missing values in the chunk
    pub na_count: usize,
}

/// One logical column
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, DeepSizeOf)]
pub struct Vector {
    pub key: Key,
    pub kind: ElementKind,
    /// The number of elements, the sum of the rows of every chunk
    pub len: usize,
    /// The labels of a categorical column, level `i` has label `domain[i]`
    pub domain: Option<Vec<String>>,
    /// When set, chunks of this column may be stored with this many decimal
    /// digits of precision
    pub lossy_digits: Option<u8>,
    /// The chunks of this column in row order
    pub chunks: Vec<ChunkRef>,
}

impl Vector {
    /// The sum of the compressed length of every chunk
    pub fn byte_size(&self) -> usize {
        self.chunks.iter().map(|c| c.compressed_len).sum()
    }

    /// The number of missing values in this column
    pub fn na_count(&self) -> usize {
        self.chunks.iter().map(|c| c.na_count).sum()
    }

    /// The layout of this column's chunks
    pub fn layout(&self) -> Layout {
        let mut starts = vec![0];
        let mut homes = Vec::with_capacity(self.chunks.len());
        for c in &self.chunks {
            starts.push(c.start + c.rows);
            homes.push(c.key.home);
        }
        Layout { starts, homes }
    }

    /// The label of a categorical `level`
    pub fn label(&self, level: u32) -> Option<&str> {
        self.domain
            .as_ref()
            .and_then(|d| d.get(level as usize))
            .map(|s| s.as_str())
    }
}

/// A table of named columns that share a row count and chunk layout
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, DeepSizeOf)]
pub struct Frame {
    pub key: Key,
    pub name: String,
    pub rows: usize,
    /// The name of each column
    pub names: Vec<String>,
    /// The key of each column's `Vector`
    pub vecs: Vec<Key>,
    pub layout: Layout,
}

impl Frame {
    pub fn num_cols(&self) -> usize {
        self.vecs.len()
    }

    /// The index of the column called `name`
    pub fn col_idx(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// The index of the column called `name`, or a `SchemaMismatch` naming
    /// the operation `op` that needed it
    pub(crate) fn require_col(&self, op: &str, name: &str) -> Result<usize, StoreError> {
        self.col_idx(name).ok_or_else(|| {
            StoreError::schema(
                op,
                format!("frame {} has no column named {}", self.name, name),
            )
        })
    }
}

/// Fails with a `SchemaMismatch` if a name appears more than once
pub(crate) fn check_unique_names(op: &str, names: &[String]) -> Result<(), StoreError> {
    let mut seen = HashSet::new();
    for n in names {
        if !seen.insert(n.as_str()) {
            return Err(StoreError::schema(op, format!("duplicate column name {}", n)));
        }
    }
    Ok(())
}

/// A column of values held in memory, used to write new frames and as the
/// result of reading one
#[derive(Debug, Clone, PartialEq)]
pub struct NamedColumn {
    pub name: String,
    pub data: ColumnData,
    /// The labels of a categorical column
    pub domain: Option<Vec<String>>,
}

impl NamedColumn {
    pub fn numeric(name: &str, values: Vec<Option<f64>>) -> Self {
        NamedColumn {
            name: name.to_string(),
            data: ColumnData::Numeric(values),
            domain: None,
        }
    }

    /// A categorical column of `levels` into `domain`
    pub fn categorical(
        name: &str,
        levels: Vec<Option<u32>>,
        domain: Vec<String>,
    ) -> Self {
        NamedColumn {
            name: name.to_string(),
            data: ColumnData::Categorical(levels),
            domain: Some(domain),
        }
    }

    /// A categorical column whose domain is the sorted set of distinct
    /// `labels`
    pub fn categorical_from_labels(name: &str, labels: &[Option<&str>]) -> Self {
        let domain: Vec<String> = labels
            .iter()
            .flatten()
            .map(|s| s.to_string())
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect();
        let levels = labels
            .iter()
            .map(|l| {
                l.and_then(|l| {
                    domain
                        .binary_search_by(|d| d.as_str().cmp(l))
                        .ok()
                        .map(|i| i as u32)
                })
            })
            .collect();
        NamedColumn::categorical(name, levels, domain)
    }

    pub fn string(name: &str, values: Vec<Option<String>>) -> Self {
        NamedColumn {
            name: name.to_string(),
            data: ColumnData::String(values),
            domain: None,
        }
    }

    pub fn raw_bytes(name: &str, values: Vec<u8>) -> Self {
        NamedColumn {
            name: name.to_string(),
            data: ColumnData::RawBytes(values),
            domain: None,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The value at `idx`, with categorical levels turned into their label
    pub fn label_at(&self, idx: usize) -> Option<Data> {
        match (self.data.get(idx)?, &self.domain) {
            (Data::Cat(level), Some(domain)) => Some(
                domain
                    .get(level as usize)
                    .map(|l| Data::Str(l.clone()))
                    .unwrap_or(Data::Null),
            ),
            (d, _) => Some(d),
        }
    }

    /// Checks that a categorical column has a domain covering every level
    pub(crate) fn validate(&self, op: &str) -> Result<(), StoreError> {
        match (&self.data, &self.domain) {
            (ColumnData::Categorical(levels), Some(domain)) => {
                match levels.iter().flatten().find(|l| **l as usize >= domain.len()) {
                    Some(l) => Err(StoreError::schema(
                        op,
                        format!(
                            "level {} of column {} is outside its domain of {} labels",
                            l,
                            self.name,
                            domain.len()
                        ),
                    )),
                    None => Ok(()),
                }
            }
            (ColumnData::Categorical(_), None) => Err(StoreError::schema(
                op,
                format!("categorical column {} has no domain", self.name),
            )),
            (_, Some(_)) => Err(StoreError::schema(
                op,
                format!("only categorical columns have a domain, {} is {}", self.name, self.data.kind()),
            )),
            _ => Ok(()),
        }
    }
}
