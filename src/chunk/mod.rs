//! A module for the values stored in a column and the compressed `Chunk`s
//! they are stored as.
//!
//! Every `Vector` (one logical column) is cut into `Chunk`s that each cover a
//! fixed range of rows. A `Chunk` is encoded independently of every other
//! chunk: on construction it tries each [`Encoding`] that applies to its
//! values and keeps the one with the smallest payload, so a chunk of a
//! mostly-constant column can be a handful of bytes while its neighbour holds
//! raw `f64`s.
//!
//! Chunks live in the `Directory` of the node that owns them, which makes
//! the `Directory` partition of each node that node's chunk store.
use crate::error::StoreError;
use crate::kv::Key;
use deepsize::DeepSizeOf;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

mod encoding;
pub use encoding::{EncodeOptions, Encoding};

/// The type of every element of a `Vector`
#[derive(
    Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Hash, DeepSizeOf,
)]
pub enum ElementKind {
    /// 64-bit floating point numbers, `NaN` is read as a missing value
    Numeric,
    /// Indices into the level names (domain) of the `Vector`
    Categorical,
    /// Arbitrary strings
    String,
    /// Uninterpreted bytes, one element per byte, never missing
    RawBytes,
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ElementKind::Numeric => write!(f, "numeric"),
            ElementKind::Categorical => write!(f, "categorical"),
            ElementKind::String => write!(f, "string"),
            ElementKind::RawBytes => write!(f, "raw-bytes"),
        }
    }
}

/// A single boxed value from a column.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, DeepSizeOf)]
pub enum Data {
    Num(f64),
    Cat(u32),
    Str(String),
    Byte(u8),
    Null,
}

impl Data {
    /// Whether this is a missing value
    pub fn is_null(&self) -> bool {
        matches!(self, Data::Null)
    }

    /// The kind of column this value can be stored in, `None` for `Null`
    pub fn kind(&self) -> Option<ElementKind> {
        match self {
            Data::Num(_) => Some(ElementKind::Numeric),
            Data::Cat(_) => Some(ElementKind::Categorical),
            Data::Str(_) => Some(ElementKind::String),
            Data::Byte(_) => Some(ElementKind::RawBytes),
            Data::Null => None,
        }
    }
}

impl fmt::Display for Data {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Data::Num(x) => write!(f, "{}", x),
            Data::Cat(x) => write!(f, "#{}", x),
            Data::Str(x) => write!(f, "\"{}\"", x),
            Data::Byte(x) => write!(f, "0x{:02x}", x),
            Data::Null => write!(f, "NA"),
        }
    }
}

/// The decoded values of a column, or of a range of rows of a column.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, DeepSizeOf)]
pub enum ColumnData {
    Numeric(Vec<Option<f64>>),
    Categorical(Vec<Option<u32>>),
    String(Vec<Option<String>>),
    RawBytes(Vec<u8>),
}

impl ColumnData {
    /// Creates an empty column of the given `kind`
    pub fn empty(kind: ElementKind) -> Self {
        match kind {
            ElementKind::Numeric => ColumnData::Numeric(Vec::new()),
            ElementKind::Categorical => ColumnData::Categorical(Vec::new()),
            ElementKind::String => ColumnData::String(Vec::new()),
            ElementKind::RawBytes => ColumnData::RawBytes(Vec::new()),
        }
    }

    /// Creates a column of the given `kind` holding `values`.
    ///
    /// ## Errors
    /// `SchemaMismatch` if any value can not be stored in a column of `kind`
    pub fn from_data(
        kind: ElementKind,
        values: Vec<Data>,
    ) -> Result<Self, StoreError> {
        let mut col = ColumnData::empty(kind);
        for v in values {
            col.push(v)?;
        }
        Ok(col)
    }

    /// The kind of the elements of this column
    pub fn kind(&self) -> ElementKind {
        match self {
            ColumnData::Numeric(_) => ElementKind::Numeric,
            ColumnData::Categorical(_) => ElementKind::Categorical,
            ColumnData::String(_) => ElementKind::String,
            ColumnData::RawBytes(_) => ElementKind::RawBytes,
        }
    }

    /// The number of elements in this column
    pub fn len(&self) -> usize {
        match self {
            ColumnData::Numeric(c) => c.len(),
            ColumnData::Categorical(c) => c.len(),
            ColumnData::String(c) => c.len(),
            ColumnData::RawBytes(c) => c.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the `Data` at the given `idx`, or `None` if `idx` is out of bounds
    pub fn get(&self, idx: usize) -> Option<Data> {
        match self {
            ColumnData::Numeric(c) => c.get(idx).map(|v| match v {
                Some(x) if !x.is_nan() => Data::Num(*x),
                _ => Data::Null,
            }),
            ColumnData::Categorical(c) => c.get(idx).map(|v| match v {
                Some(x) => Data::Cat(*x),
                None => Data::Null,
            }),
            ColumnData::String(c) => c.get(idx).map(|v| match v {
                Some(x) => Data::Str(x.clone()),
                None => Data::Null,
            }),
            ColumnData::RawBytes(c) => c.get(idx).map(|b| Data::Byte(*b)),
        }
    }

    /// The number of missing values in this column
    pub fn na_count(&self) -> usize {
        match self {
            ColumnData::Numeric(c) => c
                .iter()
                .filter(|v| v.map(|x| x.is_nan()).unwrap_or(true))
                .count(),
            ColumnData::Categorical(c) => {
                c.iter().filter(|v| v.is_none()).count()
            }
            ColumnData::String(c) => c.iter().filter(|v| v.is_none()).count(),
            ColumnData::RawBytes(_) => 0,
        }
    }

    /// Copies the rows in `range` into a new column. The range is clamped to
    /// the length of this column.
    pub fn slice(&self, range: Range<usize>) -> Self {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        match self {
            ColumnData::Numeric(c) => ColumnData::Numeric(c[start..end].to_vec()),
            ColumnData::Categorical(c) => {
                ColumnData::Categorical(c[start..end].to_vec())
            }
            ColumnData::String(c) => ColumnData::String(c[start..end].to_vec()),
            ColumnData::RawBytes(c) => {
                ColumnData::RawBytes(c[start..end].to_vec())
            }
        }
    }

    /// Appends the values of `other` to the end of this column.
    ///
    /// ## Errors
    /// `SchemaMismatch` if `other` is a different kind of column
    pub fn append(&mut self, other: ColumnData) -> Result<(), StoreError> {
        match (self, other) {
            (ColumnData::Numeric(a), ColumnData::Numeric(b)) => a.extend(b),
            (ColumnData::Categorical(a), ColumnData::Categorical(b)) => {
                a.extend(b)
            }
            (ColumnData::String(a), ColumnData::String(b)) => a.extend(b),
            (ColumnData::RawBytes(a), ColumnData::RawBytes(b)) => a.extend(b),
            (a, b) => {
                return Err(StoreError::schema(
                    "append",
                    format!("can not append {} to {}", b.kind(), a.kind()),
                ))
            }
        }
        Ok(())
    }

    /// Appends a single value to the end of this column.
    ///
    /// ## Errors
    /// `SchemaMismatch` if `data` can not be stored in this kind of column
    pub fn push(&mut self, data: Data) -> Result<(), StoreError> {
        match (self, data) {
            (ColumnData::Numeric(c), Data::Num(x)) => c.push(Some(x)),
            (ColumnData::Numeric(c), Data::Null) => c.push(None),
            (ColumnData::Categorical(c), Data::Cat(x)) => c.push(Some(x)),
            (ColumnData::Categorical(c), Data::Null) => c.push(None),
            (ColumnData::String(c), Data::Str(x)) => c.push(Some(x)),
            (ColumnData::String(c), Data::Null) => c.push(None),
            (ColumnData::RawBytes(c), Data::Byte(x)) => c.push(x),
            (c, d) => {
                return Err(StoreError::schema(
                    "push",
                    format!("can not store {} in a {} column", d, c.kind()),
                ))
            }
        }
        Ok(())
    }
}

/// A contiguous, independently compressed run of one column's values.
///
/// `bytes` is the compressed payload and its length is the footprint that
/// is reported for this chunk. The parameters the payload needs to be read
/// back (a constant, a minimum, a width) live in `encoding`.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, DeepSizeOf)]
pub struct Chunk {
    /// The key of this chunk, `key.home` is the node that owns it
    pub key: Key,
    /// The kind of every element of this chunk
    pub kind: ElementKind,
    /// The number of rows this chunk holds
    pub rows: usize,
    /// How `bytes` is laid out
    pub encoding: Encoding,
    /// Whether decoding only approximates the values that were encoded
    pub lossy: bool,
    /// The compressed payload
    pub bytes: Vec<u8>,
}

impl Chunk {
    /// Compresses `data` into a new `Chunk`, choosing the encoding with the
    /// smallest payload.
    ///
    /// ## Errors
    /// `EncodingFailure` if the values can not be represented, e.g. a
    /// categorical level equal to the reserved missing-value sentinel
    pub fn encode(
        key: Key,
        data: &ColumnData,
        opts: &EncodeOptions,
    ) -> Result<Self, StoreError> {
        let (encoding, bytes, lossy) = encoding::encode(data, opts)
            .map_err(|detail| StoreError::encoding(&key, detail))?;
        Ok(Chunk {
            key,
            kind: data.kind(),
            rows: data.len(),
            encoding,
            lossy,
            bytes,
        })
    }

    /// Decompresses this chunk.
    ///
    /// ## Errors
    /// `EncodingFailure` if the payload is inconsistent with the encoding
    pub fn decode(&self) -> Result<ColumnData, StoreError> {
        encoding::decode(self.kind, self.rows, &self.encoding, &self.bytes)
            .map_err(|detail| StoreError::encoding(&self.key, detail))
    }

    /// The length of the compressed payload in bytes
    pub fn compressed_len(&self) -> usize {
        self.bytes.len()
    }

    /// The id of the node that owns this chunk
    pub fn home(&self) -> usize {
        self.key.home
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KeyKind;

    fn key() -> Key {
        Key::new("c", 1, KeyKind::Chunk)
    }

    #[test]
    fn test_get_and_na_count() {
        let c = ColumnData::Numeric(vec![Some(1.0), None, Some(f64::NAN)]);
        assert_eq!(c.get(0), Some(Data::Num(1.0)));
        assert_eq!(c.get(1), Some(Data::Null));
        assert_eq!(c.get(2), Some(Data::Null));
        assert_eq!(c.get(3), None);
        assert_eq!(c.na_count(), 2);
    }

    #[test]
    fn test_append_kind_mismatch() {
        let mut a = ColumnData::Numeric(vec![Some(1.0)]);
        let b = ColumnData::String(vec![None]);
        assert!(matches!(
            a.append(b),
            Err(StoreError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_slice_clamps() {
        let c = ColumnData::RawBytes(b"hello".to_vec());
        assert_eq!(c.slice(1..3), ColumnData::RawBytes(b"el".to_vec()));
        assert_eq!(c.slice(3..10), ColumnData::RawBytes(b"lo".to_vec()));
    }

    #[test]
    fn test_from_data_rejects_wrong_kind() {
        let vals = vec![Data::Str("a".to_string()), Data::Num(2.0)];
        assert!(ColumnData::from_data(ElementKind::String, vals).is_err());
    }

    #[test]
    fn test_chunk_records_compressed_len() {
        let data = ColumnData::Numeric((0..1000).map(|x| Some(x as f64)).collect());
        let chunk = Chunk::encode(key(), &data, &EncodeOptions::default())
            .unwrap();
        assert_eq!(chunk.compressed_len(), chunk.bytes.len());
        assert_eq!(chunk.rows, 1000);
        assert!(chunk.compressed_len() < 1000 * 8);
        assert_eq!(chunk.decode().unwrap(), data);
    }

    #[test]
    fn test_corrupted_payload_fails() {
        let data = ColumnData::Numeric((0..100).map(|x| Some(x as f64)).collect());
        let mut chunk =
            Chunk::encode(key(), &data, &EncodeOptions::default()).unwrap();
        chunk.bytes.truncate(chunk.bytes.len() - 1);
        assert!(matches!(
            chunk.decode(),
            Err(StoreError::EncodingFailure { .. })
        ));
    }
}
