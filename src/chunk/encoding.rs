//! Chunk encodings and the selection of the smallest one.
use crate::chunk::{ColumnData, Data, ElementKind};
use deepsize::DeepSizeOf;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Integers above this magnitude are not exactly representable as `f64`
const MAX_EXACT_INT: f64 = 9_007_199_254_740_992.0; // 2^53
/// The largest decimal scale tried when looking for a delta encoding
const MAX_DECIMAL_EXPONENT: i32 = 6;
/// The packed widths tried, in bytes
const WIDTHS: [u8; 3] = [1, 2, 4];
/// The sentinel for a missing categorical level or string
const NA_U32: u32 = u32::MAX;

/// How the payload of a `Chunk` is laid out. Parameters needed to decode
/// the payload are stored here, the values themselves in `Chunk::bytes`.
#[derive(Serialize, Deserialize, PartialEq, Clone, Debug, DeepSizeOf)]
pub enum Encoding {
    /// Every row holds the same value, the payload is empty
    Constant(Data),
    /// Signed integers packed into `width` bytes, the smallest value of the
    /// width marks a missing row
    SmallInt { width: u8 },
    /// Offsets from `min` packed into `width` bytes, scaled by
    /// `10^exponent` (`exponent <= 0`), the largest offset of the width marks
    /// a missing row
    DeltaOfMin { min: i64, exponent: i8, width: u8 },
    /// All rows hold `default` except `entries` (row index, value) pairs
    Sparse { default: Data, entries: u32 },
    /// Like `DeltaOfMin` but values are rounded to `digits` decimal digits,
    /// decoding is only accurate to `10^-digits`
    QuantizedFloat { min: i64, digits: u8, width: u8 },
    /// Values stored uncompressed
    Raw,
}

/// Options that control which encodings a chunk may choose from.
#[derive(
    Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug, Default, DeepSizeOf,
)]
pub struct EncodeOptions {
    /// When set, numeric chunks may use the lossy `QuantizedFloat` encoding
    /// rounding values to this many decimal digits
    pub lossy_digits: Option<u8>,
}

type Candidate = (Encoding, Vec<u8>, bool);

/// Encodes `data` with the candidate that has the smallest payload. The
/// candidates are tried in a fixed order and the first of equally sized
/// payloads wins, so lossless encodings are preferred over lossy ones.
pub(crate) fn encode(
    data: &ColumnData,
    opts: &EncodeOptions,
) -> Result<Candidate, String> {
    let candidates = match data {
        ColumnData::Numeric(vals) => numeric_candidates(vals, opts),
        ColumnData::Categorical(vals) => categorical_candidates(vals)?,
        ColumnData::String(vals) => string_candidates(vals)?,
        ColumnData::RawBytes(vals) => raw_byte_candidates(vals),
    };
    let mut best: Option<Candidate> = None;
    for c in candidates {
        match &best {
            Some((_, bytes, _)) if bytes.len() <= c.1.len() => (),
            _ => best = Some(c),
        }
    }
    best.ok_or_else(|| "no applicable encoding".to_string())
}

/// Decodes `rows` values of `kind` from `bytes`.
pub(crate) fn decode(
    kind: ElementKind,
    rows: usize,
    encoding: &Encoding,
    bytes: &[u8],
) -> Result<ColumnData, String> {
    match encoding {
        Encoding::Constant(value) => {
            if !bytes.is_empty() {
                return Err("constant chunk with a payload".to_string());
            }
            decode_constant(kind, rows, value)
        }
        Encoding::SmallInt { width } => {
            let ints = unpack_signed(bytes, rows, *width)?;
            ints_to_column(kind, ints, 0)
        }
        Encoding::DeltaOfMin {
            min,
            exponent,
            width,
        } => {
            let ints = unpack_offsets(bytes, rows, *min, *width)?;
            ints_to_column(kind, ints, -(*exponent as i32))
        }
        Encoding::QuantizedFloat { min, digits, width } => {
            if kind != ElementKind::Numeric {
                return Err(format!("quantized encoding for a {} chunk", kind));
            }
            let ints = unpack_offsets(bytes, rows, *min, *width)?;
            ints_to_column(kind, ints, *digits as i32)
        }
        Encoding::Sparse { default, entries } => {
            decode_sparse(kind, rows, default, *entries as usize, bytes)
        }
        Encoding::Raw => decode_raw(kind, rows, bytes),
    }
}

fn numeric_candidates(
    vals: &[Option<f64>],
    opts: &EncodeOptions,
) -> Vec<Candidate> {
    // NaN is how a missing value is stored, so it is read back as one
    let vals: Vec<Option<f64>> =
        vals.iter().map(|v| v.filter(|x| !x.is_nan())).collect();
    let mut candidates = Vec::new();
    if let Some(first) = vals.first() {
        if vals.iter().all(|v| same_num(v, first)) {
            let value = match first {
                Some(x) => Data::Num(*x),
                None => Data::Null,
            };
            candidates.push((Encoding::Constant(value), Vec::new(), false));
        }
    } else {
        candidates.push((Encoding::Constant(Data::Null), Vec::new(), false));
    }
    let exact_ints: Option<Vec<Option<i64>>> = vals
        .iter()
        .map(|v| match v {
            Some(x) => exact_scaled(*x, 0).map(Some),
            None => Some(None),
        })
        .collect();
    if let Some(ints) = &exact_ints {
        if let Some(c) = small_int(ints) {
            candidates.push(c);
        }
    }
    for exponent in 0..=MAX_DECIMAL_EXPONENT {
        let scaled: Option<Vec<Option<i64>>> = vals
            .iter()
            .map(|v| match v {
                Some(x) => exact_scaled(*x, exponent).map(Some),
                None => Some(None),
            })
            .collect();
        if let Some(ints) = scaled {
            if let Some((min, width, bytes)) = delta_of_min(&ints) {
                let encoding = Encoding::DeltaOfMin {
                    min,
                    exponent: -(exponent as i8),
                    width,
                };
                candidates.push((encoding, bytes, false));
            }
            // a smaller exponent always packs at least as tightly
            break;
        }
    }
    if let Some(c) = sparse(&vals, |v| v.map(f64::to_bits), |v, buf| {
        let bits = v.unwrap_or(f64::NAN).to_bits();
        buf.extend_from_slice(&bits.to_le_bytes());
    }) {
        let (default, entries, bytes) = c;
        let default = match default {
            Some(x) => Data::Num(*x),
            None => Data::Null,
        };
        candidates.push((Encoding::Sparse { default, entries }, bytes, false));
    }
    if let Some(digits) = opts.lossy_digits {
        let rounded: Option<Vec<Option<i64>>> = vals
            .iter()
            .map(|v| match v {
                Some(x) => rounded_scaled(*x, digits as i32).map(Some),
                None => Some(None),
            })
            .collect();
        if let Some(ints) = rounded {
            if let Some((min, width, bytes)) = delta_of_min(&ints) {
                let encoding = Encoding::QuantizedFloat { min, digits, width };
                candidates.push((encoding, bytes, true));
            }
        }
    }
    let mut raw = Vec::with_capacity(vals.len() * 8);
    for v in &vals {
        raw.extend_from_slice(&v.unwrap_or(f64::NAN).to_bits().to_le_bytes());
    }
    candidates.push((Encoding::Raw, raw, false));
    candidates
}

fn categorical_candidates(
    vals: &[Option<u32>],
) -> Result<Vec<Candidate>, String> {
    if vals.iter().any(|v| *v == Some(NA_U32)) {
        return Err(format!("categorical level {} is reserved", NA_U32));
    }
    let mut candidates = Vec::new();
    match vals.first() {
        Some(first) => {
            if vals.iter().all(|v| v == first) {
                let value = match first {
                    Some(x) => Data::Cat(*x),
                    None => Data::Null,
                };
                candidates.push((Encoding::Constant(value), Vec::new(), false));
            }
        }
        None => {
            candidates.push((Encoding::Constant(Data::Null), Vec::new(), false))
        }
    }
    let ints: Vec<Option<i64>> =
        vals.iter().map(|v| v.map(|x| x as i64)).collect();
    if let Some(c) = small_int(&ints) {
        candidates.push(c);
    }
    if let Some((min, width, bytes)) = delta_of_min(&ints) {
        let encoding = Encoding::DeltaOfMin {
            min,
            exponent: 0,
            width,
        };
        candidates.push((encoding, bytes, false));
    }
    if let Some((default, entries, bytes)) = sparse(vals, |v| *v, |v, buf| {
        buf.extend_from_slice(&v.unwrap_or(NA_U32).to_le_bytes())
    }) {
        let default = match default {
            Some(x) => Data::Cat(*x),
            None => Data::Null,
        };
        candidates.push((Encoding::Sparse { default, entries }, bytes, false));
    }
    let mut raw = Vec::with_capacity(vals.len() * 4);
    for v in vals {
        raw.extend_from_slice(&v.unwrap_or(NA_U32).to_le_bytes());
    }
    candidates.push((Encoding::Raw, raw, false));
    Ok(candidates)
}

fn string_candidates(
    vals: &[Option<String>],
) -> Result<Vec<Candidate>, String> {
    if vals
        .iter()
        .any(|v| v.as_ref().map(|s| s.len() >= NA_U32 as usize).unwrap_or(false))
    {
        return Err("string too long to encode".to_string());
    }
    let mut candidates = Vec::new();
    match vals.first() {
        Some(first) => {
            if vals.iter().all(|v| v == first) {
                let value = match first {
                    Some(x) => Data::Str(x.clone()),
                    None => Data::Null,
                };
                candidates.push((Encoding::Constant(value), Vec::new(), false));
            }
        }
        None => {
            candidates.push((Encoding::Constant(Data::Null), Vec::new(), false))
        }
    }
    if let Some((default, entries, bytes)) =
        sparse(vals, |v| v.clone(), |v, buf| write_str(v, buf))
    {
        let default = match default {
            Some(x) => Data::Str(x.clone()),
            None => Data::Null,
        };
        candidates.push((Encoding::Sparse { default, entries }, bytes, false));
    }
    let mut raw = Vec::new();
    for v in vals {
        write_str(v, &mut raw);
    }
    candidates.push((Encoding::Raw, raw, false));
    Ok(candidates)
}

fn raw_byte_candidates(vals: &[u8]) -> Vec<Candidate> {
    let mut candidates = Vec::new();
    match vals.first() {
        Some(first) if vals.iter().all(|b| b == first) => candidates.push((
            Encoding::Constant(Data::Byte(*first)),
            Vec::new(),
            false,
        )),
        None => {
            candidates.push((Encoding::Constant(Data::Null), Vec::new(), false))
        }
        _ => (),
    }
    candidates.push((Encoding::Raw, vals.to_vec(), false));
    candidates
}

fn same_num(a: &Option<f64>, b: &Option<f64>) -> bool {
    a.map(f64::to_bits) == b.map(f64::to_bits)
}

fn pow10(exponent: i32) -> f64 {
    10f64.powi(exponent)
}

/// `x * 10^exponent` as an integer, only if dividing it back out reproduces
/// `x` bit for bit.
fn exact_scaled(x: f64, exponent: i32) -> Option<i64> {
    let scaled = (x * pow10(exponent)).round();
    if !scaled.is_finite() || scaled.abs() >= MAX_EXACT_INT {
        return None;
    }
    let i = scaled as i64;
    if unscale(i, exponent).to_bits() == x.to_bits() {
        Some(i)
    } else {
        None
    }
}

/// `x * 10^digits` rounded to the nearest integer.
fn rounded_scaled(x: f64, digits: i32) -> Option<i64> {
    let scaled = (x * pow10(digits)).round();
    if !scaled.is_finite() || scaled.abs() >= MAX_EXACT_INT {
        None
    } else {
        Some(scaled as i64)
    }
}

fn unscale(i: i64, exponent: i32) -> f64 {
    if exponent == 0 {
        i as f64
    } else {
        i as f64 / pow10(exponent)
    }
}

fn small_int(ints: &[Option<i64>]) -> Option<Candidate> {
    let (lo, hi) = bounds(ints)?;
    for width in WIDTHS.iter() {
        let bits = 8 * *width as u32;
        let na = -(1i64 << (bits - 1));
        let max = (1i64 << (bits - 1)) - 1;
        if lo > na && hi <= max {
            let mut buf = Vec::with_capacity(ints.len() * *width as usize);
            for v in ints {
                write_uint(&mut buf, v.unwrap_or(na) as u64, *width);
            }
            return Some((Encoding::SmallInt { width: *width }, buf, false));
        }
    }
    None
}

fn delta_of_min(ints: &[Option<i64>]) -> Option<(i64, u8, Vec<u8>)> {
    let (lo, hi) = bounds(ints)?;
    let range = hi as i128 - lo as i128;
    for width in WIDTHS.iter() {
        let na = (1i128 << (8 * *width as u32)) - 1;
        if range < na {
            let mut buf = Vec::with_capacity(ints.len() * *width as usize);
            for v in ints {
                let off = match v {
                    Some(x) => (*x as i128 - lo as i128) as u64,
                    None => na as u64,
                };
                write_uint(&mut buf, off, *width);
            }
            return Some((lo, *width, buf));
        }
    }
    None
}

/// The smallest and largest present value, `(0, 0)` if every value is
/// missing, `None` if there are no values.
fn bounds(ints: &[Option<i64>]) -> Option<(i64, i64)> {
    if ints.is_empty() {
        return None;
    }
    let mut present = ints.iter().flatten();
    match present.next() {
        None => Some((0, 0)),
        Some(first) => Some(
            present.fold((*first, *first), |(lo, hi), x| (lo.min(*x), hi.max(*x))),
        ),
    }
}

/// Builds a sparse payload when strictly more than 90% of the rows hold the
/// same value. Returns the default value, the number of entries and the
/// payload of `(u32 row index, value)` entries.
fn sparse<'a, T, K, F, W>(
    vals: &'a [T],
    key_of: F,
    write_value: W,
) -> Option<(&'a T, u32, Vec<u8>)>
where
    K: std::hash::Hash + Eq,
    F: Fn(&T) -> K,
    W: Fn(&T, &mut Vec<u8>),
{
    if vals.is_empty() || vals.len() > u32::MAX as usize {
        return None;
    }
    let mut counts: HashMap<K, (usize, usize)> = HashMap::new();
    for (idx, v) in vals.iter().enumerate() {
        counts.entry(key_of(v)).or_insert((0, idx)).0 += 1;
    }
    // ties go to the value seen first so the choice is deterministic
    let (count, first_idx) = counts
        .values()
        .copied()
        .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))?;
    if count * 10 <= vals.len() * 9 {
        return None;
    }
    let default_key = key_of(&vals[first_idx]);
    let mut buf = Vec::new();
    let mut entries = 0u32;
    for (idx, v) in vals.iter().enumerate() {
        if key_of(v) != default_key {
            buf.extend_from_slice(&(idx as u32).to_le_bytes());
            write_value(v, &mut buf);
            entries += 1;
        }
    }
    Some((&vals[first_idx], entries, buf))
}

fn write_uint(buf: &mut Vec<u8>, v: u64, width: u8) {
    buf.extend_from_slice(&v.to_le_bytes()[..width as usize]);
}

fn read_uint(bytes: &[u8], width: u8) -> u64 {
    let mut le = [0u8; 8];
    le[..width as usize].copy_from_slice(&bytes[..width as usize]);
    u64::from_le_bytes(le)
}

fn write_str(v: &Option<String>, buf: &mut Vec<u8>) {
    match v {
        Some(s) => {
            buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }
        None => buf.extend_from_slice(&NA_U32.to_le_bytes()),
    }
}

/// A cursor over a payload that reports truncation instead of panicking
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.bytes.len() - self.pos < n {
            return Err(format!(
                "payload truncated at byte {} of {}",
                self.pos,
                self.bytes.len()
            ));
        }
        let s = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(read_uint(self.take(4)?, 4) as u32)
    }

    fn u64(&mut self) -> Result<u64, String> {
        Ok(read_uint(self.take(8)?, 8))
    }

    fn string(&mut self) -> Result<Option<String>, String> {
        let len = self.u32()?;
        if len == NA_U32 {
            return Ok(None);
        }
        let raw = self.take(len as usize)?;
        String::from_utf8(raw.to_vec())
            .map(Some)
            .map_err(|e| format!("invalid utf-8 in string payload: {}", e))
    }

    fn finish(&self) -> Result<(), String> {
        if self.pos == self.bytes.len() {
            Ok(())
        } else {
            Err(format!(
                "{} trailing bytes in payload",
                self.bytes.len() - self.pos
            ))
        }
    }
}

fn check_width(width: u8) -> Result<(), String> {
    if WIDTHS.contains(&width) {
        Ok(())
    } else {
        Err(format!("invalid packed width {}", width))
    }
}

fn check_len(bytes: &[u8], rows: usize, width: u8) -> Result<(), String> {
    if bytes.len() != rows * width as usize {
        Err(format!(
            "expected {} bytes for {} rows of width {}, found {}",
            rows * width as usize,
            rows,
            width,
            bytes.len()
        ))
    } else {
        Ok(())
    }
}

fn unpack_signed(
    bytes: &[u8],
    rows: usize,
    width: u8,
) -> Result<Vec<Option<i64>>, String> {
    check_width(width)?;
    check_len(bytes, rows, width)?;
    let shift = 64 - 8 * width as u32;
    let na = -(1i64 << (8 * width as u32 - 1));
    Ok(bytes
        .chunks_exact(width as usize)
        .map(|b| {
            let v = ((read_uint(b, width) << shift) as i64) >> shift;
            if v == na {
                None
            } else {
                Some(v)
            }
        })
        .collect())
}

fn unpack_offsets(
    bytes: &[u8],
    rows: usize,
    min: i64,
    width: u8,
) -> Result<Vec<Option<i64>>, String> {
    check_width(width)?;
    check_len(bytes, rows, width)?;
    let na = (1u64 << (8 * width as u32)) - 1;
    bytes
        .chunks_exact(width as usize)
        .map(|b| {
            let off = read_uint(b, width);
            if off == na {
                Ok(None)
            } else {
                min.checked_add(off as i64)
                    .map(Some)
                    .ok_or_else(|| "offset overflows".to_string())
            }
        })
        .collect()
}

fn ints_to_column(
    kind: ElementKind,
    ints: Vec<Option<i64>>,
    exponent: i32,
) -> Result<ColumnData, String> {
    match kind {
        ElementKind::Numeric => Ok(ColumnData::Numeric(
            ints.into_iter()
                .map(|v| v.map(|i| unscale(i, exponent)))
                .collect(),
        )),
        ElementKind::Categorical => {
            if exponent != 0 {
                return Err("scaled encoding for a categorical chunk".into());
            }
            let codes: Result<Vec<Option<u32>>, String> = ints
                .into_iter()
                .map(|v| match v {
                    Some(i) if i >= 0 && i < NA_U32 as i64 => Ok(Some(i as u32)),
                    Some(i) => Err(format!("invalid categorical level {}", i)),
                    None => Ok(None),
                })
                .collect();
            Ok(ColumnData::Categorical(codes?))
        }
        other => Err(format!("integer encoding for a {} chunk", other)),
    }
}

fn decode_constant(
    kind: ElementKind,
    rows: usize,
    value: &Data,
) -> Result<ColumnData, String> {
    match (kind, value) {
        (ElementKind::Numeric, Data::Num(x)) => {
            Ok(ColumnData::Numeric(vec![Some(*x); rows]))
        }
        (ElementKind::Numeric, Data::Null) => {
            Ok(ColumnData::Numeric(vec![None; rows]))
        }
        (ElementKind::Categorical, Data::Cat(x)) => {
            Ok(ColumnData::Categorical(vec![Some(*x); rows]))
        }
        (ElementKind::Categorical, Data::Null) => {
            Ok(ColumnData::Categorical(vec![None; rows]))
        }
        (ElementKind::String, Data::Str(x)) => {
            Ok(ColumnData::String(vec![Some(x.clone()); rows]))
        }
        (ElementKind::String, Data::Null) => {
            Ok(ColumnData::String(vec![None; rows]))
        }
        (ElementKind::RawBytes, Data::Byte(x)) => {
            Ok(ColumnData::RawBytes(vec![*x; rows]))
        }
        (ElementKind::RawBytes, Data::Null) if rows == 0 => {
            Ok(ColumnData::RawBytes(Vec::new()))
        }
        (kind, value) => {
            Err(format!("constant {} in a {} chunk", value, kind))
        }
    }
}

fn decode_sparse(
    kind: ElementKind,
    rows: usize,
    default: &Data,
    entries: usize,
    bytes: &[u8],
) -> Result<ColumnData, String> {
    if kind == ElementKind::RawBytes {
        return Err("sparse encoding for a raw-bytes chunk".to_string());
    }
    let mut col = decode_constant(kind, rows, default)?;
    let mut reader = Reader::new(bytes);
    let mut last: Option<usize> = None;
    for _ in 0..entries {
        let idx = reader.u32()? as usize;
        if idx >= rows || last.map(|l| idx <= l).unwrap_or(false) {
            return Err(format!("sparse row index {} is out of order", idx));
        }
        last = Some(idx);
        match &mut col {
            ColumnData::Numeric(c) => {
                let x = f64::from_bits(reader.u64()?);
                c[idx] = if x.is_nan() { None } else { Some(x) };
            }
            ColumnData::Categorical(c) => {
                let x = reader.u32()?;
                c[idx] = if x == NA_U32 { None } else { Some(x) };
            }
            ColumnData::String(c) => c[idx] = reader.string()?,
            ColumnData::RawBytes(_) => return Err("raw bytes are never sparse".to_string()),
        }
    }
    reader.finish()?;
    Ok(col)
}

fn decode_raw(
    kind: ElementKind,
    rows: usize,
    bytes: &[u8],
) -> Result<ColumnData, String> {
    match kind {
        ElementKind::Numeric => {
            check_len(bytes, rows, 8)?;
            Ok(ColumnData::Numeric(
                bytes
                    .chunks_exact(8)
                    .map(|b| {
                        let x = f64::from_bits(read_uint(b, 8));
                        if x.is_nan() {
                            None
                        } else {
                            Some(x)
                        }
                    })
                    .collect(),
            ))
        }
        ElementKind::Categorical => {
            check_len(bytes, rows, 4)?;
            Ok(ColumnData::Categorical(
                bytes
                    .chunks_exact(4)
                    .map(|b| {
                        let x = read_uint(b, 4) as u32;
                        if x == NA_U32 {
                            None
                        } else {
                            Some(x)
                        }
                    })
                    .collect(),
            ))
        }
        ElementKind::String => {
            let mut reader = Reader::new(bytes);
            let mut vals = Vec::with_capacity(rows);
            for _ in 0..rows {
                vals.push(reader.string()?);
            }
            reader.finish()?;
            Ok(ColumnData::String(vals))
        }
        ElementKind::RawBytes => {
            if bytes.len() != rows {
                return Err(format!(
                    "expected {} raw bytes, found {}",
                    rows,
                    bytes.len()
                ));
            }
            Ok(ColumnData::RawBytes(bytes.to_vec()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lossless() -> EncodeOptions {
        EncodeOptions::default()
    }

    fn roundtrip(data: &ColumnData, opts: &EncodeOptions) -> (Encoding, usize) {
        let (encoding, bytes, lossy) = encode(data, opts).unwrap();
        assert!(!lossy);
        let decoded = decode(data.kind(), data.len(), &encoding, &bytes).unwrap();
        assert_eq!(&decoded, data);
        (encoding, bytes.len())
    }

    #[test]
    fn test_constant_numeric() {
        let data = ColumnData::Numeric(vec![Some(3.5); 500]);
        let (encoding, len) = roundtrip(&data, &lossless());
        assert_eq!(encoding, Encoding::Constant(Data::Num(3.5)));
        assert_eq!(len, 0);
    }

    #[test]
    fn test_all_missing_is_constant() {
        let data = ColumnData::Categorical(vec![None; 20]);
        let (encoding, _) = roundtrip(&data, &lossless());
        assert_eq!(encoding, Encoding::Constant(Data::Null));
    }

    #[test]
    fn test_small_ints_pack_into_one_byte() {
        let data = ColumnData::Numeric(
            (0..100).map(|x| Some((x % 50) as f64 - 25.0)).collect(),
        );
        let (_, len) = roundtrip(&data, &lossless());
        assert_eq!(len, 100);
    }

    #[test]
    fn test_narrow_range_uses_delta_of_min() {
        let data = ColumnData::Numeric(
            (0..100).map(|x| Some(1_000_000.0 + x as f64)).collect(),
        );
        let (encoding, len) = roundtrip(&data, &lossless());
        assert_eq!(
            encoding,
            Encoding::DeltaOfMin {
                min: 1_000_000,
                exponent: 0,
                width: 1
            }
        );
        assert_eq!(len, 100);
    }

    #[test]
    fn test_decimals_are_scaled_exactly() {
        let vals: Vec<Option<f64>> =
            vec![Some(1.25), Some(2.5), None, Some(-0.75), Some(100.01)];
        let data = ColumnData::Numeric(vals);
        let (encoding, _) = roundtrip(&data, &lossless());
        match encoding {
            Encoding::DeltaOfMin { exponent, .. } => assert_eq!(exponent, -2),
            e => panic!("unexpected encoding {:?}", e),
        }
    }

    #[test]
    fn test_negative_zero_survives() {
        let data = ColumnData::Numeric(vec![Some(-0.0), Some(1.0), Some(2.0)]);
        let (encoding, _) = roundtrip(&data, &lossless());
        assert_eq!(encoding, Encoding::Raw);
    }

    #[test]
    fn test_sparse_needs_more_than_ninety_percent() {
        let mut vals = vec![Some(0.123456789); 100];
        vals[7] = Some(5.5e300);
        let data = ColumnData::Numeric(vals.clone());
        let (encoding, len) = roundtrip(&data, &lossless());
        assert!(matches!(encoding, Encoding::Sparse { entries: 1, .. }));
        assert_eq!(len, 12);

        // exactly 90% is not enough
        let mut vals = vec![Some(0.123456789); 100];
        for v in vals.iter_mut().take(10) {
            *v = Some(5.5e300);
        }
        let data = ColumnData::Numeric(vals);
        let (encoding, _) = roundtrip(&data, &lossless());
        assert!(!matches!(encoding, Encoding::Sparse { .. }));
    }

    #[test]
    fn test_sparse_with_missing_values() {
        let mut vals = vec![None; 200];
        vals[3] = Some("a".to_string());
        vals[150] = Some("bcd".to_string());
        let data = ColumnData::String(vals);
        let (encoding, _) = roundtrip(&data, &lossless());
        assert_eq!(
            encoding,
            Encoding::Sparse {
                default: Data::Null,
                entries: 2
            }
        );
    }

    #[test]
    fn test_random_floats_fall_back_to_raw() {
        let data = ColumnData::Numeric(
            (1..200).map(|x| Some(1.0 / x as f64 + 0.1)).collect(),
        );
        let (encoding, len) = roundtrip(&data, &lossless());
        assert_eq!(encoding, Encoding::Raw);
        assert_eq!(len, 199 * 8);
    }

    #[test]
    fn test_lossy_floats_are_bounded_and_flagged() {
        let vals: Vec<Option<f64>> =
            (1..200).map(|x| Some(1.0 / x as f64 + 0.1)).collect();
        let data = ColumnData::Numeric(vals.clone());
        let opts = EncodeOptions {
            lossy_digits: Some(2),
        };
        let (encoding, bytes, lossy) = encode(&data, &opts).unwrap();
        assert!(lossy);
        assert!(matches!(encoding, Encoding::QuantizedFloat { digits: 2, .. }));
        let decoded = decode(ElementKind::Numeric, vals.len(), &encoding, &bytes)
            .unwrap();
        match decoded {
            ColumnData::Numeric(out) => {
                for (a, b) in vals.iter().zip(out.iter()) {
                    assert!((a.unwrap() - b.unwrap()).abs() <= 0.01);
                }
            }
            _ => panic!(),
        }
    }

    #[test]
    fn test_lossless_wins_ties_over_lossy() {
        let data =
            ColumnData::Numeric((0..100).map(|x| Some(x as f64)).collect());
        let opts = EncodeOptions {
            lossy_digits: Some(0),
        };
        let (_, _, lossy) = encode(&data, &opts).unwrap();
        assert!(!lossy);
    }

    #[test]
    fn test_categorical_and_strings() {
        let cats = ColumnData::Categorical(
            (0..300).map(|x| if x % 7 == 0 { None } else { Some(x % 3) }).collect(),
        );
        let (_, len) = roundtrip(&cats, &lossless());
        assert_eq!(len, 300);
        let strs = ColumnData::String(
            (0..50)
                .map(|x| if x % 5 == 0 { None } else { Some(format!("s{}", x)) })
                .collect(),
        );
        let (encoding, _) = roundtrip(&strs, &lossless());
        assert_eq!(encoding, Encoding::Raw);
    }

    #[test]
    fn test_raw_bytes_pass_through() {
        let data = ColumnData::RawBytes(b"the quick brown fox".to_vec());
        let (encoding, len) = roundtrip(&data, &lossless());
        assert_eq!(encoding, Encoding::Raw);
        assert_eq!(len, 19);
        let empty = ColumnData::RawBytes(Vec::new());
        roundtrip(&empty, &lossless());
    }

    #[test]
    fn test_reserved_level_is_rejected() {
        let data = ColumnData::Categorical(vec![Some(u32::MAX)]);
        assert!(encode(&data, &lossless()).is_err());
    }

    #[test]
    fn test_corrupt_payloads_are_rejected() {
        assert!(decode(ElementKind::Numeric, 3, &Encoding::SmallInt { width: 3 }, &[0; 9]).is_err());
        assert!(decode(ElementKind::String, 1, &Encoding::Raw, &[5, 0, 0, 0, b'a']).is_err());
        let sparse = Encoding::Sparse {
            default: Data::Num(0.0),
            entries: 1,
        };
        let mut bytes = 10u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&1f64.to_bits().to_le_bytes());
        assert!(decode(ElementKind::Numeric, 5, &sparse, &bytes).is_err());
        assert!(decode(
            ElementKind::Categorical,
            2,
            &Encoding::Constant(Data::Str("x".into())),
            &[]
        )
        .is_err());
    }
}
