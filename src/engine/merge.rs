//! Distributed hash join of two frames.
//!
//! The smaller frame is broadcast: every node owning chunks of the larger
//! frame reads the whole smaller frame through its `Directory`, indexes its
//! join columns and probes its own chunks. Each node writes the result rows
//! of the chunks it probed as new chunks it owns itself, so the coordinator
//! only stitches their references together in chunk order and adds the
//! unmatched rows of the smaller frame.
use crate::chunk::{Chunk, ColumnData, Data, ElementKind, EncodeOptions};
use crate::engine::{Engine, GroupValue, Task, TaskOutput};
use crate::error::StoreError;
use crate::frame::{
    check_unique_names, fetch_vectors, publish_frame, publish_vector, put_chunk, read_vector,
    ChunkRef, Frame, Layout, Vector,
};
use crate::kv::{Directory, Key, KeyKind};
use futures::future;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Which rows without a match are kept in the result of a merge
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOptions {
    pub keep_unmatched_left: bool,
    pub keep_unmatched_right: bool,
}

/// One column of the result of a merge. Its value in a row is taken from
/// the larger frame's column `large` if that row has one, otherwise from the
/// smaller frame's column `small`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputColumn {
    name: String,
    kind: ElementKind,
    large: Option<usize>,
    small: Option<usize>,
    /// The labels of a categorical result column
    domain: Option<Vec<String>>,
}

/// The probe phase of a merge, sent to every node owning chunks of `large`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProbeTask {
    large: Key,
    small: Key,
    large_on: Vec<usize>,
    small_on: Vec<usize>,
    /// Emit rows of `large` without a match
    keep_unmatched: bool,
    columns: Vec<OutputColumn>,
    lossy_digits: Option<u8>,
}

/// The rows of the result produced from one chunk of the larger frame
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProbedChunk {
    /// The index of the probed chunk in the larger frame
    pub idx: usize,
    pub rows: usize,
    /// One chunk per result column, owned by the node that probed `idx`.
    /// Empty when `rows` is 0.
    pub chunks: Vec<ChunkRef>,
    /// The rows of the smaller frame that matched a row of this chunk
    pub matched: Vec<usize>,
}

pub type ProbeOutput = Vec<ProbedChunk>;

/// Some rows of a frame: decoded columns and their categorical labels
#[derive(Debug, Default)]
struct Rows {
    columns: Vec<ColumnData>,
    domains: Vec<Option<Vec<String>>>,
}

impl Rows {
    /// The join key of `row` over the columns `on`, `None` if any part of it
    /// is missing. Categorical levels are replaced by their label so that
    /// frames with different domains match.
    fn join_key(&self, on: &[usize], row: usize) -> Option<Vec<GroupValue>> {
        let mut key = Vec::with_capacity(on.len());
        for c in on {
            let value = match (self.columns.get(*c)?.get(row)?, self.domains.get(*c)?) {
                (Data::Cat(level), Some(domain)) => {
                    GroupValue::Str(domain.get(level as usize)?.clone())
                }
                (d, _) => GroupValue::from_data(Some(d)),
            };
            if let GroupValue::Na = value {
                return None;
            }
            key.push(value);
        }
        Some(key)
    }
}

/// Joins the frames `left` and `right` on the columns `on`, which both
/// frames must have, and publishes the result under the key of the job.
///
/// The result holds every column of `left` followed by the columns of
/// `right` that are not join columns, a name already in use gets the suffix
/// `_right` until it is unique. Its rows follow the chunks and rows of the
/// larger frame (the left one on a tie), each with its matches in the order
/// of the smaller frame, then the unmatched rows of the smaller frame if
/// kept.
///
/// ## Errors
/// `SchemaMismatch` if `on` is empty, names an unknown column or a
/// raw-bytes column, or names columns of different kinds
pub(crate) async fn merge(
    engine: &Arc<Engine>,
    job: Key,
    left_key: &Key,
    right_key: &Key,
    on: &[&str],
    opts: &MergeOptions,
    token: &CancellationToken,
) -> Result<Key, StoreError> {
    let dir = engine.directory.clone();
    let (left, right) = future::try_join(dir.get_frame(left_key), dir.get_frame(right_key)).await?;
    if on.is_empty() {
        return Err(StoreError::schema("merge", "no join columns"));
    }
    let left_on = join_columns(&left, on)?;
    let right_on = join_columns(&right, on)?;
    let (left_vecs, right_vecs) =
        future::try_join(fetch_vectors(&dir, &left.vecs), fetch_vectors(&dir, &right.vecs)).await?;
    for ((l, r), name) in left_on.iter().zip(right_on.iter()).zip(on.iter()) {
        let (l, r) = (&left_vecs[*l], &right_vecs[*r]);
        if l.kind != r.kind {
            return Err(StoreError::schema(
                "merge",
                format!("join column {} is {} on the left and {} on the right", name, l.kind, r.kind),
            ));
        }
        if l.kind == ElementKind::RawBytes {
            return Err(StoreError::schema(
                "merge",
                format!("can not join on the raw-bytes column {}", name),
            ));
        }
    }

    let right_small = right.rows <= left.rows;
    let columns = output_columns(&left, &right, &left_vecs, &right_vecs, &left_on, &right_on, right_small);
    let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
    check_unique_names("merge", &names)?;

    let (large, small, large_on, small_on, keep_large, keep_small) = if right_small {
        (&left, &right, left_on, right_on, opts.keep_unmatched_left, opts.keep_unmatched_right)
    } else {
        (&right, &left, right_on, left_on, opts.keep_unmatched_right, opts.keep_unmatched_left)
    };
    let lossy_digits = engine.write_opts.lossy_digits;
    let task = Task::Probe(ProbeTask {
        large: large.key.clone(),
        small: small.key.clone(),
        large_on,
        small_on,
        keep_unmatched: keep_large,
        columns: columns.clone(),
        lossy_digits,
    });
    let outputs = engine
        .run_job(&job, &large.layout.nodes(), task, token)
        .await?;

    let mut probed = Vec::new();
    for (_, output) in outputs {
        match output {
            TaskOutput::Probe(p) => probed.extend(p),
            _ => return Err(StoreError::UnexpectedMessage),
        }
    }
    probed.sort_by_key(|p| p.idx);
    let matched: HashSet<usize> = probed.iter().flat_map(|p| p.matched.iter().copied()).collect();
    let mut parts: Vec<Vec<ChunkRef>> = vec![Vec::new(); columns.len()];
    for p in probed.into_iter().filter(|p| p.rows > 0) {
        for (part, c) in parts.iter_mut().zip(p.chunks) {
            part.push(c);
        }
    }
    if keep_small {
        let unmatched: Vec<usize> = (0..small.rows).filter(|s| !matched.contains(s)).collect();
        let tail = write_unmatched(engine, &job, &columns, small, &unmatched, token).await?;
        for (part, refs) in parts.iter_mut().zip(tail) {
            part.extend(refs);
        }
    }

    let layout = match parts.first() {
        Some(refs) => layout_of(refs),
        None => Layout::empty(),
    };
    let vecs = future::try_join_all(columns.iter().zip(parts).map(|(c, refs)| {
        publish_vector(&dir, c.kind, c.domain.clone(), lossy_digits, refs)
    }))
    .await?;
    let rows = layout.rows();
    let result = publish_frame(
        &dir,
        job,
        &format!("{}_merge_{}", left.name, right.name),
        names,
        vecs,
        layout,
        rows,
    )
    .await?;
    info!(
        "Merged {} and {} on {:?} into {} with {} rows",
        left.key, right.key, on, result.key, result.rows
    );
    Ok(result.key.clone())
}

fn join_columns(frame: &Frame, on: &[&str]) -> Result<Vec<usize>, StoreError> {
    on.iter().map(|n| frame.require_col("merge", n)).collect()
}

/// The columns of the result: every left column, the join columns holding
/// the left domain extended with the labels only the right side has, then
/// the other right columns.
fn output_columns(
    left: &Frame,
    right: &Frame,
    left_vecs: &[Arc<Vector>],
    right_vecs: &[Arc<Vector>],
    left_on: &[usize],
    right_on: &[usize],
    right_small: bool,
) -> Vec<OutputColumn> {
    // (large, small) from (left, right)
    let sides = |l: Option<usize>, r: Option<usize>| if right_small { (l, r) } else { (r, l) };
    let mut columns = Vec::with_capacity(left_vecs.len() + right_vecs.len());
    for (i, v) in left_vecs.iter().enumerate() {
        let joined = left_on.iter().position(|c| *c == i).map(|k| right_on[k]);
        let domain = match joined {
            Some(r) => merged_domain(&v.domain, &right_vecs[r].domain),
            None => v.domain.clone(),
        };
        let (large, small) = sides(Some(i), joined);
        columns.push(OutputColumn {
            name: left.names[i].clone(),
            kind: v.kind,
            large,
            small,
            domain,
        });
    }
    let mut used: HashSet<String> = left.names.iter().cloned().collect();
    for (i, v) in right_vecs.iter().enumerate() {
        if right_on.contains(&i) {
            continue;
        }
        let mut name = right.names[i].clone();
        while used.contains(&name) {
            name = format!("{}_right", name);
        }
        used.insert(name.clone());
        let (large, small) = sides(None, Some(i));
        columns.push(OutputColumn {
            name,
            kind: v.kind,
            large,
            small,
            domain: v.domain.clone(),
        });
    }
    columns
}

fn merged_domain(
    left: &Option<Vec<String>>,
    right: &Option<Vec<String>>,
) -> Option<Vec<String>> {
    let mut domain = left.clone()?;
    if let Some(right) = right {
        let mut seen: HashSet<String> = domain.iter().cloned().collect();
        for label in right {
            if seen.insert(label.clone()) {
                domain.push(label.clone());
            }
        }
    }
    Some(domain)
}

/// Maps each level of `from` to the level with the same label in `to`
fn relabel(from: &Option<Vec<String>>, to: &Option<Vec<String>>) -> Option<Vec<Option<u32>>> {
    let (from, to) = (from.as_ref()?, to.as_ref()?);
    let index: HashMap<&str, u32> =
        to.iter().enumerate().map(|(i, l)| (l.as_str(), i as u32)).collect();
    Some(from.iter().map(|l| index.get(l.as_str()).copied()).collect())
}

/// Where the values of one result column are read from
struct Source<'a> {
    data: &'a ColumnData,
    relabel: Option<Vec<Option<u32>>>,
}

impl Source<'_> {
    fn value(&self, row: usize) -> Option<Data> {
        match self.data.get(row)? {
            Data::Cat(level) => match &self.relabel {
                Some(map) => Some(map.get(level as usize).copied().flatten().map_or(Data::Null, Data::Cat)),
                None => Some(Data::Cat(level)),
            },
            d => Some(d),
        }
    }
}

fn source<'a>(
    rows: &'a Rows,
    col: Option<usize>,
    domain: &Option<Vec<String>>,
) -> Option<Source<'a>> {
    let col = col?;
    Some(Source {
        data: rows.columns.get(col)?,
        relabel: relabel(rows.domains.get(col)?, domain),
    })
}

/// The values of every result column for the given pairs of (row of
/// `large`, row of `small`). A row missing from both sides is a missing
/// value, or a zero byte for raw bytes.
fn gather(
    columns: &[OutputColumn],
    large: &Rows,
    small: &Rows,
    pairs: &[(Option<usize>, Option<usize>)],
) -> Result<Vec<ColumnData>, StoreError> {
    let mut out = Vec::with_capacity(columns.len());
    for c in columns {
        let large_src = source(large, c.large, &c.domain);
        let small_src = source(small, c.small, &c.domain);
        let fill = match c.kind {
            ElementKind::RawBytes => Data::Byte(0),
            _ => Data::Null,
        };
        let mut data = ColumnData::empty(c.kind);
        for (l, s) in pairs.iter().copied() {
            let value = l
                .and_then(|l| large_src.as_ref()?.value(l))
                .or_else(|| s.and_then(|s| small_src.as_ref()?.value(s)))
                .unwrap_or_else(|| fill.clone());
            data.push(value)?;
        }
        out.push(data);
    }
    Ok(out)
}

/// Encodes the result columns of some rows as chunks owned by `home`
fn encode_rows(
    home: usize,
    data: &[ColumnData],
    lossy_digits: Option<u8>,
) -> Result<Vec<(usize, Chunk)>, StoreError> {
    let opts = EncodeOptions { lossy_digits };
    data.iter()
        .map(|d| {
            let key = Key::generate("chunk", home, KeyKind::Chunk);
            Ok((d.na_count(), Chunk::encode(key, d, &opts)?))
        })
        .collect()
}

async fn put_chunks(dir: &Directory, chunks: Vec<(usize, Chunk)>) -> Result<Vec<ChunkRef>, StoreError> {
    future::try_join_all(chunks.into_iter().map(|(na, chunk)| put_chunk(dir, 0, na, chunk))).await
}

/// Removes chunks written for a job that did not complete
async fn discard(dir: &Directory, refs: &[ChunkRef]) {
    for r in refs {
        if let Err(e) = dir.remove(&r.key).await {
            debug!("Could not discard {}: {}", r.key, e);
        }
    }
}

fn layout_of(refs: &[ChunkRef]) -> Layout {
    let mut starts = vec![0];
    let mut homes = Vec::with_capacity(refs.len());
    for r in refs {
        starts.push(starts[starts.len() - 1] + r.rows);
        homes.push(r.key.home);
    }
    Layout { starts, homes }
}

/// Reads every column of `frame`
async fn read_rows(dir: &Directory, frame: &Frame) -> Result<Rows, StoreError> {
    let vecs = fetch_vectors(dir, &frame.vecs).await?;
    let columns = future::try_join_all(vecs.iter().map(|v| read_vector(dir, v))).await?;
    Ok(Rows {
        columns,
        domains: vecs.iter().map(|v| v.domain.clone()).collect(),
    })
}

/// Writes the rows of the smaller frame that matched nothing, on the
/// coordinator, in chunks of at most `rows_per_chunk` rows. Returns the
/// chunks of each result column.
async fn write_unmatched(
    engine: &Arc<Engine>,
    job: &Key,
    columns: &[OutputColumn],
    small: &Frame,
    unmatched: &[usize],
    token: &CancellationToken,
) -> Result<Vec<Vec<ChunkRef>>, StoreError> {
    let mut refs = vec![Vec::new(); columns.len()];
    if unmatched.is_empty() {
        return Ok(refs);
    }
    let dir = &engine.directory;
    let small_rows = read_rows(dir, small).await?;
    let per_chunk = engine.write_opts.rows_per_chunk.max(1);
    for rows in unmatched.chunks(per_chunk) {
        if token.is_cancelled() {
            discard(dir, &refs.concat()).await;
            return Err(StoreError::Cancelled { job: job.clone() });
        }
        let pairs: Vec<(Option<usize>, Option<usize>)> = rows.iter().map(|s| (None, Some(*s))).collect();
        let data = gather(columns, &Rows::default(), &small_rows, &pairs)?;
        let chunks = encode_rows(engine.id, &data, engine.write_opts.lossy_digits)?;
        for (col, r) in refs.iter_mut().zip(put_chunks(dir, chunks).await?) {
            col.push(r);
        }
    }
    Ok(refs)
}

/// The probe phase: indexes the smaller frame's join columns, looks up the
/// join key of every row of the chunks of the larger frame owned by this
/// node and stores the resulting rows as chunks on this node.
pub(crate) async fn probe_chunks(
    engine: &Arc<Engine>,
    job: &Key,
    task: ProbeTask,
    token: &CancellationToken,
) -> Result<ProbeOutput, StoreError> {
    let dir = &engine.directory;
    let (large, small) = future::try_join(dir.get_frame(&task.large), dir.get_frame(&task.small)).await?;
    let small_rows = read_rows(dir, &small).await?;
    let mut index: HashMap<Vec<GroupValue>, Vec<usize>> = HashMap::new();
    for row in 0..small.rows {
        if let Some(key) = small_rows.join_key(&task.small_on, row) {
            index.entry(key).or_default().push(row);
        }
    }

    let large_vecs = fetch_vectors(dir, &large.vecs).await?;
    if let Some(v) = large_vecs.iter().find(|v| v.chunks.len() != large.layout.num_chunks()) {
        return Err(StoreError::schema(
            "merge",
            format!("column {} does not follow the layout of frame {}", v.key, large.key),
        ));
    }
    let mut inputs = Vec::new();
    for i in large.layout.chunks_on(engine.id) {
        let chunks =
            future::try_join_all(large_vecs.iter().map(|v| dir.get_chunk(&v.chunks[i].key))).await?;
        inputs.push((i, large.layout.range(i).len(), chunks));
    }
    let large_meta: Vec<(ElementKind, Option<Vec<String>>)> =
        large_vecs.iter().map(|v| (v.kind, v.domain.clone())).collect();
    let shared = Arc::new((index, small_rows, task));
    let home = engine.id;
    let encoded = engine
        .run_chunk_tasks(job, token, inputs, move |(idx, rows, chunks)| {
            let (index, small_rows, task) = shared.as_ref();
            let large_rows = decode_chunk(*rows, chunks, &large_meta)?;
            let pairs = probe_chunk(&large_rows, *rows, &task.large_on, index, task.keep_unmatched);
            let matched: Vec<usize> = pairs.iter().filter_map(|(_, s)| *s).collect();
            let result_rows = pairs.len();
            let chunks = if result_rows == 0 {
                Vec::new()
            } else {
                let data = gather(&task.columns, &large_rows, small_rows, &pairs)?;
                encode_rows(home, &data, task.lossy_digits)?
            };
            Ok((*idx, result_rows, chunks, matched))
        })
        .await?;

    let mut output = Vec::with_capacity(encoded.len());
    for (idx, rows, chunks, matched) in encoded {
        let chunks = put_chunks(dir, chunks).await?;
        output.push(ProbedChunk {
            idx,
            rows,
            chunks,
            matched,
        });
    }
    if token.is_cancelled() {
        let written: Vec<ChunkRef> = output.iter().flat_map(|p| p.chunks.iter().cloned()).collect();
        discard(dir, &written).await;
        return Err(StoreError::Cancelled { job: job.clone() });
    }
    debug!("Probed {} chunks of {} for job {}", output.len(), large.key, job);
    Ok(output)
}

/// Decodes the chunks of one row range of the larger frame, one per column
fn decode_chunk(
    rows: usize,
    chunks: &[Arc<Chunk>],
    meta: &[(ElementKind, Option<Vec<String>>)],
) -> Result<Rows, StoreError> {
    let mut decoded = Rows::default();
    for (chunk, (kind, domain)) in chunks.iter().zip(meta.iter()) {
        if chunk.kind != *kind || chunk.rows != rows {
            return Err(StoreError::schema(
                "merge",
                format!(
                    "chunk {} holds {} {} values where {} {} values were expected",
                    chunk.key, chunk.rows, chunk.kind, rows, kind
                ),
            ));
        }
        decoded.columns.push(chunk.decode()?);
        decoded.domains.push(domain.clone());
    }
    Ok(decoded)
}

/// The pairs of (row of the chunk, matching row of the smaller frame) in
/// row order, fanning out over duplicate keys of the smaller frame
fn probe_chunk(
    chunk: &Rows,
    rows: usize,
    on: &[usize],
    index: &HashMap<Vec<GroupValue>, Vec<usize>>,
    keep_unmatched: bool,
) -> Vec<(Option<usize>, Option<usize>)> {
    let mut pairs = Vec::with_capacity(rows);
    for r in 0..rows {
        match chunk.join_key(on, r).and_then(|k| index.get(&k)) {
            Some(matches) => pairs.extend(matches.iter().map(|s| (Some(r), Some(*s)))),
            None if keep_unmatched => pairs.push((Some(r), None)),
            None => (),
        }
    }
    pairs
}
