//! Distributed group-by: every node builds partial aggregate states for the
//! chunks it owns, the coordinator merges them in chunk order and writes one
//! row per distinct group.
use crate::chunk::{Chunk, ColumnData, Data, ElementKind};
use crate::engine::{Engine, Task, TaskOutput};
use crate::error::StoreError;
use crate::frame::{check_unique_names, fetch_vectors, write_frame_under, NamedColumn};
use crate::kv::Key;
use futures::future;
use log::info;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::btree_map::{BTreeMap, Entry};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The kind of aggregate computed for a group
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggKind {
    Count,
    Sum,
    Mean,
    Min,
    Max,
    Var,
    Sd,
}

impl fmt::Display for AggKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            AggKind::Count => "count",
            AggKind::Sum => "sum",
            AggKind::Mean => "mean",
            AggKind::Min => "min",
            AggKind::Max => "max",
            AggKind::Var => "var",
            AggKind::Sd => "sd",
        };
        write!(f, "{}", name)
    }
}

/// How an aggregate treats missing values of its column
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NaMode {
    /// A group with a missing value has a missing result, except for
    /// `Count` which counts every row
    All,
    /// Missing values are skipped
    Rm,
}

/// One aggregate column of a group-by result
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub kind: AggKind,
    /// The column that is aggregated
    pub column: String,
    pub na: NaMode,
}

impl Aggregate {
    pub fn new(kind: AggKind, column: &str) -> Self {
        Aggregate {
            kind,
            column: column.to_string(),
            na: NaMode::All,
        }
    }

    pub fn with_na(mut self, na: NaMode) -> Self {
        self.na = na;
        self
    }

    /// The name of the result column, `<kind>_<column>`
    pub fn output_name(&self) -> String {
        format!("{}_{}", self.kind, self.column)
    }
}

/// One component of the key of a group. Groups sort by their values with
/// missing values last.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub enum GroupValue {
    Num(f64),
    Cat(u32),
    Str(String),
    Na,
}

impl GroupValue {
    pub(crate) fn from_data(d: Option<Data>) -> Self {
        match d {
            // -0.0 and 0.0 are one group
            Some(Data::Num(x)) if x == 0.0 => GroupValue::Num(0.0),
            Some(Data::Num(x)) => GroupValue::Num(x),
            Some(Data::Cat(x)) => GroupValue::Cat(x),
            Some(Data::Str(s)) => GroupValue::Str(s),
            Some(Data::Byte(b)) => GroupValue::Num(b as f64),
            Some(Data::Null) | None => GroupValue::Na,
        }
    }

    fn into_data(self) -> Data {
        match self {
            GroupValue::Num(x) => Data::Num(x),
            GroupValue::Cat(x) => Data::Cat(x),
            GroupValue::Str(s) => Data::Str(s),
            GroupValue::Na => Data::Null,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            GroupValue::Num(_) => 0,
            GroupValue::Cat(_) => 1,
            GroupValue::Str(_) => 2,
            GroupValue::Na => 3,
        }
    }
}

impl Ord for GroupValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (GroupValue::Num(a), GroupValue::Num(b)) => a.total_cmp(b),
            (GroupValue::Cat(a), GroupValue::Cat(b)) => a.cmp(b),
            (GroupValue::Str(a), GroupValue::Str(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl PartialOrd for GroupValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for GroupValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for GroupValue {}

impl Hash for GroupValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            GroupValue::Num(x) => x.to_bits().hash(state),
            GroupValue::Cat(x) => x.hash(state),
            GroupValue::Str(s) => s.hash(state),
            GroupValue::Na => (),
        }
    }
}

/// The partial state of every aggregate of one group
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct AggState {
    /// Every row of the group
    rows: u64,
    /// Rows with a value
    count: u64,
    /// Rows without a value
    na: u64,
    sum: f64,
    min: f64,
    max: f64,
    mean: f64,
    /// The sum of squared differences from the mean
    m2: f64,
}

impl AggState {
    fn add(&mut self, d: Option<Data>) {
        self.rows += 1;
        match d {
            Some(Data::Num(x)) => {
                if self.count == 0 {
                    self.min = x;
                    self.max = x;
                } else {
                    self.min = self.min.min(x);
                    self.max = self.max.max(x);
                }
                self.count += 1;
                self.sum += x;
                let delta = x - self.mean;
                self.mean += delta / self.count as f64;
                self.m2 += delta * (x - self.mean);
            }
            Some(Data::Null) | None => self.na += 1,
            Some(_) => self.count += 1,
        }
    }

    fn merge(&mut self, other: &AggState) {
        self.rows += other.rows;
        self.na += other.na;
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            self.count = other.count;
            self.sum = other.sum;
            self.min = other.min;
            self.max = other.max;
            self.mean = other.mean;
            self.m2 = other.m2;
            return;
        }
        let n = (self.count + other.count) as f64;
        let delta = other.mean - self.mean;
        self.mean += delta * other.count as f64 / n;
        self.m2 += other.m2 + delta * delta * (self.count as f64) * (other.count as f64) / n;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
    }

    /// The value of the aggregate `kind`, `None` for a missing result
    pub fn finish(&self, kind: AggKind, na: NaMode) -> Option<f64> {
        if kind == AggKind::Count {
            return Some(match na {
                NaMode::All => self.rows,
                NaMode::Rm => self.count,
            } as f64);
        }
        if na == NaMode::All && self.na > 0 {
            return None;
        }
        let var = || {
            if self.count > 1 {
                Some(self.m2 / (self.count - 1) as f64)
            } else {
                None
            }
        };
        match kind {
            AggKind::Sum => Some(self.sum),
            _ if self.count == 0 => None,
            AggKind::Mean => Some(self.mean),
            AggKind::Min => Some(self.min),
            AggKind::Max => Some(self.max),
            AggKind::Var => var(),
            AggKind::Sd => var().map(f64::sqrt),
            AggKind::Count => None,
        }
    }
}

/// The groups of one chunk sorted by key, with one state per aggregate
pub type Partial = Vec<(Vec<GroupValue>, Vec<AggState>)>;

/// What a node sends back for a group-by: the partial groups of each of its
/// chunks, tagged with the chunk index
pub type GroupByOutput = Vec<(usize, Partial)>;

/// The map phase of a group-by, sent to every node owning chunks of `frame`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GroupByTask {
    frame: Key,
    /// The grouping column indices
    by: Vec<usize>,
    /// The column index of each aggregate
    sources: Vec<usize>,
}

/// Groups the rows of `frame` by the columns `by` and computes `aggs` for
/// every group, publishing the result under the key of the job.
///
/// The result has the grouping columns first, in the order of `by`, then one
/// numeric column per aggregate named `<kind>_<column>`. Rows are sorted by
/// group with missing values last.
pub(crate) async fn group_by(
    engine: &Arc<Engine>,
    job: Key,
    frame_key: &Key,
    by: &[&str],
    aggs: &[Aggregate],
    token: &CancellationToken,
) -> Result<Key, StoreError> {
    let dir = engine.directory.clone();
    let frame = dir.get_frame(frame_key).await?;
    let by_idx = by
        .iter()
        .map(|n| frame.require_col("group by", n))
        .collect::<Result<Vec<usize>, StoreError>>()?;
    let sources = aggs
        .iter()
        .map(|a| frame.require_col("group by", &a.column))
        .collect::<Result<Vec<usize>, StoreError>>()?;
    let vectors = fetch_vectors(&dir, &frame.vecs).await?;
    for i in &by_idx {
        if vectors[*i].kind == ElementKind::RawBytes {
            return Err(StoreError::schema(
                "group by",
                format!("can not group by the raw-bytes column {}", frame.names[*i]),
            ));
        }
    }
    for (a, i) in aggs.iter().zip(sources.iter()) {
        if a.kind != AggKind::Count && vectors[*i].kind != ElementKind::Numeric {
            return Err(StoreError::schema(
                "group by",
                format!("can not compute {} of the {} column {}", a.kind, vectors[*i].kind, a.column),
            ));
        }
    }
    let mut names: Vec<String> = by.iter().map(|n| n.to_string()).collect();
    names.extend(aggs.iter().map(|a| a.output_name()));
    check_unique_names("group by", &names)?;

    let task = Task::GroupBy(GroupByTask {
        frame: frame_key.clone(),
        by: by_idx.clone(),
        sources,
    });
    let outputs = engine
        .run_job(&job, &frame.layout.nodes(), task, token)
        .await?;

    // reduce, in chunk order so that floating point results do not depend
    // on the order the nodes answered in
    let mut partials = Vec::new();
    for (_, output) in outputs {
        match output {
            TaskOutput::GroupBy(p) => partials.extend(p),
            _ => return Err(StoreError::UnexpectedMessage),
        }
    }
    partials.sort_by_key(|(idx, _)| *idx);
    let mut merged: BTreeMap<Vec<GroupValue>, Vec<AggState>> = BTreeMap::new();
    for (_, partial) in partials {
        for (key, states) in partial {
            match merged.entry(key) {
                Entry::Vacant(e) => {
                    e.insert(states);
                }
                Entry::Occupied(mut e) => {
                    for (a, b) in e.get_mut().iter_mut().zip(states.iter()) {
                        a.merge(b);
                    }
                }
            }
        }
    }

    let mut columns = Vec::with_capacity(names.len());
    let mut group_cols: Vec<ColumnData> = by_idx
        .iter()
        .map(|i| ColumnData::empty(vectors[*i].kind))
        .collect();
    let mut agg_cols: Vec<Vec<Option<f64>>> = vec![Vec::with_capacity(merged.len()); aggs.len()];
    for (key, states) in merged {
        for (col, value) in group_cols.iter_mut().zip(key.into_iter()) {
            col.push(value.into_data())?;
        }
        for ((col, state), a) in agg_cols.iter_mut().zip(states.iter()).zip(aggs.iter()) {
            col.push(state.finish(a.kind, a.na));
        }
    }
    for ((data, i), name) in group_cols.into_iter().zip(by_idx.iter()).zip(names.iter()) {
        columns.push(NamedColumn {
            name: name.clone(),
            data,
            domain: vectors[*i].domain.clone(),
        });
    }
    for (values, a) in agg_cols.into_iter().zip(aggs.iter()) {
        columns.push(NamedColumn::numeric(&a.output_name(), values));
    }
    let result = write_frame_under(
        &dir,
        job,
        &format!("{}_grouped", frame.name),
        columns,
        &engine.write_opts,
    )
    .await?;
    info!(
        "Grouped {} by {:?} into {} with {} groups",
        frame.key, by, result.key, result.rows
    );
    Ok(result.key.clone())
}

/// The map phase: builds the partial groups of every chunk of the task's
/// frame owned by this node.
pub(crate) async fn map_chunks(
    engine: &Arc<Engine>,
    job: &Key,
    task: GroupByTask,
    token: &CancellationToken,
) -> Result<GroupByOutput, StoreError> {
    let dir = &engine.directory;
    let frame = dir.get_frame(&task.frame).await?;
    // every column needed, decoded once per chunk
    let mut cols: Vec<usize> = task.by.iter().chain(task.sources.iter()).copied().collect();
    cols.sort_unstable();
    cols.dedup();
    let keys = cols
        .iter()
        .map(|c| frame.vecs.get(*c).cloned().ok_or(StoreError::ColIndexOutOfBounds(*c)))
        .collect::<Result<Vec<Key>, StoreError>>()?;
    let vectors = fetch_vectors(dir, &keys).await?;
    if let Some(v) = vectors.iter().find(|v| v.chunks.len() != frame.layout.num_chunks()) {
        return Err(StoreError::schema(
            "group by",
            format!("column {} does not follow the layout of frame {}", v.key, frame.key),
        ));
    }
    let position = |c: &usize| cols.iter().position(|x| x == c).unwrap_or(0);
    let by_pos: Vec<usize> = task.by.iter().map(position).collect();
    let src_pos: Vec<usize> = task.sources.iter().map(position).collect();
    let kinds: Vec<ElementKind> = vectors.iter().map(|v| v.kind).collect();

    let mut inputs = Vec::new();
    for i in frame.layout.chunks_on(engine.id) {
        let chunks =
            future::try_join_all(vectors.iter().map(|v| dir.get_chunk(&v.chunks[i].key))).await?;
        inputs.push((i, frame.layout.range(i).len(), chunks));
    }
    engine
        .run_chunk_tasks(job, token, inputs, move |(idx, rows, chunks)| {
            let partial = map_chunk(*rows, chunks, &kinds, &by_pos, &src_pos)?;
            Ok((*idx, partial))
        })
        .await
}

fn map_chunk(
    rows: usize,
    chunks: &[Arc<Chunk>],
    kinds: &[ElementKind],
    by_pos: &[usize],
    src_pos: &[usize],
) -> Result<Partial, StoreError> {
    let mut data = Vec::with_capacity(chunks.len());
    for (chunk, kind) in chunks.iter().zip(kinds.iter()) {
        if chunk.kind != *kind || chunk.rows != rows {
            return Err(StoreError::schema(
                "group by",
                format!(
                    "chunk {} holds {} {} values where {} {} values were expected",
                    chunk.key, chunk.rows, chunk.kind, rows, kind
                ),
            ));
        }
        data.push(chunk.decode()?);
    }
    let mut groups: HashMap<Vec<GroupValue>, Vec<AggState>> = HashMap::new();
    for r in 0..rows {
        let key: Vec<GroupValue> = by_pos
            .iter()
            .map(|p| GroupValue::from_data(data[*p].get(r)))
            .collect();
        let states = groups
            .entry(key)
            .or_insert_with(|| vec![AggState::default(); src_pos.len()]);
        for (state, p) in states.iter_mut().zip(src_pos.iter()) {
            state.add(data[*p].get(r));
        }
    }
    let mut partial: Partial = groups.into_iter().collect();
    partial.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(partial)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KeyKind;

    fn state(values: &[Option<f64>]) -> AggState {
        let mut s = AggState::default();
        for v in values {
            s.add(v.map(Data::Num).or(Some(Data::Null)));
        }
        s
    }

    #[test]
    fn test_missing_values_sort_last() {
        let mut keys = vec![
            GroupValue::Na,
            GroupValue::Num(2.0),
            GroupValue::Num(-1.0),
            GroupValue::Num(0.5),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                GroupValue::Num(-1.0),
                GroupValue::Num(0.5),
                GroupValue::Num(2.0),
                GroupValue::Na
            ]
        );
        assert_eq!(
            GroupValue::from_data(Some(Data::Num(-0.0))),
            GroupValue::Num(0.0)
        );
    }

    #[test]
    fn test_finish() {
        let s = state(&[Some(1.0), Some(2.0), None, Some(3.0)]);
        assert_eq!(s.finish(AggKind::Count, NaMode::All), Some(4.0));
        assert_eq!(s.finish(AggKind::Count, NaMode::Rm), Some(3.0));
        assert_eq!(s.finish(AggKind::Sum, NaMode::All), None);
        assert_eq!(s.finish(AggKind::Sum, NaMode::Rm), Some(6.0));
        assert_eq!(s.finish(AggKind::Mean, NaMode::Rm), Some(2.0));
        assert_eq!(s.finish(AggKind::Min, NaMode::Rm), Some(1.0));
        assert_eq!(s.finish(AggKind::Max, NaMode::Rm), Some(3.0));
        assert_eq!(s.finish(AggKind::Var, NaMode::Rm), Some(1.0));
        assert_eq!(s.finish(AggKind::Sd, NaMode::Rm), Some(1.0));

        let empty = state(&[None]);
        assert_eq!(empty.finish(AggKind::Sum, NaMode::Rm), Some(0.0));
        assert_eq!(empty.finish(AggKind::Mean, NaMode::Rm), None);
        assert_eq!(state(&[Some(5.0)]).finish(AggKind::Var, NaMode::All), None);
    }

    #[test]
    fn test_merged_states_match_a_single_pass() {
        let values: Vec<Option<f64>> = (0..20).map(|i| Some((i * i % 7) as f64)).collect();
        let whole = state(&values);
        let mut merged = state(&values[..5]);
        merged.merge(&state(&values[5..12]));
        merged.merge(&AggState::default());
        merged.merge(&state(&values[12..]));
        for kind in [AggKind::Count, AggKind::Sum, AggKind::Min, AggKind::Max] {
            assert_eq!(merged.finish(kind, NaMode::All), whole.finish(kind, NaMode::All));
        }
        for kind in [AggKind::Mean, AggKind::Var] {
            let a = merged.finish(kind, NaMode::All).unwrap();
            let b = whole.finish(kind, NaMode::All).unwrap();
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn test_map_chunk_groups_na_separately() {
        let key = Key::new("c", 1, KeyKind::Chunk);
        let day = Chunk::encode(
            key.clone(),
            &ColumnData::Categorical(vec![Some(0), Some(1), None, Some(0), None]),
            &Default::default(),
        )
        .unwrap();
        let dur = Chunk::encode(
            key,
            &ColumnData::Numeric(vec![Some(1.0), Some(2.0), Some(3.0), Some(4.0), Some(5.0)]),
            &Default::default(),
        )
        .unwrap();
        let partial = map_chunk(
            5,
            &[Arc::new(day), Arc::new(dur)],
            &[ElementKind::Categorical, ElementKind::Numeric],
            &[0],
            &[1],
        )
        .unwrap();
        let keys: Vec<Vec<GroupValue>> = partial.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![
                vec![GroupValue::Cat(0)],
                vec![GroupValue::Cat(1)],
                vec![GroupValue::Na]
            ]
        );
        assert_eq!(partial[2].1[0].finish(AggKind::Sum, NaMode::All), Some(8.0));
    }

    #[test]
    fn test_map_chunk_rejects_mixed_kinds() {
        let key = Key::new("c", 1, KeyKind::Chunk);
        let chunk = Chunk::encode(key, &ColumnData::String(vec![Some("a".into())]), &Default::default())
            .unwrap();
        assert!(matches!(
            map_chunk(1, &[Arc::new(chunk)], &[ElementKind::Numeric], &[0], &[]),
            Err(StoreError::SchemaMismatch { .. })
        ));
    }
}
