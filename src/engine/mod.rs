//! The aggregation engine: distributed jobs that run tasks on every node
//! owning chunks of their input, in parallel over the node's cores, and
//! combine the results on the node that started the job.
//!
//! A job is identified by the key its result frame is published under. The
//! coordinator sends a [`TaskMsg::Run`] to every participating node (running
//! its own share directly) and then waits at a barrier for a
//! [`TaskMsg::Done`] from each of them. A [`TaskMsg::Failed`] from any node,
//! losing the connection to one, or the job being cancelled aborts the job
//! and tells the remaining participants to stop with a [`TaskMsg::Cancel`].
//!
//! Cancellation is cooperative: a node checks the job's
//! `CancellationToken` before starting each chunk task, chunk tasks that
//! already started run to completion.
use crate::error::{RemoteError, StoreError};
use crate::frame::WriteOptions;
use crate::kv::{Directory, Key};
use crate::network::Transport;
use crate::node::NodeMsg;
use crossbeam_utils::thread;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

mod group_by;
mod merge;

pub use group_by::{AggKind, AggState, Aggregate, GroupByOutput, GroupByTask, GroupValue, NaMode};
pub use merge::{MergeOptions, OutputColumn, ProbeOutput, ProbeTask, ProbedChunk};
pub(crate) use group_by::group_by;
pub(crate) use merge::merge;

/// Work a node does for a job
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Task {
    GroupBy(GroupByTask),
    Probe(ProbeTask),
}

/// The result of a `Task`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum TaskOutput {
    GroupBy(GroupByOutput),
    Probe(ProbeOutput),
}

/// Messages that coordinate jobs between nodes
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum TaskMsg {
    /// Run `task` for `job` on the chunks the receiver owns
    Run { job: Key, task: Task },
    /// The sender finished its task for `job`
    Done { job: Key, output: TaskOutput },
    /// The sender's task for `job` failed
    Failed { job: Key, error: RemoteError },
    /// Stop scheduling chunk tasks for `job`
    Cancel { job: Key },
}

/// What the coordinator of a job learns from the participants
enum JobEvent {
    Done(usize, TaskOutput),
    Failed(usize, StoreError),
    Lost(usize),
}

/// A job running in the background, see `FluxNode::spawn_group_by`
#[derive(Debug)]
pub struct JobHandle {
    job: Key,
    token: CancellationToken,
    handle: JoinHandle<Result<Key, StoreError>>,
}

impl JobHandle {
    /// The key the result of the job will be published under
    pub fn key(&self) -> &Key {
        &self.job
    }

    /// Stops scheduling new chunk tasks for this job, `join` then fails with
    /// `Cancelled`
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for the job to finish and returns the key of its result
    pub async fn join(self) -> Result<Key, StoreError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("Job {} did not complete: {}", self.job, e);
                Err(StoreError::TaskPanicked { job: self.job })
            }
        }
    }
}

/// One node's part of the aggregation engine
pub struct Engine {
    id: usize,
    threads: usize,
    pub(crate) write_opts: WriteOptions,
    pub(crate) directory: Arc<Directory>,
    network: Arc<dyn Transport<NodeMsg>>,
    /// The jobs this node coordinates that are waiting at their barrier
    jobs: Mutex<HashMap<Key, mpsc::UnboundedSender<JobEvent>>>,
    /// The tasks this node runs for jobs coordinated by other nodes
    running: Mutex<HashMap<Key, CancellationToken>>,
}

impl Engine {
    pub fn new(
        directory: Arc<Directory>,
        network: Arc<dyn Transport<NodeMsg>>,
        threads: usize,
        write_opts: WriteOptions,
    ) -> Self {
        Engine {
            id: network.id(),
            threads: threads.max(1),
            write_opts,
            directory,
            network,
            jobs: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Runs `job` in the background on a new `tokio` task
    pub(crate) fn spawn<F>(job: Key, token: CancellationToken, fut: F) -> JobHandle
    where
        F: std::future::Future<Output = Result<Key, StoreError>> + Send + 'static,
    {
        JobHandle {
            job,
            token,
            handle: tokio::spawn(fut),
        }
    }

    /// Runs `task` on every node in `participants` and returns their outputs
    /// ordered by node id, once all of them finished.
    ///
    /// ## Errors
    /// - `Cancelled` if `token` was cancelled before every output arrived
    /// - `NodeUnavailable` if a participant could not be reached or was lost
    /// - the error of the first participant that failed
    pub(crate) async fn run_job(
        self: &Arc<Self>,
        job: &Key,
        participants: &[usize],
        task: Task,
        token: &CancellationToken,
    ) -> Result<Vec<(usize, TaskOutput)>, StoreError> {
        if token.is_cancelled() {
            info!("Job {} was cancelled before it started", job);
            return Err(StoreError::Cancelled { job: job.clone() });
        }
        let (sender, mut events) = mpsc::unbounded_channel();
        self.jobs.lock().await.insert(job.clone(), sender.clone());
        let result = self
            .barrier(job, participants, task, token, sender, &mut events)
            .await;
        self.jobs.lock().await.remove(job);
        if let Err(e) = &result {
            warn!("Job {} failed: {}", job, e);
            token.cancel();
            for node in participants.iter().filter(|n| **n != self.id) {
                let msg = NodeMsg::Task(TaskMsg::Cancel { job: job.clone() });
                if let Err(e) = self.network.send_msg(*node, msg).await {
                    debug!("Could not cancel job {} on node {}: {}", job, node, e);
                }
            }
        }
        result
    }

    async fn barrier(
        self: &Arc<Self>,
        job: &Key,
        participants: &[usize],
        task: Task,
        token: &CancellationToken,
        sender: mpsc::UnboundedSender<JobEvent>,
        events: &mut mpsc::UnboundedReceiver<JobEvent>,
    ) -> Result<Vec<(usize, TaskOutput)>, StoreError> {
        for node in participants {
            if *node == self.id {
                let engine = self.clone();
                let job = job.clone();
                let task = task.clone();
                let token = token.child_token();
                let sender = sender.clone();
                tokio::spawn(async move {
                    let event = match engine.execute(&job, task, &token).await {
                        Ok(output) => JobEvent::Done(engine.id, output),
                        Err(e) => JobEvent::Failed(engine.id, e),
                    };
                    let _ = sender.send(event);
                });
            } else {
                let msg = NodeMsg::Task(TaskMsg::Run {
                    job: job.clone(),
                    task: task.clone(),
                });
                self.network
                    .send_msg(*node, msg)
                    .await
                    .map_err(|_| StoreError::unavailable(*node, "run task"))?;
            }
        }
        debug!("Job {} dispatched to nodes {:?}", job, participants);

        let mut outputs = BTreeMap::new();
        while outputs.len() < participants.len() {
            let event = tokio::select! {
                _ = token.cancelled() => {
                    return Err(StoreError::Cancelled { job: job.clone() });
                }
                event = events.recv() => event,
            };
            match event {
                Some(JobEvent::Done(node, output)) => {
                    debug!("Node {} finished its part of job {}", node, job);
                    outputs.insert(node, output);
                }
                Some(JobEvent::Failed(node, e)) => {
                    warn!("Node {} failed its part of job {}: {}", node, job, e);
                    return Err(e);
                }
                Some(JobEvent::Lost(node)) => {
                    if participants.contains(&node) && !outputs.contains_key(&node) {
                        return Err(StoreError::unavailable(node, "run task"));
                    }
                }
                None => return Err(StoreError::Cancelled { job: job.clone() }),
            }
        }
        Ok(outputs.into_iter().collect())
    }

    async fn execute(
        self: &Arc<Self>,
        job: &Key,
        task: Task,
        token: &CancellationToken,
    ) -> Result<TaskOutput, StoreError> {
        match task {
            Task::GroupBy(t) => Ok(TaskOutput::GroupBy(
                group_by::map_chunks(self, job, t, token).await?,
            )),
            Task::Probe(t) => Ok(TaskOutput::Probe(
                merge::probe_chunks(self, job, t, token).await?,
            )),
        }
    }

    /// Handles a `TaskMsg` from the node `from`. Called by the message loop,
    /// tasks are spawned so that the loop is never blocked by them.
    pub(crate) async fn handle_msg(self: &Arc<Self>, from: usize, msg: TaskMsg) {
        match msg {
            TaskMsg::Run { job, task } => {
                // registered before the loop reads the next message, so a
                // `Cancel` that follows always finds it
                let token = CancellationToken::new();
                self.running.lock().await.insert(job.clone(), token.clone());
                let engine = self.clone();
                tokio::spawn(async move {
                    let result = engine.execute(&job, task, &token).await;
                    engine.running.lock().await.remove(&job);
                    let reply = match result {
                        Ok(output) => TaskMsg::Done {
                            job: job.clone(),
                            output,
                        },
                        Err(e) => TaskMsg::Failed {
                            job: job.clone(),
                            error: RemoteError::from(&e),
                        },
                    };
                    if let Err(e) = engine.network.send_msg(from, NodeMsg::Task(reply)).await {
                        error!("Could not report job {} to node {}: {}", job, from, e);
                    }
                });
            }
            TaskMsg::Done { job, output } => {
                self.deliver(&job, JobEvent::Done(from, output)).await
            }
            TaskMsg::Failed { job, error } => {
                let e = error.into_store_error(from);
                self.deliver(&job, JobEvent::Failed(from, e)).await
            }
            TaskMsg::Cancel { job } => {
                if let Some(token) = self.running.lock().await.get(&job) {
                    info!("Cancelling job {} at the request of node {}", job, from);
                    token.cancel();
                }
            }
        }
    }

    /// Fails every job waiting on `node` and stops the tasks of jobs
    /// coordinated by it.
    pub(crate) async fn peer_lost(&self, node: usize) {
        for sender in self.jobs.lock().await.values() {
            let _ = sender.send(JobEvent::Lost(node));
        }
        for (job, token) in self.running.lock().await.iter() {
            if job.home == node {
                warn!("Coordinator of job {} was lost, cancelling it", job);
                token.cancel();
            }
        }
    }

    async fn deliver(&self, job: &Key, event: JobEvent) {
        match self.jobs.lock().await.get(job) {
            Some(sender) => {
                let _ = sender.send(event);
            }
            None => debug!("Dropping a result for finished job {}", job),
        }
    }

    /// Runs `f` on every element of `inputs` on this node's task threads and
    /// returns the results in the order of `inputs`. `token` is checked
    /// before each call of `f`.
    ///
    /// ## Errors
    /// `Cancelled` if `token` was cancelled before every input was processed,
    /// otherwise the error of the first input that failed
    pub(crate) async fn run_chunk_tasks<I, O, F>(
        &self,
        job: &Key,
        token: &CancellationToken,
        inputs: Vec<I>,
        f: F,
    ) -> Result<Vec<O>, StoreError>
    where
        I: Send + Sync + 'static,
        O: Send + 'static,
        F: Fn(&I) -> Result<O, StoreError> + Send + Sync + 'static,
    {
        let threads = self.threads.min(inputs.len()).max(1);
        let token = token.clone();
        let task_job = job.clone();
        match tokio::task::spawn_blocking(move || {
            run_on_threads(threads, &task_job, &token, &inputs, &f)
        })
        .await
        {
            Ok(result) => result,
            Err(e) => {
                error!("Chunk tasks of job {} did not complete: {}", job, e);
                Err(StoreError::TaskPanicked { job: job.clone() })
            }
        }
    }
}

/// Splits `inputs` between `threads` scoped threads which take the next
/// unprocessed input until there are none left, the token is cancelled or
/// an input fails.
fn run_on_threads<I, O, F>(
    threads: usize,
    job: &Key,
    token: &CancellationToken,
    inputs: &[I],
    f: &F,
) -> Result<Vec<O>, StoreError>
where
    I: Sync,
    O: Send,
    F: Fn(&I) -> Result<O, StoreError> + Sync,
{
    let next = AtomicUsize::new(0);
    let failed = AtomicBool::new(false);
    let joined = thread::scope(|s| {
        let mut handles = Vec::with_capacity(threads);
        for _ in 0..threads {
            handles.push(s.spawn(|_| {
                let mut done = Vec::new();
                while !token.is_cancelled() && !failed.load(Ordering::SeqCst) {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    if i >= inputs.len() {
                        break;
                    }
                    let result = f(&inputs[i]);
                    if result.is_err() {
                        failed.store(true, Ordering::SeqCst);
                    }
                    done.push((i, result));
                }
                done
            }));
        }
        handles.into_iter().map(|h| h.join()).collect::<Vec<_>>()
    })
    .map_err(|_| StoreError::TaskPanicked { job: job.clone() })?;

    let mut results = Vec::with_capacity(inputs.len());
    for done in joined {
        let done = done.map_err(|_| StoreError::TaskPanicked { job: job.clone() })?;
        results.extend(done);
    }
    results.sort_by_key(|(i, _)| *i);
    let mut outputs = Vec::with_capacity(results.len());
    for (_, result) in results {
        outputs.push(result?);
    }
    if outputs.len() < inputs.len() {
        debug!(
            "Job {} stopped after {} of {} chunk tasks",
            job,
            outputs.len(),
            inputs.len()
        );
        return Err(StoreError::Cancelled { job: job.clone() });
    }
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KeyKind;

    fn job() -> Key {
        Key::new("job", 1, KeyKind::Frame)
    }

    #[test]
    fn test_results_keep_input_order() {
        let token = CancellationToken::new();
        let inputs: Vec<usize> = (0..100).collect();
        let out = run_on_threads(4, &job(), &token, &inputs, &|i: &usize| Ok(i * 2)).unwrap();
        assert_eq!(out, (0..100).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_cancelled_token_runs_nothing() {
        let token = CancellationToken::new();
        token.cancel();
        let calls = AtomicUsize::new(0);
        let inputs: Vec<usize> = (0..10).collect();
        let result = run_on_threads(2, &job(), &token, &inputs, &|i: &usize| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(*i)
        });
        assert!(matches!(result, Err(StoreError::Cancelled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_cancelling_mid_way_stops_scheduling() {
        let token = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let inputs: Vec<usize> = (0..50).collect();
        let result = run_on_threads(1, &job(), &token, &inputs, &|i: &usize| {
            calls.fetch_add(1, Ordering::SeqCst);
            if *i == 9 {
                token.cancel();
            }
            Ok(*i)
        });
        assert!(matches!(result, Err(StoreError::Cancelled { .. })));
        // the task that cancelled finished, no new one started
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_first_error_in_input_order_is_returned() {
        let token = CancellationToken::new();
        let inputs: Vec<usize> = (0..20).collect();
        let result = run_on_threads(1, &job(), &token, &inputs, &|i: &usize| {
            if *i >= 5 {
                Err(StoreError::RowIndexOutOfBounds(*i as u64))
            } else {
                Ok(*i)
            }
        });
        assert!(matches!(result, Err(StoreError::RowIndexOutOfBounds(5))));
    }
}
