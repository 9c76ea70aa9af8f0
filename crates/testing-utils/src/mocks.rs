//! Mock implementations of the external ports
//!
//! The calculation function, the remote executor and the random chooser are
//! replaced by deterministic in-memory doubles that record every call.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use scheduler_domain::{
    Account, CalculationResult, Calculator, Chooser, Entity, Host, Parameters, RemoteExecutor,
};
use scheduler_errors::{SchedulerError, SchedulerResult};

/// Instructions a typical parallel "static" calculation hands back
pub fn static_instructions() -> Parameters {
    json!({
        "serial": false,
        "binary": "vasp_53",
        "mpi": "mpirun -np $NPROCS",
        "walltime": 14400.0
    })
    .as_object()
    .cloned()
    .unwrap_or_default()
}

/// A recorded `compute` call
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeCall {
    pub module: String,
    pub entity_id: i64,
    pub parameters: Parameters,
}

#[derive(Debug)]
struct CalculatorState {
    queued: VecDeque<SchedulerResult<CalculationResult>>,
    fallback: CalculationResult,
    calls: Vec<ComputeCall>,
}

/// Mock calculation function
///
/// Queued results are returned first, after that the fallback result is
/// returned on every call.
#[derive(Debug, Clone)]
pub struct MockCalculator {
    state: Arc<Mutex<CalculatorState>>,
}

impl MockCalculator {
    pub fn returning(result: CalculationResult) -> Self {
        Self {
            state: Arc::new(Mutex::new(CalculatorState {
                queued: VecDeque::new(),
                fallback: result,
                calls: Vec::new(),
            })),
        }
    }

    /// Unconverged calculation asking for a parallel job
    pub fn needs_job(kind: &str) -> Self {
        Self::returning(CalculationResult {
            kind: kind.to_string(),
            converged: false,
            instructions: static_instructions(),
        })
    }

    pub fn converged(kind: &str) -> Self {
        Self::returning(CalculationResult {
            kind: kind.to_string(),
            converged: true,
            instructions: Parameters::new(),
        })
    }

    pub fn unconverged(kind: &str) -> Self {
        Self::returning(CalculationResult {
            kind: kind.to_string(),
            converged: false,
            instructions: Parameters::new(),
        })
    }

    pub fn push_result(&self, result: CalculationResult) {
        self.state.lock().unwrap().queued.push_back(Ok(result));
    }

    pub fn push_error(&self, error: SchedulerError) {
        self.state.lock().unwrap().queued.push_back(Err(error));
    }

    pub fn set_fallback(&self, result: CalculationResult) {
        self.state.lock().unwrap().fallback = result;
    }

    pub fn calls(&self) -> Vec<ComputeCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }
}

#[async_trait]
impl Calculator for MockCalculator {
    async fn compute(
        &self,
        module: &str,
        entity: &Entity,
        parameters: &Parameters,
    ) -> SchedulerResult<CalculationResult> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ComputeCall {
            module: module.to_string(),
            entity_id: entity.id,
            parameters: parameters.clone(),
        });
        match state.queued.pop_front() {
            Some(result) => result,
            None => Ok(state.fallback.clone()),
        }
    }
}

/// A recorded remote operation
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Submit {
        host: String,
        username: String,
        source: PathBuf,
        run_path: String,
        script: String,
    },
    ListRunning {
        host: String,
    },
    MoveFiles {
        host: String,
        run_path: String,
        destination: PathBuf,
        pattern: String,
        remove_source: bool,
    },
    Execute {
        host: String,
        command: String,
        ignore_failure: bool,
    },
}

#[derive(Debug)]
struct RemoteState {
    next_queue_id: u64,
    running: HashSet<String>,
    fail_submit: bool,
    fail_listing: bool,
    fail_move: bool,
    calls: Vec<RemoteCall>,
}

/// Mock remote executor simulating a batch queue
///
/// Submitted jobs get sequential queue ids starting at 1000 and stay in the
/// listing until `finish` is called.
#[derive(Debug, Clone)]
pub struct MockRemoteExecutor {
    state: Arc<Mutex<RemoteState>>,
}

impl Default for MockRemoteExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemoteExecutor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState {
                next_queue_id: 1000,
                running: HashSet::new(),
                fail_submit: false,
                fail_listing: false,
                fail_move: false,
                calls: Vec::new(),
            })),
        }
    }

    /// Remove a job from the queue listing
    pub fn finish(&self, queue_id: &str) {
        self.state.lock().unwrap().running.remove(queue_id);
    }

    /// Put an unrelated job id into the listing so it is never empty
    pub fn add_running(&self, queue_id: &str) {
        self.state
            .lock()
            .unwrap()
            .running
            .insert(queue_id.to_string());
    }

    pub fn running(&self) -> HashSet<String> {
        self.state.lock().unwrap().running.clone()
    }

    pub fn fail_submit(&self, fail: bool) {
        self.state.lock().unwrap().fail_submit = fail;
    }

    pub fn fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_listing = fail;
    }

    pub fn fail_move(&self, fail: bool) {
        self.state.lock().unwrap().fail_move = fail;
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn submitted_count(&self) -> usize {
        self.count(|call| matches!(call, RemoteCall::Submit { .. }))
    }

    pub fn listing_count(&self) -> usize {
        self.count(|call| matches!(call, RemoteCall::ListRunning { .. }))
    }

    pub fn move_count(&self) -> usize {
        self.count(|call| matches!(call, RemoteCall::MoveFiles { .. }))
    }

    fn count(&self, predicate: impl Fn(&RemoteCall) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }
}

#[async_trait]
impl RemoteExecutor for MockRemoteExecutor {
    async fn submit(
        &self,
        account: &Account,
        host: &Host,
        source: &Path,
        run_path: &str,
        script: &str,
    ) -> SchedulerResult<String> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RemoteCall::Submit {
            host: host.name.clone(),
            username: account.username.clone(),
            source: source.to_path_buf(),
            run_path: run_path.to_string(),
            script: script.to_string(),
        });
        if state.fail_submit {
            return Err(SchedulerError::remote("submit", "connection refused"));
        }
        let queue_id = state.next_queue_id.to_string();
        state.next_queue_id += 1;
        state.running.insert(queue_id.clone());
        Ok(queue_id)
    }

    async fn list_running(&self, _account: &Account, host: &Host) -> SchedulerResult<HashSet<String>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RemoteCall::ListRunning {
            host: host.name.clone(),
        });
        if state.fail_listing {
            return Err(SchedulerError::remote("list_running", "timeout"));
        }
        Ok(state.running.clone())
    }

    async fn move_files(
        &self,
        _account: &Account,
        host: &Host,
        run_path: &str,
        destination: &Path,
        pattern: &str,
        remove_source: bool,
    ) -> SchedulerResult<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(RemoteCall::MoveFiles {
            host: host.name.clone(),
            run_path: run_path.to_string(),
            destination: destination.to_path_buf(),
            pattern: pattern.to_string(),
            remove_source,
        });
        if state.fail_move {
            return Err(SchedulerError::remote("move_files", "no route to host"));
        }
        Ok(())
    }

    async fn execute(
        &self,
        _account: &Account,
        host: &Host,
        command: &str,
        ignore_failure: bool,
    ) -> SchedulerResult<String> {
        self.state.lock().unwrap().calls.push(RemoteCall::Execute {
            host: host.name.clone(),
            command: command.to_string(),
            ignore_failure,
        });
        Ok(String::new())
    }
}

/// Chooser returning a scripted sequence of indices, then always the first item
#[derive(Debug, Clone, Default)]
pub struct SequenceChooser {
    picks: Arc<Mutex<VecDeque<usize>>>,
}

impl SequenceChooser {
    pub fn new(picks: impl IntoIterator<Item = usize>) -> Self {
        Self {
            picks: Arc::new(Mutex::new(picks.into_iter().collect())),
        }
    }

    pub fn first() -> Self {
        Self::default()
    }
}

impl Chooser for SequenceChooser {
    fn pick(&self, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let next = self.picks.lock().unwrap().pop_front().unwrap_or(0);
        Some(next % len)
    }
}
