use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

/// State of a pipeline run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Tasks are being executed
    Running,
    /// Waiting for at least one suspended task to be resumed
    Suspended,
    /// Every sink produced a value
    Completed,
    /// At least one sink ended in an error
    Errored,
}

impl RunState {
    /// Whether the run is finished.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }
}

/// State of a task run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskRunState {
    /// Waiting for its predecessors
    Pending,
    /// Being executed
    Running,
    /// Produced a value
    Completed,
    /// Produced an error
    Errored,
    /// Waiting for an external result
    Suspended,
}

impl TaskRunState {
    /// Whether successors may consume the result.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }
}

/// A stored pipeline: its source and per-task duration override.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSpec {
    /// Database id
    pub id: i64,
    /// DOT source
    pub source: String,
    /// Overrides the node wide maximum task duration
    #[serde(with = "millis_opt")]
    pub max_task_duration: Option<Duration>,
}

/// One execution of a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRun {
    /// Database id
    pub id: i64,
    /// Pipeline executed
    pub pipeline_spec_id: i64,
    /// Job the run belongs to
    pub job_id: Option<i64>,
    /// Run level vars
    pub inputs: Value,
    /// Values of the sinks, in output order, once finished
    pub outputs: Option<Value>,
    /// Errors of the sinks, in output order, once finished
    pub errors: Option<Value>,
    /// Current state
    pub state: RunState,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Completion time
    pub finished_at: Option<DateTime<Utc>>,
}

/// One execution of one task within a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRun {
    /// Externally visible id, used to resume suspended tasks
    pub id: Uuid,
    /// Owning run
    pub pipeline_run_id: i64,
    /// Id of the task in the pipeline source
    pub dot_id: String,
    /// Task type name
    pub task_type: String,
    /// Topological position of the task
    pub index: i32,
    /// Value produced
    pub output: Option<Value>,
    /// Error produced
    pub error: Option<String>,
    /// Current state
    pub state: TaskRunState,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Time the task became terminal
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskRun {
    /// The result successors see.
    pub fn result(&self) -> Option<Result<Value, String>> {
        match self.state {
            TaskRunState::Completed => Some(Ok(self.output.clone().unwrap_or(Value::Null))),
            TaskRunState::Errored => Some(Err(self
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".into()))),
            _ => None,
        }
    }
}

/// A run with its task runs, as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunWithTasks {
    /// The run
    #[serde(flatten)]
    pub run: PipelineRun,
    /// Its task runs in topological order
    pub task_runs: Vec<TaskRun>,
}

/// The result recorded for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRunUpdate {
    /// Task run to update
    pub id: Uuid,
    /// New state
    pub state: TaskRunState,
    /// Value, for completed tasks
    pub output: Option<Value>,
    /// Error, for errored tasks
    pub error: Option<String>,
}

mod millis_opt {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&format!("{}ms", d.as_millis())),
            None => s.serialize_none(),
        }
    }
}
