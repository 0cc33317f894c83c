//! Stage chains keyed by task type.
//!
//! A [`Pipeline`] is the ordered list of named stages registered for one task
//! type. Each stage receives the previous stage's output; the first stage
//! receives [`StageInput::Begin`]. Stage chains are built at setup time and
//! shared read-only by every running task of that type.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{trace, warn};

use super::context::TaskContext;
use super::task::{Task, TaskStatus};
use crate::error::TaskError;

/// Input handed to a stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageInput {
    /// Marker for the first stage of a run; never produced by a stage.
    Begin,
    /// Output of the previous stage.
    Value(Value),
}

impl StageInput {
    pub fn is_begin(&self) -> bool {
        matches!(self, StageInput::Begin)
    }

    /// The previous stage's output, or `None` at the start of the pipeline.
    pub fn into_value(self) -> Option<Value> {
        match self {
            StageInput::Begin => None,
            StageInput::Value(v) => Some(v),
        }
    }
}

/// One processing step of a pipeline.
///
/// Implemented for any `Fn(TaskContext, Arc<Task>, StageInput) -> impl Future`
/// so plain async closures can be registered directly.
#[async_trait]
pub trait StageHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        ctx: TaskContext,
        task: Arc<Task>,
        input: StageInput,
    ) -> Result<Value, TaskError>;
}

#[async_trait]
impl<F, Fut> StageHandler for F
where
    F: Fn(TaskContext, Arc<Task>, StageInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
{
    async fn handle(
        &self,
        ctx: TaskContext,
        task: Arc<Task>,
        input: StageInput,
    ) -> Result<Value, TaskError> {
        (self)(ctx, task, input).await
    }
}

/// A named stage.
#[derive(Clone)]
pub struct Stage {
    name: String,
    handler: Arc<dyn StageHandler>,
}

impl Stage {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage").field("name", &self.name).finish()
    }
}

/// The stage chain for one task type.
#[derive(Debug, Clone)]
pub struct Pipeline {
    task_type: String,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Runs the stages in order.
    ///
    /// Before every stage the task status and the context are checked, so a
    /// canceled or expired task never enters another stage. The first stage
    /// error ends the run.
    pub async fn process(
        &self,
        ctx: &TaskContext,
        task: &Arc<Task>,
        input: StageInput,
    ) -> Result<Value, TaskError> {
        let mut input = input;

        for stage in &self.stages {
            if task.status() == TaskStatus::Canceled {
                return Err(TaskError::Canceled);
            }
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            task.push_path(&stage.name);
            trace!(task_id = %task.id(), stage = %stage.name, "Entering stage");

            let output = stage
                .handler
                .handle(ctx.clone(), Arc::clone(task), input)
                .await?;
            input = StageInput::Value(output);
        }

        Ok(input.into_value().unwrap_or(Value::Null))
    }

    fn upsert(&mut self, stage: Stage) {
        match self.stages.iter_mut().find(|s| s.name == stage.name) {
            Some(existing) => {
                warn!(
                    task_type = %self.task_type,
                    stage = %stage.name,
                    "Stage registered twice, replacing handler"
                );
                existing.handler = stage.handler;
            }
            None => self.stages.push(stage),
        }
    }
}

/// Table of pipelines, one per task type.
#[derive(Default)]
pub struct Pipelines {
    table: Mutex<HashMap<String, Arc<Pipeline>>>,
}

impl Pipelines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a stage to the pipeline for `task_type`, creating the pipeline on
    /// first use. Registering a stage name that already exists for this type
    /// replaces its handler in place.
    pub fn register<F, Fut>(
        &self,
        task_type: impl Into<String>,
        name: impl Into<String>,
        handler: F,
    ) -> PipelineHandle<'_>
    where
        F: Fn(TaskContext, Arc<Task>, StageInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.register_handler(task_type, name, Arc::new(handler))
    }

    /// Like [`register`](Self::register) for an already boxed handler.
    pub fn register_handler(
        &self,
        task_type: impl Into<String>,
        name: impl Into<String>,
        handler: Arc<dyn StageHandler>,
    ) -> PipelineHandle<'_> {
        let task_type = task_type.into();
        let stage = Stage {
            name: name.into(),
            handler,
        };

        {
            let mut table = self.table.lock().expect("lock not poisoned");
            let pipeline = table.entry(task_type.clone()).or_insert_with(|| {
                Arc::new(Pipeline {
                    task_type: task_type.clone(),
                    stages: Vec::new(),
                })
            });
            // tasks already running keep their own snapshot
            Arc::make_mut(pipeline).upsert(stage);
        }

        PipelineHandle {
            pipelines: self,
            task_type,
        }
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<Pipeline>> {
        self.table
            .lock()
            .expect("lock not poisoned")
            .get(task_type)
            .cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.table
            .lock()
            .expect("lock not poisoned")
            .contains_key(task_type)
    }

    pub fn stage_names(&self, task_type: &str) -> Option<Vec<String>> {
        self.get(task_type).map(|p| p.stage_names())
    }

    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .table
            .lock()
            .expect("lock not poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}

/// Returned by registration to chain further stages onto the same type.
pub struct PipelineHandle<'a> {
    pipelines: &'a Pipelines,
    task_type: String,
}

impl<'a> PipelineHandle<'a> {
    pub fn append<F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(TaskContext, Arc<Task>, StageInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        self.pipelines.register(self.task_type, name, handler)
    }

    pub fn append_handler(self, name: impl Into<String>, handler: Arc<dyn StageHandler>) -> Self {
        self.pipelines
            .register_handler(self.task_type, name, handler)
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }
}
