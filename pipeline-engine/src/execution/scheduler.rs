// Job Scheduler
// Walks the job graph, dispatching ready instances under the concurrency limits

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::execution::aggregator::{JobOutcome, JobResult};
use crate::execution::context::RunContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::JobGraph;
use crate::execution::matrix::MatrixExpander;
use crate::execution::report::{RunOutcome, RunReport};
use crate::expression::GateEvaluator;
use crate::model::{JobInstance, JobState, JobTemplate, SkipReason};
use crate::notify::NotificationSink;
use crate::runners::{JobDispatch, StepError, StepOutcome, StepRunner};
use crate::secrets::{JobEnvironment, SecretPropagator, SecretStore};
use crate::services::{ServiceBackend, ServiceLease, ServiceManager};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runs a job graph to completion.
///
/// A single decision loop owns all instance state. Job instances run as
/// tokio tasks and report back over a channel; the loop records the
/// outcome, re-evaluates the dependents and dispatches whatever became
/// ready, never exceeding the global ceiling or a template's `max_parallel`.
pub struct Scheduler {
    config: EngineConfig,
    runner: Arc<dyn StepRunner>,
    services: ServiceManager,
    secrets: SecretPropagator,
    sinks: Vec<Arc<dyn NotificationSink>>,
    event_tx: Option<ProgressSender>,
}

impl Scheduler {
    pub fn new(
        config: EngineConfig,
        runner: Arc<dyn StepRunner>,
        backend: Arc<dyn ServiceBackend>,
        store: Arc<dyn SecretStore>,
    ) -> Self {
        let services = ServiceManager::new(backend, &config);
        Self {
            config,
            runner,
            services,
            secrets: SecretPropagator::new(store),
            sinks: Vec::new(),
            event_tx: None,
        }
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Add a consumer of the final run report
    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    /// Execute every job of `graph` in `ctx`.
    ///
    /// Returns the report of the finished run. Runtime failures of single
    /// instances are part of the report; `Err` is reserved for invalid graphs
    /// and engine misuse (unknown condition fields, duplicate results), in
    /// which case the run is cancelled and drained before returning.
    pub async fn run(
        &self,
        graph: &JobGraph,
        ctx: RunContext,
        cancel: CancellationToken,
    ) -> EngineResult<RunReport> {
        let start = Instant::now();
        let (mut state, order) = RunState::prepare(graph, ctx, self.event_tx.clone())?;
        let limit = self.config.concurrency_limit();

        info!(
            jobs = graph.len(),
            instances = state.ctx.instances().len(),
            max_concurrency = limit,
            "pipeline run started"
        );
        self.event_tx.send_event(ExecutionEvent::RunStarted {
            total_jobs: graph.len(),
            total_instances: state.ctx.instances().len(),
        });

        let run_token = cancel.child_token();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Completion>();
        let mut fatal: Option<EngineError> = None;

        for t in order {
            if let Err(e) = state.resolve_template(t) {
                fatal = Some(e);
                run_token.cancel();
                break;
            }
        }

        loop {
            if run_token.is_cancelled() && !state.cancelled {
                if fatal.is_none() {
                    info!("pipeline run cancelled");
                }
                if let Err(e) = state.cancel_pending() {
                    fatal.get_or_insert(e);
                }
            }

            if !state.cancelled {
                for idx in state.dispatchable(limit) {
                    self.dispatch(&mut state, idx, &run_token, &done_tx);
                }
            }

            if state.running == 0 {
                break;
            }

            tokio::select! {
                Some(done) = done_rx.recv() => {
                    let cancelled = run_token.is_cancelled();
                    if let Err(e) = state.complete(done, cancelled) {
                        error!(error = %e, "aborting pipeline run");
                        fatal.get_or_insert(e);
                        run_token.cancel();
                    }
                }
                _ = run_token.cancelled(), if !state.cancelled => {}
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        state.finish_stragglers()?;

        let outcome = if state.cancelled {
            RunOutcome::Cancelled
        } else if state.required_unmet() {
            RunOutcome::Failed
        } else {
            RunOutcome::Succeeded
        };
        let duration = start.elapsed();

        self.event_tx
            .send_event(ExecutionEvent::RunCompleted { outcome, duration });

        let results = state.ctx.results().snapshot();
        let report = RunReport {
            outcome,
            instances: state.ctx.into_instances(),
            results,
            warnings: state.warnings,
            duration,
        };

        info!(outcome = %report.outcome, duration = ?duration, "pipeline run finished");
        for sink in &self.sinks {
            sink.notify(&report).await;
        }

        Ok(report)
    }

    fn dispatch(
        &self,
        state: &mut RunState,
        idx: usize,
        run_token: &CancellationToken,
        done_tx: &mpsc::UnboundedSender<Completion>,
    ) {
        let t = state.template_of[idx];
        let template = state.templates[t].clone();
        state.ready.remove(&idx);
        state.running += 1;
        state.running_per_template[t] += 1;

        let instance = state.ctx.instance_at_mut(idx);
        instance.advance(JobState::Running);
        let instance = instance.clone();

        debug!(instance = %instance.id, "dispatching job");
        self.event_tx.send_event(ExecutionEvent::job_started(
            &instance.id,
            &template.name,
            template.steps.len(),
        ));

        let timeout = template
            .timeout_secs
            .map(Duration::from_secs)
            .or_else(|| self.config.default_job_timeout());

        let task = InstanceTask {
            instance,
            template,
            run_env: state.ctx.env.clone(),
            runner: self.runner.clone(),
            services: self.services.clone(),
            secrets: self.secrets.clone(),
            cancel: run_token.child_token(),
            progress: self.event_tx.clone(),
            timeout,
        };
        let done_tx = done_tx.clone();
        let services = self.services.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let id = task.instance.id.clone();

            // Inner task so a panicking runner still reports a completion
            let result = match tokio::spawn(task.execute()).await {
                Ok(result) => result,
                Err(e) => Err(EngineError::StepExecution {
                    job: id.to_string(),
                    source: StepError::Other(format!("job task aborted: {}", e)),
                }),
            };
            services.release_owned(&id).await;

            let _ = done_tx.send(Completion {
                idx,
                result,
                duration: started.elapsed(),
            });
        });
    }
}

/// Message from a finished instance task to the decision loop
struct Completion {
    idx: usize,
    result: EngineResult<StepOutcome>,
    duration: Duration,
}

enum Resolution {
    Waiting,
    Ready,
    Skip(SkipReason),
}

/// Bookkeeping of one run, owned by the decision loop
struct RunState {
    templates: Vec<Arc<JobTemplate>>,
    ctx: RunContext,
    /// Template index of every instance
    template_of: Vec<usize>,
    /// Instance indices of every template
    by_template: Vec<Vec<usize>>,
    /// Templates to re-resolve when a template's aggregate outcome may change
    waiters: Vec<Vec<usize>>,
    ready: BTreeSet<usize>,
    running: usize,
    running_per_template: Vec<usize>,
    cancelled: bool,
    warnings: Vec<String>,
    events: Option<ProgressSender>,
}

impl RunState {
    /// Expand every template and check its condition. Returns the state and
    /// the template indices in topological order.
    fn prepare(
        graph: &JobGraph,
        mut ctx: RunContext,
        events: Option<ProgressSender>,
    ) -> EngineResult<(Self, Vec<usize>)> {
        let order = graph.topological_indices()?;

        let templates: Vec<Arc<JobTemplate>> =
            graph.templates().iter().cloned().map(Arc::new).collect();
        let mut template_of = Vec::new();
        let mut by_template = Vec::with_capacity(templates.len());
        let mut warnings = Vec::new();

        for (t, template) in templates.iter().enumerate() {
            let expansion = MatrixExpander::expand(template);
            for message in expansion.warnings {
                events.send_event(ExecutionEvent::warning(
                    message.clone(),
                    Some(template.name.clone()),
                ));
                warnings.push(message);
            }
            let indices = ctx.add_instances(&template.name, expansion.instances);
            template_of.resize(ctx.instances().len(), t);
            by_template.push(indices);
        }

        for template in &templates {
            GateEvaluator::check_references(&template.condition, &ctx)?;
        }

        let mut waiters = vec![Vec::new(); templates.len()];
        for (t, template) in graph.templates().iter().enumerate() {
            for dep in graph.dependency_indices(template) {
                waiters[dep].push(t);
            }
        }

        let state = Self {
            running_per_template: vec![0; templates.len()],
            templates,
            ctx,
            template_of,
            by_template,
            waiters,
            ready: BTreeSet::new(),
            running: 0,
            cancelled: false,
            warnings,
            events,
        };
        Ok((state, order))
    }

    /// Decide what the undecided instances of a template do next.
    /// Returns true when they were skipped, which changes the template's outcome.
    fn resolve_template(&mut self, t: usize) -> EngineResult<bool> {
        let undecided: Vec<usize> = self.by_template[t]
            .iter()
            .copied()
            .filter(|&i| {
                matches!(
                    self.ctx.instance_at(i).state,
                    JobState::Pending | JobState::Blocked
                )
            })
            .collect();
        if undecided.is_empty() {
            return Ok(false);
        }

        match self.resolution(t)? {
            Resolution::Waiting => {
                for i in undecided {
                    self.ctx.instance_at_mut(i).advance(JobState::Blocked);
                }
                Ok(false)
            }
            Resolution::Ready => {
                for i in undecided {
                    let instance = self.ctx.instance_at_mut(i);
                    instance.advance(JobState::Ready);
                    let id = instance.id.clone();
                    self.ready.insert(i);
                    self.events.send_event(ExecutionEvent::JobReady { instance: id });
                }
                Ok(false)
            }
            Resolution::Skip(reason) => {
                for i in undecided {
                    self.skip_instance(i, reason.clone())?;
                }
                Ok(true)
            }
        }
    }

    fn resolution(&self, t: usize) -> EngineResult<Resolution> {
        let template = &self.templates[t];
        let results = self.ctx.results();
        let mut waiting = false;

        for dep in &template.depends_on {
            match results.query(dep) {
                Some(JobOutcome::Failed) => {
                    return Ok(Resolution::Skip(SkipReason::DependencyFailed(dep.clone())))
                }
                Some(JobOutcome::Skipped) if !template.tolerate_skipped => {
                    return Ok(Resolution::Skip(SkipReason::DependencySkipped(dep.clone())))
                }
                Some(_) => {}
                None => waiting = true,
            }
        }
        for job in template.condition.referenced_jobs() {
            if results.query(job).is_none() {
                waiting = true;
            }
        }
        if waiting {
            return Ok(Resolution::Waiting);
        }

        if GateEvaluator::evaluate(&template.condition, &self.ctx)? {
            Ok(Resolution::Ready)
        } else {
            Ok(Resolution::Skip(SkipReason::ConditionFalse))
        }
    }

    /// Re-resolve everything waiting on `changed`, cascading skips
    fn settle(&mut self, changed: usize) -> EngineResult<()> {
        let mut queue = VecDeque::from([changed]);
        while let Some(t) = queue.pop_front() {
            for w in self.waiters[t].clone() {
                if self.resolve_template(w)? {
                    queue.push_back(w);
                }
            }
        }
        Ok(())
    }

    fn skip_instance(&mut self, idx: usize, reason: SkipReason) -> EngineResult<()> {
        let instance = self.ctx.instance_at_mut(idx);
        if !instance.skip(reason.clone()) {
            return Ok(());
        }
        let result = JobResult::new(instance, JobOutcome::Skipped);
        let id = instance.id.clone();
        self.ready.remove(&idx);
        self.ctx.results().record(result)?;

        debug!(instance = %id, reason = %reason, "job skipped");
        self.events.send_event(ExecutionEvent::job_skipped(&id, reason));
        Ok(())
    }

    /// Ready instances that fit under the limits, lowest index first
    fn dispatchable(&self, limit: usize) -> Vec<usize> {
        let mut running = self.running;
        let mut per_template = self.running_per_template.clone();
        let mut picked = Vec::new();

        for &idx in &self.ready {
            if running >= limit {
                break;
            }
            let t = self.template_of[idx];
            if let Some(cap) = self.templates[t].parallel_limit() {
                if per_template[t] >= cap {
                    continue;
                }
            }
            per_template[t] += 1;
            running += 1;
            picked.push(idx);
        }
        picked
    }

    /// Apply the result of a finished instance task
    fn complete(&mut self, done: Completion, run_cancelled: bool) -> EngineResult<()> {
        let idx = done.idx;
        let t = self.template_of[idx];
        self.running -= 1;
        self.running_per_template[t] -= 1;
        let template = self.templates[t].clone();

        let instance = self.ctx.instance_at_mut(idx);
        let mut artifacts = Vec::new();
        let mut output = None;

        match done.result {
            Ok(step) => {
                instance.exit_status = Some(step.exit_status);
                if step.succeeded() {
                    instance.advance(JobState::Succeeded);
                } else {
                    instance.error = Some(format!("step exited with status {}", step.exit_status));
                    instance.advance(JobState::Failed);
                }
                artifacts = step.artifacts;
                output = step.output;
            }
            Err(e) if run_cancelled && is_cancellation(&e) => {
                instance.skip(SkipReason::Cancelled);
            }
            Err(e) => {
                instance.error = Some(e.to_string());
                instance.advance(JobState::Failed);
            }
        }

        let outcome = match JobOutcome::from_state(instance.state) {
            Some(outcome) => outcome,
            None => {
                warn!(instance = %instance.id, state = %instance.state, "job ended without a terminal state");
                instance.error = Some(format!("job ended in state {}", instance.state));
                instance.state = JobState::Failed;
                JobOutcome::Failed
            }
        };
        let id = instance.id.clone();
        let exit_status = instance.exit_status;
        let failure = instance.error.clone();
        let result = JobResult::new(instance, outcome)
            .with_artifacts(artifacts)
            .with_output(output);
        self.ctx.results().record(result)?;

        match outcome {
            JobOutcome::Skipped => {
                debug!(instance = %id, "job cancelled");
                self.events
                    .send_event(ExecutionEvent::job_skipped(&id, SkipReason::Cancelled));
            }
            JobOutcome::Succeeded => {
                info!(instance = %id, duration = ?done.duration, "job succeeded");
                self.events.send_event(ExecutionEvent::job_completed(
                    &id,
                    outcome,
                    exit_status,
                    done.duration,
                ));
            }
            JobOutcome::Failed => {
                warn!(
                    instance = %id,
                    error = failure.as_deref().unwrap_or_default(),
                    "job failed"
                );
                self.events.send_event(ExecutionEvent::job_completed(
                    &id,
                    outcome,
                    exit_status,
                    done.duration,
                ));
                if !template.required {
                    let message = format!("optional job '{}' failed", id);
                    self.events
                        .send_event(ExecutionEvent::warning(message.clone(), Some(template.name.clone())));
                    self.warnings.push(message);
                }
            }
        }

        if run_cancelled {
            return Ok(());
        }
        self.settle(t)
    }

    /// Skip every instance that has not started yet
    fn cancel_pending(&mut self) -> EngineResult<()> {
        self.cancelled = true;
        self.ready.clear();
        for idx in 0..self.ctx.instances().len() {
            let state = self.ctx.instance_at(idx).state;
            if matches!(state, JobState::Pending | JobState::Blocked | JobState::Ready) {
                self.skip_instance(idx, SkipReason::Cancelled)?;
            }
        }
        Ok(())
    }

    /// Instances still undecided after the loop drained. Only reachable when
    /// a dependency never reported, which would leave them blocked forever.
    fn finish_stragglers(&mut self) -> EngineResult<()> {
        for idx in 0..self.ctx.instances().len() {
            let instance = self.ctx.instance_at(idx);
            if !instance.state.is_terminal() {
                warn!(instance = %instance.id, state = %instance.state, "job never became ready");
                self.skip_instance(idx, SkipReason::Cancelled)?;
            }
        }
        Ok(())
    }

    /// A required instance that did not succeed, other than one whose own
    /// gate evaluated false
    fn required_unmet(&self) -> bool {
        self.ctx.instances().iter().enumerate().any(|(idx, instance)| {
            self.templates[self.template_of[idx]].required
                && instance.state != JobState::Succeeded
                && instance.skip_reason != Some(SkipReason::ConditionFalse)
        })
    }
}

fn is_cancellation(e: &EngineError) -> bool {
    matches!(
        e,
        EngineError::Cancelled
            | EngineError::StepExecution {
                source: StepError::Cancelled,
                ..
            }
    )
}

/// Everything one instance needs while it runs on its own task
struct InstanceTask {
    instance: JobInstance,
    template: Arc<JobTemplate>,
    run_env: BTreeMap<String, String>,
    runner: Arc<dyn StepRunner>,
    services: ServiceManager,
    secrets: SecretPropagator,
    cancel: CancellationToken,
    progress: Option<ProgressSender>,
    timeout: Option<Duration>,
}

impl InstanceTask {
    /// Bind the environment, acquire services, run the steps, release services
    async fn execute(self) -> EngineResult<StepOutcome> {
        let id = self.instance.id.clone();
        let env = self
            .secrets
            .bind(&self.instance, &self.template, &self.run_env)
            .await?;

        let mut lease = self
            .services
            .acquire_all(&self.template.services, &id, &self.cancel)
            .await?;
        for handle in lease.handles() {
            self.progress.send_event(ExecutionEvent::ServiceReady {
                instance: id.clone(),
                service: handle.name().to_string(),
            });
        }

        let result = self.run_steps(env, &mut lease).await;
        self.release(&mut lease).await;
        result
    }

    async fn run_steps(
        &self,
        env: JobEnvironment,
        lease: &mut ServiceLease,
    ) -> EngineResult<StepOutcome> {
        let dispatch = JobDispatch {
            instance: self.instance.id.clone(),
            template: self.template.name.clone(),
            steps: self.template.steps.clone(),
            env,
            services: lease.handles().to_vec(),
            cancel: self.cancel.clone(),
            progress: self.progress.clone(),
        };

        let job = self.invoke(dispatch);
        tokio::pin!(job);

        let first = tokio::select! {
            result = &mut job => Some(result),
            _ = self.cancel.cancelled() => None,
        };
        let result = match first {
            Some(result) => result,
            None => {
                // Services go first; the runner winds down on the same token
                debug!(instance = %self.instance.id, "cancelled, releasing services");
                self.release(lease).await;
                job.await
            }
        };

        result.map_err(|source| EngineError::StepExecution {
            job: self.instance.id.to_string(),
            source,
        })
    }

    async fn invoke(&self, dispatch: JobDispatch) -> Result<StepOutcome, StepError> {
        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.runner.run(dispatch)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(instance = %self.instance.id, timeout = ?limit, "job timed out");
                    Err(StepError::JobTimeout(limit))
                }
            },
            None => self.runner.run(dispatch).await,
        }
    }

    async fn release(&self, lease: &mut ServiceLease) {
        for handle in lease.handles() {
            self.progress.send_event(ExecutionEvent::ServiceReleased {
                instance: self.instance.id.clone(),
                service: handle.name().to_string(),
            });
        }
        lease.release().await;
    }
}
