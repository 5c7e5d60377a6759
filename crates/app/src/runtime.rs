//! Scheduler runtime — the single writer in front of [`RascalScheduler`].
//!
//! Every input goes through one loop:
//! - routine triggers and external reports arrive as [`Command`]s;
//! - device progress arrives through the runners' [`ProgressReporter`]s;
//! - timers and runner tasks post their results back as commands.
//!
//! The loop applies each input to the scheduler and carries out the returned
//! [`Effect`]s. Action runners, timers and failure detectors run on their
//! own tasks so a slow device never stalls the loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::TimeDelta;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use rascal_domain::error::RascalError;
use rascal_domain::event::{FailureNotification, RascEvent, RascEventKind};
use rascal_domain::id::{ActionId, EntityId, RoutineId};
use rascal_domain::script::{ActionPayload, Step};
use rascal_domain::time::{Timestamp, now, seconds, to_std};

use crate::estimator::{DurationEstimator, EstimatorConfig};
use crate::factory::{RoutineDefinition, RoutineFactory};
use crate::metrics::MetricsReport;
use crate::ports::{
    ActionCall, ActionRunner, EventPublisher, HistoryStore, NotificationSink, ProgressReporter, StepOutcome,
    TargetResolver,
};
use crate::scheduler::{Admission, Effect, RascalScheduler, SchedulerConfig};

/// Inputs of the runtime loop.
#[derive(Debug)]
enum Command {
    Trigger {
        definition: RoutineDefinition,
        reply: oneshot::Sender<Result<Admission, RascalError>>,
    },
    Event(RascEvent),
    Completed {
        entity_id: EntityId,
        action_id: ActionId,
        at: Timestamp,
    },
    Wake(Timestamp),
    Deadline {
        entity_id: EntityId,
        action_id: ActionId,
        at: Timestamp,
    },
    Dispatched {
        action_id: ActionId,
        outcome: StepOutcome,
    },
    Metrics(oneshot::Sender<MetricsReport>),
    Shutdown,
}

/// The external collaborators of the runtime.
pub struct RuntimePorts<R, T, P, N, H> {
    pub runner: R,
    pub resolver: T,
    pub publisher: P,
    pub notifier: N,
    pub history: H,
}

/// Everything needed to build a runtime besides its ports.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub scheduler: SchedulerConfig,
    pub estimator: EstimatorConfig,
    /// Named scripts that routine steps can call.
    pub scripts: HashMap<String, Vec<Step>>,
}

/// Bookkeeping of one dispatched action, used for learning and reporting.
struct InFlight {
    payload: ActionPayload,
    dispatched_at: Timestamp,
    started: HashMap<EntityId, Timestamp>,
    resolved: Option<oneshot::Sender<FailureNotification>>,
}

/// Owner of the scheduler state and the loop that serializes its inputs.
pub struct SchedulerRuntime<R, T, P, N, H> {
    scheduler: RascalScheduler,
    estimator: DurationEstimator,
    factory: RoutineFactory,
    runner: Arc<R>,
    resolver: T,
    publisher: P,
    notifier: Arc<N>,
    history: H,
    in_flight: HashMap<ActionId, InFlight>,
    commands: mpsc::UnboundedSender<Command>,
    progress: mpsc::UnboundedSender<RascEvent>,
    stop: watch::Receiver<bool>,
}

/// Resolves once `true` is sent on `stop`; never when the sender is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn detect_failures<N: NotificationSink>(
    notifier: Arc<N>,
    action_id: ActionId,
    resolved: oneshot::Receiver<FailureNotification>,
) {
    let Ok(notification) = resolved.await else {
        tracing::debug!(action_id = %action_id, "action abandoned before it resolved");
        return;
    };
    if notification.failed.is_empty() {
        return;
    }
    tracing::warn!(
        action_id = %action_id,
        action = %notification.action,
        failed = notification.failed.len(),
        "devices failed to complete"
    );
    if let Err(err) = notifier.notify(notification).await {
        tracing::error!(action_id = %action_id, error = %err, "failure notification not delivered");
    }
}

impl<R, T, P, N, H> SchedulerRuntime<R, T, P, N, H>
where
    R: ActionRunner + Send + Sync + 'static,
    T: TargetResolver + Send + Sync + 'static,
    P: EventPublisher + Send + Sync + 'static,
    N: NotificationSink + Send + Sync + 'static,
    H: HistoryStore + Send + Sync + 'static,
{
    /// Load the persisted histories and spawn the runtime loop.
    ///
    /// The loop runs until `true` is sent on `stop` or
    /// [`SchedulerHandle::shutdown`] is called; it saves the histories on its
    /// way out.
    ///
    /// # Errors
    ///
    /// Returns the history store's error when the histories cannot be loaded.
    #[tracing::instrument(skip_all, fields(policy = %config.scheduler.policy))]
    pub async fn start(
        config: RuntimeConfig,
        ports: RuntimePorts<R, T, P, N, H>,
        stop: watch::Receiver<bool>,
    ) -> Result<(SchedulerHandle, JoinHandle<()>), RascalError> {
        let histories = ports.history.load().await?;
        tracing::info!(histories = histories.len(), "latency histories loaded");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (progress, progress_rx) = mpsc::unbounded_channel();
        let runtime = Self {
            scheduler: RascalScheduler::new(config.scheduler),
            estimator: DurationEstimator::new(config.estimator).with_histories(histories),
            factory: RoutineFactory::new(config.scripts),
            runner: Arc::new(ports.runner),
            resolver: ports.resolver,
            publisher: ports.publisher,
            notifier: Arc::new(ports.notifier),
            history: ports.history,
            in_flight: HashMap::new(),
            commands: commands.clone(),
            progress,
            stop,
        };
        let task = tokio::spawn(runtime.run(command_rx, progress_rx));
        Ok((SchedulerHandle { commands }, task))
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut progress: mpsc::UnboundedReceiver<RascEvent>,
    ) {
        tracing::info!("scheduler runtime started");
        let mut stop = self.stop.clone();
        loop {
            let result = tokio::select! {
                () = stop_requested(&mut stop) => {
                    tracing::info!("stop requested");
                    break;
                }
                Some(command) = commands.recv() => match command {
                    Command::Shutdown => {
                        tracing::info!("shutdown requested");
                        break;
                    }
                    command => self.handle_command(command).await,
                },
                Some(event) = progress.recv() => self.handle_progress(event).await,
                else => break,
            };
            if let Err(err) = result {
                tracing::error!(error = %err, "scheduler state is inconsistent, stopping");
                break;
            }
        }
        self.persist().await;
        tracing::info!("scheduler runtime stopped");
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), RascalError> {
        match command {
            Command::Trigger { definition, reply } => {
                let result = self.trigger(&definition).await;
                if let Err(err) = &result {
                    tracing::warn!(routine = %definition.name, error = %err, "routine rejected");
                }
                let _ = reply.send(result);
                Ok(())
            }
            Command::Event(event) => self.handle_progress(event).await,
            Command::Completed {
                entity_id,
                action_id,
                at,
            } => {
                let effects = self.scheduler.complete_action(&entity_id, &action_id, now().max(at))?;
                self.apply(effects).await;
                Ok(())
            }
            Command::Wake(at) => {
                let effects = self.scheduler.wake(now().max(at))?;
                self.apply(effects).await;
                Ok(())
            }
            Command::Deadline {
                entity_id,
                action_id,
                at,
            } => {
                let effects = self.scheduler.fail_entry(&entity_id, &action_id, now().max(at))?;
                self.apply(effects).await;
                Ok(())
            }
            Command::Dispatched { action_id, outcome } => {
                let effects = self.scheduler.step_outcome(&action_id, outcome, now())?;
                self.apply(effects).await;
                Ok(())
            }
            Command::Metrics(reply) => {
                let _ = reply.send(self.scheduler.metrics().report());
                Ok(())
            }
            Command::Shutdown => Ok(()),
        }
    }

    async fn trigger(&mut self, definition: &RoutineDefinition) -> Result<Admission, RascalError> {
        let routine = self.factory.build(definition, &self.resolver, &self.estimator)?;
        let routine_id = routine.routine_id.clone();
        let (admission, effects) = self.scheduler.trigger(routine, now())?;
        tracing::info!(routine_id = %routine_id, admission = ?admission, "routine triggered");
        self.apply(effects).await;
        Ok(admission)
    }

    /// Apply a device progress event.
    ///
    /// Events come from outside the runtime, so an event the schedule cannot
    /// place is logged and dropped instead of stopping the runtime.
    async fn handle_progress(&mut self, event: RascEvent) -> Result<(), RascalError> {
        let at = now();
        self.learn(&event, at);
        let effects = match self.scheduler.handle_event(&event, at) {
            Ok(effects) => effects,
            Err(RascalError::NotFound(err)) => {
                tracing::warn!(
                    action_id = %event.action_id,
                    entity_id = %event.entity_id,
                    kind = %event.kind,
                    error = %err,
                    "progress event dropped"
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.apply(effects).await;
        Ok(())
    }

    /// Record START and COMPLETE latencies of dispatched actions.
    fn learn(&mut self, event: &RascEvent, at: Timestamp) {
        let Some(flight) = self.in_flight.get_mut(&event.action_id) else {
            return;
        };
        match event.kind {
            RascEventKind::Ack => {}
            RascEventKind::Start => {
                if flight.started.contains_key(&event.entity_id) {
                    return;
                }
                flight.started.insert(event.entity_id.clone(), at);
                let latency = seconds(at - flight.dispatched_at);
                self.estimator
                    .record(&event.entity_id, &flight.payload, RascEventKind::Start, latency);
            }
            RascEventKind::Complete => {
                let Some(started) = flight.started.remove(&event.entity_id) else {
                    return;
                };
                let latency = seconds(at - started);
                self.estimator
                    .record(&event.entity_id, &flight.payload, RascEventKind::Complete, latency);
            }
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Dispatch {
                    action_id,
                    payload,
                    targets,
                } => self.dispatch(action_id, payload, targets),
                Effect::WakeAt(at) => self.post_at(at, Command::Wake(at)),
                Effect::CompleteAt {
                    entity_id,
                    action_id,
                    at,
                } => self.post_at(
                    at,
                    Command::Completed {
                        entity_id,
                        action_id,
                        at,
                    },
                ),
                Effect::Deadline {
                    entity_id,
                    action_id,
                    at,
                } => self.post_at(
                    at,
                    Command::Deadline {
                        entity_id,
                        action_id,
                        at,
                    },
                ),
                Effect::Publish(event) => {
                    if let Err(err) = self.publisher.publish(event).await {
                        tracing::warn!(error = %err, "cannot publish progress event");
                    }
                }
                Effect::Resolved {
                    action_id,
                    action,
                    successful,
                    failed,
                } => {
                    let resolved = self
                        .in_flight
                        .get_mut(&action_id)
                        .and_then(|flight| flight.resolved.take());
                    if let Some(resolved) = resolved {
                        let _ = resolved.send(FailureNotification {
                            action,
                            action_id,
                            successful,
                            failed,
                        });
                    }
                }
                Effect::RoutineEnded(routine_id) | Effect::RoutineAborted(routine_id) => {
                    self.forget(&routine_id);
                    self.persist().await;
                }
                Effect::RoutineDropped(routine_id) => {
                    tracing::warn!(routine_id = %routine_id, "routine dropped");
                }
            }
        }
    }

    fn forget(&mut self, routine_id: &RoutineId) {
        self.in_flight
            .retain(|action_id, _| &action_id.routine_id() != routine_id);
    }

    /// Post `command` back into the loop once `at` is reached.
    fn post_at(&self, at: Timestamp, command: Command) {
        let delay = to_std((at - now()).max(TimeDelta::zero()));
        let commands = self.commands.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(command);
        });
    }

    fn dispatch(&mut self, action_id: ActionId, payload: ActionPayload, targets: Vec<EntityId>) {
        let polls: BTreeMap<EntityId, _> = targets
            .iter()
            .map(|entity_id| (entity_id.clone(), self.estimator.polling_plan(entity_id, &payload)))
            .collect();
        let continue_on_error = payload.continue_on_error();

        let (resolved, resolution) = oneshot::channel();
        tokio::spawn(detect_failures(
            Arc::clone(&self.notifier),
            action_id.clone(),
            resolution,
        ));
        self.in_flight.insert(
            action_id.clone(),
            InFlight {
                payload: payload.clone(),
                dispatched_at: now(),
                started: HashMap::new(),
                resolved: Some(resolved),
            },
        );

        let call = ActionCall {
            action_id: action_id.clone(),
            payload,
            targets,
            polls,
        };
        let runner = Arc::clone(&self.runner);
        let reporter = ProgressReporter::new(self.progress.clone());
        let commands = self.commands.clone();
        let mut stop = self.stop.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = runner.execute(call, reporter) => {
                    if let Err(err) = &result {
                        tracing::warn!(action_id = %action_id, error = %err, "action runner failed");
                    }
                    StepOutcome::classify(&result, continue_on_error)
                }
                () = stop_requested(&mut stop) => StepOutcome::Stopped,
            };
            let _ = commands.send(Command::Dispatched { action_id, outcome });
        });
    }

    async fn persist(&mut self) {
        let Some(snapshot) = self.estimator.take_dirty() else {
            return;
        };
        match self.history.save(&snapshot).await {
            Ok(()) => tracing::debug!(histories = snapshot.len(), "latency histories saved"),
            Err(err) => tracing::warn!(error = %err, "cannot save latency histories"),
        }
    }
}

/// Cheap, cloneable access to a running [`SchedulerRuntime`].
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SchedulerHandle {
    /// Build and admit one invocation of `definition`.
    ///
    /// # Errors
    ///
    /// Returns [`RascalError::Validation`] when the definition does not
    /// compile, [`RascalError::Schedule`] when no start time can be found,
    /// and [`RascalError::Stopped`] once the runtime is gone.
    #[tracing::instrument(skip_all, fields(routine = %definition.name))]
    pub async fn trigger(&self, definition: RoutineDefinition) -> Result<Admission, RascalError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Trigger { definition, reply })
            .map_err(|_| RascalError::Stopped)?;
        response.await.map_err(|_| RascalError::Stopped)?
    }

    /// Feed a progress event reported outside of an action runner.
    ///
    /// # Errors
    ///
    /// Returns [`RascalError::Stopped`] once the runtime is gone.
    pub fn report(&self, event: RascEvent) -> Result<(), RascalError> {
        self.commands
            .send(Command::Event(event))
            .map_err(|_| RascalError::Stopped)
    }

    /// # Errors
    ///
    /// Returns [`RascalError::Stopped`] once the runtime is gone.
    #[tracing::instrument(skip_all)]
    pub async fn metrics(&self) -> Result<MetricsReport, RascalError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Metrics(reply))
            .map_err(|_| RascalError::Stopped)?;
        response.await.map_err(|_| RascalError::Stopped)
    }

    /// Ask the loop to stop after the command it is handling.
    pub fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown);
    }
}
