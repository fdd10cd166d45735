use super::coordinator::{Disposition, Outcome, TransactionCoordinator};
use super::dead_letter::{DeadLetterRedirector, Origin};
use super::ledger::Ledger;
use crate::config::{EngineConfig, EngineSettings};
use crate::domain::message::{Body, Message, MessageId};
use crate::domain::ports::SharedAccountStore;
use crate::domain::route::{Direction, Route, Step, TransactionPolicy};
use crate::error::{Result, RouteError};
use crate::infrastructure::channel::{Channel, ChannelRegistry};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Tally of what happened to one submitted message and any sub-messages it
/// was split into.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingReport {
    pub committed: usize,
    pub dead_lettered: usize,
    pub hazards: usize,
    /// Failed messages whose dead-letter delivery also failed.
    pub dropped: usize,
}

impl ProcessingReport {
    pub fn is_success(&self) -> bool {
        self.dead_lettered == 0 && self.hazards == 0 && self.dropped == 0
    }
}

/// Position of one message within a (possibly nested) step sequence.
///
/// `Choice` branches and `Direct` targets push a frame; a finished frame
/// pops back into its caller.
#[derive(Clone)]
struct Cursor {
    frames: Vec<(Arc<Vec<Step>>, usize)>,
    message: Message,
}

impl Cursor {
    fn new(steps: Arc<Vec<Step>>, message: Message) -> Self {
        Self {
            frames: vec![(steps, 0)],
            message,
        }
    }

    fn next_step(&mut self) -> Option<(Arc<Vec<Step>>, usize)> {
        loop {
            let (steps, index) = self.frames.last_mut()?;
            if *index < steps.len() {
                let current = *index;
                *index += 1;
                return Some((steps.clone(), current));
            }
            self.frames.pop();
        }
    }

    fn enter(&mut self, steps: Arc<Vec<Step>>) {
        self.frames.push((steps, 0));
    }

    /// One cursor per list item, each continuing with the remaining steps.
    fn split(&self) -> Result<Vec<Cursor>> {
        let Body::List(items) = &self.message.body else {
            return Err(RouteError::StepFailure(format!(
                "cannot split non-list body '{}'",
                self.message.body
            )));
        };
        let size = items.len();
        Ok(items
            .iter()
            .enumerate()
            .map(|(index, item)| Cursor {
                frames: self.frames.clone(),
                message: self.message.split_child(item.clone(), index, size),
            })
            .collect())
    }
}

/// How side effects of the running steps are scoped.
enum Scope<'a> {
    AutoCommit,
    Transacted(&'a mut super::coordinator::UnitOfWork),
    /// Journal of applied `(account, delta)` pairs to undo on failure.
    Compensating(&'a mut Vec<(String, i64)>),
}

struct EngineInner {
    routes: HashMap<String, Arc<Route>>,
    ledger: Ledger,
    channels: ChannelRegistry,
    coordinator: TransactionCoordinator,
    redirector: DeadLetterRedirector,
    dead_letter_channel: String,
    processed: watch::Sender<u64>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Executes routes against messages.
///
/// Routes are fixed at construction. `start` spawns a bounded pool of workers
/// per routed source channel; each worker runs one message to completion
/// before taking the next.
#[derive(Clone)]
pub struct RouteEngine {
    inner: Arc<EngineInner>,
}

impl RouteEngine {
    /// Creates the engine, validating the route set.
    pub fn new(
        ledger: Ledger,
        channels: ChannelRegistry,
        settings: &EngineSettings,
        routes: Vec<Route>,
    ) -> Result<Self> {
        let routes = validate_routes(routes, settings)?;
        for source in routes.values().filter_map(|r| r.from.as_deref()) {
            channels.track(source);
        }
        let coordinator =
            TransactionCoordinator::new(ledger.clone(), channels.clone(), settings.retry_policy());
        let redirector =
            DeadLetterRedirector::new(channels.clone(), settings.operator_channel.clone());

        Ok(Self {
            inner: Arc::new(EngineInner {
                routes,
                ledger,
                channels,
                coordinator,
                redirector,
                dead_letter_channel: settings.dead_letter_channel.clone(),
                processed: watch::Sender::new(0),
                shutdown: watch::Sender::new(false),
                workers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Builds storage-independent state from a configuration: declares
    /// channels, seeds missing accounts and validates routes.
    pub async fn from_config(config: &EngineConfig, store: SharedAccountStore) -> Result<Self> {
        let ledger = Ledger::with_lock_timeout(store, config.settings.lock_timeout());
        let channels =
            ChannelRegistry::with_default_capacity(config.settings.default_channel_capacity);
        for channel in &config.channels {
            channels.declare(&channel.name, channel.capacity)?;
        }
        for account in &config.accounts {
            if ledger
                .ensure_account(&account.name, account.balance.value())
                .await?
            {
                debug!(account = %account.name, balance = %account.balance, "seeded account");
            }
        }
        Self::new(ledger, channels, &config.settings, config.routes.clone())
    }

    pub fn ledger(&self) -> &Ledger {
        &self.inner.ledger
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.inner.channels
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.inner.coordinator
    }

    pub fn route(&self, name: &str) -> Option<&Route> {
        self.inner.routes.get(name).map(Arc::as_ref)
    }

    /// Whether some route consumes from `channel`.
    pub fn is_routed(&self, channel: &str) -> bool {
        self.inner
            .routes
            .values()
            .any(|r| r.from.as_deref() == Some(channel))
    }

    /// Spawns the worker pool. Calling it again is a no-op.
    pub fn start(&self) {
        let mut workers = self.inner.workers.lock();
        if !workers.is_empty() {
            return;
        }
        self.inner.shutdown.send_replace(false);

        for route in self.inner.routes.values() {
            let Some(source) = route.from.as_deref() else {
                continue;
            };
            let channel = self.inner.channels.channel(source);
            for worker in 0..route.concurrency {
                let engine = self.clone();
                let route = route.clone();
                let channel = channel.clone();
                let shutdown = self.inner.shutdown.subscribe();
                workers.push(tokio::spawn(async move {
                    engine.run_worker(route, channel, worker, shutdown).await;
                }));
            }
            info!(route = %route.name, channel = source, workers = route.concurrency, "route started");
        }
    }

    /// Stops all workers after their current message and waits for them.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "route worker terminated abnormally");
            }
        }
    }

    /// Pushes a new message into `channel`.
    pub fn submit(
        &self,
        channel: &str,
        body: impl Into<Body>,
        headers: BTreeMap<String, String>,
    ) -> Result<MessageId> {
        self.submit_message(channel, Message::with_headers(body, headers))
    }

    pub fn submit_message(&self, channel: &str, message: Message) -> Result<MessageId> {
        let id = message.id;
        self.inner.channels.send(channel, message)?;
        Ok(id)
    }

    /// Takes the next message from `channel`; `None` when none arrived in time.
    pub async fn receive(&self, channel: &str, timeout: Duration) -> Option<Message> {
        self.inner.channels.receive(channel, timeout).await
    }

    /// Number of top-level messages workers have finished with.
    pub fn processed_count(&self) -> u64 {
        *self.inner.processed.borrow()
    }

    /// Waits until at least `count` messages were processed by workers.
    pub async fn wait_for_processed(&self, count: u64, timeout: Duration) -> bool {
        let mut processed = self.inner.processed.subscribe();
        let reached = tokio::time::timeout(timeout, processed.wait_for(|n| *n >= count)).await;
        matches!(reached, Ok(Ok(_)))
    }

    /// Waits until every routed channel is empty and no worker is busy,
    /// including work that routes pass on to each other.
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.inner.channels.wait_until_drained(timeout).await
    }

    /// Runs `message` through the named route on the caller's task.
    pub async fn process(&self, route: &str, message: Message) -> Result<ProcessingReport> {
        let route = self
            .inner
            .routes
            .get(route)
            .cloned()
            .ok_or_else(|| RouteError::ConfigError(format!("unknown route '{}'", route)))?;
        Ok(self.process_message(&route, message).await)
    }

    async fn run_worker(
        self,
        route: Arc<Route>,
        source: Arc<Channel>,
        worker: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(route = %route.name, worker, "worker started");
        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            let message = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                message = source.recv() => message,
            };
            self.process_message(&route, message).await;
            self.inner.processed.send_modify(|n| *n += 1);
            source.task_done();
        }
        debug!(route = %route.name, worker, "worker stopped");
    }

    async fn process_message(&self, route: &Arc<Route>, message: Message) -> ProcessingReport {
        let mut report = ProcessingReport::default();
        debug!(route = %route.name, message_id = %message.id, "received");

        let mut queue = VecDeque::from([Cursor::new(route.steps.clone(), message)]);
        while let Some(cursor) = queue.pop_front() {
            let original = cursor.message.clone();
            match self.run_with_redelivery(route, cursor).await {
                Ok(deferred) => {
                    debug!(route = %route.name, message_id = %original.id, "completed");
                    report.committed += 1;
                    queue.extend(deferred);
                }
                Err((err, attempts)) => {
                    let origin = Origin {
                        route: &route.name,
                        channel: route.from.as_deref(),
                        attempts,
                    };
                    if let RouteError::HeuristicHazard(hazard) = &err {
                        report.hazards += 1;
                        self.inner.redirector.alert(original, &origin, hazard);
                        continue;
                    }
                    let dead_letter_channel = route
                        .dead_letter_channel
                        .as_deref()
                        .unwrap_or(&self.inner.dead_letter_channel);
                    if self
                        .inner
                        .redirector
                        .redirect(dead_letter_channel, original, &origin, &err)
                    {
                        report.dead_lettered += 1;
                    } else {
                        report.dropped += 1;
                    }
                }
            }
        }
        report
    }

    /// Runs one cursor until it commits, retrying transient resource errors
    /// and redelivering per the route's policy. On final failure returns the
    /// cause and the number of attempts made.
    async fn run_with_redelivery(
        &self,
        route: &Route,
        cursor: Cursor,
    ) -> std::result::Result<Vec<Cursor>, (RouteError, u32)> {
        let retry = self.inner.coordinator.retry_policy();
        let mut attempts = 0u32;
        let mut resource_retries = 0u32;
        let mut redeliveries = 0u32;

        loop {
            attempts += 1;
            let err = match self.run_once(route, cursor.clone()).await {
                Ok(deferred) => return Ok(deferred),
                Err(err) => err,
            };

            if err.is_heuristic_hazard() {
                return Err((err, attempts));
            }
            if retry.allows(&err, resource_retries) {
                warn!(route = %route.name, message_id = %cursor.message.id, error = %err, "resource unavailable, retrying");
                tokio::time::sleep(retry.delay(resource_retries)).await;
                resource_retries += 1;
                continue;
            }

            let err = if err.is_resource_unavailable() {
                gave_up(err, resource_retries)
            } else {
                err
            };

            if redeliveries < route.redelivery.maximum_redeliveries {
                redeliveries += 1;
                resource_retries = 0;
                warn!(
                    route = %route.name,
                    message_id = %cursor.message.id,
                    redelivery = redeliveries,
                    error = %err,
                    "redelivering"
                );
                tokio::time::sleep(Duration::from_millis(route.redelivery.delay_ms)).await;
                continue;
            }
            return Err((err, attempts));
        }
    }

    async fn run_once(&self, route: &Route, cursor: Cursor) -> Result<Vec<Cursor>> {
        match route.policy {
            TransactionPolicy::Local | TransactionPolicy::DistributedTwoPhase => {
                let coordinator = &self.inner.coordinator;
                let mut uow = coordinator.begin(route.policy);
                let executed = self
                    .execute(route, &mut Scope::Transacted(&mut uow), cursor)
                    .await;
                match executed {
                    Ok(deferred) => match coordinator.complete(uow, Disposition::Commit).await {
                        Outcome::Committed => Ok(deferred),
                        Outcome::RolledBack { reason } => {
                            Err(RouteError::TransactionAborted(reason))
                        }
                        Outcome::HeuristicHazard(report) => {
                            Err(RouteError::HeuristicHazard(report))
                        }
                    },
                    Err(e) => {
                        coordinator.complete(uow, Disposition::Rollback).await;
                        Err(e)
                    }
                }
            }
            TransactionPolicy::Compensating => {
                let mut journal = Vec::new();
                let executed = self
                    .execute(route, &mut Scope::Compensating(&mut journal), cursor)
                    .await;
                if executed.is_err() {
                    self.compensate(&route.name, journal).await;
                }
                executed
            }
            TransactionPolicy::None => self.execute(route, &mut Scope::AutoCommit, cursor).await,
        }
    }

    /// Interprets steps for one cursor and every sub-cursor sharing its
    /// scope. Returns the sub-cursors of non-shared splits, to be run after
    /// this scope completes.
    async fn execute(
        &self,
        route: &Route,
        scope: &mut Scope<'_>,
        cursor: Cursor,
    ) -> Result<Vec<Cursor>> {
        let mut stack = vec![cursor];
        let mut deferred = Vec::new();

        while let Some(mut cursor) = stack.pop() {
            while let Some((steps, index)) = cursor.next_step() {
                let step = &steps[index];
                trace!(route = %route.name, message_id = %cursor.message.id, step = index, "executing");
                match step {
                    Step::SqlUpdate {
                        account,
                        direction,
                        amount,
                    } => {
                        let amount = amount.resolve(&cursor.message)?;
                        let delta = match direction {
                            Direction::Credit => amount,
                            Direction::Debit => amount.checked_neg().ok_or_else(|| {
                                RouteError::StepFailure(format!("amount {} out of range", amount))
                            })?,
                        };
                        self.update_account(&route.name, scope, account, delta)
                            .await?;
                    }
                    Step::SendTo { channel } => match scope {
                        Scope::Transacted(uow) => uow.outbox().push(channel, cursor.message.clone()),
                        _ => {
                            let channels = &self.inner.channels;
                            let message = &cursor.message;
                            self.retry_step(&route.name, || async move {
                                channels.send(channel, message.clone())
                            })
                            .await?;
                        }
                    },
                    Step::Throw { message } => {
                        return Err(RouteError::StepFailure(message.clone()));
                    }
                    Step::SetHeader { name, value } => {
                        cursor.message.headers.insert(name.clone(), value.clone());
                    }
                    Step::Choice { when, then } => {
                        if when.matches(&cursor.message) {
                            cursor.enter(then.clone());
                        }
                    }
                    Step::Direct { route: target } => {
                        let target = self.inner.routes.get(target).ok_or_else(|| {
                            RouteError::ConfigError(format!("unknown direct route '{}'", target))
                        })?;
                        cursor.enter(target.steps.clone());
                    }
                    Step::Split { share_unit_of_work } => {
                        let children = cursor.split()?;
                        debug!(route = %route.name, message_id = %cursor.message.id, parts = children.len(), share_unit_of_work, "split");
                        if *share_unit_of_work {
                            stack.extend(children.into_iter().rev());
                        } else {
                            deferred.extend(children);
                        }
                        break;
                    }
                }
            }
        }

        Ok(deferred)
    }

    async fn update_account(
        &self,
        route: &str,
        scope: &mut Scope<'_>,
        account: &str,
        delta: i64,
    ) -> Result<()> {
        match scope {
            Scope::Transacted(uow) => {
                uow.ledger()?.write(account, delta).await?;
            }
            Scope::AutoCommit => {
                let ledger = &self.inner.ledger;
                self.retry_step(route, || ledger.apply(account, delta)).await?;
            }
            Scope::Compensating(journal) => {
                let ledger = &self.inner.ledger;
                self.retry_step(route, || ledger.apply(account, delta)).await?;
                journal.push((account.to_string(), delta));
            }
        }
        Ok(())
    }

    /// Retries one auto-committed step in place. Earlier steps have already
    /// taken effect, so the message is never rerun from the start here.
    async fn retry_step<T, F, Fut>(&self, route: &str, mut step: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let retry = self.inner.coordinator.retry_policy();
        let mut attempt = 0u32;
        loop {
            match step().await {
                Err(err) if retry.allows(&err, attempt) => {
                    warn!(route, error = %err, attempt, "resource unavailable, retrying step");
                    tokio::time::sleep(retry.delay(attempt)).await;
                    attempt += 1;
                }
                Err(err) if err.is_resource_unavailable() => {
                    return Err(gave_up(err, attempt));
                }
                other => return other,
            }
        }
    }

    /// Undoes journalled deltas newest first. Best effort: a failing
    /// compensation is logged and the rest still run.
    async fn compensate(&self, route: &str, journal: Vec<(String, i64)>) {
        for (account, delta) in journal.into_iter().rev() {
            let Some(inverse) = delta.checked_neg() else {
                error!(route, %account, delta, "cannot invert delta, compensation skipped");
                continue;
            };
            match self.inner.ledger.apply(&account, inverse).await {
                Ok(_) => debug!(route, %account, delta = inverse, "compensated"),
                Err(e) => error!(route, %account, delta = inverse, error = %e, "compensation failed"),
            }
        }
    }
}

fn gave_up(err: RouteError, retries: u32) -> RouteError {
    RouteError::StepFailure(format!("{} (gave up after {} retries)", err, retries))
}

fn validate_routes(
    routes: Vec<Route>,
    settings: &EngineSettings,
) -> Result<HashMap<String, Arc<Route>>> {
    let mut by_name = HashMap::new();
    let mut sources = HashSet::new();

    for route in routes {
        if route.concurrency == 0 {
            return Err(RouteError::ConfigError(format!(
                "route '{}' needs at least one worker",
                route.name
            )));
        }
        if route.policy == TransactionPolicy::None && route.redelivery.maximum_redeliveries > 0 {
            return Err(RouteError::ConfigError(format!(
                "route '{}' has no transaction policy and cannot be redelivered",
                route.name
            )));
        }
        if let Some(source) = &route.from {
            if !sources.insert(source.clone()) {
                return Err(RouteError::ConfigError(format!(
                    "channel '{}' is consumed by more than one route",
                    source
                )));
            }
            let dead_letter = route
                .dead_letter_channel
                .as_deref()
                .unwrap_or(&settings.dead_letter_channel);
            if dead_letter == source {
                return Err(RouteError::ConfigError(format!(
                    "route '{}' dead-letters into its own source channel",
                    route.name
                )));
            }
        }
        let name = route.name.clone();
        if by_name.insert(name.clone(), Arc::new(route)).is_some() {
            return Err(RouteError::ConfigError(format!(
                "duplicate route name '{}'",
                name
            )));
        }
    }

    for route in by_name.values() {
        for target in route.direct_targets() {
            if !by_name.contains_key(target) {
                return Err(RouteError::ConfigError(format!(
                    "route '{}' continues into unknown route '{}'",
                    route.name, target
                )));
            }
        }
    }
    check_direct_cycles(&by_name)?;

    Ok(by_name)
}

fn check_direct_cycles(routes: &HashMap<String, Arc<Route>>) -> Result<()> {
    fn visit<'a>(
        name: &'a str,
        routes: &'a HashMap<String, Arc<Route>>,
        visiting: &mut Vec<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> Result<()> {
        if done.contains(name) {
            return Ok(());
        }
        if visiting.contains(&name) {
            visiting.push(name);
            return Err(RouteError::ConfigError(format!(
                "direct routes form a cycle: {}",
                visiting.join(" -> ")
            )));
        }
        visiting.push(name);
        if let Some(route) = routes.get(name) {
            for target in route.direct_targets() {
                visit(target, routes, visiting, done)?;
            }
        }
        visiting.pop();
        done.insert(name);
        Ok(())
    }

    let mut done = HashSet::new();
    for name in routes.keys() {
        visit(name, routes, &mut Vec::new(), &mut done)?;
    }
    Ok(())
}
