//! Unit-of-work boundaries and two-phase commit.
//!
//! A [`UnitOfWork`] always owns a ledger participant and an outbox
//! participant; extra participants can be enlisted. The coordinator drives
//! them through prepare/commit/rollback according to the transaction policy.

use super::ledger::{Ledger, LedgerSession};
use crate::domain::message::Message;
use crate::domain::ports::{Participant, Vote};
use crate::domain::route::TransactionPolicy;
use crate::error::{Result, RouteError};
use crate::infrastructure::channel::ChannelRegistry;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Partial commit across participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HazardReport {
    pub unit_of_work: u64,
    pub committed: Vec<String>,
    pub failed: Vec<String>,
    pub cause: String,
}

impl fmt::Display for HazardReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unit of work {} committed [{}] but failed [{}]: {}",
            self.unit_of_work,
            self.committed.join(", "),
            self.failed.join(", "),
            self.cause
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    RolledBack { reason: String },
    HeuristicHazard(HazardReport),
}

/// What the caller wants `complete` to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Commit,
    /// A step failed; roll back regardless of policy.
    Rollback,
}

/// Ledger session wrapped as a participant.
pub struct LedgerParticipant {
    session: Option<LedgerSession>,
}

impl LedgerParticipant {
    fn session(&mut self) -> Result<&mut LedgerSession> {
        self.session.as_mut().ok_or_else(|| {
            RouteError::TransactionAborted("ledger session already completed".to_string())
        })
    }
}

#[async_trait]
impl Participant for LedgerParticipant {
    fn name(&self) -> &str {
        "ledger"
    }

    async fn prepare(&mut self) -> Result<Vote> {
        match &self.session {
            Some(session) => session.prepare().await,
            None => Ok(Vote::Abort("ledger session already completed".to_string())),
        }
    }

    async fn commit(&mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => session.commit().await,
            None => Ok(()),
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            session.rollback();
        }
        Ok(())
    }
}

/// Sends buffered until commit.
pub struct OutboxParticipant {
    channels: ChannelRegistry,
    pending: Vec<(String, Message)>,
}

impl OutboxParticipant {
    pub fn push(&mut self, channel: &str, message: Message) {
        self.pending.push((channel.to_string(), message));
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[async_trait]
impl Participant for OutboxParticipant {
    fn name(&self) -> &str {
        "outbox"
    }

    async fn prepare(&mut self) -> Result<Vote> {
        let mut per_channel: BTreeMap<&str, usize> = BTreeMap::new();
        for (channel, _) in &self.pending {
            *per_channel.entry(channel.as_str()).or_default() += 1;
        }
        for (channel, count) in per_channel {
            if !self.channels.channel(channel).has_room_for(count) {
                return Ok(Vote::Abort(format!(
                    "channel '{}' cannot accept {} more messages",
                    channel, count
                )));
            }
        }
        Ok(Vote::ReadyToCommit)
    }

    async fn commit(&mut self) -> Result<()> {
        for (channel, message) in std::mem::take(&mut self.pending) {
            self.channels.send(&channel, message)?;
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }
}

/// The scope of operations that commit or roll back together.
pub struct UnitOfWork {
    id: u64,
    policy: TransactionPolicy,
    ledger: LedgerParticipant,
    outbox: OutboxParticipant,
    enlisted: Vec<Box<dyn Participant>>,
}

impl UnitOfWork {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn policy(&self) -> TransactionPolicy {
        self.policy
    }

    pub fn ledger(&mut self) -> Result<&mut LedgerSession> {
        self.ledger.session()
    }

    pub fn outbox(&mut self) -> &mut OutboxParticipant {
        &mut self.outbox
    }

    pub fn enlist(&mut self, participant: Box<dyn Participant>) {
        self.enlisted.push(participant);
    }

    /// All participants in enlistment order: ledger, outbox, extras.
    fn participants(&mut self) -> Vec<&mut dyn Participant> {
        let mut all: Vec<&mut dyn Participant> = Vec::with_capacity(2 + self.enlisted.len());
        all.push(&mut self.ledger);
        all.push(&mut self.outbox);
        for participant in self.enlisted.iter_mut() {
            all.push(participant.as_mut());
        }
        all
    }
}

/// Bounded retry of `ResourceUnavailable` at the coordinator boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Whether attempt number `attempt` (zero based) may be retried.
    pub fn allows(&self, err: &RouteError, attempt: u32) -> bool {
        err.is_resource_unavailable() && attempt < self.max_retries
    }

    /// Linear backoff for the given retry.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff * (attempt + 1)
    }
}

/// Creates units of work and drives them to exactly one outcome.
pub struct TransactionCoordinator {
    ledger: Ledger,
    channels: ChannelRegistry,
    retry: RetryPolicy,
    next_id: AtomicU64,
}

impl TransactionCoordinator {
    pub fn new(ledger: Ledger, channels: ChannelRegistry, retry: RetryPolicy) -> Self {
        Self {
            ledger,
            channels,
            retry,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn begin(&self, policy: TransactionPolicy) -> UnitOfWork {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(unit_of_work = id, ?policy, "begin");
        UnitOfWork {
            id,
            policy,
            ledger: LedgerParticipant {
                session: Some(self.ledger.begin_session()),
            },
            outbox: OutboxParticipant {
                channels: self.channels.clone(),
                pending: Vec::new(),
            },
            enlisted: Vec::new(),
        }
    }

    pub fn enlist(&self, uow: &mut UnitOfWork, participant: Box<dyn Participant>) {
        debug!(unit_of_work = uow.id, participant = participant.name(), "enlist");
        uow.enlist(participant);
    }

    pub async fn complete(&self, mut uow: UnitOfWork, disposition: Disposition) -> Outcome {
        if disposition == Disposition::Rollback {
            rollback_all(&mut uow).await;
            return Outcome::RolledBack {
                reason: "rollback requested".to_string(),
            };
        }

        if uow.policy == TransactionPolicy::DistributedTwoPhase
            && let Some(reason) = prepare_all(&mut uow).await
        {
            warn!(unit_of_work = uow.id, %reason, "prepare failed, rolling back");
            rollback_all(&mut uow).await;
            return Outcome::RolledBack { reason };
        }

        commit_all(&mut uow).await
    }
}

/// Phase one. Returns the abort reason if any participant did not vote ready.
async fn prepare_all(uow: &mut UnitOfWork) -> Option<String> {
    let id = uow.id;
    for participant in uow.participants() {
        match participant.prepare().await {
            Ok(Vote::ReadyToCommit) => {
                debug!(unit_of_work = id, participant = participant.name(), "ready to commit");
            }
            Ok(Vote::Abort(reason)) => {
                return Some(format!("participant '{}' voted abort: {}", participant.name(), reason));
            }
            Err(e) => {
                return Some(format!("participant '{}' unreachable: {}", participant.name(), e));
            }
        }
    }
    None
}

/// Phase two.
async fn commit_all(uow: &mut UnitOfWork) -> Outcome {
    let id = uow.id;
    let mut participants = uow.participants().into_iter();
    let mut committed = Vec::new();

    while let Some(participant) = participants.next() {
        if let Err(e) = participant.commit().await {
            let failed = participant.name().to_string();
            if let Err(rollback_err) = participant.rollback().await {
                error!(unit_of_work = id, participant = %failed, error = %rollback_err, "rollback failed");
            }
            for rest in participants.by_ref() {
                if let Err(e) = rest.rollback().await {
                    error!(unit_of_work = id, participant = rest.name(), error = %e, "rollback failed");
                }
            }

            if committed.is_empty() {
                warn!(unit_of_work = id, participant = %failed, error = %e, "commit failed before any participant committed");
                return Outcome::RolledBack {
                    reason: format!("participant '{}' failed to commit: {}", failed, e),
                };
            }

            let report = HazardReport {
                unit_of_work: id,
                committed,
                failed: vec![failed],
                cause: e.to_string(),
            };
            error!(unit_of_work = id, %report, "heuristic hazard");
            return Outcome::HeuristicHazard(report);
        }
        committed.push(participant.name().to_string());
    }

    debug!(unit_of_work = id, "committed");
    Outcome::Committed
}

async fn rollback_all(uow: &mut UnitOfWork) {
    let id = uow.id;
    for participant in uow.participants() {
        if let Err(e) = participant.rollback().await {
            error!(unit_of_work = id, participant = participant.name(), error = %e, "rollback failed");
        }
    }
    debug!(unit_of_work = id, "rolled back");
}
