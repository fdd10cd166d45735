use super::message::{Body, Message};
use crate::error::{Result, RouteError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// How a route scopes the side effects of its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionPolicy {
    /// Every step takes effect immediately; nothing is rolled back.
    #[default]
    None,
    /// One ledger session; sends are buffered until commit.
    Local,
    /// Ledger session and channel sends coordinated with two-phase commit.
    DistributedTwoPhase,
    /// Deltas auto-commit and are undone by inverse deltas on failure.
    Compensating,
}

impl TransactionPolicy {
    pub fn is_transacted(&self) -> bool {
        matches!(
            self,
            TransactionPolicy::Local | TransactionPolicy::DistributedTwoPhase
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Debit,
    Credit,
}

/// Where a ledger update takes its amount from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountSource {
    #[default]
    Body,
    Header(String),
    Fixed(i64),
}

impl AmountSource {
    pub fn resolve(&self, message: &Message) -> Result<i64> {
        match self {
            AmountSource::Body => message.body.as_int().ok_or_else(|| {
                RouteError::StepFailure(format!("body '{}' is not an amount", message.body))
            }),
            AmountSource::Header(name) => message
                .header(name)
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| {
                    RouteError::StepFailure(format!("header '{}' is missing or not an amount", name))
                }),
            AmountSource::Fixed(amount) => Ok(*amount),
        }
    }
}

/// Condition evaluated by a choice step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Predicate {
    BodyEquals { value: Body },
    BodyLessThan { value: i64 },
    HeaderEquals { name: String, value: String },
}

impl Predicate {
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Predicate::BodyEquals { value } => &message.body == value,
            Predicate::BodyLessThan { value } => {
                message.body.as_int().is_some_and(|n| n < *value)
            }
            Predicate::HeaderEquals { name, value } => message.header(name) == Some(value.as_str()),
        }
    }
}

/// One step of a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    /// Additive update of one account.
    SqlUpdate {
        account: String,
        direction: Direction,
        #[serde(default)]
        amount: AmountSource,
    },
    /// Enqueues a copy of the current message.
    SendTo { channel: String },
    /// Fails deterministically.
    Throw { message: String },
    /// Runs `then` when the predicate holds, then carries on.
    Choice {
        when: Predicate,
        then: Arc<Vec<Step>>,
    },
    /// Routes each item of a list body through the rest of the route.
    Split {
        #[serde(default = "default_share_unit_of_work")]
        share_unit_of_work: bool,
    },
    SetHeader { name: String, value: String },
    /// Continues through another route's steps inside the current scope.
    Direct { route: String },
}

fn default_share_unit_of_work() -> bool {
    true
}

impl Step {
    pub fn debit(account: impl Into<String>) -> Self {
        Step::SqlUpdate {
            account: account.into(),
            direction: Direction::Debit,
            amount: AmountSource::Body,
        }
    }

    pub fn credit(account: impl Into<String>) -> Self {
        Step::SqlUpdate {
            account: account.into(),
            direction: Direction::Credit,
            amount: AmountSource::Body,
        }
    }

    pub fn send_to(channel: impl Into<String>) -> Self {
        Step::SendTo {
            channel: channel.into(),
        }
    }

    pub fn throw(message: impl Into<String>) -> Self {
        Step::Throw {
            message: message.into(),
        }
    }

    pub fn choice(when: Predicate, then: Vec<Step>) -> Self {
        Step::Choice {
            when,
            then: Arc::new(then),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RedeliveryPolicy {
    #[serde(default)]
    pub maximum_redeliveries: u32,
    #[serde(default)]
    pub delay_ms: u64,
}

fn default_concurrency() -> usize {
    1
}

/// A statically defined route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub name: String,
    /// Source channel; a route without one is only reachable via `direct`.
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub policy: TransactionPolicy,
    /// Number of workers pulling from the source channel.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Overrides the engine-wide dead-letter channel.
    #[serde(default)]
    pub dead_letter_channel: Option<String>,
    #[serde(default)]
    pub redelivery: RedeliveryPolicy,
    pub steps: Arc<Vec<Step>>,
}

impl Route {
    pub fn new(name: impl Into<String>, policy: TransactionPolicy, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            from: None,
            policy,
            concurrency: 1,
            dead_letter_channel: None,
            redelivery: RedeliveryPolicy::default(),
            steps: Arc::new(steps),
        }
    }

    pub fn from_channel(mut self, channel: impl Into<String>) -> Self {
        self.from = Some(channel.into());
        self
    }

    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers;
        self
    }

    pub fn with_dead_letter_channel(mut self, channel: impl Into<String>) -> Self {
        self.dead_letter_channel = Some(channel.into());
        self
    }

    pub fn with_redelivery(mut self, maximum_redeliveries: u32, delay_ms: u64) -> Self {
        self.redelivery = RedeliveryPolicy {
            maximum_redeliveries,
            delay_ms,
        };
        self
    }

    /// Names of the routes this route's steps continue into.
    pub fn direct_targets(&self) -> Vec<&str> {
        fn collect<'a>(steps: &'a [Step], out: &mut Vec<&'a str>) {
            for step in steps {
                match step {
                    Step::Direct { route } => out.push(route),
                    Step::Choice { then, .. } => collect(then, out),
                    _ => {}
                }
            }
        }
        let mut targets = Vec::new();
        collect(&self.steps, &mut targets);
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_descriptor_deserialization() {
        let json = r#"{
            "name": "transfer",
            "from": "transaction.incoming.one",
            "policy": "local",
            "steps": [
                {"type": "sql_update", "account": "foo", "direction": "debit"},
                {"type": "sql_update", "account": "bar", "direction": "credit", "amount": {"header": "amount"}},
                {"type": "choice", "when": {"op": "body_equals", "value": "poison"},
                 "then": [{"type": "throw", "message": "No way"}]},
                {"type": "split"},
                {"type": "send_to", "channel": "transaction.outgoing.one"}
            ]
        }"#;

        let route: Route = serde_json::from_str(json).unwrap();
        assert_eq!(route.policy, TransactionPolicy::Local);
        assert_eq!(route.concurrency, 1);
        assert_eq!(route.steps.len(), 5);
        assert_eq!(route.steps[0], Step::debit("foo"));
        assert!(matches!(
            &route.steps[1],
            Step::SqlUpdate { amount: AmountSource::Header(h), .. } if h == "amount"
        ));
        assert_eq!(
            route.steps[3],
            Step::Split {
                share_unit_of_work: true
            }
        );
    }

    #[test]
    fn test_distributed_policy_name() {
        let policy: TransactionPolicy = serde_json::from_str(r#""distributed_two_phase""#).unwrap();
        assert_eq!(policy, TransactionPolicy::DistributedTwoPhase);
        assert!(policy.is_transacted());
        assert!(!TransactionPolicy::Compensating.is_transacted());
    }

    #[test]
    fn test_amount_resolution() {
        let message = Message::new(100).with_header("amount", "25");
        assert_eq!(AmountSource::Body.resolve(&message).unwrap(), 100);
        assert_eq!(
            AmountSource::Header("amount".into()).resolve(&message).unwrap(),
            25
        );
        assert_eq!(AmountSource::Fixed(1).resolve(&message).unwrap(), 1);
        assert!(matches!(
            AmountSource::Header("missing".into()).resolve(&message),
            Err(RouteError::StepFailure(_))
        ));
    }

    #[test]
    fn test_predicates() {
        let negative = Message::new(-1);
        assert!(Predicate::BodyLessThan { value: 0 }.matches(&negative));
        assert!(!Predicate::BodyLessThan { value: 0 }.matches(&Message::new(5)));

        let poison = Message::new("poison");
        assert!(Predicate::BodyEquals {
            value: Body::from("poison")
        }
        .matches(&poison));

        let tagged = Message::new(Body::Null).with_header("kind", "vip");
        assert!(Predicate::HeaderEquals {
            name: "kind".into(),
            value: "vip".into()
        }
        .matches(&tagged));
    }

    #[test]
    fn test_direct_targets_include_choice_branches() {
        let route = Route::new(
            "entry",
            TransactionPolicy::Local,
            vec![
                Step::Direct {
                    route: "intermediate".into(),
                },
                Step::choice(
                    Predicate::BodyLessThan { value: 0 },
                    vec![Step::Direct {
                        route: "refund".into(),
                    }],
                ),
            ],
        );
        assert_eq!(route.direct_targets(), vec!["intermediate", "refund"]);
    }
}
