//! Terminal delivery of messages that could not be routed.

use super::coordinator::HazardReport;
use crate::domain::message::Message;
use crate::error::RouteError;
use crate::infrastructure::channel::ChannelRegistry;
use tracing::{error, info};

pub const HEADER_FAILURE_CAUSE: &str = "x-failure-cause";
pub const HEADER_ORIGIN_CHANNEL: &str = "x-origin-channel";
pub const HEADER_ORIGIN_ROUTE: &str = "x-origin-route";
pub const HEADER_DELIVERY_ATTEMPTS: &str = "x-delivery-attempts";
pub const HEADER_UNIT_OF_WORK: &str = "x-unit-of-work";

/// Where a failed message came from.
#[derive(Debug, Clone)]
pub struct Origin<'a> {
    pub route: &'a str,
    pub channel: Option<&'a str>,
    pub attempts: u32,
}

/// Moves failed messages to a dead-letter channel and hazards to an
/// operator channel. Never fails: a delivery problem here is logged and the
/// message is dropped.
#[derive(Clone)]
pub struct DeadLetterRedirector {
    channels: ChannelRegistry,
    operator_channel: String,
}

impl DeadLetterRedirector {
    pub fn new(channels: ChannelRegistry, operator_channel: impl Into<String>) -> Self {
        Self {
            channels,
            operator_channel: operator_channel.into(),
        }
    }

    pub fn operator_channel(&self) -> &str {
        &self.operator_channel
    }

    /// Delivers the original message to `dead_letter_channel`, annotated with
    /// the failure cause and its origin.
    pub fn redirect(
        &self,
        dead_letter_channel: &str,
        original: Message,
        origin: &Origin<'_>,
        cause: &RouteError,
    ) -> bool {
        let message_id = original.id;
        let annotated = annotate(original, origin)
            .with_header(HEADER_FAILURE_CAUSE, cause.to_string());

        match self.channels.send(dead_letter_channel, annotated) {
            Ok(()) => {
                info!(
                    route = origin.route,
                    %message_id,
                    channel = dead_letter_channel,
                    %cause,
                    "message dead-lettered"
                );
                true
            }
            Err(e) => {
                error!(
                    route = origin.route,
                    %message_id,
                    channel = dead_letter_channel,
                    error = %e,
                    "dead-letter delivery failed, dropping message"
                );
                false
            }
        }
    }

    /// Surfaces a partially committed unit of work to the operator channel.
    pub fn alert(&self, original: Message, origin: &Origin<'_>, report: &HazardReport) -> bool {
        let message_id = original.id;
        let annotated = annotate(original, origin)
            .with_header(HEADER_FAILURE_CAUSE, report.to_string())
            .with_header(HEADER_UNIT_OF_WORK, report.unit_of_work.to_string());

        match self.channels.send(&self.operator_channel, annotated) {
            Ok(()) => true,
            Err(e) => {
                error!(
                    route = origin.route,
                    %message_id,
                    channel = %self.operator_channel,
                    error = %e,
                    "operator alert delivery failed, dropping message"
                );
                false
            }
        }
    }
}

fn annotate(message: Message, origin: &Origin<'_>) -> Message {
    let mut message = message
        .with_header(HEADER_ORIGIN_ROUTE, origin.route)
        .with_header(HEADER_DELIVERY_ATTEMPTS, origin.attempts.to_string());
    if let Some(channel) = origin.channel {
        message = message.with_header(HEADER_ORIGIN_CHANNEL, channel);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::Body;
    use std::time::Duration;

    fn origin() -> Origin<'static> {
        Origin {
            route: "transfer",
            channel: Some("transaction.incoming.two"),
            attempts: 1,
        }
    }

    #[tokio::test]
    async fn test_redirect_annotates_original() {
        let channels = ChannelRegistry::new();
        let redirector = DeadLetterRedirector::new(channels.clone(), "ops");
        let original = Message::new(100).with_header("amount", "100");

        let delivered = redirector.redirect(
            "DLQ",
            original.clone(),
            &origin(),
            &RouteError::StepFailure("forced exception for test".into()),
        );
        assert!(delivered);

        let dead = channels
            .receive("DLQ", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(dead.id, original.id);
        assert_eq!(dead.body, Body::Int(100));
        assert_eq!(dead.header("amount"), Some("100"));
        assert_eq!(dead.header(HEADER_ORIGIN_CHANNEL), Some("transaction.incoming.two"));
        assert_eq!(dead.header(HEADER_ORIGIN_ROUTE), Some("transfer"));
        assert!(
            dead.header(HEADER_FAILURE_CAUSE)
                .unwrap()
                .contains("forced exception")
        );
    }

    #[tokio::test]
    async fn test_redirect_to_full_channel_drops_without_panicking() {
        let channels = ChannelRegistry::new();
        channels.declare("DLQ", Some(0)).unwrap();
        let redirector = DeadLetterRedirector::new(channels.clone(), "ops");

        let delivered = redirector.redirect(
            "DLQ",
            Message::new(1),
            &origin(),
            &RouteError::StepFailure("boom".into()),
        );
        assert!(!delivered);
        assert_eq!(channels.depth("DLQ"), 0);
    }

    #[tokio::test]
    async fn test_alert_goes_to_operator_channel() {
        let channels = ChannelRegistry::new();
        let redirector = DeadLetterRedirector::new(channels.clone(), "ops");
        let report = HazardReport {
            unit_of_work: 7,
            committed: vec!["ledger".into()],
            failed: vec!["outbox".into()],
            cause: "channel full".into(),
        };

        assert!(redirector.alert(Message::new(5), &origin(), &report));
        let alert = channels
            .receive("ops", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(alert.header(HEADER_UNIT_OF_WORK), Some("7"));
    }
}
