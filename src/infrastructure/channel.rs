//! In-process point-to-point channels.
//!
//! Each channel is a FIFO queue guarded by a short-lived lock, paired with a
//! `Notify` so that receivers park instead of polling. Channels are created
//! lazily the first time any producer or consumer names them.
//!
//! A channel can be tracked: every message enqueued on a tracked channel
//! counts as outstanding work in its registry until a consumer calls
//! [`Channel::task_done`]. A consumer that enqueues follow-up work before
//! acknowledging its own message keeps the count above zero, so reaching zero
//! means every tracked channel has been drained and fully processed.

use crate::domain::message::Message;
use crate::error::{Result, RouteError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tracing::trace;

/// A named FIFO queue, safe for concurrent producers and consumers.
pub struct Channel {
    name: String,
    capacity: Option<usize>,
    queue: Mutex<VecDeque<Message>>,
    available: Notify,
    tracked: AtomicBool,
    outstanding: Arc<watch::Sender<u64>>,
}

impl Channel {
    fn new(name: String, capacity: Option<usize>, outstanding: Arc<watch::Sender<u64>>) -> Self {
        Self {
            name,
            capacity,
            queue: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            tracked: AtomicBool::new(false),
            outstanding,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Whether `additional` more messages fit right now.
    pub fn has_room_for(&self, additional: usize) -> bool {
        match self.capacity {
            Some(capacity) => self.queue.lock().len() + additional <= capacity,
            None => true,
        }
    }

    pub fn send(&self, message: Message) -> Result<()> {
        {
            let mut queue = self.queue.lock();
            if let Some(capacity) = self.capacity
                && queue.len() >= capacity
            {
                return Err(RouteError::ResourceUnavailable(format!(
                    "channel '{}' is full ({} messages)",
                    self.name, capacity
                )));
            }
            trace!(channel = %self.name, message_id = %message.id, "enqueue");
            queue.push_back(message);
            if self.tracked.load(Ordering::Acquire) {
                self.outstanding.send_modify(|n| *n += 1);
            }
        }
        self.available.notify_one();
        Ok(())
    }

    /// Starts counting this channel's messages as outstanding work,
    /// including the ones already queued.
    fn track(&self) {
        let queue = self.queue.lock();
        if !self.tracked.swap(true, Ordering::AcqRel) {
            let queued = queue.len() as u64;
            self.outstanding.send_modify(|n| *n += queued);
        }
    }

    /// Acknowledges that a message taken from this channel is fully handled.
    pub fn task_done(&self) {
        if self.tracked.load(Ordering::Acquire) {
            self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    pub fn try_receive(&self) -> Option<Message> {
        self.queue.lock().pop_front()
    }

    /// Waits until a message is available.
    ///
    /// Cancel safe: a message is only dequeued by the call that returns it.
    pub async fn recv(&self) -> Message {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_receive() {
                return message;
            }
            notified.await;
        }
    }

    /// Waits up to `timeout`; `None` means nothing arrived in time.
    pub async fn receive(&self, timeout: Duration) -> Option<Message> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(message) => Some(message),
            Err(_) => self.try_receive(),
        }
    }
}

/// Process-wide registry of channels keyed by name.
///
/// Cheap to clone; clones share the same channels.
#[derive(Clone)]
pub struct ChannelRegistry {
    channels: Arc<Mutex<HashMap<String, Arc<Channel>>>>,
    default_capacity: Option<usize>,
    outstanding: Arc<watch::Sender<u64>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::with_default_capacity(None)
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose lazily created channels are bounded to `capacity`.
    pub fn with_default_capacity(capacity: Option<usize>) -> Self {
        Self {
            channels: Arc::default(),
            default_capacity: capacity,
            outstanding: Arc::new(watch::Sender::new(0)),
        }
    }

    /// Counts messages on `name` as outstanding work until acknowledged.
    pub fn track(&self, name: &str) {
        self.channel(name).track();
    }

    /// Messages enqueued on tracked channels and not yet acknowledged.
    pub fn outstanding(&self) -> u64 {
        *self.outstanding.borrow()
    }

    /// Waits until no tracked work is outstanding.
    pub async fn wait_until_drained(&self, timeout: Duration) -> bool {
        let mut outstanding = self.outstanding.subscribe();
        let drained = tokio::time::timeout(timeout, outstanding.wait_for(|n| *n == 0)).await;
        matches!(drained, Ok(Ok(_)))
    }

    /// Creates a channel with an explicit capacity.
    ///
    /// Fails if the channel already exists with a different capacity.
    pub fn declare(&self, name: &str, capacity: Option<usize>) -> Result<Arc<Channel>> {
        let mut channels = self.channels.lock();
        if let Some(existing) = channels.get(name) {
            if existing.capacity() != capacity {
                return Err(RouteError::ConfigError(format!(
                    "channel '{}' already declared with capacity {:?}",
                    name,
                    existing.capacity()
                )));
            }
            return Ok(existing.clone());
        }
        let channel = Arc::new(Channel::new(
            name.to_string(),
            capacity,
            self.outstanding.clone(),
        ));
        channels.insert(name.to_string(), channel.clone());
        Ok(channel)
    }

    pub fn channel(&self, name: &str) -> Arc<Channel> {
        self.channels
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Channel::new(
                    name.to_string(),
                    self.default_capacity,
                    self.outstanding.clone(),
                ))
            })
            .clone()
    }

    pub fn send(&self, name: &str, message: Message) -> Result<()> {
        self.channel(name).send(message)
    }

    pub async fn receive(&self, name: &str, timeout: Duration) -> Option<Message> {
        let channel = self.channel(name);
        channel.receive(timeout).await
    }

    pub fn depth(&self, name: &str) -> usize {
        self.channel(name).len()
    }

    /// Snapshot of `(name, depth)` for every known channel, sorted by name.
    pub fn depths(&self) -> Vec<(String, usize)> {
        let channels = self.channels.lock();
        let mut depths: Vec<_> = channels
            .values()
            .map(|c| (c.name().to_string(), c.len()))
            .collect();
        depths.sort();
        depths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::Body;

    #[tokio::test]
    async fn test_fifo_order() {
        let registry = ChannelRegistry::new();
        for i in 0..3 {
            registry.send("queue", Message::new(i)).unwrap();
        }
        for i in 0..3 {
            let message = registry
                .receive("queue", Duration::from_millis(10))
                .await
                .unwrap();
            assert_eq!(message.body, Body::Int(i));
        }
    }

    #[tokio::test]
    async fn test_receive_times_out_with_none() {
        let registry = ChannelRegistry::new();
        let started = std::time::Instant::now();
        assert!(
            registry
                .receive("empty", Duration::from_millis(50))
                .await
                .is_none()
        );
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_receiver_wakes_on_send() {
        let registry = ChannelRegistry::new();
        let consumer = registry.clone();
        let handle =
            tokio::spawn(async move { consumer.receive("wake", Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.send("wake", Message::new("hello")).unwrap();

        let received = handle.await.unwrap().unwrap();
        assert_eq!(received.body, Body::from("hello"));
    }

    #[tokio::test]
    async fn test_bounded_channel_rejects_when_full() {
        let registry = ChannelRegistry::new();
        let channel = registry.declare("bounded", Some(1)).unwrap();
        assert!(channel.has_room_for(1));
        channel.send(Message::new(1)).unwrap();
        assert!(!channel.has_room_for(1));
        assert!(matches!(
            channel.send(Message::new(2)),
            Err(RouteError::ResourceUnavailable(_))
        ));
    }

    #[test]
    fn test_tracked_work_counts_until_acknowledged() {
        let registry = ChannelRegistry::new();
        registry.send("in", Message::new(1)).unwrap();
        registry.send("untracked", Message::new(2)).unwrap();
        registry.track("in");
        assert_eq!(registry.outstanding(), 1);

        registry.send("in", Message::new(3)).unwrap();
        assert_eq!(registry.outstanding(), 2);

        let channel = registry.channel("in");
        channel.try_receive().unwrap();
        assert_eq!(registry.outstanding(), 2);
        channel.task_done();
        channel.try_receive().unwrap();
        channel.task_done();
        assert_eq!(registry.outstanding(), 0);

        // Tracking twice must not count queued messages again.
        registry.send("in", Message::new(4)).unwrap();
        registry.track("in");
        assert_eq!(registry.outstanding(), 1);
    }

    #[tokio::test]
    async fn test_wait_until_drained() {
        let registry = ChannelRegistry::new();
        registry.track("in");
        assert!(registry.wait_until_drained(Duration::from_millis(10)).await);

        registry.send("in", Message::new(1)).unwrap();
        assert!(!registry.wait_until_drained(Duration::from_millis(20)).await);

        let consumer = registry.channel("in");
        tokio::spawn(async move {
            consumer.recv().await;
            consumer.task_done();
        });
        assert!(registry.wait_until_drained(Duration::from_secs(5)).await);
    }

    #[test]
    fn test_declare_conflicting_capacity() {
        let registry = ChannelRegistry::new();
        registry.declare("q", Some(5)).unwrap();
        assert!(registry.declare("q", Some(5)).is_ok());
        assert!(matches!(
            registry.declare("q", None),
            Err(RouteError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_producers() {
        let registry = ChannelRegistry::new();
        let mut handles = Vec::new();
        for p in 0..4 {
            let producer = registry.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    producer.send("shared", Message::new(p * 100 + i)).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.depth("shared"), 100);
    }
}
