//! Per-message event log and fan-out
//!
//! A [`DeliveryChannel`] records every event a session publishes, in sequence
//! order, and broadcasts it to live subscribers. Subscribers that attach late
//! get the log replayed from their cursor. The replay snapshot and the live
//! receiver are taken under the same lock as publication, so every event is
//! seen exactly once: either in the replay or live.
//!
//! Live buffering is bounded per subscriber. A subscriber that falls more
//! than `subscriber_buffer` events behind gets a `lagged` notice and is
//! re-synced from the log starting after its last acknowledged sequence.
//! The producer never waits on subscribers.

use std::collections::VecDeque;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::messages::ServerMessage;
use crate::model::MessageId;
use crate::provider::FinishReason;

#[derive(Clone, Debug)]
enum EventKind {
    Start,
    Token(Range<usize>),
    Complete(FinishReason),
    Error { kind: String, message: String },
    Aborted,
}

#[derive(Clone, Debug)]
struct LoggedEvent {
    sequence: u64,
    kind: EventKind,
    /// Content length once this event applied
    end: usize,
}

#[derive(Debug)]
struct ChannelState {
    content: String,
    seed_len: usize,
    log: Vec<LoggedEvent>,
    next_sequence: u64,
    finished: bool,
}

/// One page of events for a poll request
#[derive(Clone, Debug, PartialEq)]
pub struct PollBatch {
    /// Events in sequence order
    pub events: Vec<ServerMessage>,
    /// Cursor to pass next time
    pub next_sequence: u64,
    /// Whether `events` ends with the terminal event
    pub finished: bool,
}

/// Ordered, replayable event stream for one message
#[derive(Debug)]
pub struct DeliveryChannel {
    message_id: MessageId,
    base_sequence: u64,
    state: Mutex<ChannelState>,
    live: broadcast::Sender<Arc<ServerMessage>>,
    subscribers: AtomicUsize,
    idle: Notify,
}

impl DeliveryChannel {
    /// Create a channel whose first event will carry `base_sequence`
    ///
    /// `seed` is content that already existed before this session (the last
    /// checkpoint when resuming). It is reported by `stream_start`.
    #[must_use]
    pub fn new(message_id: MessageId, seed: &str, base_sequence: u64, buffer: usize) -> Arc<Self> {
        let (live, _) = broadcast::channel(buffer.max(1));
        Arc::new(Self {
            message_id,
            base_sequence: base_sequence.max(1),
            state: Mutex::new(ChannelState {
                content: seed.to_string(),
                seed_len: seed.len(),
                log: Vec::new(),
                next_sequence: base_sequence.max(1),
                finished: false,
            }),
            live,
            subscribers: AtomicUsize::new(0),
            idle: Notify::new(),
        })
    }

    /// Message this channel belongs to
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// Sequence of the first event
    #[must_use]
    pub fn base_sequence(&self) -> u64 {
        self.base_sequence
    }

    /// Sequence the next published event will carry
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.state.lock().next_sequence
    }

    /// Content accumulated so far, seed included
    #[must_use]
    pub fn content(&self) -> String {
        self.state.lock().content.clone()
    }

    /// Whether a terminal event has been published
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Number of attached subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Acquire)
    }

    pub(crate) fn publish_start(&self) -> u64 {
        self.publish(EventKind::Start, "")
    }

    pub(crate) fn publish_token(&self, text: &str) -> u64 {
        self.publish(EventKind::Token(0..0), text)
    }

    pub(crate) fn publish_complete(&self, reason: FinishReason) -> u64 {
        self.publish(EventKind::Complete(reason), "")
    }

    pub(crate) fn publish_error(&self, kind: &str, message: &str) -> u64 {
        self.publish(
            EventKind::Error {
                kind: kind.to_string(),
                message: message.to_string(),
            },
            "",
        )
    }

    pub(crate) fn publish_aborted(&self) -> u64 {
        self.publish(EventKind::Aborted, "")
    }

    fn publish(&self, mut kind: EventKind, text: &str) -> u64 {
        let mut state = self.state.lock();
        if state.finished {
            tracing::warn!(message_id = %self.message_id, "Publish after terminal event ignored");
            return state.next_sequence.saturating_sub(1);
        }

        if let EventKind::Token(range) = &mut kind {
            let start = state.content.len();
            state.content.push_str(text);
            *range = start..state.content.len();
        }
        let terminal = matches!(
            kind,
            EventKind::Complete(_) | EventKind::Error { .. } | EventKind::Aborted
        );

        let event = LoggedEvent {
            sequence: state.next_sequence,
            kind,
            end: state.content.len(),
        };
        let message = Arc::new(self.render(&state, &event));
        state.next_sequence += 1;
        state.finished = terminal;
        state.log.push(event);

        // No receivers is fine; late subscribers replay from the log.
        let _ = self.live.send(message);
        state.next_sequence - 1
    }

    fn render(&self, state: &ChannelState, event: &LoggedEvent) -> ServerMessage {
        let message_id = self.message_id;
        let sequence = event.sequence;
        let upto = state.content[..event.end].to_string();
        match &event.kind {
            EventKind::Start => ServerMessage::StreamStart {
                message_id,
                sequence,
                content: state.content[..state.seed_len].to_string(),
            },
            EventKind::Token(range) => ServerMessage::Token {
                message_id,
                sequence,
                text: state.content[range.clone()].to_string(),
                cumulative_content: upto,
            },
            EventKind::Complete(reason) => ServerMessage::StreamComplete {
                message_id,
                sequence,
                final_content: upto,
                finish_reason: *reason,
            },
            EventKind::Error { kind, message } => ServerMessage::StreamError {
                message_id,
                sequence,
                kind: kind.clone(),
                message: message.clone(),
                partial_content: upto,
            },
            EventKind::Aborted => ServerMessage::StreamAborted {
                message_id,
                sequence,
                partial_content: upto,
            },
        }
    }

    /// Clamp a client cursor into this channel's range
    ///
    /// Cursors from before this session or beyond its head restart the
    /// client from `stream_start`, which carries the full seed.
    fn cursor(&self, state: &ChannelState, after: Option<u64>) -> u64 {
        let floor = self.base_sequence - 1;
        let head = state.next_sequence - 1;
        match after {
            Some(after) if (floor..=head).contains(&after) => after,
            Some(after) => {
                tracing::debug!(
                    message_id = %self.message_id,
                    after,
                    floor,
                    head,
                    "Cursor outside session range, replaying from start"
                );
                floor
            }
            None => floor,
        }
    }

    fn snapshot(&self, state: &ChannelState, after: u64, limit: usize) -> Vec<Arc<ServerMessage>> {
        let skip = usize::try_from(after.saturating_sub(self.base_sequence - 1)).unwrap_or(usize::MAX);
        state
            .log
            .iter()
            .skip(skip)
            .take(limit)
            .map(|event| Arc::new(self.render(state, event)))
            .collect()
    }

    fn events_after(&self, after: u64) -> Vec<Arc<ServerMessage>> {
        let state = self.state.lock();
        let after = self.cursor(&state, Some(after));
        self.snapshot(&state, after, usize::MAX)
    }

    /// Attach a subscriber that receives everything after `after`, then live events
    ///
    /// `None` replays from `stream_start`.
    #[must_use]
    pub fn subscribe(self: &Arc<Self>, after: Option<u64>) -> Subscription {
        let state = self.state.lock();
        let live = self.live.subscribe();
        let from = self.cursor(&state, after);
        let backlog = self.snapshot(&state, from, usize::MAX);
        drop(state);

        self.subscribers.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(
            message_id = %self.message_id,
            after = from,
            replay = backlog.len(),
            "Subscriber attached"
        );

        Subscription {
            channel: Arc::clone(self),
            live,
            backlog: backlog.into(),
            delivered: from,
            acked: Arc::new(AtomicU64::new(from)),
            auto_ack: true,
            finished: false,
        }
    }

    /// Up to `max` events after `after`, without attaching
    #[must_use]
    pub fn poll(&self, after: u64, max: usize) -> PollBatch {
        let state = self.state.lock();
        let from = self.cursor(&state, Some(after));
        let events: Vec<ServerMessage> = self
            .snapshot(&state, from, max.max(1))
            .into_iter()
            .map(|m| (*m).clone())
            .collect();
        drop(state);

        let next_sequence = events.last().and_then(ServerMessage::sequence).unwrap_or(from);
        let finished = events.last().is_some_and(ServerMessage::is_terminal);
        PollBatch {
            events,
            next_sequence,
            finished,
        }
    }

    fn detach(&self) {
        if self.subscribers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until no subscribers remain, up to `grace`
    ///
    /// Returns `true` if the channel went idle in time.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.subscriber_count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.subscriber_count() == 0;
            }
        }
    }
}

/// Handle for acknowledging delivered sequences from another task
#[derive(Clone, Debug)]
pub struct AckHandle {
    acked: Arc<AtomicU64>,
}

impl AckHandle {
    /// Record that everything up to `sequence` was received
    pub fn ack(&self, sequence: u64) {
        self.acked.fetch_max(sequence, Ordering::AcqRel);
    }

    /// Highest acknowledged sequence
    #[must_use]
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Acquire)
    }
}

/// An attached consumer of one message's events
///
/// Yields events in strictly increasing sequence order with no duplicates,
/// except after a `lagged` notice, where events after the last acknowledged
/// sequence are re-sent. Ends after the terminal event.
#[derive(Debug)]
pub struct Subscription {
    channel: Arc<DeliveryChannel>,
    live: broadcast::Receiver<Arc<ServerMessage>>,
    backlog: VecDeque<Arc<ServerMessage>>,
    delivered: u64,
    acked: Arc<AtomicU64>,
    auto_ack: bool,
    finished: bool,
}

impl Subscription {
    /// Message this subscription follows
    #[must_use]
    pub fn message_id(&self) -> MessageId {
        self.channel.message_id
    }

    /// Require explicit acknowledgements instead of acking on delivery
    #[must_use]
    pub fn manual_ack(mut self) -> Self {
        self.auto_ack = false;
        self
    }

    /// Handle for acknowledging from elsewhere
    #[must_use]
    pub fn ack_handle(&self) -> AckHandle {
        AckHandle {
            acked: Arc::clone(&self.acked),
        }
    }

    /// Highest sequence delivered so far
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Next event, or `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(event) = self.backlog.pop_front() {
                if let Some(message) = self.accept(&event) {
                    return Some(message);
                }
                continue;
            }

            let received = match self.live.try_recv() {
                Ok(event) => Ok(event),
                Err(TryRecvError::Lagged(missed)) => Err(RecvError::Lagged(missed)),
                Err(TryRecvError::Closed) => Err(RecvError::Closed),
                // Nothing more will be broadcast once the channel is finished.
                Err(TryRecvError::Empty) if self.channel.is_finished() => {
                    if !self.refill_from_log() {
                        return None;
                    }
                    continue;
                }
                Err(TryRecvError::Empty) => self.live.recv().await,
            };

            match received {
                Ok(event) => {
                    if let Some(message) = self.accept(&event) {
                        return Some(message);
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    let resync_after = self.acked.load(Ordering::Acquire).min(self.delivered);
                    self.backlog = self.channel.events_after(resync_after).into();
                    self.delivered = resync_after;
                    tracing::warn!(
                        message_id = %self.channel.message_id,
                        missed,
                        resync_from = resync_after + 1,
                        "Subscriber lagged"
                    );
                    return Some(ServerMessage::Lagged {
                        message_id: self.channel.message_id,
                        missed,
                        resync_from: resync_after + 1,
                    });
                }
                Err(RecvError::Closed) => {
                    if !self.refill_from_log() {
                        return None;
                    }
                }
            }
        }
    }

    /// Queue logged events after `delivered`; ends the subscription if there are none
    fn refill_from_log(&mut self) -> bool {
        let rest = self.channel.events_after(self.delivered);
        if rest.is_empty() {
            self.finished = true;
            return false;
        }
        self.backlog = rest.into();
        true
    }

    fn accept(&mut self, event: &Arc<ServerMessage>) -> Option<ServerMessage> {
        let sequence = event.sequence()?;
        if sequence <= self.delivered {
            return None;
        }
        self.delivered = sequence;
        if self.auto_ack {
            self.acked.fetch_max(sequence, Ordering::AcqRel);
        }
        if event.is_terminal() {
            self.finished = true;
        }
        Some((**event).clone())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.channel.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sequences(events: &[ServerMessage]) -> Vec<u64> {
        events.iter().filter_map(ServerMessage::sequence).collect()
    }

    async fn drain(sub: &mut Subscription) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Some(event) = sub.recv().await {
            out.push(event);
        }
        out
    }

    #[tokio::test]
    async fn test_late_subscriber_replays_then_follows_live() {
        let channel = DeliveryChannel::new(MessageId::new(), "", 1, 16);
        channel.publish_start();
        channel.publish_token("Hel");

        let mut sub = channel.subscribe(None);
        channel.publish_token("lo");
        channel.publish_complete(FinishReason::Stop);

        let events = drain(&mut sub).await;
        assert_eq!(sequences(&events), vec![1, 2, 3, 4]);
        match &events[2] {
            ServerMessage::Token {
                text,
                cumulative_content,
                ..
            } => {
                assert_eq!(text, "lo");
                assert_eq!(cumulative_content, "Hello");
            }
            other => panic!("expected token, got {other:?}"),
        }
        assert!(matches!(
            &events[3],
            ServerMessage::StreamComplete { final_content, .. } if final_content == "Hello"
        ));
    }

    #[tokio::test]
    async fn test_cursor_skips_already_seen_events() {
        let channel = DeliveryChannel::new(MessageId::new(), "", 1, 16);
        channel.publish_start();
        channel.publish_token("a");
        channel.publish_token("b");
        channel.publish_aborted();

        let mut sub = channel.subscribe(Some(2));
        let events = drain(&mut sub).await;
        assert_eq!(sequences(&events), vec![3, 4]);
    }

    #[tokio::test]
    async fn test_cursor_outside_range_replays_from_start_with_seed() {
        let channel = DeliveryChannel::new(MessageId::new(), "Hello", 9, 16);
        assert_eq!(channel.publish_start(), 9);
        channel.publish_token(", world");
        channel.publish_complete(FinishReason::Stop);

        for cursor in [Some(3), Some(400)] {
            let mut sub = channel.subscribe(cursor);
            let events = drain(&mut sub).await;
            assert_eq!(sequences(&events), vec![9, 10, 11]);
            assert!(matches!(
                &events[0],
                ServerMessage::StreamStart { content, .. } if content == "Hello"
            ));
            assert!(matches!(
                &events[2],
                ServerMessage::StreamComplete { final_content, .. } if final_content == "Hello, world"
            ));
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_resyncs_from_ack() {
        let channel = DeliveryChannel::new(MessageId::new(), "", 1, 2);
        let mut sub = channel.subscribe(None);

        channel.publish_start();
        for word in ["a", "b", "c", "d", "e"] {
            channel.publish_token(word);
        }
        channel.publish_complete(FinishReason::Stop);

        let events = drain(&mut sub).await;
        assert!(matches!(
            events[0],
            ServerMessage::Lagged { resync_from: 1, .. }
        ));
        assert_eq!(sequences(&events[1..]), vec![1, 2, 3, 4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn test_cursor_at_terminal_head_ends_immediately() {
        let channel = DeliveryChannel::new(MessageId::new(), "", 1, 4);
        channel.publish_start();
        channel.publish_token("a");
        let terminal = channel.publish_complete(FinishReason::Stop);

        let mut sub = channel.subscribe(Some(terminal));
        let next = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("subscription at the terminal head must end");
        assert!(next.is_none());
        assert_eq!(sub.delivered(), terminal);
    }

    #[tokio::test]
    async fn test_subscriber_attached_before_finish_drains_then_ends() {
        let channel = DeliveryChannel::new(MessageId::new(), "", 1, 4);
        channel.publish_start();
        let mut sub = channel.subscribe(None);
        assert_eq!(sequences(&[sub.recv().await.unwrap()]), vec![1]);

        channel.publish_aborted();
        let rest = tokio::time::timeout(Duration::from_secs(1), drain(&mut sub))
            .await
            .unwrap();
        assert_eq!(sequences(&rest), vec![2]);
    }

    #[tokio::test]
    async fn test_lag_resyncs_from_manual_ack_behind_delivery() {
        let channel = DeliveryChannel::new(MessageId::new(), "", 1, 2);
        let mut sub = channel.subscribe(None).manual_ack();
        let acks = sub.ack_handle();

        channel.publish_start();
        channel.publish_token("a");
        let first = vec![sub.recv().await.unwrap(), sub.recv().await.unwrap()];
        assert_eq!(sequences(&first), vec![1, 2]);
        acks.ack(1);
        assert_eq!(acks.acked(), 1);

        for word in ["b", "c", "d", "e", "f"] {
            channel.publish_token(word);
        }
        channel.publish_complete(FinishReason::Stop);

        let events = drain(&mut sub).await;
        assert!(matches!(
            events[0],
            ServerMessage::Lagged { resync_from: 2, .. }
        ));
        assert_eq!(sequences(&events[1..]), vec![2, 3, 4, 5, 6, 7, 8]);
        assert!(matches!(
            events.last(),
            Some(ServerMessage::StreamComplete { final_content, .. }) if final_content == "abcdef"
        ));
    }

    #[tokio::test]
    async fn test_publish_after_terminal_is_ignored() {
        let channel = DeliveryChannel::new(MessageId::new(), "", 1, 4);
        channel.publish_start();
        channel.publish_error("stalled", "no events");
        channel.publish_token("late");

        assert!(channel.is_finished());
        assert_eq!(channel.content(), "");
        assert_eq!(channel.next_sequence(), 3);
    }

    #[tokio::test]
    async fn test_poll_batches_and_cursor() {
        let channel = DeliveryChannel::new(MessageId::new(), "", 1, 4);
        channel.publish_start();
        for word in ["a", "b", "c"] {
            channel.publish_token(word);
        }

        let first = channel.poll(0, 2);
        assert_eq!(sequences(&first.events), vec![1, 2]);
        assert_eq!(first.next_sequence, 2);
        assert!(!first.finished);

        channel.publish_complete(FinishReason::Length);
        let second = channel.poll(first.next_sequence, 10);
        assert_eq!(sequences(&second.events), vec![3, 4, 5]);
        assert!(second.finished);

        let empty = channel.poll(second.next_sequence, 10);
        assert!(empty.events.is_empty());
        assert_eq!(empty.next_sequence, 5);
    }

    #[tokio::test]
    async fn test_wait_idle_tracks_subscribers() {
        let channel = DeliveryChannel::new(MessageId::new(), "", 1, 4);
        assert!(channel.wait_idle(Duration::from_millis(10)).await);

        let sub = channel.subscribe(None);
        assert_eq!(channel.subscriber_count(), 1);
        assert!(!channel.wait_idle(Duration::from_millis(10)).await);

        let waiter = {
            let channel = Arc::clone(&channel);
            tokio::spawn(async move { channel.wait_idle(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        drop(sub);
        assert!(waiter.await.unwrap());
    }
}
