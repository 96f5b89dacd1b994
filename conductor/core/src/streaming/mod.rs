//! Streaming Infrastructure
//!
//! Drives provider streams into durable messages and fans them out to any
//! number of subscribers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        SessionRegistry                            │
//! │     MessageId ──▶ StreamSession   (at most one live per message)  │
//! │                        │                                          │
//! │   ProviderAdapter ──▶ SessionDriver ──checkpoint──▶ Store         │
//! │     (normalized         │                                         │
//! │      events)            ▼                                         │
//! │                  DeliveryChannel  (sequenced log + broadcast)     │
//! │                   │        │        │                             │
//! │              Subscription  │   poll(after, max)                   │
//! │                      Subscription                                 │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Sequence numbers per message are strictly increasing and start at 1.
//!   A resumed session continues after the last checkpointed sequence.
//! - Every session emits exactly one terminal event.
//! - A checkpoint is persisted before the event it covers is published.
//! - Slow subscribers never block the producer or each other.

mod checkpoint;
mod delivery;
mod registry;
mod session;
mod state;

pub use checkpoint::CheckpointPolicy;
pub use delivery::{AckHandle, DeliveryChannel, PollBatch, Subscription};
pub use registry::{SessionRegistry, Started};
pub use session::{AbortOutcome, SessionSpec, StreamSession};
pub use state::can_transition;
