//! Message lifecycle engine.
//!
//! Three cooperating loops move every accepted message to a terminal
//! state, communicating only through the durable store, the broker, and
//! the deduplication cache:
//!
//! ```text
//!  ingest ──► store(unsent) ──producer──► Q.main ──consumer──┬─► store(sent)
//!                                            ▲               │
//!                                            │ TTL expiry    ├─► Q.retry
//!                                            └───────────────┘
//!                                                            └─► Q.dlq + store(failed)
//!
//!  sweeper: store(processing, stale) ──► Q.dlq + store(failed)
//! ```
//!
//! The producer and sweeper are timer loops; the consumer blocks on the
//! main queue. All three stop cooperatively via a `CancellationToken`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consumer;
pub mod producer;
pub mod sweeper;
pub mod webhook;

pub use consumer::{Processor, ProcessorStats};
pub use producer::{ProducerConfig, Scheduler};
pub use sweeper::{StaleSweeper, SweeperConfig, STALE_THRESHOLD, SWEEP_INTERVAL};
pub use webhook::HttpWebhookClient;
