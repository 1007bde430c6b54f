//! Append-only structured JSON-lines audit logging for the rendezvous relay.
//!
//! Registrations, authentication failures, supersessions, and evictions are
//! the security-relevant moments of a relay session. Each one can be
//! serialised as a single newline-terminated JSON object and appended to a
//! log file, producing a [JSON Lines](https://jsonlines.org/) stream that is
//! easy to ship, parse, and replay.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use audit_log::{AuditEntry, AuditEventType, AuditSink, AuditSource};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (sink, _handle) = AuditSink::start("/var/log/rendezvous/audit.jsonl").await?;
//!
//! sink.log(AuditEntry::new(
//!     AuditEventType::ProcessStarted,
//!     AuditSource::new("rendezvous"),
//!     serde_json::json!({"version": "0.1.0"}),
//! ))
//! .await;
//! # Ok(())
//! # }
//! ```

pub mod entry;
pub mod sink;
pub mod writer;

pub use entry::{AuditEntry, AuditEventType, AuditSource};
pub use sink::AuditSink;
pub use writer::{AuditWriteError, AuditWriter};
