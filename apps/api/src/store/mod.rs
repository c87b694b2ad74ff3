//! Storage backends. Both implement the same narrow contracts
//! (`QuotaLedger`, `BatchStore`, `RankingStore`):
//!
//! - `pg`: PostgreSQL via sqlx — the durable production store
//! - `memory`: in-process — standalone mode and tests
//!
//! Either backend serializes all counter mutations for one job, so cap
//! decisions form a strict total order per job while jobs proceed in
//! parallel.

pub mod memory;
pub mod pg;
