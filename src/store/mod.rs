//! Persistence plane: §4.11, §4.12, §3 (Policy registry).
//!
//! Every store here opens a new rusqlite connection per operation per §5
//! ("SQLite-equivalent stores open a new connection per operation");
//! transactions wrap multi-row writes. Schema/PRAGMA style follows the
//! teacher's `signals::db_storage::DbSignalStorage` (`PRAGMA journal_mode =
//! WAL`), adapted from its held `Mutex<Connection>` to a fresh
//! `Connection::open` per call, per the spec's explicit connection policy.

pub mod ai_recommendation_store;
pub mod pick_event_log;
pub mod policy;
pub mod top_picks_store;
