//! Offline-capable record cache for address books.
//!
//! [`BookCache`] stores records keyed by uid in SQLite together with their
//! indexed summary fields, tracks local changes that still have to reach
//! the server, answers s-expression searches and drives paginated,
//! locale-sorted cursors guarded by a global revision.

pub mod book_cursor;
pub mod collate;
pub mod config;
pub mod cursor;
pub mod db;
pub mod error;
pub mod keys;
pub mod query;
pub mod record;
pub mod search;
pub mod store;

pub use book_cursor::BookCursor;
pub use collate::Collator;
pub use cursor::{Cursor, CursorOrigin, SortDirection, SortKey, StepFlags, StepOutcome};
pub use db::{BookCache, RevisionFreeze};
pub use error::{CacheError, ErrorKind, Result};
pub use query::Query;
pub use record::{
    MetaField, MetaFields, OfflineChange, OfflineState, Record, SearchContent, SearchData,
    StoredRecord,
};
pub use store::RecordStore;
