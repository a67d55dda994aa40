//! The SQLite-backed cache: records, their summary fields, the offline
//! change ledger and the cursor queries.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, warn};

use crate::collate::Collator;
use crate::cursor::{Cursor, CursorOrigin, CursorState, SortKey, StepFlags, StepOutcome};
use crate::error::{CacheError, Result};
use crate::keys::{self, KeySpace, RevisionClock};
use crate::query::Query;
use crate::record::{
    MetaFields, OfflineChange, OfflineState, Record, SearchContent, SearchData, StoredRecord,
};

const DELETED: i64 = 3;

struct Inner {
    conn: Connection,
    clock: RevisionClock,
    collator: Collator,
    /// Nesting depth of [`BookCache::freeze_revision`].
    frozen: u32,
    revision_pending: bool,
}

/// Record cache for one collection.
///
/// All access goes through one connection behind a mutex; every mutation
/// runs in a `BEGIN IMMEDIATE` transaction that also writes the new global
/// revision, so a revision read under the same lock describes exactly the
/// rows visible to the reader.
pub struct BookCache {
    inner: Mutex<Inner>,
}

impl BookCache {
    /// Open (creating if needed) the cache at `path`, collating for `locale`.
    /// A different stored locale is replaced and all sort keys rebuilt.
    pub fn open(path: impl AsRef<Path>, locale: &str) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        debug!("opening cache at {:?}", path);
        Self::setup(Connection::open(path)?, locale)
    }

    pub fn open_in_memory(locale: &str) -> Result<Self> {
        Self::setup(Connection::open_in_memory()?, locale)
    }

    fn setup(conn: Connection, locale: &str) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "case_sensitive_like", "ON")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS keys (
              key   TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS objects (
              uid      TEXT PRIMARY KEY,
              revision TEXT,
              object   TEXT NOT NULL,
              state    INTEGER NOT NULL DEFAULT 0,
              extra    TEXT
            );

            CREATE TABLE IF NOT EXISTS summary (
              uid        TEXT NOT NULL REFERENCES objects(uid) ON DELETE CASCADE,
              field      TEXT NOT NULL,
              seq        INTEGER NOT NULL DEFAULT 0,
              value      TEXT NOT NULL,
              value_norm TEXT NOT NULL,
              sort_key   TEXT NOT NULL,
              PRIMARY KEY (uid, field, seq)
            );

            CREATE INDEX IF NOT EXISTS idx_objects_state ON objects(state);
            CREATE INDEX IF NOT EXISTS idx_objects_extra ON objects(extra);
            CREATE INDEX IF NOT EXISTS idx_summary_sort ON summary(field, sort_key);
            CREATE INDEX IF NOT EXISTS idx_summary_norm ON summary(field, value_norm);
        "#,
        )?;

        match keys::read_int(&conn, KeySpace::Internal, keys::SCHEMA_KEY)? {
            None => keys::write(
                &conn,
                KeySpace::Internal,
                keys::SCHEMA_KEY,
                Some(&keys::SCHEMA_VERSION.to_string()),
            )?,
            Some(found) if found > keys::SCHEMA_VERSION => {
                return Err(CacheError::InvalidArgument(format!(
                    "cache schema {} is newer than supported {}",
                    found,
                    keys::SCHEMA_VERSION
                )));
            }
            Some(_) => {}
        }

        let cache = Self {
            inner: Mutex::new(Inner {
                conn,
                clock: RevisionClock::default(),
                collator: Collator::new(locale)?,
                frozen: 0,
                revision_pending: false,
            }),
        };

        {
            let mut guard = cache.inner.lock();
            let inner = &mut *guard;
            let stored = keys::read(&inner.conn, KeySpace::Internal, keys::LOCALE_KEY)?;
            let revision = keys::read(&inner.conn, KeySpace::Internal, keys::REVISION_KEY)?;
            if revision.is_none() {
                let fresh = inner.clock.next(None)?;
                keys::write(&inner.conn, KeySpace::Internal, keys::REVISION_KEY, Some(&fresh))?;
            }
            if stored.is_none() {
                keys::write(&inner.conn, KeySpace::Internal, keys::LOCALE_KEY, Some(locale))?;
            }
        }
        cache.set_locale(locale)?;
        Ok(cache)
    }

    /// Run `f` in an immediate transaction after stamping a new revision.
    /// Nothing is written when `f` fails.
    fn write_txn<T>(
        &self,
        f: impl FnOnce(&Connection, &Collator, &str) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let tx = inner
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let revision = next_revision(&tx, &mut inner.clock, inner.frozen, &mut inner.revision_pending)?;
        let value = f(&tx, &inner.collator, &revision)?;
        tx.commit()?;
        Ok(value)
    }

    // ---------------------------------------------------------------------
    // keys

    /// Data version set by the backend, `-1` when never set.
    pub fn get_version(&self) -> Result<i64> {
        let inner = self.inner.lock();
        Ok(keys::read_int(&inner.conn, KeySpace::Internal, keys::VERSION_KEY)?.unwrap_or(-1))
    }

    pub fn set_version(&self, version: i64) -> Result<()> {
        let inner = self.inner.lock();
        keys::write(
            &inner.conn,
            KeySpace::Internal,
            keys::VERSION_KEY,
            Some(&version.to_string()),
        )
    }

    /// Current global revision.
    pub fn revision(&self) -> Result<String> {
        let inner = self.inner.lock();
        keys::read(&inner.conn, KeySpace::Internal, keys::REVISION_KEY)?
            .ok_or_else(|| CacheError::NotFound(keys::REVISION_KEY.to_string()))
    }

    pub fn set_revision(&self, revision: &str) -> Result<()> {
        let inner = self.inner.lock();
        keys::write(&inner.conn, KeySpace::Internal, keys::REVISION_KEY, Some(revision))
    }

    pub fn get_key(&self, name: &str) -> Result<String> {
        let inner = self.inner.lock();
        keys::read(&inner.conn, KeySpace::User, name)?
            .ok_or_else(|| CacheError::NotFound(name.to_string()))
    }

    /// Set a backend key; `None` removes it.
    pub fn set_key(&self, name: &str, value: Option<&str>) -> Result<()> {
        let inner = self.inner.lock();
        keys::write(&inner.conn, KeySpace::User, name, value)
    }

    pub fn get_key_int(&self, name: &str) -> Result<i64> {
        let inner = self.inner.lock();
        keys::read_int(&inner.conn, KeySpace::User, name)?
            .ok_or_else(|| CacheError::NotFound(name.to_string()))
    }

    pub fn set_key_int(&self, name: &str, value: i64) -> Result<()> {
        self.set_key(name, Some(&value.to_string()))
    }

    /// Hold back revision changes until the returned guard is thawed or
    /// dropped. Mutations made meanwhile keep the current revision and cause
    /// a single change at the end. Freezes nest.
    pub fn freeze_revision(&self) -> RevisionFreeze<'_> {
        self.inner.lock().frozen += 1;
        RevisionFreeze {
            cache: self,
            active: true,
        }
    }

    pub fn is_revision_frozen(&self) -> bool {
        self.inner.lock().frozen > 0
    }

    fn thaw_revision(&self) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.frozen = inner.frozen.saturating_sub(1);
        if inner.frozen > 0 || !inner.revision_pending {
            return Ok(());
        }
        inner.revision_pending = false;
        let tx = inner
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let revision = change_revision(&tx, &mut inner.clock)?;
        tx.commit()?;
        debug!("revision changes thawed, now at {}", revision);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // locale

    pub fn locale(&self) -> String {
        self.inner.lock().collator.locale().to_string()
    }

    pub fn collator(&self) -> Collator {
        self.inner.lock().collator.clone()
    }

    /// Switch the collation locale, rebuilding every stored sort key.
    /// Setting the active locale again is a no-op.
    pub fn set_locale(&self, locale: &str) -> Result<()> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let stored = keys::read(&inner.conn, KeySpace::Internal, keys::LOCALE_KEY)?;
        if stored.as_deref() == Some(locale) && inner.collator.locale() == locale {
            return Ok(());
        }

        let collator = Collator::new(locale)?;
        let tx = inner
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare("SELECT rowid, value FROM summary")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        {
            let mut stmt = tx.prepare("UPDATE summary SET sort_key = ?1 WHERE rowid = ?2")?;
            for (rowid, value) in &rows {
                stmt.execute(params![collator.generate_key(value), rowid])?;
            }
        }
        keys::write(&tx, KeySpace::Internal, keys::LOCALE_KEY, Some(locale))?;
        next_revision(&tx, &mut inner.clock, inner.frozen, &mut inner.revision_pending)?;
        tx.commit()?;

        debug!(
            "collation locale changed from {:?} to {}, {} sort keys rebuilt",
            stored,
            locale,
            rows.len()
        );
        inner.collator = collator;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // records

    /// Insert or replace one record. With `offline` the change is recorded
    /// in the offline ledger, otherwise the record is marked synced.
    pub fn put(&self, record: &Record, offline: bool) -> Result<()> {
        self.put_many(std::slice::from_ref(record), offline)
    }

    /// Store several records in one transaction and one revision change.
    pub fn put_many(&self, records: &[Record], offline: bool) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for record in records {
            if record.uid.is_empty() {
                return Err(CacheError::InvalidArgument(
                    "record uid must not be empty".to_string(),
                ));
            }
        }
        self.write_txn(|conn, collator, revision| {
            for record in records {
                let state = put_record(conn, collator, record, offline, revision)?;
                debug!("put {} as {}", record.uid, state);
            }
            Ok(())
        })
    }

    /// Remove a record. Offline removal leaves a tombstone for the next
    /// sync, except for records never uploaded, which are purged.
    pub fn remove(&self, uid: &str, offline: bool) -> Result<()> {
        self.write_txn(|conn, _, _| {
            let state = read_state(conn, uid)?.ok_or_else(|| CacheError::NotFound(uid.to_string()))?;
            if !offline || state == OfflineState::LocallyCreated {
                conn.execute("DELETE FROM objects WHERE uid = ?1", params![uid])?;
                debug!("purged {}", uid);
            } else {
                conn.execute(
                    "UPDATE objects SET state = ?1 WHERE uid = ?2",
                    params![OfflineState::LocallyDeleted.to_db(), uid],
                )?;
                debug!("tombstoned {}", uid);
            }
            Ok(())
        })
    }

    /// Purge every record, tombstones included.
    pub fn remove_all(&self) -> Result<usize> {
        self.write_txn(|conn, _, _| {
            let removed = conn.execute("DELETE FROM objects", [])?;
            debug!("purged all {} records", removed);
            Ok(removed)
        })
    }

    pub fn get(&self, uid: &str, include_deleted: bool) -> Result<StoredRecord> {
        let inner = self.inner.lock();
        let row = inner
            .conn
            .query_row(
                "SELECT revision, object, state, extra FROM objects WHERE uid = ?1",
                params![uid],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        let (revision, body, state, extra) =
            row.ok_or_else(|| CacheError::NotFound(uid.to_string()))?;
        let state = OfflineState::from_db(state)?;
        if state == OfflineState::LocallyDeleted && !include_deleted {
            return Err(CacheError::NotFound(uid.to_string()));
        }

        Ok(StoredRecord {
            record: Record {
                uid: uid.to_string(),
                revision,
                body,
                meta: load_meta(&inner.conn, uid)?,
                extra,
            },
            state,
        })
    }

    pub fn get_extra(&self, uid: &str) -> Result<Option<String>> {
        let inner = self.inner.lock();
        let extra = inner
            .conn
            .query_row(
                "SELECT extra FROM objects WHERE uid = ?1 AND state != ?2",
                params![uid, DELETED],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        extra.ok_or_else(|| CacheError::NotFound(uid.to_string()))
    }

    pub fn set_extra(&self, uid: &str, extra: Option<&str>) -> Result<()> {
        let inner = self.inner.lock();
        let changed = inner.conn.execute(
            "UPDATE objects SET extra = ?1 WHERE uid = ?2 AND state != ?3",
            params![extra, uid, DELETED],
        )?;
        if changed == 0 {
            return Err(CacheError::NotFound(uid.to_string()));
        }
        Ok(())
    }

    /// Offline state of `uid`; tombstones report `LocallyDeleted`.
    pub fn get_offline_state(&self, uid: &str) -> Result<OfflineState> {
        let inner = self.inner.lock();
        read_state(&inner.conn, uid)?.ok_or_else(|| CacheError::NotFound(uid.to_string()))
    }

    /// Overwrite the offline state. Marking a record deleted keeps its data.
    pub fn set_offline_state(&self, uid: &str, state: OfflineState) -> Result<()> {
        self.write_txn(|conn, _, _| {
            let changed = conn.execute(
                "UPDATE objects SET state = ?1 WHERE uid = ?2",
                params![state.to_db(), uid],
            )?;
            if changed == 0 {
                return Err(CacheError::NotFound(uid.to_string()));
            }
            Ok(())
        })
    }

    pub fn count(&self, include_deleted: bool) -> Result<usize> {
        let inner = self.inner.lock();
        let sql = if include_deleted {
            "SELECT COUNT(*) FROM objects"
        } else {
            "SELECT COUNT(*) FROM objects WHERE state != ?1"
        };
        let n: i64 = if include_deleted {
            inner.conn.query_row(sql, [], |row| row.get(0))?
        } else {
            inner.conn.query_row(sql, params![DELETED], |row| row.get(0))?
        };
        Ok(n.max(0) as usize)
    }

    pub fn contains(&self, uid: &str, include_deleted: bool) -> Result<bool> {
        let inner = self.inner.lock();
        Ok(match read_state(&inner.conn, uid)? {
            None => false,
            Some(OfflineState::LocallyDeleted) => include_deleted,
            Some(_) => true,
        })
    }

    // ---------------------------------------------------------------------
    // offline ledger

    /// Every record that is not synced, ordered by uid.
    pub fn get_offline_changes(&self) -> Result<Vec<OfflineChange>> {
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(
            "SELECT uid, revision, state FROM objects WHERE state != ?1 ORDER BY uid",
        )?;
        let rows = stmt.query_map(params![OfflineState::Synced.to_db()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (uid, revision, state) = row?;
            out.push(OfflineChange {
                uid,
                revision,
                state: OfflineState::from_db(state)?,
            });
        }
        Ok(out)
    }

    /// Forget local changes after they reached the server: tombstones are
    /// purged and everything else becomes synced.
    pub fn clear_offline_changes(&self) -> Result<()> {
        self.write_txn(|conn, _, _| {
            let purged = conn.execute("DELETE FROM objects WHERE state = ?1", params![DELETED])?;
            let synced = conn.execute(
                "UPDATE objects SET state = ?1 WHERE state != ?1",
                params![OfflineState::Synced.to_db()],
            )?;
            debug!(
                "cleared offline changes: {} purged, {} marked synced",
                purged, synced
            );
            Ok(())
        })
    }

    // ---------------------------------------------------------------------
    // search

    /// Records matching `sexp` (all records when `None` or empty), tombstones
    /// excluded, ordered by uid.
    pub fn search(&self, sexp: Option<&str>, meta_only: bool) -> Result<Vec<SearchData>> {
        self.search_with(sexp, meta_only, false)
    }

    pub fn search_with(
        &self,
        sexp: Option<&str>,
        meta_only: bool,
        include_deleted: bool,
    ) -> Result<Vec<SearchData>> {
        let mut out = Vec::new();
        self.search_with_callback(sexp, meta_only, include_deleted, |data| {
            out.push(data);
            true
        })?;
        Ok(out)
    }

    /// Hand the records matching `sexp` to `f` one at a time, ordered by uid,
    /// until `f` returns `false`. `f` runs under the cache lock and must not
    /// call back into the cache.
    pub fn search_with_callback<F>(
        &self,
        sexp: Option<&str>,
        meta_only: bool,
        include_deleted: bool,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(SearchData) -> bool,
    {
        let query = parse_sexp(sexp)?;
        let mut params = Vec::new();
        let sql = format!(
            "SELECT o.uid, o.object, o.extra FROM objects o WHERE {} ORDER BY o.uid",
            where_sql(query.as_ref(), include_deleted, &mut params)
        );

        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params))?;
        while let Some(row) = rows.next()? {
            let uid: String = row.get(0)?;
            let content = if meta_only {
                SearchContent::Meta(load_meta(&inner.conn, &uid)?)
            } else {
                SearchContent::Full(row.get(1)?)
            };
            let data = SearchData {
                uid,
                extra: row.get(2)?,
                content,
            };
            if !f(data) {
                debug!("search stopped by the callback");
                break;
            }
        }
        Ok(())
    }

    /// Uids matching `sexp`, tombstones excluded, ordered by uid.
    pub fn search_uids(&self, sexp: Option<&str>) -> Result<Vec<String>> {
        let query = parse_sexp(sexp)?;
        let mut params = Vec::new();
        let sql = format!(
            "SELECT o.uid FROM objects o WHERE {} ORDER BY o.uid",
            where_sql(query.as_ref(), false, &mut params)
        );
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| row.get::<_, String>(0))?;
        let uids = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(uids)
    }

    /// Uids whose extra equals `extra`, tombstones included, ordered by uid.
    /// Fails with `NotFound` when there are none.
    pub fn get_uids_with_extra(&self, extra: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let mut stmt = inner
            .conn
            .prepare("SELECT uid FROM objects WHERE extra = ?1 ORDER BY uid")?;
        let rows = stmt.query_map(params![extra], |row| row.get::<_, String>(0))?;
        let uids = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        if uids.is_empty() {
            return Err(CacheError::NotFound(extra.to_string()));
        }
        Ok(uids)
    }

    pub fn get_uids(&self, include_deleted: bool) -> Result<Vec<String>> {
        let mut params = Vec::new();
        let sql = format!(
            "SELECT o.uid FROM objects o WHERE {} ORDER BY o.uid",
            where_sql(None, include_deleted, &mut params)
        );
        let inner = self.inner.lock();
        let mut stmt = inner.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| row.get::<_, String>(0))?;
        let uids = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(uids)
    }

    // ---------------------------------------------------------------------
    // cursors

    pub fn cursor_new(&self, sexp: Option<&str>, sort: &[SortKey]) -> Result<Cursor> {
        Cursor::new(sexp, sort)
    }

    /// Replace the cursor's filter; its position is left alone.
    pub fn cursor_set_sexp(&self, cursor: &mut Cursor, sexp: Option<&str>) -> Result<()> {
        cursor.set_sexp(sexp)
    }

    /// Move and/or fetch `count` records from `origin` (backwards when
    /// negative).
    ///
    /// With a `revision_guard`, the step fails with `OutOfSync` unless the
    /// guard equals the current revision; the check and the query run under
    /// one write lock so no mutation can slip in between. On any failure
    /// the cursor keeps its previous position.
    pub fn cursor_step(
        &self,
        cursor: &mut Cursor,
        revision_guard: Option<&str>,
        flags: StepFlags,
        origin: CursorOrigin,
        count: i32,
    ) -> Result<StepOutcome> {
        let mut guard = self.inner.lock();
        let tx = guard
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let result = step_locked(&tx, cursor, revision_guard, flags, origin, count);
        match result {
            Ok((outcome, state)) => {
                tx.commit()?;
                if flags.contains(StepFlags::MOVE) {
                    cursor.state = state;
                }
                debug!(
                    "cursor step {:?} {} returned {} records, now at {:?}",
                    origin,
                    count,
                    outcome.n_results,
                    cursor.state.position
                );
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback) = tx.rollback() {
                    warn!("failed to roll back cursor step: {}", rollback);
                }
                Err(err)
            }
        }
    }

    /// Aim the cursor at the first record of alphabetic bucket `index` of
    /// the active locale.
    pub fn cursor_set_target_alphabetic_index(&self, cursor: &mut Cursor, index: usize) -> Result<()> {
        let key = self.inner.lock().collator.generate_key_for_index(index)?;
        cursor.set_partial(key);
        Ok(())
    }

    /// `(total, position)` of the cursor against the current store.
    /// Position counts the records up to and including the cursor's
    /// record: 0 at BEGIN, `total + 1` at END.
    pub fn cursor_calculate(&self, cursor: &Cursor) -> Result<(i64, i64)> {
        let inner = self.inner.lock();
        let total = count_for_cursor(&inner.conn, cursor, false)?;
        let position = if cursor.state.is_clear() {
            match cursor.state.position {
                CursorOrigin::End => total + 1,
                _ => 0,
            }
        } else {
            count_for_cursor(&inner.conn, cursor, true)?
        };
        Ok((total, position))
    }

    pub fn cursor_compare_record(&self, cursor: &Cursor, record: &Record) -> (Ordering, bool) {
        let inner = self.inner.lock();
        cursor.compare(&inner.collator, record)
    }
}

/// Guard returned by [`BookCache::freeze_revision`].
#[must_use = "revision changes resume as soon as the guard is dropped"]
pub struct RevisionFreeze<'a> {
    cache: &'a BookCache,
    active: bool,
}

impl RevisionFreeze<'_> {
    /// Resume revision changes, reporting a failure to write the pending one.
    pub fn thaw(mut self) -> Result<()> {
        self.active = false;
        self.cache.thaw_revision()
    }
}

impl Drop for RevisionFreeze<'_> {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = self.cache.thaw_revision() {
                warn!("failed to change revision after thaw: {}", err);
            }
        }
    }
}

/// Revision for a mutation: a fresh one, or the current one while frozen.
fn next_revision(
    conn: &Connection,
    clock: &mut RevisionClock,
    frozen: u32,
    pending: &mut bool,
) -> Result<String> {
    if frozen > 0 {
        *pending = true;
        return Ok(keys::read(conn, KeySpace::Internal, keys::REVISION_KEY)?.unwrap_or_default());
    }
    change_revision(conn, clock)
}

fn change_revision(conn: &Connection, clock: &mut RevisionClock) -> Result<String> {
    let previous = keys::read(conn, KeySpace::Internal, keys::REVISION_KEY)?;
    let revision = clock.next(previous.as_deref())?;
    keys::write(conn, KeySpace::Internal, keys::REVISION_KEY, Some(&revision))?;
    Ok(revision)
}

fn read_state(conn: &Connection, uid: &str) -> Result<Option<OfflineState>> {
    let state = conn
        .query_row(
            "SELECT state FROM objects WHERE uid = ?1",
            params![uid],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    state.map(OfflineState::from_db).transpose()
}

fn put_record(
    conn: &Connection,
    collator: &Collator,
    record: &Record,
    offline: bool,
    revision: &str,
) -> Result<OfflineState> {
    let state = if offline {
        match read_state(conn, &record.uid)? {
            None | Some(OfflineState::LocallyCreated) => OfflineState::LocallyCreated,
            Some(_) => OfflineState::LocallyModified,
        }
    } else {
        OfflineState::Synced
    };

    conn.execute(
        r#"
        INSERT INTO objects (uid, revision, object, state, extra)
        VALUES (?1, ?2, ?3, ?4, ?5)
        ON CONFLICT(uid) DO UPDATE SET
          revision=excluded.revision,
          object=excluded.object,
          state=excluded.state,
          extra=excluded.extra
    "#,
        params![
            record.uid,
            record.revision.as_deref().unwrap_or(revision),
            record.body,
            state.to_db(),
            record.extra,
        ],
    )?;

    conn.execute("DELETE FROM summary WHERE uid = ?1", params![record.uid])?;

    let mut stmt = conn.prepare(
        r#"INSERT INTO summary (uid, field, seq, value, value_norm, sort_key)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
    )?;
    let mut seqs: HashMap<&str, i64> = HashMap::new();
    for meta in record.meta.iter() {
        let seq = seqs.entry(meta.field.as_str()).or_insert(0);
        stmt.execute(params![
            record.uid,
            meta.field,
            *seq,
            meta.value,
            crate::search::normalize(&meta.value),
            collator.generate_key(&meta.value),
        ])?;
        *seq += 1;
    }
    Ok(state)
}

fn load_meta(conn: &Connection, uid: &str) -> Result<MetaFields> {
    let mut stmt = conn.prepare("SELECT field, value FROM summary WHERE uid = ?1 ORDER BY rowid")?;
    let rows = stmt.query_map(params![uid], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;
    let mut meta = MetaFields::new();
    for row in rows {
        let (field, value) = row?;
        meta.push(&field, &value);
    }
    Ok(meta)
}

fn parse_sexp(sexp: Option<&str>) -> Result<Option<Query>> {
    match sexp {
        Some(s) => Query::parse(s),
        None => Ok(None),
    }
}

fn where_sql(query: Option<&Query>, include_deleted: bool, params: &mut Vec<Value>) -> String {
    let mut clauses = Vec::new();
    if !include_deleted {
        clauses.push(format!("o.state != {}", DELETED));
    }
    if let Some(query) = query {
        clauses.push(format!("({})", query.to_sql(params)));
    }
    if clauses.is_empty() {
        "1".to_string()
    } else {
        clauses.join(" AND ")
    }
}

fn count_for_cursor(conn: &Connection, cursor: &Cursor, up_to_position: bool) -> Result<i64> {
    let mut params = Vec::new();
    let mut sql = String::from("SELECT COUNT(*) FROM objects o");
    sql.push_str(&cursor.joins_sql(&mut params));
    sql.push_str(" WHERE ");
    sql.push_str(&cursor.filter_sql(&mut params));
    if up_to_position {
        if let Some(constraints) = cursor.constraints_sql(&cursor.state, true, true, &mut params) {
            sql.push_str(&format!(" AND ({})", constraints));
        }
    }
    let n = conn.query_row(&sql, params_from_iter(params), |row| row.get::<_, i64>(0))?;
    Ok(n)
}

fn step_locked(
    conn: &Connection,
    cursor: &Cursor,
    revision_guard: Option<&str>,
    flags: StepFlags,
    origin: CursorOrigin,
    count: i32,
) -> Result<(StepOutcome, CursorState)> {
    if let Some(expected) = revision_guard {
        let current = keys::read(conn, KeySpace::Internal, keys::REVISION_KEY)?.unwrap_or_default();
        if current != expected {
            return Err(CacheError::OutOfSync(format!(
                "revision guard “{}” does not match current revision “{}”",
                expected, current
            )));
        }
    }

    let try_position = match origin {
        CursorOrigin::Current => cursor.state.position,
        other => other,
    };
    if try_position == CursorOrigin::Begin && count < 0 {
        return Err(CacheError::OutOfList(
            "cursor is already at the beginning of the list".to_string(),
        ));
    }
    if try_position == CursorOrigin::End && count > 0 {
        return Err(CacheError::OutOfList(
            "cursor is already at the end of the list".to_string(),
        ));
    }

    let fetch = flags.contains(StepFlags::FETCH);
    let mut state = cursor.state.clone();
    if origin != CursorOrigin::Current {
        state.clear(origin);
    }
    if count == 0 {
        let outcome = StepOutcome {
            n_results: 0,
            records: fetch.then(Vec::new),
        };
        return Ok((outcome, state));
    }

    let reverse = count < 0;
    let mut params = Vec::new();
    let mut sql = format!(
        "SELECT o.uid, o.object, o.extra, {} FROM objects o",
        cursor.keys_sql()
    );
    sql.push_str(&cursor.joins_sql(&mut params));
    sql.push_str(" WHERE ");
    sql.push_str(&cursor.filter_sql(&mut params));
    if let Some(constraints) = cursor.constraints_sql(&state, reverse, false, &mut params) {
        sql.push_str(&format!(" AND ({})", constraints));
    }
    sql.push(' ');
    sql.push_str(&cursor.order_sql(reverse));
    sql.push_str(" LIMIT ?");
    params.push(Value::Integer(i64::from(count).abs()));

    let n_keys = cursor.sort_keys().len();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(params), |row| {
        let uid: String = row.get(0)?;
        let object: String = row.get(1)?;
        let extra: Option<String> = row.get(2)?;
        let keys = (0..n_keys)
            .map(|idx| row.get::<_, String>(3 + idx))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((uid, object, extra, keys))
    })?;

    let mut records = Vec::new();
    let mut last = None;
    let mut n_results = 0usize;
    for row in rows {
        let (uid, object, extra, keys) = row?;
        n_results += 1;
        if fetch {
            records.push(SearchData {
                uid: uid.clone(),
                extra,
                content: SearchContent::Full(object),
            });
        }
        last = Some((uid, keys));
    }

    if n_results < count.unsigned_abs() as usize {
        state.clear(if reverse {
            CursorOrigin::Begin
        } else {
            CursorOrigin::End
        });
    } else if let Some((uid, keys)) = last {
        state.values = keys.into_iter().map(Some).collect();
        state.last_uid = Some(uid);
        state.position = CursorOrigin::Current;
    }

    Ok((
        StepOutcome {
            n_results,
            records: fetch.then_some(records),
        },
        state,
    ))
}
