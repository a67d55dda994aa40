//! Key/value metadata kept next to the records: the descendant data
//! version, the global revision, the collation locale and free-form keys
//! owned by the backend.

use rusqlite::{params, Connection, OptionalExtension};
use time::macros::format_description;
use time::OffsetDateTime;

use crate::error::{CacheError, Result};

/// Layout version of the tables themselves, bumped on migrations.
pub(crate) const SCHEMA_VERSION: i64 = 1;

pub(crate) const SCHEMA_KEY: &str = "schema";
pub(crate) const VERSION_KEY: &str = "version";
pub(crate) const REVISION_KEY: &str = "revision";
pub(crate) const LOCALE_KEY: &str = "locale";

/// Internal keys and backend keys never share a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeySpace {
    Internal,
    User,
}

impl KeySpace {
    fn column_key(self, name: &str) -> String {
        match self {
            KeySpace::Internal => format!("internal.{}", name),
            KeySpace::User => format!("user.{}", name),
        }
    }
}

pub(crate) fn read(conn: &Connection, space: KeySpace, name: &str) -> Result<Option<String>> {
    let value = conn
        .query_row(
            "SELECT value FROM keys WHERE key = ?1",
            params![space.column_key(name)],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(value)
}

/// Store `value` under `name`; `None` deletes the key.
pub(crate) fn write(
    conn: &Connection,
    space: KeySpace,
    name: &str,
    value: Option<&str>,
) -> Result<()> {
    let key = space.column_key(name);
    match value {
        Some(value) => {
            conn.execute(
                "INSERT INTO keys (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
        }
        None => {
            conn.execute("DELETE FROM keys WHERE key = ?1", params![key])?;
        }
    }
    Ok(())
}

pub(crate) fn read_int(conn: &Connection, space: KeySpace, name: &str) -> Result<Option<i64>> {
    match read(conn, space, name)? {
        Some(raw) => raw.trim().parse::<i64>().map(Some).map_err(|_| {
            CacheError::InvalidArgument(format!("key “{}” holds non-integer “{}”", name, raw))
        }),
        None => Ok(None),
    }
}

/// Produces revision strings of the form `2024-05-01T10:20:30Z(3)`: UTC
/// seconds plus a counter that restarts every second.
#[derive(Debug, Default)]
pub(crate) struct RevisionClock {
    last_second: i64,
    counter: u32,
}

impl RevisionClock {
    /// Next revision, guaranteed to differ from `previous`.
    pub(crate) fn next(&mut self, previous: Option<&str>) -> Result<String> {
        let now = OffsetDateTime::now_utc();
        let second = now.unix_timestamp();
        if second == self.last_second {
            self.counter = self.counter.wrapping_add(1);
        } else {
            self.last_second = second;
            self.counter = 0;
        }

        let stamp = now
            .format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second]Z"
            ))
            .map_err(|e| CacheError::InvalidArgument(format!("cannot format revision: {}", e)))?;

        loop {
            let revision = format!("{}({})", stamp, self.counter);
            if previous != Some(revision.as_str()) {
                return Ok(revision);
            }
            self.counter = self.counter.wrapping_add(1);
        }
    }
}
