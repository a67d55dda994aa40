//! Cursor state kept by the cache.
//!
//! A cursor is a position in the result set of a search ordered by one or
//! more summary fields, with the uid as final tie-breaker. The position is
//! stored as the sort keys and uid of the last record visited, so moving
//! the cursor is a keyset query: "records after these values, ordered,
//! limited to N". Nothing is materialized between steps.

use std::cmp::Ordering;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use crate::collate::Collator;
use crate::error::{CacheError, Result};
use crate::query::Query;
use crate::record::Record;

/// Where a step starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorOrigin {
    Current,
    Begin,
    End,
}

bitflags::bitflags! {
    /// What a step does: move the cursor, fetch the records it passes, or both.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct StepFlags: u8 {
        const MOVE = 0b01;
        const FETCH = 0b10;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub direction: SortDirection,
}

impl SortKey {
    pub fn ascending(field: &str) -> Self {
        Self {
            field: field.to_ascii_lowercase(),
            direction: SortDirection::Ascending,
        }
    }

    pub fn descending(field: &str) -> Self {
        Self {
            field: field.to_ascii_lowercase(),
            direction: SortDirection::Descending,
        }
    }
}

/// Result of one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// Records traversed; less than the requested count when a sentinel was reached.
    pub n_results: usize,
    /// Traversed records in step order, present when FETCH was requested.
    pub records: Option<Vec<crate::record::SearchData>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CursorState {
    /// Sort keys of the current record, one per sort field. A cleared
    /// state has none; an alphabetic target sets only the first.
    pub(crate) values: Vec<Option<String>>,
    pub(crate) last_uid: Option<String>,
    pub(crate) position: CursorOrigin,
}

impl CursorState {
    fn cleared(n_fields: usize, position: CursorOrigin) -> Self {
        Self {
            values: vec![None; n_fields],
            last_uid: None,
            position,
        }
    }

    pub(crate) fn clear(&mut self, position: CursorOrigin) {
        self.values.iter_mut().for_each(|v| *v = None);
        self.last_uid = None;
        self.position = position;
    }

    pub(crate) fn is_clear(&self) -> bool {
        self.values.first().map_or(true, Option::is_none)
    }
}

fn key_expr(idx: usize) -> String {
    format!("COALESCE(k{}.sort_key, '')", idx)
}

fn valid_field(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

/// A cursor over the cache. Created with [`crate::BookCache::cursor_new`]
/// and driven through the `cursor_*` methods of the cache that made it.
#[derive(Debug, Clone)]
pub struct Cursor {
    sexp: Option<String>,
    query: Option<Query>,
    sort: Vec<SortKey>,
    pub(crate) state: CursorState,
}

impl Cursor {
    pub(crate) fn new(sexp: Option<&str>, sort: &[SortKey]) -> Result<Self> {
        if sort.is_empty() {
            return Err(CacheError::InvalidQuery(
                "at least one sort field must be specified".to_string(),
            ));
        }
        let sort: Vec<SortKey> = sort
            .iter()
            .map(|key| SortKey {
                field: key.field.trim().to_ascii_lowercase(),
                direction: key.direction,
            })
            .collect();
        if let Some(bad) = sort.iter().find(|key| !valid_field(&key.field)) {
            return Err(CacheError::InvalidQuery(format!(
                "cannot sort by field “{}”",
                bad.field
            )));
        }

        let mut cursor = Self {
            sexp: None,
            query: None,
            state: CursorState::cleared(sort.len(), CursorOrigin::Begin),
            sort,
        };
        cursor.set_sexp(sexp)?;
        Ok(cursor)
    }

    pub fn sexp(&self) -> Option<&str> {
        self.sexp.as_deref()
    }

    pub fn sort_keys(&self) -> &[SortKey] {
        &self.sort
    }

    /// Sentinel the cursor sits on, or `Current` when it points into the list.
    pub fn origin(&self) -> CursorOrigin {
        self.state.position
    }

    /// Replace the filter. The old one stays in place when `sexp` does not parse.
    pub(crate) fn set_sexp(&mut self, sexp: Option<&str>) -> Result<()> {
        let sexp = sexp.filter(|s| !s.trim().is_empty());
        let query = match sexp {
            Some(s) => Query::parse(s)?,
            None => None,
        };
        self.sexp = sexp.map(str::to_string);
        self.query = query;
        Ok(())
    }

    /// Point at the first record whose primary key sorts at or after `key`.
    pub(crate) fn set_partial(&mut self, key: String) {
        self.state.clear(CursorOrigin::Current);
        if let Some(first) = self.state.values.first_mut() {
            *first = Some(key);
        }
    }

    /// `LEFT JOIN`s exposing each sort field's first value as `k<N>`.
    pub(crate) fn joins_sql(&self, params: &mut Vec<Value>) -> String {
        let mut sql = String::new();
        for (idx, key) in self.sort.iter().enumerate() {
            sql.push_str(&format!(
                " LEFT JOIN summary k{idx} ON k{idx}.uid = o.uid AND k{idx}.field = ? AND k{idx}.seq = 0"
            ));
            params.push(Value::Text(key.field.clone()));
        }
        sql
    }

    /// Sort key columns, in sort order.
    pub(crate) fn keys_sql(&self) -> String {
        (0..self.sort.len())
            .map(key_expr)
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Visibility plus the search filter.
    pub(crate) fn filter_sql(&self, params: &mut Vec<Value>) -> String {
        let mut sql = format!(
            "o.state != {}",
            crate::record::OfflineState::LocallyDeleted.to_db()
        );
        if let Some(query) = &self.query {
            sql.push_str(&format!(" AND ({})", query.to_sql(params)));
        }
        sql
    }

    pub(crate) fn order_sql(&self, reverse: bool) -> String {
        let mut terms: Vec<String> = self
            .sort
            .iter()
            .enumerate()
            .map(|(idx, key)| {
                let ascending = (key.direction == SortDirection::Ascending) != reverse;
                format!("{} {}", key_expr(idx), if ascending { "ASC" } else { "DESC" })
            })
            .collect();
        terms.push(format!("o.uid {}", if reverse { "DESC" } else { "ASC" }));
        format!("ORDER BY {}", terms.join(", "))
    }

    /// Keyset constraint selecting the records after `state` (before it when
    /// `reverse`), or `None` for a cleared state.
    ///
    /// For `family_name ASC, given_name DESC` at ("jackson", "micheal", uid):
    ///
    /// ```text
    /// (k0 > 'jackson') OR
    /// (k0 = 'jackson' AND k1 < 'micheal') OR
    /// (k0 = 'jackson' AND k1 = 'micheal' AND uid > 'uid')
    /// ```
    ///
    /// A partially set state (alphabetic target) also admits records equal
    /// to its last set key when stepping forward.
    pub(crate) fn constraints_sql(
        &self,
        state: &CursorState,
        reverse: bool,
        include_current_uid: bool,
        params: &mut Vec<Value>,
    ) -> Option<String> {
        let n = self.sort.len();
        let mut clauses = Vec::new();

        for ii in 0..=n {
            let value_missing = if ii < n {
                state.values[ii].is_none()
            } else {
                state.last_uid.is_none()
            };
            if value_missing {
                break;
            }

            let mut parts = Vec::with_capacity(ii + 1);
            for jj in 0..ii {
                parts.push(format!("{} = ?", key_expr(jj)));
                params.push(Value::Text(state.values[jj].clone().unwrap_or_default()));
            }

            if ii == n {
                let uid = state.last_uid.clone().unwrap_or_default();
                let op = if reverse { "<" } else { ">" };
                if include_current_uid {
                    parts.push(format!("(o.uid {op} ? OR o.uid = ?)"));
                    params.push(Value::Text(uid.clone()));
                    params.push(Value::Text(uid));
                } else {
                    parts.push(format!("o.uid {op} ?"));
                    params.push(Value::Text(uid));
                }
            } else {
                let include_exact = !reverse
                    && if ii + 1 < n {
                        state.values[ii + 1].is_none()
                    } else {
                        state.last_uid.is_none()
                    };
                let ascending = self.sort[ii].direction == SortDirection::Ascending;
                let op = if ascending != reverse { ">" } else { "<" };
                let value = state.values[ii].clone().unwrap_or_default();
                let key = key_expr(ii);
                if include_exact {
                    parts.push(format!("({key} {op} ? OR {key} = ?)"));
                    params.push(Value::Text(value.clone()));
                    params.push(Value::Text(value));
                } else {
                    parts.push(format!("{key} {op} ?"));
                    params.push(Value::Text(value));
                }
            }

            clauses.push(format!("({})", parts.join(" AND ")));
        }

        if clauses.is_empty() {
            None
        } else {
            Some(clauses.join(" OR "))
        }
    }

    /// Where `record` falls relative to the current position, and whether
    /// it matches the filter. `Greater` means it sorts after the cursor.
    pub(crate) fn compare(&self, collator: &Collator, record: &Record) -> (Ordering, bool) {
        let matches = self
            .query
            .as_ref()
            .map_or(true, |q| q.matches(&record.uid, &record.meta));

        let mut ordering = Ordering::Equal;
        for (idx, key) in self.sort.iter().enumerate() {
            let Some(cursor_key) = self.state.values[idx].as_deref() else {
                // An unset value sorts below every record.
                ordering = Ordering::Greater;
                break;
            };
            let record_key = record
                .meta
                .first(&key.field)
                .map(|v| collator.generate_key(v))
                .unwrap_or_default();
            ordering = record_key.as_str().cmp(cursor_key);
            if key.direction == SortDirection::Descending {
                ordering = ordering.reverse();
            }
            if ordering != Ordering::Equal {
                break;
            }
        }

        if ordering == Ordering::Equal {
            ordering = match self.state.last_uid.as_deref() {
                None => Ordering::Greater,
                Some(last) => record.uid.as_str().cmp(last),
            };
        }
        (ordering, matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MetaFields;

    fn cursor() -> Cursor {
        Cursor::new(
            None,
            &[SortKey::ascending("family_name"), SortKey::descending("given_name")],
        )
        .unwrap()
    }

    #[test]
    fn rejects_bad_sort_specs() {
        assert!(matches!(
            Cursor::new(None, &[]),
            Err(CacheError::InvalidQuery(_))
        ));
        assert!(matches!(
            Cursor::new(None, &[SortKey::ascending("name; drop table")]),
            Err(CacheError::InvalidQuery(_))
        ));
    }

    #[test]
    fn failed_sexp_keeps_previous() {
        let mut c = cursor();
        c.set_sexp(Some(r#"(is "family_name" "brown")"#)).unwrap();
        assert!(c.set_sexp(Some("(is")).is_err());
        assert_eq!(c.sexp(), Some(r#"(is "family_name" "brown")"#));
        c.set_sexp(Some("  ")).unwrap();
        assert_eq!(c.sexp(), None);
    }

    #[test]
    fn cleared_state_has_no_constraints() {
        let c = cursor();
        let mut params = Vec::new();
        assert!(c.constraints_sql(&c.state, false, false, &mut params).is_none());
        assert!(params.is_empty());
    }

    #[test]
    fn full_state_builds_keyset_chain() {
        let mut c = cursor();
        c.state.values = vec![Some("J".into()), Some("M".into())];
        c.state.last_uid = Some("u7".into());
        c.state.position = CursorOrigin::Current;

        let mut params = Vec::new();
        let sql = c.constraints_sql(&c.state, false, false, &mut params).unwrap();
        assert_eq!(
            sql,
            "(COALESCE(k0.sort_key, '') > ?) OR \
             (COALESCE(k0.sort_key, '') = ? AND COALESCE(k1.sort_key, '') < ?) OR \
             (COALESCE(k0.sort_key, '') = ? AND COALESCE(k1.sort_key, '') = ? AND o.uid > ?)"
        );
        assert_eq!(params.len(), 6);
        assert_eq!(params[5], Value::Text("u7".into()));

        let mut params = Vec::new();
        let sql = c.constraints_sql(&c.state, true, true, &mut params).unwrap();
        assert!(sql.starts_with("(COALESCE(k0.sort_key, '') < ?)"));
        assert!(sql.ends_with("(o.uid < ? OR o.uid = ?))"));
    }

    #[test]
    fn partial_state_includes_exact_match_forward_only() {
        let mut c = cursor();
        c.set_partial("100C".into());

        let mut params = Vec::new();
        let forward = c.constraints_sql(&c.state, false, false, &mut params).unwrap();
        assert_eq!(
            forward,
            "((COALESCE(k0.sort_key, '') > ? OR COALESCE(k0.sort_key, '') = ?))"
        );

        let mut params = Vec::new();
        let backward = c.constraints_sql(&c.state, true, false, &mut params).unwrap();
        assert_eq!(backward, "(COALESCE(k0.sort_key, '') < ?)");
    }

    #[test]
    fn order_flips_when_reversed() {
        let c = cursor();
        assert_eq!(
            c.order_sql(false),
            "ORDER BY COALESCE(k0.sort_key, '') ASC, COALESCE(k1.sort_key, '') DESC, o.uid ASC"
        );
        assert_eq!(
            c.order_sql(true),
            "ORDER BY COALESCE(k0.sort_key, '') DESC, COALESCE(k1.sort_key, '') ASC, o.uid DESC"
        );
    }

    #[test]
    fn compare_against_position() {
        let collator = Collator::new("en_US").unwrap();
        let mut c = Cursor::new(
            Some(r#"(beginswith "family_name" "b")"#),
            &[SortKey::ascending("family_name")],
        )
        .unwrap();

        let brown = Record::new("u2", "")
            .with_meta(MetaFields::new().with("family_name", "Brown"));
        let adams = Record::new("u1", "")
            .with_meta(MetaFields::new().with("family_name", "Adams"));

        // At BEGIN everything sorts after the cursor.
        assert_eq!(c.compare(&collator, &adams), (Ordering::Greater, false));

        c.state.values = vec![Some(collator.generate_key("Brown"))];
        c.state.last_uid = Some("u2".into());
        c.state.position = CursorOrigin::Current;
        assert_eq!(c.compare(&collator, &brown), (Ordering::Equal, true));
        assert_eq!(c.compare(&collator, &adams).0, Ordering::Less);
    }

    #[test]
    fn step_flags_combine() {
        let both = StepFlags::MOVE | StepFlags::FETCH;
        assert!(both.contains(StepFlags::MOVE));
        assert!(both.contains(StepFlags::FETCH));
        assert!(!StepFlags::MOVE.contains(StepFlags::FETCH));
        assert!(!StepFlags::empty().contains(StepFlags::MOVE));
        assert_eq!(StepFlags::default(), StepFlags::empty());
    }
}
