//! Client-side view of a cursor: keeps the last known total and position,
//! checks the locale a client computed its alphabetic index against, and
//! applies live record changes without requerying.

use std::cmp::Ordering;

use tracing::warn;

use crate::cursor::{Cursor, CursorOrigin, SortKey, StepFlags, StepOutcome};
use crate::db::BookCache;
use crate::error::{CacheError, Result};
use crate::record::Record;

pub struct BookCursor<'a> {
    cache: &'a BookCache,
    cursor: Cursor,
    locale: String,
    total: i64,
    position: i64,
}

impl<'a> BookCursor<'a> {
    pub fn new(cache: &'a BookCache, sexp: Option<&str>, sort: &[SortKey]) -> Result<Self> {
        let cursor = cache.cursor_new(sexp, sort)?;
        let mut book_cursor = Self {
            cache,
            cursor,
            locale: cache.locale(),
            total: 0,
            position: 0,
        };
        book_cursor.recalculate()?;
        Ok(book_cursor)
    }

    /// Total as of the last step or recalculation.
    pub fn total(&self) -> i64 {
        self.total
    }

    /// Position as of the last step or recalculation.
    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn sexp(&self) -> Option<&str> {
        self.cursor.sexp()
    }

    pub fn sort_keys(&self) -> &[SortKey] {
        self.cursor.sort_keys()
    }

    /// Filter by a new expression and go back to BEGIN. On failure the
    /// cursor keeps both its old expression and its position.
    pub fn set_sexp(&mut self, sexp: Option<&str>) -> Result<()> {
        let mut next = self.cursor.clone();
        self.cache.cursor_set_sexp(&mut next, sexp)?;
        self.cache
            .cursor_step(&mut next, None, StepFlags::MOVE, CursorOrigin::Begin, 0)?;
        self.cursor = next;
        if let Err(err) = self.recalculate() {
            warn!("failed to recalculate cursor after setting the search expression: {}", err);
        }
        Ok(())
    }

    /// Step the cursor; see [`BookCache::cursor_step`].
    pub fn step(
        &mut self,
        revision_guard: Option<&str>,
        flags: StepFlags,
        origin: CursorOrigin,
        count: i32,
    ) -> Result<StepOutcome> {
        let outcome = self
            .cache
            .cursor_step(&mut self.cursor, revision_guard, flags, origin, count)?;
        if flags.contains(StepFlags::MOVE) {
            if let Err(err) = self.recalculate() {
                warn!("failed to recalculate cursor after step: {}", err);
            }
        }
        Ok(outcome)
    }

    /// Jump to bucket `index` of the alphabetic index of `locale`. Fails with
    /// `OutOfSync` when the cache has moved to another locale since the
    /// caller last loaded it.
    pub fn set_alphabetic_index(&mut self, index: usize, locale: &str) -> Result<()> {
        let active = self.cache.locale();
        if active != locale {
            return Err(CacheError::OutOfSync(format!(
                "alphabetic index requested for locale “{}” but the active locale is “{}”",
                locale, active
            )));
        }
        self.cache
            .cursor_set_target_alphabetic_index(&mut self.cursor, index)?;
        if let Err(err) = self.recalculate() {
            warn!("failed to recalculate cursor after setting the alphabetic index: {}", err);
        }
        Ok(())
    }

    /// `(total, position)` computed fresh from the cache.
    pub fn get_position(&mut self) -> Result<(i64, i64)> {
        self.recalculate()?;
        Ok((self.total, self.position))
    }

    pub fn recalculate(&mut self) -> Result<()> {
        let (total, position) = self.cache.cursor_calculate(&self.cursor)?;
        self.total = total;
        self.position = position;
        Ok(())
    }

    /// Compare `record` with the current position and report whether it
    /// matches the filter.
    pub fn compare_record(&self, record: &Record) -> (Ordering, bool) {
        self.cache.cursor_compare_record(&self.cursor, record)
    }

    /// Active locale of the cache. When it changed since the last call the
    /// cursor is reset to BEGIN.
    pub fn load_locale(&mut self) -> Result<String> {
        let locale = self.cache.locale();
        if locale != self.locale {
            self.locale = locale.clone();
            match self
                .cache
                .cursor_step(&mut self.cursor, None, StepFlags::MOVE, CursorOrigin::Begin, 0)
            {
                Ok(_) => {
                    if let Err(err) = self.recalculate() {
                        warn!("failed to recalculate cursor after locale change: {}", err);
                    }
                }
                Err(err) => warn!("failed to reset cursor after locale change: {}", err),
            }
        }
        Ok(locale)
    }

    /// Account for a record added to the cache after the last step.
    pub fn record_added(&mut self, record: &Record) {
        let (ordering, matches) = self.compare_record(record);
        if !matches {
            return;
        }
        self.total += 1;
        if ordering != Ordering::Greater {
            self.position += 1;
        }
    }

    /// Account for a record removed from the cache after the last step.
    pub fn record_removed(&mut self, record: &Record) {
        let (ordering, matches) = self.compare_record(record);
        if !matches {
            return;
        }
        self.total -= 1;
        if ordering != Ordering::Greater {
            self.position -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MetaFields;

    fn person(uid: &str, family: &str) -> Record {
        Record::new(uid, family).with_meta(MetaFields::new().with("family_name", family))
    }

    fn cache_with(names: &[(&str, &str)]) -> BookCache {
        let cache = BookCache::open_in_memory("en_US").unwrap();
        for (uid, family) in names {
            cache.put(&person(uid, family), false).unwrap();
        }
        cache
    }

    #[test]
    fn set_sexp_resets_to_begin() {
        let cache = cache_with(&[("u1", "Adams"), ("u2", "Brown"), ("u3", "Curtis")]);
        let sort = [SortKey::ascending("family_name")];
        let mut cursor = BookCursor::new(&cache, None, &sort).unwrap();
        cursor
            .step(None, StepFlags::MOVE, CursorOrigin::Begin, 2)
            .unwrap();
        assert_eq!((cursor.total(), cursor.position()), (3, 2));

        cursor.set_sexp(Some(r#"(is "family_name" "brown")"#)).unwrap();
        assert_eq!((cursor.total(), cursor.position()), (1, 0));

        assert!(cursor.set_sexp(Some("(is")).is_err());
        assert_eq!(cursor.sexp(), Some(r#"(is "family_name" "brown")"#));
    }

    #[test]
    fn alphabetic_index_requires_active_locale() {
        let cache = cache_with(&[("u1", "Adams"), ("u2", "Miller"), ("u3", "Zorn")]);
        let sort = [SortKey::ascending("family_name")];
        let mut cursor = BookCursor::new(&cache, None, &sort).unwrap();

        let err = cursor.set_alphabetic_index(12, "de_DE").unwrap_err();
        assert!(matches!(err, CacheError::OutOfSync(_)));

        let locale = cursor.load_locale().unwrap();
        cursor.set_alphabetic_index(12, &locale).unwrap();
        assert_eq!(cursor.position(), 1);

        let page = cursor
            .step(None, StepFlags::MOVE | StepFlags::FETCH, CursorOrigin::Current, 1)
            .unwrap();
        assert_eq!(page.records.unwrap()[0].uid, "u2");
    }

    #[test]
    fn locale_change_resets_position() {
        let cache = cache_with(&[("u1", "Adams"), ("u2", "Brown")]);
        let sort = [SortKey::ascending("family_name")];
        let mut cursor = BookCursor::new(&cache, None, &sort).unwrap();
        cursor
            .step(None, StepFlags::MOVE, CursorOrigin::Begin, 1)
            .unwrap();
        assert_eq!(cursor.position(), 1);

        assert_eq!(cursor.load_locale().unwrap(), "en_US");
        assert_eq!(cursor.position(), 1);

        cache.set_locale("sv_SE").unwrap();
        assert_eq!(cursor.load_locale().unwrap(), "sv_SE");
        assert_eq!(cursor.position(), 0);
    }

    #[test]
    fn live_updates_track_position() {
        let cache = cache_with(&[("u1", "Adams"), ("u3", "Curtis")]);
        let sort = [SortKey::ascending("family_name")];
        let mut cursor = BookCursor::new(&cache, None, &sort).unwrap();
        cursor
            .step(None, StepFlags::MOVE, CursorOrigin::Begin, 2)
            .unwrap();
        assert_eq!((cursor.total(), cursor.position()), (2, 2));

        let brown = person("u2", "Brown");
        cache.put(&brown, false).unwrap();
        cursor.record_added(&brown);
        assert_eq!((cursor.total(), cursor.position()), (3, 3));
        assert_eq!(cursor.get_position().unwrap(), (3, 3));

        let zorn = person("u4", "Zorn");
        cache.put(&zorn, false).unwrap();
        cursor.record_added(&zorn);
        assert_eq!(cursor.get_position().unwrap(), (4, 3));

        cache.remove("u2", false).unwrap();
        cursor.record_removed(&brown);
        assert_eq!((cursor.total(), cursor.position()), (3, 2));
        assert_eq!(cursor.get_position().unwrap(), (3, 2));
    }
}
