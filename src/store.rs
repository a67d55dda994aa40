//! The seam backends program against.
//!
//! Backends hold a `&dyn RecordStore` (or a generic `S: RecordStore`) so a
//! store can be swapped without touching sync code. [`BookCache`] is the
//! SQLite implementation.

use crate::db::BookCache;
use crate::error::Result;
use crate::record::{OfflineChange, OfflineState, Record, SearchData, StoredRecord};

pub trait RecordStore {
    fn put(&self, record: &Record, offline: bool) -> Result<()>;

    fn put_many(&self, records: &[Record], offline: bool) -> Result<()> {
        records.iter().try_for_each(|record| self.put(record, offline))
    }

    fn remove(&self, uid: &str, offline: bool) -> Result<()>;

    fn get(&self, uid: &str, include_deleted: bool) -> Result<StoredRecord>;

    fn get_extra(&self, uid: &str) -> Result<Option<String>>;

    fn set_extra(&self, uid: &str, extra: Option<&str>) -> Result<()>;

    fn get_offline_state(&self, uid: &str) -> Result<OfflineState>;

    fn set_offline_state(&self, uid: &str, state: OfflineState) -> Result<()>;

    fn count(&self, include_deleted: bool) -> Result<usize>;

    fn contains(&self, uid: &str, include_deleted: bool) -> Result<bool>;

    fn get_offline_changes(&self) -> Result<Vec<OfflineChange>>;

    fn search(&self, sexp: Option<&str>, meta_only: bool) -> Result<Vec<SearchData>>;

    fn search_uids(&self, sexp: Option<&str>) -> Result<Vec<String>>;

    fn revision(&self) -> Result<String>;
}

impl RecordStore for BookCache {
    fn put(&self, record: &Record, offline: bool) -> Result<()> {
        BookCache::put(self, record, offline)
    }

    fn put_many(&self, records: &[Record], offline: bool) -> Result<()> {
        BookCache::put_many(self, records, offline)
    }

    fn remove(&self, uid: &str, offline: bool) -> Result<()> {
        BookCache::remove(self, uid, offline)
    }

    fn get(&self, uid: &str, include_deleted: bool) -> Result<StoredRecord> {
        BookCache::get(self, uid, include_deleted)
    }

    fn get_extra(&self, uid: &str) -> Result<Option<String>> {
        BookCache::get_extra(self, uid)
    }

    fn set_extra(&self, uid: &str, extra: Option<&str>) -> Result<()> {
        BookCache::set_extra(self, uid, extra)
    }

    fn get_offline_state(&self, uid: &str) -> Result<OfflineState> {
        BookCache::get_offline_state(self, uid)
    }

    fn set_offline_state(&self, uid: &str, state: OfflineState) -> Result<()> {
        BookCache::set_offline_state(self, uid, state)
    }

    fn count(&self, include_deleted: bool) -> Result<usize> {
        BookCache::count(self, include_deleted)
    }

    fn contains(&self, uid: &str, include_deleted: bool) -> Result<bool> {
        BookCache::contains(self, uid, include_deleted)
    }

    fn get_offline_changes(&self) -> Result<Vec<OfflineChange>> {
        BookCache::get_offline_changes(self)
    }

    fn search(&self, sexp: Option<&str>, meta_only: bool) -> Result<Vec<SearchData>> {
        BookCache::search(self, sexp, meta_only)
    }

    fn search_uids(&self, sexp: Option<&str>) -> Result<Vec<String>> {
        BookCache::search_uids(self, sexp)
    }

    fn revision(&self) -> Result<String> {
        BookCache::revision(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MetaFields;

    fn sync_upload(store: &dyn RecordStore) -> Result<Vec<String>> {
        Ok(store
            .get_offline_changes()?
            .into_iter()
            .map(|change| format!("{}:{}", change.state, change.uid))
            .collect())
    }

    #[test]
    fn usable_as_trait_object() {
        let cache = BookCache::open_in_memory("en_US").unwrap();
        let store: &dyn RecordStore = &cache;
        store
            .put(
                &Record::new("u1", "body").with_meta(MetaFields::new().with("full_name", "Ann")),
                true,
            )
            .unwrap();
        store.put(&Record::new("u2", "body"), false).unwrap();
        store.remove("u2", true).unwrap();

        assert_eq!(
            sync_upload(store).unwrap(),
            ["locally-created:u1", "locally-deleted:u2"]
        );
        assert_eq!(store.count(false).unwrap(), 1);
        assert_eq!(store.search_uids(None).unwrap(), ["u1"]);
    }
}
