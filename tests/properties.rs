use std::collections::BTreeMap;

use bookcache::{
    BookCache, BookCursor, CacheError, CursorOrigin, MetaFields, OfflineState, Record, SortKey,
    StepFlags,
};
use proptest::prelude::*;

fn person(uid: &str, family: &str) -> Record {
    Record::new(uid, family).with_meta(MetaFields::new().with("family_name", family))
}

/// Walk the whole list in pages of `page` records.
fn walk(cursor: &mut BookCursor<'_>, page: i32) -> Vec<String> {
    let mut seen = Vec::new();
    loop {
        match cursor.step(
            None,
            StepFlags::MOVE | StepFlags::FETCH,
            CursorOrigin::Current,
            page,
        ) {
            Ok(outcome) => {
                let records = outcome.records.unwrap_or_default();
                let short = records.len() < page.unsigned_abs() as usize;
                seen.extend(records.into_iter().map(|d| d.uid));
                if short {
                    break;
                }
            }
            Err(CacheError::OutOfList(_)) => break,
            Err(other) => panic!("unexpected error {other}"),
        }
    }
    seen
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn cursor_walk_matches_sorted_search(
        names in prop::collection::vec("[A-Ca-c]{0,3}", 0..20),
        page in 1i32..5,
    ) {
        let cache = BookCache::open_in_memory("en_US").unwrap();
        let records: Vec<Record> = names
            .iter()
            .enumerate()
            .map(|(idx, name)| person(&format!("uid{idx:03}"), name))
            .collect();
        cache.put_many(&records, false).unwrap();

        let collator = cache.collator();
        let mut expected: Vec<(String, String)> = records
            .iter()
            .map(|r| (collator.generate_key(r.meta.first("family_name").unwrap_or_default()), r.uid.clone()))
            .collect();
        expected.sort();
        let expected: Vec<String> = expected.into_iter().map(|(_, uid)| uid).collect();

        let sort = [SortKey::ascending("family_name")];
        let mut cursor = BookCursor::new(&cache, None, &sort).unwrap();
        prop_assert_eq!(cursor.total() as usize, cache.search_uids(None).unwrap().len());

        let forward = walk(&mut cursor, page);
        prop_assert_eq!(&forward, &expected);

        let mut backward = walk(&mut cursor, -page);
        backward.reverse();
        prop_assert_eq!(&backward, &expected);
    }

    #[test]
    fn ledger_follows_last_local_change(
        ops in prop::collection::vec((0u8..5, 0usize..4), 1..40),
    ) {
        let cache = BookCache::open_in_memory("en_US").unwrap();
        let mut model: BTreeMap<String, OfflineState> = BTreeMap::new();

        for (op, idx) in ops {
            let uid = format!("u{idx}");
            match op {
                0 => {
                    cache.put(&person(&uid, "Online"), false).unwrap();
                    model.insert(uid, OfflineState::Synced);
                }
                1 => {
                    cache.put(&person(&uid, "Offline"), true).unwrap();
                    let next = match model.get(&uid) {
                        None | Some(OfflineState::LocallyCreated) => OfflineState::LocallyCreated,
                        Some(_) => OfflineState::LocallyModified,
                    };
                    model.insert(uid, next);
                }
                2 => {
                    let result = cache.remove(&uid, true);
                    match model.get(&uid).copied() {
                        None => prop_assert!(result.unwrap_err().is_not_found()),
                        Some(OfflineState::LocallyCreated) => {
                            result.unwrap();
                            model.remove(&uid);
                        }
                        Some(_) => {
                            result.unwrap();
                            model.insert(uid, OfflineState::LocallyDeleted);
                        }
                    }
                }
                3 => {
                    let result = cache.remove(&uid, false);
                    if model.remove(&uid).is_some() {
                        result.unwrap();
                    } else {
                        prop_assert!(result.unwrap_err().is_not_found());
                    }
                }
                _ => {
                    let result = cache.set_offline_state(&uid, OfflineState::Synced);
                    if let Some(state) = model.get_mut(&uid) {
                        result.unwrap();
                        *state = OfflineState::Synced;
                    } else {
                        prop_assert!(result.unwrap_err().is_not_found());
                    }
                }
            }
        }

        let ledger: Vec<(String, OfflineState)> = cache
            .get_offline_changes()
            .unwrap()
            .into_iter()
            .map(|change| (change.uid, change.state))
            .collect();
        let expected: Vec<(String, OfflineState)> = model
            .into_iter()
            .filter(|(_, state)| *state != OfflineState::Synced)
            .collect();
        prop_assert_eq!(ledger, expected);
    }
}
