//! Periodic retention scheduler, driven by the daemon's timerfd
//! every 5 minutes.

use log::{debug, info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::store::Store;

/// Largest-entry eviction batch size; repeated until the store is back
/// under `size_cap_bytes`.
const EVICTION_BATCH: u32 = 10;

/// Run one retention pass: expire by age, shrink to the size cap, trim to
/// the entry-count limit, and optimize. Each step is independent; a failure
/// in one is logged and does not prevent the next from running. `served_id`,
/// when the engine is in the SERVING state, is never deleted by any step
/// (§8 testable property 7).
pub fn run(store: &mut Store, config: &Config, served_id: Option<i64>) -> Result<()> {
    expire_old_entries(store, config, served_id)?;

    let shrunk = shrink_to_size_cap(store, config, served_id)?;
    let trimmed = trim_to_entry_limit(store, config, served_id)?;

    if !shrunk && !trimmed {
        store.optimize()?;
    }

    Ok(())
}

fn expire_old_entries(store: &mut Store, config: &Config, served_id: Option<i64>) -> Result<()> {
    let removed = store.delete_old_entries(-(config.expire_days as i64), served_id)?;
    if removed > 0 {
        info!("retention: expired {removed} entries older than {} days", config.expire_days);
    }
    Ok(())
}

/// Repeatedly evict the largest-payload entries, 10 at a time, until the
/// database file is back under `size_cap_bytes`. Returns whether any
/// eviction happened (each eviction already VACUUMs).
fn shrink_to_size_cap(store: &mut Store, config: &Config, served_id: Option<i64>) -> Result<bool> {
    let mut evicted_any = false;
    loop {
        let size = store.get_size()?;
        if size <= config.size_cap_bytes {
            break;
        }
        debug!("retention: store at {size} bytes, over cap of {}", config.size_cap_bytes);
        let removed = store.delete_largest_entries(EVICTION_BATCH, served_id)?;
        if removed == 0 {
            warn!("retention: store over size cap but no entries left to evict");
            break;
        }
        evicted_any = true;
    }
    if evicted_any {
        info!("retention: shrank store to size cap of {} bytes", config.size_cap_bytes);
    }
    Ok(evicted_any)
}

/// Trim oldest-by-timestamp entries down to `max_entries`.
fn trim_to_entry_limit(store: &mut Store, config: &Config, served_id: Option<i64>) -> Result<bool> {
    let total = store.get_total_entries()?;
    if total as u64 <= config.max_entries {
        return Ok(false);
    }
    let overflow = total as u64 - config.max_entries;
    let removed = store.delete_last_entries(overflow as u32, served_id)?;
    if removed > 0 {
        info!("retention: trimmed {removed} oldest entries over the {}-entry limit", config.max_entries);
    }
    Ok(removed > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MimePayload;
    use crate::source::SourceBuffer;
    use bytes::Bytes;

    fn scratch_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("history.db")).unwrap();
        (dir, store)
    }

    fn insert_text(store: &mut Store, text: &str) -> i64 {
        let mut src = SourceBuffer::new();
        src.fill_from_payloads(vec![MimePayload::new(
            "UTF8_STRING",
            Bytes::copy_from_slice(text.as_bytes()),
        )]);
        store.insert_entry(&src).unwrap()
    }

    #[test]
    fn run_trims_entries_over_the_count_limit() {
        let (_dir, mut store) = scratch_store();
        for i in 0..5 {
            insert_text(&mut store, &format!("entry {i}"));
        }
        let mut config = Config::defaults();
        config.max_entries = 3;
        run(&mut store, &config, None).unwrap();
        assert_eq!(store.get_total_entries().unwrap(), 3);
    }

    #[test]
    fn run_is_a_no_op_under_every_limit() {
        let (_dir, mut store) = scratch_store();
        insert_text(&mut store, "only entry");
        let config = Config::defaults();
        run(&mut store, &config, None).unwrap();
        assert_eq!(store.get_total_entries().unwrap(), 1);
    }

    #[test]
    fn run_never_trims_the_served_entry() {
        let (_dir, mut store) = scratch_store();
        let oldest = insert_text(&mut store, "entry 0");
        for i in 1..5 {
            insert_text(&mut store, &format!("entry {i}"));
        }
        let mut config = Config::defaults();
        config.max_entries = 3;
        run(&mut store, &config, Some(oldest)).unwrap();
        // The count limit is honored for everything else, but the served
        // entry survives even though it's the oldest and would otherwise be
        // first in line for eviction.
        let remaining = store.get_latest_entries(10, 0).unwrap();
        assert!(remaining.contains(&oldest));
    }
}
