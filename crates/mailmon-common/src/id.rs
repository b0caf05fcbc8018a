//! Snowflake ids for rule, channel and alert event records.

use snowflake::SnowflakeIdBucket;
use std::ops::RangeInclusive;
use std::sync::{Mutex, MutexGuard};

const WORKER_BITS: RangeInclusive<i32> = 0..=31;

static BUCKET: Mutex<Option<SnowflakeIdBucket>> = Mutex::new(None);

fn bucket() -> MutexGuard<'static, Option<SnowflakeIdBucket>> {
    BUCKET.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Sets the worker identity used by [`next_id`]. Both parts must fit in
/// five bits. Calling it again replaces the generator.
pub fn init(machine_id: i32, node_id: i32) -> Result<(), String> {
    for (label, value) in [("machine_id", machine_id), ("node_id", node_id)] {
        if !WORKER_BITS.contains(&value) {
            return Err(format!("{label} must be within 0..=31, got {value}"));
        }
    }
    *bucket() = Some(SnowflakeIdBucket::new(machine_id, node_id));
    Ok(())
}

/// Next id as a decimal string. Falls back to worker (1, 1) when
/// [`init`] was never called.
pub fn next_id() -> String {
    bucket()
        .get_or_insert_with(|| SnowflakeIdBucket::new(1, 1))
        .get_id()
        .to_string()
}
