use std::time::Duration;

pub(crate) fn duration_now() -> Duration {
    use std::time::SystemTime;
    let now = SystemTime::now();
    now.duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_else(|e| {
            panic!("Current time {now:?} is before unix epoch. Something is wrong: {e:?}")
        })
}

/// Unix timestamp in milliseconds, the `created`/`updated` representation
/// used across all persisted entities.
pub(crate) fn now_millis() -> u64 {
    duration_now().as_millis() as u64
}
