//! The one place allowed to read the wall clock. Both `REG` timestamps and
//! cleanup-loop comparisons go through here so the determinism boundary
//! (command payload vs. FSM apply) stays obvious at a glance.

/// Current wall-clock time in Unix milliseconds.
pub fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
