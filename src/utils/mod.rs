use std::time::Duration;

use git_version::git_version;
use smithay::reexports::rustix::time::{clock_gettime, ClockId};

pub mod clock;
pub mod id;
pub mod watcher;

pub fn version() -> String {
    if let Some(v) = option_env!("TVSYNC_BUILD_VERSION_STRING") {
        return String::from(v);
    }

    const MAJOR: &str = env!("CARGO_PKG_VERSION_MAJOR");
    const MINOR: &str = env!("CARGO_PKG_VERSION_MINOR");
    const PATCH: &str = env!("CARGO_PKG_VERSION_PATCH");

    let commit =
        option_env!("TVSYNC_BUILD_COMMIT").unwrap_or(git_version!(fallback = "unknown commit"));

    format!("{MAJOR}.{MINOR}.{PATCH} ({commit})")
}

pub fn get_monotonic_time() -> Duration {
    let ts = clock_gettime(ClockId::Monotonic);
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Whole milliseconds in `duration`, saturating at `u32::MAX`.
pub fn whole_millis(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whole_millis_truncates_and_saturates() {
        assert_eq!(whole_millis(Duration::from_micros(16_999)), 16);
        assert_eq!(whole_millis(Duration::ZERO), 0);
        assert_eq!(whole_millis(Duration::from_secs(u64::MAX / 2)), u32::MAX);
    }
}
