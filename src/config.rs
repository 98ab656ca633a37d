//! Environment-derived runtime configuration.
//!
//! The daemon has no config file; everything it needs arrives through the
//! environment of the supervising init process.

use std::fs::File;
use std::os::fd::RawFd;

use crate::paths;

/// Environment variable that forces dummy mode when set.
pub const DUMMY_VAR: &str = "DEVMON_DUMMY";
/// Environment variable container managers set for their payload.
pub const CONTAINER_VAR: &str = "container";
/// Environment variable carrying an already-open supervisor connection.
pub const SUPERVISOR_FD_VAR: &str = "DINIT_CS_FD";
/// Environment variable naming the anchor service.
pub const ANCHOR_VAR: &str = "DINIT_SYSTEM_SERVICE";

const DEFAULT_ANCHOR: &str = "system";

#[derive(Debug, Clone)]
pub struct Config {
    /// No kernel source: serve a permanently empty presence view.
    pub dummy: bool,
    /// Service every `device@` pseudo-service hangs off.
    pub anchor_service: String,
    /// Inherited supervisor connection, if the init handed one down.
    pub supervisor_fd: Option<RawFd>,
}

impl Config {
    pub fn from_env() -> Self {
        let dummy = detect_dummy(
            std::env::var_os(DUMMY_VAR).is_some(),
            std::env::var(CONTAINER_VAR).ok().as_deref(),
            File::open(paths::DUMMY_SENTINEL).is_ok(),
        );
        let anchor_service = match std::env::var(ANCHOR_VAR) {
            Ok(name) if !name.is_empty() => name,
            _ => DEFAULT_ANCHOR.to_string(),
        };
        let supervisor_fd = std::env::var(SUPERVISOR_FD_VAR)
            .ok()
            .and_then(|raw| raw.parse::<RawFd>().ok());
        Self {
            dummy,
            anchor_service,
            supervisor_fd,
        }
    }
}

fn detect_dummy(explicit: bool, container: Option<&str>, sentinel_readable: bool) -> bool {
    explicit || container == Some("1") || sentinel_readable
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dummy_off_by_default() {
        assert!(!detect_dummy(false, None, false));
    }

    #[test]
    fn dummy_forced_by_explicit_var() {
        assert!(detect_dummy(true, None, false));
    }

    #[test]
    fn dummy_implied_by_container() {
        assert!(detect_dummy(false, Some("1"), false));
        assert!(!detect_dummy(false, Some("lxc"), false));
    }

    #[test]
    fn dummy_implied_by_sentinel() {
        assert!(detect_dummy(false, None, true));
    }
}
