//! Well-known filesystem locations.

/// Control socket the daemon listens on and clients connect to.
pub const SOCKET_PATH: &str = "/run/devmond.sock";

/// Sentinel file whose readability forces dummy mode (no kernel source).
pub const DUMMY_SENTINEL: &str = "/run/devmond.dummy";

/// Default control socket of the service manager.
pub const SUPERVISOR_SOCKET: &str = "/run/dinitctl";
