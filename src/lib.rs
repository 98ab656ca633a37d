//! Device availability monitor.
//!
//! A privileged daemon that watches the kernel's device namespace and
//! exposes device presence over a small stream protocol, while driving
//! `waits-for` dependencies in the service manager so services can
//! declaratively depend on hardware. The companion client connects,
//! waits for one device, signals readiness and blocks until the device
//! goes away.

pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod monitor;
pub mod paths;
pub mod proto;
pub mod server;
pub mod source;
pub mod sup;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;
