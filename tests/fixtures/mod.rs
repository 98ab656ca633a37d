pub mod events;
pub mod fake_sup;
pub mod rig;
