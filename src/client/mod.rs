//! Client side: transports, the polling controller and the lock poller.

pub mod api;
pub mod controller;
pub mod global_poller;

pub use api::{HttpApi, LocalApi, SeederApi};
pub use controller::{Controller, ControllerEvent, RESET_ALL_LOOP, RunOutcome};
pub use global_poller::{LockState, spawn_global_poller};
