//! HTTP shim in front of the scheduler

pub mod handlers;
pub mod state;

pub use handlers::{create_router, SchedulerResponse};
pub use state::{AppState, InFlight};
