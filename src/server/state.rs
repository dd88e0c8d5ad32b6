use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use uuid::Uuid;

use crate::submit::Scheduler;

/// A submission currently being processed
#[derive(Debug, Clone, Serialize)]
pub struct InFlight {
    pub pipeline_name: String,
    pub started_at: DateTime<Utc>,
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Scheduler,
    pub in_flight: Arc<DashMap<Uuid, InFlight>>,
}

impl AppState {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Register a submission under a fresh server-side id; it is removed
    /// again when the guard drops.
    pub fn track(&self, pipeline_name: &str) -> InFlightGuard {
        let id = Uuid::new_v4();
        self.in_flight.insert(
            id,
            InFlight {
                pipeline_name: pipeline_name.to_string(),
                started_at: Utc::now(),
            },
        );
        InFlightGuard {
            id,
            in_flight: self.in_flight.clone(),
        }
    }

    /// Get in-flight submission count
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

pub struct InFlightGuard {
    id: Uuid,
    in_flight: Arc<DashMap<Uuid, InFlight>>,
}

impl InFlightGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::engine::mock::MockEngine;
    use crate::storage::mock::MockStore;

    fn create_test_state() -> AppState {
        let scheduler = Scheduler::new(
            Settings::default(),
            Arc::new(MockStore::new()),
            Arc::new(MockEngine::new()),
        );
        AppState::new(scheduler)
    }

    #[test]
    fn test_submission_tracking() {
        let state = create_test_state();

        let guard = state.track("churn");
        assert_eq!(state.in_flight_count(), 1);
        assert_eq!(state.in_flight.get(&guard.id()).unwrap().pipeline_name, "churn");

        drop(guard);
        assert_eq!(state.in_flight_count(), 0);
    }

    #[test]
    fn test_each_submission_tracked_separately() {
        let state = create_test_state();

        let first = state.track("churn");
        let second = state.track("churn");
        assert_ne!(first.id(), second.id());
        assert_eq!(state.in_flight_count(), 2);

        drop(first);
        assert_eq!(state.in_flight_count(), 1);
        assert!(state.in_flight.contains_key(&second.id()));
    }
}
