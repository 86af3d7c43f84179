use crate::results::ResultRecorder;
use crate::scheduler::history::RunHistory;
use crate::scheduler::{Dispatcher, ScheduleRegistry};
use crate::storage::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub registry: ScheduleRegistry,
    pub recorder: ResultRecorder,
    pub history: RunHistory,
    pub dispatcher: Dispatcher,
}

impl AppState {
    pub fn new(pool: Pool, dispatcher: Dispatcher) -> Self {
        Self {
            registry: ScheduleRegistry::new(pool.clone()),
            recorder: ResultRecorder::new(pool.clone()),
            history: RunHistory::new(pool.clone()),
            pool,
            dispatcher,
        }
    }
}
