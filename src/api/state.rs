use crate::storage::Store;
use crate::tracker::FlakinessTracker;

#[derive(Clone)]
pub struct AppState {
    pub tracker: FlakinessTracker<Store>,
}

impl AppState {
    pub fn new(tracker: FlakinessTracker<Store>) -> Self {
        Self { tracker }
    }
}
