use std::sync::Arc;

use crate::service::FlagService;

#[derive(Clone)]
pub struct AppState {
    pub flags: Arc<FlagService>,
    /// Which flag store backs the service, reported by `/health`.
    pub store: &'static str,
}

impl AppState {
    pub fn new(flags: FlagService, store: &'static str) -> Self {
        Self {
            flags: Arc::new(flags),
            store,
        }
    }
}
