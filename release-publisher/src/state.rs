use crate::config::PublisherConfig;

pub struct AppState {
    pub config: PublisherConfig,
}

impl AppState {
    pub fn new(config: PublisherConfig) -> Self {
        Self { config }
    }
}
