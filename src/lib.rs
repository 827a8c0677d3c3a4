use std::sync::Arc;

use config::Config;
use governance::GovernanceService;

pub mod cache;
pub mod config;
pub mod error;
pub mod governance;
pub mod middleware;
pub mod router;
pub mod routes;
pub mod utils;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub governance: Arc<GovernanceService>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(config: Config, governance: Arc<GovernanceService>) -> Self {
        Self {
            config,
            governance,
            http: reqwest::Client::new(),
        }
    }
}
