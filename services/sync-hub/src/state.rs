//! Shared application state handed to every axum handler.
//!
//! Grounded in the teacher's `AppState`, trimmed to the three long-lived
//! collaborators the sync handlers actually need: the pool, the Hub
//! (connection registry), and the fabric it dispatches from. `Config` is
//! `Copy`, so it's held by value rather than behind another `Arc`.

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::fabric::Fabric;
use crate::hub::Hub;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub hub: Arc<Hub>,
    pub fabric: Arc<dyn Fabric>,
    pub config: Config,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let fabric: Arc<dyn Fabric> = Arc::new(crate::fabric::InProcessFabric::new(1024));
        let hub = Arc::new(Hub::new(fabric.clone(), config.max_conns_per_user));
        Self { pool, hub, fabric, config }
    }
}
