//! Router
//!
//! Switches between a working and a no-op [`RouteAgent`], remembering
//! every applied route so that routing can be disabled and re-enabled
//! into a (possibly different) table.

use super::{Route, RouteAgent, RouteError, RouteService};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Agent used while routing is disabled
pub struct NoopRouteAgent;

#[async_trait]
impl RouteAgent for NoopRouteAgent {
    async fn add(&self, _route: &Route) -> Result<(), RouteError> {
        Ok(())
    }

    async fn flush(&self) -> Result<(), RouteError> {
        Ok(())
    }
}

/// Stateful [`RouteService`] implementation
pub struct Router {
    working: Arc<dyn RouteAgent>,
    noop: Arc<dyn RouteAgent>,
    applied: Mutex<Vec<Route>>,
    enabled: AtomicBool,
}

impl Router {
    /// Create a new router
    pub fn new(working: Arc<dyn RouteAgent>, enabled: bool) -> Self {
        Self {
            working,
            noop: Arc::new(NoopRouteAgent),
            applied: Mutex::new(Vec::new()),
            enabled: AtomicBool::new(enabled),
        }
    }

    fn current(&self) -> &Arc<dyn RouteAgent> {
        if self.is_enabled() {
            &self.working
        } else {
            &self.noop
        }
    }

    /// Routes added since the last flush
    pub async fn applied(&self) -> Vec<Route> {
        self.applied.lock().await.clone()
    }
}

#[async_trait]
impl RouteService for Router {
    async fn add(&self, route: Route) -> Result<(), RouteError> {
        let mut applied = self.applied.lock().await;
        self.current().add(&route).await?;
        debug!(%route, "route added");
        applied.push(route);
        Ok(())
    }

    async fn flush(&self) -> Result<(), RouteError> {
        let mut applied = self.applied.lock().await;
        self.current().flush().await?;
        applied.clear();
        Ok(())
    }

    async fn enable(&self, table_id: u32) -> Result<(), RouteError> {
        let mut applied = self.applied.lock().await;
        if self.is_enabled() {
            return Ok(());
        }
        for route in applied.iter_mut() {
            if route.table_id != 0 {
                route.table_id = table_id;
            }
            self.working.add(route).await?;
        }
        self.enabled.store(true, Ordering::Release);
        Ok(())
    }

    async fn disable(&self) -> Result<(), RouteError> {
        let _applied = self.applied.lock().await;
        if !self.is_enabled() {
            return Ok(());
        }
        self.working.flush().await?;
        self.enabled.store(false, Ordering::Release);
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }
}
