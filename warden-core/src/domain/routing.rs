//! Per-application routing state that is swapped wholesale on re-registration.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::domain::backend::Backend;
use crate::load_balancer::Balancer;
use crate::router::Router;

/// Handler bound to every proxied route: the pattern it was registered with.
pub type RouteName = Arc<str>;

/// The router and balancer of one application, replaced together.
#[derive(Debug, Default)]
pub struct AppRoutes {
    /// Method and path routing.
    pub router: Router<RouteName>,
    /// Backend selection.
    pub balancer: Balancer,
}

impl AppRoutes {
    /// Bundles a router with a balancer over `backends`.
    pub fn new(router: Router<RouteName>, backends: Vec<Backend>) -> Self {
        Self {
            router,
            balancer: Balancer::new(backends),
        }
    }
}

/// A lock-free holder for an application's routes.
///
/// Uses `ArcSwap` so registration can atomically replace the router and balancer
/// while request paths keep reading the previous generation without locks.
#[derive(Debug, Default)]
pub struct RoutingTable {
    routes: ArcSwap<AppRoutes>,
}

impl RoutingTable {
    /// Atomically replace the router and balancer.
    pub fn update(&self, routes: AppRoutes) {
        self.routes.store(Arc::new(routes));
    }

    /// The current generation of routes.
    pub fn snapshot(&self) -> Arc<AppRoutes> {
        self.routes.load_full()
    }
}
