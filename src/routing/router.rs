//! Route lookup.
//!
//! # Design Decisions
//! - Immutable after construction (shared via Arc, swapped on reload)
//! - O(n) ordered scan; route counts are small
//! - Explicit `None` on no match; the caller falls through to the next handler

use std::sync::Arc;

use crate::config::RouteConfig;
use crate::proxy::route::{NormalizedRoute, RouteError};

/// Ordered set of normalized routes.
#[derive(Debug, Default, Clone)]
pub struct RouteTable {
    routes: Vec<Arc<NormalizedRoute>>,
}

impl RouteTable {
    pub fn new(routes: Vec<Arc<NormalizedRoute>>) -> Self {
        Self { routes }
    }

    /// Normalize every configured route, failing on the first bad one.
    pub fn from_config(routes: &[RouteConfig]) -> Result<Self, RouteError> {
        let routes = routes
            .iter()
            .map(|config| NormalizedRoute::from_config(config).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { routes })
    }

    /// First route whose pattern matches `path`.
    pub fn match_path(&self, path: &str) -> Option<Arc<NormalizedRoute>> {
        self.routes.iter().find(|route| route.matches(path)).cloned()
    }

    pub fn routes(&self) -> &[Arc<NormalizedRoute>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
