//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (path)
//!     → router.rs (ordered scan of the route table)
//!     → matcher.rs (prefix or regex test)
//!     → Return: matched Arc<NormalizedRoute> or None (next handler)
//!
//! Route Compilation (at startup and on reload):
//!     RouteConfig[]
//!     → NormalizedRoute::from_config (pattern, target, rewrites resolved)
//!     → Freeze as immutable RouteTable
//! ```
//!
//! # Design Decisions
//! - Routes compiled once, immutable at runtime; reload swaps the table
//! - Deterministic: first match in registration order wins
//! - Regex only when the pattern asks for it (leading `^`)

pub mod matcher;
pub mod router;

pub use matcher::RoutePattern;
pub use router::RouteTable;
