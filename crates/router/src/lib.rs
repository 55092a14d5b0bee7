//! Path/method dispatch for PAGI applications.
//!
//! A [`Router`] is a registration-time builder: routes, groups, mounts and
//! named routes are declared on it, then [`Router::to_app`] freezes the
//! tables into a [`RouterApp`] (itself a PAGI application) with every
//! route's middleware chain pre-composed so dispatch is a direct call.

mod dispatch;
mod middleware;
mod pattern;
mod route;
mod router;

pub use dispatch::RouterApp;
pub use middleware::compose;
pub use pattern::{Pattern, PatternError};
pub use route::{MethodSpec, Route};
pub use router::{Router, RouterError, TrailingSlash};
