//! Authorized, cached and realtime data access for role-based inventory
//! services.
//!
//! Domain services hold one [`DataAccess`] per session. Every call is checked
//! against the actor's role before it touches a cache or the remote store.

pub mod auth;
pub mod cache;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod facade;
pub mod logging;
pub mod model;
pub mod remote;
pub mod subscription;

pub use auth::{AuthorizationEvaluator, PolicyStore};
pub use cache::{CacheSource, Fetched, ReadPolicy, Record, TtlCache};
pub use connectivity::{ConnectivityMonitor, ConnectivityState};
pub use error::{DataError, DataResult, DecodeError, RemoteError};
pub use facade::{DataAccess, DataAccessBuilder};
pub use model::{ActionKind, Actor, EntityKind, Policy, Role, RoleKind};
pub use remote::{Document, Filter, ListQuery, RemoteStore};
pub use subscription::SubscriptionRegistry;
