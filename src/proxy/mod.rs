//! The request-routing and per-backend decision engine.
//!
//! ```text
//! Listener -> accept loop -> work channel -> frontend worker
//!     -> (backend worker request channel) -> frontend worker
//!     -> synthesize reply | splice to upstream
//! ```
//!
//! Each backend worker owns its mutable state and is driven purely through
//! its channels; the routing table is an immutable snapshot swapped
//! atomically on reload.

pub mod answer;
pub mod backend;
pub mod conn;
pub mod frontend;
pub mod limiter;
pub mod listener;
pub mod proxy_protocol;
pub mod realip;
pub mod router;
pub mod state;
pub mod status_cache;

pub use answer::{BackendRequest, ProcessAnswer, ProxyEvent};
pub use backend::{BackendWorker, BackendWorkerUpdate};
pub use conn::{ConnectionCreator, UpstreamConnector};
pub use frontend::FrontendWorker;
pub use limiter::{AlwaysAllow, BotFilter, ConnectionLimiter};
pub use listener::ClientConn;
pub use realip::{HandshakeModifier, RealIpMode};
pub use router::{BackendHandle, BackendManager, ReloadSummary, RoutingTable};
pub use state::{ServerState, StateAgent};
pub use status_cache::StatusCache;
