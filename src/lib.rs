//! # genesis-kernel
//!
//! A process-supervision kernel with an HTTP/1.1 middleware framework
//! embedded in it, written from scratch.
//!
//! The kernel boots a heartbeat process and an HTTP server process, restarts
//! either on unexpected exit, and recovers from port collisions by demoting
//! to an external monitor. The HTTP server itself runs a composable
//! middleware pipeline — error handling, logging, security headers,
//! performance sampling — in front of a router.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use genesis_kernel::server::Server;
//! use genesis_kernel::http::{Request, Response, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.run(|_req: Request| async {
//!         Response::new(StatusCode::Ok).body("Hello, World!")
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod body;
pub mod context;
pub mod error;
pub mod http;
pub mod kernel;
pub mod logging;
pub mod middleware;
pub mod perf;
pub mod router;
pub mod security;
pub mod server;
pub mod static_files;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use kernel::{Kernel, KernelConfig};
pub use server::{Server, ServerError};

/// Aggregates the crate's subsystem error types into one `Result` alias for
/// callers that don't need to match on a specific subsystem — a supervised
/// `main()` with no CLI layer of its own, for instance.
#[derive(Debug, thiserror::Error)]
pub enum GenesisError {
    #[error(transparent)]
    Server(#[from] server::ServerError),
    #[error(transparent)]
    Kernel(#[from] kernel::KernelError),
}
