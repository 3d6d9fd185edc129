//! Process-supervision demo: boots the kernel, which in turn spawns a
//! heartbeat child and an HTTP server child and restarts either if it dies.
//!
//! Re-execs itself as the supervised HTTP server via `--serve`, so the whole
//! demo is a single self-contained binary — no separate heartbeat/server
//! scripts to ship alongside it.

use std::sync::Arc;

use genesis_kernel::context::Context;
use genesis_kernel::kernel::{Kernel, KernelConfig};
use genesis_kernel::router::Router;
use genesis_kernel::{Response, Server, StatusCode};

const SERVE_FLAG: &str = "--serve";
const HEARTBEAT_FLAG: &str = "--heartbeat";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args();
    let _argv0 = args.next();
    match args.next().as_deref() {
        Some(SERVE_FLAG) => run_server().await,
        Some(HEARTBEAT_FLAG) => run_heartbeat().await,
        _ => run_kernel().await,
    }
}

/// The supervising process: owns no listener itself, just the process table.
async fn run_kernel() -> Result<(), Box<dyn std::error::Error>> {
    let exe = std::env::current_exe()?.to_string_lossy().to_string();
    let mut config = KernelConfig::from_env();
    config.server_script_path = exe.clone();
    config.server_argv = vec![SERVE_FLAG.to_string()];
    config.heartbeat_script_path = exe;
    config.heartbeat_argv = vec![HEARTBEAT_FLAG.to_string()];

    let kernel = Kernel::new(config);
    kernel.boot().await?;
    Ok(())
}

/// The supervised HTTP server child: a minimal router, bound on the kernel's
/// configured port, announcing readiness the same way any supervised server
/// would.
async fn run_server() -> Result<(), Box<dyn std::error::Error>> {
    let config = KernelConfig::from_env();
    let mut router = Router::new();
    router.get("/", |_ctx: Context| async { Response::new(StatusCode::Ok).body("supervised and running") });

    let server = Server::bind(format!("{}:{}", config.server_hostname, config.server_port)).await?;
    server.serve(Arc::new(router)).await?;
    Ok(())
}

/// The supervised heartbeat child: a trivial liveness ping on a timer.
async fn run_heartbeat() -> Result<(), Box<dyn std::error::Error>> {
    loop {
        println!("heartbeat: ping");
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
    }
}
