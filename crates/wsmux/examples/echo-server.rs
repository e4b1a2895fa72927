//! Echo server: accepts one multiplexed connection and echoes every channel.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- check /tmp/wsmux-echo-<pid>/echo.sock -n 4

use std::fs;

use wsmux::accept_physical_handshake;
use wsmux::engine::{EchoDispatcher, MuxConfig, MuxEngine, StandardValidator};
use wsmux::transport::UnixDomainSocket;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("wsmux-echo-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let sock_path = sock_dir.join("echo.sock");

    let listener = UnixDomainSocket::bind(&sock_path)?;
    eprintln!("Listening on {}", sock_path.display());

    let (mut receiver, mut sender) = listener.accept()?;
    let config = MuxConfig {
        initial_slots: 8,
        ..MuxConfig::default()
    };
    let validator = StandardValidator::new(config.handshake.clone());
    let request = accept_physical_handshake(&mut receiver, &mut sender, &validator)?;
    eprintln!("Peer connected: {} {}", request.method, request.path);

    MuxEngine::builder(EchoDispatcher)
        .with_config(config)
        .serve(receiver, sender, request)?;
    eprintln!("Peer disconnected");

    drop(listener);
    let _ = fs::remove_dir_all(&sock_dir);
    Ok(())
}
