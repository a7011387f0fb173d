mod config;
mod exec;
mod files;
#[cfg(feature = "transport-fs")]
mod fs_loop;
#[cfg(feature = "transport-net")]
mod net_server;

#[tokio::main]
async fn main() {
    eprintln!("guest agent v{} starting...", env!("CARGO_PKG_VERSION"));
    let cfg = config::read_config();
    eprintln!("agent_id = {}", cfg.agent_id);

    #[cfg(feature = "transport-net")]
    {
        let port: u16 = std::env::var("GUEST_AGENT_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8081);
        if let Err(e) = net_server::serve(cfg, port).await {
            eprintln!("guest agent server error: {e}");
            std::process::exit(1);
        }
    }

    #[cfg(all(feature = "transport-fs", not(feature = "transport-net")))]
    {
        if let Err(e) = fs_loop::run(cfg).await {
            eprintln!("guest agent loop error: {e}");
            std::process::exit(1);
        }
    }
}
