use std::time::Duration;

use clap::Parser;
use http_proxy_utils::server::{ProxyOpts, ProxyServer};
use n0_error::Result;

/// HTTP/1.1 forward proxy with CONNECT tunneling and upstream keep-alive.
#[derive(Parser)]
struct Cli {
    /// Address to listen on.
    #[clap(short, long, default_value = "127.0.0.1:8080")]
    listen: String,
    /// Upstream connect timeout in seconds.
    #[clap(long, default_value_t = 5)]
    connect_timeout: u64,
    /// Seconds without tunnel traffic before the idle check fires.
    #[clap(long, default_value_t = 30)]
    tunnel_idle_timeout: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let cli = Cli::parse();

    let mut opts = ProxyOpts::default();
    opts.dial.connect_timeout = Duration::from_secs(cli.connect_timeout);
    opts.forward.tunnel_idle_timeout = Duration::from_secs(cli.tunnel_idle_timeout);

    let server = ProxyServer::bind(&cli.listen, opts).await?;
    println!("proxy listening on {}", server.local_addr()?);
    tokio::select! {
        res = server.run() => res?,
        _ = tokio::signal::ctrl_c() => {}
    }
    Ok(())
}
