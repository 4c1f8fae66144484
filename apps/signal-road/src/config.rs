use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Args;
use signal_core::RelayConfig;

#[derive(Debug, Clone, Args)]
pub struct ServerArgs {
    /// Address to bind the signaling listener to.
    #[arg(long, env = "SIGNAL_ROAD_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Maximum peers per session (2 for 1:1 calls).
    #[arg(long, env = "SIGNAL_ROAD_MEMBER_CAP", default_value_t = 2)]
    pub member_cap: usize,

    /// Sessions without any signaling traffic for this long are torn down.
    #[arg(long, env = "SIGNAL_ROAD_IDLE_EXPIRY_SECS", default_value_t = 600)]
    pub idle_expiry_secs: u64,

    /// How often idle sessions are swept.
    #[arg(long, env = "SIGNAL_ROAD_RECYCLE_INTERVAL_SECS", default_value_t = 60)]
    pub recycle_interval_secs: u64,

    /// Grace period applied during shutdown.
    #[arg(long, env = "SIGNAL_ROAD_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub relay: RelayConfig,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServerArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServerArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        ensure!(args.member_cap > 0, "member cap must be at least 1");
        ensure!(
            args.recycle_interval_secs > 0,
            "recycle interval must be greater than zero"
        );

        let relay = RelayConfig::default()
            .with_member_cap(args.member_cap)
            .with_idle_session_expiry(Duration::from_secs(args.idle_expiry_secs))
            .with_recycle_interval(Duration::from_secs(args.recycle_interval_secs));

        Ok(ServerConfig {
            listen_addr,
            relay,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
