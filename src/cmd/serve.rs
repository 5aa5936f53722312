//! HTTP service command: `patchgate serve`.

use anyhow::Result;

use patchgate::config::Config;

pub async fn cmd_serve(mut config: Config, port: Option<u16>, host: Option<String>) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }
    patchgate::server::start_server(&config).await
}
