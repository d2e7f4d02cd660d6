//! The `dime` broker binary.

use std::net::{Ipv4Addr, SocketAddr};

use clap::Parser;
use tracing::{error, info};

use dime::{Endpoint, Server, ServerConfig};

/// DiME message broker: routes opaque variables between compute clients.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Listener endpoint, e.g. `tcp:127.0.0.1:5000` or `unix:/tmp/dime.sock`.
    /// May be given multiple times.
    #[arg(short = 'l', long = "listen")]
    listen: Vec<String>,

    /// Legacy transport selector; only `tcp` is valid, together with --port.
    #[arg(short = 'P', long = "protocol")]
    protocol: Option<String>,

    /// Legacy shorthand for `-l tcp:0.0.0.0:<port>`.
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,
}

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn resolve_endpoints(cli: &Cli) -> Result<Vec<Endpoint>, String> {
    let mut endpoints = Vec::new();

    for spec in &cli.listen {
        let ep = Endpoint::parse(spec).map_err(|e| e.to_string())?;
        endpoints.push(ep);
    }

    match (cli.protocol.as_deref(), cli.port) {
        (None, None) => {}
        (proto, Some(port)) => {
            if !matches!(proto, None | Some("tcp")) {
                return Err(format!(
                    "legacy -P only supports tcp, got '{}'",
                    proto.unwrap_or_default()
                ));
            }
            endpoints.push(Endpoint::Tcp(SocketAddr::from((
                Ipv4Addr::UNSPECIFIED,
                port,
            ))));
        }
        (Some(_), None) => {
            return Err("legacy -P requires -p <port>".to_string());
        }
    }

    if endpoints.is_empty() {
        endpoints.push(Endpoint::Tcp(SocketAddr::from((
            Ipv4Addr::LOCALHOST,
            5000,
        ))));
    }

    Ok(endpoints)
}

#[compio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let endpoints = match resolve_endpoints(&cli) {
        Ok(endpoints) => endpoints,
        Err(msg) => {
            error!("{msg}");
            std::process::exit(2);
        }
    };

    let mut server = Server::new(ServerConfig::default());
    for endpoint in &endpoints {
        if let Err(err) = server.bind(endpoint).await {
            error!(endpoint = %endpoint, error = %err, "cannot bind listener");
            std::process::exit(1);
        }
    }

    info!("dime broker ready");
    if let Err(err) = server.run().await {
        error!(error = %err, "broker exited with error");
        std::process::exit(1);
    }
}
