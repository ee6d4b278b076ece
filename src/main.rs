//! duproxy binary: parse arguments, assemble the proxy, run the server.

use clap::Parser;
use duproxy::{AccessLog, Duproxy};
use http::Uri;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// A duplicating reverse proxy: forwards every request to the primary
/// upstream and mirrors it to the secondaries; only the primary's
/// response is returned to the client.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Listen address; a bare `:port` binds all interfaces
    #[arg(long, default_value = ":8080", value_parser = parse_listen)]
    listen: SocketAddr,

    /// Wait this long for in-flight requests on shutdown
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    graceful_timeout: Duration,

    /// Access log path; `-` means standard output
    #[arg(long, default_value = "-")]
    access_log: String,

    /// Primary upstream URL; its response is returned to clients
    #[arg(value_name = "PRIMARY", value_parser = parse_target)]
    primary: Uri,

    /// Secondary upstream URLs; they receive shadow traffic and their
    /// responses are discarded
    #[arg(value_name = "SECONDARY", value_parser = parse_target)]
    secondaries: Vec<Uri>,
}

fn parse_listen(value: &str) -> Result<SocketAddr, String> {
    let candidate = if value.starts_with(':') {
        format!("0.0.0.0{value}")
    } else {
        value.to_owned()
    };
    candidate
        .parse()
        .map_err(|_| format!("invalid listen address: {value}"))
}

fn parse_target(value: &str) -> Result<Uri, String> {
    let uri: Uri = value
        .parse()
        .map_err(|_| format!("invalid upstream URL: {value}"))?;
    if uri.scheme_str() != Some("http") {
        return Err(format!("upstream URL must be absolute http://: {value}"));
    }
    if uri.authority().is_none() {
        return Err(format!("upstream URL is missing a host: {value}"));
    }
    Ok(uri)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let access_log = match AccessLog::open(&args.access_log) {
        Ok(log) => Arc::new(log),
        Err(err) => {
            error!(path = %args.access_log, error = %err, "failed to open access log");
            std::process::exit(1);
        }
    };
    access_log.watch_hangup();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        primary = %args.primary,
        secondaries = args.secondaries.len(),
        "duproxy starting"
    );

    let proxy = Arc::new(Duproxy::new(args.primary, args.secondaries));
    if let Err(err) =
        duproxy::server::run(proxy, access_log, args.listen, args.graceful_timeout).await
    {
        error!(error = %err, "server error");
        std::process::exit(1);
    }
}
