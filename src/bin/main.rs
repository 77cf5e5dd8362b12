//! dyndns binary entry point.

use clap::{Parser, Subcommand};
use dyndns::config::{DispatcherConfig, ResolverConfig};
use dyndns::{
    authority, telemetry, webhook, AddressResolver, Client, ClientConfig, Config, Dispatcher,
    DyndnsError, DyndnsServer, HttpDispatcher, HttpResolver, Keypair, MemoryZone, NoopNotifier,
    Reconciler, ServerConfig, StaticResolver, SystemLookup, ZoneAuthority,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tracing::{error, info};
use tripwire::Tripwire;

/// Signed dynamic DNS updates.
#[derive(Parser, Debug)]
#[command(name = "dyndns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML).
    #[arg(short, long, default_value = "dyndns.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep the configured host's record pointed at this machine.
    Client {
        /// Run a single discovery cycle and exit.
        #[arg(long)]
        once: bool,
    },
    /// Verify update requests and write DNS records.
    Server,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    telemetry::init(&config.telemetry)?;

    info!(config_file = %args.config.display(), "Starting dyndns");

    let result = match args.command {
        Command::Client { once } => match config.client {
            Some(client_config) => run_client(client_config, once).await,
            None => Err(DyndnsError::Config("missing [client] section".into())),
        },
        Command::Server => match config.server {
            Some(server_config) => run_server(server_config).await,
            None => Err(DyndnsError::Config("missing [server] section".into())),
        },
    };

    telemetry::shutdown();

    if let Err(e) = result {
        error!("dyndns error: {}", e);
        return Err(e.into());
    }

    info!("dyndns shutdown complete");
    Ok(())
}

fn build_resolver(config: &ClientConfig) -> Result<Arc<dyn AddressResolver>, DyndnsError> {
    let resolver: Arc<dyn AddressResolver> = match &config.resolver {
        ResolverConfig::Static { ipv4, ipv6 } => {
            Arc::new(StaticResolver::new(config.host.clone(), *ipv4, *ipv6)?)
        }
        ResolverConfig::Http {
            ipv4_urls,
            ipv6_urls,
        } if ipv4_urls.is_empty() && ipv6_urls.is_empty() => {
            Arc::new(HttpResolver::new(config.host.clone())?)
        }
        ResolverConfig::Http {
            ipv4_urls,
            ipv6_urls,
        } => Arc::new(HttpResolver::with_providers(
            config.host.clone(),
            ipv4_urls.clone(),
            ipv6_urls.clone(),
        )?),
    };
    Ok(resolver)
}

fn build_dispatchers(
    config: &ClientConfig,
) -> Result<BTreeMap<String, Arc<dyn Dispatcher>>, DyndnsError> {
    let timeout = Duration::from_secs(config.dispatch_timeout_secs);
    config
        .dispatchers
        .iter()
        .map(|(name, dispatcher)| -> Result<(String, Arc<dyn Dispatcher>), DyndnsError> {
            let dispatcher: Arc<dyn Dispatcher> = match dispatcher {
                DispatcherConfig::Http { url } => {
                    Arc::new(HttpDispatcher::with_timeout(url.clone(), timeout)?)
                }
            };
            Ok((name.clone(), dispatcher))
        })
        .collect()
}

async fn run_client(config: ClientConfig, once: bool) -> Result<(), DyndnsError> {
    config.validate()?;

    let keypair = Keypair::load_or_generate(&config.keypair_path)?;
    info!(
        host = %config.host,
        public_key = %keypair.public_key_base64(),
        "loaded keypair"
    );

    let lookup = match config.lookup_nameserver {
        Some(addr) => {
            info!(nameserver = %addr, "checking convergence against name server");
            SystemLookup::with_nameserver(addr)
        }
        None => SystemLookup::new()?,
    };

    let reconciler = Reconciler::new(build_dispatchers(&config)?, config.reconciler())?;
    let mut client = Client::new(
        build_resolver(&config)?,
        Arc::new(keypair),
        Arc::new(reconciler),
        Arc::new(lookup),
        Arc::new(NoopNotifier),
        config.state_machine(),
    );

    if once {
        let record = client.run_once().await?;
        info!(record = %record, "single run complete");
        return Ok(());
    }

    let (tripwire, tripwire_worker) = Tripwire::new_signals();
    tokio::spawn(tripwire_worker);

    client.run(tripwire).await;
    Ok(())
}

async fn run_server(config: ServerConfig) -> Result<(), DyndnsError> {
    config.validate()?;

    let known_hosts = dyndns::server::decode_known_hosts(&config.known_hosts)?;
    let zone = MemoryZone::new(config.record_ttl);
    let zone_authority = ZoneAuthority::new(config.dns.clone(), zone.clone(), config.record_ttl)?;
    let server = DyndnsServer::new(
        known_hosts,
        Arc::new(zone.clone()),
        Arc::new(zone),
        Arc::new(NoopNotifier),
    )?
    .with_grace_period(config.grace_period());

    info!(
        known_hosts = server.known_hosts_count(),
        webhook_listen_addr = %config.webhook_listen_addr,
        dns_listen_addr = %config.dns.listen_addr,
        zone = %config.dns.zone,
        "Starting dyndns server"
    );

    let (tripwire, tripwire_worker) = Tripwire::new_signals();
    tokio::spawn(tripwire_worker);

    let udp_socket = UdpSocket::bind(config.dns.listen_addr).await?;
    let tcp_listener = TcpListener::bind(config.dns.listen_addr).await?;
    let dns_tripwire = tripwire.clone();
    let dns_handle = tokio::spawn(async move {
        if let Err(e) = authority::serve(zone_authority, udp_socket, tcp_listener, dns_tripwire).await
        {
            error!("DNS server error: {}", e);
        }
    });

    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let listener = TcpListener::bind(config.webhook_listen_addr).await?;
    let webhook_tripwire = tripwire.clone();
    let webhook_handle = tokio::spawn(async move {
        if let Err(e) = webhook::serve(listener, tx, webhook_tripwire).await {
            error!("Webhook error: {}", e);
        }
    });

    Arc::new(server).run(rx, tripwire).await;

    let _ = webhook_handle.await;
    let _ = dns_handle.await;
    Ok(())
}
