use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tidegate::broker::Router;
use tidegate::broker::message::{
    APP_WEB, Body, EndPoint, Message, Route, RouteStatus, SiteInfo, TypedPayload,
};
use tidegate::client::gateway_client::DEFAULT_GATEWAY_ADDR;
use tidegate::client::{ClientOptions, GatewayClient};
use tidegate::config::{Settings, SiteDef, load_config_from};
use tidegate::introspect::{self, IntrospectState};
use tidegate::persistence::{BacklogStore, SledBacklog};
use tidegate::remote::{RemoteSite, RemoteSiteOptions};
use tidegate::transport::deliverer::Deliverer;
use tidegate::transport::tls::TlsContext;
use tidegate::transport::{NetAcceptor, NetDeliverer, TlsNetAcceptor};
use tidegate::utils::error::{ClientError, GatewayError};
use tidegate::utils::logging;

#[derive(Parser)]
#[command(name = "tidegate", version, about = "Store-and-forward message gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway daemon.
    Serve(ServeArgs),
    /// Send one message through a gateway and print its delivery report.
    Client(ClientArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Configuration file, instead of config/default.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of the local site.
    #[arg(long)]
    num: Option<u32>,
    /// Name of the local site.
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    listen: Option<String>,
    #[arg(long)]
    secure_listen: Option<String>,
    #[arg(long)]
    debug_listen: Option<String>,
    /// Backlog database path.
    #[arg(long)]
    db: Option<String>,
    /// Peer site, `<name>,<num>[,gw][,<route>]*`. Repeatable.
    #[arg(long = "site", value_name = "SITE")]
    sites: Vec<SiteDef>,
    #[arg(long)]
    log_level: Option<String>,
}

impl ServeArgs {
    fn apply(self, settings: &mut Settings) {
        let gw = &mut settings.gateway;
        if let Some(num) = self.num {
            gw.site_id = num;
        }
        if let Some(name) = self.name {
            gw.site_name = name;
        }
        if let Some(listen) = self.listen {
            gw.listen = listen;
        }
        if self.secure_listen.is_some() {
            gw.secure_listen = self.secure_listen;
        }
        if let Some(debug_listen) = self.debug_listen {
            gw.debug_listen = debug_listen;
        }
        if let Some(db) = self.db {
            gw.backlog_path = db;
        }
        if let Some(level) = self.log_level {
            gw.log_level = level;
        }
        settings.sites.extend(self.sites);
    }
}

#[derive(Args)]
struct ClientArgs {
    #[arg(long, default_value = DEFAULT_GATEWAY_ADDR)]
    addr: String,
    /// Our application id.
    #[arg(long, default_value_t = APP_WEB)]
    app: u32,
    /// Destination site name; empty means this site.
    #[arg(long, default_value = "")]
    site: String,
    /// Destination application id.
    #[arg(long, default_value_t = 0)]
    to_app: u32,
    #[arg(long, default_value = "tidegate.demo.Text")]
    message_type: String,
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
    text: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Client(args) => {
            logging::init("warn");
            client(args).await.map_err(|e| e.to_string())
        }
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn serve(args: ServeArgs) -> Result<(), String> {
    let mut settings = match load_config_from(args.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            return Err(e.to_string());
        }
    };
    args.apply(&mut settings);
    logging::init(&settings.gateway.log_level);

    let cancel = CancellationToken::new();
    let running = run_gateway(&settings, cancel.clone()).await;
    if running.is_err() {
        cancel.cancel();
    }
    let backlog = running.map_err(|e| e.to_string())?;

    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!(error = %e, "could not listen for ctrl-c");
            }
            info!("shutting down");
        }
        _ = cancel.cancelled() => {}
    }
    cancel.cancel();
    // Let tasks observe cancellation before the final flush.
    tokio::time::sleep(Duration::from_millis(200)).await;
    if let Err(e) = backlog.sync() {
        warn!(error = %e, "could not flush backlog");
    }
    Ok(())
}

/// Bind every listener and start every remote site. Any failure here is fatal.
async fn run_gateway(
    settings: &Settings,
    cancel: CancellationToken,
) -> Result<Arc<SledBacklog>, GatewayError> {
    let gw = &settings.gateway;
    info!(site = gw.site_id, name = %gw.site_name, "tidegate starting");

    info!(path = %gw.backlog_path, "opening backlog");
    let backlog = Arc::new(SledBacklog::open(&gw.backlog_path)?);

    let router = Router::start(gw.site_id, &gw.site_name, cancel.child_token());
    let acceptor = NetAcceptor::bind(&gw.listen, router.clone(), cancel.child_token()).await?;
    tokio::spawn(acceptor.run());

    let tls = settings
        .tls
        .material()
        .map(|(ca, cert, key)| TlsContext::load(ca, cert, key, &settings.tls.server_name))
        .transpose()?;

    if let Some(addr) = &gw.secure_listen {
        let tls = tls.as_ref().ok_or_else(|| {
            GatewayError::Tls("a CA, certificate and private key must be configured to use TLS".into())
        })?;
        let acceptor = TlsNetAcceptor::bind(addr, tls, router.clone(), cancel.child_token()).await?;
        tokio::spawn(acceptor.run());
    }

    let opts = RemoteSiteOptions {
        workers: settings.remote.workers,
        send_queue_depth: settings.remote.send_queue_depth,
    };
    let mut sites = HashMap::new();
    for def in &settings.sites {
        info!(site = %def, "adding remote site");
        let info = SiteInfo {
            id: def.num,
            name: def.name.clone(),
            gateway: def.gateway,
            local: false,
            routes: def
                .routes
                .iter()
                .map(|url| Route {
                    url: url.clone(),
                    status: RouteStatus::Down,
                })
                .collect(),
        };
        let site_cancel = cancel.child_token();
        let deliverer_cancel = site_cancel.clone();
        let local_site = gw.site_id;
        let tls = tls.clone();
        let site = RemoteSite::start(
            info,
            router.clone(),
            backlog.clone(),
            opts,
            site_cancel,
            move |route, callback| {
                let deliverer = NetDeliverer::new(
                    &route.url,
                    local_site,
                    tls.clone(),
                    deliverer_cancel.child_token(),
                )?;
                deliverer.set_status_callback(callback);
                deliverer.start();
                Ok(deliverer as Arc<dyn Deliverer>)
            },
        )?;
        sites.insert(def.name.clone(), site);
    }

    let listener = TcpListener::bind(&gw.debug_listen)
        .await
        .map_err(|source| GatewayError::Bind {
            addr: gw.debug_listen.clone(),
            source,
        })?;
    let state = IntrospectState {
        router,
        sites: Arc::new(sites),
    };
    let debug_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = introspect::serve(listener, state, debug_cancel).await {
            error!(error = %e, "introspection server failed");
        }
    });

    Ok(backlog)
}

async fn client(args: ClientArgs) -> Result<(), ClientError> {
    let cancel = CancellationToken::new();
    let timeout = Duration::from_secs(args.timeout_secs);
    let client = GatewayClient::connect(ClientOptions::new(&args.addr, args.app), cancel.clone());

    tokio::time::timeout(timeout, client.ready())
        .await
        .map_err(|_| ClientError::Timeout(timeout))??;

    let site = client.resolve_site(&args.site);
    let destination = EndPoint {
        site,
        aid: args.to_app,
        ..EndPoint::default()
    };
    let body = Body::Unknown(TypedPayload::new(args.message_type, args.text.into_bytes()));
    let report = client
        .send_notify(Message::new(vec![destination], body))
        .await?;
    let report = tokio::time::timeout(timeout, report)
        .await
        .map_err(|_| ClientError::Timeout(timeout))?
        .map_err(|_| ClientError::Closed)?;

    println!(
        "{}",
        serde_json::to_string(&report).unwrap_or_else(|_| format!("{report:?}"))
    );
    cancel.cancel();
    Ok(())
}
