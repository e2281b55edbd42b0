mod settings;

use std::path::Path;

use config::{Config, Environment, File};

use crate::config::settings::PartialSettings;
use crate::utils::error::GatewayError;

pub use settings::{GatewaySettings, RemoteSettings, Settings, SiteDef, TlsSettings};

pub const ENV_PREFIX: &str = "TIDEGATE";

/// Loads `config/default` (if present) and `TIDEGATE__*` environment
/// variables, merged over the defaults.
pub fn load_config() -> Result<Settings, GatewayError> {
    load_config_from(None)
}

/// Like `load_config`, reading `path` instead of `config/default`. An
/// explicit path must exist.
pub fn load_config_from(path: Option<&Path>) -> Result<Settings, GatewayError> {
    let file = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name("config/default").required(false),
    };
    let builder = Config::builder().add_source(file).add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(" ")
            .with_list_parse_key("sites"),
    );

    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    let default = Settings::default();

    let gateway = partial.gateway;
    let tls = partial.tls;
    let remote = partial.remote;

    let sites = partial
        .sites
        .unwrap_or_default()
        .iter()
        .map(|def| def.parse::<SiteDef>())
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Settings {
        gateway: GatewaySettings {
            site_id: gateway
                .as_ref()
                .and_then(|g| g.site_id)
                .unwrap_or(default.gateway.site_id),
            site_name: gateway
                .as_ref()
                .and_then(|g| g.site_name.clone())
                .unwrap_or(default.gateway.site_name),
            listen: gateway
                .as_ref()
                .and_then(|g| g.listen.clone())
                .unwrap_or(default.gateway.listen),
            secure_listen: gateway
                .as_ref()
                .and_then(|g| g.secure_listen.clone())
                .filter(|s| !s.is_empty())
                .or(default.gateway.secure_listen),
            debug_listen: gateway
                .as_ref()
                .and_then(|g| g.debug_listen.clone())
                .unwrap_or(default.gateway.debug_listen),
            backlog_path: gateway
                .as_ref()
                .and_then(|g| g.backlog_path.clone())
                .unwrap_or(default.gateway.backlog_path),
            log_level: gateway
                .as_ref()
                .and_then(|g| g.log_level.clone())
                .unwrap_or(default.gateway.log_level),
        },
        tls: TlsSettings {
            ca: tls.as_ref().and_then(|t| t.ca.clone()).or(default.tls.ca),
            cert: tls.as_ref().and_then(|t| t.cert.clone()).or(default.tls.cert),
            key: tls.as_ref().and_then(|t| t.key.clone()).or(default.tls.key),
            server_name: tls
                .as_ref()
                .and_then(|t| t.server_name.clone())
                .unwrap_or(default.tls.server_name),
        },
        remote: RemoteSettings {
            workers: remote
                .as_ref()
                .and_then(|r| r.workers)
                .unwrap_or(default.remote.workers),
            send_queue_depth: remote
                .as_ref()
                .and_then(|r| r.send_queue_depth)
                .unwrap_or(default.remote.send_queue_depth),
        },
        sites,
    })
}

#[cfg(test)]
mod tests;
