use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

use crate::utils::error::GatewayError;

/// Top-level configuration for the gateway daemon.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub gateway: GatewaySettings,
    pub tls: TlsSettings,
    pub remote: RemoteSettings,
    pub sites: Vec<SiteDef>,
}

/// Identity of this gateway and the addresses it binds.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewaySettings {
    pub site_id: u32,
    pub site_name: String,
    pub listen: String,
    /// TLS listener, disabled when unset.
    pub secure_listen: Option<String>,
    pub debug_listen: String,
    pub backlog_path: String,
    pub log_level: String,
}

/// PEM files for the TLS listener and `tcps` routes.
#[derive(Debug, Clone, PartialEq)]
pub struct TlsSettings {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub server_name: String,
}

impl TlsSettings {
    /// All three files, when every one is configured.
    pub fn material(&self) -> Option<(&str, &str, &str)> {
        match (&self.ca, &self.cert, &self.key) {
            (Some(ca), Some(cert), Some(key)) => Some((ca, cert, key)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSettings {
    pub workers: usize,
    pub send_queue_depth: usize,
}

/// A peer site: `name,num[,gw][,route]*`, e.g. `hq,5,gw,tcp:10.5.0.5:31228`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteDef {
    pub name: String,
    pub num: u32,
    pub gateway: bool,
    pub routes: Vec<String>,
}

impl FromStr for SiteDef {
    type Err = GatewayError;

    fn from_str(def: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| GatewayError::SiteDef {
            def: def.to_string(),
            reason: reason.to_string(),
        };

        let mut parts = def.split(',').map(str::trim);
        let name = match parts.next() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(invalid("site name is required")),
        };
        let num = parts
            .next()
            .ok_or_else(|| invalid("site name,num is required"))?
            .parse::<u32>()
            .map_err(|e| invalid(&format!("bad site number: {e}")))?;

        let mut rest = parts.filter(|p| !p.is_empty()).peekable();
        let gateway = rest.next_if_eq(&"gw").is_some();
        let routes = rest.map(str::to_string).collect();

        Ok(Self {
            name,
            num,
            gateway,
            routes,
        })
    }
}

impl fmt::Display for SiteDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.name, self.num)?;
        if self.gateway {
            write!(f, ",gw")?;
        }
        for route in &self.routes {
            write!(f, ",{route}")?;
        }
        Ok(())
    }
}

/// Partial configuration as read from files and the environment.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub gateway: Option<PartialGatewaySettings>,
    pub tls: Option<PartialTlsSettings>,
    pub remote: Option<PartialRemoteSettings>,
    pub sites: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct PartialGatewaySettings {
    pub site_id: Option<u32>,
    pub site_name: Option<String>,
    pub listen: Option<String>,
    pub secure_listen: Option<String>,
    pub debug_listen: Option<String>,
    pub backlog_path: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialTlsSettings {
    pub ca: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub server_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialRemoteSettings {
    pub workers: Option<usize>,
    pub send_queue_depth: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            gateway: GatewaySettings {
                site_id: 1,
                site_name: "local".to_string(),
                listen: "0.0.0.0:31228".to_string(),
                secure_listen: None,
                debug_listen: "0.0.0.0:8083".to_string(),
                backlog_path: "/tmp/tidegate.db".to_string(),
                log_level: "info".to_string(),
            },
            tls: TlsSettings {
                ca: None,
                cert: None,
                key: None,
                server_name: crate::transport::tls::DEFAULT_SERVER_NAME.to_string(),
            },
            remote: RemoteSettings {
                workers: crate::remote::site::DEFAULT_WORKERS,
                send_queue_depth: crate::remote::site::DEFAULT_SEND_QUEUE,
            },
            sites: Vec::new(),
        }
    }
}
