//! Message definitions for the gateway bus
//!
//! `Message` is the canonical wire/internal representation. The body is a
//! closed set of control payloads the gateway understands plus an opaque
//! `Unknown` variant for application types, so routing never depends on
//! decoding application data.
//!
//! Notes on fields:
//! - `source` / `destination`: addressing used by the matcher
//! - `write_time`, `send_time`, `request_time`: milliseconds since UNIX epoch,
//!   `0` when unset. Channels refresh `send_time` when they transmit.
//! - `notify_sent`: non-zero when the sender wants a `DeliveryReport` back
//! - `real_time`: never persisted for later delivery

use serde::{Deserialize, Serialize};

pub const UNKNOWN_SITE: u32 = 0x00;
pub const LOCAL_SITE: u32 = 0x01;
pub const HQ_SITE: u32 = 0x02;

pub const APP_UNKNOWN: u32 = 0x00;
pub const APP_GATEWAY: u32 = 0x02;
pub const APP_REPORTER: u32 = 0x18;
pub const APP_DATABASE: u32 = 0x31;
pub const APP_PING: u32 = 0x32;
pub const APP_ANALYZER: u32 = 0x33;
pub const APP_WEB: u32 = 0x34;
pub const APP_SUPERVISOR: u32 = 0x35;
pub const APP_AUTH: u32 = 0x43;

/// Display name for a well-known application id.
pub fn app_name(aid: u32) -> Option<&'static str> {
    match aid {
        APP_UNKNOWN => Some("unknown"),
        APP_GATEWAY => Some("gateway"),
        APP_REPORTER => Some("reporter"),
        APP_DATABASE => Some("database"),
        APP_PING => Some("ping"),
        APP_ANALYZER => Some("analyzer"),
        APP_WEB => Some("web"),
        APP_SUPERVISOR => Some("supervisor"),
        APP_AUTH => Some("auth"),
        _ => None,
    }
}

pub const REGISTRY_TYPE: &str = "tidegate.routing.Registry";
pub const SERVICE_INFO_TYPE: &str = "tidegate.routing.ServiceInfo";
pub const DELIVERY_REPORT_TYPE: &str = "tidegate.routing.DeliveryReport";
pub const SITE_STATUS_TYPE: &str = "tidegate.routing.SiteStatus";

/// Address tuple. Zero fields are wildcards inside a `Listener`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndPoint {
    pub site: u32,
    pub aid: u32,
    pub eid: u32,
    pub pid: u32,
}

impl EndPoint {
    pub fn site(site: u32) -> Self {
        Self {
            site,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[default]
    None,
    Request,
    Reply,
    Ack,
    Keepalive,
    Broadcast,
}

/// Subscription pattern. `None` / empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub source: Option<EndPoint>,
    pub destination: Option<EndPoint>,
    pub message_type: String,
}

/// Interest set a connection announces to the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registry {
    pub source_service: Option<EndPoint>,
    pub entries: Vec<Listener>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteStatus {
    Up,
    #[default]
    Down,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub url: String,
    pub status: RouteStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInfo {
    pub id: u32,
    pub name: String,
    pub gateway: bool,
    pub local: bool,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub sites: Vec<SiteInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Sent,
    Failed,
    Processed,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub notify_id: i32,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Ok,
    Bad,
}

/// Connectivity notice for a peer site, injected by the gateway itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteStatus {
    pub site_id: u32,
    pub connection: ConnectionStatus,
}

/// Application payload the gateway routes without interpreting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedPayload {
    pub type_name: String,
    pub data: Vec<u8>,
}

impl TypedPayload {
    pub fn new(type_name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            type_name: type_name.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RawBody", try_from = "RawBody")]
pub enum Body {
    Registry(Registry),
    ServiceInfo(ServiceInfo),
    DeliveryReport(DeliveryReport),
    SiteStatus(SiteStatus),
    Unknown(TypedPayload),
}

impl Body {
    pub fn type_name(&self) -> &str {
        match self {
            Body::Registry(_) => REGISTRY_TYPE,
            Body::ServiceInfo(_) => SERVICE_INFO_TYPE,
            Body::DeliveryReport(_) => DELIVERY_REPORT_TYPE,
            Body::SiteStatus(_) => SITE_STATUS_TYPE,
            Body::Unknown(p) => &p.type_name,
        }
    }
}

// Wire form of every body: type tag plus opaque bytes.
#[derive(Serialize, Deserialize)]
struct RawBody {
    type_name: String,
    data: Vec<u8>,
}

impl From<Body> for RawBody {
    fn from(body: Body) -> Self {
        let encoded = match &body {
            Body::Registry(r) => bincode::serialize(r),
            Body::ServiceInfo(s) => bincode::serialize(s),
            Body::DeliveryReport(d) => bincode::serialize(d),
            Body::SiteStatus(s) => bincode::serialize(s),
            Body::Unknown(p) => {
                return RawBody {
                    type_name: p.type_name.clone(),
                    data: p.data.clone(),
                };
            }
        };
        RawBody {
            type_name: body.type_name().to_string(),
            // plain structs of integers, strings and vecs always encode
            data: encoded.unwrap_or_default(),
        }
    }
}

impl TryFrom<RawBody> for Body {
    type Error = bincode::Error;

    fn try_from(raw: RawBody) -> Result<Self, Self::Error> {
        Ok(match raw.type_name.as_str() {
            REGISTRY_TYPE => Body::Registry(bincode::deserialize(&raw.data)?),
            SERVICE_INFO_TYPE => Body::ServiceInfo(bincode::deserialize(&raw.data)?),
            DELIVERY_REPORT_TYPE => Body::DeliveryReport(bincode::deserialize(&raw.data)?),
            SITE_STATUS_TYPE => Body::SiteStatus(bincode::deserialize(&raw.data)?),
            _ => Body::Unknown(TypedPayload {
                type_name: raw.type_name,
                data: raw.data,
            }),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub source: Option<EndPoint>,
    pub destination: Vec<EndPoint>,
    pub body: Option<Body>,
    pub status: Status,
    pub write_time: i64,
    pub send_time: i64,
    pub request_time: i64,
    pub command_sequence: Option<u32>,
    pub notify_sent: i32,
    pub real_time: bool,
}

impl Message {
    /// A message carrying `body` to each of `destination`.
    pub fn new(destination: Vec<EndPoint>, body: Body) -> Self {
        Self {
            destination,
            body: Some(body),
            write_time: chrono::Utc::now().timestamp_millis(),
            ..Self::default()
        }
    }

    /// Body-less frame with only a status, e.g. ACK or KEEPALIVE.
    pub fn with_status(status: Status) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    /// Type tag of the body, or `""` when there is none.
    pub fn message_type(&self) -> &str {
        self.body.as_ref().map(Body::type_name).unwrap_or("")
    }
}
