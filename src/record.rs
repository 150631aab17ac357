//! Directory record payloads.
//!
//! Every directory node may carry a JSON object with a `type` discriminator
//! naming a sub-object of the same name:
//!
//! ```json
//! { "type": "load_balancer", "load_balancer": { "address": "10.0.1.2" } }
//! ```
//!
//! [`Record::parse`] validates the discriminator once and produces a tagged
//! value. Payloads that are JSON but structurally wrong become
//! [`Record::Invalid`] so the resolver can fail the query that targets them;
//! payloads that are not JSON at all are rejected with [`RecordError`] and
//! the caller keeps whatever it had before.

use std::net::Ipv4Addr;

use reqwest::Url;
use serde::Deserialize;
use serde_json::Value;

use crate::error::RecordError;

/// TTL used when a record carries none; matches the typical directory
/// session timeout, the horizon at which ephemeral registrations vanish.
pub const DEFAULT_TTL: u32 = 30;

/// The `type` discriminator of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// `host`
    Host,
    /// `load_balancer`
    LoadBalancer,
    /// `moray_host`
    MorayHost,
    /// `redis_host`
    RedisHost,
    /// `db_host`
    DbHost,
    /// `rr_host`
    RrHost,
    /// `ops_host`
    OpsHost,
    /// `database`
    Database,
    /// `service`
    Service,
}

impl RecordKind {
    /// Parse a discriminator string.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "host" => Self::Host,
            "load_balancer" => Self::LoadBalancer,
            "moray_host" => Self::MorayHost,
            "redis_host" => Self::RedisHost,
            "db_host" => Self::DbHost,
            "rr_host" => Self::RrHost,
            "ops_host" => Self::OpsHost,
            "database" => Self::Database,
            "service" => Self::Service,
            _ => return None,
        })
    }

    /// The discriminator string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::LoadBalancer => "load_balancer",
            Self::MorayHost => "moray_host",
            Self::RedisHost => "redis_host",
            Self::DbHost => "db_host",
            Self::RrHost => "rr_host",
            Self::OpsHost => "ops_host",
            Self::Database => "database",
            Self::Service => "service",
        }
    }

    /// Kinds that describe a single addressed machine.
    pub fn is_host(&self) -> bool {
        !matches!(self, Self::Database | Self::Service)
    }

    /// Kinds eligible to answer as members of a service.
    pub fn is_member(&self) -> bool {
        matches!(
            self,
            Self::LoadBalancer | Self::MorayHost | Self::OpsHost | Self::RrHost | Self::RedisHost
        )
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single addressed machine (`host`, `load_balancer`, `moray_host`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRecord {
    /// Which host-like kind this is.
    pub kind: RecordKind,
    /// `None` when the registration carries a null or missing address.
    pub address: Option<Ipv4Addr>,
    /// Ports this member serves; empty means "use the service's port".
    pub ports: Vec<u16>,
    /// Deepest explicit TTL.
    pub ttl: Option<u32>,
}

/// A database whose address is the host of its primary connection URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseRecord {
    /// Primary connection URL, e.g. `tcp://user@10.0.0.1/db`.
    pub primary: String,
    /// Host component of `primary`.
    pub address: Ipv4Addr,
    /// Deepest explicit TTL.
    pub ttl: Option<u32>,
}

/// A load-balanced group whose children are its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Registered service label, e.g. `_http`.
    pub service: Option<String>,
    /// Registered protocol label, e.g. `_tcp`.
    pub protocol: Option<String>,
    /// Default port for members that list none.
    pub port: Option<u16>,
    /// Deepest explicit TTL.
    pub ttl: Option<u32>,
}

impl ServiceRecord {
    /// True if this service is registered under `service`/`protocol`.
    pub fn matches(&self, service: &str, protocol: &str) -> bool {
        self.service.as_deref() == Some(service) && self.protocol.as_deref() == Some(protocol)
    }
}

/// A parsed directory payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Record {
    Host(HostRecord),
    Database(DatabaseRecord),
    Service(ServiceRecord),
    /// Well-formed, but with a discriminator this server does not serve.
    Unknown { type_name: String },
    /// JSON that does not describe a usable record.
    Invalid {
        type_name: Option<String>,
        reason: String,
        payload: String,
    },
}

#[derive(Debug, Deserialize)]
struct HostBody {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    ports: Option<Vec<u16>>,
    #[serde(default)]
    ttl: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct DatabaseBody {
    primary: String,
    #[serde(default)]
    ttl: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ServiceBody {
    #[serde(default)]
    srvce: Option<String>,
    #[serde(default)]
    proto: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    ttl: Option<u32>,
    /// Some registrations nest the real body one level deeper.
    #[serde(default)]
    service: Option<Box<ServiceBody>>,
}

impl Record {
    /// Parse a raw node payload.
    ///
    /// Returns `Ok(None)` for an empty payload (the node exists with no
    /// data) and `Err` when the bytes are not JSON at all.
    pub fn parse(bytes: &[u8]) -> Result<Option<Record>, RecordError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let value: Value = serde_json::from_slice(bytes)?;
        Ok(Some(Self::from_value(value)))
    }

    fn from_value(value: Value) -> Record {
        let invalid = |type_name: Option<String>, reason: &str, value: &Value| Record::Invalid {
            type_name,
            reason: reason.to_string(),
            payload: value.to_string(),
        };

        let Some(object) = value.as_object() else {
            return invalid(None, "payload is not an object", &value);
        };
        let Some(tag) = object.get("type").and_then(Value::as_str) else {
            return invalid(None, "missing type discriminator", &value);
        };
        let tag = tag.to_string();
        let Some(body) = object.get(&tag).filter(|body| body.is_object()) else {
            return invalid(Some(tag), "missing type-specific object", &value);
        };
        let root_ttl = match object.get("ttl") {
            None | Some(Value::Null) => None,
            Some(ttl) => match ttl.as_u64().and_then(|ttl| u32::try_from(ttl).ok()) {
                Some(ttl) => Some(ttl),
                None => return invalid(Some(tag), "ttl is not a valid integer", &value),
            },
        };

        let Some(kind) = RecordKind::from_tag(&tag) else {
            return Record::Unknown { type_name: tag };
        };

        match kind {
            RecordKind::Database => {
                let body: DatabaseBody = match serde_json::from_value(body.clone()) {
                    Ok(body) => body,
                    Err(e) => return invalid(Some(tag), &e.to_string(), &value),
                };
                let Some(address) = primary_address(&body.primary) else {
                    return invalid(Some(tag), "primary URL has no IPv4 host", &value);
                };
                Record::Database(DatabaseRecord {
                    primary: body.primary,
                    address,
                    ttl: body.ttl.or(root_ttl),
                })
            }
            RecordKind::Service => {
                let body: ServiceBody = match serde_json::from_value(body.clone()) {
                    Ok(body) => body,
                    Err(e) => return invalid(Some(tag), &e.to_string(), &value),
                };
                let ServiceBody {
                    srvce,
                    proto,
                    port,
                    ttl,
                    service,
                } = body;
                let ttl = ttl.or(root_ttl);
                let (srvce, proto, port, ttl) = match service {
                    Some(nested) => (nested.srvce, nested.proto, nested.port, nested.ttl.or(ttl)),
                    None => (srvce, proto, port, ttl),
                };
                Record::Service(ServiceRecord {
                    service: srvce,
                    protocol: proto,
                    port,
                    ttl,
                })
            }
            _ => {
                let body: HostBody = match serde_json::from_value(body.clone()) {
                    Ok(body) => body,
                    Err(e) => return invalid(Some(tag), &e.to_string(), &value),
                };
                let address = match body.address.as_deref() {
                    None => None,
                    Some(addr) => match addr.parse() {
                        Ok(addr) => Some(addr),
                        Err(_) => return invalid(Some(tag), "address is not IPv4", &value),
                    },
                };
                Record::Host(HostRecord {
                    kind,
                    address,
                    ports: body.ports.unwrap_or_default(),
                    ttl: body.ttl.or(root_ttl),
                })
            }
        }
    }

    /// The record's kind, if it is a served one.
    pub fn kind(&self) -> Option<RecordKind> {
        match self {
            Record::Host(host) => Some(host.kind),
            Record::Database(_) => Some(RecordKind::Database),
            Record::Service(_) => Some(RecordKind::Service),
            Record::Unknown { .. } | Record::Invalid { .. } => None,
        }
    }

    /// The effective TTL: the deepest explicit TTL, else [`DEFAULT_TTL`].
    pub fn ttl(&self) -> u32 {
        let ttl = match self {
            Record::Host(host) => host.ttl,
            Record::Database(db) => db.ttl,
            Record::Service(svc) => svc.ttl,
            Record::Unknown { .. } | Record::Invalid { .. } => None,
        };
        ttl.unwrap_or(DEFAULT_TTL)
    }

    /// The address a host-like record answers with.
    pub fn host_address(&self) -> Option<Ipv4Addr> {
        match self {
            Record::Host(host) => host.address,
            _ => None,
        }
    }
}

fn primary_address(primary: &str) -> Option<Ipv4Addr> {
    let url = Url::parse(primary).ok()?;
    url.host_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Record {
        Record::parse(json.as_bytes()).unwrap().unwrap()
    }

    #[test]
    fn test_parse_host() {
        let record = parse(r#"{"type":"host","host":{"address":"192.168.0.1"}}"#);
        assert_eq!(record.kind(), Some(RecordKind::Host));
        assert_eq!(record.host_address(), Some(Ipv4Addr::new(192, 168, 0, 1)));
        assert_eq!(record.ttl(), DEFAULT_TTL);
    }

    #[test]
    fn test_parse_member_with_ports() {
        let record = parse(
            r#"{"type":"moray_host","moray_host":{"address":"10.0.0.5","ports":[2021,2022]}}"#,
        );
        let Record::Host(host) = record else {
            panic!("expected host record");
        };
        assert_eq!(host.kind, RecordKind::MorayHost);
        assert!(host.kind.is_member());
        assert_eq!(host.ports, vec![2021, 2022]);
    }

    #[test]
    fn test_null_address_is_kept_as_absent() {
        let record = parse(r#"{"type":"load_balancer","load_balancer":{"address":null}}"#);
        assert_eq!(record.kind(), Some(RecordKind::LoadBalancer));
        assert_eq!(record.host_address(), None);
    }

    #[test]
    fn test_parse_database() {
        let record = parse(
            r#"{"type":"database","database":{"primary":"tcp://u@192.168.0.1/pg"}}"#,
        );
        let Record::Database(db) = record else {
            panic!("expected database record");
        };
        assert_eq!(db.address, Ipv4Addr::new(192, 168, 0, 1));
    }

    #[test]
    fn test_ttl_deepest_wins() {
        let root = parse(r#"{"type":"host","ttl":10,"host":{"address":"1.2.3.4"}}"#);
        assert_eq!(root.ttl(), 10);

        let both = parse(r#"{"type":"host","ttl":10,"host":{"address":"1.2.3.4","ttl":20}}"#);
        assert_eq!(both.ttl(), 20);

        let nested = parse(
            r#"{"type":"service","ttl":10,"service":{"ttl":20,
                "service":{"srvce":"_http","proto":"_tcp","port":80,"ttl":60}}}"#,
        );
        assert_eq!(nested.ttl(), 60);

        let nested_without_ttl = parse(
            r#"{"type":"service","service":{"ttl":20,
                "service":{"srvce":"_http","proto":"_tcp","port":80}}}"#,
        );
        assert_eq!(nested_without_ttl.ttl(), 20);
    }

    #[test]
    fn test_parse_service() {
        let record = parse(
            r#"{"type":"service","service":{"srvce":"_http","proto":"_tcp","port":80}}"#,
        );
        let Record::Service(svc) = record else {
            panic!("expected service record");
        };
        assert!(svc.matches("_http", "_tcp"));
        assert!(!svc.matches("_http", "_udp"));
        assert_eq!(svc.port, Some(80));
    }

    #[test]
    fn test_empty_payload() {
        assert_eq!(Record::parse(b"").unwrap(), None);
        assert_eq!(Record::parse(b"  \n").unwrap(), None);
    }

    #[test]
    fn test_malformed_json_is_an_error() {
        assert!(Record::parse(b"{not json").is_err());
    }

    #[test]
    fn test_structurally_invalid_records() {
        for json in [
            r#"[1,2,3]"#,
            r#"{"host":{"address":"1.2.3.4"}}"#,
            r#"{"type":"host"}"#,
            r#"{"type":"host","host":null}"#,
            r#"{"type":"host","host":{"address":"not-an-ip"}}"#,
            r#"{"type":"database","database":{"primary":"nonsense"}}"#,
        ] {
            assert!(
                matches!(parse(json), Record::Invalid { .. }),
                "expected invalid: {json}"
            );
        }
    }

    #[test]
    fn test_unknown_type() {
        let record = parse(r#"{"type":"widget","widget":{}}"#);
        assert_eq!(
            record,
            Record::Unknown {
                type_name: "widget".to_string()
            }
        );
        assert_eq!(record.kind(), None);
    }
}
