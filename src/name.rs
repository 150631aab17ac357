//! Domain name helpers.
//!
//! Directory paths are domain names with their labels reversed:
//!
//! ```text
//! 1.moray.sds.joyent.com  <->  /com/joyent/sds/moray/1
//! ```

use std::net::Ipv4Addr;

/// Suffix of IPv4 reverse lookup names.
pub const IN_ADDR_ARPA: &str = "in-addr.arpa";

/// Map a domain name onto its directory path.
///
/// The name is lowercased and any trailing dot is ignored.
pub fn domain_to_path(domain: &str) -> String {
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    let mut path = String::with_capacity(domain.len() + 1);
    for label in domain.rsplit('.') {
        path.push('/');
        path.push_str(label);
    }
    path
}

/// Map a directory path back onto its (lowercase) domain name.
pub fn path_to_domain(path: &str) -> String {
    path.trim_matches('/')
        .rsplit('/')
        .collect::<Vec<_>>()
        .join(".")
        .to_ascii_lowercase()
}

/// Join a child leaf onto its parent's path.
pub fn child_path(parent: &str, leaf: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), leaf)
}

/// True if every byte of `name` is in `[a-z0-9_.-]`.
pub fn is_valid_name(name: &str) -> bool {
    name.bytes()
        .all(|b| matches!(b, b'a'..=b'z' | b'0'..=b'9' | b'_' | b'.' | b'-'))
}

/// True if `name` is `suffix` or ends with `.suffix`.
pub fn has_suffix(name: &str, suffix: &str) -> bool {
    strip_suffix(name, suffix).is_some() || name == suffix
}

/// Remove a `.suffix` from the end of `name`, on a label boundary.
///
/// Returns `None` when `name` does not end with `.suffix` or nothing would
/// remain.
pub fn strip_suffix<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    let head = name.strip_suffix(suffix)?.strip_suffix('.')?;
    (!head.is_empty()).then_some(head)
}

/// An SRV-style name split into its parts: `_svc._proto.rest`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvName<'a> {
    /// Service label, with its leading underscore.
    pub service: &'a str,
    /// Protocol label, with its leading underscore.
    pub protocol: &'a str,
    /// Everything after the protocol label.
    pub rest: &'a str,
}

/// Split `_svc._proto.rest`.
///
/// Both prefix labels must start with an underscore followed by at least one
/// character that is neither `_` nor `.`; `rest` must be non-empty.
pub fn parse_srv_name(name: &str) -> Option<SrvName<'_>> {
    let mut parts = name.splitn(3, '.');
    let service = parts.next()?;
    let protocol = parts.next()?;
    let rest = parts.next()?;

    let prefix_ok = |label: &str| {
        label
            .strip_prefix('_')
            .is_some_and(|tail| !tail.is_empty() && !tail.contains('_'))
    };
    if !prefix_ok(service) || !prefix_ok(protocol) || rest.is_empty() {
        return None;
    }

    Some(SrvName {
        service,
        protocol,
        rest,
    })
}

/// Parse `d.c.b.a.in-addr.arpa` into `a.b.c.d`.
pub fn parse_reverse_v4(name: &str) -> Option<Ipv4Addr> {
    let octets = strip_suffix(name, IN_ADDR_ARPA)?;
    let mut parsed = [0u8; 4];
    let mut count = 0;
    for label in octets.rsplit('.') {
        if count == 4 {
            return None;
        }
        parsed[count] = label.parse().ok()?;
        count += 1;
    }
    (count == 4).then(|| Ipv4Addr::from(parsed))
}

/// The `in-addr.arpa` name for an address.
pub fn reverse_name_v4(addr: Ipv4Addr) -> String {
    let [a, b, c, d] = addr.octets();
    format!("{d}.{c}.{b}.{a}.{IN_ADDR_ARPA}")
}

/// The datacenter label of a name inside `zone`: the label immediately
/// before the zone suffix.
///
/// `moray.us-east-1.joyent.us` in zone `joyent.us` yields `us-east-1`.
pub fn datacenter_label<'a>(name: &'a str, zone: &str) -> Option<&'a str> {
    let head = strip_suffix(name, zone)?;
    head.rsplit('.').next().filter(|label| !label.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_to_path() {
        assert_eq!(
            domain_to_path("1.moray.sds.joyent.com"),
            "/com/joyent/sds/moray/1"
        );
        assert_eq!(domain_to_path("Foo.COM."), "/com/foo");
    }

    #[test]
    fn test_path_and_domain_are_inverse() {
        for domain in ["com", "foo.com", "lba.bar.foo.com", "_x.a-b.c_d.e0"] {
            assert_eq!(path_to_domain(&domain_to_path(domain)), domain);
        }
        for path in ["/com", "/com/foo/bar", "/us/joyent/us-east-1/moray/1"] {
            assert_eq!(domain_to_path(&path_to_domain(path)), path);
        }
    }

    #[test]
    fn test_child_path() {
        assert_eq!(child_path("/com/foo", "bar"), "/com/foo/bar");
        assert_eq!(child_path("/com/foo/", "bar"), "/com/foo/bar");
    }

    #[test]
    fn test_is_valid_name() {
        assert!(is_valid_name("_http._tcp.bar-1.foo.com"));
        assert!(!is_valid_name("bar foo.com"));
        assert!(!is_valid_name("Bar.foo.com"));
        assert!(!is_valid_name("bar*.foo.com"));
    }

    #[test]
    fn test_strip_suffix_respects_labels() {
        assert_eq!(strip_suffix("a.b.foo.com", "foo.com"), Some("a.b"));
        assert_eq!(strip_suffix("xfoo.com", "foo.com"), None);
        assert_eq!(strip_suffix("foo.com", "foo.com"), None);
        assert!(has_suffix("foo.com", "foo.com"));
        assert!(!has_suffix("xfoo.com", "foo.com"));
    }

    #[test]
    fn test_parse_srv_name() {
        let srv = parse_srv_name("_http._tcp.bar.foo.com").unwrap();
        assert_eq!(srv.service, "_http");
        assert_eq!(srv.protocol, "_tcp");
        assert_eq!(srv.rest, "bar.foo.com");

        assert!(parse_srv_name("_http._tcp").is_none());
        assert!(parse_srv_name("_http._tcp.").is_none());
        assert!(parse_srv_name("http._tcp.foo.com").is_none());
        assert!(parse_srv_name("_._tcp.foo.com").is_none());
        assert!(parse_srv_name("_ht_tp._tcp.foo.com").is_none());
        assert!(parse_srv_name("bar.foo.com").is_none());
    }

    #[test]
    fn test_parse_reverse_v4() {
        assert_eq!(
            parse_reverse_v4("2.1.0.10.in-addr.arpa"),
            Some(Ipv4Addr::new(10, 0, 1, 2))
        );
        assert_eq!(parse_reverse_v4("1.2.in-addr.arpa"), None);
        assert_eq!(parse_reverse_v4("5.4.3.2.1.in-addr.arpa"), None);
        assert_eq!(parse_reverse_v4("300.2.1.0.in-addr.arpa"), None);
        assert_eq!(parse_reverse_v4("foobar.com"), None);
        assert_eq!(
            reverse_name_v4(Ipv4Addr::new(192, 168, 0, 1)),
            "1.0.168.192.in-addr.arpa"
        );
    }

    #[test]
    fn test_datacenter_label() {
        assert_eq!(
            datacenter_label("moray.us-east-1.joyent.us", "joyent.us"),
            Some("us-east-1")
        );
        assert_eq!(
            datacenter_label("us-east-1.joyent.us", "joyent.us"),
            Some("us-east-1")
        );
        assert_eq!(datacenter_label("joyent.us", "joyent.us"), None);
        assert_eq!(datacenter_label("moray.example.com", "joyent.us"), None);
    }
}
