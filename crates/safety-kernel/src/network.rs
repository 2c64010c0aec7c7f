//! Outbound request validation (SSRF and DNS-rebinding defense).
//!
//! Literal IPs are classified directly; hostnames are resolved and every
//! returned address must be public. Callers must re-run the check at
//! connect time for the rebinding defense to hold.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use url::{Host, Url};

use crate::verdict::Decision;

/// Cloud instance-metadata addresses. Blocked even when private targets are allowed.
pub const METADATA_IPS: &[IpAddr] = &[
    IpAddr::V4(Ipv4Addr::new(169, 254, 169, 254)),
    IpAddr::V4(Ipv4Addr::new(100, 100, 100, 200)),
    IpAddr::V6(Ipv6Addr::new(0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254)),
];

/// Cloud instance-metadata hostnames.
pub const METADATA_HOSTS: &[&str] = &["metadata.google.internal", "metadata.goog"];

/// Hostname resolution seam.
pub trait Resolver: Send + Sync + fmt::Debug {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>>;
}

/// Resolves through the operating system (`getaddrinfo`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<IpAddr>> {
        Ok((host, port).to_socket_addrs()?.map(|a| a.ip()).collect())
    }
}

/// Fixed host table. Unknown hosts fail to resolve.
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    table: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, host: impl Into<String>, addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        self.table
            .insert(host.into().to_ascii_lowercase(), addrs.into_iter().collect());
        self
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, host: &str, _port: u16) -> io::Result<Vec<IpAddr>> {
        self.table
            .get(&host.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown host {host}")))
    }
}

/// Validates outbound URLs and hosts.
#[derive(Debug, Clone)]
pub struct NetworkGuard {
    host_allowlist: Option<BTreeSet<String>>,
    allow_private: bool,
    resolver: Arc<dyn Resolver>,
}

impl Default for NetworkGuard {
    fn default() -> Self {
        Self::new()
    }
}

enum Target {
    Ip(IpAddr),
    Host { host: String, port: u16 },
}

impl NetworkGuard {
    /// Guard with no allowlist, private targets blocked, system DNS.
    pub fn new() -> Self {
        Self {
            host_allowlist: None,
            allow_private: false,
            resolver: Arc::new(SystemResolver),
        }
    }

    /// Only hosts literally present in `hosts` may be contacted.
    pub fn with_allowlist(mut self, hosts: impl IntoIterator<Item = String>) -> Self {
        let hosts: BTreeSet<String> = hosts.into_iter().map(|h| h.to_ascii_lowercase()).collect();
        info!(hosts = hosts.len(), "network host allowlist configured");
        self.host_allowlist = Some(hosts);
        self
    }

    /// Permit private / loopback targets. Metadata endpoints stay blocked.
    pub fn allow_private(mut self, allow: bool) -> Self {
        self.allow_private = allow;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn host_allowlist(&self) -> Option<&BTreeSet<String>> {
        self.host_allowlist.as_ref()
    }

    /// Validate a full URL, resolving its host through the configured resolver.
    pub fn is_safe_url(&self, url: &str) -> Decision {
        match self.parse_target(url) {
            Err(denied) => denied,
            Ok(Target::Ip(ip)) => self.check_literal(ip),
            Ok(Target::Host { host, port }) => self.check_host(&host, port),
        }
    }

    /// [`Self::is_safe_url`] with non-blocking DNS bounded by `timeout`.
    pub async fn is_safe_url_async(&self, url: &str, timeout: Duration) -> Decision {
        let (host, port) = match self.parse_target(url) {
            Err(denied) => return denied,
            Ok(Target::Ip(ip)) => return self.check_literal(ip),
            Ok(Target::Host { host, port }) => (host, port),
        };
        if let Some(denied) = self.precheck_host(&host) {
            return denied;
        }

        let lookup = tokio::net::lookup_host((host.as_str(), port));
        let outcome = tokio::time::timeout(timeout, lookup).await;
        match outcome {
            Err(_) => deny(format!("dns_resolution_timeout: {host}")),
            Ok(Err(_)) => deny(format!("dns_resolution_failed: {host}")),
            Ok(Ok(addrs)) => {
                let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                self.check_resolved(&host, &addrs)
            }
        }
    }

    /// Resolve `host` and validate every returned address.
    pub fn check_host(&self, host: &str, port: u16) -> Decision {
        if let Some(denied) = self.precheck_host(host) {
            return denied;
        }
        match self.resolver.resolve(host, port) {
            Ok(addrs) => self.check_resolved(host, &addrs),
            Err(_) => deny(format!("dns_resolution_failed: {host}")),
        }
    }

    /// Classify one address without resolution.
    pub fn check_ip(&self, ip: IpAddr) -> Decision {
        if is_metadata_ip(ip) {
            return deny(format!("metadata_endpoint: {ip}"));
        }
        if !self.allow_private {
            if let Some(class) = unsafe_class(ip) {
                return deny(format!("{class}_address: {ip}"));
            }
        }
        Decision::allow("allowed")
    }

    fn parse_target(&self, url: &str) -> Result<Target, Decision> {
        let parsed = Url::parse(url).map_err(|_| deny("url_parse_failed"))?;
        let scheme = parsed.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(deny(format!("blocked_scheme: {scheme}")));
        }
        let port = parsed.port_or_known_default().unwrap_or(443);
        match parsed.host() {
            None => Err(deny("no_hostname")),
            Some(Host::Ipv4(ip)) => Ok(Target::Ip(IpAddr::V4(ip))),
            Some(Host::Ipv6(ip)) => Ok(Target::Ip(IpAddr::V6(ip))),
            Some(Host::Domain(domain)) if domain.is_empty() => Err(deny("no_hostname")),
            Some(Host::Domain(domain)) => Ok(Target::Host {
                host: domain.to_string(),
                port,
            }),
        }
    }

    fn check_literal(&self, ip: IpAddr) -> Decision {
        if is_metadata_ip(ip) {
            return deny(format!("metadata_endpoint: {ip}"));
        }
        if let Some(allowlist) = &self.host_allowlist {
            if !allowlist.contains(&ip.to_string()) {
                return deny(format!("host_not_in_allowlist: {ip}"));
            }
        }
        self.check_ip(ip)
    }

    /// Checks that need no DNS: metadata hostnames, then the allowlist.
    fn precheck_host(&self, host: &str) -> Option<Decision> {
        let normalized = host.trim_end_matches('.').to_ascii_lowercase();
        if METADATA_HOSTS.contains(&normalized.as_str()) {
            return Some(deny(format!("metadata_endpoint: {normalized}")));
        }
        if let Some(allowlist) = &self.host_allowlist {
            if !allowlist.contains(&normalized) {
                return Some(deny(format!("host_not_in_allowlist: {host}")));
            }
        }
        None
    }

    fn check_resolved(&self, host: &str, addrs: &[IpAddr]) -> Decision {
        if addrs.is_empty() {
            return deny(format!("dns_resolution_failed: {host}"));
        }
        for &ip in addrs {
            if is_metadata_ip(ip) {
                return deny(format!("metadata_endpoint: {ip}"));
            }
            if !self.allow_private {
                if let Some(class) = unsafe_class(ip) {
                    return deny(format!("{class}_address: {ip} (resolved from {host})"));
                }
            }
        }
        Decision::allow("allowed")
    }
}

fn deny(reason: impl Into<String>) -> Decision {
    let decision = Decision::deny(reason);
    warn!(reason = %decision.reason, "outbound request blocked");
    decision
}

pub fn is_metadata_ip(ip: IpAddr) -> bool {
    if METADATA_IPS.contains(&ip) {
        return true;
    }
    let ip = match ip {
        IpAddr::V6(v6) => embedded_ipv4(v6).map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    };
    METADATA_IPS.contains(&ip)
}

/// Name of the non-public range containing `ip`, if any.
pub fn unsafe_class(ip: IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(v4) => unsafe_class_v4(v4),
        IpAddr::V6(v6) => unsafe_class_v6(v6),
    }
}

fn unsafe_class_v4(ip: Ipv4Addr) -> Option<&'static str> {
    let [a, b, _, _] = ip.octets();
    let class = if ip.is_private() {
        "private"
    } else if ip.is_loopback() {
        "loopback"
    } else if ip.is_link_local() {
        "link_local"
    } else if ip.is_broadcast() {
        "broadcast"
    } else if ip.is_documentation() {
        "documentation"
    } else if ip.is_multicast() {
        "multicast"
    } else if ip.is_unspecified() {
        "unspecified"
    } else if a == 100 && (b & 0b1100_0000) == 64 {
        // 100.64.0.0/10 carrier-grade NAT
        "shared"
    } else if a == 198 && (b & 0xfe) == 18 {
        "benchmarking"
    } else if a == 0 || a >= 240 {
        "reserved"
    } else {
        return None;
    };
    Some(class)
}

fn unsafe_class_v6(ip: Ipv6Addr) -> Option<&'static str> {
    if let Some(v4) = embedded_ipv4(ip) {
        return unsafe_class_v4(v4);
    }
    let seg = ip.segments();
    let first = seg[0];
    let class = if ip.is_loopback() {
        "loopback"
    } else if ip.is_unspecified() {
        "unspecified"
    } else if ip.is_multicast() {
        "multicast"
    } else if (first & 0xfe00) == 0xfc00 {
        "unique_local"
    } else if (first & 0xffc0) == 0xfe80 {
        "link_local"
    } else if (first & 0xffc0) == 0xfec0 {
        "site_local"
    } else if first == 0x2001 && seg[1] == 0x0db8 {
        "documentation"
    } else if (first & 0xff00) == 0 || (first == 0x0100 && seg[1..4] == [0, 0, 0]) {
        // ::/8 and the 100::/64 discard prefix
        "reserved"
    } else {
        return None;
    };
    Some(class)
}

/// IPv4 address carried inside an IPv6 one: mapped (`::ffff:0:0/96`),
/// compatible (`::/96`), NAT64 (`64:ff9b::/96`) or 6to4 (`2002::/16`).
fn embedded_ipv4(ip: Ipv6Addr) -> Option<Ipv4Addr> {
    if let Some(v4) = ip.to_ipv4_mapped() {
        return Some(v4);
    }
    let seg = ip.segments();
    let low = |hi: u16, lo: u16| {
        let [a, b] = hi.to_be_bytes();
        let [c, d] = lo.to_be_bytes();
        Ipv4Addr::new(a, b, c, d)
    };
    if seg[..6] == [0, 0, 0, 0, 0, 0] && (seg[6] != 0 || seg[7] > 1) {
        return Some(low(seg[6], seg[7]));
    }
    if seg[..6] == [0x0064, 0xff9b, 0, 0, 0, 0] {
        return Some(low(seg[6], seg[7]));
    }
    if seg[0] == 0x2002 {
        return Some(low(seg[1], seg[2]));
    }
    None
}
