use crate::error::{ Error, Result };
use crate::job::JobSpec;

use std::collections::HashMap;
use std::net::{ IpAddr, SocketAddr, ToSocketAddrs };
use std::sync::{ Arc, Mutex, PoisonError };
use std::time::Duration;
use isahc::{
    HttpClient,
    HttpClientBuilder,
    config::{ Configurable, RedirectPolicy, ResolveMap, SslOption, VersionNegotiation },
    http::{ header, uri::Authority, Request, Uri },
};
use tracing::debug;

const MAX_IDLE_CONN: usize = 500; // ceiling for cached idle connections per host
const MAX_REDIRECTS: u32 = 10;

/// Everything the shared client is built from, derived once per run.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportPlan {
    pub name_route: Option<NameRoute>,
    pub accept_invalid_certs: bool,
    pub max_idle_per_host: usize,
    pub tracked_connections: usize, // live connections at most: busy workers plus idle cache
    pub http2: bool,
    pub compression: bool,
    pub keep_alive: bool,
    pub proxy: Option<Uri>,
    pub follow_redirects: bool,
    pub timeout: Option<Duration>,
}

impl TransportPlan {
    pub fn from_job(job: &JobSpec) -> Result<Self> {
        let proxy = match &job.proxy {
            Some(url) =>
                Some(
                    url
                        .as_str()
                        .parse::<Uri>()
                        .map_err(|_| Error::InvalidProxy(url.to_string()))?
                ),
            None => None,
        };

        // through a proxy the proxy resolves the target, so the name is left alone
        let name_route = match proxy {
            Some(_) => None,
            None => NameRoute::for_job(job)?,
        };
        let max_idle_per_host = job.concurrency.min(MAX_IDLE_CONN);

        Ok(Self {
            name_route,
            accept_invalid_certs: job.insecure,
            max_idle_per_host,
            tracked_connections: job.concurrency.max(1) + max_idle_per_host,
            http2: job.h2,
            compression: !job.disable_compression,
            keep_alive: !job.disable_keep_alives,
            proxy,
            follow_redirects: !job.disable_redirects,
            timeout: (!job.timeout.is_zero()).then_some(job.timeout),
        })
    }
}

/// Presents `server_name` (TLS SNI and URL host) on requests for `target`
/// while still dialing `target`'s address. Used when the `Host` header names
/// a different server than the URL does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRoute {
    pub target: String,
    pub server_name: String,
    pub port: u16,
    pub addr: IpAddr,
    authority: Authority,
}

impl NameRoute {
    fn for_job(job: &JobSpec) -> Result<Option<Self>> {
        let uri = &job.template.uri;
        let Some(target) = uri.host().map(bare_host) else {
            return Ok(None);
        };
        if !job.template.headers.contains_key(header::HOST) {
            return Ok(None);
        }
        let host = job.template.host();
        let name = bare_host(server_name(&host));
        if name.is_empty() || name.eq_ignore_ascii_case(target) {
            return Ok(None);
        }

        let port = effective_port(uri);
        let authority = if name.contains(':') {
            format!("[{}]:{}", name, port)
        } else {
            format!("{}:{}", name, port)
        };
        let authority = authority
            .parse::<Authority>()
            .map_err(|e| Error::Config(format!("invalid server name \"{}\": {}", name, e)))?;

        Ok(
            Some(Self {
                target: target.to_ascii_lowercase(),
                server_name: name.to_ascii_lowercase(),
                port,
                addr: resolve(target, port)?,
                authority,
            })
        )
    }

    fn matches(&self, uri: &Uri) -> bool {
        uri.host().is_some_and(|h| bare_host(h).eq_ignore_ascii_case(&self.target)) &&
            effective_port(uri) == self.port
    }
}

// Remembers the (local, remote) pairs of recently used connections, keeping
// no more than the transport can hold open at once.
#[derive(Debug)]
struct ConnRegistry {
    last_seen: HashMap<(SocketAddr, SocketAddr), u64>,
    clock: u64,
    keep: usize,
}

impl ConnRegistry {
    fn new(keep: usize) -> Self {
        Self { last_seen: HashMap::new(), clock: 0, keep: keep.max(1) }
    }

    // true when the pair was already known
    fn touch(&mut self, pair: (SocketAddr, SocketAddr)) -> bool {
        self.clock += 1;
        let known = self.last_seen.insert(pair, self.clock).is_some();
        if self.last_seen.len() > self.keep * 2 {
            let cutoff = self.clock - (self.keep as u64);
            self.last_seen.retain(|_, seen| *seen > cutoff);
        }
        known
    }

    fn len(&self) -> usize {
        self.last_seen.len()
    }
}

/// Shared HTTP client for a whole run. Cheap to clone, safe to use from every worker.
#[derive(Debug, Clone)]
pub struct Transport {
    client: HttpClient,
    plan: Arc<TransportPlan>,
    seen: Arc<Mutex<ConnRegistry>>,
}

impl Transport {
    pub fn build(plan: TransportPlan) -> Result<Self> {
        let mut builder = HttpClientBuilder::new()
            .metrics(true)
            .automatic_decompression(plan.compression)
            .redirect_policy(if plan.follow_redirects {
                RedirectPolicy::Limit(MAX_REDIRECTS)
            } else {
                RedirectPolicy::None
            })
            .version_negotiation(if plan.http2 {
                VersionNegotiation::latest_compatible()
            } else {
                VersionNegotiation::http11()
            });

        if plan.accept_invalid_certs {
            builder = builder.ssl_options(
                SslOption::DANGER_ACCEPT_INVALID_CERTS | SslOption::DANGER_ACCEPT_INVALID_HOSTS
            );
        }

        if plan.keep_alive {
            builder = builder.connection_cache_size(plan.max_idle_per_host);
        } else {
            builder = builder.connection_cache_size(0).default_header("connection", "close");
        }

        if let Some(timeout) = plan.timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(proxy) = plan.proxy.clone() {
            builder = builder.proxy(Some(proxy));
        }

        if let Some(route) = &plan.name_route {
            builder = builder.dns_resolve(
                ResolveMap::new().add(&route.server_name, route.port, route.addr)
            );
        }

        let client = builder.build()?;

        debug!(
            server_name = ?plan.name_route.as_ref().map(|r| r.server_name.as_str()),
            http2 = plan.http2,
            keep_alive = plan.keep_alive,
            proxy = ?plan.proxy,
            "transport ready"
        );

        Ok(Self {
            client,
            seen: Arc::new(Mutex::new(ConnRegistry::new(plan.tracked_connections))),
            plan: Arc::new(plan),
        })
    }

    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    pub fn plan(&self) -> &TransportPlan {
        &self.plan
    }

    /// Points a request for the target host at the overriding server name.
    /// Requests for any other host are left untouched.
    pub fn route<B>(&self, request: &mut Request<B>) {
        let Some(route) = &self.plan.name_route else {
            return;
        };
        if !route.matches(request.uri()) {
            return;
        }
        let mut parts = request.uri().clone().into_parts();
        parts.authority = Some(route.authority.clone());
        if let Ok(uri) = Uri::from_parts(parts) {
            *request.uri_mut() = uri;
        }
    }

    /// Registers the connection a response arrived on and reports whether it
    /// had been used before.
    pub(crate) fn connection_reused(
        &self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>
    ) -> bool {
        if !self.plan.keep_alive {
            return false;
        }
        match (local, remote) {
            (Some(local), Some(remote)) =>
                self.seen
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .touch((local, remote)),
            _ => false,
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Config(format!("cannot resolve {}: {}", host, e)))?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| Error::Config(format!("no address for {}", host)))
}

fn effective_port(uri: &Uri) -> u16 {
    uri.port_u16().unwrap_or(if uri.scheme_str() == Some("https") { 443 } else { 80 })
}

// IPv6 literals without their brackets
fn bare_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

/// TLS server name for `host`: the host without its port. Strings that do not
/// split into host and port are used as they are.
pub fn server_name(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return match rest.split_once("]:") {
            Some((name, _)) if !name.is_empty() => name,
            _ => host,
        };
    }
    match host.split_once(':') {
        Some((name, port)) if !name.is_empty() && !port.contains(':') => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RequestTemplate;
    use isahc::http::HeaderValue;
    use url::Url;

    fn job(url: &str) -> JobSpec {
        JobSpec::new(RequestTemplate::get(url).unwrap())
    }

    #[test]
    fn test_server_name_strips_port() {
        assert_eq!(server_name("example.com:8443"), "example.com");
        assert_eq!(server_name("[::1]:443"), "::1");
    }

    #[test]
    fn test_server_name_falls_back_to_raw_host() {
        assert_eq!(server_name("example.com"), "example.com");
        assert_eq!(server_name("::1"), "::1");
        assert_eq!(server_name("[::1]"), "[::1]");
        assert_eq!(server_name(":80"), ":80");
        assert_eq!(server_name(""), "");
    }

    #[test]
    fn test_plan_defaults() {
        let plan = TransportPlan::from_job(&job("https://example.com:8443/")).unwrap();
        assert_eq!(plan.name_route, None);
        assert_eq!(plan.max_idle_per_host, 50);
        assert_eq!(plan.tracked_connections, 100);
        assert!(plan.keep_alive);
        assert!(plan.compression);
        assert!(plan.follow_redirects);
        assert!(!plan.http2);
        assert_eq!(plan.timeout, Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_plan_switches() {
        let mut job = job("https://example.com/");
        job.concurrency = 2000;
        job.insecure = true;
        job.h2 = true;
        job.disable_compression = true;
        job.disable_keep_alives = true;
        job.disable_redirects = true;
        job.timeout = Duration::ZERO;

        let plan = TransportPlan::from_job(&job).unwrap();
        assert_eq!(plan.max_idle_per_host, MAX_IDLE_CONN);
        assert!(plan.accept_invalid_certs);
        assert!(plan.http2);
        assert!(!plan.compression);
        assert!(!plan.keep_alive);
        assert!(!plan.follow_redirects);
        assert_eq!(plan.timeout, None);
    }

    #[test]
    fn test_plan_proxy() {
        let mut job = job("http://example.com/");
        job.proxy = Some(Url::parse("http://proxy.local:3128").unwrap());

        let plan = TransportPlan::from_job(&job).unwrap();
        assert_eq!(plan.proxy.unwrap().host(), Some("proxy.local"));
    }

    #[test]
    fn test_plan_rejects_unusable_proxy() {
        let mut job = job("http://example.com/");
        job.proxy = Some(Url::parse("data:text/plain,not a proxy").unwrap());

        assert!(matches!(TransportPlan::from_job(&job), Err(Error::InvalidProxy(_))));
    }

    #[test]
    fn test_connection_reuse_registry() {
        let transport = Transport::build(TransportPlan::from_job(&job("http://example.com/")).unwrap()).unwrap();
        let local: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:80".parse().unwrap();

        assert!(!transport.connection_reused(Some(local), Some(remote)));
        assert!(transport.connection_reused(Some(local), Some(remote)));
        assert!(!transport.connection_reused(None, Some(remote)));
    }

    #[test]
    fn test_connection_registry_forgets_old_connections() {
        let remote: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let pair = |port: u16| (SocketAddr::from(([127, 0, 0, 1], port)), remote);
        let mut registry = ConnRegistry::new(2);

        for port in 50000..50005 {
            assert!(!registry.touch(pair(port)));
        }
        // only the two most recent survive the sweep
        assert_eq!(registry.len(), 2);
        assert!(registry.touch(pair(50004)));
        assert!(!registry.touch(pair(50000)));

        for round in 0..1000 {
            registry.touch(pair(40000 + (round % 7)));
        }
        assert!(registry.len() <= 4);
    }

    #[test]
    fn test_registry_is_sized_by_concurrency() {
        let mut job = job("http://example.com/");
        job.concurrency = 1;
        let plan = TransportPlan::from_job(&job).unwrap();
        assert_eq!(plan.tracked_connections, 2);
    }

    fn overridden(url: &str, host: &'static str) -> JobSpec {
        let mut job = job(url);
        job.template.headers.insert(header::HOST, HeaderValue::from_static(host));
        job
    }

    #[test]
    fn test_host_override_routes_server_name() {
        let job = overridden("https://127.0.0.1:8443/", "api.internal:9000");
        let plan = TransportPlan::from_job(&job).unwrap();

        let route = plan.name_route.clone().unwrap();
        assert_eq!(route.target, "127.0.0.1");
        assert_eq!(route.server_name, "api.internal");
        assert_eq!(route.port, 8443);
        assert_eq!(route.addr, IpAddr::from([127, 0, 0, 1]));

        let transport = Transport::build(plan).unwrap();
        let mut request = Request::get("https://127.0.0.1:8443/items?page=2").body(()).unwrap();
        transport.route(&mut request);
        assert_eq!(request.uri(), "https://api.internal:8443/items?page=2");

        // other hosts and ports keep their URI
        let mut other = Request::get("https://127.0.0.1:9443/").body(()).unwrap();
        transport.route(&mut other);
        assert_eq!(other.uri(), "https://127.0.0.1:9443/");
        let mut elsewhere = Request::get("https://example.com:8443/").body(()).unwrap();
        transport.route(&mut elsewhere);
        assert_eq!(elsewhere.uri(), "https://example.com:8443/");
    }

    #[test]
    fn test_no_route_without_a_different_name() {
        let plan = TransportPlan::from_job(&overridden("http://[::1]:8080/", "[::1]:8080")).unwrap();
        assert_eq!(plan.name_route, None);

        let plan = TransportPlan::from_job(&overridden("http://localhost/", "LOCALHOST")).unwrap();
        assert_eq!(plan.name_route, None);

        let mut proxied = overridden("http://127.0.0.1/", "api.internal");
        proxied.proxy = Some(Url::parse("http://proxy.local:3128").unwrap());
        assert_eq!(TransportPlan::from_job(&proxied).unwrap().name_route, None);
    }

    #[test]
    fn test_route_to_ipv6_server_name() {
        let plan = TransportPlan::from_job(&overridden("http://127.0.0.1/", "[::1]")).unwrap();
        let route = plan.name_route.unwrap();
        assert_eq!(route.server_name, "::1");
        assert_eq!(route.port, 80);
        assert_eq!(route.authority.as_str(), "[::1]:80");
    }
}
