use crate::error::{ Error, Result };
use crate::trace::{ Trace, TracedBody };

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use bytes::Bytes;
use isahc::{ AsyncBody, Request, http::{ header, HeaderMap, Method, Uri } };
use url::Url;

const DEFAULT_REQUESTS: usize = 200;
const DEFAULT_CONCURRENCY: usize = 50;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// How the configured QPS is applied across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateMode {
    /// Every worker gets its own gate, the observed total rate is `C * qps`
    #[default]
    PerWorker,
    /// One gate shared by all workers, the observed total rate is `qps`
    Aggregate,
}

/// Base request every attempt is cloned from.
#[derive(Debug, Clone)]
pub struct RequestTemplate {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
}

impl RequestTemplate {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self { method, uri, headers: HeaderMap::new() }
    }

    /// GET template for `url`.
    pub fn get(url: &str) -> Result<Self> {
        let uri = url.parse::<Uri>().map_err(|e| Error::Config(format!("invalid URL: {}", e)))?;
        Ok(Self::new(Method::GET, uri))
    }

    /// Host the request is addressed to: the `Host` header override if set,
    /// otherwise the URI authority.
    pub fn host(&self) -> String {
        if let Some(host) = self.headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
            return host.to_string();
        }
        self.uri
            .authority()
            .map(|a| a.as_str().to_string())
            .unwrap_or_default()
    }

    /// Fresh request for one attempt. Headers are copied, the body gets its own cursor.
    pub(crate) fn instantiate(&self, body: Option<&Bytes>, trace: &Arc<Trace>) -> Request<AsyncBody> {
        let mut request = Request::new(traced_body(body.cloned(), trace));
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = self.uri.clone();
        *request.headers_mut() = self.headers.clone();
        request
    }
}

/// Factory producing one request per attempt, used instead of cloning the template.
#[derive(Clone)]
pub struct RequestFn(Arc<dyn Fn() -> Request<Bytes> + Send + Sync>);

impl RequestFn {
    pub fn new<F>(f: F) -> Self where F: Fn() -> Request<Bytes> + Send + Sync + 'static {
        Self(Arc::new(f))
    }

    fn call(&self, trace: &Arc<Trace>) -> Request<AsyncBody> {
        let (parts, body) = (self.0)().into_parts();
        let body = if body.is_empty() { None } else { Some(body) };
        Request::from_parts(parts, traced_body(body, trace))
    }
}

impl fmt::Debug for RequestFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestFn(..)")
    }
}

/// Description of one load test. Read-only once handed to the runner.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub template: RequestTemplate,
    pub request_fn: Option<RequestFn>,
    pub body: Option<Bytes>,

    pub requests: usize, // N, total requests
    pub concurrency: usize, // C, number of workers
    pub qps: f64, // <= 0 is unlimited
    pub rate_mode: RateMode,
    pub timeout: Duration, // whole round trip, zero disables it

    pub insecure: bool, // skip certificate verification
    pub h2: bool,
    /// Ask for TLS session resumption. The libcurl transport keeps its own
    /// session cache and resumes whenever the server allows it, whatever this
    /// is set to.
    pub tls_resume: bool,
    pub disable_compression: bool,
    pub disable_keep_alives: bool,
    pub disable_redirects: bool,
    pub proxy: Option<Url>,
}

impl JobSpec {
    pub fn new(template: RequestTemplate) -> Self {
        Self {
            template,
            request_fn: None,
            body: None,
            requests: DEFAULT_REQUESTS,
            concurrency: DEFAULT_CONCURRENCY,
            qps: 0.0,
            rate_mode: RateMode::default(),
            timeout: DEFAULT_TIMEOUT,
            insecure: false,
            h2: false,
            tls_resume: false,
            disable_compression: false,
            disable_keep_alives: false,
            disable_redirects: false,
            proxy: None,
        }
    }

    /// Checks the invariants a run depends on.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".to_string()));
        }
        if self.qps.is_nan() {
            return Err(Error::Config("qps must be a number".to_string()));
        }
        Ok(())
    }

    /// Request for the next attempt, traced by `trace`.
    pub(crate) fn next_request(&self, trace: &Arc<Trace>) -> Request<AsyncBody> {
        match &self.request_fn {
            Some(request_fn) => request_fn.call(trace),
            None => self.template.instantiate(self.body.as_ref(), trace),
        }
    }
}

fn traced_body(body: Option<Bytes>, trace: &Arc<Trace>) -> AsyncBody {
    match body {
        Some(bytes) if !bytes.is_empty() => {
            let len = bytes.len() as u64;
            AsyncBody::from_reader_sized(TracedBody::new(bytes, Arc::clone(trace)), len)
        }
        _ => AsyncBody::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use isahc::http::HeaderValue;

    #[test]
    fn test_template_host_prefers_header_override() {
        let mut template = RequestTemplate::get("http://example.com:8080/path").unwrap();
        assert_eq!(template.host(), "example.com:8080");

        template.headers.insert(header::HOST, HeaderValue::from_static("override.test"));
        assert_eq!(template.host(), "override.test");
    }

    #[test]
    fn test_instantiate_copies_headers() {
        let mut template = RequestTemplate::get("http://example.com/").unwrap();
        template.headers.insert("x-test", HeaderValue::from_static("a"));
        let trace = Arc::new(Trace::new());

        let mut first = template.instantiate(None, &trace);
        first.headers_mut().insert("x-test", HeaderValue::from_static("changed"));
        let second = template.instantiate(None, &trace);

        assert_eq!(second.headers()["x-test"], "a");
        assert_eq!(template.headers["x-test"], "a");
        assert_eq!(second.method(), Method::GET);
        assert_eq!(second.uri(), "http://example.com/");
    }

    #[test]
    fn test_instantiate_sizes_body() {
        let template = RequestTemplate::new(Method::POST, "http://example.com/".parse().unwrap());
        let trace = Arc::new(Trace::new());
        let body = Bytes::from_static(b"hello");

        let request = template.instantiate(Some(&body), &trace);
        assert_eq!(request.body().len(), Some(5));

        let empty = template.instantiate(None, &trace);
        assert!(empty.body().is_empty());
    }

    #[test]
    fn test_request_fn_takes_precedence() {
        let mut job = JobSpec::new(RequestTemplate::get("http://example.com/").unwrap());
        job.request_fn = Some(
            RequestFn::new(|| {
                Request::put("http://other.test/upload").body(Bytes::from_static(b"xyz")).unwrap()
            })
        );
        let trace = Arc::new(Trace::new());

        let request = job.next_request(&trace);
        assert_eq!(request.method(), Method::PUT);
        assert_eq!(request.uri(), "http://other.test/upload");
        assert_eq!(request.body().len(), Some(3));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut job = JobSpec::new(RequestTemplate::get("http://example.com/").unwrap());
        assert!(job.validate().is_ok());

        job.concurrency = 0;
        assert!(matches!(job.validate(), Err(Error::Config(_))));
    }
}
