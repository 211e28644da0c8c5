use crate::error::{ Error, Result };
use crate::job::{ JobSpec, RateMode, RequestTemplate };
use crate::report::OutputFormat;

use std::path::PathBuf;
use std::time::Duration;
use bytes::Bytes;
use clap::{ Parser, ValueEnum };
use isahc::http::{ header, HeaderName, HeaderValue, Method, Uri };
use url::Url;

// Error messages
const ERR_INVALID_URL: &str = "Invalid URL";
const ERR_INVALID_METHOD: &str = "Invalid HTTP method";
const ERR_INVALID_HEADER: &str = "Invalid header, expected \"Name: value\"";
const ERR_INVALID_REQUESTS_AND_CONCURRENCY: &str = "Number of requests must be >= concurrency";
const ERR_BODY_AND_BODY_FILE: &str = "Only one of -d and -D may be given";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Output {
    Csv,
}

/// Command line options
#[derive(Parser, Debug, Clone)]
#[command(name = "volley", version, about = "Send some load to a web application.")]
pub struct Config {
    /// URL to test
    pub url: String,

    /// Number of requests to run
    #[arg(short = 'n', long = "requests", default_value_t = 200)]
    pub requests: usize,

    /// Number of workers to run concurrently
    #[arg(short = 'c', long = "concurrency", default_value_t = 50)]
    pub concurrency: usize,

    /// Rate limit, in queries per second, applied to each worker
    #[arg(short = 'q', long = "qps", default_value_t = 0.0)]
    pub qps: f64,

    /// Apply the rate limit to all workers together instead of to each one
    #[arg(long = "aggregate-qps")]
    pub aggregate_qps: bool,

    /// Timeout for each request in seconds, 0 for infinite
    #[arg(short = 't', long = "timeout", default_value_t = 20)]
    pub timeout: u64,

    /// HTTP method
    #[arg(short = 'm', long = "method", default_value = "GET")]
    pub method: String,

    /// Custom HTTP header, repeatable ("Name: value")
    #[arg(short = 'H', long = "header")]
    pub headers: Vec<String>,

    /// HTTP Accept header
    #[arg(short = 'A', long = "accept")]
    pub accept: Option<String>,

    /// HTTP request body
    #[arg(short = 'd', long = "body")]
    pub body: Option<String>,

    /// HTTP request body from file
    #[arg(short = 'D', long = "body-file")]
    pub body_file: Option<PathBuf>,

    /// Content-type
    #[arg(short = 'T', long = "content-type", default_value = "text/html")]
    pub content_type: String,

    /// HTTP proxy address as host:port or URL
    #[arg(short = 'x', long = "proxy")]
    pub proxy: Option<String>,

    /// HTTP Host header
    #[arg(long = "host")]
    pub host: Option<String>,

    /// Output type; the summary is printed if not given
    #[arg(short = 'o', long = "output", value_enum)]
    pub output: Option<Output>,

    /// Skip TLS certificate verification
    #[arg(short = 'k', long = "insecure")]
    pub insecure: bool,

    /// Enable HTTP/2
    #[arg(long = "h2")]
    pub h2: bool,

    /// Accepted for compatibility; TLS sessions are always resumed when the server allows it
    #[arg(long = "tls-resume")]
    pub tls_resume: bool,

    /// Disable compression
    #[arg(long = "disable-compression")]
    pub disable_compression: bool,

    /// Disable keep-alive, prevents re-use of TCP connections between requests
    #[arg(long = "disable-keepalive")]
    pub disable_keepalive: bool,

    /// Disable following of HTTP redirects
    #[arg(long = "disable-redirects")]
    pub disable_redirects: bool,

    /// Number of runtime threads (defaults to the number of cores)
    #[arg(long = "cpus")]
    pub threads: Option<usize>,

    /// Do not draw the progress spinner
    #[arg(long = "no-progress")]
    pub no_progress: bool,
}

impl Config {
    pub fn output_format(&self) -> OutputFormat {
        match self.output {
            Some(Output::Csv) => OutputFormat::Csv,
            None => OutputFormat::Summary,
        }
    }

    /// Builds the job described by the command line.
    pub fn to_job(&self) -> Result<JobSpec> {
        if self.requests == 0 || self.concurrency == 0 {
            return Err(Error::Config("-n and -c must be greater than zero".to_string()));
        }
        if self.requests < self.concurrency {
            return Err(Error::Config(ERR_INVALID_REQUESTS_AND_CONCURRENCY.to_string()));
        }

        let url = Url::parse(&self.url).map_err(|e|
            Error::Config(format!("\"{}\": {}: {}", self.url, ERR_INVALID_URL, e))
        )?;
        let uri = url
            .as_str()
            .parse::<Uri>()
            .map_err(|e| Error::Config(format!("\"{}\": {}: {}", self.url, ERR_INVALID_URL, e)))?;
        let method = Method::from_bytes(self.method.to_uppercase().as_bytes()).map_err(|_|
            Error::Config(format!("{}: {}", ERR_INVALID_METHOD, self.method))
        )?;

        let mut template = RequestTemplate::new(method, uri);
        template.headers.insert(header::CONTENT_TYPE, header_value(&self.content_type)?);
        for raw in &self.headers {
            let (name, value) = parse_header(raw)?;
            template.headers.append(name, value);
        }
        if let Some(accept) = &self.accept {
            template.headers.insert(header::ACCEPT, header_value(accept)?);
        }
        if let Some(host) = &self.host {
            template.headers.insert(header::HOST, header_value(host)?);
        }

        let mut job = JobSpec::new(template);
        job.body = self.read_body()?;
        job.requests = self.requests;
        job.concurrency = self.concurrency;
        job.qps = self.qps;
        job.rate_mode = if self.aggregate_qps { RateMode::Aggregate } else { RateMode::PerWorker };
        job.timeout = Duration::from_secs(self.timeout);
        job.insecure = self.insecure;
        job.h2 = self.h2;
        job.tls_resume = self.tls_resume;
        job.disable_compression = self.disable_compression;
        job.disable_keep_alives = self.disable_keepalive;
        job.disable_redirects = self.disable_redirects;
        job.proxy = self.proxy.as_deref().map(parse_proxy).transpose()?;
        Ok(job)
    }

    fn read_body(&self) -> Result<Option<Bytes>> {
        match (&self.body, &self.body_file) {
            (Some(_), Some(_)) => Err(Error::Config(ERR_BODY_AND_BODY_FILE.to_string())),
            (Some(body), None) => Ok(Some(Bytes::from(body.clone()))),
            (None, Some(path)) => Ok(Some(Bytes::from(std::fs::read(path)?))),
            (None, None) => Ok(None),
        }
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| Error::Config(format!("{}: {}", ERR_INVALID_HEADER, value)))
}

// "Name: value"
fn parse_header(raw: &str) -> Result<(HeaderName, HeaderValue)> {
    let invalid = || Error::Config(format!("{}: {}", ERR_INVALID_HEADER, raw));
    let (name, value) = raw.split_once(':').ok_or_else(invalid)?;
    let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|_| invalid())?;
    let value = HeaderValue::from_str(value.trim()).map_err(|_| invalid())?;
    Ok((name, value))
}

// bare host:port gets an http scheme
fn parse_proxy(raw: &str) -> Result<Url> {
    let with_scheme = if raw.contains("://") { raw.to_string() } else { format!("http://{}", raw) };
    Url::parse(&with_scheme).map_err(|_| Error::InvalidProxy(raw.to_string()))
}
