use crate::error::Error;
use crate::job::JobSpec;
use crate::trace::{ Timings, Trace };
use crate::transport::Transport;

use std::sync::Arc;
use std::time::{ Duration, Instant };
use futures::io::sink;
use isahc::{ AsyncReadResponseExt, Metrics, ResponseExt, http::StatusCode };
use tracing::trace;

/// Outcome of one request attempt.
#[derive(Debug, Default)]
pub struct RequestResult {
    pub error: Option<Error>, // None on success
    pub status: Option<StatusCode>, // None when no response arrived
    pub offset: Duration, // start, relative to the run start
    pub duration: Duration, // whole round trip including the body

    pub conn_duration: Duration, // connection setup (DNS lookup + dial + TLS), zero when reused
    pub dns_duration: Duration, // DNS lookup
    pub req_duration: Duration, // request "write"
    pub res_duration: Duration, // response "read"
    pub delay_duration: Duration, // between request written and first response byte

    pub content_length: u64, // body bytes read
}

impl RequestResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn is_timeout(&self) -> bool {
        self.error.as_ref().is_some_and(Error::is_timeout)
    }

    /// Time from start to first response byte.
    pub fn time_to_first_byte(&self) -> Duration {
        self.duration.saturating_sub(self.res_duration)
    }
}

/// Sends one request through the shared client and measures it.
pub async fn make_request(job: &JobSpec, transport: &Transport, run_start: Instant) -> RequestResult {
    let tracer = Arc::new(Trace::new());
    let mut request = job.next_request(&tracer);
    transport.route(&mut request);

    let start = Instant::now();
    let mut status = None;
    let mut size = 0;
    let mut error = None;

    match transport.client().send_async(request).await {
        Ok(mut response) => {
            let headers_at = Instant::now();
            let reused = transport.connection_reused(response.local_addr(), response.remote_addr());
            status = Some(response.status());

            match response.copy_to(sink()).await {
                Ok(n) => {
                    size = n;
                }
                Err(err) => {
                    error = Some(Error::Io(err));
                }
            }
            let times = response.metrics().map(MetricTimes::from);
            replay(&tracer, start, headers_at, times, reused);
        }
        Err(err) => {
            error = Some(Error::Http(err));
        }
    }

    let end = Instant::now();
    let Timings { dns, conn, req, delay, res } = tracer.timings(start, end);

    trace!(status = ?status, size, elapsed = ?(end - start), failed = error.is_some(), "request done");

    RequestResult {
        error,
        status,
        offset: start.saturating_duration_since(run_start),
        duration: end - start,
        conn_duration: conn,
        dns_duration: dns,
        req_duration: req,
        res_duration: res,
        delay_duration: delay,
        content_length: size,
    }
}

/// Phase durations as the transport reports them. Each one covers only its own
/// phase except `transfer_start`, which runs from the request start.
#[derive(Debug, Default, Clone, Copy)]
struct MetricTimes {
    name_lookup: Duration,
    connect: Duration,
    secure_connect: Duration,
    transfer_start: Duration,
}

impl From<&Metrics> for MetricTimes {
    fn from(metrics: &Metrics) -> Self {
        Self {
            name_lookup: metrics.name_lookup_time(),
            connect: metrics.connect_time(),
            secure_connect: metrics.secure_connect_time(),
            transfer_start: metrics.transfer_start_time(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PhaseMarks {
    dns_done: Instant,
    conn_ready: Instant,
    first_byte: Instant,
}

fn phase_marks(start: Instant, times: MetricTimes, headers_at: Instant) -> PhaseMarks {
    let dns_done = start + times.name_lookup;
    let conn_ready = dns_done + times.connect + times.secure_connect;
    // never later than the worker saw the response head
    let first_byte = if times.transfer_start.is_zero() {
        headers_at
    } else {
        (start + times.transfer_start).min(headers_at)
    };
    PhaseMarks { dns_done, conn_ready, first_byte }
}

// Feeds the transport's phase metrics into the attempt's trace hooks.
fn replay(tracer: &Trace, start: Instant, headers_at: Instant, times: Option<MetricTimes>, reused: bool) {
    tracer.get_conn(start);

    let marks = phase_marks(start, times.unwrap_or_default(), headers_at);
    let conn_ready = match times {
        Some(_) if !reused => {
            tracer.dns_start(start);
            tracer.dns_done(marks.dns_done);
            marks.conn_ready
        }
        _ => start,
    };
    tracer.got_conn(conn_ready, reused);

    // without a body the request is on the wire as soon as the connection is
    tracer.wrote_request_at_least(conn_ready);
    tracer.got_first_byte(marks.first_byte);
}
