//! Per-attempt phase instrumentation.
//!
//! A [`Trace`] is created for every request attempt and handed to whatever
//! observes the request lifecycle. The body reader runs on the HTTP agent's
//! thread while the executor replays transport metrics from the worker task,
//! so all phase instants live behind one mutex owned by the attempt.

use std::io;
use std::pin::Pin;
use std::sync::{ Arc, Mutex, PoisonError };
use std::task::{ ready, Context, Poll };
use std::time::{ Duration, Instant };
use bytes::Bytes;
use futures::io::{ AsyncRead, Cursor };

#[derive(Debug, Default, Clone, Copy)]
struct Phases {
    dns_start: Option<Instant>,
    dns_done: Option<Instant>,
    conn_start: Option<Instant>,
    conn_done: Option<Instant>,
    reused: bool,
    wrote_request: Option<Instant>,
    first_byte: Option<Instant>,
}

/// Phase durations of one finished attempt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    pub dns: Duration,
    pub conn: Duration, // DNS + dial (+ TLS), zero on a reused connection
    pub req: Duration, // request write
    pub delay: Duration, // server think time
    pub res: Duration, // response read
}

#[derive(Debug, Default)]
pub struct Trace {
    phases: Mutex<Phases>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dns_start(&self, at: Instant) {
        self.with(|p| p.dns_start = Some(at));
    }

    pub fn dns_done(&self, at: Instant) {
        self.with(|p| p.dns_done = Some(at));
    }

    pub fn get_conn(&self, at: Instant) {
        self.with(|p| p.conn_start = Some(at));
    }

    pub fn got_conn(&self, at: Instant, reused: bool) {
        self.with(|p| {
            p.conn_done = Some(at);
            p.reused = reused;
        });
    }

    pub fn wrote_request(&self, at: Instant) {
        self.with(|p| p.wrote_request = Some(at));
    }

    /// Records request write completion unless the body reader already did.
    pub fn wrote_request_at_least(&self, at: Instant) {
        self.with(|p| {
            p.wrote_request.get_or_insert(at);
        });
    }

    pub fn got_first_byte(&self, at: Instant) {
        self.with(|p| p.first_byte = Some(at));
    }

    /// Durations for an attempt that started at `start` and ended at `end`.
    ///
    /// Phase boundaries are clamped into `[start, end]` and forced to be
    /// monotonic, so each duration is non-negative and
    /// `conn + req + delay + res <= end - start`. Phases whose hooks never
    /// fired (e.g. the request failed before a response) come out as zero.
    pub fn timings(&self, start: Instant, end: Instant) -> Timings {
        let p = *self.phases.lock().unwrap_or_else(PoisonError::into_inner);
        let clamp = |t: Instant, floor: Instant| t.max(floor).min(end);

        let dns = match (p.dns_start, p.dns_done) {
            (Some(s), Some(d)) => d.saturating_duration_since(s),
            _ => Duration::ZERO,
        };

        let conn_start = clamp(p.conn_start.unwrap_or(start), start);
        let conn_done = clamp(p.conn_done.unwrap_or(conn_start), conn_start);
        let conn = if p.reused { Duration::ZERO } else { conn_done - conn_start };

        let (req, delay, res) = match p.first_byte {
            Some(first_byte) => {
                let wrote = clamp(p.wrote_request.unwrap_or(conn_done), conn_done);
                let first_byte = clamp(first_byte, wrote);
                (wrote - conn_done, first_byte - wrote, end - first_byte)
            }
            None => {
                let req = p.wrote_request
                    .map(|w| clamp(w, conn_done) - conn_done)
                    .unwrap_or_default();
                (req, Duration::ZERO, Duration::ZERO)
            }
        };

        Timings { dns, conn, req, delay, res }
    }

    fn with(&self, f: impl FnOnce(&mut Phases)) {
        f(&mut self.phases.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Request body that reports write completion to its [`Trace`] once the
/// transport has pulled the last byte.
pub struct TracedBody {
    cursor: Cursor<Bytes>,
    len: u64,
    trace: Arc<Trace>,
    reported: bool,
}

impl TracedBody {
    pub fn new(bytes: Bytes, trace: Arc<Trace>) -> Self {
        let len = bytes.len() as u64;
        Self { cursor: Cursor::new(bytes), len, trace, reported: false }
    }
}

impl AsyncRead for TracedBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8]
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let n = ready!(Pin::new(&mut this.cursor).poll_read(cx, buf))?;
        if !this.reported && this.cursor.position() >= this.len {
            this.reported = true;
            this.trace.wrote_request(Instant::now());
        }
        Poll::Ready(Ok(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::AsyncReadExt;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_timings_fresh_connection() {
        let start = Instant::now();
        let trace = Trace::new();
        trace.dns_start(start);
        trace.dns_done(start + ms(2));
        trace.get_conn(start);
        trace.got_conn(start + ms(5), false);
        trace.wrote_request(start + ms(6));
        trace.got_first_byte(start + ms(16));

        let t = trace.timings(start, start + ms(20));
        assert_eq!(t.dns, ms(2));
        assert_eq!(t.conn, ms(5));
        assert_eq!(t.req, ms(1));
        assert_eq!(t.delay, ms(10));
        assert_eq!(t.res, ms(4));
    }

    #[test]
    fn test_timings_reused_connection_has_no_setup() {
        let start = Instant::now();
        let trace = Trace::new();
        trace.get_conn(start);
        trace.got_conn(start + ms(1), true);
        trace.got_first_byte(start + ms(3));

        let t = trace.timings(start, start + ms(4));
        assert_eq!(t.conn, Duration::ZERO);
        assert_eq!(t.dns, Duration::ZERO);
        assert_eq!(t.req, Duration::ZERO);
        assert_eq!(t.delay, ms(2));
        assert_eq!(t.res, ms(1));
    }

    #[test]
    fn test_timings_never_exceed_total() {
        let start = Instant::now();
        let trace = Trace::new();
        trace.get_conn(start);
        trace.got_conn(start + ms(8), false);
        // body finished uploading after the server already answered
        trace.wrote_request(start + ms(9));
        trace.got_first_byte(start + ms(7));

        let end = start + ms(10);
        let t = trace.timings(start, end);
        assert!(t.conn + t.req + t.delay + t.res <= end - start);
        assert_eq!(t.delay, Duration::ZERO);
        assert_eq!(t.res, ms(1));
    }

    #[test]
    fn test_timings_failed_request() {
        let start = Instant::now();
        let trace = Trace::new();
        let t = trace.timings(start, start + ms(50));
        assert_eq!(t, Timings::default());
    }

    #[test]
    fn test_wrote_request_at_least_keeps_body_instant() {
        let start = Instant::now();
        let trace = Trace::new();
        trace.got_conn(start, false);
        trace.wrote_request(start + ms(3));
        trace.wrote_request_at_least(start);
        trace.got_first_byte(start + ms(5));

        let t = trace.timings(start, start + ms(5));
        assert_eq!(t.req, ms(3));
    }

    #[tokio::test]
    async fn test_traced_body_reports_write_completion() {
        let trace = Arc::new(Trace::new());
        let mut body = TracedBody::new(Bytes::from_static(b"payload"), Arc::clone(&trace));

        let before = Instant::now();
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"payload");

        trace.got_first_byte(Instant::now());
        let t = trace.timings(before, Instant::now());
        assert!(trace.phases.lock().unwrap().wrote_request.is_some());
        assert!(t.req <= Instant::now() - before);
    }
}
