use crate::error::{ Error, Result };
use crate::job::JobSpec;
use crate::pool::{ run_workers, WorkerContext };
use crate::progress::Progress;
use crate::report::Reporter;
use crate::sink::{ Results, Sink };
use crate::throttle::Throttle;
use crate::transport::{ Transport, TransportPlan };

use std::io::{ self, Write };
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Initializing,
    Running,
    Draining,
    Finished,
}

/// Load controller: owns the job and drives one run from start to report.
pub struct Runner {
    job: Arc<JobSpec>,
    sink: Option<Sink>,
    results: Option<Results>,
    writer: Box<dyn Write + Send>,
    progress: bool,
    state: watch::Sender<RunState>,
}

impl Runner {
    /// Create a new Runner instance. Nothing is allocated for the run yet.
    pub fn new(job: JobSpec) -> Self {
        let (state, _) = watch::channel(RunState::Idle);
        Self {
            job: Arc::new(job),
            sink: None,
            results: None,
            writer: Box::new(io::stdout()),
            progress: false,
            state,
        }
    }

    /// Where the report goes. Defaults to stdout.
    pub fn with_writer(mut self, writer: impl Write + Send + 'static) -> Self {
        self.writer = Box::new(writer);
        self
    }

    /// Show a spinner on stderr while requests are in flight.
    pub fn with_progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    pub fn job(&self) -> &JobSpec {
        &self.job
    }

    pub fn state(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /// Creates the result sink. Only the first call has an effect.
    pub fn init(&mut self) {
        if self.sink.is_none() && self.results.is_none() {
            let (sink, results) = Sink::open(self.job.concurrency);
            self.sink = Some(sink);
            self.results = Some(results);
        }
    }

    /// Makes all the requests and hands the report to `reporter`. Blocks
    /// until every worker has returned and the reporter has drained the sink.
    ///
    /// Configuration problems are returned before any request is sent.
    /// Cancelling `cancel` stops workers from starting new requests; requests
    /// already in flight still finish and are reported.
    pub async fn run<R: Reporter>(mut self, reporter: R, cancel: CancellationToken) -> Result<R> {
        self.set_state(RunState::Initializing);
        self.job.validate()?;
        let transport = Transport::build(TransportPlan::from_job(&self.job)?)?;
        let throttle = Throttle::new(self.job.qps, self.job.rate_mode);

        self.init();
        let (mut sink, results) = match (self.sink.take(), self.results.take()) {
            (Some(sink), Some(results)) => (sink, results),
            _ => {
                return Err(Error::Config("result sink already handed out".to_string()));
            }
        };
        let producer = sink
            .producer()
            .ok_or_else(|| Error::Config("result sink already closed".to_string()))?;

        let run_start = Instant::now();
        // the reporter is draining before the first request goes out
        let drain = tokio::spawn(drain(reporter, results));

        self.set_state(RunState::Running);
        let progress = self.progress.then(|| Progress::start("Testing in progress..."));
        let ctx = WorkerContext {
            job: Arc::clone(&self.job),
            transport,
            throttle,
            run_start,
            cancel,
        };
        run_workers(ctx, producer).await;
        if let Some(progress) = progress {
            progress.stop();
        }

        self.set_state(RunState::Draining);
        sink.close();
        let total = run_start.elapsed();
        let mut reporter = drain.await.map_err(|e| Error::Reporter(e.to_string()))?;

        self.set_state(RunState::Finished);
        reporter.finalize(total, &mut self.writer)?;
        Ok(reporter)
    }

    fn set_state(&self, state: RunState) {
        debug!(?state, "run state");
        self.state.send_replace(state);
    }
}

async fn drain<R: Reporter>(mut reporter: R, mut results: Results) -> R {
    while let Some(result) = results.recv().await {
        reporter.record(result);
    }
    reporter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RequestTemplate;
    use crate::RequestResult;
    use std::time::Duration;

    #[derive(Default)]
    struct Count {
        seen: usize,
        finalized: bool,
    }

    impl Reporter for Count {
        fn record(&mut self, _result: RequestResult) {
            self.seen += 1;
        }

        fn finalize(&mut self, _total: Duration, out: &mut dyn Write) -> io::Result<()> {
            self.finalized = true;
            writeln!(out, "{}", self.seen)
        }
    }

    fn job() -> JobSpec {
        JobSpec::new(RequestTemplate::get("http://127.0.0.1:9/").unwrap())
    }

    #[test]
    fn test_init_creates_sink_once() {
        let mut runner = Runner::new(job());
        assert!(runner.sink.is_none());

        runner.init();
        let first = runner.sink.as_ref().and_then(Sink::producer).unwrap();
        runner.init();
        assert!(runner.sink.is_some() && runner.results.is_some());

        // the second call must not have replaced the channel the first producer feeds
        let mut results = runner.results.take().unwrap();
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            assert!(first.push(RequestResult::default()).await);
            assert!(results.recv().await.is_some());
        });
    }

    #[tokio::test]
    async fn test_zero_requests_finishes() {
        let mut job = job();
        job.requests = 0;
        job.concurrency = 3;
        let runner = Runner::new(job).with_writer(io::sink());
        let state = runner.state();

        let count = runner.run(Count::default(), CancellationToken::new()).await.unwrap();
        assert_eq!(count.seen, 0);
        assert!(count.finalized);
        assert_eq!(*state.borrow(), RunState::Finished);
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_running() {
        let mut job = job();
        job.concurrency = 0;
        let runner = Runner::new(job).with_writer(io::sink());
        let state = runner.state();

        let err = runner.run(Count::default(), CancellationToken::new()).await.err().unwrap();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(*state.borrow(), RunState::Initializing);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_sends_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = Runner::new(job()).with_writer(io::sink());

        let count = runner.run(Count::default(), cancel).await.unwrap();
        assert_eq!(count.seen, 0);
        assert!(count.finalized);
    }
}
