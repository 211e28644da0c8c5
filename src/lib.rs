//! HTTP load generation.
//!
//! A [`JobSpec`] describes the request to send, how many times (`N`) and
//! over how many concurrent workers (`C`). The [`Runner`] builds one shared
//! client, splits the `N` requests over the workers, times every request
//! phase (DNS, connect, write, server wait, read) and streams each
//! [`RequestResult`] to a [`Reporter`] as it completes.
//!
//! ```no_run
//! use volley::{ JobSpec, Report, OutputFormat, RequestTemplate, Runner };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> volley::Result<()> {
//! let mut job = JobSpec::new(RequestTemplate::get("http://localhost:8080/")?);
//! job.requests = 1000;
//! job.concurrency = 20;
//!
//! let report = Report::new(OutputFormat::Summary, job.requests);
//! Runner::new(job).run(report, CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod pool;
pub mod progress;
pub mod report;
pub mod runner;
pub mod sink;
pub mod throttle;
pub mod trace;
pub mod transport;

pub use error::{ Error, Result };
pub use executor::RequestResult;
pub use job::{ JobSpec, RateMode, RequestFn, RequestTemplate };
pub use report::{ OutputFormat, Report, Reporter };
pub use runner::{ RunState, Runner };
pub use sink::{ Results, Sink };
pub use transport::{ NameRoute, Transport, TransportPlan };
