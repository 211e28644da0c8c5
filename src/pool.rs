use crate::executor::make_request;
use crate::job::JobSpec;
use crate::sink::Producer;
use crate::throttle::Throttle;
use crate::transport::Transport;

use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{ debug, warn };

/// State every worker reads from; nothing in it changes during a run.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub job: Arc<JobSpec>,
    pub transport: Transport,
    pub throttle: Throttle,
    pub run_start: Instant,
    pub cancel: CancellationToken,
}

/// Splits `n` requests over `c` workers. Shares sum to `n` and differ by at most one.
pub fn shares(n: usize, c: usize) -> Vec<usize> {
    if c == 0 {
        return Vec::new();
    }
    let mut left = n;
    let mut out = Vec::with_capacity(c);
    for i in 0..c - 1 {
        let share = left / (c - i);
        left -= share;
        out.push(share);
    }
    out.push(left);
    out
}

/// Runs all workers concurrently and returns once every one of them has returned.
pub async fn run_workers(ctx: WorkerContext, producer: Producer) {
    let shares = shares(ctx.job.requests, ctx.job.concurrency);
    let mut workers = JoinSet::new();

    for (id, n) in shares.into_iter().enumerate() {
        let ctx = ctx.clone();
        let producer = producer.clone();
        workers.spawn(async move { run_worker(id, &ctx, n, producer).await });
    }
    drop(producer);

    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            warn!(error = %err, "worker did not finish cleanly");
        }
    }
}

/// Issues `n` requests one after another, stopping early on cancellation.
async fn run_worker(id: usize, ctx: &WorkerContext, n: usize, producer: Producer) {
    debug!(worker_id = id, share = n, "worker started");
    let mut gate = ctx.throttle.gate();
    let mut sent = 0;

    for _ in 0..n {
        if ctx.cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => { break; }
            _ = gate.wait() => {}
        }

        let result = make_request(&ctx.job, &ctx.transport, ctx.run_start).await;
        sent += 1;
        if !producer.push(result).await {
            // reporter is gone, nobody would see further results
            break;
        }
    }
    debug!(worker_id = id, sent, "worker stopped");
}
