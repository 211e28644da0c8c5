use crate::job::RateMode;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{ interval_at, Instant, Interval, MissedTickBehavior };

/// Rate limit shared by the pool, hands out one [`Gate`] per worker.
#[derive(Debug, Clone)]
pub enum Throttle {
    Unlimited,
    PerWorker(Duration),
    Aggregate(Arc<Mutex<Interval>>),
}

impl Throttle {
    /// Must be called inside a tokio runtime when `qps > 0`.
    pub fn new(qps: f64, mode: RateMode) -> Self {
        match (period(qps), mode) {
            (None, _) => Throttle::Unlimited,
            (Some(period), RateMode::PerWorker) => Throttle::PerWorker(period),
            (Some(period), RateMode::Aggregate) =>
                Throttle::Aggregate(Arc::new(Mutex::new(ticker(period)))),
        }
    }

    pub fn gate(&self) -> Gate {
        match self {
            Throttle::Unlimited => Gate::Open,
            Throttle::PerWorker(period) => Gate::Own(ticker(*period)),
            Throttle::Aggregate(shared) => Gate::Shared(Arc::clone(shared)),
        }
    }
}

/// Pacing primitive a worker waits on before each request.
#[derive(Debug)]
pub enum Gate {
    Open,
    Own(Interval),
    Shared(Arc<Mutex<Interval>>),
}

impl Gate {
    pub async fn wait(&mut self) {
        match self {
            Gate::Open => {}
            Gate::Own(interval) => {
                interval.tick().await;
            }
            Gate::Shared(shared) => {
                shared.lock().await.tick().await;
            }
        }
    }
}

/// Gate period for `qps`: `1_000_000 / qps` microseconds, `None` when unlimited.
pub fn period(qps: f64) -> Option<Duration> {
    if qps.is_nan() || qps <= 0.0 {
        return None;
    }
    let micros = (1e6 / qps) as u64;
    Some(Duration::from_micros(micros.max(1)))
}

// First tick one period from now; late ticks push the schedule back instead of bursting.
fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}
