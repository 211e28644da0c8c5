use crate::RequestResult;

use std::collections::BTreeMap;
use std::io::{ self, Write };
use std::time::Duration;

const BUCKET_COUNT: usize = 10; // size of the histogram
const BAR_CHAR: &str = "■";
const BAR_WIDTH: usize = 40;
const PERCENTILES: [usize; 7] = [10, 25, 50, 75, 90, 95, 99];

/// Consumer of a run's results.
///
/// The runner drains the result stream into `record` on a task of its own,
/// then calls `finalize` once with the total run time.
pub trait Reporter: Send + 'static {
    fn record(&mut self, result: RequestResult);

    fn finalize(&mut self, total: Duration, out: &mut dyn Write) -> io::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Summary,
    Csv,
}

// per-request timings of a successful result, in seconds
#[derive(Debug, Clone, Copy)]
struct Sample {
    latency: f64,
    conn: f64,
    dns: f64,
    req: f64,
    delay: f64,
    res: f64,
    status: u16,
    offset: f64,
}

/// Default reporter: summary with histogram and distributions, or a CSV dump.
#[derive(Debug)]
pub struct Report {
    format: OutputFormat,
    samples: Vec<Sample>,
    status_codes: BTreeMap<u16, usize>,
    errors: BTreeMap<String, usize>,
    timeouts: usize,
    size_total: u64,
    total: Duration,
}

impl Report {
    pub fn new(format: OutputFormat, expected: usize) -> Self {
        Self {
            format,
            samples: Vec::with_capacity(expected.min(1_000_000)),
            status_codes: BTreeMap::new(),
            errors: BTreeMap::new(),
            timeouts: 0,
            size_total: 0,
            total: Duration::ZERO,
        }
    }

    /// Results that completed without error.
    pub fn completed(&self) -> usize {
        self.samples.len()
    }

    pub fn failed(&self) -> usize {
        self.errors.values().sum()
    }

    pub fn timeouts(&self) -> usize {
        self.timeouts
    }

    pub fn status_codes(&self) -> &BTreeMap<u16, usize> {
        &self.status_codes
    }

    pub fn errors(&self) -> &BTreeMap<String, usize> {
        &self.errors
    }

    pub fn total_bytes(&self) -> u64 {
        self.size_total
    }

    fn print_csv(&self, out: &mut dyn Write) -> io::Result<()> {
        writeln!(
            out,
            "response-time,DNS+dialup,DNS,Request-write,Response-delay,Response-read,status-code,offset"
        )?;
        for s in &self.samples {
            writeln!(
                out,
                "{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{},{:.4}",
                s.latency,
                s.conn,
                s.dns,
                s.req,
                s.delay,
                s.res,
                s.status,
                s.offset
            )?;
        }
        Ok(())
    }

    fn print_summary(&self, out: &mut dyn Write) -> io::Result<()> {
        let total = self.total.as_secs_f64();
        let mut latencies: Vec<f64> = self.samples
            .iter()
            .map(|s| s.latency)
            .collect();
        latencies.sort_by(f64::total_cmp);

        writeln!(out, "\nSummary:")?;
        writeln!(out, "  Total:\t{:.4} secs", total)?;
        if let (Some(fastest), Some(slowest)) = (latencies.first(), latencies.last()) {
            writeln!(out, "  Slowest:\t{:.4} secs", slowest)?;
            writeln!(out, "  Fastest:\t{:.4} secs", fastest)?;
            writeln!(out, "  Average:\t{:.4} secs", mean(&latencies))?;
        }
        let rps = if total > 0.0 { (self.samples.len() as f64) / total } else { 0.0 };
        writeln!(out, "  Requests/sec:\t{:.4}", rps)?;
        writeln!(out)?;
        if self.size_total > 0 && !self.samples.is_empty() {
            writeln!(out, "  Total data:\t{} bytes", self.size_total)?;
            writeln!(
                out,
                "  Size/request:\t{} bytes",
                self.size_total / (self.samples.len() as u64)
            )?;
        }

        if !latencies.is_empty() {
            self.print_histogram(out, &latencies)?;
            Self::print_latency_distribution(out, &latencies)?;
            self.print_details(out)?;
        }

        if !self.status_codes.is_empty() {
            writeln!(out, "\nStatus code distribution:")?;
            for (code, count) in &self.status_codes {
                writeln!(out, "  [{}]\t{} responses", code, count)?;
            }
        }

        if !self.errors.is_empty() {
            writeln!(out, "\nError distribution:")?;
            for (err, count) in &self.errors {
                writeln!(out, "  [{}]\t{}", count, err)?;
            }
            if self.timeouts > 0 {
                writeln!(out, "  ({} of them timeouts)", self.timeouts)?;
            }
        }
        Ok(())
    }

    /// Response time histogram over equal-width buckets between fastest and slowest.
    fn print_histogram(&self, out: &mut dyn Write, latencies: &[f64]) -> io::Result<()> {
        let fastest = latencies[0];
        let slowest = latencies[latencies.len() - 1];
        let bucket_size = (slowest - fastest) / (BUCKET_COUNT as f64);

        let mut marks = vec![0.0; BUCKET_COUNT + 1];
        for (i, mark) in marks.iter_mut().enumerate() {
            *mark = fastest + bucket_size * (i as f64);
        }
        let mut counts = vec![0usize; BUCKET_COUNT + 1];
        let mut bi = 0;
        for &latency in latencies {
            while bi < BUCKET_COUNT && latency > marks[bi] {
                bi += 1;
            }
            counts[bi] += 1;
        }

        let max = counts.iter().copied().max().unwrap_or(1).max(1);
        writeln!(out, "\nResponse time histogram:")?;
        for (mark, count) in marks.iter().zip(&counts) {
            let bar = BAR_CHAR.repeat((count * BAR_WIDTH) / max);
            writeln!(out, "  {:.3} [{}]\t|{}", mark, count, bar)?;
        }
        Ok(())
    }

    fn print_latency_distribution(out: &mut dyn Write, latencies: &[f64]) -> io::Result<()> {
        writeln!(out, "\nLatency distribution:")?;
        for p in PERCENTILES {
            writeln!(out, "  {}% in {:.4} secs", p, percentile(latencies, p))?;
        }
        Ok(())
    }

    fn print_details(&self, out: &mut dyn Write) -> io::Result<()> {
        let column = |f: fn(&Sample) -> f64| -> (f64, f64, f64) {
            let values: Vec<f64> = self.samples.iter().map(f).collect();
            let fastest = values.iter().copied().fold(f64::INFINITY, f64::min);
            let slowest = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (mean(&values), fastest, slowest)
        };

        writeln!(out, "\nDetails (average, fastest, slowest):")?;
        let rows: [(&str, fn(&Sample) -> f64); 5] = [
            ("DNS+dialup", |s| s.conn),
            ("DNS-lookup", |s| s.dns),
            ("req write", |s| s.req),
            ("resp wait", |s| s.delay),
            ("resp read", |s| s.res),
        ];
        for (name, f) in rows {
            let (avg, fastest, slowest) = column(f);
            writeln!(
                out,
                "  {}:\t{:.4} secs, {:.4} secs, {:.4} secs",
                name,
                avg,
                fastest,
                slowest
            )?;
        }
        Ok(())
    }
}

impl Reporter for Report {
    fn record(&mut self, result: RequestResult) {
        match result.error {
            Some(err) => {
                if err.is_timeout() {
                    self.timeouts += 1;
                }
                *self.errors.entry(err.to_string()).or_insert(0) += 1;
            }
            None => {
                let status = result.status.map(|s| s.as_u16()).unwrap_or_default();
                *self.status_codes.entry(status).or_insert(0) += 1;
                self.size_total += result.content_length;
                self.samples.push(Sample {
                    latency: result.duration.as_secs_f64(),
                    conn: result.conn_duration.as_secs_f64(),
                    dns: result.dns_duration.as_secs_f64(),
                    req: result.req_duration.as_secs_f64(),
                    delay: result.delay_duration.as_secs_f64(),
                    res: result.res_duration.as_secs_f64(),
                    status,
                    offset: result.offset.as_secs_f64(),
                });
            }
        }
    }

    fn finalize(&mut self, total: Duration, out: &mut dyn Write) -> io::Result<()> {
        self.total = total;
        match self.format {
            OutputFormat::Summary => self.print_summary(out)?,
            OutputFormat::Csv => self.print_csv(out)?,
        }
        out.flush()
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / (values.len() as f64)
}

// `sorted` must be ascending and non-empty
fn percentile(sorted: &[f64], p: usize) -> f64 {
    let idx = (p * sorted.len()) / 100;
    sorted[idx.min(sorted.len() - 1)]
}
