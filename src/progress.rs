use std::time::Duration;
use indicatif::{ ProgressBar, ProgressStyle };

const REDRAW_EVERY: Duration = Duration::from_millis(100);

/// Terminal spinner with elapsed time, drawn on stderr while the pool runs.
#[derive(Debug)]
pub struct Progress {
    bar: ProgressBar,
}

impl Progress {
    pub fn start(message: &'static str) -> Self {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg} {elapsed}").unwrap_or_else(|_|
                ProgressStyle::default_spinner()
            )
        );
        bar.set_message(message);
        bar.enable_steady_tick(REDRAW_EVERY);
        Self { bar }
    }

    /// Stops the spinner and erases its line.
    pub fn stop(self) {
        self.bar.finish_and_clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_finishes_the_spinner() {
        let progress = Progress::start("Testing in progress...");
        let bar = progress.bar.clone();
        assert!(!bar.is_finished());
        assert_eq!(bar.message(), "Testing in progress...");

        progress.stop();
        assert!(bar.is_finished());
    }
}
