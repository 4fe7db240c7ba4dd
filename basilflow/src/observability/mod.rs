//! Tracing setup and step timing.

use std::time::Instant;
use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber.
///
/// `filter` takes precedence; otherwise `RUST_LOG` is used, falling back to
/// `info`. Returns false if a subscriber was already installed, which makes
/// repeated calls harmless.
pub fn init_tracing(filter: Option<&str>, json: bool) -> bool {
    let env_filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.is_ok()
}

/// Wall-clock timer for a single step.
#[derive(Debug)]
pub struct StepTimer {
    start: Instant,
    name: String,
}

impl StepTimer {
    /// Starts timing.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the name given at start.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }

    /// Stops the timer, logs the duration and returns it in seconds.
    pub fn finish(self) -> f64 {
        let seconds = self.start.elapsed().as_secs_f64();
        tracing::debug!(step = %self.name, duration_s = seconds, "Step timing");
        seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_is_idempotent() {
        let _ = init_tracing(Some("warn"), false);
        assert!(!init_tracing(Some("debug"), true));
    }

    #[test]
    fn test_step_timer() {
        let timer = StepTimer::start("VB - Tissue");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(timer.name(), "VB - Tissue");
        assert!(timer.elapsed_ms() >= 10.0);
        assert!(timer.finish() >= 0.01);
    }
}
