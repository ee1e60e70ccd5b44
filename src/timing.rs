//! Build phase timing.

use std::time::{Duration, Instant};

/// Wall-clock timer for one build phase.
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    pub fn start(name: &str) -> Self {
        Self {
            name: name.to_string(),
            start: Instant::now(),
        }
    }

    /// Print and log the elapsed time; returns it for callers that total phases.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        println!("  [{}] {}", format_duration(elapsed), self.name);
        tracing::info!(phase = %self.name, secs = elapsed.as_secs_f64(), "phase finished");
        elapsed
    }
}

/// `12.3s` below a minute, `2.5m` above.
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs >= 60.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}s", secs)
    }
}
