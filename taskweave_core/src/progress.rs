//! Progress callback handed to run-functions.

use std::fmt;
use std::sync::Arc;

type ProgressFn = dyn Fn(f32, Option<&str>) + Send + Sync;

/// Reports progress (0.0 to 100.0) with an optional message.
///
/// Cloning shares the callback. Values outside 0..=100 are clamped.
#[derive(Clone)]
pub struct ProgressReporter {
    callback: Arc<ProgressFn>,
}

impl ProgressReporter {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(f32, Option<&str>) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Reporter that drops every update.
    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    pub fn report(&self, progress: f32, message: Option<&str>) {
        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 100.0)
        };
        (self.callback)(progress, message);
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_report_clamps() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::new(move |p, m| {
            sink.lock().unwrap().push((p, m.map(str::to_string)));
        });

        reporter.report(150.0, Some("over"));
        reporter.report(-1.0, None);

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], (100.0, Some("over".to_string())));
        assert_eq!(seen[1], (0.0, None));
    }
}
