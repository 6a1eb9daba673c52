//! Backward log scanning that adapts to RPC block-range limits.
//!
//! Public RPC endpoints cap `eth_getLogs` ranges at wildly different sizes and
//! report it with free-form messages. [`LogScan::find_last`] walks back from
//! the chain head in windows; when a query is rejected as too wide it halves
//! the window (down to a floor) and retries the same upper bound.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

/// Default first window, in blocks.
pub const DEFAULT_INITIAL_STEP: u64 = 9_000;
/// Default smallest window, in blocks.
pub const DEFAULT_MIN_STEP: u64 = 1_000;

static RANGE_LIMIT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)eth_getlogs|blocks? range|limited to|more than").ok()
});

/// Returns true if an RPC error message reads as a block-range limit.
#[must_use]
pub fn is_range_limit(message: &str) -> bool {
    RANGE_LIMIT.as_ref().is_some_and(|re| re.is_match(message))
}

/// A failed log query.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("log query {from}..={to} failed: {message}")]
pub struct LogQueryError {
    /// First block of the rejected window.
    pub from: u64,
    /// Last block of the rejected window.
    pub to: u64,
    /// Provider error text.
    pub message: String,
}

/// Something that returns logs for an inclusive block range, oldest first.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Decoded log item.
    type Item: Send;

    /// Fetches matching logs in `from..=to`.
    async fn logs_in_range(&self, from: u64, to: u64) -> Result<Vec<Self::Item>, String>;
}

/// Window sizes for a backward scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogScan {
    /// First window, in blocks.
    pub initial_step: u64,
    /// The window never shrinks below this.
    pub min_step: u64,
}

impl Default for LogScan {
    fn default() -> Self {
        Self {
            initial_step: DEFAULT_INITIAL_STEP,
            min_step: DEFAULT_MIN_STEP,
        }
    }
}

impl LogScan {
    /// Sets the smallest window.
    #[must_use]
    pub const fn with_min_step(mut self, min_step: u64) -> Self {
        self.min_step = min_step;
        self
    }

    /// Returns the newest matching log at or below `latest_block`.
    ///
    /// Within a window the last log wins. Windows are scanned newest first
    /// until a match is found or block 0 has been covered.
    ///
    /// # Errors
    ///
    /// Returns [`LogQueryError`] for any error that is not a range limit, or
    /// for a range limit once the window is already at `min_step`.
    pub async fn find_last<S: LogSource + ?Sized>(
        &self,
        source: &S,
        latest_block: u64,
    ) -> Result<Option<S::Item>, LogQueryError> {
        let floor = self.min_step.max(1);
        let mut step = self.initial_step.max(floor);
        let mut to = latest_block;
        loop {
            let from = to.saturating_sub(step);
            match source.logs_in_range(from, to).await {
                Ok(mut items) => {
                    if let Some(last) = items.pop() {
                        return Ok(Some(last));
                    }
                    if from == 0 {
                        return Ok(None);
                    }
                    to = from - 1;
                }
                Err(message) if step > floor && is_range_limit(&message) => {
                    step = (step / 2).max(floor);
                    #[cfg(feature = "telemetry")]
                    tracing::debug!(from, to, step, "log range rejected, shrinking window");
                }
                Err(message) => return Err(LogQueryError { from, to, message }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Rejects windows wider than `max_width` and holds logs at fixed blocks.
    struct FakeSource {
        max_width: u64,
        logs: Vec<u64>,
        calls: Mutex<Vec<(u64, u64)>>,
    }

    impl FakeSource {
        fn new(max_width: u64, logs: Vec<u64>) -> Self {
            Self {
                max_width,
                logs,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LogSource for FakeSource {
        type Item = u64;

        async fn logs_in_range(&self, from: u64, to: u64) -> Result<Vec<u64>, String> {
            self.calls.lock().unwrap().push((from, to));
            if to - from > self.max_width {
                return Err("query returned more than 10000 results; block range too large".into());
            }
            Ok(self
                .logs
                .iter()
                .copied()
                .filter(|b| (from..=to).contains(b))
                .collect())
        }
    }

    #[test]
    fn range_limit_messages() {
        assert!(is_range_limit("eth_getLogs is limited to a 5000 block range"));
        assert!(is_range_limit("Block range is too wide"));
        assert!(is_range_limit("query exceeds max blocks range"));
        assert!(!is_range_limit("connection reset by peer"));
    }

    #[tokio::test]
    async fn halves_window_and_keeps_last_match() {
        let source = FakeSource::new(5_000, vec![15_800, 16_000, 19_999]);
        let found = LogScan::default().find_last(&source, 20_000).await.unwrap();
        assert_eq!(found, Some(19_999));
        let calls = source.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(11_000, 20_000), (15_500, 20_000)]);
    }

    #[tokio::test]
    async fn walks_back_to_older_windows() {
        let source = FakeSource::new(9_000, vec![100]);
        let found = LogScan::default().find_last(&source, 20_000).await.unwrap();
        assert_eq!(found, Some(100));
        let calls = source.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![(11_000, 20_000), (1_999, 10_999), (0, 1_998)]);
    }

    #[tokio::test]
    async fn returns_none_after_genesis() {
        let source = FakeSource::new(9_000, vec![]);
        assert_eq!(LogScan::default().find_last(&source, 500).await.unwrap(), None);
    }

    #[tokio::test]
    async fn gives_up_at_floor() {
        let source = FakeSource::new(100, vec![]);
        let err = LogScan::default()
            .with_min_step(2_000)
            .find_last(&source, 20_000)
            .await
            .unwrap_err();
        assert_eq!((err.from, err.to), (18_000, 20_000));
        let widths: Vec<u64> = source.calls.lock().unwrap().iter().map(|(f, t)| t - f).collect();
        assert_eq!(widths, vec![9_000, 4_500, 2_250, 2_000]);
    }

    #[tokio::test]
    async fn other_errors_abort() {
        struct Broken;
        #[async_trait]
        impl LogSource for Broken {
            type Item = u64;
            async fn logs_in_range(&self, _: u64, _: u64) -> Result<Vec<u64>, String> {
                Err("connection refused".into())
            }
        }
        let err = LogScan::default().find_last(&Broken, 50_000).await.unwrap_err();
        assert_eq!(err.message, "connection refused");
    }
}
