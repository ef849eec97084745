//! Inferring the end of a streamed agent response.
//!
//! The agent never says it is done. The buffer length is sampled at a fixed
//! interval and the response is taken as final once the length has stayed
//! the same, and non-zero, for a number of consecutive samples. A buffer that
//! keeps changing is given up on at a hard ceiling.

use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::services::agent::{AgentError, AgentSession, SubmissionHandle};

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Time between buffer samples.
    pub poll_interval: Duration,
    /// Consecutive unchanged samples required to call the output final.
    pub stable_samples: u32,
    /// Total time allowed for one response.
    pub timeout_ceiling: Duration,
    /// How long an empty buffer is tolerated before it is reported.
    pub start_grace: Duration,
}

impl DetectorConfig {
    /// Minimum time the length must hold still after the last growth.
    pub fn stability_window(&self) -> Duration {
        self.poll_interval * self.stable_samples
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(3),
            stable_samples: 2,
            timeout_ceiling: Duration::from_secs(15 * 60),
            start_grace: Duration::from_secs(30),
        }
    }
}

/// Result of feeding one sample to a [`StabilityTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    /// Nothing has arrived yet.
    Empty,
    /// Length differs from the previous sample.
    Growing,
    /// Length unchanged for this many consecutive samples.
    Holding(u32),
    /// Length unchanged for the required number of samples.
    Settled,
}

/// Debounce state for buffer lengths.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    required: u32,
    last_len: Option<usize>,
    unchanged: u32,
}

impl StabilityTracker {
    pub fn new(required: u32) -> Self {
        Self {
            required: required.max(1),
            last_len: None,
            unchanged: 0,
        }
    }

    pub fn observe(&mut self, len: usize) -> Sample {
        let previous = self.last_len.replace(len);

        if len == 0 {
            self.unchanged = 0;
            return Sample::Empty;
        }
        if previous != Some(len) {
            self.unchanged = 0;
            return Sample::Growing;
        }

        self.unchanged += 1;
        if self.unchanged >= self.required {
            Sample::Settled
        } else {
            Sample::Holding(self.unchanged)
        }
    }
}

/// A response whose buffer settled.
#[derive(Debug, Clone)]
pub struct Completion {
    pub output: String,
    pub elapsed: Duration,
    pub samples: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("Output did not settle within {ceiling:?} (last length {last_len})")]
    Timeout { ceiling: Duration, last_len: usize },

    #[error("Agent session failed while streaming: {0}")]
    Session(#[from] AgentError),

    #[error("Cancelled while waiting for output")]
    Cancelled,
}

/// Polls a submission until its output settles or the ceiling passes.
#[derive(Debug, Clone)]
pub struct CompletionDetector {
    config: DetectorConfig,
}

impl CompletionDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub async fn wait_for_output(
        &self,
        session: &dyn AgentSession,
        handle: SubmissionHandle,
        cancel: &CancellationToken,
    ) -> Result<Completion, DetectError> {
        let started = Instant::now();
        let deadline = started + self.config.timeout_ceiling;
        let mut tracker = StabilityTracker::new(self.config.stable_samples);
        let mut samples = 0u32;
        let mut last_len = 0usize;
        let mut last_change = started;
        let mut reported_idle = false;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(DetectError::Timeout {
                    ceiling: self.config.timeout_ceiling,
                    last_len,
                });
            }

            // The final wait is clipped so the last sample lands on the ceiling.
            let wait = self.config.poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(DetectError::Cancelled),
                _ = sleep(wait) => {}
            }

            let buffer = session.read_buffer(handle).await?;
            samples += 1;
            last_len = buffer.len();

            match tracker.observe(last_len) {
                // A sample clipped by the ceiling comes early and cannot
                // complete the window on its own.
                Sample::Settled if last_change.elapsed() < self.config.stability_window() => {
                    tracing::trace!(len = last_len, samples, "Final sample inside the window");
                }
                Sample::Settled => {
                    return Ok(Completion {
                        output: buffer,
                        elapsed: started.elapsed(),
                        samples,
                    });
                }
                Sample::Empty => {
                    last_change = Instant::now();
                    if !reported_idle && started.elapsed() >= self.config.start_grace {
                        reported_idle = true;
                        tracing::warn!(
                            elapsed_secs = started.elapsed().as_secs(),
                            "Agent has not produced any output yet"
                        );
                    }
                }
                Sample::Growing => {
                    last_change = Instant::now();
                    tracing::trace!(len = last_len, samples, "Output still streaming");
                }
                Sample::Holding(_) => {
                    tracing::trace!(len = last_len, samples, "Output still streaming");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Buffer whose length is a function of time since creation.
    struct TimedBuffer {
        started: Instant,
        grow_for: Option<Duration>,
        bytes_per_sec: usize,
        delay: Duration,
    }

    impl TimedBuffer {
        fn growing_for(grow_for: Duration) -> Self {
            Self {
                started: Instant::now(),
                grow_for: Some(grow_for),
                bytes_per_sec: 100,
                delay: Duration::ZERO,
            }
        }

        fn never_settling() -> Self {
            Self {
                started: Instant::now(),
                grow_for: None,
                bytes_per_sec: 100,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl AgentSession for TimedBuffer {
        async fn submit(&mut self, _: &str, _: &str) -> Result<SubmissionHandle, AgentError> {
            Ok(SubmissionHandle(1))
        }

        async fn read_buffer(&self, _: SubmissionHandle) -> Result<String, AgentError> {
            let elapsed = self.started.elapsed().saturating_sub(self.delay);
            let streaming = match self.grow_for {
                Some(limit) => elapsed.min(limit),
                None => elapsed,
            };
            let len = (streaming.as_millis() as usize * self.bytes_per_sec) / 1000;
            Ok("x".repeat(len))
        }
    }

    struct BrokenSession;

    #[async_trait]
    impl AgentSession for BrokenSession {
        async fn submit(&mut self, _: &str, _: &str) -> Result<SubmissionHandle, AgentError> {
            Ok(SubmissionHandle(1))
        }

        async fn read_buffer(&self, _: SubmissionHandle) -> Result<String, AgentError> {
            Err(AgentError::Stream("connection reset".into()))
        }
    }

    /// Paused-clock timers fire on millisecond ticks.
    fn assert_near(actual: Duration, expected: Duration) {
        assert!(actual >= expected, "{actual:?} is before {expected:?}");
        assert!(actual - expected < Duration::from_millis(5), "{actual:?} overshoots {expected:?}");
    }

    fn config() -> DetectorConfig {
        DetectorConfig {
            poll_interval: Duration::from_secs(3),
            stable_samples: 2,
            timeout_ceiling: Duration::from_secs(15 * 60),
            start_grace: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_tracker_requires_consecutive_equal_samples() {
        let mut tracker = StabilityTracker::new(2);
        assert_eq!(tracker.observe(10), Sample::Growing);
        assert_eq!(tracker.observe(10), Sample::Holding(1));
        assert_eq!(tracker.observe(12), Sample::Growing);
        assert_eq!(tracker.observe(12), Sample::Holding(1));
        assert_eq!(tracker.observe(12), Sample::Settled);
    }

    #[test]
    fn test_tracker_never_settles_on_empty_buffer() {
        let mut tracker = StabilityTracker::new(2);
        for _ in 0..10 {
            assert_eq!(tracker.observe(0), Sample::Empty);
        }
        assert_eq!(tracker.observe(5), Sample::Growing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_waits_full_window_after_last_growth() {
        let detector = CompletionDetector::new(config());
        let cancel = CancellationToken::new();

        for grow_secs in [1u64, 7, 10, 31] {
            let grow_for = Duration::from_secs(grow_secs);
            let session = TimedBuffer::growing_for(grow_for);

            let done = detector
                .wait_for_output(&session, SubmissionHandle(1), &cancel)
                .await
                .expect("buffer settles");

            let window = detector.config().stability_window();
            assert!(
                done.elapsed >= grow_for + window,
                "settled after {:?} but growth stopped at {:?}",
                done.elapsed,
                grow_for
            );
            assert!(done.elapsed <= grow_for + window + detector.config().poll_interval);
            assert_eq!(done.output.len(), (grow_secs * 100) as usize);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_settling_buffer_times_out_at_ceiling() {
        let detector = CompletionDetector::new(config());
        let session = TimedBuffer::never_settling();
        let started = Instant::now();

        let err = detector
            .wait_for_output(&session, SubmissionHandle(1), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, DetectError::Timeout { .. }));
        assert_near(started.elapsed(), Duration::from_secs(15 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_not_multiple_of_interval_is_exact() {
        let mut cfg = config();
        cfg.timeout_ceiling = Duration::from_secs(10);
        let detector = CompletionDetector::new(cfg);
        let started = Instant::now();

        let err = detector
            .wait_for_output(
                &TimedBuffer::never_settling(),
                SubmissionHandle(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DetectError::Timeout { ceiling, .. } if ceiling == Duration::from_secs(10)));
        assert_near(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clipped_last_sample_does_not_shorten_window() {
        // Samples at 3, 6, 9 and a clipped one at 10: growth stops at 5, so
        // a full window would end at 12, past the ceiling.
        let mut cfg = config();
        cfg.timeout_ceiling = Duration::from_secs(10);
        let detector = CompletionDetector::new(cfg);
        let started = Instant::now();

        let err = detector
            .wait_for_output(
                &TimedBuffer::growing_for(Duration::from_secs(5)),
                SubmissionHandle(1),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DetectError::Timeout { last_len: 500, .. }));
        assert_near(started.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_settles_before_uneven_ceiling_when_window_fits() {
        let mut cfg = config();
        cfg.timeout_ceiling = Duration::from_secs(10);
        let detector = CompletionDetector::new(cfg);

        let done = detector
            .wait_for_output(
                &TimedBuffer::growing_for(Duration::from_secs(2)),
                SubmissionHandle(1),
                &CancellationToken::new(),
            )
            .await
            .expect("settles at the third sample");

        assert_near(done.elapsed, Duration::from_secs(9));
        assert!(done.elapsed >= Duration::from_secs(2) + detector.config().stability_window());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_buffer_is_not_completion() {
        let mut cfg = config();
        cfg.timeout_ceiling = Duration::from_secs(60);
        let detector = CompletionDetector::new(cfg);

        // Agent stays silent for 40s, then streams for 5s.
        let mut session = TimedBuffer::growing_for(Duration::from_secs(5));
        session.delay = Duration::from_secs(40);

        let done = detector
            .wait_for_output(&session, SubmissionHandle(1), &CancellationToken::new())
            .await
            .expect("settles after the late start");

        assert!(done.elapsed >= Duration::from_secs(45 + 6));
        assert_eq!(done.output.len(), 500);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_error_is_session_fault() {
        let detector = CompletionDetector::new(config());
        let err = detector
            .wait_for_output(&BrokenSession, SubmissionHandle(1), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::Session(AgentError::Stream(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_sampling() {
        let detector = CompletionDetector::new(config());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = detector
            .wait_for_output(&TimedBuffer::never_settling(), SubmissionHandle(1), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DetectError::Cancelled));
    }
}
