//! Progress callbacks emitted by the robust estimators.

/// Observer of estimation progress.
///
/// All callbacks are synchronous and run on the thread that called
/// `estimate()`, between outer-loop iterations. Implementations must be
/// non-blocking and must not re-enter the estimator.
pub trait EstimatorListener: Send + Sync {
    /// Called once when `estimate()` starts.
    fn on_start(&self) {}

    /// Called once when `estimate()` finishes, whether it succeeded or not.
    fn on_end(&self) {}

    /// Called at the top of each outer-loop iteration.
    fn on_iteration(&self, _iteration: usize) {}

    /// Called whenever estimated progress advances by at least the
    /// configured `progress_delta`. `progress` is in [0, 1].
    fn on_progress(&self, _progress: f64) {}
}
