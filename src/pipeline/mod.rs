//! Pipeline orchestration for chunked synchronization.

pub mod cancel;
pub mod controller;
pub mod dispatch;
pub mod limiter;
mod metrics;
pub mod partition;
pub mod poller;
pub mod progress;
pub mod retry;
pub mod state;


pub use cancel::RunHandle;
pub use controller::{SyncOptions, SyncPipeline, SyncPlan};
pub use dispatch::Dispatcher;
pub use limiter::{ConcurrencyLimiter, LimiterPermit};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use poller::TaskPoller;
pub use progress::{
    watch_sink, LogProgress, ProcessingProgress, ProgressAggregator, ProgressSink, ProgressStatus,
};
pub use retry::RetryPolicy;
pub use state::{RunPhase, RunState};
