pub mod batch;
pub mod censor;
pub mod frame;
pub mod pipeline;
pub mod progress;
pub mod scheduler;

pub use batch::{BatchBuffer, BatchExecutor, CensorContext, FrameReport, TaggedFrame};
pub use censor::CensorTransform;
pub use frame::{Frame, PixelRect, Region};
pub use pipeline::{
    CancellationToken, PipelineDriver, PipelineOutcome, PipelineState, PipelineStats,
};
pub use progress::{NoopReporter, ProgressReporter, ProgressTracker, RecordingReporter};
pub use scheduler::{DetectionScheduler, ScheduleAction, ScheduleConfig};
