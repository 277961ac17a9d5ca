//! Camera capture, the capture scheduler and the analysis round it drives.

pub mod dispatcher;
pub mod frame;
pub mod scheduler;

pub use dispatcher::{AnalysisDispatcher, DispatcherConfig};
pub use frame::{
    take_jpeg, CameraDevice, FfmpegCamera, FfmpegCameraConfig, Frame, FrameSource,
    FrameSourceConfig,
};
pub use scheduler::{
    AnalysisCycle, CaptureScheduler, CycleOutcome, SchedulerConfig, SchedulerHandle,
    SchedulerSnapshot,
};
