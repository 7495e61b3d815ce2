//! 任务生命周期：调用、续传、异步查询、过期清理

mod controller;
mod events;
mod session;
mod types;

pub use controller::{ControllerSettings, ReplyRouting, SweepReport, TaskLifecycleController};
pub use events::{NoopEventSink, RecordingEventSink, TaskEvent, TaskEventSink, TracingEventSink};
pub use session::{derive_session_id, SessionIdPolicy};
pub use types::{
    AsyncStatus, CompletedResponse, FollowUpInput, InvokeMode, InvokeRequest, TaskOutcome,
    ToolResponse,
};
