pub mod core;
pub mod utils;
pub mod config;

// 重新导出核心类型
pub use crate::core::{
    ClipApi,
    ClipError,
    ClipTemplate,
    Coordinator,
    CoordinatorEvent,
    GeneratedClip,
    HttpClipApi,
    JobStatus,
    Result,
    Snapshot,
    TaskId,
    TaskStatus,
    UploadItem,
    VideoId,
};
pub use config::ClientConfig;
