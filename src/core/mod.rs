mod api;
mod clips;
mod coordinator;
mod errors;
mod poller;
mod progress;
mod scheduler;
mod types;
mod validate;

pub use api::{ClipApi, HttpClipApi};
pub use clips::build_clips;
pub use coordinator::Coordinator;
pub use errors::{normalize_remote_message, ClipError, Result};
pub use poller::{FailureOutcome, NextPoll, Notice, PollOutcome, PollState};
pub use progress::{ProgressCallback, ProgressStream, TransferProgress};
pub use scheduler::{ScheduledTask, TimerSlot};
pub use types::{
    ClipPayload,
    ClipTemplate,
    CoordinatorEvent,
    DownloadAccepted,
    DownloadRequest,
    GeneratedClip,
    JobStatus,
    PresignedUpload,
    ProcessAccepted,
    ProcessingStatus,
    RegisterUpload,
    Snapshot,
    TaskId,
    TaskStatus,
    UploadId,
    UploadItem,
    UploadUrlRequest,
    UserError,
    VideoId,
    VideoInfo,
};
pub use validate::{content_type_for, validate_upload_file, validate_video_url};
