use std::collections::BTreeMap;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// 本地条目唯一标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct UploadId(pub Uuid);

impl UploadId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 服务端任务 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 服务端视频 ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct VideoId(String);

impl VideoId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for VideoId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl std::fmt::Display for VideoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 任务状态
///
/// `Idle` 只存在于客户端，其余取值都来自 `/status/{task_id}` 的响应。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// 尚未选择文件或 URL
    Idle,
    /// 本地文件上传中
    Uploading,
    /// 上传并登记完成
    Uploaded,
    /// 服务端下载中
    Downloading,
    /// 服务端下载完成
    Downloaded,
    ProcessingStarted,
    Queued,
    Processing,
    Transcribing,
    Analyzing,
    /// 处理完成
    Completed,
    /// 失败
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Uploading => "uploading",
            JobStatus::Uploaded => "uploaded",
            JobStatus::Downloading => "downloading",
            JobStatus::Downloaded => "downloaded",
            JobStatus::ProcessingStarted => "processing_started",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Transcribing => "transcribing",
            JobStatus::Analyzing => "analyzing",
            JobStatus::Completed => "completed",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }

    /// 处理阶段，仅提示文字不同
    pub fn is_in_flight(self) -> bool {
        match self {
            JobStatus::ProcessingStarted
            | JobStatus::Queued
            | JobStatus::Processing
            | JobStatus::Transcribing
            | JobStatus::Analyzing => true,
            JobStatus::Idle
            | JobStatus::Uploading
            | JobStatus::Uploaded
            | JobStatus::Downloading
            | JobStatus::Downloaded
            | JobStatus::Completed
            | JobStatus::Error => false,
        }
    }

    /// 传输已结束（上传或下载）
    pub fn is_transfer_done(self) -> bool {
        matches!(self, JobStatus::Uploaded | JobStatus::Downloaded)
    }

    /// 是否使用快速轮询间隔
    pub fn polls_fast(self) -> bool {
        self.is_in_flight() || matches!(self, JobStatus::Downloading | JobStatus::Downloaded)
    }

    /// 该状态下出现的 `process_task_id` 需要切换轮询目标
    pub fn accepts_redirect(self) -> bool {
        self.is_transfer_done() || self.is_in_flight()
    }

    pub fn message(self) -> &'static str {
        match self {
            JobStatus::Idle => "Waiting for a file or URL",
            JobStatus::Uploading => "Uploading...",
            JobStatus::Uploaded => "Upload complete",
            JobStatus::Downloading => "Downloading video...",
            JobStatus::Downloaded => "Download complete",
            JobStatus::ProcessingStarted | JobStatus::Queued => "Starting processing...",
            JobStatus::Processing => "Processing video clips...",
            JobStatus::Transcribing => "Transcribing audio...",
            JobStatus::Analyzing => "Analyzing content...",
            JobStatus::Completed => "Processing complete",
            JobStatus::Error => "Processing failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = crate::core::errors::ClipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| crate::core::errors::ClipError::UnknownStatus(s.to_string()))
    }
}

/// 片段模板，只在客户端使用，不会发送到服务端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClipTemplate {
    #[default]
    None,
    EmojiReaction,
    Poll,
    Quotes,
    QuestionAnswer,
    QuizShow,
    TapRhythm,
    SwipeChoice,
    WordCloud,
    AnimatedCaptions,
    VisualEffects,
    Comments,
    FollowButton,
    SharePrompt,
}

/// 一次上传或下载对应的本地条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadItem {
    pub id: UploadId,
    pub filename: String,
    pub upload_date: DateTime<Utc>,
    pub status: JobStatus,
    pub s3_key: Option<String>,
    pub task_id: Option<TaskId>,
}

impl UploadItem {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            id: UploadId::new(),
            filename: filename.into(),
            upload_date: Utc::now(),
            status: JobStatus::Idle,
            s3_key: None,
            task_id: None,
        }
    }
}

/// 生成的片段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedClip {
    pub id: String,
    pub title: String,
    /// `M:SS`
    pub duration: String,
    pub thumbnail: Option<String>,
    pub url: String,
    pub template: ClipTemplate,
}

// ---- wire types ----

#[derive(Debug, Clone, Serialize)]
pub struct UploadUrlRequest {
    pub filename: String,
    pub content_type: String,
}

/// `/s3-upload-url` 响应
#[derive(Debug, Clone, Deserialize)]
pub struct PresignedUpload {
    pub upload_url: String,
    #[serde(default)]
    pub upload_fields: BTreeMap<String, String>,
    pub video_id: VideoId,
    pub s3_key: String,
}

/// `/register-s3-upload` 表单
#[derive(Debug, Clone, Serialize)]
pub struct RegisterUpload {
    pub video_id: VideoId,
    pub s3_key: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadRequest {
    pub url: String,
    pub auto_process: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DownloadAccepted {
    pub task_id: TaskId,
    #[serde(default)]
    pub video_id: Option<VideoId>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessAccepted {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VideoInfo {
    #[serde(default)]
    pub video_id: Option<VideoId>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClipPayload {
    #[serde(default)]
    pub title: Option<String>,
    pub start_time: f64,
    pub end_time: f64,
    pub url: String,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

/// 缺省或显式 `null` 都按默认值处理
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `/status/{task_id}` 响应
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskStatus {
    pub status: JobStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub progress: f64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub process_task_id: Option<TaskId>,
    #[serde(default)]
    pub video_info: Option<VideoInfo>,
    #[serde(default)]
    pub clips: Option<Vec<ClipPayload>>,
}

impl TaskStatus {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            progress: 0.0,
            message: None,
            process_task_id: None,
            video_info: None,
            clips: None,
        }
    }

    /// 0..=100
    pub fn percentage(&self) -> u8 {
        if self.progress.is_finite() {
            self.progress.clamp(0.0, 100.0).round() as u8
        } else {
            0
        }
    }

    pub fn video_id(&self) -> Option<&VideoId> {
        self.video_info.as_ref().and_then(|info| info.video_id.as_ref())
    }
}

/// `/processing-status/{video_id}` 响应
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessingStatus {
    #[serde(default, deserialize_with = "null_as_default")]
    pub has_processing_started: bool,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub process_task_id: Option<TaskId>,
}

// ---- observable state ----

/// 面向用户的错误提示
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserError {
    pub title: String,
    pub description: String,
}

/// 协调器对外发布的状态快照
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub item: Option<UploadItem>,
    pub phase: JobStatus,
    pub progress: u8,
    pub message: String,
    pub active_task: Option<TaskId>,
    /// 任务链上出现过的全部 ID，按顺序
    pub task_chain: Vec<TaskId>,
    pub video_id: Option<VideoId>,
    pub consecutive_failures: u32,
    pub connection_issue: bool,
    pub error: Option<UserError>,
    pub clips: Vec<GeneratedClip>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            item: None,
            phase: JobStatus::Idle,
            progress: 0,
            message: JobStatus::Idle.message().to_string(),
            active_task: None,
            task_chain: Vec::new(),
            video_id: None,
            consecutive_failures: 0,
            connection_issue: false,
            error: None,
            clips: Vec::new(),
        }
    }
}

/// 协调器事件
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    /// 状态变更
    StateChanged {
        old: JobStatus,
        new: JobStatus,
    },

    /// 进度更新
    Progress {
        percentage: u8,
    },

    /// 上传并登记完成
    Uploaded {
        video_id: VideoId,
        s3_key: String,
        filename: String,
    },

    /// 服务端下载完成
    Downloaded {
        video_id: Option<VideoId>,
        task_id: TaskId,
    },

    /// 轮询目标切换
    Redirected {
        from: TaskId,
        to: TaskId,
    },

    /// 连续轮询失败达到阈值
    ConnectionIssue {
        failures: u32,
    },

    ConnectionRestored,

    /// 任务链完成
    Completed {
        task_id: TaskId,
        clips: Vec<GeneratedClip>,
    },

    /// 失败
    Failed {
        error: UserError,
    },
}

// 静态断言确保类型是 Send的
const _: () = {
    #[allow(dead_code)]
    fn assert_send<T: Send + Sync>() {}
    #[allow(dead_code)]
    fn assert_types() {
        assert_send::<Snapshot>();
        assert_send::<CoordinatorEvent>();
        assert_send::<TaskStatus>();
    }
};
