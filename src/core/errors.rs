use thiserror::Error;
use super::types::UserError;

#[derive(Error, Debug)]
pub enum ClipError {
    /// 本地校验失败，没有发出任何请求
    #[error("Validation error: {0}")]
    Validation(String),

    /// 文件传输到存储失败
    #[error("Transfer error: status code {status_code:?}, message: {message}")]
    Transfer {
        status_code: Option<u16>,
        message: String,
    },

    /// 文件已在存储中，但服务端登记失败
    #[error("Registration error: status code {status_code:?}, message: {message}")]
    Registration {
        status_code: Option<u16>,
        message: String,
    },

    /// 提交处理或下载任务失败
    #[error("Job submission error: status code {status_code:?}, message: {message}")]
    JobSubmission {
        status_code: Option<u16>,
        message: String,
    },

    /// 轮询时的网络或 HTTP 错误
    #[error("Network error: {0}")]
    Network(String),

    /// 服务端报告任务失败
    #[error("Remote job error: {0}")]
    RemoteJob(String),

    #[error("Unknown job status: {0}")]
    UnknownStatus(String),

    #[error("Request timed out")]
    Timeout,

    #[error("HTTP error {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClipError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn transfer(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transfer { status_code, message: message.into() }
    }

    pub fn registration(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self::Registration { status_code, message: message.into() }
    }

    pub fn job_submission(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self::JobSubmission { status_code, message: message.into() }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// 远端任务失败，消息先做归一化
    pub fn remote_job(message: Option<&str>) -> Self {
        Self::RemoteJob(normalize_remote_message(message.unwrap_or_default()))
    }

    /// 可以原样重试的错误
    pub fn is_transient(&self) -> bool {
        match self {
            ClipError::Network(_) | ClipError::Timeout | ClipError::UnknownStatus(_) => true,
            ClipError::Http(err) => {
                err.is_timeout()
                    || err.is_connect()
                    || err.is_request()
                    || err.status().is_some_and(|s| s.is_server_error())
            }
            ClipError::Registration { status_code, .. } => {
                status_code.is_none_or(|code| code >= 500)
            }
            _ => false,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            ClipError::Validation(_) => "Invalid input",
            ClipError::Transfer { .. } | ClipError::Io(_) => "Upload failed",
            ClipError::Registration { .. } => "Upload not registered",
            ClipError::JobSubmission { .. } => "Could not start job",
            ClipError::Network(_)
            | ClipError::Timeout
            | ClipError::Http(_)
            | ClipError::UnknownStatus(_)
            | ClipError::Json(_) => "Connection issue",
            ClipError::RemoteJob(_) => "Processing failed",
            ClipError::Config(_) => "Configuration error",
            ClipError::Internal(_) => "Unexpected error",
        }
    }

    pub fn description(&self) -> String {
        match self {
            ClipError::Validation(message) => message.clone(),
            ClipError::Transfer { message, .. } => message.clone(),
            ClipError::Registration { .. } => {
                "The file was stored, but the server did not register it. Try again.".to_string()
            }
            ClipError::JobSubmission { message, .. } => message.clone(),
            ClipError::Network(_) | ClipError::Timeout | ClipError::Http(_) => {
                "Having trouble reaching the server. Still trying...".to_string()
            }
            ClipError::RemoteJob(message) => message.clone(),
            other => other.to_string(),
        }
    }

    pub fn to_user_error(&self) -> UserError {
        UserError {
            title: self.title().to_string(),
            description: self.description(),
        }
    }
}

/// 将服务端的已知错误信息替换为更友好的提示
pub fn normalize_remote_message(message: &str) -> String {
    let lower = message.to_lowercase();
    if lower.contains("unavailable") || lower.contains("private") {
        "This video is unavailable or private".to_string()
    } else if lower.contains("age") && lower.contains("restrict") {
        "This video is age-restricted and cannot be downloaded".to_string()
    } else if message.trim().is_empty() {
        "Processing failed".to_string()
    } else {
        message.to_string()
    }
}

pub type Result<T, E = ClipError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_known_messages() {
        assert_eq!(
            normalize_remote_message("ERROR: Video unavailable"),
            "This video is unavailable or private"
        );
        assert_eq!(
            normalize_remote_message("this is a private video"),
            "This video is unavailable or private"
        );
        assert_eq!(
            normalize_remote_message("Sign in to confirm your age. Restricted content"),
            "This video is age-restricted and cannot be downloaded"
        );
        assert_eq!(normalize_remote_message("disk full"), "disk full");
        assert_eq!(normalize_remote_message("  "), "Processing failed");
    }

    #[test]
    fn test_age_needs_both_words() {
        assert_eq!(normalize_remote_message("bad page"), "bad page");
        assert_eq!(normalize_remote_message("restricted region"), "restricted region");
    }

    #[test]
    fn test_titles_distinguish_taxonomy() {
        assert_eq!(ClipError::validation("x").title(), "Invalid input");
        assert_eq!(ClipError::registration(Some(500), "x").title(), "Upload not registered");
        assert_eq!(ClipError::transfer(Some(403), "x").title(), "Upload failed");
        assert_ne!(
            ClipError::registration(Some(500), "x").title(),
            ClipError::transfer(Some(500), "x").title()
        );
        assert_eq!(ClipError::remote_job(Some("private")).description(), "This video is unavailable or private");
    }

    #[test]
    fn test_transient_classification() {
        assert!(ClipError::network("reset").is_transient());
        assert!(ClipError::Timeout.is_transient());
        assert!(ClipError::registration(Some(502), "x").is_transient());
        assert!(!ClipError::registration(Some(400), "x").is_transient());
        assert!(!ClipError::validation("x").is_transient());
        assert!(!ClipError::remote_job(None).is_transient());
    }
}
