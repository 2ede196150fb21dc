//! 本地输入校验，全部在发出请求之前完成

use std::path::Path;
use url::Url;
use super::errors::{ClipError, Result};

const VIDEO_ID_LEN: usize = 11;

fn is_video_id(candidate: &str) -> bool {
    candidate.len() == VIDEO_ID_LEN
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// 校验视频链接，只接受 `youtube.com/watch?v=` 与 `youtu.be/` 两种形式
///
/// 缺省协议时按 https 处理。
pub fn validate_video_url(input: &str) -> Result<Url> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ClipError::validation("Please enter a video URL"));
    }
    if trimmed.chars().any(char::is_whitespace) {
        return Err(ClipError::validation("Please enter a valid YouTube URL"));
    }

    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };

    let url = Url::parse(&with_scheme)
        .map_err(|_| ClipError::validation("Please enter a valid YouTube URL"))?;

    let host = url.host_str().unwrap_or_default();
    let host = host.strip_prefix("www.").unwrap_or(host);

    let valid = match host {
        "youtube.com" => {
            url.path() == "/watch"
                && url
                    .query_pairs()
                    .find(|(key, _)| key == "v")
                    .is_some_and(|(_, id)| is_video_id(&id))
        }
        "youtu.be" => url
            .path_segments()
            .and_then(|mut segments| segments.next())
            .is_some_and(is_video_id),
        _ => false,
    };

    if valid {
        Ok(url)
    } else {
        Err(ClipError::validation("Please enter a valid YouTube URL"))
    }
}

/// 根据扩展名推断 Content-Type
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "m4a" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

/// 校验待上传文件，返回文件名与大小
pub async fn validate_upload_file(path: &Path, max_bytes: u64) -> Result<(String, u64)> {
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| ClipError::validation("No file selected"))?
        .to_string();

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| ClipError::validation(format!("Cannot read file: {}", path.display())))?;

    if !metadata.is_file() {
        return Err(ClipError::validation(format!("Not a file: {}", path.display())));
    }

    let size = metadata.len();
    if size == 0 {
        return Err(ClipError::validation("The selected file is empty"));
    }
    if size > max_bytes {
        return Err(ClipError::validation(format!(
            "File is too large ({}), the limit is {}",
            crate::utils::format_bytes(size),
            crate::utils::format_bytes(max_bytes)
        )));
    }

    Ok((filename, size))
}
