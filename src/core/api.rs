use std::path::Path;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::debug;
use url::Url;
use crate::config::ClientConfig;
use super::errors::{ClipError, Result};
use super::progress::{ProgressCallback, ProgressStream};
use super::types::{
    DownloadAccepted,
    DownloadRequest,
    PresignedUpload,
    ProcessAccepted,
    ProcessingStatus,
    RegisterUpload,
    TaskId,
    TaskStatus,
    UploadUrlRequest,
    VideoId,
};

/// 处理服务 API
///
/// 每个方法对应一个远端接口，错误已按阶段归类：
/// 获取上传地址与直传失败为 `Transfer`，登记失败为 `Registration`，
/// 提交任务失败为 `JobSubmission`，状态查询失败为 `Network`/`Timeout`/`Json`。
#[async_trait]
pub trait ClipApi: Send + Sync {
    /// `POST /s3-upload-url`
    async fn request_upload_url(&self, filename: &str, content_type: &str) -> Result<PresignedUpload>;

    /// 直接上传到预签名地址
    async fn transfer_file(
        &self,
        target: &PresignedUpload,
        path: &Path,
        content_type: &str,
        on_progress: ProgressCallback,
    ) -> Result<()>;

    /// `POST /register-s3-upload`
    async fn register_upload(&self, registration: &RegisterUpload) -> Result<()>;

    /// `POST /youtube-download`
    async fn submit_download(&self, request: &DownloadRequest) -> Result<DownloadAccepted>;

    /// `POST /process-s3-video/{id}` 或 `POST /process-video/{id}`
    async fn process_video(&self, video_id: &VideoId, s3_key: Option<&str>) -> Result<ProcessAccepted>;

    /// `GET /status/{task_id}`
    async fn task_status(&self, task_id: &TaskId) -> Result<TaskStatus>;

    /// `GET /processing-status/{video_id}`
    async fn processing_status(&self, video_id: &VideoId) -> Result<ProcessingStatus>;
}

#[derive(Debug, Clone)]
pub struct HttpClipApi {
    client: Client,
    base_url: Url,
    transfer_timeout: std::time::Duration,
}

impl HttpClipApi {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Self::with_client(client, config)
    }

    pub fn with_client(client: Client, config: &ClientConfig) -> Result<Self> {
        let mut base = config.api_base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|err| ClipError::Config(format!("invalid api_base_url: {}", err)))?;

        Ok(Self {
            client,
            base_url,
            transfer_timeout: config.transfer_timeout(),
        })
    }

    /// 拼接接口地址，路径参数逐段编码
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| ClipError::Config("api_base_url cannot be a base".to_string()))?;
            path.pop_if_empty();
            path.extend(segments);
        }
        Ok(url)
    }

    async fn error_text(response: Response) -> String {
        let status = response.status();
        match response.text().await {
            Ok(body) if !body.trim().is_empty() => format!("{}: {}", status, body.trim()),
            _ => status.to_string(),
        }
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn poll_error(err: reqwest::Error) -> ClipError {
        if err.is_timeout() {
            ClipError::Timeout
        } else {
            ClipError::network(err.to_string())
        }
    }
}

#[async_trait]
impl ClipApi for HttpClipApi {
    async fn request_upload_url(&self, filename: &str, content_type: &str) -> Result<PresignedUpload> {
        let url = self.endpoint(&["s3-upload-url"])?;
        let body = UploadUrlRequest {
            filename: filename.to_string(),
            content_type: content_type.to_string(),
        };

        let response = self.client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| ClipError::transfer(None, format!("Failed to get upload URL: {}", err)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClipError::transfer(Some(status.as_u16()), "Failed to get upload URL"));
        }

        Self::decode(response)
            .await
            .map_err(|err| ClipError::transfer(Some(status.as_u16()), format!("Bad upload URL response: {}", err)))
    }

    async fn transfer_file(
        &self,
        target: &PresignedUpload,
        path: &Path,
        content_type: &str,
        on_progress: ProgressCallback,
    ) -> Result<()> {
        let file = File::open(path).await?;
        let file_size = file.metadata().await?.len();
        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("file")
            .to_string();

        let stream = ProgressStream::new(ReaderStream::new(file), file_size, on_progress);
        let part = Part::stream_with_length(reqwest::Body::wrap_stream(stream), file_size)
            .file_name(filename)
            .mime_str(content_type)
            .map_err(|err| ClipError::validation(format!("Invalid content type {:?}: {}", content_type, err)))?;

        // 字段在前，文件放最后
        let mut form = Form::new();
        for (key, value) in &target.upload_fields {
            form = form.text(key.clone(), value.clone());
        }
        form = form.part("file", part);

        let response = self.client
            .post(&target.upload_url)
            .timeout(self.transfer_timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|err| ClipError::transfer(None, format!("Network error during upload: {}", err)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClipError::transfer(
                Some(status.as_u16()),
                format!("Upload failed with status {}", status.as_u16()),
            ));
        }

        debug!(bytes = file_size, "transfer accepted by storage");
        Ok(())
    }

    async fn register_upload(&self, registration: &RegisterUpload) -> Result<()> {
        let url = self.endpoint(&["register-s3-upload"])?;

        let response = self.client
            .post(url)
            .form(registration)
            .send()
            .await
            .map_err(|err| ClipError::registration(None, err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = Self::error_text(response).await;
            return Err(ClipError::registration(Some(status.as_u16()), message));
        }

        Ok(())
    }

    async fn submit_download(&self, request: &DownloadRequest) -> Result<DownloadAccepted> {
        let url = self.endpoint(&["youtube-download"])?;

        let response = self.client
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|err| ClipError::job_submission(None, err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = Self::error_text(response).await;
            return Err(ClipError::job_submission(Some(status.as_u16()), message));
        }

        Self::decode(response)
            .await
            .map_err(|err| ClipError::job_submission(Some(status.as_u16()), err.to_string()))
    }

    async fn process_video(&self, video_id: &VideoId, s3_key: Option<&str>) -> Result<ProcessAccepted> {
        let url = match s3_key {
            Some(key) => {
                let mut url = self.endpoint(&["process-s3-video", video_id.as_str()])?;
                url.query_pairs_mut().append_pair("s3_key", key);
                url
            }
            None => self.endpoint(&["process-video", video_id.as_str()])?,
        };

        let response = self.client
            .post(url)
            .send()
            .await
            .map_err(|err| ClipError::job_submission(None, err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = Self::error_text(response).await;
            return Err(ClipError::job_submission(Some(status.as_u16()), message));
        }

        Self::decode(response)
            .await
            .map_err(|err| ClipError::job_submission(Some(status.as_u16()), err.to_string()))
    }

    async fn task_status(&self, task_id: &TaskId) -> Result<TaskStatus> {
        let url = self.endpoint(&["status", task_id.as_str()])?;

        let response = self.client
            .get(url)
            .send()
            .await
            .map_err(Self::poll_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClipError::network(format!("status check returned {}", status)));
        }

        let bytes = response.bytes().await.map_err(Self::poll_error)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn processing_status(&self, video_id: &VideoId) -> Result<ProcessingStatus> {
        let url = self.endpoint(&["processing-status", video_id.as_str()])?;

        let response = self.client
            .get(url)
            .send()
            .await
            .map_err(Self::poll_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClipError::network(format!("processing status returned {}", status)));
        }

        Self::decode(response).await
    }
}
