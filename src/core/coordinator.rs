use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use crate::config::ClientConfig;
use crate::utils::RetryBuilder;
use super::api::{ClipApi, HttpClipApi};
use super::clips::build_clips;
use super::errors::{ClipError, Result};
use super::poller::{NextPoll, Notice, PollState};
use super::progress::{ProgressCallback, TransferProgress};
use super::scheduler::TimerSlot;
use super::types::{
    ClipTemplate,
    CoordinatorEvent,
    DownloadRequest,
    JobStatus,
    PresignedUpload,
    RegisterUpload,
    Snapshot,
    TaskId,
    TaskStatus,
    UploadItem,
    VideoId,
};
use super::validate::{content_type_for, validate_upload_file, validate_video_url};

/// 失败后 `retry()` 的恢复点
#[derive(Debug, Clone)]
enum RetryPoint {
    Nothing,
    Upload(PathBuf),
    SubmitUrl { url: String, auto_process: bool },
    /// 文件已在存储中，只需重新登记
    Registration(RegisterUpload),
    StartProcessing,
    Poll,
}

struct Shared {
    api: Arc<dyn ClipApi>,
    config: ClientConfig,
    poller: Mutex<PollState>,
    retry_point: Mutex<RetryPoint>,
    snapshot_tx: watch::Sender<Snapshot>,
    event_tx: broadcast::Sender<CoordinatorEvent>,
    timer: TimerSlot,
    /// 每次 `cancel()` 加一；发起时的值已过期的操作不再安装定时任务
    epoch: AtomicU64,
}

/// 上传/处理状态协调器
///
/// 一个实例对应一条任务链。状态通过 [`Coordinator::subscribe`] 以快照形式发布，
/// 事件通过 [`Coordinator::subscribe_events`] 广播，多个界面可以同时订阅而不会重复轮询。
/// 任意时刻最多只有一个轮询任务；实例被丢弃时轮询随之停止，远端任务不受影响。
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(api: Arc<dyn ClipApi>, config: ClientConfig) -> Self {
        let (snapshot_tx, _) = watch::channel(Snapshot::default());
        // 最大缓存 256 个事件
        let (event_tx, _) = broadcast::channel(256);

        let shared = Shared {
            api,
            poller: Mutex::new(PollState::new(&config)),
            retry_point: Mutex::new(RetryPoint::Nothing),
            config,
            snapshot_tx,
            event_tx,
            timer: TimerSlot::new(),
            epoch: AtomicU64::new(0),
        };

        Self { shared: Arc::new(shared) }
    }

    pub fn with_http(config: ClientConfig) -> Result<Self> {
        let api = HttpClipApi::new(&config)?;
        Ok(Self::new(Arc::new(api), config))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// 订阅状态快照
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// 订阅事件
    ///
    /// 接收太慢会丢失事件（lagged），需要完整状态时以快照为准。
    pub fn subscribe_events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.shared.event_tx.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.shared.snapshot_tx.borrow().clone()
    }

    /// 是否有活动的轮询或定时任务
    pub fn is_polling(&self) -> bool {
        self.shared.timer.is_active()
    }

    /// 提交视频链接，使用配置中的 `auto_process`
    pub async fn submit_url(&self, url: &str) -> Result<TaskId> {
        let epoch = self.shared.epoch();
        self.shared.submit_url(url, self.shared.config.auto_process, epoch).await
    }

    pub async fn submit_url_with(&self, url: &str, auto_process: bool) -> Result<TaskId> {
        let epoch = self.shared.epoch();
        self.shared.submit_url(url, auto_process, epoch).await
    }

    /// 上传本地文件：获取预签名地址、直传、登记
    pub async fn upload_file(&self, path: impl AsRef<Path>) -> Result<VideoId> {
        let epoch = self.shared.epoch();
        self.shared.upload_file(path.as_ref(), epoch).await
    }

    /// 对已上传或已下载的视频开始处理
    ///
    /// 每条任务链只会提交一次；尚未触发的自动处理随之取消。
    pub async fn start_processing(&self) -> Result<TaskId> {
        let epoch = self.shared.epoch();
        self.shared.start_processing(Trigger::Manual, epoch).await
    }

    /// 跟踪一个已存在的服务端任务
    pub async fn watch_task(&self, task_id: TaskId) -> Result<()> {
        let epoch = self.shared.epoch();
        self.shared.watch_task(task_id, epoch).await
    }

    /// 从最近一次失败处重试
    pub async fn retry(&self) -> Result<()> {
        let epoch = self.shared.epoch();
        self.shared.retry(epoch).await
    }

    pub fn set_clip_template(&self, clip_id: &str, template: ClipTemplate) -> Result<()> {
        let mut found = false;
        self.shared.snapshot_tx.send_if_modified(|snapshot| {
            if let Some(clip) = snapshot.clips.iter_mut().find(|clip| clip.id == clip_id) {
                found = true;
                if clip.template != template {
                    clip.template = template;
                    return true;
                }
            }
            false
        });

        if found {
            Ok(())
        } else {
            Err(ClipError::validation(format!("Unknown clip: {}", clip_id)))
        }
    }

    /// 停止轮询；只影响本地，不会取消远端任务
    ///
    /// 调用时仍在进行的上传或提交完成后也不会重新开始轮询。
    pub fn cancel(&self) {
        info!("coordinator cancelled, polling stopped");
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        self.shared.timer.cancel();
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shared.timer.cancel();
    }
}

/// 处理请求的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Manual,
    Auto,
}

impl Shared {
    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// 操作发起后没有被 `cancel()` 打断
    fn is_current(&self, epoch: u64) -> bool {
        self.epoch() == epoch
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.event_tx.send(event);
    }

    fn update(&self, f: impl FnOnce(&mut Snapshot)) {
        self.snapshot_tx.send_modify(f);
    }

    fn set_phase(&self, status: JobStatus, message: Option<&str>) {
        let mut old = status;
        self.update(|snapshot| {
            old = snapshot.phase;
            snapshot.phase = status;
            snapshot.message = message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(status.message())
                .to_string();
            if let Some(item) = snapshot.item.as_mut() {
                item.status = status;
            }
        });

        if old != status {
            debug!(from = %old, to = %status, "state changed");
            self.emit(CoordinatorEvent::StateChanged { old, new: status });
        }
    }

    fn set_progress(&self, percentage: u8) {
        let changed = self.snapshot_tx.send_if_modified(|snapshot| {
            if snapshot.progress != percentage {
                snapshot.progress = percentage;
                true
            } else {
                false
            }
        });
        if changed {
            self.emit(CoordinatorEvent::Progress { percentage });
        }
    }

    async fn fail(&self, err: &ClipError, retry_point: RetryPoint) {
        error!(error = %err, "{}", err.title());
        let user_error = err.to_user_error();
        let description = user_error.description.clone();
        self.update(|snapshot| snapshot.error = Some(user_error.clone()));
        self.set_phase(JobStatus::Error, Some(&description));
        *self.retry_point.lock().await = retry_point;
        self.emit(CoordinatorEvent::Failed { error: user_error });
    }

    /// 新条目，旧的任务链与轮询一起丢弃
    async fn begin_item(&self, filename: &str, auto_process: bool) {
        self.timer.cancel();
        {
            let mut poller = self.poller.lock().await;
            poller.reset();
            poller.set_auto_process(auto_process);
        }
        *self.retry_point.lock().await = RetryPoint::Nothing;

        let old = self.snapshot_tx.send_replace(Snapshot {
            item: Some(UploadItem::new(filename)),
            ..Snapshot::default()
        });
        if old.phase != JobStatus::Idle {
            self.emit(CoordinatorEvent::StateChanged { old: old.phase, new: JobStatus::Idle });
        }
    }

    async fn track(&self, task_id: &TaskId) {
        let chain = {
            let mut poller = self.poller.lock().await;
            poller.track(task_id.clone());
            poller.chain().to_vec()
        };
        self.update(|snapshot| {
            snapshot.active_task = Some(task_id.clone());
            snapshot.task_chain = chain;
            snapshot.consecutive_failures = 0;
            snapshot.connection_issue = false;
            snapshot.error = None;
            if let Some(item) = snapshot.item.as_mut() {
                item.task_id = Some(task_id.clone());
            }
        });
    }

    async fn submit_url(self: &Arc<Self>, input: &str, auto_process: bool, epoch: u64) -> Result<TaskId> {
        // 校验失败不改变当前状态
        let url = validate_video_url(input)?;

        self.begin_item(url.as_str(), auto_process).await;
        self.set_phase(JobStatus::Downloading, None);

        let request = DownloadRequest {
            url: url.to_string(),
            auto_process,
        };
        let accepted = match self.api.submit_download(&request).await {
            Ok(accepted) => accepted,
            Err(err) => {
                self.fail(&err, RetryPoint::SubmitUrl { url: request.url, auto_process }).await;
                return Err(err);
            }
        };

        info!(task_id = %accepted.task_id, url = %request.url, "download started");
        if let Some(video_id) = accepted.video_id.clone() {
            self.update(|snapshot| snapshot.video_id = Some(video_id));
        }
        self.track(&accepted.task_id).await;
        self.start_polling(epoch, Duration::ZERO);

        Ok(accepted.task_id)
    }

    async fn upload_file(self: &Arc<Self>, path: &Path, epoch: u64) -> Result<VideoId> {
        let (filename, size) = validate_upload_file(path, self.config.max_upload_bytes).await?;
        let content_type = content_type_for(path);

        self.begin_item(&filename, self.config.auto_process).await;
        self.set_phase(JobStatus::Uploading, None);
        info!(%filename, size = %crate::utils::format_bytes(size), "upload started");

        let target = match self.api.request_upload_url(&filename, content_type).await {
            Ok(target) => target,
            Err(err) => {
                self.fail(&err, RetryPoint::Upload(path.to_path_buf())).await;
                return Err(err);
            }
        };

        if let Err(err) = self.transfer(&target, path, content_type).await {
            self.fail(&err, RetryPoint::Upload(path.to_path_buf())).await;
            return Err(err);
        }

        let registration = RegisterUpload {
            video_id: target.video_id.clone(),
            s3_key: target.s3_key.clone(),
            filename,
        };
        self.register(registration, epoch).await
    }

    async fn transfer(self: &Arc<Self>, target: &PresignedUpload, path: &Path, content_type: &str) -> Result<()> {
        let weak: Weak<Shared> = Arc::downgrade(self);
        let on_progress: ProgressCallback = Arc::new(move |progress: TransferProgress| {
            if let Some(shared) = weak.upgrade() {
                // 100% 留给登记完成之后
                shared.set_progress(progress.percentage().min(99));
            }
        });

        self.api.transfer_file(target, path, content_type, on_progress).await
    }

    async fn register(self: &Arc<Self>, registration: RegisterUpload, epoch: u64) -> Result<VideoId> {
        let result = RetryBuilder::new()
            .max_attempts(self.config.registration_attempts)
            .strategy(self.config.backoff.clone())
            .run(|| self.api.register_upload(&registration))
            .await;

        if let Err(err) = result {
            let err = match err {
                err @ ClipError::Registration { .. } => err,
                other => ClipError::registration(None, other.to_string()),
            };
            self.fail(&err, RetryPoint::Registration(registration)).await;
            return Err(err);
        }

        let RegisterUpload { video_id, s3_key, filename } = registration;
        info!(%video_id, %s3_key, "upload registered");

        self.update(|snapshot| {
            snapshot.video_id = Some(video_id.clone());
            snapshot.error = None;
            if let Some(item) = snapshot.item.as_mut() {
                item.s3_key = Some(s3_key.clone());
            }
        });
        self.set_progress(100);
        self.set_phase(JobStatus::Uploaded, None);
        self.emit(CoordinatorEvent::Uploaded {
            video_id: video_id.clone(),
            s3_key,
            filename,
        });

        if self.config.auto_process {
            self.schedule_auto_process(epoch);
        }

        Ok(video_id)
    }

    fn schedule_auto_process(self: &Arc<Self>, epoch: u64) {
        if !self.is_current(epoch) {
            debug!("cancelled, automatic processing not scheduled");
            return;
        }

        let shared = self.clone();
        let delay = self.config.auto_process_delay();
        self.timer.replace(move |token| async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(delay) => {}
            }
            if let Err(err) = shared.start_processing(Trigger::Auto, epoch).await {
                warn!(error = %err, "automatic processing did not start");
            }
        });
    }

    /// 检查状态并占用处理请求，两步在同一把锁内完成
    async fn claim_processing(&self) -> Result<(VideoId, Option<String>)> {
        let mut poller = self.poller.lock().await;
        let (phase, video_id, s3_key) = {
            let snapshot = self.snapshot_tx.borrow();
            (
                snapshot.phase,
                snapshot.video_id.clone(),
                snapshot.item.as_ref().and_then(|item| item.s3_key.clone()),
            )
        };

        match phase {
            JobStatus::Uploaded | JobStatus::Downloaded | JobStatus::Error => {}
            JobStatus::Idle
            | JobStatus::Uploading
            | JobStatus::Downloading
            | JobStatus::ProcessingStarted
            | JobStatus::Queued
            | JobStatus::Processing
            | JobStatus::Transcribing
            | JobStatus::Analyzing
            | JobStatus::Completed => {
                return Err(ClipError::validation(format!("Cannot start processing while {}", phase)));
            }
        }
        let video_id = video_id.ok_or_else(|| ClipError::validation("Nothing to process yet"))?;
        if !poller.claim_processing() {
            return Err(ClipError::validation("Processing has already started"));
        }

        Ok((video_id, s3_key))
    }

    async fn start_processing(self: &Arc<Self>, trigger: Trigger, epoch: u64) -> Result<TaskId> {
        let (video_id, s3_key) = self.claim_processing().await?;
        if trigger == Trigger::Manual {
            // 自动触发时当前任务就在定时器里
            self.timer.cancel();
        }
        self.set_phase(JobStatus::ProcessingStarted, None);
        self.set_progress(0);

        let accepted = match self.api.process_video(&video_id, s3_key.as_deref()).await {
            Ok(accepted) => accepted,
            Err(err) => {
                self.poller.lock().await.release_processing();
                self.fail(&err, RetryPoint::StartProcessing).await;
                return Err(err);
            }
        };

        info!(%video_id, task_id = %accepted.task_id, ?trigger, "processing started");
        self.track(&accepted.task_id).await;
        self.start_polling(epoch, Duration::ZERO);

        Ok(accepted.task_id)
    }

    async fn watch_task(self: &Arc<Self>, task_id: TaskId, epoch: u64) -> Result<()> {
        if task_id.as_str().trim().is_empty() {
            return Err(ClipError::validation("Task id must not be empty"));
        }

        self.begin_item(&format!("task {}", task_id), self.config.auto_process).await;
        self.track(&task_id).await;
        self.start_polling(epoch, Duration::ZERO);
        Ok(())
    }

    async fn retry(self: &Arc<Self>, epoch: u64) -> Result<()> {
        let point = std::mem::replace(&mut *self.retry_point.lock().await, RetryPoint::Nothing);
        debug!(?point, "retrying");

        match point {
            RetryPoint::Upload(path) => self.upload_file(&path, epoch).await.map(|_| ()),
            RetryPoint::SubmitUrl { url, auto_process } => {
                self.submit_url(&url, auto_process, epoch).await.map(|_| ())
            }
            RetryPoint::Registration(registration) => {
                self.set_phase(JobStatus::Uploading, None);
                self.register(registration, epoch).await.map(|_| ())
            }
            RetryPoint::StartProcessing => {
                self.start_processing(Trigger::Manual, epoch).await.map(|_| ())
            }
            RetryPoint::Poll | RetryPoint::Nothing => {
                let active = {
                    let mut poller = self.poller.lock().await;
                    poller.rearm();
                    poller.active().cloned()
                };
                let task_id = active.ok_or_else(|| ClipError::validation("Nothing to retry"))?;
                info!(%task_id, "resuming status polling");
                self.update(|snapshot| {
                    snapshot.error = None;
                    snapshot.consecutive_failures = 0;
                    snapshot.connection_issue = false;
                });
                self.start_polling(epoch, Duration::ZERO);
                Ok(())
            }
        }
    }

    /// 安装轮询任务，替换之前的定时任务
    fn start_polling(self: &Arc<Self>, epoch: u64, first_delay: Duration) {
        if !self.is_current(epoch) {
            debug!("cancelled, polling not restarted");
            return;
        }

        let shared = self.clone();
        self.timer.replace(move |token| shared.poll_loop(token, first_delay));
    }

    async fn poll_loop(self: Arc<Self>, token: CancellationToken, mut delay: Duration) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(delay) => {}
            }

            let Some(task_id) = self.poller.lock().await.active().cloned() else {
                return;
            };
            debug!(%task_id, "polling status");

            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = self.api.task_status(&task_id) => result,
            };

            let next = match result {
                Ok(status) => match self.apply_status(&task_id, status).await {
                    Some(next) => next,
                    None => return,
                },
                Err(err) => match self.apply_failure(&task_id, &err).await {
                    Some(retry_after) => NextPoll::After(retry_after),
                    None => return,
                },
            };

            let next = match next {
                NextPoll::LookupProcessing { video_id } => {
                    let lookup = tokio::select! {
                        _ = token.cancelled() => return,
                        lookup = self.api.processing_status(&video_id) => lookup,
                    };
                    self.resolve_lookup(&video_id, lookup).await
                }
                other => other,
            };

            delay = match self.follow(next) {
                Some(delay) => delay,
                None => return,
            };
        }
    }

    async fn resolve_lookup(&self, video_id: &VideoId, lookup: Result<super::types::ProcessingStatus>) -> NextPoll {
        let mut poller = self.poller.lock().await;
        match lookup {
            Ok(status) if status.has_processing_started => {
                debug!(%video_id, status = ?status.status, "processing has started");
                status
                    .process_task_id
                    .and_then(|to| poller.redirect(to))
                    .unwrap_or_else(|| poller.after_transfer_done())
            }
            Ok(_) => {
                debug!(%video_id, "processing has not started yet");
                poller.after_transfer_done()
            }
            Err(err) => {
                warn!(%video_id, error = %err, "processing status lookup failed");
                poller.after_transfer_done()
            }
        }
    }

    /// 执行下一步；返回 `None` 表示轮询结束
    fn follow(&self, next: NextPoll) -> Option<Duration> {
        match next {
            NextPoll::After(delay) => Some(delay),
            NextPoll::Redirect { from, to, after } => {
                self.update(|snapshot| {
                    snapshot.active_task = Some(to.clone());
                    if !snapshot.task_chain.contains(&to) {
                        snapshot.task_chain.push(to.clone());
                    }
                    if let Some(item) = snapshot.item.as_mut() {
                        item.task_id = Some(to.clone());
                    }
                });
                self.emit(CoordinatorEvent::Redirected { from, to });
                Some(after)
            }
            NextPoll::Wait => {
                info!("transfer done, waiting for processing to be started");
                None
            }
            NextPoll::Stop => None,
            NextPoll::LookupProcessing { video_id } => {
                // 只在 poll_loop 中解析
                warn!(%video_id, "unresolved processing lookup");
                None
            }
        }
    }

    async fn apply_status(&self, task_id: &TaskId, status: TaskStatus) -> Option<NextPoll> {
        let outcome = self.poller.lock().await.on_status(task_id, &status)?;

        if let Some(video_id) = status.video_id().cloned() {
            self.update(|snapshot| snapshot.video_id = Some(video_id));
        }
        self.update(|snapshot| {
            snapshot.consecutive_failures = 0;
            snapshot.connection_issue = false;
        });
        if outcome.connection_restored {
            info!(%task_id, "connection restored");
            self.emit(CoordinatorEvent::ConnectionRestored);
        }

        match outcome.status {
            JobStatus::Error => {
                let err = ClipError::remote_job(status.message.as_deref());
                let description = err.description();
                self.set_phase(JobStatus::Error, Some(&description));
                if outcome.notice == Some(Notice::Failed) {
                    self.fail(&err, RetryPoint::Poll).await;
                }
            }
            other => {
                self.set_phase(other, status.message.as_deref());
                self.set_progress(outcome.progress);
            }
        }

        match outcome.notice {
            Some(Notice::TransferDone) if outcome.status == JobStatus::Downloaded => {
                let video_id = self.snapshot_tx.borrow().video_id.clone();
                info!(%task_id, "download complete");
                self.emit(CoordinatorEvent::Downloaded {
                    video_id,
                    task_id: task_id.clone(),
                });
            }
            Some(Notice::Completed) => {
                let clips = build_clips(status.clips.as_deref().unwrap_or_default());
                info!(%task_id, clips = clips.len(), "processing complete");
                self.update(|snapshot| snapshot.clips = clips.clone());
                self.emit(CoordinatorEvent::Completed {
                    task_id: task_id.clone(),
                    clips,
                });
            }
            _ => {}
        }

        Some(outcome.next)
    }

    async fn apply_failure(&self, task_id: &TaskId, err: &ClipError) -> Option<Duration> {
        let outcome = self.poller.lock().await.on_failure(task_id)?;
        warn!(
            %task_id,
            failures = outcome.consecutive_failures,
            error = %err,
            "status poll failed"
        );

        self.update(|snapshot| {
            snapshot.consecutive_failures = outcome.consecutive_failures;
            if outcome.show_connection_issue {
                snapshot.connection_issue = true;
            }
        });
        if outcome.show_connection_issue {
            self.emit(CoordinatorEvent::ConnectionIssue {
                failures: outcome.consecutive_failures,
            });
        }

        Some(outcome.retry_after)
    }
}
