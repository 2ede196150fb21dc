use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::broadcast;
use clipflow::core::{
    ClipPayload,
    DownloadAccepted,
    DownloadRequest,
    PresignedUpload,
    ProcessAccepted,
    ProcessingStatus,
    ProgressCallback,
    RegisterUpload,
    TransferProgress,
    VideoInfo,
};
use clipflow::{
    ClientConfig, ClipApi, ClipError, ClipTemplate, Coordinator, CoordinatorEvent, JobStatus,
    Result, TaskId, TaskStatus, VideoId,
};

enum Reply {
    Status(TaskStatus),
    Fail,
}

/// 模拟处理服务 - 按任务 ID 预设状态序列，记录每一次调用
#[derive(Default)]
struct MockApi {
    calls: Mutex<Vec<String>>,
    script: Mutex<HashMap<String, VecDeque<Reply>>>,
    last: Mutex<HashMap<String, TaskStatus>>,
    register_failure: Mutex<Option<u16>>,
    processing: Mutex<Option<ProcessingStatus>>,
    downloads: Mutex<u32>,
    process_delay: Mutex<Option<Duration>>,
}

impl MockApi {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self, task_id: &str, replies: Vec<Reply>) {
        self.script
            .lock()
            .unwrap()
            .entry(task_id.to_string())
            .or_default()
            .extend(replies);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn status_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| call.strip_prefix("status:").map(String::from))
            .collect()
    }

    fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|call| call.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ClipApi for MockApi {
    async fn request_upload_url(&self, filename: &str, content_type: &str) -> Result<PresignedUpload> {
        self.record(format!("upload-url:{}:{}", filename, content_type));
        Ok(PresignedUpload {
            upload_url: "https://storage.example.com/bucket".to_string(),
            upload_fields: [("key".to_string(), "uploads/v-up".to_string())].into_iter().collect(),
            video_id: VideoId::from("v-up"),
            s3_key: "uploads/v-up".to_string(),
        })
    }

    async fn transfer_file(
        &self,
        _target: &PresignedUpload,
        path: &Path,
        _content_type: &str,
        on_progress: ProgressCallback,
    ) -> Result<()> {
        self.record("transfer".to_string());
        let total = tokio::fs::metadata(path).await?.len();
        on_progress(TransferProgress { bytes_sent: total / 2, total_bytes: total });
        on_progress(TransferProgress { bytes_sent: total, total_bytes: total });
        Ok(())
    }

    async fn register_upload(&self, registration: &RegisterUpload) -> Result<()> {
        self.record(format!("register:{}", registration.video_id));
        match *self.register_failure.lock().unwrap() {
            Some(code) => Err(ClipError::registration(Some(code), "Internal Server Error")),
            None => Ok(()),
        }
    }

    async fn submit_download(&self, request: &DownloadRequest) -> Result<DownloadAccepted> {
        self.record(format!("download:{}:{}", request.url, request.auto_process));
        let mut downloads = self.downloads.lock().unwrap();
        *downloads += 1;
        Ok(DownloadAccepted {
            task_id: TaskId::new(format!("dl-{}", *downloads)),
            video_id: None,
        })
    }

    async fn process_video(&self, video_id: &VideoId, s3_key: Option<&str>) -> Result<ProcessAccepted> {
        self.record(format!("process:{}:{}", video_id, s3_key.unwrap_or("-")));
        let delay = *self.process_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(ProcessAccepted { task_id: TaskId::from("proc-1") })
    }

    async fn task_status(&self, task_id: &TaskId) -> Result<TaskStatus> {
        self.record(format!("status:{}", task_id));
        let reply = self
            .script
            .lock()
            .unwrap()
            .get_mut(task_id.as_str())
            .and_then(|queue| queue.pop_front());

        match reply {
            Some(Reply::Status(status)) => {
                self.last.lock().unwrap().insert(task_id.to_string(), status.clone());
                Ok(status)
            }
            Some(Reply::Fail) => Err(ClipError::network("connection reset by peer")),
            None => Ok(self
                .last
                .lock()
                .unwrap()
                .get(task_id.as_str())
                .cloned()
                .unwrap_or_else(|| TaskStatus::new(JobStatus::Processing))),
        }
    }

    async fn processing_status(&self, video_id: &VideoId) -> Result<ProcessingStatus> {
        self.record(format!("processing-status:{}", video_id));
        Ok(self.processing.lock().unwrap().clone().unwrap_or_default())
    }
}

fn status(s: JobStatus) -> Reply {
    Reply::Status(TaskStatus::new(s))
}

fn redirecting(s: JobStatus, to: &str) -> Reply {
    let mut status = TaskStatus::new(s);
    status.process_task_id = Some(TaskId::from(to));
    Reply::Status(status)
}

fn completed(n: usize) -> Reply {
    let mut status = TaskStatus::new(JobStatus::Completed);
    status.progress = 100.0;
    status.clips = Some(
        (0..n)
            .map(|i| ClipPayload {
                title: Some(format!("Moment {}", i)),
                start_time: i as f64 * 60.0,
                end_time: i as f64 * 60.0 + 45.0,
                url: format!("https://cdn.example.com/{}.mp4", i),
                thumbnail_url: None,
            })
            .collect(),
    );
    Reply::Status(status)
}

fn config() -> ClientConfig {
    ClientConfig {
        registration_attempts: 1,
        ..Default::default()
    }
}

const VIDEO_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

async fn wait_for<F>(events: &mut broadcast::Receiver<CoordinatorEvent>, mut pred: F) -> CoordinatorEvent
where
    F: FnMut(&CoordinatorEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(600), async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => {}
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    })
    .await
    .expect("event did not arrive")
}

fn drain(events: &mut broadcast::Receiver<CoordinatorEvent>) -> Vec<CoordinatorEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

async fn episode_file(dir: &tempfile::TempDir) -> PathBuf {
    let path = dir.path().join("episode.mp4");
    tokio::fs::write(&path, vec![7u8; 4096]).await.unwrap();
    path
}

#[tokio::test(start_paused = true)]
async fn test_completed_with_clips_notifies_once() {
    let api = MockApi::new();
    api.script("dl-1", vec![
        status(JobStatus::Downloading),
        status(JobStatus::Downloaded),
        status(JobStatus::Processing),
        status(JobStatus::Transcribing),
        completed(3),
    ]);
    let coordinator = Coordinator::new(api.clone(), config());
    let mut events = coordinator.subscribe_events();

    coordinator.submit_url(VIDEO_URL).await.unwrap();
    let event = wait_for(&mut events, |e| matches!(e, CoordinatorEvent::Completed { .. })).await;
    let CoordinatorEvent::Completed { clips, task_id } = event else { unreachable!() };
    assert_eq!(clips.len(), 3);
    assert_eq!(task_id, TaskId::from("dl-1"));

    let polls = api.status_calls().len();
    tokio::time::sleep(Duration::from_secs(120)).await;

    let later = drain(&mut events);
    assert!(!later.iter().any(|e| matches!(e, CoordinatorEvent::Completed { .. })));
    assert_eq!(api.status_calls().len(), polls, "terminal state must stop polling");

    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.phase, JobStatus::Completed);
    assert_eq!(snapshot.clips.len(), 3);
    assert_eq!(snapshot.clips[2].duration, "0:45");
    assert!(!coordinator.is_polling());
}

#[tokio::test(start_paused = true)]
async fn test_redirect_moves_all_polls_to_new_task() {
    let api = MockApi::new();
    api.script("dl-1", vec![
        status(JobStatus::Downloading),
        redirecting(JobStatus::Downloaded, "proc-7"),
    ]);
    api.script("proc-7", vec![
        status(JobStatus::Queued),
        status(JobStatus::Analyzing),
        completed(2),
    ]);
    let coordinator = Coordinator::new(api.clone(), config());
    let mut events = coordinator.subscribe_events();

    coordinator.submit_url(VIDEO_URL).await.unwrap();
    wait_for(&mut events, |e| matches!(e, CoordinatorEvent::Completed { .. })).await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    let polls = api.status_calls();
    let first_redirected = polls.iter().position(|id| id == "proc-7").unwrap();
    assert!(polls[first_redirected..].iter().all(|id| id == "proc-7"), "{polls:?}");
    assert_eq!(polls.iter().filter(|id| *id == "dl-1").count(), 2);

    let all = drain(&mut events);
    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.task_chain, vec![TaskId::from("dl-1"), TaskId::from("proc-7")]);
    assert_eq!(snapshot.active_task, Some(TaskId::from("proc-7")));
    assert_eq!(snapshot.clips.len(), 2);
    assert!(!all.iter().any(|e| matches!(e, CoordinatorEvent::Completed { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_downloaded_then_completed_are_separate_notifications() {
    let api = MockApi::new();
    api.script("dl-1", vec![redirecting(JobStatus::Downloaded, "proc-1")]);
    api.script("proc-1", vec![status(JobStatus::Processing), completed(1)]);
    let coordinator = Coordinator::new(api.clone(), config());
    let mut events = coordinator.subscribe_events();

    coordinator.submit_url(VIDEO_URL).await.unwrap();
    wait_for(&mut events, |e| matches!(e, CoordinatorEvent::Downloaded { .. })).await;
    let redirected = wait_for(&mut events, |e| matches!(e, CoordinatorEvent::Redirected { .. })).await;
    assert_eq!(
        redirected,
        CoordinatorEvent::Redirected { from: TaskId::from("dl-1"), to: TaskId::from("proc-1") }
    );
    let done = wait_for(&mut events, |e| matches!(e, CoordinatorEvent::Completed { .. })).await;
    assert!(matches!(done, CoordinatorEvent::Completed { ref task_id, .. } if *task_id == TaskId::from("proc-1")));

    tokio::time::sleep(Duration::from_secs(30)).await;
    let rest = drain(&mut events);
    assert!(!rest.iter().any(|e| matches!(e, CoordinatorEvent::Downloaded { .. } | CoordinatorEvent::Completed { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_processing_status_lookup_redirects() {
    let api = MockApi::new();
    let mut downloaded = TaskStatus::new(JobStatus::Downloaded);
    downloaded.video_info = Some(VideoInfo { video_id: Some(VideoId::from("v-42")), title: None });
    api.script("dl-1", vec![Reply::Status(downloaded)]);
    api.script("proc-3", vec![completed(1)]);
    *api.processing.lock().unwrap() = Some(ProcessingStatus {
        has_processing_started: true,
        status: Some("queued".to_string()),
        process_task_id: Some(TaskId::from("proc-3")),
    });

    let coordinator = Coordinator::new(api.clone(), config());
    let mut events = coordinator.subscribe_events();
    coordinator.submit_url(VIDEO_URL).await.unwrap();

    let done = wait_for(&mut events, |e| matches!(e, CoordinatorEvent::Completed { .. })).await;
    assert!(matches!(done, CoordinatorEvent::Completed { ref task_id, .. } if *task_id == TaskId::from("proc-3")));
    assert!(api.calls().contains(&"processing-status:v-42".to_string()));
    assert_eq!(coordinator.snapshot().video_id, Some(VideoId::from("v-42")));
}

#[tokio::test(start_paused = true)]
async fn test_four_failures_then_success_hides_indicator() {
    let api = MockApi::new();
    api.script("dl-1", vec![
        Reply::Fail,
        Reply::Fail,
        Reply::Fail,
        Reply::Fail,
        status(JobStatus::Processing),
    ]);
    let coordinator = Coordinator::new(api.clone(), config());
    let mut events = coordinator.subscribe_events();
    let mut snapshots = coordinator.subscribe();

    coordinator.submit_url(VIDEO_URL).await.unwrap();

    let failing = snapshots.wait_for(|s| s.consecutive_failures == 4).await.unwrap().clone();
    assert!(!failing.connection_issue);
    assert_eq!(failing.phase, JobStatus::Downloading);

    let recovered = snapshots.wait_for(|s| s.phase == JobStatus::Processing).await.unwrap().clone();
    assert_eq!(recovered.consecutive_failures, 0);
    assert!(!recovered.connection_issue);

    coordinator.cancel();
    let all = drain(&mut events);
    assert!(!all.iter().any(|e| matches!(e, CoordinatorEvent::ConnectionIssue { .. })));
    assert!(!all.iter().any(|e| matches!(e, CoordinatorEvent::Failed { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_connection_issue_shown_exactly_once() {
    let api = MockApi::new();
    api.script("dl-1", (0..9).map(|_| Reply::Fail).collect());
    api.script("dl-1", vec![status(JobStatus::Transcribing)]);
    let coordinator = Coordinator::new(api.clone(), config());
    let mut events = coordinator.subscribe_events();
    let mut snapshots = coordinator.subscribe();

    coordinator.submit_url(VIDEO_URL).await.unwrap();
    let shown = snapshots.wait_for(|s| s.connection_issue).await.unwrap().clone();
    assert_eq!(shown.consecutive_failures, 5);
    assert_ne!(shown.phase, JobStatus::Error);

    snapshots.wait_for(|s| s.phase == JobStatus::Transcribing).await.unwrap();
    coordinator.cancel();

    let all = drain(&mut events);
    let issues: Vec<_> = all
        .iter()
        .filter(|e| matches!(e, CoordinatorEvent::ConnectionIssue { .. }))
        .collect();
    assert_eq!(issues, vec![&CoordinatorEvent::ConnectionIssue { failures: 5 }]);
    assert!(all.contains(&CoordinatorEvent::ConnectionRestored));
    assert!(!all.iter().any(|e| matches!(e, CoordinatorEvent::Failed { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_url_never_reaches_api() {
    let api = MockApi::new();
    let coordinator = Coordinator::new(api.clone(), config());

    let err = coordinator.submit_url("not-a-url").await.unwrap_err();
    assert!(matches!(err, ClipError::Validation(_)));
    assert!(api.calls().is_empty());
    assert_eq!(coordinator.snapshot().phase, JobStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_network_calls() {
    let api = MockApi::new();
    let coordinator = Coordinator::new(api.clone(), config());
    let mut snapshots = coordinator.subscribe();

    coordinator.submit_url(VIDEO_URL).await.unwrap();
    snapshots.wait_for(|s| s.phase == JobStatus::Processing).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    coordinator.cancel();
    let before = api.calls().len();
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert_eq!(api.calls().len(), before);
    assert!(!coordinator.is_polling());
}

#[tokio::test(start_paused = true)]
async fn test_drop_stops_network_calls() {
    let api = MockApi::new();
    let coordinator = Coordinator::new(api.clone(), config());
    coordinator.submit_url(VIDEO_URL).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    drop(coordinator);
    let before = api.calls().len();
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(api.calls().len(), before);
}

#[tokio::test(start_paused = true)]
async fn test_new_chain_replaces_old_timer() {
    let api = MockApi::new();
    let coordinator = Coordinator::new(api.clone(), config());

    coordinator.submit_url(VIDEO_URL).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    coordinator.submit_url("https://youtu.be/aaaaaaaaaaa").await.unwrap();
    let switch_at = api.status_calls().len();
    tokio::time::sleep(Duration::from_secs(10)).await;

    let polls = api.status_calls();
    assert!(polls[switch_at..].iter().all(|id| id == "dl-2"), "{polls:?}");
    // 1 秒间隔，10 秒内不会超过 11 次
    assert!(polls[switch_at..].len() <= 11);
    assert_eq!(coordinator.snapshot().task_chain, vec![TaskId::from("dl-2")]);
}

#[tokio::test(start_paused = true)]
async fn test_registration_error_then_retry() {
    let dir = tempfile::tempdir().unwrap();
    let path = episode_file(&dir).await;
    let api = MockApi::new();
    *api.register_failure.lock().unwrap() = Some(500);

    let coordinator = Coordinator::new(api.clone(), ClientConfig { auto_process: false, ..config() });
    let mut events = coordinator.subscribe_events();

    let err = coordinator.upload_file(&path).await.unwrap_err();
    assert!(matches!(err, ClipError::Registration { status_code: Some(500), .. }));
    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.phase, JobStatus::Error);
    assert_ne!(snapshot.item.as_ref().unwrap().status, JobStatus::Uploaded);
    assert!(snapshot.progress < 100);
    assert!(!drain(&mut events).iter().any(|e| matches!(e, CoordinatorEvent::Uploaded { .. })));

    // 存储里已有文件，重试只需重新登记
    *api.register_failure.lock().unwrap() = None;
    coordinator.retry().await.unwrap();

    assert_eq!(api.count("transfer"), 1);
    assert_eq!(api.count("register:"), 2);
    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.phase, JobStatus::Uploaded);
    assert_eq!(snapshot.progress, 100);
    assert!(snapshot.error.is_none());
    assert!(drain(&mut events).contains(&CoordinatorEvent::Uploaded {
        video_id: VideoId::from("v-up"),
        s3_key: "uploads/v-up".to_string(),
        filename: "episode.mp4".to_string(),
    }));
}

#[tokio::test(start_paused = true)]
async fn test_upload_auto_starts_processing() {
    let dir = tempfile::tempdir().unwrap();
    let path = episode_file(&dir).await;
    let api = MockApi::new();
    api.script("proc-1", vec![status(JobStatus::Queued), completed(4)]);

    let coordinator = Coordinator::new(api.clone(), config());
    let mut events = coordinator.subscribe_events();

    coordinator.upload_file(&path).await.unwrap();
    let done = wait_for(&mut events, |e| matches!(e, CoordinatorEvent::Completed { .. })).await;
    let CoordinatorEvent::Completed { clips, .. } = done else { unreachable!() };
    assert_eq!(clips.len(), 4);

    assert_eq!(api.calls()[0], "upload-url:episode.mp4:video/mp4");
    assert!(api.calls().contains(&"process:v-up:uploads/v-up".to_string()));
    assert_eq!(api.count("process:"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_upload_waits_without_auto_process() {
    let dir = tempfile::tempdir().unwrap();
    let path = episode_file(&dir).await;
    let api = MockApi::new();
    api.script("proc-1", vec![completed(1)]);

    let coordinator = Coordinator::new(api.clone(), ClientConfig { auto_process: false, ..config() });
    coordinator.upload_file(&path).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(api.count("process:"), 0);
    assert_eq!(coordinator.snapshot().phase, JobStatus::Uploaded);

    let task = coordinator.start_processing().await.unwrap();
    assert_eq!(task, TaskId::from("proc-1"));
    let mut snapshots = coordinator.subscribe();
    snapshots.wait_for(|s| s.phase == JobStatus::Completed).await.unwrap();

    let err = coordinator.start_processing().await.unwrap_err();
    assert!(matches!(err, ClipError::Validation(_)));
}

#[tokio::test(start_paused = true)]
async fn test_download_without_auto_process_waits() {
    let api = MockApi::new();
    let mut downloaded = TaskStatus::new(JobStatus::Downloaded);
    downloaded.video_info = Some(VideoInfo { video_id: Some(VideoId::from("v-9")), title: None });
    api.script("dl-1", vec![status(JobStatus::Downloading), Reply::Status(downloaded)]);
    api.script("proc-1", vec![completed(2)]);

    let coordinator = Coordinator::new(api.clone(), config());
    let mut snapshots = coordinator.subscribe();
    coordinator.submit_url_with(VIDEO_URL, false).await.unwrap();
    assert!(api.calls()[0].ends_with(":false"));

    snapshots.wait_for(|s| s.phase == JobStatus::Downloaded).await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;
    let polls = api.status_calls().len();
    assert_eq!(polls, 2);

    coordinator.start_processing().await.unwrap();
    snapshots.wait_for(|s| s.phase == JobStatus::Completed).await.unwrap();
    assert!(api.calls().contains(&"process:v-9:-".to_string()));
    assert_eq!(
        coordinator.snapshot().task_chain,
        vec![TaskId::from("dl-1"), TaskId::from("proc-1")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_remote_error_is_normalized_and_retryable() {
    let api = MockApi::new();
    let mut failed = TaskStatus::new(JobStatus::Error);
    failed.message = Some("ERROR: Private video. Sign in if you've been granted access".to_string());
    api.script("dl-1", vec![status(JobStatus::Downloading), Reply::Status(failed)]);

    let coordinator = Coordinator::new(api.clone(), config());
    let mut events = coordinator.subscribe_events();
    coordinator.submit_url(VIDEO_URL).await.unwrap();

    let failed = wait_for(&mut events, |e| matches!(e, CoordinatorEvent::Failed { .. })).await;
    let CoordinatorEvent::Failed { error } = failed else { unreachable!() };
    assert_eq!(error.title, "Processing failed");
    assert_eq!(error.description, "This video is unavailable or private");

    api.script("dl-1", vec![status(JobStatus::Processing), completed(1)]);
    coordinator.retry().await.unwrap();
    wait_for(&mut events, |e| matches!(e, CoordinatorEvent::Completed { .. })).await;
    assert_eq!(coordinator.snapshot().phase, JobStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_clip_templates_stay_local() {
    let api = MockApi::new();
    api.script("dl-1", vec![completed(2)]);
    let coordinator = Coordinator::new(api.clone(), config());
    let mut snapshots = coordinator.subscribe();

    coordinator.submit_url(VIDEO_URL).await.unwrap();
    snapshots.wait_for(|s| s.clips.len() == 2).await.unwrap();
    let calls_before = api.calls().len();

    coordinator.set_clip_template("clip-2", ClipTemplate::QuizShow).unwrap();
    let snapshot = coordinator.snapshot();
    assert_eq!(snapshot.clips[0].template, ClipTemplate::None);
    assert_eq!(snapshot.clips[1].template, ClipTemplate::QuizShow);
    assert_eq!(api.calls().len(), calls_before);
}

#[tokio::test(start_paused = true)]
async fn test_watch_existing_task() {
    let api = MockApi::new();
    api.script("ext-9", vec![status(JobStatus::Analyzing), completed(2)]);
    let coordinator = Coordinator::new(api.clone(), config());
    let mut events = coordinator.subscribe_events();

    coordinator.watch_task(TaskId::from("ext-9")).await.unwrap();
    wait_for(&mut events, |e| matches!(e, CoordinatorEvent::Completed { .. })).await;

    assert_eq!(api.status_calls(), vec!["ext-9".to_string(), "ext-9".to_string()]);
    assert!(coordinator.watch_task(TaskId::from("  ")).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_manual_start_during_auto_delay_submits_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = episode_file(&dir).await;
    let api = MockApi::new();
    *api.process_delay.lock().unwrap() = Some(Duration::from_secs(2));
    api.script("proc-1", vec![status(JobStatus::Processing), completed(1)]);

    let coordinator = Coordinator::new(api.clone(), config());
    let mut events = coordinator.subscribe_events();
    coordinator.upload_file(&path).await.unwrap();

    // 自动处理还在等待 1 秒延迟
    coordinator.start_processing().await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(api.count("process:"), 1);
    wait_for(&mut events, |e| matches!(e, CoordinatorEvent::Completed { .. })).await;
    assert_eq!(coordinator.snapshot().task_chain, vec![TaskId::from("proc-1")]);
}

#[tokio::test(start_paused = true)]
async fn test_overlapping_start_processing_submits_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = episode_file(&dir).await;
    let api = MockApi::new();
    *api.process_delay.lock().unwrap() = Some(Duration::from_secs(2));

    let coordinator = Coordinator::new(api.clone(), ClientConfig { auto_process: false, ..config() });
    coordinator.upload_file(&path).await.unwrap();

    let (first, second) = tokio::join!(coordinator.start_processing(), coordinator.start_processing());
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(r, Err(ClipError::Validation(_)))));
    assert_eq!(api.count("process:"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_start_processing_rejected_while_downloading() {
    let api = MockApi::new();
    let mut downloading = TaskStatus::new(JobStatus::Downloading);
    downloading.video_info = Some(VideoInfo { video_id: Some(VideoId::from("v-5")), title: None });
    api.script("dl-1", vec![Reply::Status(downloading)]);

    let coordinator = Coordinator::new(api.clone(), config());
    let mut snapshots = coordinator.subscribe();
    coordinator.submit_url(VIDEO_URL).await.unwrap();
    snapshots.wait_for(|s| s.video_id.is_some()).await.unwrap();

    let err = coordinator.start_processing().await.unwrap_err();
    assert!(matches!(err, ClipError::Validation(_)));
    assert_eq!(api.count("process:"), 0);
    assert_eq!(coordinator.snapshot().phase, JobStatus::Downloading);
    assert!(coordinator.is_polling());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_start_processing_sticks() {
    let dir = tempfile::tempdir().unwrap();
    let path = episode_file(&dir).await;
    let api = MockApi::new();
    *api.process_delay.lock().unwrap() = Some(Duration::from_secs(2));

    let coordinator = Coordinator::new(api.clone(), ClientConfig { auto_process: false, ..config() });
    coordinator.upload_file(&path).await.unwrap();

    let (started, _) = tokio::join!(coordinator.start_processing(), async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        coordinator.cancel();
    });
    assert_eq!(started.unwrap(), TaskId::from("proc-1"));
    assert!(!coordinator.is_polling());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(api.status_calls().is_empty());

    // 取消之后发起的操作照常轮询
    coordinator.retry().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!api.status_calls().is_empty());
}
