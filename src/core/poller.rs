//! 轮询状态机
//!
//! 只做决策，不做 I/O：协调器把每次 `/status` 的结果交给 [`PollState`]，
//! 按返回的 [`PollOutcome`] 更新界面状态并安排下一次轮询。

use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};
use crate::config::ClientConfig;
use crate::utils::RetryStrategy;
use super::types::{JobStatus, TaskId, TaskStatus, VideoId};

/// 每条任务链只通知一次的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Notice {
    /// 上传或下载完成
    TransferDone,
    Completed,
    Failed,
}

/// 下一步动作
#[derive(Debug, Clone, PartialEq)]
pub enum NextPoll {
    /// 延迟后继续轮询当前任务
    After(Duration),
    /// 切换到新任务
    Redirect {
        from: TaskId,
        to: TaskId,
        after: Duration,
    },
    /// 先查询 `/processing-status`，再决定
    LookupProcessing {
        video_id: VideoId,
    },
    /// 停止轮询，等待手动开始处理
    Wait,
    /// 终态
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub status: JobStatus,
    pub progress: u8,
    /// 之前显示过连接问题，现在恢复
    pub connection_restored: bool,
    /// 本次首次触发的通知
    pub notice: Option<Notice>,
    pub next: NextPoll,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailureOutcome {
    pub consecutive_failures: u32,
    /// 刚好跨过阈值，只在这一次为 true
    pub show_connection_issue: bool,
    pub retry_after: Duration,
}

#[derive(Debug, Clone)]
pub struct PollState {
    active: Option<TaskId>,
    chain: Vec<TaskId>,
    notified: HashSet<(Notice, TaskId)>,
    consecutive_failures: u32,
    connection_issue: bool,
    failure_threshold: u32,
    fast_interval: Duration,
    slow_interval: Duration,
    backoff: RetryStrategy,
    auto_process: bool,
    /// 本条任务链已经提交过处理请求
    processing_requested: bool,
}

impl PollState {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            active: None,
            chain: Vec::new(),
            notified: HashSet::new(),
            consecutive_failures: 0,
            connection_issue: false,
            failure_threshold: config.failure_threshold.max(1),
            fast_interval: config.poll_interval(),
            slow_interval: config.idle_poll_interval(),
            backoff: config.backoff.clone(),
            auto_process: config.auto_process,
            processing_requested: false,
        }
    }

    /// 开始新的任务链
    pub fn reset(&mut self) {
        self.active = None;
        self.chain.clear();
        self.notified.clear();
        self.consecutive_failures = 0;
        self.connection_issue = false;
        self.processing_requested = false;
    }

    /// 占用本条链唯一的一次处理请求；已被占用则返回 false
    pub fn claim_processing(&mut self) -> bool {
        !std::mem::replace(&mut self.processing_requested, true)
    }

    /// 提交失败后释放，允许再次请求
    pub fn release_processing(&mut self) {
        self.processing_requested = false;
    }

    pub fn processing_requested(&self) -> bool {
        self.processing_requested
    }

    /// 跟踪任务；已在链上的 ID 不会重复加入
    pub fn track(&mut self, task_id: TaskId) {
        if !self.chain.contains(&task_id) {
            self.chain.push(task_id.clone());
        }
        self.active = Some(task_id);
        self.consecutive_failures = 0;
    }

    /// 手动重试前调用：清空失败计数，允许再次通知失败
    pub fn rearm(&mut self) {
        self.notified.retain(|(notice, _)| *notice != Notice::Failed);
        self.consecutive_failures = 0;
        self.connection_issue = false;
    }

    pub fn active(&self) -> Option<&TaskId> {
        self.active.as_ref()
    }

    pub fn chain(&self) -> &[TaskId] {
        &self.chain
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn connection_issue(&self) -> bool {
        self.connection_issue
    }

    pub fn set_auto_process(&mut self, auto_process: bool) {
        self.auto_process = auto_process;
    }

    pub fn interval_for(&self, status: JobStatus) -> Duration {
        if status.polls_fast() {
            self.fast_interval
        } else {
            self.slow_interval
        }
    }

    fn chain_notified(&self, notice: Notice) -> bool {
        self.chain
            .iter()
            .any(|id| self.notified.contains(&(notice, id.clone())))
    }

    /// 标记通知；整条链上已经通知过则返回 false
    fn notify_once(&mut self, notice: Notice, task_id: &TaskId) -> bool {
        if self.chain_notified(notice) {
            return false;
        }
        self.notified.insert((notice, task_id.clone()))
    }

    /// 切换轮询目标
    ///
    /// 指向当前任务或链上更早任务的 ID 会被忽略，避免来回切换。
    pub fn redirect(&mut self, to: TaskId) -> Option<NextPoll> {
        let from = self.active.clone()?;
        if self.chain.contains(&to) {
            debug!(%from, %to, "ignoring redirect to a task already in the chain");
            return None;
        }

        info!(%from, %to, "switching poll target");
        self.chain.push(to.clone());
        self.active = Some(to.clone());
        Some(NextPoll::Redirect {
            from,
            to,
            after: self.fast_interval,
        })
    }

    /// 上传或下载完成、且没有新任务可切换时的动作
    pub fn after_transfer_done(&self) -> NextPoll {
        if self.auto_process {
            NextPoll::After(self.fast_interval)
        } else {
            NextPoll::Wait
        }
    }

    /// 处理一次成功的状态查询；非当前任务的响应返回 `None`
    pub fn on_status(&mut self, task_id: &TaskId, response: &TaskStatus) -> Option<PollOutcome> {
        if self.active.as_ref() != Some(task_id) {
            debug!(%task_id, "dropping stale status response");
            return None;
        }

        let connection_restored = self.connection_issue;
        self.consecutive_failures = 0;
        self.connection_issue = false;

        let status = response.status;
        let mut notice = None;

        let next = match status {
            JobStatus::Completed => {
                if self.notify_once(Notice::Completed, task_id) {
                    notice = Some(Notice::Completed);
                }
                NextPoll::Stop
            }
            JobStatus::Error => {
                if self.notify_once(Notice::Failed, task_id) {
                    notice = Some(Notice::Failed);
                }
                NextPoll::Stop
            }
            JobStatus::Uploaded | JobStatus::Downloaded => {
                if self.notify_once(Notice::TransferDone, task_id) {
                    notice = Some(Notice::TransferDone);
                }
                match self.redirect_from(status, response) {
                    Some(next) => next,
                    None => match response.video_id() {
                        Some(video_id) => NextPoll::LookupProcessing { video_id: video_id.clone() },
                        None => self.after_transfer_done(),
                    },
                }
            }
            JobStatus::ProcessingStarted
            | JobStatus::Queued
            | JobStatus::Processing
            | JobStatus::Transcribing
            | JobStatus::Analyzing => self
                .redirect_from(status, response)
                .unwrap_or(NextPoll::After(self.fast_interval)),
            JobStatus::Idle | JobStatus::Uploading | JobStatus::Downloading => {
                NextPoll::After(self.interval_for(status))
            }
        };

        Some(PollOutcome {
            status,
            progress: response.percentage(),
            connection_restored,
            notice,
            next,
        })
    }

    fn redirect_from(&mut self, status: JobStatus, response: &TaskStatus) -> Option<NextPoll> {
        if !status.accepts_redirect() {
            return None;
        }
        let to = response.process_task_id.clone()?;
        self.redirect(to)
    }

    /// 处理一次失败的状态查询；非当前任务返回 `None`
    pub fn on_failure(&mut self, task_id: &TaskId) -> Option<FailureOutcome> {
        if self.active.as_ref() != Some(task_id) {
            return None;
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let show_connection_issue =
            !self.connection_issue && self.consecutive_failures >= self.failure_threshold;
        if show_connection_issue {
            self.connection_issue = true;
            warn!(%task_id, failures = self.consecutive_failures, "connection issue threshold reached");
        }

        Some(FailureOutcome {
            consecutive_failures: self.consecutive_failures,
            show_connection_issue,
            retry_after: self.backoff.get_delay(self.consecutive_failures - 1),
        })
    }
}
