use std::future::Future;
use std::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 可取消的后台任务句柄
#[derive(Debug)]
pub struct ScheduledTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let handle = tokio::spawn(f(token.clone()));
        Self { token, handle }
    }

    /// 协作式停止：任务在下一个检查点退出
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// 停止并中止任务
    pub fn cancel(&self) {
        self.token.cancel();
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// 单槽定时器：同一时间最多一个活动任务
///
/// 安装新任务前总是先停止旧任务。
#[derive(Debug, Default)]
pub struct TimerSlot {
    current: Mutex<Option<ScheduledTask>>,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// 替换当前任务
    ///
    /// 旧任务可能就是调用者自身，因此这里只做协作式停止，不中止。
    pub fn replace<F, Fut>(&self, f: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(previous) = current.take() {
            previous.stop();
        }
        *current = Some(ScheduledTask::spawn(f));
    }

    pub fn cancel(&self) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = current.take() {
            task.cancel();
        }
    }

    pub fn is_active(&self) -> bool {
        let current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        current.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}
