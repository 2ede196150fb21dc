use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use crate::core::{ClipError, Result};
use crate::utils::RetryStrategy;

pub const DEFAULT_CONFIG_FILE: &str = "clipflow.toml";

static CONFIG: OnceLock<ClientConfig> = OnceLock::new();

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// API 根地址
    pub api_base_url: String,
    /// 处理中状态的轮询间隔
    pub poll_interval_ms: u64,
    /// 其余状态的轮询间隔
    pub idle_poll_interval_ms: u64,
    /// 连续失败多少次后提示连接问题
    pub failure_threshold: u32,
    /// 单个请求超时
    pub request_timeout_secs: u64,
    /// 文件直传超时
    pub transfer_timeout_secs: u64,
    /// 上传或下载完成后自动开始处理
    pub auto_process: bool,
    pub auto_process_delay_ms: u64,
    pub registration_attempts: u32,
    pub max_upload_bytes: u64,
    /// 轮询失败后的退避策略
    pub backoff: RetryStrategy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8000".to_string(),
            poll_interval_ms: 1000,
            idle_poll_interval_ms: 2000,
            failure_threshold: 5,
            request_timeout_secs: 60,
            transfer_timeout_secs: 60 * 60,
            auto_process: true,
            auto_process_delay_ms: 1000,
            registration_attempts: 3,
            max_upload_bytes: 5 * 1024 * 1024 * 1024, // 5GB
            backoff: RetryStrategy::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: ClientConfig = toml::from_str(content)
            .map_err(|err| ClipError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 读取配置文件，文件不存在时使用默认值
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => {
                info!(path = %path.display(), "loaded config");
                Self::from_toml_str(&content)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.api_base_url)
            .map_err(|err| ClipError::Config(format!("invalid api_base_url {:?}: {}", self.api_base_url, err)))?;
        if self.failure_threshold == 0 {
            return Err(ClipError::Config("failure_threshold must be at least 1".to_string()));
        }
        if self.request_timeout_secs == 0 || self.transfer_timeout_secs == 0 {
            return Err(ClipError::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn auto_process_delay(&self) -> Duration {
        Duration::from_millis(self.auto_process_delay_ms)
    }
}

/// 初始化全局配置，只有第一次调用会读取文件
pub fn init_config(path: impl AsRef<Path>) -> Result<&'static ClientConfig> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }
    let config = ClientConfig::load(path)?;
    Ok(CONFIG.get_or_init(|| config))
}
