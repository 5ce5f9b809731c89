use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 服务器监听地址
    pub host: String,
    /// HTTP / WebSocket 端口
    pub port: u16,
    /// 最大连接数
    pub max_connections: u32,
    /// WebSocket ping 间隔（秒），同时刷新 presence TTL
    pub heartbeat_interval: u64,
    /// 日志级别
    pub log_level: String,
    /// 日志配置
    pub logging: LoggingConfig,
    /// 在线状态配置
    pub presence: PresenceConfig,
    /// Redis 配置（presence.backend = redis 时必填）
    pub redis: Option<RedisConfig>,
    /// 持久化配置
    pub storage: StorageConfig,
    /// 消息投递配置
    pub delivery: DeliveryConfig,
    /// 通话配置
    pub call: CallConfig,
    /// 是否启用 Prometheus 指标
    pub metrics_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9090,
            max_connections: 10000,
            heartbeat_interval: 25,
            log_level: "info".to_string(),
            logging: LoggingConfig::default(),
            presence: PresenceConfig::default(),
            redis: None,
            storage: StorageConfig::default(),
            delivery: DeliveryConfig::default(),
            call: CallConfig::default(),
            metrics_enabled: true,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval.max(1))
    }

    /// 从 TOML 文件加载配置
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("无法读取配置文件: {:?}", path.as_ref()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content).with_context(|| "配置文件格式错误")?;
        let config: Self = toml_config.into();
        config.validate()?;
        Ok(config)
    }

    /// 校验跨字段约束
    pub fn validate(&self) -> Result<()> {
        if self.presence.backend == PresenceBackend::Redis && self.redis.is_none() {
            anyhow::bail!("presence.backend = \"redis\" 需要配置 [redis] url 或 REDIS_URL");
        }
        if self.storage.backend == StorageBackend::Postgres && self.storage.database_url.is_none() {
            anyhow::bail!("storage.backend = \"postgres\" 需要配置 database_url 或 DATABASE_URL");
        }
        if self.presence.ttl_secs == 0 {
            anyhow::bail!("presence.ttl_secs 必须大于 0");
        }
        Ok(())
    }

    /// 从环境变量加载配置（PRIVCHAT_ 前缀）
    pub fn merge_from_env(&mut self) -> Result<()> {
        if let Ok(host) = env::var("PRIVCHAT_HOST") {
            self.host = host;
        }
        if let Ok(port) = env::var("PRIVCHAT_PORT") {
            self.port = port.parse().unwrap_or(self.port);
        }
        if let Ok(max_conn) = env::var("PRIVCHAT_MAX_CONNECTIONS") {
            self.max_connections = max_conn.parse().unwrap_or(self.max_connections);
        }
        if let Ok(log_level) = env::var("PRIVCHAT_LOG_LEVEL") {
            self.log_level = log_level;
        }
        if let Ok(log_format) = env::var("PRIVCHAT_LOG_FORMAT") {
            self.logging.format = Some(log_format);
        }
        if let Ok(ttl) = env::var("PRIVCHAT_PRESENCE_TTL") {
            self.presence.ttl_secs = ttl.parse().unwrap_or(self.presence.ttl_secs);
        }
        if let Ok(backend) = env::var("PRIVCHAT_PRESENCE_BACKEND") {
            self.presence.backend = PresenceBackend::parse(&backend)
                .with_context(|| format!("无效的 PRIVCHAT_PRESENCE_BACKEND: {}", backend))?;
        }
        if let Ok(backend) = env::var("PRIVCHAT_STORAGE_BACKEND") {
            self.storage.backend = StorageBackend::parse(&backend)
                .with_context(|| format!("无效的 PRIVCHAT_STORAGE_BACKEND: {}", backend))?;
        }
        if let Ok(timeout) = env::var("PRIVCHAT_CALL_RING_TIMEOUT") {
            self.call.ring_timeout_secs = timeout.parse().unwrap_or(self.call.ring_timeout_secs);
        }

        // 通用环境变量
        if let Ok(db_url) = env::var("DATABASE_URL") {
            self.storage.database_url = Some(db_url);
        }
        if let Ok(redis_url) = env::var("REDIS_URL") {
            self.set_redis_url(redis_url);
        }
        Ok(())
    }

    fn set_redis_url(&mut self, url: String) {
        match self.redis.as_mut() {
            Some(redis) => redis.url = url,
            None => self.redis = Some(RedisConfig::with_url(url)),
        }
    }

    /// 从命令行参数合并配置
    pub fn merge_from_cli(&mut self, cli: &crate::cli::Cli) {
        if let Some(host) = &cli.host {
            self.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.port = port;
        }
        if let Some(max_conn) = cli.max_connections {
            self.max_connections = max_conn;
        }
        if let Some(db_url) = &cli.database_url {
            self.storage.database_url = Some(db_url.clone());
        }
        if let Some(redis_url) = &cli.redis_url {
            self.set_redis_url(redis_url.clone());
        }
        if let Some(log_level) = cli.get_log_level() {
            self.log_level = log_level;
        }
        if let Some(log_format) = cli.get_log_format() {
            self.logging.format = Some(log_format);
        }
        if let Some(log_file) = &cli.log_file {
            self.logging.file = Some(log_file.clone());
        }
    }

    /// 加载配置（按优先级：命令行 > 环境变量 > 配置文件 > 默认值）
    pub fn load(cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = Self::new();

        if let Some(config_file) = &cli.config_file {
            if Path::new(config_file).exists() {
                info!("📄 从配置文件加载: {}", config_file);
                config = Self::from_toml_file(config_file)?;
            } else {
                tracing::warn!("⚠️ 配置文件不存在: {}", config_file);
            }
        } else if Path::new("config.toml").exists() {
            info!("📄 从默认配置文件加载: config.toml");
            config = Self::from_toml_file("config.toml")?;
        }

        config.merge_from_env()?;
        config.merge_from_cli(cli);
        config.validate()?;

        Ok(config)
    }
}

/// 日志配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    /// compact / pretty / json
    pub format: Option<String>,
    /// 日志文件路径（按天滚动）
    pub file: Option<String>,
}

/// 在启动日志系统之前，快速读取 [logging] 段
pub fn load_early_logging_config(config_file: Option<&str>) -> LoggingConfig {
    let path = config_file.unwrap_or("config.toml");
    let Ok(content) = fs::read_to_string(path) else {
        return LoggingConfig::default();
    };
    toml::from_str::<TomlConfig>(&content)
        .ok()
        .and_then(|c| c.logging)
        .map(|l| LoggingConfig {
            level: l.level,
            format: l.format,
            file: l.file,
        })
        .unwrap_or_default()
}

/// Presence 存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceBackend {
    Memory,
    Redis,
}

impl PresenceBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Some(PresenceBackend::Memory),
            "redis" => Some(PresenceBackend::Redis),
            _ => None,
        }
    }
}

/// 在线状态配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    pub backend: PresenceBackend,
    /// 在线记录/连接集合的 TTL（秒）
    pub ttl_secs: u64,
    /// 离线记录保留时长（秒），用于 last_seen
    pub offline_retention_secs: u64,
    /// 内存后端的清理间隔（秒）
    pub sweep_interval_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            backend: PresenceBackend::Memory,
            ttl_secs: 60,
            offline_retention_secs: 7 * 24 * 3600,
            sweep_interval_secs: 30,
        }
    }
}

impl PresenceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn offline_retention(&self) -> Duration {
        Duration::from_secs(self.offline_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis连接URL
    pub url: String,
    /// 连接池大小
    pub pool_size: u32,
    /// 最小空闲连接数
    pub min_idle: u32,
    /// 连接超时时间（秒）
    pub connection_timeout_secs: u64,
    /// 单条命令超时（毫秒）
    pub command_timeout_ms: u64,
    /// 空闲连接回收时间（秒）
    pub idle_timeout_secs: u64,
}

impl RedisConfig {
    pub fn with_url(url: String) -> Self {
        Self {
            url,
            pool_size: 16,
            min_idle: 2,
            connection_timeout_secs: 5,
            command_timeout_ms: 500,
            idle_timeout_secs: 300,
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// 持久化后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

impl StorageBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "memory" => Some(StorageBackend::Memory),
            "postgres" | "postgresql" => Some(StorageBackend::Postgres),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            database_url: None,
            max_connections: 20,
        }
    }
}

/// 消息投递配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// 会话参与者缓存 TTL（秒）
    pub participants_cache_ttl_secs: u64,
    /// 会话参与者缓存容量
    pub participants_cache_capacity: u64,
    /// 单条消息最大长度（字符）
    pub max_content_length: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            participants_cache_ttl_secs: 600,
            participants_cache_capacity: 100_000,
            max_content_length: 10_000,
        }
    }
}

/// 通话配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    /// 无人接听超时（秒）
    pub ring_timeout_secs: u64,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self { ring_timeout_secs: 30 }
    }
}

impl CallConfig {
    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }
}

/// TOML 配置文件结构（用于反序列化）
#[derive(Debug, Deserialize)]
struct TomlConfig {
    server: Option<TomlServerConfig>,
    presence: Option<TomlPresenceConfig>,
    redis: Option<TomlRedisConfig>,
    storage: Option<TomlStorageConfig>,
    delivery: Option<TomlDeliveryConfig>,
    call: Option<TomlCallConfig>,
    logging: Option<TomlLoggingConfig>,
    metrics: Option<TomlMetricsConfig>,
}

#[derive(Debug, Deserialize)]
struct TomlServerConfig {
    host: Option<String>,
    port: Option<u16>,
    max_connections: Option<u32>,
    heartbeat_interval: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TomlPresenceConfig {
    backend: Option<PresenceBackend>,
    ttl_secs: Option<u64>,
    offline_retention_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TomlRedisConfig {
    url: Option<String>,
    pool_size: Option<u32>,
    min_idle: Option<u32>,
    connection_timeout: Option<u64>,
    command_timeout_ms: Option<u64>,
    idle_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TomlStorageConfig {
    backend: Option<StorageBackend>,
    database_url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct TomlDeliveryConfig {
    participants_cache_ttl_secs: Option<u64>,
    participants_cache_capacity: Option<u64>,
    max_content_length: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct TomlCallConfig {
    ring_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TomlLoggingConfig {
    level: Option<String>,
    format: Option<String>,
    file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TomlMetricsConfig {
    enabled: Option<bool>,
}

impl From<TomlConfig> for ServerConfig {
    fn from(toml: TomlConfig) -> Self {
        let mut config = Self::default();

        if let Some(server) = toml.server {
            if let Some(host) = server.host {
                config.host = host;
            }
            if let Some(port) = server.port {
                config.port = port;
            }
            if let Some(max_connections) = server.max_connections {
                config.max_connections = max_connections;
            }
            if let Some(heartbeat) = server.heartbeat_interval {
                config.heartbeat_interval = heartbeat;
            }
        }

        if let Some(presence) = toml.presence {
            let defaults = PresenceConfig::default();
            config.presence = PresenceConfig {
                backend: presence.backend.unwrap_or(defaults.backend),
                ttl_secs: presence.ttl_secs.unwrap_or(defaults.ttl_secs),
                offline_retention_secs: presence
                    .offline_retention_secs
                    .unwrap_or(defaults.offline_retention_secs),
                sweep_interval_secs: presence
                    .sweep_interval_secs
                    .unwrap_or(defaults.sweep_interval_secs),
            };
        }

        if let Some(redis) = toml.redis {
            if let Some(url) = redis.url {
                let defaults = RedisConfig::with_url(url);
                config.redis = Some(RedisConfig {
                    pool_size: redis.pool_size.unwrap_or(defaults.pool_size),
                    min_idle: redis.min_idle.unwrap_or(defaults.min_idle),
                    connection_timeout_secs: redis
                        .connection_timeout
                        .unwrap_or(defaults.connection_timeout_secs),
                    command_timeout_ms: redis
                        .command_timeout_ms
                        .unwrap_or(defaults.command_timeout_ms),
                    idle_timeout_secs: redis.idle_timeout.unwrap_or(defaults.idle_timeout_secs),
                    url: defaults.url,
                });
            }
        }

        if let Some(storage) = toml.storage {
            if let Some(backend) = storage.backend {
                config.storage.backend = backend;
            }
            config.storage.database_url = storage.database_url;
            if let Some(max) = storage.max_connections {
                config.storage.max_connections = max;
            }
        }

        if let Some(delivery) = toml.delivery {
            if let Some(ttl) = delivery.participants_cache_ttl_secs {
                config.delivery.participants_cache_ttl_secs = ttl;
            }
            if let Some(capacity) = delivery.participants_cache_capacity {
                config.delivery.participants_cache_capacity = capacity;
            }
            if let Some(max_len) = delivery.max_content_length {
                config.delivery.max_content_length = max_len;
            }
        }

        if let Some(call) = toml.call {
            if let Some(timeout) = call.ring_timeout_secs {
                config.call.ring_timeout_secs = timeout;
            }
        }

        if let Some(logging) = toml.logging {
            if let Some(level) = &logging.level {
                config.log_level = level.clone();
            }
            config.logging = LoggingConfig {
                level: logging.level,
                format: logging.format,
                file: logging.file,
            };
        }

        if let Some(metrics) = toml.metrics {
            if let Some(enabled) = metrics.enabled {
                config.metrics_enabled = enabled;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.presence.ttl_secs, 60);
        assert_eq!(config.call.ring_timeout_secs, 30);
        assert_eq!(config.presence.backend, PresenceBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_overrides_defaults() {
        let config = ServerConfig::from_toml_str(
            r#"
            [server]
            port = 9999

            [presence]
            backend = "redis"
            ttl_secs = 90

            [redis]
            url = "redis://127.0.0.1:6379"
            command_timeout_ms = 200

            [call]
            ring_timeout_secs = 45
            "#,
        )
        .unwrap();

        assert_eq!(config.port, 9999);
        assert_eq!(config.presence.backend, PresenceBackend::Redis);
        assert_eq!(config.presence.ttl_secs, 90);
        assert_eq!(config.presence.sweep_interval_secs, 30);
        let redis = config.redis.unwrap();
        assert_eq!(redis.command_timeout_ms, 200);
        assert_eq!(redis.pool_size, 16);
        assert_eq!(config.call.ring_timeout_secs, 45);
    }

    #[test]
    fn test_redis_backend_requires_url() {
        let err = ServerConfig::from_toml_str("[presence]\nbackend = \"redis\"\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!(StorageBackend::parse("PostgreSQL"), Some(StorageBackend::Postgres));
        assert_eq!(PresenceBackend::parse("nope"), None);
    }
}
