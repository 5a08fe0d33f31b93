use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const ENV_PARALLEL_BUILD: &str = "SCOPEGRAPH_PARALLEL_BUILD";
pub const ENV_BUILD_WORKERS: &str = "SCOPEGRAPH_BUILD_WORKERS";
pub const ENV_SCOPE_NAME: &str = "SCOPEGRAPH_SCOPE_NAME";

/// 容器配置
///
/// 子作用域继承父作用域的配置，只改写作用域名称。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// 作用域名称（日志与诊断用）
    pub scope_name: String,
    /// 构建时按互不相关的子图并行校验
    pub parallel_build: bool,
    /// 并行构建的工作线程数，0 表示使用 CPU 核数
    pub build_workers: usize,
    /// 瞬态实例若可释放，由发起解析的作用域记录并在结束时释放
    pub track_transient_disposables: bool,
    /// 是否统计解析次数、缓存命中等
    pub collect_stats: bool,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            scope_name: "root".to_string(),
            parallel_build: false,
            build_workers: 0,
            track_transient_disposables: true,
            collect_stats: true,
        }
    }
}

impl ContainerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::TomlParse("<inline>".to_string(), e))
    }

    pub fn worker_count(&self) -> usize {
        if self.build_workers == 0 {
            num_cpus::get()
        } else {
            self.build_workers
        }
    }

    /// 应用环境变量覆盖
    pub fn apply_env(mut self, env_map: &HashMap<String, String>) -> Result<Self, ConfigError> {
        if let Some(value) = env_map.get(ENV_PARALLEL_BUILD) {
            self.parallel_build = parse_bool(ENV_PARALLEL_BUILD, value)?;
        }
        if let Some(value) = env_map.get(ENV_BUILD_WORKERS) {
            self.build_workers = value.trim().parse().map_err(|_| invalid(ENV_BUILD_WORKERS, value))?;
        }
        if let Some(value) = env_map.get(ENV_SCOPE_NAME) {
            if !value.trim().is_empty() {
                self.scope_name = value.trim().to_string();
            }
        }
        Ok(self)
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, value)),
    }
}

fn invalid(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
    }
}
