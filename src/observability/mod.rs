//! 可观测性：tracing 初始化与 Agent 日志接口
//!
//! AgentLogger 是引擎消费的日志接口（分隔线、Markdown 块、原始消息、任务公告），
//! 只做尽力输出，永不阻塞或让 run 失败。TracingLogger 转发给 tracing，MemoryLogger 缓存在内存中。

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::memory::Message;

/// 初始化全局 tracing：默认 info，可通过 RUST_LOG 覆盖；重复调用时静默忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}

/// 日志级别：数值越大越啰嗦；Off 关闭全部输出
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    #[default]
    Info,
    Debug,
}

pub trait AgentLogger: Send + Sync {
    /// 当前阈值
    fn level(&self) -> LogLevel;

    /// 实际输出（已通过阈值判断）
    fn write(&self, level: LogLevel, text: &str);

    fn log(&self, level: LogLevel, text: &str) {
        let threshold = self.level();
        if threshold != LogLevel::Off && level != LogLevel::Off && level <= threshold {
            self.write(level, text);
        }
    }

    fn rule(&self, title: &str, level: LogLevel) {
        self.log(level, &format!("━━━━━━━━ {title} ━━━━━━━━"));
    }

    fn markdown(&self, title: Option<&str>, content: &str, level: LogLevel) {
        match title {
            Some(t) => self.log(level, &format!("── {t} ──\n{content}")),
            None => self.log(level, content),
        }
    }

    fn code(&self, title: &str, code: &str, level: LogLevel) {
        self.log(level, &format!("── {title} ──\n```js\n{code}\n```"));
    }

    fn messages(&self, messages: &[Message], level: LogLevel) {
        let rendered = messages
            .iter()
            .map(|m| format!("[{}] {}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n");
        self.log(level, &rendered);
    }

    fn task(&self, content: &str, subtitle: &str, title: Option<&str>, level: LogLevel) {
        let header = match title {
            Some(t) => format!("New run - {t}"),
            None => "New run".to_string(),
        };
        if subtitle.is_empty() {
            self.log(level, &format!("{header}\n{content}"));
        } else {
            self.log(level, &format!("{header}\n{content}\n({subtitle})"));
        }
    }
}

/// 默认实现：写入 tracing
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger {
    level: LogLevel,
}

impl TracingLogger {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }
}

impl AgentLogger for TracingLogger {
    fn level(&self) -> LogLevel {
        self.level
    }

    fn write(&self, level: LogLevel, text: &str) {
        match level {
            LogLevel::Error => tracing::error!(target: "scriptbee::agent", "{text}"),
            LogLevel::Info => tracing::info!(target: "scriptbee::agent", "{text}"),
            LogLevel::Debug => tracing::debug!(target: "scriptbee::agent", "{text}"),
            LogLevel::Off => {}
        }
    }
}

/// 缓存型 logger（宿主取回展示或测试断言）
#[derive(Debug, Default)]
pub struct MemoryLogger {
    level: LogLevel,
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl MemoryLogger {
    pub fn new(level: LogLevel) -> Self {
        Self {
            level,
            lines: Mutex::new(Vec::new()),
        }
    }

    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    pub fn text(&self) -> String {
        self.lines()
            .into_iter()
            .map(|(_, l)| l)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl AgentLogger for MemoryLogger {
    fn level(&self) -> LogLevel {
        self.level
    }

    fn write(&self, level: LogLevel, text: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, text.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_filters_verbose_lines() {
        let logger = MemoryLogger::new(LogLevel::Info);
        logger.log(LogLevel::Debug, "hidden");
        logger.log(LogLevel::Info, "shown");
        logger.log(LogLevel::Error, "also shown");
        assert_eq!(logger.lines().len(), 2);
        assert!(!logger.text().contains("hidden"));
    }

    #[test]
    fn test_off_silences_everything() {
        let logger = MemoryLogger::new(LogLevel::Off);
        logger.rule("x", LogLevel::Error);
        assert!(logger.lines().is_empty());
    }

    #[test]
    fn test_task_announcement() {
        let logger = MemoryLogger::new(LogLevel::Debug);
        logger.task("find x", "mock-model", None, LogLevel::Info);
        assert!(logger.text().contains("find x"));
        assert!(logger.text().contains("(mock-model)"));
    }
}
