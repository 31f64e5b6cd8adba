use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Container,
    System,
    Manager,
}

/// One captured log line, as delivered to every backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub message: String,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub level: LogLevel,
    pub source: LogSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_std_err: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_system: Option<bool>,
}

impl LogMessage {
    /// An agent-internal message (source `manager` or `system`).
    pub fn system(message: impl Into<String>, level: LogLevel, timestamp: i64) -> Self {
        Self {
            id: None,
            message: message.into(),
            timestamp,
            level,
            source: LogSource::Manager,
            service_id: None,
            service_name: None,
            container_id: None,
            is_std_err: None,
            is_system: Some(true),
        }
    }
}

/// Service id as encoded in log records: `appId * 1000 + offset`.
pub fn service_log_id(app_id: i64, offset: i64) -> i64 {
    app_id * 1000 + offset
}

/// Query over the local backend's in-memory buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<LogLevel>,
    /// Epoch ms, inclusive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_std_err: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn matches(&self, message: &LogMessage) -> bool {
        if let Some(service_id) = self.service_id {
            if message.service_id != Some(service_id) {
                return false;
            }
        }
        if let Some(level) = self.level {
            if message.level != level {
                return false;
            }
        }
        if let Some(since) = self.since {
            if message.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if message.timestamp > until {
                return false;
            }
        }
        if let Some(is_std_err) = self.is_std_err {
            if message.is_std_err.unwrap_or(false) != is_std_err {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(level: LogLevel, timestamp: i64) -> LogMessage {
        LogMessage {
            id: None,
            message: "m".into(),
            timestamp,
            level,
            source: LogSource::Container,
            service_id: Some(service_log_id(1001, 1)),
            service_name: Some("nginx".into()),
            container_id: Some("c1".into()),
            is_std_err: Some(false),
            is_system: None,
        }
    }

    #[test]
    fn test_service_log_id_encoding() {
        assert_eq!(service_log_id(1001, 1), 1001001);
        assert_eq!(service_log_id(0, 7), 7);
    }

    #[test]
    fn test_level_serializes_lowercase() {
        let value = serde_json::to_value(LogLevel::Warn).unwrap();
        assert_eq!(value, "warn");
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
    }

    #[test]
    fn test_filter_combines_criteria() {
        let m = message(LogLevel::Error, 5_000);
        let filter = LogFilter {
            service_id: Some(1001001),
            level: Some(LogLevel::Error),
            since: Some(1_000),
            until: Some(10_000),
            is_std_err: Some(false),
            limit: None,
        };
        assert!(filter.matches(&m));

        let mut outside = filter.clone();
        outside.since = Some(6_000);
        assert!(!outside.matches(&m));

        let mut wrong_level = filter.clone();
        wrong_level.level = Some(LogLevel::Info);
        assert!(!wrong_level.matches(&m));
    }

    #[test]
    fn test_camel_case_wire_shape() {
        let value = serde_json::to_value(message(LogLevel::Info, 1)).unwrap();
        assert!(value.get("serviceId").is_some());
        assert!(value.get("isStdErr").is_some());
        assert!(value.get("service_id").is_none());
    }
}
