//! TOML 配置加载与取值范围规整。

use crate::error::UbsiError;
use serde::de::DeserializeOwned;
use std::path::Path;

/// 从 TOML 文本反序列化配置。
pub fn from_toml_str<T: DeserializeOwned>(text: &str) -> Result<T, UbsiError> {
    toml::from_str(text).map_err(|err| UbsiError::config(err.to_string()))
}

/// 读取并反序列化 TOML 配置文件。
pub fn load_toml<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T, UbsiError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(|err| UbsiError::config(format!("read {}: {err}", path.display())))?;
    from_toml_str(&text)
}

/// 将取值收敛到 `[min, max]`，越界时记录告警。
pub fn clamp_range<T>(name: &str, value: T, min: T, max: T) -> T
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    if value < min {
        tracing::warn!(option = name, %value, %min, "configuration value below range, raised");
        min
    } else if value > max {
        tracing::warn!(option = name, %value, %max, "configuration value above range, lowered");
        max
    } else {
        value
    }
}
