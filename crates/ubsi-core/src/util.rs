//! 名称匹配、版本号与请求 ID 等零散工具。

use crate::value::ObjectId;

/// 通配匹配：`None` 匹配一切；不含 `*` 时要求全等；`*` 之前的部分作为前缀匹配。
pub fn match_pattern(pattern: Option<&str>, name: &str) -> bool {
    let Some(pattern) = pattern else {
        return true;
    };
    match pattern.find('*') {
        None => pattern == name,
        Some(0) => true,
        Some(idx) => name.starts_with(&pattern[..idx]),
    }
}

/// 模式的具体程度：`(字面前缀长度, 是否精确匹配)`，数值越大越具体。
pub fn pattern_specificity(pattern: Option<&str>) -> (usize, bool) {
    match pattern {
        None => (0, false),
        Some(p) => match p.find('*') {
            None => (p.len(), true),
            Some(idx) => (idx, false),
        },
    }
}

/// 解析 `a.b.c` 版本号为 `a * 1_000_000 + b * 1_000 + c`。
///
/// 缺省段视为 0；任一段非数字或超过 999（首段除外）时返回 `None`。
pub fn parse_version(text: &str) -> Option<u32> {
    let mut parts = text.trim().split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    let patch: u32 = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    if parts.next().is_some() || minor > 999 || patch > 999 || major > 4_293 {
        return None;
    }
    Some(major * 1_000_000 + minor * 1_000 + patch)
}

/// 将数值版本格式化为 `a.b.c`。
pub fn format_version(version: u32) -> String {
    format!(
        "{}.{}.{}",
        version / 1_000_000,
        version / 1_000 % 1_000,
        version % 1_000
    )
}

/// 生成全局唯一的请求 ID（24 位十六进制）。
pub fn new_request_id() -> String {
    ObjectId::generate().to_hex()
}
