//! 模拟数据登记表。

use dashmap::DashMap;
use ubsi_core::{ResultCode, ResultError, Value};

/// 按服务/接口登记的预置应答，供模拟路由与过滤器的 `Mock` 决定使用。
#[derive(Debug, Default)]
pub struct MockRegistry {
    data: DashMap<(String, String), Value>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, service: impl Into<String>, entry: impl Into<String>, data: Value) {
        self.data.insert((service.into(), entry.into()), data);
    }

    pub fn remove(&self, service: &str, entry: &str) -> Option<Value> {
        self.data
            .remove(&(service.to_owned(), entry.to_owned()))
            .map(|(_, v)| v)
    }

    /// 读取模拟数据；未登记时返回 [`ResultCode::MOCK`] 错误。
    pub fn lookup(&self, service: &str, entry: &str) -> Result<Value, ResultError> {
        self.data
            .get(&(service.to_owned(), entry.to_owned()))
            .map(|v| v.value().clone())
            .ok_or_else(|| {
                ResultError::new(
                    ResultCode::MOCK,
                    format!("mock data for {service}.{entry} not found"),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_mock_is_mock_error() {
        let mocks = MockRegistry::new();
        mocks.set("svc", "get", Value::Int(1));
        assert_eq!(mocks.lookup("svc", "get"), Ok(Value::Int(1)));
        assert_eq!(mocks.lookup("svc", "put").unwrap_err().code, ResultCode::MOCK);
        assert_eq!(mocks.remove("svc", "get"), Some(Value::Int(1)));
    }
}
