//! 连接白名单与服务级读写权限。
//!
//! - 白名单为空时接受任意对端；
//! - 服务规则按模式具体程度从高到低匹配，第一条命中的规则生效：
//!   对端地址有专属权限时取之，否则取规则默认值；
//! - 没有规则命中时取全局默认权限。

use crate::config::{ACL_READ, ACL_WRITE};
use std::collections::BTreeMap;
use std::net::IpAddr;
use ubsi_core::util::{match_pattern, pattern_specificity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AclRule {
    pub service: String,
    pub default: u8,
    pub hosts: BTreeMap<String, u8>,
}

#[derive(Debug, Clone)]
pub struct AccessControl {
    accept_hosts: Vec<String>,
    default: u8,
    rules: Vec<AclRule>,
}

impl AccessControl {
    pub fn new(accept_hosts: Vec<String>, default: u8, mut rules: Vec<AclRule>) -> Self {
        rules.sort_by(|a, b| {
            pattern_specificity(Some(&b.service)).cmp(&pattern_specificity(Some(&a.service)))
        });
        Self {
            accept_hosts,
            default,
            rules,
        }
    }

    /// 对端是否允许建连。
    pub fn accepts_peer(&self, ip: &IpAddr) -> bool {
        if self.accept_hosts.is_empty() {
            return true;
        }
        let text = ip.to_string();
        self.accept_hosts.iter().any(|host| *host == text)
    }

    /// 对端对服务的权限位。
    pub fn policy(&self, service: &str, ip: &IpAddr) -> u8 {
        let text = ip.to_string();
        self.rules
            .iter()
            .find(|rule| match_pattern(Some(&rule.service), service))
            .map_or(self.default, |rule| {
                rule.hosts.get(&text).copied().unwrap_or(rule.default)
            })
    }

    /// 只读接口需要读权限，其余接口需要写权限。
    pub fn permits(&self, service: &str, ip: &IpAddr, readonly: bool) -> bool {
        let need = if readonly { ACL_READ } else { ACL_WRITE };
        self.policy(service, ip) & need != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(text: &str) -> IpAddr {
        text.parse().unwrap()
    }

    #[test]
    fn empty_allow_list_accepts_everyone() {
        let acl = AccessControl::new(Vec::new(), 3, Vec::new());
        assert!(acl.accepts_peer(&ip("10.1.1.1")));
        let acl = AccessControl::new(vec!["127.0.0.1".into()], 3, Vec::new());
        assert!(acl.accepts_peer(&ip("127.0.0.1")));
        assert!(!acl.accepts_peer(&ip("10.1.1.1")));
    }

    #[test]
    fn most_specific_rule_wins_regardless_of_order() {
        let rules = vec![
            AclRule {
                service: "order*".into(),
                default: ACL_READ,
                hosts: BTreeMap::from([("10.0.0.8".to_owned(), ACL_READ | ACL_WRITE)]),
            },
            AclRule {
                service: "order-admin".into(),
                default: 0,
                hosts: BTreeMap::new(),
            },
        ];
        let acl = AccessControl::new(Vec::new(), ACL_READ | ACL_WRITE, rules);
        let other = ip("10.0.0.9");
        let trusted = ip("10.0.0.8");

        assert!(acl.permits("order-query", &other, true));
        assert!(!acl.permits("order-query", &other, false));
        assert!(acl.permits("order-query", &trusted, false));
        assert!(!acl.permits("order-admin", &trusted, true));
        assert!(acl.permits("billing", &other, false));
    }
}
