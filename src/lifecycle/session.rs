//! 会话 id 派生

use serde::Deserialize;
use uuid::Uuid;

/// 外部会话 id 如何映射为后端会话 id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionIdPolicy {
    /// 同一个外部会话 id 总是映射到同一个后端会话（UUIDv5）；没有外部 id 时随机生成
    #[default]
    Deterministic,
    /// 每次调用都生成新的后端会话
    PerCall,
}

/// 派生后端会话 id
pub fn derive_session_id(policy: SessionIdPolicy, external: Option<&str>) -> String {
    match (policy, external.map(str::trim).filter(|s| !s.is_empty())) {
        (SessionIdPolicy::Deterministic, Some(id)) => {
            Uuid::new_v5(&Uuid::NAMESPACE_URL, format!("agent-bridge:session:{id}").as_bytes())
                .to_string()
        }
        _ => Uuid::new_v4().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deterministic_is_stable() {
        let a = derive_session_id(SessionIdPolicy::Deterministic, Some("chat-42"));
        let b = derive_session_id(SessionIdPolicy::Deterministic, Some("chat-42"));
        let c = derive_session_id(SessionIdPolicy::Deterministic, Some("chat-43"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_fresh_ids_otherwise() {
        let a = derive_session_id(SessionIdPolicy::PerCall, Some("chat-42"));
        let b = derive_session_id(SessionIdPolicy::PerCall, Some("chat-42"));
        assert_ne!(a, b);

        let c = derive_session_id(SessionIdPolicy::Deterministic, None);
        let d = derive_session_id(SessionIdPolicy::Deterministic, Some("  "));
        assert_ne!(c, d);
    }
}
