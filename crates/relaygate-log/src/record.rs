use relaygate_common::{GroupId, Headers, ProxyKeyId};
use time::OffsetDateTime;

/// Arrival-time half of a two-phase request log record.
/// Enqueued strictly before the first upstream send.
#[derive(Debug, Clone)]
pub struct InsertRecord {
    pub request_id: String,
    pub proxy_key_id: ProxyKeyId,
    pub group_id: Option<GroupId>,
    pub provider_kind: Option<String>,
    pub model: Option<String>,
    pub method: String,
    pub endpoint: String,
    pub request_headers: Headers,
    pub request_body: Vec<u8>,
    pub content_truncated: bool,
    pub is_streaming: bool,
    pub has_tools: bool,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Completion-time half. Enqueued strictly after the attempt reaches a
/// terminal state; correlated to its `InsertRecord` by `request_id`.
#[derive(Debug, Clone)]
pub struct UpdateRecord {
    pub request_id: String,
    pub status_code: Option<u16>,
    pub duration_ms: u64,
    pub response_headers: Headers,
    pub response_body: Vec<u8>,
    pub content_truncated: bool,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub enum LogEvent {
    Insert(InsertRecord),
    Update(UpdateRecord),
}

/// Bodies over this cap are truncated and flagged `content_truncated`
/// — flagged so readers know the body was cut.
pub const MAX_LOGGED_BODY_BYTES: usize = 64 * 1024;

pub fn truncate_body(body: &[u8]) -> (Vec<u8>, bool) {
    if body.len() <= MAX_LOGGED_BODY_BYTES {
        (body.to_vec(), false)
    } else {
        (body[..MAX_LOGGED_BODY_BYTES].to_vec(), true)
    }
}

/// Headers serialized as key -> joined-value strings.
pub fn join_header_values(headers: &Headers) -> Vec<(String, String)> {
    use std::collections::BTreeMap;
    let mut joined: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (k, v) in headers {
        joined.entry(k.clone()).or_default().push(v.clone());
    }
    joined
        .into_iter()
        .map(|(k, values)| (k, values.join(", ")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_flags_oversized_bodies() {
        let small = vec![0u8; 10];
        let (body, truncated) = truncate_body(&small);
        assert_eq!(body.len(), 10);
        assert!(!truncated);

        let big = vec![0u8; MAX_LOGGED_BODY_BYTES + 1];
        let (body, truncated) = truncate_body(&big);
        assert_eq!(body.len(), MAX_LOGGED_BODY_BYTES);
        assert!(truncated);
    }

    #[test]
    fn duplicate_header_names_are_joined() {
        let headers: Headers = vec![
            ("X-Trace".into(), "a".into()),
            ("X-Trace".into(), "b".into()),
        ];
        let joined = join_header_values(&headers);
        assert_eq!(joined, vec![("X-Trace".to_string(), "a, b".to_string())]);
    }
}
