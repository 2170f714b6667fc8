use relaygate_common::{Headers, ProviderKind, header_set};

/// Stamps the outbound request with whatever credential shape the
/// provider expects. Gemini takes its key as a query parameter, so the
/// URL is built alongside the headers.
pub fn apply_auth(kind: ProviderKind, key: &str, url: &str, headers: &mut Headers) -> String {
    match kind {
        ProviderKind::OpenAI => {
            header_set(headers, "Authorization", format!("Bearer {key}"));
            url.to_string()
        }
        ProviderKind::Anthropic => {
            header_set(headers, "x-api-key", key);
            header_set(headers, "anthropic-version", "2023-06-01");
            url.to_string()
        }
        ProviderKind::Gemini => append_query_param(url, "key", key),
    }
}

fn append_query_param(url: &str, name: &str, value: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!("{url}{separator}{name}={value}")
}
