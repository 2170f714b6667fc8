/// Ordered list of header (name, value) pairs. Kept as a plain `Vec`
/// rather than a map since duplicate header names are meaningful and the
/// dispatcher rarely has more than a handful of them per request.
pub type Headers = Vec<(String, String)>;

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn header_set(headers: &mut Headers, name: &str, value: impl Into<String>) {
    if let Some(entry) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(name)) {
        entry.1 = value.into();
    } else {
        headers.push((name.to_string(), value.into()));
    }
}

pub fn header_remove(headers: &mut Headers, name: &str) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_overwrites_existing_case_insensitively() {
        let mut headers: Headers = vec![("Authorization".into(), "Bearer old".into())];
        header_set(&mut headers, "authorization", "Bearer new");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "Authorization"), Some("Bearer new"));
    }

    #[test]
    fn remove_drops_matching_entries() {
        let mut headers: Headers = vec![
            ("X-Foo".into(), "1".into()),
            ("x-foo".into(), "2".into()),
            ("X-Bar".into(), "3".into()),
        ];
        header_remove(&mut headers, "x-foo");
        assert_eq!(headers, vec![("X-Bar".to_string(), "3".to_string())]);
    }
}
