pub type Headers = Vec<(String, String)>;

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    if let Some((_, v)) = headers
        .iter_mut()
        .find(|(k, _)| k.eq_ignore_ascii_case(&name))
    {
        *v = value;
        return;
    }
    headers.push((name, value));
}

/// Sets `name` only when no non-empty value is present yet. Returns whether it wrote.
pub fn header_set_if_absent(
    headers: &mut Headers,
    name: impl Into<String>,
    value: impl Into<String>,
) -> bool {
    let name = name.into();
    if header_get(headers, &name).is_some_and(|v| !v.is_empty()) {
        return false;
    }
    header_set(headers, name, value);
    true
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let idx = headers
        .iter()
        .position(|(k, _)| k.eq_ignore_ascii_case(name))?;
    Some(headers.remove(idx).1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_if_absent_keeps_existing_value() {
        let mut headers = vec![("X-Route".to_string(), "caller".to_string())];
        assert!(!header_set_if_absent(&mut headers, "x-route", "proxy"));
        assert!(header_set_if_absent(&mut headers, "X-Extra", "proxy"));
        assert_eq!(header_get(&headers, "X-ROUTE"), Some("caller"));
        assert_eq!(header_get(&headers, "x-extra"), Some("proxy"));
    }

    #[test]
    fn set_replaces_case_insensitively() {
        let mut headers = Headers::new();
        header_set(&mut headers, "Accept", "application/json");
        header_set(&mut headers, "accept", "text/event-stream");
        assert_eq!(headers.len(), 1);
        assert_eq!(header_remove(&mut headers, "ACCEPT").as_deref(), Some("text/event-stream"));
        assert!(headers.is_empty());
    }
}
