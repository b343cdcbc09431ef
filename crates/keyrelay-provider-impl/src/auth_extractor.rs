use keyrelay_provider_core::{Credential, Headers, header_set, header_set_if_absent};

const ATTRIBUTE_HEADER_PREFIX: &str = "header:";

pub fn set_bearer(headers: &mut Headers, access_token: &str) {
    header_set(headers, "Authorization", format!("Bearer {access_token}"));
}

pub fn set_accept(headers: &mut Headers, stream: bool) {
    let accept = if stream {
        "text/event-stream"
    } else {
        "application/json"
    };
    header_set(headers, "Accept", accept);
}

pub fn set_content_type_json(headers: &mut Headers) {
    header_set(headers, "Content-Type", "application/json");
}

/// Client user agent when one came in, else the provider default.
pub fn set_user_agent(headers: &mut Headers, client_ua: Option<&str>, default_ua: &str) {
    let ua = client_ua
        .map(str::trim)
        .filter(|ua| !ua.is_empty())
        .unwrap_or(default_ua);
    header_set_if_absent(headers, "User-Agent", ua);
}

/// Copies `header:<Name>` credential attributes onto the request.
pub fn apply_attribute_headers(headers: &mut Headers, credential: &Credential) {
    for (key, value) in &credential.attributes {
        let Some(name) = key.strip_prefix(ATTRIBUTE_HEADER_PREFIX) else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() || value.is_empty() {
            continue;
        }
        header_set(headers, name, value);
    }
}

/// `attributes.api_key` first, then the OAuth access token in metadata.
pub fn credential_token(credential: &Credential) -> Option<(&str, bool)> {
    if let Some(key) = credential.attribute("api_key") {
        return Some((key, true));
    }
    credential
        .metadata_str("access_token")
        .map(|token| (token, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyrelay_provider_core::header_get;

    #[test]
    fn attribute_headers_are_copied() {
        let cred = Credential::new("c1", "codex")
            .with_attribute("header:X-Team", " blue ")
            .with_attribute("header: ", "ignored")
            .with_attribute("base_url", "https://example.com");
        let mut headers = Headers::new();
        apply_attribute_headers(&mut headers, &cred);
        assert_eq!(headers.len(), 1);
        assert_eq!(header_get(&headers, "x-team"), Some("blue"));
    }

    #[test]
    fn api_key_wins_over_access_token() {
        let cred = Credential::new("c1", "codex").with_metadata("access_token", "oauth");
        assert_eq!(credential_token(&cred), Some(("oauth", false)));
        let cred = cred.with_attribute("api_key", "sk-1");
        assert_eq!(credential_token(&cred), Some(("sk-1", true)));
    }

    #[test]
    fn user_agent_prefers_client_value() {
        let mut headers = Headers::new();
        set_user_agent(&mut headers, Some("  "), "default/1");
        assert_eq!(header_get(&headers, "user-agent"), Some("default/1"));
        let mut headers = Headers::new();
        set_user_agent(&mut headers, Some("cli/2"), "default/1");
        assert_eq!(header_get(&headers, "user-agent"), Some("cli/2"));
    }
}
