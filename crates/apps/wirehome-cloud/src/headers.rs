//! Lookups over plain `(name, value)` header lists.

pub fn header_value<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers.iter().find(|(name, _)| name.eq_ignore_ascii_case(key)).map(|(_, value)| value.as_str())
}

/// Value of cookie `key` across all `Cookie` headers.
pub fn cookie_value<'a>(headers: &'a [(String, String)], key: &str) -> Option<&'a str> {
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("cookie"))
        .flat_map(|(_, value)| value.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| name.trim() == key)
        .map(|(_, value)| value.trim().trim_matches('"'))
}

/// `Set-Cookie` value for a session-scoped, HTTP-only cookie.
pub fn set_cookie(key: &str, value: &str, max_age_secs: Option<u64>) -> String {
    let mut cookie = format!("{key}={value}; Path=/; HttpOnly; SameSite=Lax");
    if let Some(max_age) = max_age_secs {
        cookie.push_str(&format!("; Max-Age={max_age}"));
    }
    cookie
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let headers = headers(&[("Content-Type", "text/plain")]);
        assert_eq!(header_value(&headers, "content-type"), Some("text/plain"));
        assert_eq!(header_value(&headers, "accept"), None);
    }

    #[test]
    fn cookies_are_found_across_headers() {
        let headers = headers(&[
            ("Cookie", "theme=dark; wirehome-channel-uid=garage"),
            ("cookie", "wirehome-session=\"abc.def\""),
        ]);
        assert_eq!(cookie_value(&headers, "wirehome-channel-uid"), Some("garage"));
        assert_eq!(cookie_value(&headers, "wirehome-session"), Some("abc.def"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn set_cookie_includes_max_age_when_given() {
        assert_eq!(set_cookie("a", "b", None), "a=b; Path=/; HttpOnly; SameSite=Lax");
        assert!(set_cookie("a", "b", Some(60)).ends_with("; Max-Age=60"));
    }
}
