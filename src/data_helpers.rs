use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::Url;

use crate::error::{AppError, AppResult};

const EXTERNAL_URL_MAX_LEN: usize = 2048;

/// Hosts the desk is allowed to open in the system browser.
const ALLOWED_EXTERNAL_HOSTS: &[&str] = &["wa.me", "api.whatsapp.com"];

pub(crate) fn normalize_phone(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()
}

/// `%text%` for a `LIKE ... ESCAPE '\'` clause, with the wildcards in
/// `text` matched literally.
pub(crate) fn like_contains(text: &str) -> String {
    let mut pattern = String::with_capacity(text.len() + 2);
    pattern.push('%');
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern.push('%');
    pattern
}

/// `encodeURIComponent` leaves these unescaped.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub(crate) fn percent_encode_component(input: &str) -> String {
    utf8_percent_encode(input, URI_COMPONENT).to_string()
}

pub(crate) fn validate_external_url(url_raw: &str) -> AppResult<Url> {
    let trimmed = url_raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::validation("External URL cannot be empty"));
    }
    if trimmed.len() > EXTERNAL_URL_MAX_LEN {
        return Err(AppError::validation("External URL is too long"));
    }

    let parsed = Url::parse(trimmed)
        .map_err(|e| AppError::validation(format!("Invalid external URL: {e}")))?;
    if parsed.scheme() != "https" {
        return Err(AppError::validation("Only https URLs are allowed"));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(AppError::validation("Credentialed URLs are not allowed"));
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::validation("External URL is missing a host"))?
        .to_ascii_lowercase();
    if !ALLOWED_EXTERNAL_HOSTS.iter().any(|h| host == *h) {
        return Err(AppError::validation(format!(
            "External host is not allowlisted: {host}"
        )));
    }

    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phone_keeps_only_digits() {
        assert_eq!(normalize_phone("+52 (55) 1234-5678"), "525512345678");
        assert_eq!(normalize_phone("sin teléfono"), "");
    }

    #[test]
    fn percent_encoding_matches_uri_component() {
        assert_eq!(percent_encode_component("Hola mundo!"), "Hola%20mundo!");
        assert_eq!(percent_encode_component("a&b=c?d"), "a%26b%3Dc%3Fd");
        assert_eq!(percent_encode_component("metros: 4.5"), "metros%3A%204.5");
        assert_eq!(percent_encode_component("línea\n"), "l%C3%ADnea%0A");
        assert_eq!(percent_encode_component("(a)*'~_-"), "(a)*'~_-");
        assert_eq!(percent_encode_component("50%/m"), "50%25%2Fm");
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_contains("ana"), "%ana%");
        assert_eq!(like_contains("50%_x"), "%50\\%\\_x%");
        assert_eq!(like_contains("a\\b"), "%a\\\\b%");
    }

    #[test]
    fn only_whatsapp_https_links_are_opened() {
        assert!(validate_external_url("https://wa.me/5215512345678?text=hola").is_ok());
        assert!(validate_external_url("http://wa.me/521").is_err());
        assert!(validate_external_url("https://evil.example/wa.me").is_err());
        assert!(validate_external_url("https://user:pw@wa.me/1").is_err());
        assert!(validate_external_url("   ").is_err());
    }
}
