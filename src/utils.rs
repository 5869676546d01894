use sha2::{Digest, Sha256};
use std::time::Duration;
use url::Url;

pub fn validate_url(url: &str) -> Result<Url, url::ParseError> {
    let parsed = Url::parse(url)?;

    // Ensure it's HTTP or HTTPS
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        _ => Err(url::ParseError::InvalidPort),
    }
}

/// Normalizes a URL for deduplication: lowercases the scheme, sorts query
/// parameters, and drops a bare trailing slash, so equivalent URLs collapse
/// to the same `uniqueKey`.
pub fn normalize_url(url: &Url) -> String {
    let mut normalized = url.clone();
    let _ = normalized.set_scheme(&url.scheme().to_lowercase());

    let mut pairs: Vec<(String, String)> = normalized
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    if pairs.is_empty() {
        normalized.set_query(None);
    } else {
        let query = pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        normalized.set_query(Some(&query));
    }

    let mut s = normalized.to_string();
    if normalized.path() == "/" && normalized.query().is_none() && s.ends_with('/') {
        s.pop();
    }
    s
}

/// Default `uniqueKey` for a request: the normalized URL.
pub fn default_unique_key(url: &Url) -> String {
    normalize_url(url)
}

/// Extended `uniqueKey`, used when `useExtendedUniqueKey` is set on a
/// non-GET request: method, normalized URL, and a digest of the payload.
pub fn extended_unique_key(url: &Url, method: &str, payload: Option<&[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.unwrap_or_default());
    let digest = hasher.finalize();
    let hex_digest = digest.iter().map(|b| format!("{b:02x}")).collect::<String>();
    format!("{}({}):{}", method.to_uppercase(), normalize_url(url), hex_digest)
}

/// Characters forbidden in a key-value store key, per the on-disk filename
/// rule `^<escaped-key>\.[a-z0-9]+$`.
const FORBIDDEN_KEY_CHARS: &[char] = &['?', '|', '\\', '/', '"', '*', '<', '>', '%', ':'];

pub fn validate_store_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("key must not be empty".to_string());
    }
    if key.len() > 256 {
        return Err(format!("key length {} exceeds 256 characters", key.len()));
    }
    if let Some(c) = key.chars().find(|c| FORBIDDEN_KEY_CHARS.contains(c)) {
        return Err(format!("key contains forbidden character '{c}'"));
    }
    Ok(())
}

pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

pub fn extract_domain(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.domain().map(|d| d.to_string()))
}

/// Exponential backoff with a cap, shared by the queue's transient-error
/// retries and the session pool's retirement/rotation timers.
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration, multiplier: f64) -> Duration {
    let millis = initial.as_millis() as f64 * multiplier.powi(attempt as i32);
    Duration::from_millis(millis.min(max.as_millis() as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("test.txt"), "test.txt");
        assert_eq!(sanitize_filename("test/file.txt"), "test_file.txt");
        assert_eq!(sanitize_filename("test:file?.txt"), "test_file_.txt");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(500)), "500ms");
        assert_eq!(format_duration(Duration::from_secs(5)), "5.0s");
        assert_eq!(format_duration(Duration::from_secs(65)), "1m 5s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m 5s");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("http://example.com").is_ok());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("invalid-url").is_err());
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://example.com/path"), Some("example.com".to_string()));
        assert_eq!(extract_domain("invalid-url"), None);
    }

    #[test]
    fn test_normalize_url_sorts_query_and_trims_slash() {
        let a = Url::parse("https://Example.com/path?b=2&a=1").unwrap();
        let b = Url::parse("https://example.com/path?a=1&b=2").unwrap();
        assert_eq!(normalize_url(&a), normalize_url(&b));

        let root = Url::parse("https://example.com/").unwrap();
        assert_eq!(normalize_url(&root), "https://example.com");
    }

    #[test]
    fn test_extended_unique_key_differs_by_payload() {
        let url = Url::parse("https://example.com/api").unwrap();
        let k1 = extended_unique_key(&url, "post", Some(b"a"));
        let k2 = extended_unique_key(&url, "post", Some(b"b"));
        assert_ne!(k1, k2);
        assert!(k1.starts_with("POST("));
    }

    #[test]
    fn test_validate_store_key() {
        assert!(validate_store_key("hello-world").is_ok());
        assert!(validate_store_key("").is_err());
        assert!(validate_store_key("bad/key").is_err());
        assert!(validate_store_key("bad:key").is_err());
        assert!(validate_store_key(&"x".repeat(257)).is_err());
    }

    #[test]
    fn test_backoff_delay_caps() {
        let d0 = backoff_delay(0, Duration::from_millis(100), Duration::from_secs(10), 2.0);
        assert_eq!(d0, Duration::from_millis(100));
        let d_large = backoff_delay(20, Duration::from_millis(100), Duration::from_secs(10), 2.0);
        assert_eq!(d_large, Duration::from_secs(10));
    }
}
