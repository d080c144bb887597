//! Cookieless browser fingerprinting and event id minting.
//!
//! The session id must be a pure function of stable request features:
//! the same browser produces the same id across requests and across
//! process restarts, and proxy-injected headers must not perturb it.

use uuid::Uuid;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if value == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

/// Headers the fingerprint draws on, in their fixed concatenation order
/// after the transport fields.
const FINGERPRINT_HEADERS: &[&str] = &[
    "user-agent",
    // header-order fingerprint is spliced in here
    "accept",
    "accept-language",
    "accept-encoding",
    "sec-ch-ua",
    "sec-ch-ua-platform",
    "sec-ch-ua-mobile",
    "connection",
    "upgrade-insecure-requests",
];

/// How many header names the order fingerprint considers.
const HEADER_ORDER_CAP: usize = 15;

fn is_proxy_header(name: &str) -> bool {
    name.starts_with("cf-") || name == "x-forwarded-for" || name == "x-real-ip"
}

/// The order in which a browser sends its headers is itself a stable
/// distinguishing feature. Proxy-added headers are excluded because the
/// edge may inject them in any position.
pub fn header_order_fingerprint(headers: &[(String, String)]) -> String {
    headers
        .iter()
        .map(|(name, _)| name.as_str())
        .filter(|name| !is_proxy_header(name))
        .take(HEADER_ORDER_CAP)
        .collect::<Vec<_>>()
        .join(",")
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> &'a str {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
        .unwrap_or("")
}

/// Derives the 8-character base36 session id from the fixed-order
/// feature string. `headers` carries lowercased names in wire order.
pub fn session_id(
    ip: &str,
    tls_cipher: &str,
    http_protocol: &str,
    headers: &[(String, String)],
) -> String {
    let mut input = String::with_capacity(256);
    input.push_str(ip);
    input.push('|');
    input.push_str(tls_cipher);
    input.push('|');
    input.push_str(http_protocol);

    for (i, name) in FINGERPRINT_HEADERS.iter().enumerate() {
        input.push('|');
        input.push_str(header_value(headers, name));
        if i == 0 {
            input.push('|');
            input.push_str(&header_order_fingerprint(headers));
        }
    }

    let digest = base36(fnv1a64(input.as_bytes()));
    if digest.len() >= 8 {
        digest[..8].to_string()
    } else {
        format!("{digest:0>8}")
    }
}

/// Fresh time-ordered id for an event row.
pub fn new_event_id() -> String {
    Uuid::now_v7().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    fn chrome_headers() -> Vec<(String, String)> {
        headers(&[
            ("user-agent", "Mozilla/5.0 (X11; Linux x86_64) Chrome/126"),
            ("accept", "text/html,application/xhtml+xml"),
            ("accept-language", "en-US,en;q=0.9"),
            ("accept-encoding", "gzip, deflate, br"),
            ("sec-ch-ua", "\"Chromium\";v=\"126\""),
            ("sec-ch-ua-platform", "\"Linux\""),
            ("sec-ch-ua-mobile", "?0"),
            ("connection", "keep-alive"),
            ("upgrade-insecure-requests", "1"),
        ])
    }

    #[test]
    fn session_id_is_deterministic_and_eight_chars() {
        let h = chrome_headers();
        let a = session_id("1.2.3.4", "AES128-GCM", "HTTP/2", &h);
        let b = session_id("1.2.3.4", "AES128-GCM", "HTTP/2", &h);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn proxy_headers_do_not_change_the_id() {
        let plain = chrome_headers();
        let mut proxied = chrome_headers();
        proxied.insert(0, ("cf-connecting-ip".into(), "9.9.9.9".into()));
        proxied.push(("x-forwarded-for".into(), "9.9.9.9".into()));

        assert_eq!(
            session_id("1.2.3.4", "AES128-GCM", "HTTP/2", &plain),
            session_id("1.2.3.4", "AES128-GCM", "HTTP/2", &proxied),
        );
    }

    #[test]
    fn ip_change_changes_the_id() {
        let h = chrome_headers();
        assert_ne!(
            session_id("1.2.3.4", "AES128-GCM", "HTTP/2", &h),
            session_id("1.2.3.5", "AES128-GCM", "HTTP/2", &h),
        );
    }

    #[test]
    fn header_order_is_part_of_the_fingerprint() {
        let normal = chrome_headers();
        let mut reordered = chrome_headers();
        reordered.swap(1, 2);

        assert_ne!(
            session_id("1.2.3.4", "AES128-GCM", "HTTP/2", &normal),
            session_id("1.2.3.4", "AES128-GCM", "HTTP/2", &reordered),
        );
    }

    #[test]
    fn order_fingerprint_caps_at_fifteen_names() {
        let many: Vec<(String, String)> = (0..20)
            .map(|i| (format!("header-{i}"), "v".to_string()))
            .collect();
        let fp = header_order_fingerprint(&many);
        assert_eq!(fp.split(',').count(), 15);
    }

    #[test]
    fn event_ids_are_unique() {
        assert_ne!(new_event_id(), new_event_id());
    }
}
