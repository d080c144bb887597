//! User-agent interpretation.
//!
//! Full UA parsing is an external concern; the engine only needs the
//! coarse fields the condition language and event rows consume. The
//! trait is the seam — tests and alternate deployments can plug a
//! different parser — and `HeuristicUaParser` is the built-in
//! implementation covering the mainstream browser population.

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UaInfo {
    pub browser: Option<String>,
    pub version: Option<String>,
    pub os: Option<String>,
    pub os_version: Option<String>,
    /// `desktop`, `mobile`, or `tablet`.
    pub device: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub arch: Option<String>,
    pub raw: String,
}

pub trait UserAgentParser: Send + Sync {
    fn parse(&self, ua: &str) -> UaInfo;

    fn is_bot(&self, ua: &str) -> bool {
        let lower = ua.to_ascii_lowercase();
        BOT_MARKERS.iter().any(|m| lower.contains(m))
    }
}

const BOT_MARKERS: &[&str] = &[
    "bot",
    "crawler",
    "spider",
    "headless",
    "lighthouse",
    "curl",
    "wget",
    "python-requests",
    "facebookexternalhit",
    "slurp",
    "preview",
];

pub struct HeuristicUaParser;

impl HeuristicUaParser {
    fn browser(ua: &str) -> (Option<String>, Option<String>) {
        // Order matters: Chrome-derived browsers keep a Chrome token.
        let candidates: &[(&str, &str)] = &[
            ("Edg/", "Edge"),
            ("EdgiOS/", "Edge"),
            ("OPR/", "Opera"),
            ("SamsungBrowser/", "Samsung Internet"),
            ("FxiOS/", "Firefox"),
            ("Firefox/", "Firefox"),
            ("CriOS/", "Chrome"),
            ("Chrome/", "Chrome"),
        ];

        for (token, name) in candidates {
            if let Some(idx) = ua.find(token) {
                let version = version_after(&ua[idx + token.len()..]);
                return (Some((*name).to_string()), version);
            }
        }

        if ua.contains("Safari/") {
            let version = ua
                .find("Version/")
                .and_then(|idx| version_after(&ua[idx + "Version/".len()..]));
            return (Some("Safari".to_string()), version);
        }

        (None, None)
    }

    fn os(ua: &str) -> (Option<String>, Option<String>) {
        if let Some(idx) = ua.find("Windows NT ") {
            let nt = version_after(&ua[idx + "Windows NT ".len()..]);
            // NT 10.0 covers both Windows 10 and 11; client hints
            // disambiguate when the browser sends them.
            return (Some("Windows".into()), nt);
        }
        if ua.contains("iPhone OS") || ua.contains("iPad; CPU OS") {
            let marker = if ua.contains("iPhone OS") {
                "iPhone OS "
            } else {
                "CPU OS "
            };
            let version = ua
                .find(marker)
                .and_then(|idx| version_after(&ua[idx + marker.len()..]))
                .map(|v| v.replace('_', "."));
            return (Some("iOS".into()), version);
        }
        if let Some(idx) = ua.find("Mac OS X ") {
            let version = version_after_underscored(&ua[idx + "Mac OS X ".len()..]);
            return (Some("macOS".into()), version);
        }
        if let Some(idx) = ua.find("Android ") {
            let version = version_after(&ua[idx + "Android ".len()..]);
            return (Some("Android".into()), version);
        }
        if ua.contains("CrOS") {
            return (Some("Chrome OS".into()), None);
        }
        if ua.contains("Linux") {
            return (Some("Linux".into()), None);
        }
        (None, None)
    }

    fn device(ua: &str) -> &'static str {
        if ua.contains("iPad") || (ua.contains("Android") && !ua.contains("Mobile")) {
            "tablet"
        } else if ua.contains("Mobi") || ua.contains("iPhone") || ua.contains("Android") {
            "mobile"
        } else {
            "desktop"
        }
    }

    fn model(ua: &str) -> Option<String> {
        // Android UAs carry "; <model> Build/" or "; <model>)".
        let start = ua.find("Android ")?;
        let rest = &ua[start..];
        let after_semi = rest.split(';').nth(1)?.trim();
        let model = after_semi
            .split(" Build/")
            .next()
            .unwrap_or(after_semi)
            .trim_end_matches(')')
            .trim();
        if model.is_empty() || model.contains("Android") {
            None
        } else {
            Some(model.to_string())
        }
    }

    fn brand(model: Option<&str>, ua: &str) -> Option<String> {
        if ua.contains("iPhone") || ua.contains("iPad") || ua.contains("Mac OS X") {
            return Some("Apple".into());
        }
        let model = model?;
        if model.starts_with("SM-") {
            Some("Samsung".into())
        } else if model.starts_with("Pixel") {
            Some("Google".into())
        } else if model.starts_with("moto") {
            Some("Motorola".into())
        } else {
            None
        }
    }
}

fn version_after(rest: &str) -> Option<String> {
    let version: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '_')
        .collect();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}

fn version_after_underscored(rest: &str) -> Option<String> {
    version_after(rest).map(|v| v.replace('_', "."))
}

impl UserAgentParser for HeuristicUaParser {
    fn parse(&self, ua: &str) -> UaInfo {
        let (browser, version) = Self::browser(ua);
        let (os, os_version) = Self::os(ua);
        let model = Self::model(ua);
        let brand = Self::brand(model.as_deref(), ua);

        UaInfo {
            browser,
            version,
            os,
            os_version,
            device: Some(Self::device(ua).to_string()),
            brand,
            model,
            arch: None,
            raw: ua.to_string(),
        }
    }
}
