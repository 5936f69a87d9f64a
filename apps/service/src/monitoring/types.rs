use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Controller-assigned monitor identifier. Zero is reserved/invalid.
pub type MonitorId = u32;

/// Controller-assigned host/scheme identifier. Zero is reserved/invalid.
pub type HostSchemeId = u32;

/// Controller-assigned customer identifier. Zero is reserved/invalid.
pub type CustomerId = u32;

/// HTTP access method used to probe an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Patch,
}

impl Method {
    /// True for methods that carry a request body.
    pub fn has_body(self) -> bool {
        matches!(self, Method::Post | Method::Put | Method::Patch)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Patch => "PATCH",
        }
    }

    /// Parse a control-API method string (case-insensitive).
    pub fn parse(value: &str) -> Option<Method> {
        match value.trim().to_ascii_lowercase().as_str() {
            "get" => Some(Method::Get),
            "head" => Some(Method::Head),
            "post" => Some(Method::Post),
            "put" => Some(Method::Put),
            "delete" => Some(Method::Delete),
            "options" => Some(Method::Options),
            "patch" => Some(Method::Patch),
            _ => None,
        }
    }
}

/// Content-integrity policy applied to probe response bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCheckMode {
    NoCheck,
    ContentMatch,
    AnyKeywords,
    AllKeywords,
    SmartContentMatch,
}

impl ContentCheckMode {
    pub fn parse(value: &str) -> Option<ContentCheckMode> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "no_check" => Some(ContentCheckMode::NoCheck),
            "content_match" => Some(ContentCheckMode::ContentMatch),
            "any_keywords" => Some(ContentCheckMode::AnyKeywords),
            "all_keywords" => Some(ContentCheckMode::AllKeywords),
            "smart_content_match" => Some(ContentCheckMode::SmartContentMatch),
            _ => None,
        }
    }
}

/// Content type attached to body-bearing probe requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostContentType {
    Text,
    Json,
    Xml,
}

impl PostContentType {
    pub fn mime(self) -> &'static str {
        match self {
            PostContentType::Text => "text/plain",
            PostContentType::Json => "application/json",
            PostContentType::Xml => "application/xml",
        }
    }

    pub fn parse(value: &str) -> Option<PostContentType> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(PostContentType::Text),
            "json" => Some(PostContentType::Json),
            "xml" => Some(PostContentType::Xml),
            _ => None,
        }
    }
}

/// Last observed state of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Unknown,
    Working,
    Failed,
}

impl MonitorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MonitorStatus::Unknown => "unknown",
            MonitorStatus::Working => "working",
            MonitorStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event classes reported to the database controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Working,
    NoResponse,
    ContentChanged,
    Keywords,
    SslCertificate,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Working => "working",
            EventType::NoResponse => "no_response",
            EventType::ContentChanged => "content_changed",
            EventType::Keywords => "keywords",
            EventType::SslCertificate => "ssl_certificate",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current Unix time, in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_round_trip() {
        for method in [
            Method::Get,
            Method::Head,
            Method::Post,
            Method::Put,
            Method::Delete,
            Method::Options,
            Method::Patch,
        ] {
            assert_eq!(Method::parse(method.as_str()), Some(method));
        }
        assert_eq!(Method::parse("TRACE"), None);
    }

    #[test]
    fn content_check_mode_accepts_dashes() {
        assert_eq!(
            ContentCheckMode::parse("smart-content-match"),
            Some(ContentCheckMode::SmartContentMatch)
        );
        assert_eq!(ContentCheckMode::parse("md5"), None);
    }

    #[test]
    fn body_bearing_methods() {
        assert!(Method::Post.has_body());
        assert!(Method::Put.has_body());
        assert!(Method::Patch.has_body());
        assert!(!Method::Get.has_body());
        assert!(!Method::Head.has_body());
    }
}
