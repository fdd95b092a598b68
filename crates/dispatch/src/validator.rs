//! Defense-in-depth input validation at the service boundary
//!
//! Validate at every layer and never trust upstream: the HTTP surface has
//! its own schema checks, but APIs change and bugs happen. These checks run
//! again inside the service before any credits are charged or any backend
//! is called.

use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use url::Url;

/// Maximum prompt length after trimming
pub const MAX_PROMPT_LENGTH: usize = 2000;
/// Minimum prompt length after trimming
pub const MIN_PROMPT_LENGTH: usize = 1;

/// A single validation failure
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub value: Option<String>,
    pub code: &'static str,
}

impl ValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        value: Option<String>,
        code: &'static str,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            value,
            code,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => {
                let shown: String = value.chars().take(50).collect();
                let ellipsis = if value.len() > 50 { "..." } else { "" };
                write!(
                    f,
                    "{}: {} (got: {}{})",
                    self.field, self.message, shown, ellipsis
                )
            }
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

impl std::error::Error for ValidationError {}

/// Several validation failures collected in one pass
#[derive(Debug, Clone)]
pub struct ValidationErrorList(pub Vec<ValidationError>);

impl fmt::Display for ValidationErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "Validation failed: {}", joined.join("; "))
    }
}

impl std::error::Error for ValidationErrorList {}

fn url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?i)^https?://(?:(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,6}\.?|localhost|\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3})(?::\d+)?(?:/?|[/?]\S+)$",
        )
        .expect("url pattern is valid")
    })
}

fn model_resolutions() -> &'static HashMap<&'static str, Vec<&'static str>> {
    static TABLE: OnceLock<HashMap<&'static str, Vec<&'static str>>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("wan", vec!["480p", "720p", "1080p"]),
            ("wan21", vec!["480p", "720p"]),
            ("wan22", vec!["480p", "580p", "720p"]),
            ("wan-pro", vec!["1080p"]),
            ("kling", vec!["720p", "1080p"]),
            ("kling-standard", vec!["720p", "1080p"]),
            ("kling-master", vec!["720p", "1080p"]),
            ("veo2", vec!["720p"]),
            ("veo31", vec!["720p", "1080p"]),
            ("veo31-fast", vec!["720p", "1080p"]),
            ("veo31-flf", vec!["720p", "1080p"]),
            ("veo31-fast-flf", vec!["720p", "1080p"]),
            ("sora-2", vec!["720p"]),
            ("sora-2-pro", vec!["720p", "1080p"]),
        ])
    })
}

fn model_durations() -> &'static HashMap<&'static str, Vec<u32>> {
    static TABLE: OnceLock<HashMap<&'static str, Vec<u32>>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("wan", vec![5]),
            ("wan21", vec![5]),
            ("wan22", vec![5]),
            ("wan-pro", vec![5]),
            ("kling", vec![5, 10]),
            ("kling-standard", vec![5, 10]),
            ("kling-master", vec![5, 10]),
            ("veo2", vec![4, 6, 8]),
            ("veo31", vec![4, 6, 8]),
            ("veo31-fast", vec![4, 6, 8]),
            ("veo31-flf", vec![4, 6, 8]),
            ("veo31-fast-flf", vec![4, 6, 8]),
            ("sora-2", vec![4, 8, 12]),
            ("sora-2-pro", vec![4, 8, 12]),
        ])
    })
}

/// Service-layer input validator.
///
/// Synchronous checks; the optional HTTP reachability probe is the one async
/// method and is off the hot path.
#[derive(Debug, Clone, Default)]
pub struct InputValidator {
    _private: (),
}

impl InputValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate URL format and scheme. Returns the trimmed URL.
    pub fn validate_url(
        &self,
        raw: &str,
        field: &str,
        schemes: &[&str],
        require_path: bool,
    ) -> Result<String, ValidationError> {
        if raw.trim().is_empty() {
            return Err(ValidationError::new(field, "URL is required", None, "required"));
        }
        let trimmed = raw.trim().to_string();

        if !url_pattern().is_match(&trimmed) {
            return Err(ValidationError::new(
                field,
                "Invalid URL format",
                Some(trimmed),
                "invalid_format",
            ));
        }

        let parsed = Url::parse(&trimmed).map_err(|e| {
            ValidationError::new(
                field,
                format!("Failed to parse URL: {}", e),
                Some(trimmed.clone()),
                "parse_error",
            )
        })?;

        if !schemes.contains(&parsed.scheme()) {
            return Err(ValidationError::new(
                field,
                format!("URL scheme must be one of: {}", schemes.join(", ")),
                Some(parsed.scheme().to_string()),
                "invalid_scheme",
            ));
        }

        if require_path && parsed.path().trim_matches('/').is_empty() {
            return Err(ValidationError::new(
                field,
                "URL must include a path",
                Some(trimmed),
                "missing_path",
            ));
        }

        Ok(trimmed)
    }

    /// Validate an image URL: https only, path required
    pub fn validate_image_url(&self, raw: &str) -> Result<String, ValidationError> {
        self.validate_url(raw, "image_url", &["https"], true)
    }

    /// Validate a prompt: trimmed length within [1, 2000]
    pub fn validate_prompt(&self, raw: &str) -> Result<String, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.chars().count() < MIN_PROMPT_LENGTH {
            return Err(ValidationError::new(
                "prompt",
                "Prompt must not be empty",
                None,
                "too_short",
            ));
        }
        if trimmed.chars().count() > MAX_PROMPT_LENGTH {
            return Err(ValidationError::new(
                "prompt",
                format!("Prompt must be at most {} characters", MAX_PROMPT_LENGTH),
                Some(format!("{} chars", trimmed.chars().count())),
                "too_long",
            ));
        }
        Ok(trimmed.to_string())
    }

    /// Validate a list's element count
    pub fn validate_list_len<T>(
        &self,
        items: &[T],
        field: &str,
        min: usize,
        max: usize,
    ) -> Result<(), ValidationError> {
        if items.len() < min {
            return Err(ValidationError::new(
                field,
                format!("At least {} item(s) required", min),
                Some(items.len().to_string()),
                "too_short",
            ));
        }
        if items.len() > max {
            return Err(ValidationError::new(
                field,
                format!("At most {} item(s) allowed", max),
                Some(items.len().to_string()),
                "too_long",
            ));
        }
        Ok(())
    }

    /// Validate that a value is one of the allowed choices
    pub fn validate_choice(
        &self,
        value: &str,
        field: &str,
        allowed: &[&str],
    ) -> Result<(), ValidationError> {
        if allowed.contains(&value) {
            return Ok(());
        }
        Err(ValidationError::new(
            field,
            format!("Must be one of: {}", allowed.join(", ")),
            Some(value.to_string()),
            "invalid_choice",
        ))
    }

    /// Validate that a model supports the requested resolution
    pub fn validate_model_resolution(
        &self,
        model: &str,
        resolution: &str,
    ) -> Result<(), ValidationError> {
        let Some(supported) = model_resolutions().get(model) else {
            return Err(ValidationError::new(
                "model",
                "Unknown model",
                Some(model.to_string()),
                "invalid_choice",
            ));
        };
        if !supported.contains(&resolution) {
            return Err(ValidationError::new(
                "resolution",
                format!("Model {} supports: {}", model, supported.join(", ")),
                Some(resolution.to_string()),
                "incompatible",
            ));
        }
        Ok(())
    }

    /// Validate that a model supports the requested duration
    pub fn validate_model_duration(
        &self,
        model: &str,
        duration_sec: u32,
    ) -> Result<(), ValidationError> {
        let Some(supported) = model_durations().get(model) else {
            return Err(ValidationError::new(
                "model",
                "Unknown model",
                Some(model.to_string()),
                "invalid_choice",
            ));
        };
        if !supported.contains(&duration_sec) {
            let supported: Vec<String> = supported.iter().map(|d| d.to_string()).collect();
            return Err(ValidationError::new(
                "duration_sec",
                format!("Model {} supports durations: {}s", model, supported.join(", ")),
                Some(duration_sec.to_string()),
                "incompatible",
            ));
        }
        Ok(())
    }

    /// Collect all submit-level failures for a single-item request at once
    pub fn validate_submission(
        &self,
        image_url: &str,
        prompt: &str,
        model: &str,
        resolution: &str,
        duration_sec: u32,
    ) -> Result<(), ValidationErrorList> {
        let mut errors = Vec::new();

        if let Err(e) = self.validate_image_url(image_url) {
            errors.push(e);
        }
        if let Err(e) = self.validate_prompt(prompt) {
            errors.push(e);
        }
        if let Err(e) = self.validate_model_resolution(model, resolution) {
            errors.push(e);
        }
        if let Err(e) = self.validate_model_duration(model, duration_sec) {
            errors.push(e);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrorList(errors))
        }
    }

    /// Optional HEAD probe: is the image URL reachable, and does it serve an
    /// image content type? Network failures are reported as validation
    /// errors on the field.
    pub async fn probe_image_url(
        &self,
        client: &reqwest::Client,
        url: &str,
        check_content_type: bool,
    ) -> Result<(), ValidationError> {
        let response = client.head(url).send().await.map_err(|e| {
            ValidationError::new(
                "image_url",
                format!("URL not reachable: {}", e),
                Some(url.to_string()),
                "unreachable",
            )
        })?;

        if !response.status().is_success() {
            return Err(ValidationError::new(
                "image_url",
                format!("URL returned status {}", response.status()),
                Some(url.to_string()),
                "unreachable",
            ));
        }

        if check_content_type {
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !content_type.starts_with("image/") {
                return Err(ValidationError::new(
                    "image_url",
                    format!("Expected image content type, got {}", content_type),
                    Some(url.to_string()),
                    "invalid_content_type",
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_urls() {
        let v = InputValidator::new();
        v.validate_url("https://example.com/img.png", "url", &["https"], false)
            .unwrap();
        v.validate_url("http://localhost:8080/x", "url", &["http", "https"], false)
            .unwrap();
        v.validate_url("https://10.0.0.1/path", "url", &["https"], false)
            .unwrap();
        // Trimmed
        assert_eq!(
            v.validate_url("  https://example.com/a  ", "url", &["https"], false)
                .unwrap(),
            "https://example.com/a"
        );
    }

    #[test]
    fn test_invalid_urls() {
        let v = InputValidator::new();
        assert_eq!(
            v.validate_url("", "url", &["https"], false).unwrap_err().code,
            "required"
        );
        assert_eq!(
            v.validate_url("not a url", "url", &["https"], false)
                .unwrap_err()
                .code,
            "invalid_format"
        );
        assert_eq!(
            v.validate_url("ftp://example.com/x", "url", &["https"], false)
                .unwrap_err()
                .code,
            "invalid_format"
        );
    }

    #[test]
    fn test_image_url_scheme_and_path() {
        let v = InputValidator::new();
        v.validate_image_url("https://cdn.example.com/face.jpg").unwrap();

        assert_eq!(
            v.validate_image_url("http://cdn.example.com/face.jpg")
                .unwrap_err()
                .code,
            "invalid_scheme"
        );
        assert_eq!(
            v.validate_image_url("https://cdn.example.com/").unwrap_err().code,
            "missing_path"
        );
    }

    #[test]
    fn test_prompt_boundaries() {
        let v = InputValidator::new();

        // Exactly 1 char accepted
        assert_eq!(v.validate_prompt("a").unwrap(), "a");
        // Exactly 2000 accepted
        let exact = "p".repeat(2000);
        assert_eq!(v.validate_prompt(&exact).unwrap().len(), 2000);
        // 2001 rejected with code too_long
        let over = "p".repeat(2001);
        assert_eq!(v.validate_prompt(&over).unwrap_err().code, "too_long");
        // Empty and whitespace-only rejected
        assert_eq!(v.validate_prompt("").unwrap_err().code, "too_short");
        assert_eq!(v.validate_prompt("   ").unwrap_err().code, "too_short");
    }

    #[test]
    fn test_prompt_trimmed_before_counting() {
        let v = InputValidator::new();
        let padded = format!("  {}  ", "p".repeat(2000));
        assert!(v.validate_prompt(&padded).is_ok());
    }

    #[test]
    fn test_list_len() {
        let v = InputValidator::new();
        v.validate_list_len(&[1, 2, 3], "items", 1, 5).unwrap();
        assert_eq!(
            v.validate_list_len::<i32>(&[], "items", 1, 5).unwrap_err().code,
            "too_short"
        );
        assert_eq!(
            v.validate_list_len(&[1; 6], "items", 1, 5).unwrap_err().code,
            "too_long"
        );
    }

    #[test]
    fn test_model_resolution_table() {
        let v = InputValidator::new();

        v.validate_model_resolution("wan", "1080p").unwrap();
        v.validate_model_resolution("wan22", "580p").unwrap();
        v.validate_model_resolution("kling-master", "720p").unwrap();
        v.validate_model_resolution("sora-2-pro", "1080p").unwrap();

        assert_eq!(
            v.validate_model_resolution("wan-pro", "720p").unwrap_err().code,
            "incompatible"
        );
        assert_eq!(
            v.validate_model_resolution("sora-2", "1080p").unwrap_err().code,
            "incompatible"
        );
        assert_eq!(
            v.validate_model_resolution("unknown-model", "720p")
                .unwrap_err()
                .code,
            "invalid_choice"
        );
    }

    #[test]
    fn test_model_duration_table() {
        let v = InputValidator::new();

        v.validate_model_duration("wan", 5).unwrap();
        v.validate_model_duration("kling", 10).unwrap();
        v.validate_model_duration("veo2", 8).unwrap();
        v.validate_model_duration("sora-2", 12).unwrap();

        assert_eq!(
            v.validate_model_duration("wan", 10).unwrap_err().code,
            "incompatible"
        );
        assert_eq!(
            v.validate_model_duration("veo2", 5).unwrap_err().code,
            "incompatible"
        );
    }

    #[test]
    fn test_choice() {
        let v = InputValidator::new();
        v.validate_choice("kling", "model", &["kling", "wan"]).unwrap();
        assert_eq!(
            v.validate_choice("dalle", "model", &["kling", "wan"])
                .unwrap_err()
                .code,
            "invalid_choice"
        );
    }

    #[test]
    fn test_submission_collects_all_errors() {
        let v = InputValidator::new();
        let err = v
            .validate_submission("not-a-url", "", "wan", "4k", 99)
            .unwrap_err();

        let codes: Vec<&str> = err.0.iter().map(|e| e.code).collect();
        assert_eq!(codes.len(), 4);
        assert!(codes.contains(&"invalid_format"));
        assert!(codes.contains(&"too_short"));
        assert!(codes.contains(&"incompatible"));
    }

    #[test]
    fn test_submission_ok() {
        let v = InputValidator::new();
        v.validate_submission(
            "https://cdn.example.com/src.jpg",
            "a gentle breeze",
            "kling",
            "1080p",
            5,
        )
        .unwrap();
    }

    #[test]
    fn test_error_display_truncates_value() {
        let e = ValidationError::new("url", "Invalid URL format", Some("x".repeat(100)), "invalid_format");
        let shown = e.to_string();
        assert!(shown.contains("..."));
        assert!(shown.len() < 120);
    }
}
