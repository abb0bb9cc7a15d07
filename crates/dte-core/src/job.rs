use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{AppError, FailureClass};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Admitted,
    Running,
    Succeeded,
    /// An attempt failed and the retry decision has not been applied yet.
    Failed,
    Retrying,
    DeadLettered,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Admitted,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Retrying,
        JobStatus::DeadLettered,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Admitted => "admitted",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Retrying => "retrying",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::DeadLettered)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "admitted" => Ok(JobStatus::Admitted),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "retrying" => Ok(JobStatus::Retrying),
            "dead_lettered" | "deadlettered" => Ok(JobStatus::DeadLettered),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// Dispatch tier. Higher tiers are dequeued first; FIFO within a tier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_i16(&self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Normal => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    pub fn from_i16(value: i16) -> Self {
        match value {
            i16::MIN..=0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Critical,
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
        }
    }

    fn allows_body(&self) -> bool {
        !matches!(self, HttpMethod::Get | HttpMethod::Head)
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            "PUT" => Ok(HttpMethod::Put),
            "PATCH" => Ok(HttpMethod::Patch),
            "DELETE" => Ok(HttpMethod::Delete),
            "HEAD" => Ok(HttpMethod::Head),
            _ => Err(format!("Unsupported HTTP method: {}", s)),
        }
    }
}

/// What a job does. Each variant knows how to validate itself and which
/// rate-limit key it falls under; executing it is the job of an
/// [`Executor`](crate::traits::Executor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobTarget {
    /// Plain GET of a page.
    HttpFetch {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    /// JSON API request.
    ApiCall {
        url: String,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
    /// Download a resource to a relative path under the executor's download root.
    FileDownload { url: String, destination: PathBuf },
}

impl JobTarget {
    pub fn http_fetch(url: impl Into<String>) -> Self {
        JobTarget::HttpFetch {
            url: url.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn api_call(
        url: impl Into<String>,
        method: HttpMethod,
        body: Option<serde_json::Value>,
    ) -> Self {
        JobTarget::ApiCall {
            url: url.into(),
            method,
            body,
            headers: BTreeMap::new(),
        }
    }

    pub fn file_download(url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        JobTarget::FileDownload {
            url: url.into(),
            destination: destination.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            JobTarget::HttpFetch { .. } => "http_fetch",
            JobTarget::ApiCall { .. } => "api_call",
            JobTarget::FileDownload { .. } => "file_download",
        }
    }

    pub fn url(&self) -> &str {
        match self {
            JobTarget::HttpFetch { url, .. }
            | JobTarget::ApiCall { url, .. }
            | JobTarget::FileDownload { url, .. } => url,
        }
    }

    pub fn headers(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            JobTarget::HttpFetch { headers, .. } | JobTarget::ApiCall { headers, .. } => {
                Some(headers)
            }
            JobTarget::FileDownload { .. } => None,
        }
    }

    /// Check the target is well-formed. Nothing is resolved or fetched.
    pub fn validate(&self) -> Result<(), AppError> {
        parse_target_url(self.url())?;

        if let Some(headers) = self.headers() {
            for (name, value) in headers {
                if name.is_empty() || !name.bytes().all(is_header_token_byte) {
                    return Err(AppError::ValidationError(format!(
                        "Invalid header name '{name}'"
                    )));
                }
                if value.contains(['\r', '\n']) {
                    return Err(AppError::ValidationError(format!(
                        "Header '{name}' contains a line break"
                    )));
                }
            }
        }

        match self {
            JobTarget::ApiCall {
                method,
                body: Some(_),
                ..
            } if !method.allows_body() => Err(AppError::ValidationError(format!(
                "{} requests cannot carry a body",
                method.as_str()
            ))),
            JobTarget::FileDownload { destination, .. } => validate_destination(destination),
            _ => Ok(()),
        }
    }

    /// Rate-limit key for this target: `scheme://host:port`.
    pub fn target_key(&self) -> Result<String, AppError> {
        let url = parse_target_url(self.url())?;
        domain_key(&url)
            .ok_or_else(|| AppError::ValidationError(format!("URL has no host: {}", self.url())))
    }
}

fn parse_target_url(raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw)
        .map_err(|e| AppError::ValidationError(format!("Invalid URL '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::ValidationError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(AppError::ValidationError(format!("URL has no host: {raw}")));
    }
    Ok(url)
}

fn domain_key(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    let port = url
        .port_or_known_default()
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    Some(format!("{}://{}{}", url.scheme(), host, port))
}

fn is_header_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn validate_destination(destination: &std::path::Path) -> Result<(), AppError> {
    if destination.as_os_str().is_empty() {
        return Err(AppError::ValidationError(
            "Download destination is empty".into(),
        ));
    }
    for component in destination.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(AppError::ValidationError(format!(
                    "Download destination must be a relative path without '..': {}",
                    destination.display()
                )));
            }
        }
    }
    Ok(())
}

/// A unit of work owned by the engine once submitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub target: JobTarget,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of attempts started so far.
    pub attempt_count: u32,
    pub max_retries: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Un-jittered delay used for the last scheduled retry, in milliseconds.
    pub last_backoff_ms: u64,
    pub error_detail: Option<String>,
    pub result: Option<serde_json::Value>,
    pub worker_id: Option<String>,
}

impl Job {
    pub fn new(request: SubmitJobRequest, default_max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            target: request.target,
            payload: request.payload,
            priority: request.priority,
            status: JobStatus::Pending,
            created_at: now,
            updated_at: now,
            attempt_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            next_attempt_at: None,
            last_backoff_ms: 0,
            error_detail: None,
            result: None,
            worker_id: None,
        }
    }

    /// Validate target and payload.
    pub fn validate(&self) -> Result<(), AppError> {
        self.target.validate()?;
        if !(self.payload.is_object() || self.payload.is_null()) {
            return Err(AppError::ValidationError(
                "Payload must be a JSON object or null".into(),
            ));
        }
        Ok(())
    }

    /// Maximum number of attempts this job may ever start.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts()
    }
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    TransientError,
    TimedOut,
    RateLimited,
    PermanentError,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded => "succeeded",
            AttemptOutcome::TransientError => "transient_error",
            AttemptOutcome::TimedOut => "timed_out",
            AttemptOutcome::RateLimited => "rate_limited",
            AttemptOutcome::PermanentError => "permanent_error",
        }
    }

    pub fn from_error(error: &AppError) -> Self {
        match error {
            AppError::Timeout(_) => AttemptOutcome::TimedOut,
            _ => match error.failure_class() {
                Some(FailureClass::RateLimited) => AttemptOutcome::RateLimited,
                Some(FailureClass::Transient) => AttemptOutcome::TransientError,
                Some(FailureClass::Permanent) | None => AttemptOutcome::PermanentError,
            },
        }
    }

    /// `None` for a successful attempt.
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            AttemptOutcome::Succeeded => None,
            AttemptOutcome::TransientError | AttemptOutcome::TimedOut => {
                Some(FailureClass::Transient)
            }
            AttemptOutcome::RateLimited => Some(FailureClass::RateLimited),
            AttemptOutcome::PermanentError => Some(FailureClass::Permanent),
        }
    }
}

impl FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(AttemptOutcome::Succeeded),
            "transient_error" => Ok(AttemptOutcome::TransientError),
            "timed_out" => Ok(AttemptOutcome::TimedOut),
            "rate_limited" => Ok(AttemptOutcome::RateLimited),
            "permanent_error" => Ok(AttemptOutcome::PermanentError),
            _ => Err(format!("Unknown attempt outcome: {}", s)),
        }
    }
}

/// One execution try of a job. Immutable once recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub job_id: Uuid,
    /// 1-based.
    pub attempt_number: u32,
    pub assigned_proxy: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub error_detail: Option<String>,
}

/// A job together with its attempt history, as served by the result store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(flatten)]
    pub job: Job,
    pub attempts: Vec<Attempt>,
}

impl JobRecord {
    pub fn status(&self) -> JobStatus {
        self.job.status
    }
}

/// Request to submit a new job.
#[derive(Debug, Clone)]
pub struct SubmitJobRequest {
    pub target: JobTarget,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub max_retries: Option<u32>,
}

impl SubmitJobRequest {
    pub fn new(target: JobTarget) -> Self {
        Self {
            target,
            payload: serde_json::Value::Null,
            priority: Priority::Normal,
            max_retries: None,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_roundtrip() {
        for status in JobStatus::ALL {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Admitted.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::DeadLettered.is_terminal());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        for p in [
            Priority::Low,
            Priority::Normal,
            Priority::High,
            Priority::Critical,
        ] {
            assert_eq!(Priority::from_i16(p.as_i16()), p);
        }
    }

    #[test]
    fn test_target_key_includes_default_port() {
        assert_eq!(
            JobTarget::http_fetch("https://example.com/path?q=1")
                .target_key()
                .unwrap(),
            "https://example.com:443"
        );
        assert_eq!(
            JobTarget::http_fetch("http://example.com:8080/page")
                .target_key()
                .unwrap(),
            "http://example.com:8080"
        );
    }

    #[test]
    fn test_validate_rejects_malformed_targets() {
        assert!(JobTarget::http_fetch("not-a-url").validate().is_err());
        assert!(JobTarget::http_fetch("file:///etc/passwd").validate().is_err());
        assert!(
            JobTarget::api_call(
                "https://api.example.com",
                HttpMethod::Get,
                Some(serde_json::json!({"a": 1}))
            )
            .validate()
            .is_err()
        );
        assert!(
            JobTarget::file_download("https://example.com/a.zip", "../escape.zip")
                .validate()
                .is_err()
        );
        assert!(
            JobTarget::file_download("https://example.com/a.zip", "/abs/a.zip")
                .validate()
                .is_err()
        );

        let mut headers = BTreeMap::new();
        headers.insert("X-Bad".to_string(), "a\r\nInjected: 1".to_string());
        let target = JobTarget::HttpFetch {
            url: "https://example.com".into(),
            headers,
        };
        assert!(matches!(
            target.validate(),
            Err(AppError::ValidationError(_))
        ));
    }

    #[test]
    fn test_validate_accepts_well_formed_targets() {
        JobTarget::http_fetch("https://example.com").validate().unwrap();
        JobTarget::api_call(
            "https://api.example.com/items",
            HttpMethod::Post,
            Some(serde_json::json!({"name": "x"})),
        )
        .validate()
        .unwrap();
        JobTarget::file_download("https://example.com/a.zip", "downloads/a.zip")
            .validate()
            .unwrap();
    }

    #[test]
    fn test_job_payload_must_be_object_or_null() {
        let job = Job::new(
            SubmitJobRequest::new(JobTarget::http_fetch("https://example.com"))
                .with_payload(serde_json::json!([1, 2, 3])),
            5,
        );
        assert!(job.validate().is_err());

        let job = Job::new(
            SubmitJobRequest::new(JobTarget::http_fetch("https://example.com"))
                .with_payload(serde_json::json!({"tag": "news"})),
            5,
        );
        job.validate().unwrap();
    }

    #[test]
    fn test_submit_request_builder() {
        let req = SubmitJobRequest::new(JobTarget::http_fetch("https://example.com"))
            .with_priority(Priority::High)
            .with_max_retries(2);
        let job = Job::new(req, 5);

        assert_eq!(job.priority, Priority::High);
        assert_eq!(job.max_retries, 2);
        assert_eq!(job.max_attempts(), 3);
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.has_attempts_left());
    }

    #[test]
    fn test_target_serde_is_tagged() {
        let target = JobTarget::file_download("https://example.com/a.zip", "a.zip");
        let json = serde_json::to_value(&target).unwrap();
        assert_eq!(json["kind"], "file_download");

        let parsed: JobTarget = serde_json::from_value(serde_json::json!({
            "kind": "api_call",
            "url": "https://api.example.com",
            "method": "POST",
            "body": {"q": 1}
        }))
        .unwrap();
        assert!(matches!(
            parsed,
            JobTarget::ApiCall {
                method: HttpMethod::Post,
                ..
            }
        ));
    }

    #[test]
    fn test_attempt_outcome_from_error() {
        assert_eq!(
            AttemptOutcome::from_error(&AppError::Timeout(60)),
            AttemptOutcome::TimedOut
        );
        assert_eq!(
            AttemptOutcome::from_error(&AppError::TransientNetworkError("reset".into())),
            AttemptOutcome::TransientError
        );
        assert_eq!(
            AttemptOutcome::from_error(&AppError::RemoteRateLimited { retry_after: None }),
            AttemptOutcome::RateLimited
        );
        assert_eq!(
            AttemptOutcome::from_error(&AppError::PermanentTargetError("404".into())),
            AttemptOutcome::PermanentError
        );
    }
}
