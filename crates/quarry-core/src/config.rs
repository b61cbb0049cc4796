use std::collections::HashSet;
use std::fmt;
use std::path::Path;

use serde::Deserialize;

use crate::error::AppError;
use crate::fragment::FragmentDecoder;
use crate::governor::GovernorConfig;
use crate::models::Identifier;
use crate::session::Credential;

/// Default parallelism when the input does not specify one.
pub const DEFAULT_CONCURRENCY: usize = 50;

/// Raw job input, as provided by the hosting platform.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInput {
    #[serde(default)]
    pub usernames: Vec<String>,
    #[serde(default)]
    pub session_cookies: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl fmt::Debug for JobInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobInput")
            .field("usernames", &self.usernames)
            .field("session_cookies", &"<redacted>")
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl JobInput {
    /// Read an input document from a JSON file.
    pub fn from_path(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// A validated extraction job.
///
/// Invariants: at least one identifier, no duplicates, non-empty credential,
/// `concurrency >= 1`.
#[derive(Debug, Clone)]
pub struct JobConfig {
    identifiers: Vec<Identifier>,
    credential: Credential,
    concurrency: usize,
}

impl JobConfig {
    /// Normalizes, deduplicates and validates the job.
    ///
    /// Each raw identifier is trimmed of surrounding whitespace and `@`;
    /// identifiers that end up empty are skipped.
    pub fn new<I, S>(identifiers: I, credential: Credential, concurrency: usize) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = HashSet::new();
        let mut normalized = Vec::new();
        for raw in identifiers {
            let raw = raw.as_ref();
            let clean = normalize_identifier(raw);
            if clean.is_empty() {
                tracing::warn!(raw = %raw, "Skipping empty identifier");
                continue;
            }
            if seen.insert(clean.to_string()) {
                normalized.push(Identifier::new(clean));
            } else {
                tracing::debug!(identifier = %clean, "Dropping duplicate identifier");
            }
        }

        if normalized.is_empty() {
            return Err(AppError::InvalidConfig(
                "at least one identifier is required".into(),
            ));
        }
        if credential.is_empty() {
            return Err(AppError::InvalidConfig(
                "a session credential is required for authentication".into(),
            ));
        }
        if concurrency == 0 {
            return Err(AppError::InvalidConfig(
                "concurrency must be at least 1".into(),
            ));
        }

        Ok(Self {
            identifiers: normalized,
            credential,
            concurrency,
        })
    }

    pub fn identifiers(&self) -> &[Identifier] {
        &self.identifiers
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

impl TryFrom<JobInput> for JobConfig {
    type Error = AppError;

    fn try_from(input: JobInput) -> Result<Self, Self::Error> {
        JobConfig::new(
            input.usernames,
            Credential::new(&input.session_cookies),
            input.concurrency,
        )
    }
}

fn normalize_identifier(raw: &str) -> &str {
    raw.trim_matches(|c: char| c == '@' || c.is_whitespace())
}

/// Pagination limits and retry budget, per identifier.
#[derive(Debug, Clone)]
pub struct PaginationConfig {
    /// Optional page ceiling. `None` means only `safety_cap` applies.
    pub max_pages: Option<u32>,
    /// Hard cap that stops runaway cursors.
    pub safety_cap: u32,
    /// Retries allowed for throttled or transient failures.
    pub max_retries: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            max_pages: None,
            safety_cap: 1000,
            max_retries: 5,
        }
    }
}

impl PaginationConfig {
    /// The effective page ceiling.
    pub fn page_limit(&self) -> u32 {
        self.max_pages
            .map_or(self.safety_cap, |m| m.min(self.safety_cap))
    }
}

/// Engine tuning that is independent of any single job.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub pagination: PaginationConfig,
    pub governor: GovernorConfig,
    pub decoder: FragmentDecoder,
    /// Capacity of the outcome channel. `None` means "same as concurrency".
    pub output_buffer: Option<usize>,
}

impl EngineConfig {
    pub fn with_pagination(mut self, pagination: PaginationConfig) -> Self {
        self.pagination = pagination;
        self
    }

    pub fn with_governor(mut self, governor: GovernorConfig) -> Self {
        self.governor = governor;
        self
    }

    pub fn with_decoder(mut self, decoder: FragmentDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_output_buffer(mut self, capacity: usize) -> Self {
        self.output_buffer = Some(capacity);
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.pagination.safety_cap == 0 {
            return Err(AppError::InvalidConfig("safety_cap must be at least 1".into()));
        }
        if self.pagination.max_pages == Some(0) {
            return Err(AppError::InvalidConfig("max_pages must be at least 1".into()));
        }
        if self.output_buffer == Some(0) {
            return Err(AppError::InvalidConfig("output_buffer must be at least 1".into()));
        }
        self.governor.validate()
    }

    /// Read overrides from environment variables on top of the defaults.
    ///
    /// - `QUARRY_MAX_PAGES` (optional page ceiling)
    /// - `QUARRY_MAX_RETRIES` (optional, defaults to 5)
    /// - `QUARRY_RATE_PER_SEC` (optional, defaults to 10)
    /// - `QUARRY_MAX_DELAY_SECS` (optional, defaults to 60)
    /// - `QUARRY_CONNECTION` (optional, defaults to the timeline connection)
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env), reading variables through `var`.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let mut config = Self::default();

        if let Some(max_pages) = parse_var::<u32>(&var, "QUARRY_MAX_PAGES")? {
            config.pagination.max_pages = Some(max_pages);
        }
        if let Some(max_retries) = parse_var::<u32>(&var, "QUARRY_MAX_RETRIES")? {
            config.pagination.max_retries = max_retries;
        }
        if let Some(rate) = parse_var::<f64>(&var, "QUARRY_RATE_PER_SEC")? {
            config.governor.rate_per_sec = rate;
        }
        if let Some(secs) = parse_var::<u64>(&var, "QUARRY_MAX_DELAY_SECS")? {
            config.governor.max_delay = std::time::Duration::from_secs(secs);
        }
        if let Some(connection) = var("QUARRY_CONNECTION") {
            config.decoder = FragmentDecoder::new(connection);
        }

        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, AppError> {
    match var(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| {
            AppError::InvalidConfig(format!("Invalid {key} '{raw}': not a valid number"))
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn cred() -> Credential {
        Credential::new("sessionid=abc")
    }

    #[test]
    fn identifiers_are_normalized_and_deduplicated() {
        let job = JobConfig::new(["@alice", " bob ", "alice", "@ ", "carol", "bob"], cred(), 2).unwrap();
        let ids: Vec<_> = job.identifiers().iter().map(Identifier::as_str).collect();
        assert_eq!(ids, ["alice", "bob", "carol"]);
        assert_eq!(job.concurrency(), 2);
    }

    #[test]
    fn empty_identifiers_are_rejected() {
        let err = JobConfig::new(["", "@"], cred(), 1).unwrap_err();
        assert!(matches!(err, AppError::InvalidConfig(_)));
        let none: [&str; 0] = [];
        assert!(JobConfig::new(none, cred(), 1).is_err());
    }

    #[test]
    fn empty_credential_is_rejected() {
        let err = JobConfig::new(["alice"], Credential::new("  "), 1).unwrap_err();
        assert!(err.to_string().contains("credential"));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        assert!(JobConfig::new(["alice"], cred(), 0).is_err());
    }

    #[test]
    fn job_input_defaults_concurrency() {
        let input: JobInput = serde_json::from_str(
            r#"{"usernames": ["alice"], "sessionCookies": "sessionid=abc"}"#,
        )
        .unwrap();
        assert_eq!(input.concurrency, DEFAULT_CONCURRENCY);
        let job = JobConfig::try_from(input).unwrap();
        assert_eq!(job.concurrency(), 50);
        assert_eq!(job.credential().expose(), "sessionid=abc");
    }

    #[test]
    fn job_input_debug_hides_cookies() {
        let input: JobInput =
            serde_json::from_str(r#"{"usernames": [], "sessionCookies": "secret-cookie"}"#).unwrap();
        assert!(!format!("{input:?}").contains("secret-cookie"));
    }

    #[test]
    fn job_input_reads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"usernames": ["@dave"], "sessionCookies": "c", "concurrency": 3}}"#
        )
        .unwrap();
        let input = JobInput::from_path(file.path()).unwrap();
        assert_eq!(input.usernames, ["@dave"]);
        assert_eq!(input.concurrency, 3);
    }

    #[test]
    fn job_input_from_missing_file_is_io_error() {
        let err = JobInput::from_path(Path::new("/definitely/not/here.json")).unwrap_err();
        assert!(matches!(err, AppError::Io(_)));
    }

    #[test]
    fn page_limit_respects_safety_cap() {
        let mut pagination = PaginationConfig::default();
        assert_eq!(pagination.page_limit(), 1000);
        pagination.max_pages = Some(3);
        assert_eq!(pagination.page_limit(), 3);
        pagination.max_pages = Some(5000);
        assert_eq!(pagination.page_limit(), 1000);
    }

    #[test]
    fn engine_config_validation() {
        assert!(EngineConfig::default().validate().is_ok());
        let bad = EngineConfig::default().with_pagination(PaginationConfig {
            max_pages: Some(0),
            ..Default::default()
        });
        assert!(bad.validate().is_err());
        assert!(EngineConfig::default().with_output_buffer(0).validate().is_err());
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = EngineConfig::from_vars(vars(&[
            ("QUARRY_MAX_PAGES", "4"),
            ("QUARRY_MAX_RETRIES", " 2 "),
            ("QUARRY_RATE_PER_SEC", "2.5"),
            ("QUARRY_MAX_DELAY_SECS", "90"),
            ("QUARRY_CONNECTION", "edge_felix_video_timeline"),
        ]))
        .unwrap();
        assert_eq!(config.pagination.max_pages, Some(4));
        assert_eq!(config.pagination.max_retries, 2);
        assert_eq!(config.governor.rate_per_sec, 2.5);
        assert_eq!(config.governor.max_delay, std::time::Duration::from_secs(90));
        assert_eq!(config.decoder.connection(), "edge_felix_video_timeline");
    }

    #[test]
    fn env_without_overrides_uses_defaults() {
        let config = EngineConfig::from_vars(vars(&[])).unwrap();
        assert_eq!(config.pagination.max_pages, None);
        assert_eq!(config.pagination.max_retries, 5);
    }

    #[test]
    fn env_invalid_number_is_rejected() {
        let err = EngineConfig::from_vars(vars(&[("QUARRY_MAX_RETRIES", "lots")])).unwrap_err();
        assert!(matches!(err, AppError::InvalidConfig(_)));
        assert!(err.to_string().contains("QUARRY_MAX_RETRIES"));

        // parses, but fails validation
        let err = EngineConfig::from_vars(vars(&[("QUARRY_MAX_PAGES", "0")])).unwrap_err();
        assert!(err.to_string().contains("max_pages"));
    }
}
