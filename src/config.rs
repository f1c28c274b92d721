//! Configuration for taskwright.
//!
//! Read from `taskwright.toml` (or the `--config` path). Every field has a
//! default, so a missing file or a partial one is fine. `${VAR}` references
//! are expanded from the environment before parsing.
//!
//! # Configuration File Format
//!
//! ```toml
//! provider = "github"
//! poll_interval_secs = 60
//! shutdown_timeout_secs = 30
//! trigger_label = "ai-implement"
//!
//! [github]
//! token = "${GITHUB_TOKEN}"
//!
//! [agent]
//! command = "claude"
//! timeout_secs = 1800
//! review_cycles = 5
//!
//! [retry]
//! max_attempts = 3
//! backoff_base_secs = 10
//! rate_limit_retry_secs = 300
//!
//! [concurrency]
//! max_per_repo = 1
//! max_total = 5
//! dependency_detection = "auto"
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dependency::DetectionMode;
use crate::logging::LogFormat;
use crate::retry::RetryPolicy;

pub const DEFAULT_CONFIG_FILE: &str = "taskwright.toml";

static ENV_VAR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Which tracker backend to talk to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    GitHub,
    Gitea,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::GitHub => write!(f, "github"),
            ProviderKind::Gitea => write!(f, "gitea"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubConfig {
    #[serde(default)]
    pub token: String,
    /// REST root; override for GitHub Enterprise.
    #[serde(default = "default_github_api_url")]
    pub api_url: String,
}

fn default_github_api_url() -> String {
    crate::tracker::github::DEFAULT_API_URL.to_string()
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            api_url: default_github_api_url(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GiteaConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,
    #[serde(default = "default_agent_timeout")]
    pub timeout_secs: u64,
    /// Self-review passes over the plan and over the code.
    #[serde(default = "default_review_cycles")]
    pub review_cycles: u32,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_timeout() -> u64 {
    1800
}

fn default_review_cycles() -> u32 {
    5
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            timeout_secs: default_agent_timeout(),
            review_cycles: default_review_cycles(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_rate_limit_retry")]
    pub rate_limit_retry_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    10
}

fn default_rate_limit_retry() -> u64 {
    300
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            rate_limit_retry_secs: default_rate_limit_retry(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Used when the repository's default branch cannot be read.
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default = "default_true")]
    pub auto_merge: bool,
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            base_branch: default_base_branch(),
            auto_merge: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_max_per_repo")]
    pub max_per_repo: usize,
    #[serde(default = "default_max_total")]
    pub max_total: usize,
    #[serde(default)]
    pub dependency_detection: DetectionMode,
}

fn default_max_per_repo() -> usize {
    1
}

fn default_max_total() -> usize {
    5
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_per_repo: default_max_per_repo(),
            max_total: default_max_total(),
            dependency_detection: DetectionMode::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Show log entries in the status comment. The state fragment is written regardless.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_debounce")]
    pub debounce_secs: u64,
}

fn default_debounce() -> u64 {
    60
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_secs: default_debounce(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiConfig {
    #[serde(default = "default_true")]
    pub wait_for_ci: bool,
    #[serde(default = "default_max_fix_attempts")]
    pub max_fix_attempts: u32,
    #[serde(default = "default_ci_timeout")]
    pub timeout_secs: u64,
}

fn default_max_fix_attempts() -> u32 {
    3
}

fn default_ci_timeout() -> u64 {
    3600
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            wait_for_ci: true,
            max_fix_attempts: default_max_fix_attempts(),
            timeout_secs: default_ci_timeout(),
        }
    }
}

/// Root of `taskwright.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// How long in-flight jobs get to finish on shutdown before they are cancelled.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_trigger_label")]
    pub trigger_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Defaults to `<data dir>/taskwright/workspaces`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_dir: Option<PathBuf>,
    #[serde(default)]
    pub github: GitHubConfig,
    #[serde(default)]
    pub gitea: GiteaConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub defaults: DefaultsConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub ci: CiConfig,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_trigger_label() -> String {
    "ai-implement".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            poll_interval_secs: default_poll_interval(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            trigger_label: default_trigger_label(),
            log_file: None,
            log_format: LogFormat::default(),
            workspace_dir: None,
            github: GitHubConfig::default(),
            gitea: GiteaConfig::default(),
            agent: AgentConfig::default(),
            retry: RetryConfig::default(),
            defaults: DefaultsConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            progress: ProgressConfig::default(),
            ci: CiConfig::default(),
        }
    }
}

/// Replace `${VAR}` with the variable's value; unset variables become empty.
pub fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_default()
        })
        .into_owned()
}

impl Config {
    /// Parse a TOML string after `${VAR}` expansion. Env overrides are not applied.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        toml::from_str(&expanded).context("Failed to parse taskwright.toml")
    }

    /// Load from a file and apply env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config = Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Self::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let mut config = Self::default();
        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize taskwright.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// `TASKWRIGHT_AGENT_CMD` replaces the agent command; tokens fall back to
    /// `GITHUB_TOKEN` / `GITEA_TOKEN` when the file leaves them empty.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(cmd) = std::env::var("TASKWRIGHT_AGENT_CMD")
            && !cmd.trim().is_empty()
        {
            self.agent.command = cmd;
        }
        if self.github.token.is_empty()
            && let Ok(token) = std::env::var("GITHUB_TOKEN")
        {
            self.github.token = token;
        }
        if self.gitea.token.is_empty()
            && let Ok(token) = std::env::var("GITEA_TOKEN")
        {
            self.gitea.token = token;
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.timeout_secs)
    }

    /// Retry policy for tracker calls.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_secs(self.retry.backoff_base_secs),
            Duration::from_secs(self.retry.rate_limit_retry_secs),
        )
    }

    pub fn workspace_root(&self) -> PathBuf {
        match &self.workspace_dir {
            Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
            _ => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from(".taskwright"))
                .join("taskwright")
                .join("workspaces"),
        }
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// Human-readable problems that do not stop the config from loading.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.concurrency.max_total == 0 {
            warnings.push("concurrency.max_total is 0: no work will ever run".to_string());
        }
        if self.concurrency.max_per_repo == 0 {
            warnings.push("concurrency.max_per_repo is 0: no work will ever run".to_string());
        }
        if self.concurrency.max_per_repo > self.concurrency.max_total {
            warnings.push(format!(
                "concurrency.max_per_repo ({}) exceeds max_total ({}); max_total wins",
                self.concurrency.max_per_repo, self.concurrency.max_total
            ));
        }
        if self.trigger_label.trim().is_empty() {
            warnings.push("trigger_label is empty".to_string());
        }
        if self.agent.timeout_secs == 0 {
            warnings.push("agent.timeout_secs is 0: every agent call will time out".to_string());
        }

        match self.provider {
            ProviderKind::GitHub => {
                if self.github.token.is_empty() {
                    warnings.push(
                        "github.token is not set (and GITHUB_TOKEN is empty)".to_string(),
                    );
                }
            }
            ProviderKind::Gitea => {
                if self.gitea.url.is_empty() {
                    warnings.push("gitea.url is not set".to_string());
                }
                if self.gitea.token.is_empty() {
                    warnings.push("gitea.token is not set (and GITEA_TOKEN is empty)".to_string());
                }
            }
        }

        warnings
    }
}

/// Starter file written by `config init`.
pub const TEMPLATE: &str = r#"# taskwright configuration

provider = "github"            # or "gitea"
poll_interval_secs = 60
shutdown_timeout_secs = 30
trigger_label = "ai-implement"
# log_file = "/var/log/taskwright.log"
log_format = "text"            # or "json"
# workspace_dir = "/var/lib/taskwright/workspaces"

[github]
token = "${GITHUB_TOKEN}"

[gitea]
url = ""
token = "${GITEA_TOKEN}"

[agent]
command = "claude"
timeout_secs = 1800
review_cycles = 5

[retry]
max_attempts = 3
backoff_base_secs = 10
rate_limit_retry_secs = 300

[defaults]
base_branch = "main"
auto_merge = true

[concurrency]
max_per_repo = 1
max_total = 5
dependency_detection = "auto"  # auto | manual | disabled

[progress]
enabled = true
debounce_secs = 60

[ci]
wait_for_ci = true
max_fix_attempts = 3
timeout_secs = 3600
"#;

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    // Tests that touch process env vars serialize on this.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.provider, ProviderKind::GitHub);
        assert_eq!(config.poll_interval_secs, 60);
        assert_eq!(config.shutdown_timeout_secs, 30);
        assert_eq!(config.trigger_label, "ai-implement");
        assert_eq!(config.agent.command, "claude");
        assert_eq!(config.agent.review_cycles, 5);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.concurrency.max_per_repo, 1);
        assert_eq!(config.concurrency.max_total, 5);
        assert_eq!(config.concurrency.dependency_detection, DetectionMode::Auto);
        assert!(config.progress.enabled);
        assert!(config.ci.wait_for_ci);
        assert_eq!(config.github.api_url, "https://api.github.com");
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let content = r#"
provider = "gitea"

[gitea]
url = "https://git.example.com"

[concurrency]
max_total = 8
dependency_detection = "manual"
"#;
        let config = Config::parse(content).unwrap();
        assert_eq!(config.provider, ProviderKind::Gitea);
        assert_eq!(config.gitea.url, "https://git.example.com");
        assert_eq!(config.concurrency.max_total, 8);
        assert_eq!(config.concurrency.max_per_repo, 1);
        assert_eq!(config.concurrency.dependency_detection, DetectionMode::Manual);
    }

    #[test]
    fn test_template_parses() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let config = Config::parse(TEMPLATE).unwrap();
        assert_eq!(config.retry.rate_limit_retry_secs, 300);
        assert_eq!(config.ci.max_fix_attempts, 3);
        assert!(config.log_file().is_none());
    }

    #[test]
    fn test_invalid_toml_is_error() {
        assert!(Config::parse("provider = [").is_err());
        assert!(Config::parse("provider = \"bitbucket\"").is_err());
    }

    #[test]
    fn test_env_var_expansion() {
        let _guard = ENV_MUTEX.lock().unwrap();
        unsafe { std::env::set_var("TASKWRIGHT_TEST_TOKEN", "secret-123") };
        let config = Config::parse("[github]\ntoken = \"${TASKWRIGHT_TEST_TOKEN}\"").unwrap();
        assert_eq!(config.github.token, "secret-123");
        unsafe { std::env::remove_var("TASKWRIGHT_TEST_TOKEN") };

        assert_eq!(expand_env_vars("a ${TASKWRIGHT_UNSET_VAR_XYZ} b"), "a  b");
        assert_eq!(expand_env_vars("no vars $HOME"), "no vars $HOME");
    }

    #[test]
    fn test_agent_command_env_override() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var("TASKWRIGHT_AGENT_CMD").ok();
        unsafe { std::env::set_var("TASKWRIGHT_AGENT_CMD", "/opt/bin/claude") };

        let mut config = Config::parse("[agent]\ncommand = \"file-claude\"").unwrap();
        assert_eq!(config.agent.command, "file-claude");
        config.apply_env_overrides();
        assert_eq!(config.agent.command, "/opt/bin/claude");

        match saved {
            Some(val) => unsafe { std::env::set_var("TASKWRIGHT_AGENT_CMD", val) },
            None => unsafe { std::env::remove_var("TASKWRIGHT_AGENT_CMD") },
        }
    }

    #[test]
    fn test_token_env_fallback_only_when_empty() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var("GITHUB_TOKEN").ok();
        unsafe { std::env::set_var("GITHUB_TOKEN", "from-env") };

        let mut empty = Config::default();
        empty.apply_env_overrides();
        assert_eq!(empty.github.token, "from-env");

        let mut explicit = Config::parse("[github]\ntoken = \"from-file\"").unwrap();
        explicit.apply_env_overrides();
        assert_eq!(explicit.github.token, "from-file");

        match saved {
            Some(val) => unsafe { std::env::set_var("GITHUB_TOKEN", val) },
            None => unsafe { std::env::remove_var("GITHUB_TOKEN") },
        }
    }

    #[test]
    fn test_load_and_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        let mut config = Config::default();
        config.concurrency.max_total = 9;
        config.github.token = "tok".into();
        config.save(&path).unwrap();

        let _guard = ENV_MUTEX.lock().unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.concurrency.max_total, 9);
        assert_eq!(loaded.github.token, "tok");
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = ENV_MUTEX.lock().unwrap();
        let config = Config::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.poll_interval_secs, 60);
    }

    #[test]
    fn test_validate_flags_problems() {
        let mut config = Config::default();
        config.github.token = "tok".into();
        assert!(config.validate().is_empty());

        config.concurrency.max_per_repo = 6;
        config.concurrency.max_total = 0;
        let warnings = config.validate();
        assert!(warnings.iter().any(|w| w.contains("max_total is 0")));
        assert!(warnings.iter().any(|w| w.contains("exceeds max_total")));

        let gitea = Config {
            provider: ProviderKind::Gitea,
            ..Config::default()
        };
        let warnings = gitea.validate();
        assert!(warnings.iter().any(|w| w.contains("gitea.url")));
        assert!(warnings.iter().any(|w| w.contains("gitea.token")));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let config = Config::parse("[retry]\nmax_attempts = 7\nbackoff_base_secs = 2").unwrap();
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.backoff_base, Duration::from_secs(2));
        assert_eq!(policy.rate_limit_wait, Duration::from_secs(300));
    }

    #[test]
    fn test_workspace_root_override() {
        let config = Config::parse("workspace_dir = \"/tmp/tw\"").unwrap();
        assert_eq!(config.workspace_root(), PathBuf::from("/tmp/tw"));
        assert!(Config::default().workspace_root().ends_with("taskwright/workspaces"));
    }
}
