use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use libvbox::rate_limit::default_limits;
use libvbox::terminal::DEFAULT_MAX_TERMINALS;
use libvbox::workspace::{DEFAULT_MAX_SAVE_BYTES, DEFAULT_QUOTA_BYTES};
use libvbox::{BucketConfig, CoordinatorConfig, OperationKind, ShellCommand, WorkspaceOptions};
use serde::Deserialize;
use vbox_protocol::{frame_limit_for, paths};

/// Environment variable consulted for the AI bearer token when the file has none.
pub const AI_TOKEN_ENV: &str = "VBOX_AI_TOKEN";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub allow_origins: Vec<String>,
    /// Base URL of the object storage worker.
    pub storage_url: String,
    /// Base URL of the database worker (users and sharing).
    pub database_url: String,
    /// Completion endpoint for `generateCode`. Unset disables it.
    pub ai_url: Option<String>,
    pub ai_token: Option<String>,
    /// Parent directory of per-box on-disk mirrors.
    pub workspace_root: PathBuf,
    /// Mirror box files to disk so shells see them.
    pub projection: bool,
    pub shell: ShellCommand,
    pub max_terminals: usize,
    pub idle_timeout_secs: u64,
    pub quota_bytes: u64,
    pub max_save_bytes: usize,
    pub outbound_queue: usize,
    /// Largest client frame. Never below what a maximal escaped save needs.
    pub max_frame_bytes: Option<usize>,
    pub rate_limits: RateLimitOverrides,
}

/// Overrides of the per-operation budgets. Kinds left out keep their default.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitOverrides {
    pub save_file: Option<BucketConfig>,
    pub create_file: Option<BucketConfig>,
    pub rename_file: Option<BucketConfig>,
    pub delete_file: Option<BucketConfig>,
    pub create_folder: Option<BucketConfig>,
    pub delete_folder: Option<BucketConfig>,
}

impl RateLimitOverrides {
    pub fn iter(&self) -> impl Iterator<Item = (OperationKind, BucketConfig)> + '_ {
        OperationKind::ALL
            .into_iter()
            .filter_map(|kind| self.get(kind).map(|bucket| (kind, bucket)))
    }

    fn get(&self, kind: OperationKind) -> Option<BucketConfig> {
        match kind {
            OperationKind::SaveFile => self.save_file,
            OperationKind::CreateFile => self.create_file,
            OperationKind::RenameFile => self.rename_file,
            OperationKind::DeleteFile => self.delete_file,
            OperationKind::CreateFolder => self.create_folder,
            OperationKind::DeleteFolder => self.delete_folder,
        }
    }

    /// Default budgets with these overrides applied.
    pub fn merged(&self) -> HashMap<OperationKind, BucketConfig> {
        let mut limits = default_limits();
        limits.extend(self.iter());
        limits
    }
}

impl ServerConfig {
    /// Read `path`, or the default config file when `path` is `None`. A missing
    /// default file yields the built-in defaults; a missing explicit one is an error.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (config_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (paths::config_path(), false),
        };
        let mut config = if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path)
                .with_context(|| format!("failed to read {}", config_path.display()))?;
            Self::parse(&contents)
                .with_context(|| format!("invalid config {}", config_path.display()))?
        } else if explicit {
            bail!("config file not found: {}", config_path.display());
        } else {
            Self::default()
        };
        if config.ai_token.is_none() {
            config.ai_token = std::env::var(AI_TOKEN_ENV).ok().filter(|t| !t.is_empty());
        }
        Ok(config)
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_save_bytes == 0 || self.outbound_queue == 0 {
            bail!("max_save_bytes and outbound_queue must be > 0");
        }
        if self.max_terminals == 0 {
            bail!("max_terminals must be > 0");
        }
        if self.shell.program.is_empty() {
            bail!("shell.program must not be empty");
        }
        for (kind, bucket) in self.rate_limits.iter() {
            if bucket.points == 0 || bucket.window_ms == 0 {
                bail!("rate limit for {kind} needs points and window_ms > 0");
            }
        }
        Ok(())
    }

    /// Frame limit for client websockets. A `saveFile` up to `max_save_bytes`
    /// always fits, and larger bodies still parse so they get a rejection.
    pub fn frame_limit(&self) -> usize {
        let floor = frame_limit_for(self.max_save_bytes);
        self.max_frame_bytes.map_or(floor, |configured| configured.max(floor))
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_terminals: self.max_terminals,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_save_bytes: self.max_save_bytes,
            workspace: WorkspaceOptions {
                quota_bytes: self.quota_bytes,
                projection_root: self.projection.then(|| self.workspace_root.clone()),
            },
            shell: self.shell.clone(),
            rate_limits: self.rate_limits.merged(),
            outbound_queue: self.outbound_queue,
            ..CoordinatorConfig::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 4000)),
            allow_origins: vec!["http://localhost:3000".to_string()],
            storage_url: "http://127.0.0.1:8788".to_string(),
            database_url: "http://127.0.0.1:8787".to_string(),
            ai_url: None,
            ai_token: None,
            workspace_root: default_workspace_root(),
            projection: true,
            shell: ShellCommand::default(),
            max_terminals: DEFAULT_MAX_TERMINALS,
            idle_timeout_secs: 15,
            quota_bytes: DEFAULT_QUOTA_BYTES,
            max_save_bytes: DEFAULT_MAX_SAVE_BYTES,
            outbound_queue: 1024,
            max_frame_bytes: None,
            rate_limits: RateLimitOverrides::default(),
        }
    }
}

fn default_workspace_root() -> PathBuf {
    paths::dirs_path().join("workspaces")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = ServerConfig::parse("").unwrap();
        assert_eq!(config.listen.port(), 4000);
        assert_eq!(config.max_terminals, 4);
        assert!(config.projection);
        assert!(config.ai_url.is_none());
    }

    #[test]
    fn rate_limit_overrides_merge_with_defaults() {
        let config = ServerConfig::parse(
            r#"
            idle_timeout_secs = 30

            [rate_limits.save_file]
            points = 10
            window_ms = 500
            "#,
        )
        .unwrap();
        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.idle_timeout, Duration::from_secs(30));
        assert_eq!(
            coordinator.rate_limits[&OperationKind::SaveFile],
            BucketConfig::new(10, 500)
        );
        assert_eq!(
            coordinator.rate_limits[&OperationKind::DeleteFolder],
            BucketConfig::new(1, 2_000)
        );
    }

    #[test]
    fn projection_off_disables_mirror() {
        let config = ServerConfig::parse("projection = false").unwrap();
        assert!(config.coordinator_config().workspace.projection_root.is_none());
    }

    #[test]
    fn shell_section_parses() {
        let config = ServerConfig::parse(
            r#"
            [shell]
            program = "sh"
            args = ["-l"]
            "#,
        )
        .unwrap();
        assert_eq!(config.shell.program, "sh");
        assert_eq!(config.shell.args, vec!["-l".to_string()]);
    }

    #[test]
    fn frame_limit_covers_escaped_saves() {
        let config = ServerConfig::parse("max_save_bytes = 1024").unwrap();
        assert_eq!(config.frame_limit(), 6 * 1024 + 64 * 1024);

        let small = ServerConfig::parse("max_save_bytes = 1048576\nmax_frame_bytes = 4096").unwrap();
        assert_eq!(small.frame_limit(), frame_limit_for(1024 * 1024));

        let large = ServerConfig::parse("max_frame_bytes = 67108864").unwrap();
        assert_eq!(large.frame_limit(), 64 * 1024 * 1024);
        assert!(ServerConfig::default().frame_limit() > 6 * ServerConfig::default().max_save_bytes);
    }

    #[test]
    fn unknown_operation_is_rejected() {
        assert!(ServerConfig::parse("[rate_limits.format_disk]\npoints = 1\nwindow_ms = 1").is_err());
    }

    #[test]
    fn zero_budget_is_rejected() {
        let err = ServerConfig::parse(
            r#"
            [rate_limits.create_file]
            points = 0
            window_ms = 1000
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("file creation"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(ServerConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn explicit_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "listen = \"127.0.0.1:9000\"\nmax_terminals = 2\n").unwrap();
        let config = ServerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.max_terminals, 2);
    }
}
