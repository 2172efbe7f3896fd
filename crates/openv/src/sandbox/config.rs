//! Container launch configuration and input validation.

use std::collections::HashMap;

use super::{SandboxError, SandboxResult};

/// Configuration for creating a sandbox container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    /// Container name.
    pub name: Option<String>,
    /// Docker/OCI image to use.
    pub image: String,
    /// Command to run.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Bind mounts (host_path -> container_path), always read-write.
    pub volumes: Vec<(String, String)>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Execution identity (`uid:gid`).
    pub user: Option<String>,
    /// Hard memory ceiling in bytes.
    pub memory_limit: Option<i64>,
    /// CPU quota as a fraction of one core (0.5 = half a core).
    pub cpu_quota: Option<f64>,
    /// Labels for the container.
    pub labels: HashMap<String, String>,
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate all fields before the config reaches the engine.
    pub fn validate(&self) -> SandboxResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for (host_path, container_path) in &self.volumes {
            validate_volume_path(host_path, "host")?;
            validate_volume_path(container_path, "container")?;
            validate_container_path(container_path)?;
        }

        if let Some(ref workdir) = self.workdir {
            validate_container_path(workdir)?;
        }

        if let Some(ref user) = self.user {
            validate_user(user)?;
        }

        if let Some(limit) = self.memory_limit {
            if limit < 6 * 1024 * 1024 {
                return Err(SandboxError::InvalidInput(format!(
                    "memory limit must be at least 6MiB, got {limit} bytes"
                )));
            }
        }

        if let Some(quota) = self.cpu_quota {
            if !(quota.is_finite() && quota > 0.0) {
                return Err(SandboxError::InvalidInput(format!(
                    "cpu quota must be a positive number, got {quota}"
                )));
            }
        }

        Ok(())
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Merge variables over the ones already set.
    pub fn envs(mut self, envs: &HashMap<String, String>) -> Self {
        self.env
            .extend(envs.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn volume(
        mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
    ) -> Self {
        self.volumes.push((host_path.into(), container_path.into()));
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn memory_limit(mut self, bytes: i64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    pub fn cpu_quota(mut self, cores: f64) -> Self {
        self.cpu_quota = Some(cores);
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Environment in the engine's `KEY=value` form, sorted for stable output.
    pub fn env_list(&self) -> Vec<String> {
        let mut list: Vec<String> = self.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        list.sort();
        list
    }

    /// Bind specs in the engine's `host:container:rw` form.
    pub fn binds(&self) -> Vec<String> {
        self.volumes
            .iter()
            .map(|(host, container)| format!("{host}:{container}:rw"))
            .collect()
    }
}

// ============================================================================
// Input Validation Functions
// ============================================================================

/// Validate a Docker/OCI image name.
///
/// Image names follow the pattern: `[registry/][namespace/]name[:tag][@digest]`
pub fn validate_image_name(image: &str) -> SandboxResult<()> {
    if image.is_empty() {
        return Err(SandboxError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(SandboxError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars = |c: char| {
        c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@')
    };
    if !image.chars().all(valid_chars) {
        return Err(SandboxError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    if image.contains("..") {
        return Err(SandboxError::InvalidInput(
            "image name cannot contain '..'".to_string(),
        ));
    }

    Ok(())
}

/// Container names are alphanumeric with hyphens and underscores and must
/// start with an alphanumeric character or underscore.
fn validate_container_name(name: &str) -> SandboxResult<()> {
    let Some(first_char) = name.chars().next() else {
        return Err(SandboxError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(SandboxError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(SandboxError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(SandboxError::InvalidInput(format!(
            "container name '{}' contains invalid characters; only alphanumeric, '-', '_' are allowed",
            name
        )));
    }

    Ok(())
}

/// POSIX environment variable names.
fn validate_env_var_key(key: &str) -> SandboxResult<()> {
    let Some(first_char) = key.chars().next() else {
        return Err(SandboxError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(SandboxError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(SandboxError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

fn validate_volume_path(path: &str, side: &str) -> SandboxResult<()> {
    if path.is_empty() {
        return Err(SandboxError::InvalidInput(format!(
            "{} volume path cannot be empty",
            side
        )));
    }

    if path.len() > 4096 {
        return Err(SandboxError::InvalidInput(format!(
            "{} volume path exceeds maximum length of 4096 characters",
            side
        )));
    }

    // ':' would split the bind spec.
    let dangerous_chars = ['\0', ':', '$', '`', ';', '|', '&', '\n', '\r'];
    if let Some(c) = dangerous_chars.iter().find(|c| path.contains(**c)) {
        return Err(SandboxError::InvalidInput(format!(
            "{} volume path contains invalid character {:?}",
            side, c
        )));
    }

    Ok(())
}

fn validate_container_path(path: &str) -> SandboxResult<()> {
    if !path.starts_with('/') {
        return Err(SandboxError::InvalidInput(format!(
            "container path '{}' must be absolute",
            path
        )));
    }

    if path.contains('\0') {
        return Err(SandboxError::InvalidInput(
            "container path cannot contain null bytes".to_string(),
        ));
    }

    Ok(())
}

/// Execution identity as `uid` or `uid:gid`, never root.
fn validate_user(user: &str) -> SandboxResult<()> {
    let mut parts = user.splitn(2, ':');
    let uid = parts.next().unwrap_or_default();
    let gid = parts.next();

    let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    if !numeric(uid) || gid.is_some_and(|g| !numeric(g)) {
        return Err(SandboxError::InvalidInput(format!(
            "user '{}' must be numeric uid or uid:gid",
            user
        )));
    }

    if uid.parse::<u32>().ok() == Some(0) {
        return Err(SandboxError::InvalidInput(
            "sandboxes cannot run as root".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod validation_tests {
    use super::*;

    fn valid_config() -> ContainerConfig {
        ContainerConfig::new("openv-env:latest")
            .name("openv_demo_0a1b2c3d")
            .command(vec!["tail".into(), "-f".into(), "/dev/null".into()])
            .env("PROJECT_NAME", "demo")
            .volume("/tmp/openv_projects/1/2", "/workspace")
            .workdir("/workspace")
            .user("1000:1000")
            .memory_limit(512 * 1024 * 1024)
            .cpu_quota(0.5)
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validate_image_name() {
        assert!(validate_image_name("ubuntu").is_ok());
        assert!(validate_image_name("myregistry.io/myimage:v1.0").is_ok());
        assert!(validate_image_name("gcr.io/project/image@sha256:abc123").is_ok());

        assert!(validate_image_name("").is_err());
        assert!(validate_image_name("image with spaces").is_err());
        assert!(validate_image_name("image;rm -rf /").is_err());
        assert!(validate_image_name("../../../etc/passwd").is_err());
    }

    #[test]
    fn test_validate_container_name() {
        assert!(validate_container_name("openv_my_project_deadbeef").is_ok());
        assert!(validate_container_name("_private").is_ok());

        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("-starts-with-dash").is_err());
        assert!(validate_container_name("contains spaces").is_err());
        assert!(validate_container_name("$(whoami)").is_err());
    }

    #[test]
    fn test_validate_env_var_key() {
        assert!(validate_env_var_key("PROJECT_NAME").is_ok());
        assert!(validate_env_var_key("_PRIVATE").is_ok());

        assert!(validate_env_var_key("").is_err());
        assert!(validate_env_var_key("123VAR").is_err());
        assert!(validate_env_var_key("MY-VAR").is_err());
    }

    #[test]
    fn test_validate_volume_paths() {
        let cfg = valid_config().volume("/tmp/a:b", "/workspace");
        assert!(cfg.validate().is_err());

        let cfg = valid_config().volume("/tmp/a", "relative/path");
        assert!(cfg.validate().is_err());

        let cfg = valid_config().volume("/tmp/$(id)", "/data");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_user() {
        assert!(validate_user("1000").is_ok());
        assert!(validate_user("1000:1000").is_ok());

        assert!(validate_user("0").is_err());
        assert!(validate_user("0:0").is_err());
        assert!(validate_user("root").is_err());
        assert!(validate_user("1000:").is_err());
    }

    #[test]
    fn test_validate_limits() {
        assert!(valid_config().memory_limit(1024).validate().is_err());
        assert!(valid_config().cpu_quota(0.0).validate().is_err());
        assert!(valid_config().cpu_quota(f64::NAN).validate().is_err());
        assert!(valid_config().cpu_quota(1.5).validate().is_ok());
    }

    #[test]
    fn test_env_list_and_binds() {
        let cfg = ContainerConfig::new("img")
            .env("B", "2")
            .env("A", "1")
            .volume("/host", "/workspace");
        assert_eq!(cfg.env_list(), vec!["A=1".to_string(), "B=2".to_string()]);
        assert_eq!(cfg.binds(), vec!["/host:/workspace:rw".to_string()]);
    }

    #[test]
    fn test_envs_merge_overrides() {
        let mut extra = HashMap::new();
        extra.insert("PROJECT_NAME".to_string(), "override".to_string());
        let cfg = ContainerConfig::new("img")
            .env("PROJECT_NAME", "demo")
            .envs(&extra);
        assert_eq!(cfg.env.get("PROJECT_NAME").map(String::as_str), Some("override"));
    }
}
