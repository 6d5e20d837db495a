//! Workload spec input contract.
//!
//! The runner consumes exactly one line of JSON on its standard input:
//! `{"type":"config","config":{...}}`. Anything else on the first line is a
//! config error. Subsequent lines belong to the stdin forwarder.
//!
//! Image references, registries, credentials, and environment variables are
//! validated here before the engine sees them; the checks exist to stop
//! shell-metacharacter injection, loader-path hijacking, and oversized
//! inputs at the trust boundary.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::constants::{
    MAX_ENV_VALUE_LEN, MAX_IMAGE_REF_LEN, MAX_PASSWORD_LEN, MAX_REGISTRY_LEN, MAX_USERNAME_LEN,
};
use crate::error::{Error, Result};
use crate::policy::NetworkConfig;

/// Canonical name of the public registry; an empty registry means the same.
pub const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Environment variables that can hijack the loader or interpreter path.
const DANGEROUS_ENV_VARS: [&str; 6] = [
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "PYTHONPATH",
    "PERL5LIB",
    "RUBYLIB",
    "NODE_PATH",
];

// =============================================================================
// Input Types
// =============================================================================

/// The full workload spec handed to the runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadInput {
    pub image_spec: Option<ImageSpec>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub bridge_name: Option<String>,
    #[serde(default)]
    pub subnet: Option<String>,
    #[serde(default)]
    pub config: WorkloadConfig,
}

/// Image reference plus optional registry and credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSpec {
    #[serde(default)]
    pub registry: String,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<ImageAuth>,
}

/// Registry credentials. Only basic auth is supported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageAuth {
    #[serde(rename = "type")]
    pub auth_type: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// The per-workload configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkloadConfig {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub container: ContainerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Container hardening and resource settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub memory_limit: Option<String>,
    #[serde(default)]
    pub cpu_limit: Option<String>,
    #[serde(default)]
    pub readonly_rootfs: bool,
    #[serde(default)]
    pub tmpfs: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// Execution and stdio attachment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    #[serde(default = "default_true")]
    pub auto_cleanup: bool,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default = "default_true")]
    pub attach_stdin: bool,
    #[serde(default = "default_true")]
    pub attach_stdout: bool,
    #[serde(default = "default_true")]
    pub attach_stderr: bool,
    #[serde(default)]
    pub tty: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: None,
            auto_cleanup: true,
            interactive: false,
            attach_stdin: true,
            attach_stdout: true,
            attach_stderr: true,
            tty: false,
        }
    }
}

/// Runner diagnostics settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub log_network_attempts: bool,
    #[serde(default)]
    pub log_file: Option<String>,
    #[serde(default = "default_level")]
    pub log_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_network_attempts: false,
            log_file: None,
            log_level: default_level(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

impl WorkloadInput {
    /// Container name for this run; always freshly generated so repeated
    /// runs of the same spec never collide in the engine's namespace.
    #[must_use]
    pub fn generate_container_name(&self) -> String {
        format!("hpod-{}", &uuid::Uuid::new_v4().simple().to_string()[..8])
    }

    /// Full image reference for the engine.
    #[must_use]
    pub fn full_image_reference(&self) -> String {
        match &self.image_spec {
            None => "library/alpine:latest".to_string(),
            Some(spec) if spec.registry.is_empty() || spec.registry == DEFAULT_REGISTRY => {
                spec.image.clone()
            }
            Some(spec) => format!("{}/{}", spec.registry, spec.image),
        }
    }

    /// Image name safe for logging (never includes credentials).
    #[must_use]
    pub fn image_display_name(&self) -> String {
        match &self.image_spec {
            None => "unknown".to_string(),
            Some(spec) if spec.registry.is_empty() || spec.registry == DEFAULT_REGISTRY => {
                spec.image.clone()
            }
            Some(spec) => format!("{}/{}", spec.registry, spec.image),
        }
    }
}

/// Reads and validates the first-line config message.
pub async fn read_input<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<WorkloadInput> {
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .await
        .map_err(|e| Error::Protocol(format!("failed to read from stdin: {e}")))?;

    if read == 0 || line.trim().is_empty() {
        return Err(Error::Protocol("no input provided on stdin".into()));
    }

    #[derive(Deserialize)]
    struct FirstMessage {
        #[serde(rename = "type")]
        kind: String,
        config: Option<WorkloadInput>,
    }

    let msg: FirstMessage = serde_json::from_str(line.trim())
        .map_err(|e| Error::Protocol(format!("failed to parse input JSON: {e}")))?;

    if msg.kind != "config" {
        return Err(Error::Protocol(format!(
            "expected config message, got: {}",
            msg.kind
        )));
    }

    msg.config
        .ok_or_else(|| Error::Protocol("config field is missing".into()))
}

// =============================================================================
// Validation
// =============================================================================

/// Validates an image reference against injection and traversal patterns.
pub fn validate_image_reference(image: &str) -> Result<()> {
    if image.trim().is_empty() {
        return Err(Error::validation("image", "image name cannot be empty"));
    }

    if image.len() > MAX_IMAGE_REF_LEN {
        return Err(Error::validation(
            "image",
            format!("image name too long: {} bytes (max: {MAX_IMAGE_REF_LEN})", image.len()),
        ));
    }

    if image.contains("..") || image.contains("//") {
        return Err(Error::validation(
            "image",
            format!("suspicious pattern in image name: {image}"),
        ));
    }

    for c in [';', '|', '&', '$', '`', '\n', '\r', '\\'] {
        if image.contains(c) {
            return Err(Error::validation(
                "image",
                format!("dangerous character '{c}' in image name"),
            ));
        }
    }

    if image.chars().any(|c| (c as u32) < 32) {
        return Err(Error::validation("image", "image name contains control characters"));
    }

    Ok(())
}

/// Validates the whole image spec: reference, registry, and credentials.
pub fn validate_image_spec(spec: &ImageSpec) -> Result<()> {
    validate_image_reference(&spec.image)?;

    if !spec.registry.is_empty() {
        validate_registry(&spec.registry)?;
    }

    if let Some(auth) = &spec.auth {
        validate_auth(auth)?;
    }

    Ok(())
}

fn validate_registry(registry: &str) -> Result<()> {
    if registry.len() > MAX_REGISTRY_LEN {
        return Err(Error::validation("registry", "registry name too long"));
    }

    for c in [';', '|', '&', '$', '`', '\n', '\r', '\\', ' '] {
        if registry.contains(c) {
            return Err(Error::validation(
                "registry",
                format!("registry contains invalid character: '{c}'"),
            ));
        }
    }

    if registry.contains("..") {
        return Err(Error::validation("registry", "invalid registry hostname"));
    }

    Ok(())
}

fn validate_auth(auth: &ImageAuth) -> Result<()> {
    if auth.auth_type != "basic" {
        return Err(Error::validation(
            "auth",
            format!("unsupported auth type: {}", auth.auth_type),
        ));
    }

    if auth.username.trim().is_empty() {
        return Err(Error::validation("auth", "username cannot be empty"));
    }
    if auth.username.len() > MAX_USERNAME_LEN {
        return Err(Error::validation("auth", "username too long"));
    }
    if auth.password.len() > MAX_PASSWORD_LEN {
        return Err(Error::validation("auth", "password too long"));
    }
    if auth.username.contains('\0') || auth.password.contains('\0') {
        return Err(Error::validation("auth", "credentials contain null bytes"));
    }

    Ok(())
}

/// Validates workload environment variables.
///
/// Loader-path variables are rejected outright; names must be identifiers,
/// values bounded and NUL-free.
pub fn validate_environment(env: &HashMap<String, String>) -> Result<()> {
    for (key, value) in env {
        if DANGEROUS_ENV_VARS.contains(&key.as_str()) || key.starts_with("DYLD_") {
            return Err(Error::validation(
                "environment",
                format!("environment variable '{key}' is not allowed for security reasons"),
            ));
        }

        let mut chars = key.chars();
        let head_ok = chars
            .next()
            .map(|c| c.is_ascii_alphabetic() || c == '_')
            .unwrap_or(false);
        if !head_ok || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::validation(
                "environment",
                format!("invalid environment variable name: {key}"),
            ));
        }

        if value.len() > MAX_ENV_VALUE_LEN {
            return Err(Error::validation(
                "environment",
                format!(
                    "environment variable '{key}' value too large: {} bytes (max: {MAX_ENV_VALUE_LEN})",
                    value.len()
                ),
            ));
        }

        if value.contains('\0') {
            return Err(Error::validation(
                "environment",
                "environment variable contains null byte",
            ));
        }
    }

    Ok(())
}

// =============================================================================
// Resource Limits
// =============================================================================

/// Parses a memory limit like `512m` / `2g` into bytes, bounds-checked.
pub fn parse_memory_limit(limit: &str) -> Result<i64> {
    let limit = limit.trim().to_lowercase();

    let (digits, multiplier) = match limit.as_bytes().last() {
        Some(b'k') => (&limit[..limit.len() - 1], 1024i64),
        Some(b'm') => (&limit[..limit.len() - 1], 1024 * 1024),
        Some(b'g') => (&limit[..limit.len() - 1], 1024 * 1024 * 1024),
        _ => (limit.as_str(), 1),
    };

    let value: i64 = digits
        .parse()
        .map_err(|_| Error::validation("memory_limit", format!("invalid memory limit: {limit}")))?;
    let bytes = value.saturating_mul(multiplier);

    if bytes < crate::constants::MIN_MEMORY_BYTES {
        return Err(Error::ResourceExhausted(format!(
            "memory limit too low: {bytes} bytes (minimum: 4MB)"
        )));
    }
    if bytes > crate::constants::MAX_MEMORY_BYTES {
        return Err(Error::ResourceExhausted(format!(
            "memory limit too high: {bytes} bytes (maximum: 128GB)"
        )));
    }

    Ok(bytes)
}

/// Parses a CPU limit in cores into nanocores, bounds-checked.
pub fn parse_cpu_limit(limit: &str) -> Result<i64> {
    let value: f64 = limit
        .trim()
        .parse()
        .map_err(|_| Error::validation("cpu_limit", format!("invalid CPU limit: {limit}")))?;

    if value < crate::constants::MIN_CPU_CORES {
        return Err(Error::ResourceExhausted(format!(
            "CPU limit too low: {value:.2} (minimum: {})",
            crate::constants::MIN_CPU_CORES
        )));
    }
    if value > crate::constants::MAX_CPU_CORES {
        return Err(Error::ResourceExhausted(format!(
            "CPU limit too high: {value:.2} (maximum: {})",
            crate::constants::MAX_CPU_CORES
        )));
    }

    Ok((value * 1e9) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn first_line_must_be_config() {
        let input = br#"{"type":"config","config":{"image_spec":{"image":"alpine:latest"},"config":{}}}
"#;
        let mut reader = BufReader::new(&input[..]);
        let parsed = read_input(&mut reader).await.unwrap();
        assert_eq!(parsed.full_image_reference(), "alpine:latest");
    }

    #[tokio::test]
    async fn stdin_envelope_as_first_line_is_rejected() {
        let input = br#"{"type":"stdin","data":"aGVsbG8="}
"#;
        let mut reader = BufReader::new(&input[..]);
        let err = read_input(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("expected config message"));
    }

    #[tokio::test]
    async fn empty_stdin_is_rejected() {
        let mut reader = BufReader::new(&b""[..]);
        assert!(read_input(&mut reader).await.is_err());
    }

    #[test]
    fn registry_prefix_only_for_private_registries() {
        let input = WorkloadInput {
            image_spec: Some(ImageSpec {
                registry: String::new(),
                image: "alpine:latest".to_string(),
                auth: None,
            }),
            command: vec![],
            args: vec![],
            container_name: None,
            bridge_name: None,
            subnet: None,
            config: WorkloadConfig::default(),
        };
        assert_eq!(input.full_image_reference(), "alpine:latest");

        let mut private = input.clone();
        private.image_spec.as_mut().unwrap().registry = "ghcr.io".to_string();
        assert_eq!(private.full_image_reference(), "ghcr.io/alpine:latest");
    }

    #[test]
    fn image_reference_rejects_injection() {
        assert!(validate_image_reference("alpine:latest").is_ok());
        assert!(validate_image_reference("").is_err());
        assert!(validate_image_reference("alpine;rm -rf /").is_err());
        assert!(validate_image_reference("alpine$(whoami)").is_err());
        assert!(validate_image_reference("../../etc/passwd").is_err());
        assert!(validate_image_reference("reg//image").is_err());
        assert!(validate_image_reference(&"a".repeat(513)).is_err());
    }

    #[test]
    fn auth_must_be_basic_and_bounded() {
        let ok = ImageAuth {
            auth_type: "basic".to_string(),
            username: "user".to_string(),
            password: "secret".to_string(),
        };
        assert!(validate_auth(&ok).is_ok());

        let mut bad = ok.clone();
        bad.auth_type = "bearer".to_string();
        assert!(validate_auth(&bad).is_err());

        let mut bad = ok.clone();
        bad.username = String::new();
        assert!(validate_auth(&bad).is_err());

        let mut bad = ok.clone();
        bad.password = "p\0wned".to_string();
        assert!(validate_auth(&bad).is_err());
    }

    #[test]
    fn environment_rejects_loader_paths() {
        let mut env = HashMap::new();
        env.insert("PATH_EXTRA".to_string(), "/opt/bin".to_string());
        assert!(validate_environment(&env).is_ok());

        for var in ["LD_PRELOAD", "PYTHONPATH", "DYLD_INSERT_LIBRARIES", "NODE_PATH"] {
            let mut env = HashMap::new();
            env.insert(var.to_string(), "x".to_string());
            assert!(validate_environment(&env).is_err(), "{var} should be rejected");
        }
    }

    #[test]
    fn environment_name_and_value_rules() {
        let mut env = HashMap::new();
        env.insert("9LIVES".to_string(), "x".to_string());
        assert!(validate_environment(&env).is_err());

        let mut env = HashMap::new();
        env.insert("SPACED NAME".to_string(), "x".to_string());
        assert!(validate_environment(&env).is_err());

        let mut env = HashMap::new();
        env.insert("BIG".to_string(), "v".repeat(MAX_ENV_VALUE_LEN + 1));
        assert!(validate_environment(&env).is_err());

        let mut env = HashMap::new();
        env.insert("NUL".to_string(), "a\0b".to_string());
        assert!(validate_environment(&env).is_err());
    }

    #[test]
    fn memory_limits() {
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("8192k").unwrap(), 8192 * 1024);
        assert!(parse_memory_limit("1m").is_err()); // below 4 MiB
        assert!(parse_memory_limit("200g").is_err()); // above 128 GiB
        assert!(parse_memory_limit("lots").is_err());
    }

    #[test]
    fn cpu_limits() {
        assert_eq!(parse_cpu_limit("1").unwrap(), 1_000_000_000);
        assert_eq!(parse_cpu_limit("0.5").unwrap(), 500_000_000);
        assert!(parse_cpu_limit("0.001").is_err());
        assert!(parse_cpu_limit("512").is_err());
        assert!(parse_cpu_limit("fast").is_err());
    }
}
