//! Runtime configuration for the director and its adapters.
//!
//! Everything is plain data resolved once at startup; components receive
//! the pieces they need from the root context instead of reading the
//! environment themselves.

use std::path::PathBuf;

use crate::defaults;

/// Canonical system configuration used by the launcher and director.
#[derive(Debug, Clone)]
pub struct AnzuConfig {
    /// Database URL (sqlite:... | postgres://...)
    pub db_url: String,
    /// Control API bind address (ZMQ REP)
    pub control_addr: String,
    /// Image-generation backend base URL
    pub image_backend_url: String,
    /// LLM/dialogue service base URL
    pub llm_url: String,
    /// Local inference (vision/embedding) base URL
    pub inference_url: String,
    /// LoRA trainer endpoint; None disables the training collaborator
    pub trainer_url: Option<String>,
    /// Root under which per-character images and generated media live
    pub media_root: PathBuf,
    /// Media library root episodes are published into
    pub library_root: PathBuf,
    /// Directory the trainer writes finished LoRA files into
    pub lora_dir: PathBuf,
    /// External assembler command (crossfade/concat); None disables assembly
    pub assembler_command: Option<String>,
    /// Media-library API key; publishing is a no-op without it
    pub jellyfin_api_key: Option<String>,
    /// HMAC secret for locally-verified bearer tokens
    pub jwt_secret: Option<String>,
    /// CIDR block whose requests bypass auth (e.g. "192.168.1.0/24")
    pub trusted_subnet: Option<String>,
}

impl Default for AnzuConfig {
    fn default() -> Self {
        AnzuConfig {
            db_url: defaults::DEFAULT_DB_URL.to_string(),
            control_addr: defaults::DEFAULT_CONTROL_ADDR.to_string(),
            image_backend_url: defaults::DEFAULT_IMAGE_BACKEND_URL.to_string(),
            llm_url: defaults::DEFAULT_LLM_URL.to_string(),
            inference_url: defaults::DEFAULT_INFERENCE_URL.to_string(),
            trainer_url: None,
            media_root: anzu_home().join("media"),
            library_root: anzu_home().join("library"),
            lora_dir: anzu_home().join("loras"),
            assembler_command: None,
            jellyfin_api_key: None,
            jwt_secret: None,
            trusted_subnet: None,
        }
    }
}

impl AnzuConfig {
    /// Resolve configuration from the environment on top of defaults.
    pub fn from_env() -> Self {
        let mut config = AnzuConfig::default();
        if let Ok(url) = std::env::var("ANZU_DB_URL") {
            config.db_url = url;
        }
        if let Ok(addr) = std::env::var("ANZU_CONTROL_ADDR") {
            config.control_addr = addr;
        }
        if let Ok(url) = std::env::var("ANZU_IMAGE_BACKEND_URL") {
            config.image_backend_url = url;
        }
        if let Ok(url) = std::env::var("ANZU_LLM_URL") {
            config.llm_url = url;
        }
        if let Ok(url) = std::env::var("ANZU_INFERENCE_URL") {
            config.inference_url = url;
        }
        config.trainer_url = std::env::var("ANZU_TRAINER_URL").ok();
        if let Ok(dir) = std::env::var("ANZU_MEDIA_ROOT") {
            config.media_root = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("ANZU_LIBRARY_ROOT") {
            config.library_root = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("ANZU_LORA_DIR") {
            config.lora_dir = PathBuf::from(dir);
        }
        config.assembler_command = std::env::var("ANZU_ASSEMBLER_CMD").ok();
        config.jellyfin_api_key = std::env::var("JELLYFIN_API_KEY").ok();
        config.jwt_secret = std::env::var("JWT_SECRET_KEY").ok();
        config.trusted_subnet = std::env::var("ANZU_TRUSTED_SUBNET").ok();
        config
    }

    /// Database password, when the URL needs one substituted.
    ///
    /// Acquisition order: a vault-managed secret file (unlocked by
    /// `VAULT_ROOT_TOKEN`), then the `ANIME_DB_PASSWORD` environment
    /// variable. Either suffices; None means the URL is used as-is.
    pub fn db_password(&self) -> Option<String> {
        if std::env::var("VAULT_ROOT_TOKEN").is_ok() {
            let secret_path = anzu_home().join("secrets").join("db_password");
            if let Ok(secret) = std::fs::read_to_string(&secret_path) {
                let secret = secret.trim();
                if !secret.is_empty() {
                    return Some(secret.to_string());
                }
            }
        }
        std::env::var("ANIME_DB_PASSWORD")
            .ok()
            .filter(|s| !s.is_empty())
    }
}

/// Get the Anzu home directory: ~/.anzu
///
/// `ANZU_HOME` overrides (used by tests and containerized deployments).
pub fn anzu_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("ANZU_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".anzu")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_local() {
        let config = AnzuConfig::default();
        assert!(config.db_url.starts_with("sqlite:"));
        assert!(config.control_addr.starts_with("tcp://127.0.0.1"));
        assert!(config.jellyfin_api_key.is_none());
    }
}
