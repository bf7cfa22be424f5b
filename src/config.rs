//! # Configuration Management
//!
//! Loads and manages application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_AUDIO_FRAGMENT_TIMEOUT_SECS, ...)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! The audio section carries the tuning knobs the session pipeline consumes:
//! fragment queue capacity, the short wait for streamed fragments and the
//! long wait for whole-file submissions.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub speech: SpeechConfig,
    pub models: ModelsConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Audio pipeline configuration.
///
/// ## Fields:
/// - `fragment_queue_capacity`: how many live fragments a session keeps before
///   the oldest one is evicted and its backing file purged
/// - `fragment_timeout_secs`: bounded wait for a streamed-fragment
///   merge+transcribe round trip
/// - `file_timeout_secs`: bounded wait for a whole-file submission (these run
///   through format conversion first and can be much larger)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub fragment_queue_capacity: usize,
    pub fragment_timeout_secs: u64,
    pub file_timeout_secs: u64,
}

/// Speech synthesis configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechConfig {
    /// Binary used for synthesis (espeak or espeak-ng)
    pub binary: String,
    /// Bounded wait for one sentence of synthesized audio
    pub synthesis_timeout_secs: u64,
}

/// External engine configuration.
///
/// The transcription and generation engines are separate processes; only
/// their binaries and model identifiers are configured here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Whisper CLI binary used for transcription
    pub whisper_binary: String,
    /// Whisper model size ("tiny", "base", "small", "medium", "large")
    pub whisper_model: String,
    /// llama.cpp-style CLI binary used for text generation
    pub llm_binary: String,
    /// Path to the GGUF model file loaded by the generation engine
    pub llm_model_path: String,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Maximum number of concurrent client sessions to report against
    pub max_concurrent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioConfig {
                fragment_queue_capacity: 10, // bounded FIFO of live fragments
                fragment_timeout_secs: 8,    // streamed fragments stay interactive
                file_timeout_secs: 120,      // whole files can take much longer
            },
            speech: SpeechConfig {
                binary: "espeak-ng".to_string(),
                synthesis_timeout_secs: 10,
            },
            models: ModelsConfig {
                whisper_binary: "whisper".to_string(),
                whisper_model: "base".to_string(),
                llm_binary: "llama-cli".to_string(),
                llm_model_path: "models/zephyr-7b-beta.Q6_K.gguf".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_HOST=0.0.0.0`: Override server host
    /// - `APP_MODELS_WHISPER_MODEL=large`: Override whisper model
    /// - `HOST` / `PORT`: Special cases for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject these without the APP_ prefix
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// Catching configuration errors early prevents runtime failures and
    /// provides clear error messages about what's wrong.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.fragment_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Fragment queue capacity must be greater than 0"));
        }

        if self.audio.fragment_timeout_secs == 0 || self.audio.file_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Audio timeouts must be greater than 0"));
        }

        if self.audio.file_timeout_secs < self.audio.fragment_timeout_secs {
            return Err(anyhow::anyhow!(
                "Whole-file timeout must be at least as long as the fragment timeout"
            ));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }

    /// Bounded wait applied to streamed-fragment transcriptions.
    pub fn fragment_timeout(&self) -> Duration {
        Duration::from_secs(self.audio.fragment_timeout_secs)
    }

    /// Bounded wait applied to whole-file transcriptions.
    pub fn file_timeout(&self) -> Duration {
        Duration::from_secs(self.audio.file_timeout_secs)
    }

    /// Bounded wait applied to one sentence of speech synthesis.
    pub fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.speech.synthesis_timeout_secs)
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// Only the fields present in the JSON are touched; the result is
    /// re-validated before it replaces anything.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(capacity) = audio.get("fragment_queue_capacity").and_then(|v| v.as_u64()) {
                self.audio.fragment_queue_capacity = capacity as usize;
            }
            if let Some(timeout) = audio.get("fragment_timeout_secs").and_then(|v| v.as_u64()) {
                self.audio.fragment_timeout_secs = timeout;
            }
            if let Some(timeout) = audio.get("file_timeout_secs").and_then(|v| v.as_u64()) {
                self.audio.file_timeout_secs = timeout;
            }
        }

        if let Some(models) = partial_config.get("models") {
            if let Some(whisper) = models.get("whisper_model").and_then(|v| v.as_str()) {
                self.models.whisper_model = whisper.to_string();
            }
            if let Some(path) = models.get("llm_model_path").and_then(|v| v.as_str()) {
                self.models.llm_model_path = path.to_string();
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The default configuration is valid and carries the documented knobs.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.audio.fragment_queue_capacity, 10);
        assert_eq!(config.audio.fragment_timeout_secs, 8);
        assert_eq!(config.audio.file_timeout_secs, 120);
        assert_eq!(config.speech.synthesis_timeout_secs, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.audio.fragment_queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.file_timeout_secs = 1; // shorter than fragment timeout
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"audio": {"fragment_timeout_secs": 12}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.audio.fragment_timeout_secs, 12);
        // Other fields remain unchanged
        assert_eq!(config.audio.fragment_queue_capacity, 10);
    }

    #[test]
    fn test_timeout_helpers() {
        let config = AppConfig::default();
        assert_eq!(config.fragment_timeout(), Duration::from_secs(8));
        assert_eq!(config.file_timeout(), Duration::from_secs(120));
    }
}
