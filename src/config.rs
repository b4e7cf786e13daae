//! Configuração do jobnet carregada a partir de `jobnet.toml`.
//!
//! A struct [`JobNetConfig`] contém todos os limites e orçamentos de espera
//! usados pelos motores de decisão. Valores não presentes no arquivo usam
//! defaults sensíveis. As variáveis `JOBNET_STORE_URL`, `JOBNET_STORE_TOKEN`
//! e `JOBNET_MAX_CYCLES` têm precedência sobre o arquivo.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::JobNetError;
use crate::state_machine::RetryConfig;
use crate::store::DEFAULT_STORE_URL;

/// Configuração de nível superior carregada de `jobnet.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobNetConfig {
    /// URL base do record store HTTP.
    #[serde(default = "default_store_url")]
    pub store_url: String,

    /// Token bearer enviado ao record store.
    #[serde(default)]
    pub store_token: String,

    /// Limite global de ciclos para jobs raiz cíclicos. `None` = sem limite.
    #[serde(default)]
    pub max_cycles: Option<u32>,

    #[serde(default = "default_verification_cap")]
    pub verification_cap: u32,

    #[serde(default = "default_loop_recovery_cap")]
    pub loop_recovery_cap: u32,

    /// Timeouts costumam ser sistêmicos, então o limite é menor.
    #[serde(default = "default_timeout_recovery_cap")]
    pub timeout_recovery_cap: u32,

    /// Quantas vezes consultar os irmãos antes de negar o dispatch ao pai.
    #[serde(default = "default_sibling_poll_attempts")]
    pub sibling_poll_attempts: u32,

    #[serde(default = "default_sibling_poll_delay_ms")]
    pub sibling_poll_delay_ms: u64,

    /// Janela em que um mesmo filho não pode notificar o mesmo pai de novo.
    #[serde(default = "default_dispatch_cooldown_secs")]
    pub dispatch_cooldown_secs: u64,

    /// Máximo de dispatches registrados por pai.
    #[serde(default = "default_cascade_cap")]
    pub cascade_cap: usize,

    #[serde(default = "default_dispatch_max_attempts")]
    pub dispatch_max_attempts: u32,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_dispatch_base_delay_ms")]
    pub dispatch_base_delay_ms: u64,

    /// Tamanho máximo do trecho de saída enviado ao pai.
    #[serde(default = "default_output_excerpt_chars")]
    pub output_excerpt_chars: usize,

    /// Chaves de ambiente repassadas aos dispatches. Vazio = todas.
    #[serde(default)]
    pub inherited_env_keys: Vec<String>,
}

fn default_store_url() -> String {
    DEFAULT_STORE_URL.to_string()
}

fn default_verification_cap() -> u32 {
    3
}

fn default_loop_recovery_cap() -> u32 {
    3
}

fn default_timeout_recovery_cap() -> u32 {
    2
}

fn default_sibling_poll_attempts() -> u32 {
    3
}

fn default_sibling_poll_delay_ms() -> u64 {
    500
}

// 5 minutos.
fn default_dispatch_cooldown_secs() -> u64 {
    300
}

fn default_cascade_cap() -> usize {
    5
}

fn default_dispatch_max_attempts() -> u32 {
    3
}

fn default_dispatch_base_delay_ms() -> u64 {
    2000
}

fn default_output_excerpt_chars() -> usize {
    500
}

impl Default for JobNetConfig {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            store_token: String::new(),
            max_cycles: None,
            verification_cap: default_verification_cap(),
            loop_recovery_cap: default_loop_recovery_cap(),
            timeout_recovery_cap: default_timeout_recovery_cap(),
            sibling_poll_attempts: default_sibling_poll_attempts(),
            sibling_poll_delay_ms: default_sibling_poll_delay_ms(),
            dispatch_cooldown_secs: default_dispatch_cooldown_secs(),
            cascade_cap: default_cascade_cap(),
            dispatch_max_attempts: default_dispatch_max_attempts(),
            dispatch_base_delay_ms: default_dispatch_base_delay_ms(),
            output_excerpt_chars: default_output_excerpt_chars(),
            inherited_env_keys: Vec::new(),
        }
    }
}

impl JobNetConfig {
    /// Carrega a configuração do caminho informado, aplicando as variáveis
    /// de ambiente por cima. Usa valores padrão se o arquivo não existir.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<JobNetConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(url) = std::env::var("JOBNET_STORE_URL")
            && !url.is_empty()
        {
            config.store_url = url;
        }
        if let Ok(token) = std::env::var("JOBNET_STORE_TOKEN")
            && !token.is_empty()
        {
            config.store_token = token;
        }
        if let Ok(raw) = std::env::var("JOBNET_MAX_CYCLES")
            && !raw.is_empty()
        {
            let max = raw
                .parse::<u32>()
                .with_context(|| format!("JOBNET_MAX_CYCLES is not a number: {raw}"))?;
            config.max_cycles = Some(max);
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejeita orçamentos que deixariam um guard sem efeito.
    pub fn validate(&self) -> Result<(), JobNetError> {
        if self.sibling_poll_attempts == 0 {
            return Err(JobNetError::Config(
                "sibling_poll_attempts must be at least 1".into(),
            ));
        }
        if self.cascade_cap == 0 {
            return Err(JobNetError::Config("cascade_cap must be at least 1".into()));
        }
        if self.dispatch_max_attempts == 0 {
            return Err(JobNetError::Config(
                "dispatch_max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn sibling_poll_delay(&self) -> Duration {
        Duration::from_millis(self.sibling_poll_delay_ms)
    }

    pub fn dispatch_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.dispatch_cooldown_secs).unwrap_or(i64::MAX))
    }

    pub fn dispatch_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.dispatch_max_attempts.max(1),
            base_delay_ms: self.dispatch_base_delay_ms,
        }
    }

    /// Sem esperas: usado em testes e na demonstração.
    pub fn without_delays(mut self) -> Self {
        self.sibling_poll_delay_ms = 0;
        self.dispatch_base_delay_ms = 0;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_values() {
        let config = JobNetConfig::default();
        assert_eq!(config.verification_cap, 3);
        assert_eq!(config.loop_recovery_cap, 3);
        assert_eq!(config.timeout_recovery_cap, 2);
        assert_eq!(config.sibling_poll_attempts, 3);
        assert_eq!(config.sibling_poll_delay_ms, 500);
        assert_eq!(config.dispatch_cooldown_secs, 300);
        assert_eq!(config.cascade_cap, 5);
        assert_eq!(config.dispatch_retry().delay_for_attempt(1), 2000);
        assert!(config.max_cycles.is_none());
    }

    #[test]
    fn deserialize_partial_toml() {
        let toml_str = r#"
            store_url = "https://records.internal"
            max_cycles = 7
            cascade_cap = 10
        "#;
        let config: JobNetConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.store_url, "https://records.internal");
        assert_eq!(config.max_cycles, Some(7));
        assert_eq!(config.cascade_cap, 10);
        assert_eq!(config.verification_cap, 3);
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "timeout_recovery_cap = 1").unwrap();
        writeln!(file, "inherited_env_keys = [\"REPO\"]").unwrap();

        let config = JobNetConfig::load_from(file.path()).unwrap();
        assert_eq!(config.timeout_recovery_cap, 1);
        assert_eq!(config.inherited_env_keys, vec!["REPO".to_string()]);
    }

    #[test]
    fn load_rejects_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "cascade_cap = \"many\"").unwrap();
        assert!(JobNetConfig::load_from(file.path()).is_err());
    }

    #[test]
    fn validate_rejects_zero_budgets() {
        let config = JobNetConfig {
            sibling_poll_attempts: 0,
            ..JobNetConfig::default()
        };
        assert!(matches!(config.validate(), Err(JobNetError::Config(_))));
        assert!(JobNetConfig::default().validate().is_ok());
    }

    #[test]
    fn load_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = JobNetConfig::load_from(&dir.path().join("jobnet.toml")).unwrap();
        assert_eq!(config.dispatch_max_attempts, 3);
    }
}
