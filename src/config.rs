use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub filters: FilterConfig,
}

/// Rewrite oracle settings (local Ollama endpoint by default).
#[derive(Debug, Serialize, Deserialize)]
pub struct OracleConfig {
    pub host: String,
    pub model: String,
    pub timeout_ms: u64,
    /// Character proxy for the model's context budget; units whose prompt
    /// exceeds this are skipped.
    pub max_prompt_chars: usize,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            host: "localhost:11434".to_string(),
            model: "qwen2.5-coder:7b".to_string(),
            timeout_ms: 120_000,
            max_prompt_chars: 24_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Mean unit score a file candidate must reach to become a patch record.
    pub min_score: u8,
    /// Shell command run against candidate files; receives the path as its
    /// last argument.
    pub test_cmd: String,
    pub test_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            min_score: 3,
            test_cmd: "python3 -m py_compile".to_string(),
            test_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FilterConfig {
    pub ignore_dirs: Vec<String>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            ignore_dirs: vec![
                ".git".into(),
                ".repatch".into(),
                "__pycache__".into(),
                ".venv".into(),
                "venv".into(),
                "node_modules".into(),
                "build".into(),
                "dist".into(),
            ],
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = get_config_path()?;

        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = get_config_path()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    pub fn create_default() -> Result<PathBuf> {
        let config = Config::default();
        config.save()?;
        get_config_path()
    }
}

fn get_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    Ok(config_dir.join("repatch").join("config.toml"))
}

pub fn show_config() -> Result<()> {
    let path = get_config_path()?;
    println!("Config: {}", path.display());
    println!();

    if path.exists() {
        let config = Config::load()?;
        println!("{}", toml::to_string_pretty(&config)?);
    } else {
        println!("(default config, file not created)");
        println!();
        let config = Config::default();
        println!("{}", toml::to_string_pretty(&config)?);
    }

    Ok(())
}
