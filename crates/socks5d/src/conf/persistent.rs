//! On-disk configuration shape: TOML/YAML via `figment`, `educe`'s
//! `#[educe(Default)]` for the baked-in defaults.

use std::path::Path;

use educe::Educe;
use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct PersistentConfig {
    pub server: ServerOpt,

    #[educe(Default = 600)]
    pub timeout: u64,

    #[educe(Default(expression = vec![0x00]))]
    #[serde(rename = "supported-methods")]
    pub supported_methods: Vec<u8>,

    pub auth: Option<AuthOpt>,

    #[educe(Default)]
    pub log: LogOpt,
}

#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct ServerOpt {
    #[educe(Default = "127.0.0.1")]
    pub host: String,

    #[educe(Default = 1080)]
    pub port: u16,

    #[educe(Default(expression = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)))]
    pub thread_num: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthOpt {
    pub username: String,
    pub password: String,
}

/// Out of scope for the core; consumed only by this binary's own
/// `log::init_log`.
#[derive(Debug, Deserialize, Serialize, Educe)]
#[educe(Default)]
pub struct LogOpt {
    #[educe(Default = "info")]
    pub level: String,
}

impl PersistentConfig {
    pub fn export_to_file(&self, path: &Path, format: &str) -> eyre::Result<()> {
        use std::{fs, io::Write};

        match format.to_lowercase().as_str() {
            "yaml" => {
                let content = serde_yaml::to_string(self)?;
                fs::File::create(path)?.write_all(content.as_bytes())?;
            }
            "toml" => {
                let content = toml::to_string_pretty(self)?;
                fs::File::create(path)?.write_all(content.as_bytes())?;
            }
            other => return Err(eyre::eyre!("unsupported config format: {other}")),
        }
        Ok(())
    }

    /// Merges, in increasing priority: built-in defaults, a config
    /// directory's `config.toml`/`config.yaml`, an explicit `--config`
    /// path, then `SOCKS5D_`-prefixed environment variables.
    pub fn load(config_path: Option<String>, config_dir: Option<std::path::PathBuf>) -> eyre::Result<Self> {
        let mut figment = Figment::new();

        if let Some(dir) = config_dir {
            let toml_path = dir.join("config.toml");
            if toml_path.exists() {
                figment = figment.merge(Toml::file(toml_path));
            }
            let yaml_path = dir.join("config.yaml");
            if yaml_path.exists() {
                figment = figment.merge(Yaml::file(yaml_path));
            }
        } else {
            if Path::new("config.toml").exists() {
                figment = figment.merge(Toml::file("config.toml"));
            }
            if Path::new("config.yaml").exists() {
                figment = figment.merge(Yaml::file("config.yaml"));
            }
        }

        if let Some(path) = config_path {
            if path.ends_with(".yaml") || path.ends_with(".yml") {
                figment = figment.merge(Yaml::file(path));
            } else {
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("SOCKS5D_").split("_"));

        Ok(figment.extract()?)
    }
}
