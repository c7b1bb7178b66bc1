use serde::Deserialize;
use std::path::PathBuf;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ArrivalPhase {
    #[default]
    Start,
    AfterControl,
    Never,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct ModuleSpec {
    pub name: String,
    pub base_address: u64,
    #[serde(default)]
    pub arrival: ArrivalPhase,
    #[serde(default)]
    pub departs_after_firing: bool,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct RunSettings {
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_fire_passes")]
    pub fire_passes: u32,
}

pub fn default_drain_timeout_ms() -> u64 {
    500
}

pub fn default_fire_passes() -> u32 {
    1
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            drain_timeout_ms: default_drain_timeout_ms(),
            fire_passes: default_fire_passes(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    #[serde(default)]
    pub modules: Vec<ModuleSpec>,
    #[serde(default)]
    pub control_lines: Vec<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TripwireConfig {
    #[serde(default)]
    pub run: Option<RunSettings>,
    #[serde(default)]
    pub simulation: Option<SimulationConfig>,
}

impl TripwireConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: TripwireConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }
}

impl Default for TripwireConfig {
    fn default() -> Self {
        Self {
            run: Some(RunSettings::default()),
            simulation: Some(SimulationConfig::default()),
        }
    }
}
