use mmobatch_net::BatchingConfig;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/batching.toml";

/// Profiler configuration: the batching layer plus the simulated workload.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProfilerConfig {
    pub batching: BatchingConfig,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Simulated characters walking around.
    pub characters: usize,
    /// Receiving connections; each character is visible to one of them.
    pub observers: usize,
    /// Simulated duration.
    pub seconds: u64,
    /// Frames per simulated second.
    pub fps: u32,
    pub seed: u64,
    /// Units per second.
    pub walk_speed: f32,
    /// Per-character event rates.
    pub chat_per_second: f64,
    pub abilities_per_second: f64,
    pub combat_per_second: f64,
    pub respawn_per_second: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            characters: 32,
            observers: 4,
            seconds: 10,
            fps: 60,
            seed: 1337,
            walk_speed: 3.0,
            chat_per_second: 0.2,
            abilities_per_second: 0.5,
            combat_per_second: 1.0,
            respawn_per_second: 0.02,
        }
    }
}

impl SimulationConfig {
    /// Clamp values that would make the simulation meaningless.
    pub fn sanitized(mut self) -> Self {
        self.characters = self.characters.max(1);
        self.observers = self.observers.clamp(1, self.characters);
        self.fps = self.fps.clamp(1, 1000);
        self
    }
}

impl ProfilerConfig {
    /// Load configuration from the default path.
    pub fn load() -> Self {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Load configuration from an explicit path, falling back to defaults on errors.
    pub fn load_from_path(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str::<ProfilerConfig>(&contents) {
                Ok(cfg) => cfg,
                Err(err) => {
                    warn!("Failed to parse {}: {err}. Using defaults", path.display());
                    ProfilerConfig::default()
                }
            },
            Err(err) => {
                if path != Path::new(DEFAULT_CONFIG_PATH)
                    || err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!("Failed to read {}: {err}. Using defaults", path.display());
                } else {
                    warn!(
                        "Batching config not found at {}. Using defaults",
                        path.display()
                    );
                }
                ProfilerConfig::default()
            }
        }
    }
}
