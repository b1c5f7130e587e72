//! Session settings.
//!
//! Parsed from a TOML file with tolerant defaults: unknown keys are ignored
//! and a parse failure falls back to the defaults so a session can always
//! come up. On startup the engine writes a normalized copy back next to the
//! save path, which is what later runs (and humans) read.

use core_codec::buffer::{ByteReader, ByteWriter};
use core_codec::lzma::CompressionSettings;
use core_codec::record::StringTable;
use core_exec::ExecConfig;
use core_forms::{Form, FormId, reserved};
use core_sched::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const TYPE_SETTINGS: i32 = i32::from_be_bytes(*b"STTG");

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PutSettings {
    /// `undefined`, `script` or `stdin_dump`.
    #[serde(default)]
    pub put_type: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub lua_cmd_script: String,
    #[serde(default)]
    pub lua_cmd_script_replay: String,
    #[serde(default)]
    pub lua_script_args_script: String,
    #[serde(default)]
    pub lua_oracle_script: String,
    #[serde(default)]
    pub grammar: String,
}

impl Default for PutSettings {
    fn default() -> Self {
        Self {
            put_type: "undefined".into(),
            path: String::new(),
            lua_cmd_script: String::new(),
            lua_cmd_script_replay: String::new(),
            lua_script_args_script: String::new(),
            lua_oracle_script: String::new(),
            grammar: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadSettings {
    #[serde(default = "default_true")]
    pub use_hardware_threads: bool,
    #[serde(default)]
    pub num_threads: usize,
    #[serde(default)]
    pub num_compute_threads: usize,
    #[serde(default = "default_concurrent_tests")]
    pub concurrent_tests: usize,
}

impl Default for ThreadSettings {
    fn default() -> Self {
        Self {
            use_hardware_threads: true,
            num_threads: 0,
            num_compute_threads: 0,
            concurrent_tests: default_concurrent_tests(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemorySettings {
    /// Hard limit in megabytes; 0 disables.
    #[serde(default)]
    pub memory_limit: u64,
    #[serde(default)]
    pub memory_soft_limit: u64,
    #[serde(default = "default_sweep_period")]
    pub memory_sweep_period_s: u64,
    /// Per-PUT resident limit in megabytes; 0 disables.
    #[serde(default)]
    pub max_used_memory: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            memory_limit: 0,
            memory_soft_limit: 0,
            memory_sweep_period_s: default_sweep_period(),
            max_used_memory: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SaveSettings {
    #[serde(default = "default_true")]
    pub enable_saves: bool,
    #[serde(default)]
    pub autosave_period_tests: u64,
    #[serde(default)]
    pub autosave_period_seconds: u64,
    #[serde(default = "default_save_path")]
    pub save_path: PathBuf,
    #[serde(default = "default_save_name")]
    pub save_name: String,
    /// -1 disables compression, 0..=9 are xz presets.
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
    #[serde(default)]
    pub compression_extreme: bool,
}

impl Default for SaveSettings {
    fn default() -> Self {
        Self {
            enable_saves: true,
            autosave_period_tests: 0,
            autosave_period_seconds: 0,
            save_path: default_save_path(),
            save_name: default_save_name(),
            compression_level: default_compression_level(),
            compression_extreme: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationSettings {
    #[serde(default = "default_generation_size")]
    pub generation_size: u64,
    #[serde(default = "default_generation_step")]
    pub generation_step: u64,
    #[serde(default)]
    pub generation_tweak_start: f64,
    #[serde(default)]
    pub generation_tweak_max: f64,
    #[serde(default = "default_true")]
    pub construct_inputs_iteratively: bool,
    #[serde(default = "default_true")]
    pub delta_debugging: bool,
    #[serde(default = "default_max_derived")]
    pub max_derived_inputs_per_source: u64,
    #[serde(default = "default_max_derived_fails")]
    pub max_derived_fails_per_source: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            generation_size: default_generation_size(),
            generation_step: default_generation_step(),
            generation_tweak_start: 0.2,
            generation_tweak_max: 1.0,
            construct_inputs_iteratively: true,
            delta_debugging: true,
            max_derived_inputs_per_source: default_max_derived(),
            max_derived_fails_per_source: default_max_derived_fails(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GoalSettings {
    #[serde(default)]
    pub use_found_negatives: bool,
    #[serde(default)]
    pub found_negatives: u64,
    #[serde(default)]
    pub use_found_positives: bool,
    #[serde(default)]
    pub found_positives: u64,
    #[serde(default)]
    pub use_timeout: bool,
    #[serde(default)]
    pub timeout_s: u64,
    #[serde(default)]
    pub use_overall_tests: bool,
    #[serde(default)]
    pub overall_tests: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestSettings {
    #[serde(default)]
    pub execute_fragments: bool,
    #[serde(default)]
    pub use_test_timeout: bool,
    #[serde(default = "default_test_timeout")]
    pub test_timeout_ms: u64,
    #[serde(default)]
    pub use_fragment_timeout: bool,
    #[serde(default)]
    pub fragment_timeout_ms: u64,
    #[serde(default)]
    pub store_put_output: bool,
    #[serde(default)]
    pub store_put_output_successful: bool,
    /// Supervisory loop period in milliseconds.
    #[serde(default = "default_period")]
    pub period_ms: u64,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            execute_fragments: false,
            use_test_timeout: false,
            test_timeout_ms: default_test_timeout(),
            use_fragment_timeout: false,
            fragment_timeout_ms: 0,
            store_put_output: false,
            store_put_output_successful: false,
            period_ms: default_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeltaSettings {
    /// Candidate batch cap per level; 0 runs the whole level at once.
    #[serde(default)]
    pub batchprocessing: usize,
    #[serde(default)]
    pub budget: u64,
    #[serde(default = "default_execute_above_length")]
    pub execute_above_length: usize,
    #[serde(default)]
    pub approximate_execution: bool,
    #[serde(default = "default_approx_threshold")]
    pub approx_threshold: f64,
    #[serde(default = "default_loss")]
    pub acceptable_loss_primary: f64,
    #[serde(default = "default_loss")]
    pub acceptable_loss_secondary: f64,
    #[serde(default)]
    pub acceptable_loss_absolute_primary: f64,
    #[serde(default)]
    pub acceptable_loss_absolute_secondary: f64,
    #[serde(default)]
    pub run_reproduce_results_after_score_approx_on_positive: bool,
    /// Minimum length below which inputs are not considered for
    /// backtracking-based derivation.
    #[serde(default)]
    pub min_backtrack_length: usize,
    #[serde(default = "default_true")]
    pub allow_delta_debugged_sources: bool,
}

impl Default for DeltaSettings {
    fn default() -> Self {
        Self {
            batchprocessing: 0,
            budget: 0,
            execute_above_length: 1,
            approximate_execution: false,
            approx_threshold: default_approx_threshold(),
            acceptable_loss_primary: default_loss(),
            acceptable_loss_secondary: default_loss(),
            acceptable_loss_absolute_primary: 0.0,
            acceptable_loss_absolute_secondary: 0.0,
            run_reproduce_results_after_score_approx_on_positive: false,
            min_backtrack_length: 0,
            allow_delta_debugged_sources: true,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_concurrent_tests() -> usize {
    8
}
fn default_sweep_period() -> u64 {
    60
}
fn default_save_path() -> PathBuf {
    PathBuf::from("./saves")
}
fn default_save_name() -> String {
    "session".into()
}
fn default_compression_level() -> i32 {
    -1
}
fn default_generation_size() -> u64 {
    100
}
fn default_generation_step() -> u64 {
    20
}
fn default_max_derived() -> u64 {
    50
}
fn default_max_derived_fails() -> u64 {
    20
}
fn default_test_timeout() -> u64 {
    5000
}
fn default_period() -> u64 {
    1000
}
fn default_execute_above_length() -> usize {
    1
}
fn default_approx_threshold() -> f64 {
    0.3
}
fn default_loss() -> f64 {
    0.1
}

/// All configuration the core consumes, grouped by concern.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub put: PutSettings,
    #[serde(default)]
    pub threads: ThreadSettings,
    #[serde(default)]
    pub memory: MemorySettings,
    #[serde(default)]
    pub saves: SaveSettings,
    #[serde(default)]
    pub generation: GenerationSettings,
    #[serde(default)]
    pub goals: GoalSettings,
    #[serde(default)]
    pub tests: TestSettings,
    #[serde(default)]
    pub delta: DeltaSettings,
}

impl Settings {
    /// Reads the file, falling back to defaults when missing or malformed.
    pub fn load_from(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<Settings>(&content) {
                Ok(settings) => settings,
                Err(err) => {
                    warn!(target: "session.settings", path = %path.display(), %err, "parse_failed_using_defaults");
                    Settings::default()
                }
            },
            Err(_) => {
                info!(target: "session.settings", path = %path.display(), "missing_using_defaults");
                Settings::default()
            }
        }
    }

    /// Writes the normalized form of the settings.
    pub fn write_normalized(&self, path: &Path) -> std::io::Result<()> {
        let rendered = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, rendered)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let total = if self.threads.num_threads > 0 {
            self.threads.num_threads
        } else if self.threads.use_hardware_threads {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        } else {
            2
        };
        if self.threads.num_compute_threads > 0 {
            // Settings-driven activation: compute threads become general
            // workers, the rest serve the light classes.
            let light = 1usize;
            let light_medium = total
                .saturating_sub(self.threads.num_compute_threads)
                .saturating_sub(light)
                .max(0);
            SchedulerConfig::explicit(light, light_medium, self.threads.num_compute_threads)
        } else {
            SchedulerConfig::from_total(total)
        }
    }

    pub fn exec_config(&self) -> ExecConfig {
        ExecConfig {
            max_concurrent_tests: self.threads.concurrent_tests.max(1),
            period: Duration::from_millis(self.tests.period_ms.max(1)),
            memory_limit: (self.memory.max_used_memory > 0)
                .then(|| self.memory.max_used_memory * 1024 * 1024),
            test_timeout: self
                .tests
                .use_test_timeout
                .then(|| Duration::from_millis(self.tests.test_timeout_ms)),
            fragment_timeout: self
                .tests
                .use_fragment_timeout
                .then(|| Duration::from_millis(self.tests.fragment_timeout_ms)),
        }
    }

    pub fn compression(&self) -> CompressionSettings {
        CompressionSettings {
            level: self.saves.compression_level.clamp(-1, 9),
            extreme: self.saves.compression_extreme,
            threads: 1,
        }
    }

    /// Path of one numbered save file for this session name.
    pub fn save_file(&self, number: u64) -> PathBuf {
        self.saves
            .save_path
            .join(format!("{}_{number}.save", self.saves.save_name))
    }

    /// The highest existing save number for this session name, if any.
    pub fn latest_save_number(&self) -> Option<u64> {
        let prefix = format!("{}_", self.saves.save_name);
        let mut best = None;
        let entries = std::fs::read_dir(&self.saves.save_path).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            let Some(number) = rest.strip_suffix(".save") else {
                continue;
            };
            if let Ok(number) = number.parse::<u64>() {
                best = Some(best.map_or(number, |b: u64| b.max(number)));
            }
        }
        best
    }
}

impl Form for Settings {
    fn type_tag() -> i32 {
        TYPE_SETTINGS
    }

    fn version() -> i32 {
        2
    }

    fn singleton_id() -> Option<FormId> {
        Some(reserved::SETTINGS)
    }

    fn write_data(
        &self,
        out: &mut ByteWriter<Vec<u8>>,
        _strings: &mut StringTable,
    ) -> core_codec::Result<()> {
        // The settings record is the normalized TOML rendering; it keeps the
        // save self-describing without a second binary layout.
        let rendered = toml::to_string(self).unwrap_or_default();
        out.write_string(&rendered)
    }

    fn read_data(
        _version: i32,
        input: &mut ByteReader<&[u8]>,
        _strings: &StringTable,
    ) -> core_forms::Result<Self> {
        let rendered = input.read_string()?;
        toml::from_str(&rendered)
            .map_err(|e| core_forms::FormError::Serialization(format!("settings record: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let settings = Settings::load_from(Path::new("/definitely/not/here.toml"));
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.saves.compression_level, -1);
        assert!(settings.generation.delta_debugging);
    }

    #[test]
    fn parse_and_normalize_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(
            &path,
            r#"
[put]
put_type = "stdin_dump"
path = "/bin/cat"

[tests]
execute_fragments = true
use_test_timeout = true
test_timeout_ms = 500

[unknown_section]
key = "ignored"
"#,
        )
        .unwrap();

        let settings = Settings::load_from(&path);
        assert_eq!(settings.put.put_type, "stdin_dump");
        assert!(settings.tests.execute_fragments);
        assert_eq!(settings.tests.test_timeout_ms, 500);

        let normalized = dir.path().join("normalized.toml");
        settings.write_normalized(&normalized).unwrap();
        let reloaded = Settings::load_from(&normalized);
        assert_eq!(reloaded, settings);
    }

    #[test]
    fn malformed_file_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "this is { not toml").unwrap();
        assert_eq!(Settings::load_from(&path), Settings::default());
    }

    #[test]
    fn exec_config_respects_toggles() {
        let mut settings = Settings::default();
        settings.tests.use_test_timeout = true;
        settings.tests.test_timeout_ms = 750;
        settings.memory.max_used_memory = 2;
        let config = settings.exec_config();
        assert_eq!(config.test_timeout, Some(Duration::from_millis(750)));
        assert_eq!(config.fragment_timeout, None);
        assert_eq!(config.memory_limit, Some(2 * 1024 * 1024));
    }

    #[test]
    fn save_file_numbering() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.saves.save_path = dir.path().to_path_buf();
        settings.saves.save_name = "fuzz".into();
        assert_eq!(settings.latest_save_number(), None);
        std::fs::write(settings.save_file(1), b"x").unwrap();
        std::fs::write(settings.save_file(3), b"x").unwrap();
        assert_eq!(settings.latest_save_number(), Some(3));
        assert!(
            settings
                .save_file(3)
                .to_string_lossy()
                .ends_with("fuzz_3.save")
        );
    }

    #[test]
    fn settings_record_round_trip() {
        let mut settings = Settings::default();
        settings.put.path = "/bin/true".into();
        settings.delta.budget = 1000;

        let mut strings = StringTable::new();
        let mut out = ByteWriter::new(Vec::new());
        settings.write_data(&mut out, &mut strings).unwrap();
        let bytes = out.into_inner();
        let mut reader = ByteReader::new(bytes.as_slice());
        let decoded = Settings::read_data(2, &mut reader, &strings).unwrap();
        assert_eq!(decoded, settings);
    }
}
