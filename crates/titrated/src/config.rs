//! Configuration for titrated
//!
//! Command-line flags layered over an optional TOML file layered over
//! built-in defaults. A flag given on the command line always wins.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use tracing::warn;

use titrate_common::{AdaptiveParams, ShaperError, ShaperResult, ShapingConfig};

use crate::attach::parse_interface_list;
use crate::controller::ControllerSettings;
use crate::loops::TickPolicy;

const DEFAULT_INTERFACES: &str = "enX0,enX1,enX3,enX4,enX5,enX6";
const DEFAULT_STATIC_OBJECT: &str = "/usr/lib/titrate/xdp_static.o";
const DEFAULT_TITRATE_OBJECT: &str = "/usr/lib/titrate/xdp_titrate.o";

/// Control policy selected at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum PolicyKind {
    /// Fixed buffer threshold.
    Static,
    /// Adaptive threshold with outlier-filtered feedback.
    #[default]
    Titrate,
}

impl PolicyKind {
    /// Datapath program entry point for this policy.
    pub fn program_name(&self) -> &'static str {
        match self {
            PolicyKind::Static => "xdp_static_func",
            PolicyKind::Titrate => "xdp_titrate_func",
        }
    }

    fn default_object(&self) -> &'static str {
        match self {
            PolicyKind::Static => DEFAULT_STATIC_OBJECT,
            PolicyKind::Titrate => DEFAULT_TITRATE_OBJECT,
        }
    }
}

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "titrated")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Control policy
    #[arg(long, value_enum)]
    pub policy: Option<PolicyKind>,

    /// Comma-separated list of network interfaces
    #[arg(long)]
    pub interfaces: Option<String>,

    /// Rate limit in kbps
    #[arg(long)]
    pub rate: Option<u64>,

    /// Static buffer threshold in MTU
    #[arg(long)]
    pub thresh: Option<u64>,

    /// Adaptive window duration in ms
    #[arg(long)]
    pub window: Option<u64>,

    /// Adaptive decrease constant in MTU
    #[arg(long)]
    pub decrease: Option<u64>,

    /// Minimum threshold in MTU
    #[arg(long = "thresh_min")]
    pub thresh_min: Option<u64>,

    /// Maximum threshold in MTU
    #[arg(long = "thresh_max")]
    pub thresh_max: Option<u64>,

    /// Initial threshold in MTU
    #[arg(long = "thresh_init")]
    pub thresh_init: Option<u64>,

    /// Number of windows considered by the adaptive datapath
    #[arg(long = "windows_considered")]
    pub windows_considered: Option<u64>,

    /// Slow-start threshold multiplier
    #[arg(long = "ss_mult")]
    pub ss_mult: Option<f64>,

    /// Enable the slow-start threshold (0 or 1)
    #[arg(long = "ss_on")]
    pub ss_on: Option<u8>,

    /// Telemetry period in ms
    #[arg(long = "read_rate")]
    pub read_rate: Option<u64>,

    /// Number of samples in the averaging window
    #[arg(long = "avg_samples")]
    pub avg_samples: Option<usize>,

    /// Sampling period in microseconds
    #[arg(long = "avg_sample_period")]
    pub avg_sample_period: Option<u64>,

    /// Compiled datapath object
    #[arg(long = "bpf_object")]
    pub bpf_object: Option<PathBuf>,

    /// Write telemetry CSV to this file instead of stdout
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Behaviour when a tick overruns its period
    #[arg(long = "tick_policy", value_enum)]
    pub tick_policy: Option<TickPolicy>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long = "log_level", default_value = "info")]
    pub log_level: String,

    /// Optional TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// `[datapath]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatapathSection {
    pub policy: Option<PolicyKind>,
    pub interfaces: Option<Vec<String>>,
    pub bpf_object: Option<PathBuf>,
}

/// `[shaping]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShapingSection {
    pub rate: Option<u64>,
    pub thresh: Option<u64>,
    pub window: Option<u64>,
    pub decrease: Option<u64>,
    pub thresh_min: Option<u64>,
    pub thresh_max: Option<u64>,
    pub thresh_init: Option<u64>,
    pub windows_considered: Option<u64>,
    pub ss_mult: Option<f64>,
    pub ss_on: Option<u8>,
}

/// `[loops]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopsSection {
    pub read_rate: Option<u64>,
    pub avg_samples: Option<usize>,
    pub avg_sample_period: Option<u64>,
    pub tick_policy: Option<TickPolicy>,
    pub output: Option<PathBuf>,
}

/// Contents of the TOML configuration file. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub datapath: DatapathSection,
    pub shaping: ShapingSection,
    pub loops: LoopsSection,
}

impl FileConfig {
    /// Loads `path`, falling back to an empty overlay if it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> ShaperResult<Self> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                ShaperError::invalid_config(
                    "config",
                    format!("failed to parse {}: {}", path.display(), e),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ShaperError::Io(e)),
        }
    }
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub policy: PolicyKind,
    pub interfaces: Vec<String>,
    /// kbps
    pub rate: u64,
    pub thresh: u64,
    /// ms
    pub window: u64,
    pub decrease: u64,
    pub thresh_min: u64,
    pub thresh_max: u64,
    pub thresh_init: u64,
    pub windows_considered: u64,
    pub ss_mult: f64,
    pub ss_on: u8,
    /// ms
    pub read_rate: u64,
    pub avg_samples: usize,
    /// µs
    pub avg_sample_period: u64,
    pub bpf_object: PathBuf,
    pub output: Option<PathBuf>,
    pub tick_policy: TickPolicy,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let policy = PolicyKind::default();
        Self {
            policy,
            interfaces: parse_interface_list(DEFAULT_INTERFACES),
            rate: 100_000,
            thresh: 100,
            window: 200,
            decrease: 1,
            thresh_min: 2,
            thresh_max: 100,
            thresh_init: 50,
            windows_considered: 1,
            ss_mult: 1.5,
            ss_on: 0,
            read_rate: 50,
            avg_samples: 100,
            avg_sample_period: 500,
            bpf_object: PathBuf::from(policy.default_object()),
            output: None,
            tick_policy: TickPolicy::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads the optional config file named by `args`, layers, validates.
    pub fn resolve(args: &Args) -> ShaperResult<Self> {
        let file = match &args.config {
            Some(path) => FileConfig::load_or_default(path)?,
            None => FileConfig::default(),
        };
        let config = Self::layered(args, &file);
        config.validate()?;
        Ok(config)
    }

    /// Command line over file over defaults. Does not validate.
    pub fn layered(args: &Args, file: &FileConfig) -> Self {
        let defaults = Self::default();
        let policy = args
            .policy
            .or(file.datapath.policy)
            .unwrap_or(defaults.policy);

        let interfaces = match (&args.interfaces, &file.datapath.interfaces) {
            (Some(list), _) => parse_interface_list(list),
            (None, Some(names)) => names
                .iter()
                .map(|n| n.trim())
                .filter(|n| !n.is_empty())
                .map(str::to_string)
                .collect(),
            (None, None) => defaults.interfaces,
        };

        let bpf_object = args
            .bpf_object
            .clone()
            .or_else(|| file.datapath.bpf_object.clone())
            .unwrap_or_else(|| PathBuf::from(policy.default_object()));

        let shaping = &file.shaping;
        let loops = &file.loops;
        Self {
            policy,
            interfaces,
            rate: args.rate.or(shaping.rate).unwrap_or(defaults.rate),
            thresh: args.thresh.or(shaping.thresh).unwrap_or(defaults.thresh),
            window: args.window.or(shaping.window).unwrap_or(defaults.window),
            decrease: args
                .decrease
                .or(shaping.decrease)
                .unwrap_or(defaults.decrease),
            thresh_min: args
                .thresh_min
                .or(shaping.thresh_min)
                .unwrap_or(defaults.thresh_min),
            thresh_max: args
                .thresh_max
                .or(shaping.thresh_max)
                .unwrap_or(defaults.thresh_max),
            thresh_init: args
                .thresh_init
                .or(shaping.thresh_init)
                .unwrap_or(defaults.thresh_init),
            windows_considered: args
                .windows_considered
                .or(shaping.windows_considered)
                .unwrap_or(defaults.windows_considered),
            ss_mult: args.ss_mult.or(shaping.ss_mult).unwrap_or(defaults.ss_mult),
            ss_on: args.ss_on.or(shaping.ss_on).unwrap_or(defaults.ss_on),
            read_rate: args
                .read_rate
                .or(loops.read_rate)
                .unwrap_or(defaults.read_rate),
            avg_samples: args
                .avg_samples
                .or(loops.avg_samples)
                .unwrap_or(defaults.avg_samples),
            avg_sample_period: args
                .avg_sample_period
                .or(loops.avg_sample_period)
                .unwrap_or(defaults.avg_sample_period),
            bpf_object,
            output: args.output.clone().or_else(|| loops.output.clone()),
            tick_policy: args
                .tick_policy
                .or(loops.tick_policy)
                .unwrap_or(defaults.tick_policy),
        }
    }

    /// Validates the configuration.
    pub fn validate(&self) -> ShaperResult<()> {
        if self.interfaces.iter().all(|name| name.trim().is_empty()) {
            return Err(ShaperError::EmptyInterfaceList);
        }
        if self.rate == 0 {
            return Err(ShaperError::invalid_config("rate", "must be > 0"));
        }
        if self.rate.checked_mul(1000).is_none() {
            return Err(ShaperError::invalid_config("rate", "too large"));
        }
        if self.avg_samples == 0 {
            return Err(ShaperError::invalid_config("avg_samples", "must be >= 1"));
        }
        if self.read_rate == 0 {
            return Err(ShaperError::invalid_config("read_rate", "must be > 0"));
        }
        if self.avg_sample_period == 0 {
            return Err(ShaperError::invalid_config(
                "avg_sample_period",
                "must be > 0",
            ));
        }

        match self.policy {
            PolicyKind::Static => {
                if self.thresh == 0 {
                    return Err(ShaperError::invalid_config("thresh", "must be >= 1"));
                }
            }
            PolicyKind::Titrate => {
                if self.thresh_min == 0 {
                    return Err(ShaperError::invalid_config("thresh_min", "must be >= 1"));
                }
                if self.thresh_init < self.thresh_min || self.thresh_init > self.thresh_max {
                    return Err(ShaperError::invalid_config(
                        "thresh_init",
                        format!(
                            "must lie within [{}, {}]",
                            self.thresh_min, self.thresh_max
                        ),
                    ));
                }
                if self.windows_considered == 0 {
                    return Err(ShaperError::invalid_config(
                        "windows_considered",
                        "must be >= 1",
                    ));
                }
                if !(self.ss_mult >= 1.0 && self.ss_mult.is_finite()) {
                    return Err(ShaperError::invalid_config("ss_mult", "must be >= 1.0"));
                }
                if self.ss_on > 1 {
                    return Err(ShaperError::invalid_config("ss_on", "must be 0 or 1"));
                }
            }
        }
        Ok(())
    }

    /// Shaping record to seed the datapath with.
    pub fn shaping_config(&self) -> ShapingConfig {
        let rate_bps = self.rate.saturating_mul(1000);
        match self.policy {
            PolicyKind::Static => ShapingConfig::Static {
                rate_bps,
                threshold_mtu: self.thresh,
            },
            PolicyKind::Titrate => ShapingConfig::Adaptive {
                rate_bps,
                params: AdaptiveParams {
                    window_duration_ms: self.window,
                    decrease_constant: self.decrease,
                    min_threshold_mtu: self.thresh_min,
                    max_threshold_mtu: self.thresh_max,
                    initial_threshold_mtu: self.thresh_init,
                    windows_considered: self.windows_considered,
                    ssthresh_multiplier: AdaptiveParams::fixed_point_multiplier(self.ss_mult),
                    ssthresh_enabled: self.ss_on == 1,
                },
            },
        }
    }

    pub fn sample_period(&self) -> Duration {
        Duration::from_micros(self.avg_sample_period)
    }

    pub fn report_period(&self) -> Duration {
        Duration::from_millis(self.read_rate)
    }

    /// Settings handed to the controller lifecycle.
    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            shaping: self.shaping_config(),
            interfaces: self.interfaces.clone(),
            avg_samples: self.avg_samples,
            sample_period: self.sample_period(),
            report_period: self.report_period(),
            tick_policy: self.tick_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn parse(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("titrated").chain(argv.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::resolve(&parse(&[])).unwrap();
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(
            config.interfaces,
            vec!["enX0", "enX1", "enX3", "enX4", "enX5", "enX6"]
        );
        assert_eq!(config.bpf_object, PathBuf::from(DEFAULT_TITRATE_OBJECT));
        assert_eq!(config.sample_period(), Duration::from_micros(500));
        assert_eq!(config.report_period(), Duration::from_millis(50));
    }

    #[test]
    fn test_snake_case_flags() {
        let args = parse(&[
            "--policy",
            "static",
            "--interfaces",
            "eth0, eth1",
            "--rate",
            "2000",
            "--thresh",
            "64",
            "--avg_samples",
            "10",
            "--avg_sample_period",
            "250",
            "--read_rate",
            "100",
            "--tick_policy",
            "skip",
        ]);
        let config = DaemonConfig::resolve(&args).unwrap();

        assert_eq!(config.policy, PolicyKind::Static);
        assert_eq!(config.interfaces, vec!["eth0", "eth1"]);
        assert_eq!(config.bpf_object, PathBuf::from(DEFAULT_STATIC_OBJECT));
        assert_eq!(config.tick_policy, TickPolicy::Skip);
        assert_eq!(
            config.shaping_config(),
            ShapingConfig::Static {
                rate_bps: 2_000_000,
                threshold_mtu: 64
            }
        );

        let settings = config.controller_settings();
        assert_eq!(settings.avg_samples, 10);
        assert_eq!(settings.sample_period, Duration::from_micros(250));
        assert_eq!(settings.report_period, Duration::from_millis(100));
    }

    #[test]
    fn test_adaptive_shaping_config() {
        let args = parse(&["--ss_mult", "2.25", "--ss_on", "1", "--thresh_init", "10"]);
        let config = DaemonConfig::resolve(&args).unwrap();

        assert_eq!(
            config.shaping_config(),
            ShapingConfig::Adaptive {
                rate_bps: 100_000_000,
                params: AdaptiveParams {
                    window_duration_ms: 200,
                    decrease_constant: 1,
                    min_threshold_mtu: 2,
                    max_threshold_mtu: 100,
                    initial_threshold_mtu: 10,
                    windows_considered: 1,
                    ssthresh_multiplier: 2_250_000,
                    ssthresh_enabled: true,
                },
            }
        );
    }

    #[test]
    fn test_file_overlay_and_cli_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[datapath]
policy = "static"
interfaces = ["veth0", " ", "veth1"]

[shaping]
rate = 5000
thresh = 20

[loops]
read_rate = 10
tick_policy = "delay"
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = DaemonConfig::resolve(&parse(&["--config", path.as_str(), "--thresh", "30"])).unwrap();

        assert_eq!(config.policy, PolicyKind::Static);
        assert_eq!(config.interfaces, vec!["veth0", "veth1"]);
        assert_eq!(config.rate, 5000);
        assert_eq!(config.thresh, 30);
        assert_eq!(config.read_rate, 10);
        assert_eq!(config.tick_policy, TickPolicy::Delay);
        // untouched keys keep their defaults
        assert_eq!(config.avg_samples, 100);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = FileConfig::load_or_default("/nonexistent/titrated.toml").unwrap();
        assert!(config.shaping.rate.is_none());
    }

    #[test]
    fn test_malformed_file_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[shaping]\nrate = \"fast\"\n").unwrap();

        let err = FileConfig::load_or_default(file.path()).unwrap_err();
        assert!(matches!(err, ShaperError::InvalidConfig { .. }));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let err = toml::from_str::<FileConfig>("[shaping]\nthreshold = 3\n");
        assert!(err.is_err());
    }

    #[test]
    fn test_empty_interface_list() {
        let err = DaemonConfig::resolve(&parse(&["--interfaces", " , ,"])).unwrap_err();
        assert!(matches!(err, ShaperError::EmptyInterfaceList));
    }

    #[test]
    fn test_validation_rules() {
        let cases = vec![
            (vec!["--rate", "0"], "rate"),
            (vec!["--avg_samples", "0"], "avg_samples"),
            (vec!["--read_rate", "0"], "read_rate"),
            (vec!["--avg_sample_period", "0"], "avg_sample_period"),
            (vec!["--thresh_min", "0"], "thresh_min"),
            (vec!["--thresh_init", "101"], "thresh_init"),
            (vec!["--thresh_init", "1"], "thresh_init"),
            (vec!["--windows_considered", "0"], "windows_considered"),
            (vec!["--ss_mult", "0.5"], "ss_mult"),
            (vec!["--ss_on", "2"], "ss_on"),
            (vec!["--policy", "static", "--thresh", "0"], "thresh"),
        ];

        for (argv, expected) in cases {
            match DaemonConfig::resolve(&parse(&argv)) {
                Err(ShaperError::InvalidConfig { field, .. }) => {
                    assert_eq!(field, expected, "argv = {argv:?}")
                }
                other => panic!("argv = {argv:?}: expected InvalidConfig, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_static_ignores_adaptive_bounds() {
        let args = parse(&["--policy", "static", "--thresh_min", "0"]);
        assert!(DaemonConfig::resolve(&args).is_ok());
    }
}
