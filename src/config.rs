//! Dispatcher configuration
//!
//! [`Config`] collects every tunable of a [`HybridGemm`](crate::HybridGemm)
//! context. It starts from built-in defaults, can be adjusted with the
//! `with_*` builders, and can read `HYBRIDGEMM_*` environment overrides once
//! with [`Config::from_env`].
//!
//! | Variable                        | Meaning                                |
//! |---------------------------------|----------------------------------------|
//! | `HYBRIDGEMM_{S,D,C,Z}GEMM_SPLIT`| device share of the long axis, (0, 1]  |
//! | `HYBRIDGEMM_LOWER_THRESHOLD`    | smallest dimension sent to a device    |
//! | `HYBRIDGEMM_UPPER_THRESHOLD`    | K-split gate                           |
//! | `HYBRIDGEMM_SPECIAL_K`          | enable the K-split strategy            |
//! | `HYBRIDGEMM_SPECIAL_K_BLOCK`    | K tile length                          |
//! | `HYBRIDGEMM_SELF_TUNE`          | adjust splits from measured timings    |
//! | `HYBRIDGEMM_TUNE_POSITIVE_TOL`  | device overload tolerance (seconds)    |
//! | `HYBRIDGEMM_TUNE_NEGATIVE_TOL`  | device underuse tolerance (seconds)    |
//! | `HYBRIDGEMM_PROFILE`            | emit one profile record per call       |
//! | `HYBRIDGEMM_MODE`               | `hybrid`, `cpu` or `gpu`               |
//! | `HYBRIDGEMM_SELF_INIT`          | self-initialize devices when needed    |
//! | `HYBRIDGEMM_MULTI_DEVICE`       | self-initialize every visible device   |
//! | `HYBRIDGEMM_STREAMS_PER_DEVICE` | slots per device                       |
//! | `HYBRIDGEMM_MEMORY_FRACTION`    | share of free memory to reserve        |
//! | `HYBRIDGEMM_SCRATCH_BYTES`      | fixed scratch size per device          |
//! | `HYBRIDGEMM_HOST_THREADS`       | host BLAS thread count                 |

use crate::dtype::GemmKind;
use crate::error::{Error, Result};
use std::str::FromStr;

/// Prefix of every environment override
pub const ENV_PREFIX: &str = "HYBRIDGEMM_";

/// Default lower size threshold
pub const DEFAULT_LOWER_THRESHOLD: usize = 256;

/// Default upper size threshold
pub const DEFAULT_UPPER_THRESHOLD: usize = 2048;

/// Default K tile length of the K-split strategy
pub const DEFAULT_SPECIAL_K_BLOCK: usize = 2048;

/// Default share of free device memory reserved by self-initialization
pub const DEFAULT_MEMORY_FRACTION: f64 = 0.80;

/// Where GPU-assisted calls are allowed to run
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum ExecutionMode {
    /// Split between host and devices using the tuned ratio
    #[default]
    Hybrid,
    /// Never touch a device
    CpuOnly,
    /// Send the whole long axis to the devices (split 1.0)
    GpuOnly,
}

impl FromStr for ExecutionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hybrid" => Ok(Self::Hybrid),
            "cpu" | "cpu-only" | "cpu_only" => Ok(Self::CpuOnly),
            "gpu" | "gpu-only" | "gpu_only" => Ok(Self::GpuOnly),
            other => Err(Error::config(
                "HYBRIDGEMM_MODE",
                format!("expected hybrid, cpu or gpu, got '{other}'"),
            )),
        }
    }
}

/// Configuration of one dispatch context
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Initial split ratio per [`GemmKind`], indexed by [`GemmKind::index`]
    pub splits: [f32; 4],
    /// Any dimension below this runs on the host
    pub lower_threshold: usize,
    /// K at or above this (with small M, N) selects the K-split strategy
    pub upper_threshold: usize,
    /// Enable the K-split strategy
    pub special_k: bool,
    /// K tile length of the K-split strategy
    pub special_k_block: usize,
    /// Adjust split ratios from measured slot timings
    pub self_tune: bool,
    /// Imbalance (seconds) above which the device share shrinks
    pub tune_positive_tol: f64,
    /// Imbalance (seconds) below minus this value grows the device share
    pub tune_negative_tol: f64,
    /// Record a [`ProfileRecord`](crate::profile::ProfileRecord) per call
    pub profile: bool,
    /// Host/device routing policy
    pub mode: ExecutionMode,
    /// Self-initialize the registry when a call needs devices
    pub self_init: bool,
    /// Self-initialize every visible device instead of device 0 only
    pub multi_device: bool,
    /// Streams (slots) per device
    pub streams_per_device: usize,
    /// Share of free device memory reserved by self-initialization
    pub memory_fraction: f64,
    /// Fixed scratch size per device for self-initialization
    pub scratch_bytes: Option<usize>,
    /// Host BLAS thread count (`None` uses the global rayon pool)
    pub host_threads: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            splits: GemmKind::ALL.map(GemmKind::default_split),
            lower_threshold: DEFAULT_LOWER_THRESHOLD,
            upper_threshold: DEFAULT_UPPER_THRESHOLD,
            special_k: false,
            special_k_block: DEFAULT_SPECIAL_K_BLOCK,
            self_tune: false,
            tune_positive_tol: 0.0005,
            tune_negative_tol: 0.001,
            profile: false,
            mode: ExecutionMode::Hybrid,
            self_init: true,
            multi_device: false,
            streams_per_device: 1,
            memory_fraction: DEFAULT_MEMORY_FRACTION,
            scratch_bytes: None,
            host_threads: None,
        }
    }
}

impl Config {
    /// Defaults overridden by `HYBRIDGEMM_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each
    /// `HYBRIDGEMM_*` key
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |name: &str| {
            let key = format!("{ENV_PREFIX}{name}");
            lookup(&key).map(|value| (key, value))
        };

        let mut config = Self::default();
        for kind in GemmKind::ALL {
            let name = format!("{}_SPLIT", kind.to_string().to_ascii_uppercase());
            if let Some((key, value)) = get(&name) {
                config.splits[kind.index()] = parse(&key, &value)?;
            }
        }
        if let Some((key, value)) = get("LOWER_THRESHOLD") {
            config.lower_threshold = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("UPPER_THRESHOLD") {
            config.upper_threshold = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("SPECIAL_K") {
            config.special_k = parse_bool(&key, &value)?;
        }
        if let Some((key, value)) = get("SPECIAL_K_BLOCK") {
            config.special_k_block = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("SELF_TUNE") {
            config.self_tune = parse_bool(&key, &value)?;
        }
        if let Some((key, value)) = get("TUNE_POSITIVE_TOL") {
            config.tune_positive_tol = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("TUNE_NEGATIVE_TOL") {
            config.tune_negative_tol = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("PROFILE") {
            config.profile = parse_bool(&key, &value)?;
        }
        if let Some((_, value)) = get("MODE") {
            config.mode = value.parse()?;
        }
        if let Some((key, value)) = get("SELF_INIT") {
            config.self_init = parse_bool(&key, &value)?;
        }
        if let Some((key, value)) = get("MULTI_DEVICE") {
            config.multi_device = parse_bool(&key, &value)?;
        }
        if let Some((key, value)) = get("STREAMS_PER_DEVICE") {
            config.streams_per_device = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("MEMORY_FRACTION") {
            config.memory_fraction = parse(&key, &value)?;
        }
        if let Some((key, value)) = get("SCRATCH_BYTES") {
            config.scratch_bytes = Some(parse(&key, &value)?);
        }
        if let Some((key, value)) = get("HOST_THREADS") {
            config.host_threads = Some(parse(&key, &value)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Check ranges and cross-field constraints
    pub fn validate(&self) -> Result<()> {
        for kind in GemmKind::ALL {
            let split = self.splits[kind.index()];
            if !(split > 0.0 && split <= 1.0) {
                return Err(Error::config(
                    format!("{ENV_PREFIX}{}_SPLIT", kind.to_string().to_ascii_uppercase()),
                    format!("split {split} is outside (0, 1]"),
                ));
            }
        }
        if self.lower_threshold > self.upper_threshold {
            return Err(Error::config(
                "HYBRIDGEMM_LOWER_THRESHOLD",
                format!(
                    "lower threshold {} exceeds upper threshold {}",
                    self.lower_threshold, self.upper_threshold
                ),
            ));
        }
        if self.special_k_block == 0 {
            return Err(Error::config(
                "HYBRIDGEMM_SPECIAL_K_BLOCK",
                "block size must be positive",
            ));
        }
        if !(self.tune_positive_tol >= 0.0 && self.tune_negative_tol >= 0.0) {
            return Err(Error::config(
                "HYBRIDGEMM_TUNE_POSITIVE_TOL",
                "tolerances must be non-negative",
            ));
        }
        if self.streams_per_device == 0 {
            return Err(Error::config(
                "HYBRIDGEMM_STREAMS_PER_DEVICE",
                "at least one stream per device is required",
            ));
        }
        if !(self.memory_fraction > 0.0 && self.memory_fraction <= 1.0) {
            return Err(Error::config(
                "HYBRIDGEMM_MEMORY_FRACTION",
                format!("fraction {} is outside (0, 1]", self.memory_fraction),
            ));
        }
        if self.host_threads == Some(0) {
            return Err(Error::config(
                "HYBRIDGEMM_HOST_THREADS",
                "thread count must be positive",
            ));
        }
        Ok(())
    }

    /// Set the initial split ratio of one kind
    pub fn with_split(mut self, kind: GemmKind, split: f32) -> Self {
        self.splits[kind.index()] = split;
        self
    }

    /// Set the initial split ratio of every kind
    pub fn with_split_factors(mut self, splits: [f32; 4]) -> Self {
        self.splits = splits;
        self
    }

    /// Set the lower and upper size thresholds
    pub fn with_thresholds(mut self, lower: usize, upper: usize) -> Self {
        self.lower_threshold = lower;
        self.upper_threshold = upper;
        self
    }

    /// Enable or disable the K-split strategy
    pub fn with_special_k(mut self, enabled: bool) -> Self {
        self.special_k = enabled;
        self
    }

    /// Set the K tile length
    pub fn with_special_k_block(mut self, block: usize) -> Self {
        self.special_k_block = block;
        self
    }

    /// Enable or disable self-tuning
    pub fn with_self_tune(mut self, enabled: bool) -> Self {
        self.self_tune = enabled;
        self
    }

    /// Set the self-tuning tolerances (seconds)
    pub fn with_tune_tolerances(mut self, positive: f64, negative: f64) -> Self {
        self.tune_positive_tol = positive;
        self.tune_negative_tol = negative;
        self
    }

    /// Enable or disable profiling
    pub fn with_profile(mut self, enabled: bool) -> Self {
        self.profile = enabled;
        self
    }

    /// Set the execution mode
    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Enable or disable self-initialization
    pub fn with_self_init(mut self, enabled: bool) -> Self {
        self.self_init = enabled;
        self
    }

    /// Self-initialize every visible device
    pub fn with_multi_device(mut self, enabled: bool) -> Self {
        self.multi_device = enabled;
        self
    }

    /// Set the number of streams per device
    pub fn with_streams_per_device(mut self, streams: usize) -> Self {
        self.streams_per_device = streams;
        self
    }

    /// Set the share of free memory reserved by self-initialization
    pub fn with_memory_fraction(mut self, fraction: f64) -> Self {
        self.memory_fraction = fraction;
        self
    }

    /// Reserve a fixed scratch size per device on self-initialization
    pub fn with_scratch_bytes(mut self, bytes: usize) -> Self {
        self.scratch_bytes = Some(bytes);
        self
    }

    /// Use a dedicated host pool of `threads` workers
    pub fn with_host_threads(mut self, threads: usize) -> Self {
        self.host_threads = Some(threads);
        self
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| Error::config(key, format!("'{value}': {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::config(key, format!("'{other}' is not a boolean"))),
    }
}
