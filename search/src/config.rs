//! Search policy configuration.
//!
//! Typed configuration with bon builders and environment variable
//! fallbacks. Canonical parameter names follow the search-policy interface;
//! every knob also reads a `ZORYA_*` environment variable.

use std::sync::Arc;

use bon::bon;
use zorya_dag::ComputeDAG;

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

// ============================================================================
// HARDWARE PARAMETERS
// ============================================================================

/// Target hardware description consulted by the annotation rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareParams {
    /// Number of physical cores used to bound parallel granularity.
    pub num_cores: usize,
    /// SIMD register width in bytes.
    pub vector_unit_bytes: usize,
    /// Cache line size in bytes.
    pub cache_line_bytes: usize,
}

impl Default for HardwareParams {
    fn default() -> Self {
        Self { num_cores: 4, vector_unit_bytes: 64, cache_line_bytes: 64 }
    }
}

#[bon]
impl HardwareParams {
    /// Create hardware parameters with builder pattern.
    #[builder]
    pub fn builder(
        #[builder(default = 4)] num_cores: usize,
        #[builder(default = 64)] vector_unit_bytes: usize,
        #[builder(default = 64)] cache_line_bytes: usize,
    ) -> Self {
        Self { num_cores, vector_unit_bytes, cache_line_bytes }
    }

    /// Detect from the current machine, with `ZORYA_NUM_CORES` override.
    pub fn from_env() -> Self {
        let num_cores = env_parse("ZORYA_NUM_CORES")
            .unwrap_or_else(|| std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4));
        Self { num_cores, ..Default::default() }
    }
}

// ============================================================================
// SEARCH TASK
// ============================================================================

/// One tuning task: a compute DAG plus the hardware it targets.
#[derive(Debug, Clone)]
pub struct SearchTask {
    pub dag: Arc<ComputeDAG>,
    pub workload_key: String,
    pub hardware: HardwareParams,
}

impl SearchTask {
    pub fn new(dag: Arc<ComputeDAG>, hardware: HardwareParams) -> Self {
        let workload_key = dag.workload_key().to_owned();
        Self { dag, workload_key, hardware }
    }
}

// ============================================================================
// EVOLUTIONARY SEARCH PARAMETERS
// ============================================================================

/// Knobs of the evolutionary refinement phase.
#[derive(Debug, Clone, PartialEq)]
pub struct EvolutionParams {
    /// Working population size per round.
    pub population: usize,
    /// Fraction of the population seeded from the best measured states.
    pub use_measured_ratio: f32,
    /// Number of generations per round.
    pub num_iters: usize,
}

impl Default for EvolutionParams {
    fn default() -> Self {
        Self { population: 2048, use_measured_ratio: 0.2, num_iters: 4 }
    }
}

// ============================================================================
// SEARCH PARAMETERS
// ============================================================================

/// Tunable parameters of the sketch search policy.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
    /// Fraction of each measurement batch spent on random exploration.
    pub eps_greedy: f32,
    /// Minimum number of valid init-population samples per round.
    pub sample_init_min_population: usize,
    /// Largest innermost tile factor the tile filler may pick.
    pub max_innermost_split_factor: u64,
    /// Largest fused extent the vectorizer may annotate.
    pub max_vectorize_size: u64,
    /// Skip the compute-location randomization rule.
    pub disable_change_compute_location: bool,
    /// Multi-level tiling structure over `{S, R}`, outermost first.
    pub cpu_structure: String,
    /// Evolutionary refinement knobs.
    pub evolution: EvolutionParams,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            eps_greedy: 0.05,
            sample_init_min_population: 50,
            max_innermost_split_factor: 64,
            max_vectorize_size: 16,
            disable_change_compute_location: false,
            cpu_structure: "SSRSRS".to_owned(),
            evolution: EvolutionParams::default(),
        }
    }
}

#[bon]
impl SearchParams {
    /// Create search parameters with builder pattern.
    #[builder]
    pub fn builder(
        #[builder(default = 0.05)] eps_greedy: f32,
        #[builder(default = 50)] sample_init_min_population: usize,
        #[builder(default = 64)] max_innermost_split_factor: u64,
        #[builder(default = 16)] max_vectorize_size: u64,
        #[builder(default = false)] disable_change_compute_location: bool,
        #[builder(default = "SSRSRS".to_owned())] cpu_structure: String,
        #[builder(default = 2048)] evolution_population: usize,
        #[builder(default = 0.2)] evolution_use_measured_ratio: f32,
        #[builder(default = 4)] evolution_num_iters: usize,
    ) -> Self {
        Self {
            eps_greedy,
            sample_init_min_population,
            max_innermost_split_factor,
            max_vectorize_size,
            disable_change_compute_location,
            cpu_structure,
            evolution: EvolutionParams {
                population: evolution_population,
                use_measured_ratio: evolution_use_measured_ratio,
                num_iters: evolution_num_iters,
            },
        }
    }

    /// Create parameters from environment variables.
    ///
    /// # Environment Variables
    ///
    /// * `ZORYA_EPS_GREEDY` - exploration fraction (default: 0.05)
    /// * `ZORYA_INIT_POPULATION` - init samples per round (default: 50)
    /// * `ZORYA_MAX_INNERMOST_FACTOR` - innermost tile cap (default: 64)
    /// * `ZORYA_MAX_VECTORIZE` - vectorize extent cap (default: 16)
    /// * `ZORYA_NO_COMPUTE_LOCATION` - disable location randomization if set
    /// * `ZORYA_TILE_STRUCTURE` - tiling structure (default: SSRSRS)
    /// * `ZORYA_EVO_POPULATION` - evolution population (default: 2048)
    /// * `ZORYA_EVO_MEASURED_RATIO` - measured seed ratio (default: 0.2)
    /// * `ZORYA_EVO_ITERS` - evolution generations (default: 4)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            eps_greedy: env_parse("ZORYA_EPS_GREEDY").unwrap_or(defaults.eps_greedy),
            sample_init_min_population: env_parse("ZORYA_INIT_POPULATION")
                .unwrap_or(defaults.sample_init_min_population),
            max_innermost_split_factor: env_parse("ZORYA_MAX_INNERMOST_FACTOR")
                .unwrap_or(defaults.max_innermost_split_factor),
            max_vectorize_size: env_parse("ZORYA_MAX_VECTORIZE").unwrap_or(defaults.max_vectorize_size),
            disable_change_compute_location: std::env::var("ZORYA_NO_COMPUTE_LOCATION").is_ok(),
            cpu_structure: std::env::var("ZORYA_TILE_STRUCTURE").unwrap_or(defaults.cpu_structure),
            evolution: EvolutionParams {
                population: env_parse("ZORYA_EVO_POPULATION").unwrap_or(defaults.evolution.population),
                use_measured_ratio: env_parse("ZORYA_EVO_MEASURED_RATIO")
                    .unwrap_or(defaults.evolution.use_measured_ratio),
                num_iters: env_parse("ZORYA_EVO_ITERS").unwrap_or(defaults.evolution.num_iters),
            },
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
