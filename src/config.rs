//! Build and traversal settings, and the `key=value,...` configuration string parser.

use crate::error::{BuildError, Result};
use std::fmt;
use std::str::FromStr;

/// Hierarchy construction algorithm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BuilderKind {
    /// Top-down binned surface area heuristic.
    #[default]
    Sah,
    /// Bottom-up Morton code clustering followed by tree rotations.
    Morton,
}

impl FromStr for BuilderKind {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sah" | "binned_sah" => Ok(Self::Sah),
            "morton" | "lbvh" => Ok(Self::Morton),
            _ => Err(BuildError::UnknownBuilder(s.to_string())),
        }
    }
}

/// How batches of rays walk the tree.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum TraverserKind {
    /// One ray at a time.
    Single,
    /// Whole packets, every active ray tested at every node.
    Packet,
    /// Packets that fall back to single rays once few remain active.
    #[default]
    Hybrid,
    /// Arbitrary ray sets regrouped into coherent packets.
    Stream,
}

impl FromStr for TraverserKind {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "packet" => Ok(Self::Packet),
            "hybrid" => Ok(Self::Hybrid),
            "stream" => Ok(Self::Stream),
            _ => Err(BuildError::UnknownTraverser(s.to_string())),
        }
    }
}

/// Storage of inner node child boxes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum NodeEncoding {
    #[default]
    Aligned,
    Quantized,
    Unaligned,
}

impl FromStr for NodeEncoding {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "aligned" => Ok(Self::Aligned),
            "quantized" | "compressed" => Ok(Self::Quantized),
            "unaligned" | "oriented" => Ok(Self::Unaligned),
            _ => Err(BuildError::UnknownNodeEncoding(s.to_string())),
        }
    }
}

/// Trade-off between build time and tree quality.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum BuildQuality {
    /// Skips the rotation pass after Morton builds. The user builder uses the Morton builder.
    Low,
    #[default]
    Medium,
    /// Pre-splits large primitives before the build.
    High,
}

impl FromStr for BuildQuality {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => Err(BuildError::UnknownQuality(s.to_string())),
        }
    }
}

macro_rules! display_as_lowercase_debug {
    ($($ty:ty),*) => {$(
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", format!("{self:?}").to_ascii_lowercase())
            }
        }
    )*};
}

display_as_lowercase_debug!(BuilderKind, TraverserKind, NodeEncoding, BuildQuality);

/// Every knob of a build and of the traversal dispatch.
#[derive(Clone, Debug, PartialEq)]
pub struct BuildSettings {
    pub builder: BuilderKind,
    pub traverser: TraverserKind,
    pub encoding: NodeEncoding,
    pub quality: BuildQuality,
    /// Ranges of at most this many references always become leaves.
    pub min_leaf_size: usize,
    /// Ranges of more than this many references are always split.
    pub max_leaf_size: usize,
    pub traversal_cost: f32,
    pub intersection_cost: f32,
    /// Depth at which leaves are forced regardless of their size.
    pub max_depth: usize,
    /// Leaf cost is counted in blocks of `2^log_block_size` references. `None` derives it from the
    /// primitive type's block size.
    pub log_block_size: Option<u32>,
    /// Ranges at or below this size are built without forking. `None` asks the allocator.
    pub single_thread_threshold: Option<usize>,
    /// Worker threads for builds and refits. `0` uses rayon's global pool.
    pub threads: usize,
    /// Total bytes all arenas of one build may reserve.
    pub max_bytes: usize,
    /// Rounds of tree rotations after a Morton build.
    pub rotation_rounds: usize,
    /// Rotations only run for at least this many primitives unless forced.
    pub rotation_min_prims: usize,
    pub force_rotations: bool,
    /// Trees with at least this many primitives are refitted in parallel.
    pub refit_parallel_threshold: usize,
    /// Depth of the subtree roots refitted as independent tasks.
    pub refit_frontier_depth: usize,
    /// Active ray count at or below which hybrid traversal switches to single rays.
    /// `None` uses a quarter of the packet width.
    pub hybrid_switch_threshold: Option<usize>,
    /// Primitives larger than this multiple of the average half area get pre-split.
    pub presplit_factor: f32,
    /// Extra references pre-splitting may create, as a fraction of the primitive count.
    pub presplit_budget: f32,
}

pub const DEFAULT_MAX_DEPTH: usize = 32;
pub const ROTATION_MIN_PRIMS: usize = 4096;
pub const REFIT_PARALLEL_THRESHOLD: usize = 4096;

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            builder: BuilderKind::default(),
            traverser: TraverserKind::default(),
            encoding: NodeEncoding::default(),
            quality: BuildQuality::default(),
            min_leaf_size: 1,
            max_leaf_size: 8,
            traversal_cost: 1.0,
            intersection_cost: 1.0,
            max_depth: DEFAULT_MAX_DEPTH,
            log_block_size: None,
            single_thread_threshold: None,
            threads: 0,
            max_bytes: usize::MAX,
            rotation_rounds: 1,
            rotation_min_prims: ROTATION_MIN_PRIMS,
            force_rotations: false,
            refit_parallel_threshold: REFIT_PARALLEL_THRESHOLD,
            refit_frontier_depth: 3,
            hybrid_switch_threshold: None,
            presplit_factor: 4.0,
            presplit_budget: 0.25,
        }
    }
}

impl BuildSettings {
    pub fn with_builder(mut self, builder: BuilderKind) -> Self {
        self.builder = builder;
        self
    }

    pub fn with_traverser(mut self, traverser: TraverserKind) -> Self {
        self.traverser = traverser;
        self
    }

    pub fn with_encoding(mut self, encoding: NodeEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_quality(mut self, quality: BuildQuality) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_leaf_size(mut self, min_leaf_size: usize, max_leaf_size: usize) -> Self {
        self.min_leaf_size = min_leaf_size;
        self.max_leaf_size = max_leaf_size;
        self
    }

    pub fn with_costs(mut self, traversal_cost: f32, intersection_cost: f32) -> Self {
        self.traversal_cost = traversal_cost;
        self.intersection_cost = intersection_cost;
        self
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_single_thread_threshold(mut self, threshold: usize) -> Self {
        self.single_thread_threshold = Some(threshold);
        self
    }

    pub fn with_rotations(mut self, rounds: usize, force: bool) -> Self {
        self.rotation_rounds = rounds;
        self.force_rotations = force;
        self
    }

    pub fn with_refit_parallel_threshold(mut self, threshold: usize) -> Self {
        self.refit_parallel_threshold = threshold;
        self
    }

    pub fn with_hybrid_switch_threshold(mut self, threshold: usize) -> Self {
        self.hybrid_switch_threshold = Some(threshold);
        self
    }

    /// Checks the numeric knobs for a tree of branching factor `branching_factor`.
    pub fn validate(&self, branching_factor: usize) -> Result<()> {
        if !(2..=32).contains(&branching_factor) {
            return Err(BuildError::invalid_argument("branching_factor", branching_factor));
        }
        if self.max_leaf_size == 0 {
            return Err(BuildError::invalid_argument("max_leaf_size", self.max_leaf_size));
        }
        if self.min_leaf_size == 0 || self.min_leaf_size > self.max_leaf_size {
            return Err(BuildError::invalid_argument(
                "min_leaf_size",
                format!("{} (max_leaf_size is {})", self.min_leaf_size, self.max_leaf_size),
            ));
        }
        if !(self.traversal_cost.is_finite() && self.traversal_cost >= 0.0) {
            return Err(BuildError::invalid_argument("traversal_cost", self.traversal_cost));
        }
        if !(self.intersection_cost.is_finite() && self.intersection_cost > 0.0) {
            return Err(BuildError::invalid_argument(
                "intersection_cost",
                self.intersection_cost,
            ));
        }
        if self.max_depth == 0 {
            return Err(BuildError::invalid_argument("max_depth", self.max_depth));
        }
        if self.log_block_size.is_some_and(|shift| shift > 16) {
            return Err(BuildError::invalid_argument(
                "log_block_size",
                format!("{:?}", self.log_block_size),
            ));
        }
        if !(self.presplit_factor.is_finite() && self.presplit_factor >= 1.0) {
            return Err(BuildError::invalid_argument("presplit_factor", self.presplit_factor));
        }
        if !(self.presplit_budget.is_finite() && self.presplit_budget >= 0.0) {
            return Err(BuildError::invalid_argument("presplit_budget", self.presplit_budget));
        }
        Ok(())
    }

    /// Parses a comma separated `key=value` list on top of the defaults.
    ///
    /// ```
    /// use rust_bvh_accel::config::{BuildSettings, BuilderKind, NodeEncoding};
    /// let settings = BuildSettings::parse("builder=morton,encoding=quantized,threads=4").unwrap();
    /// assert_eq!(settings.builder, BuilderKind::Morton);
    /// assert_eq!(settings.encoding, NodeEncoding::Quantized);
    /// assert_eq!(settings.threads, 4);
    /// ```
    pub fn parse(config: &str) -> Result<Self> {
        let mut settings = Self::default();
        for entry in config.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((key, value)) = entry.split_once('=') else {
                return Err(BuildError::InvalidConfig {
                    key: entry.to_string(),
                    value: String::new(),
                });
            };
            settings.apply(key.trim(), value.trim())?;
        }
        Ok(settings)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        fn number<T: FromStr>(key: &str, value: &str) -> Result<T> {
            value.parse().map_err(|_| BuildError::InvalidConfig {
                key: key.to_string(),
                value: value.to_string(),
            })
        }
        match key {
            "builder" => self.builder = value.parse()?,
            "traverser" => self.traverser = value.parse()?,
            "encoding" | "node_encoding" => self.encoding = value.parse()?,
            "quality" => self.quality = value.parse()?,
            "min_leaf_size" => self.min_leaf_size = number(key, value)?,
            "max_leaf_size" => self.max_leaf_size = number(key, value)?,
            "traversal_cost" => self.traversal_cost = number(key, value)?,
            "intersection_cost" => self.intersection_cost = number(key, value)?,
            "max_depth" => self.max_depth = number(key, value)?,
            "log_block_size" => self.log_block_size = Some(number(key, value)?),
            "single_thread_threshold" => self.single_thread_threshold = Some(number(key, value)?),
            "threads" => self.threads = number(key, value)?,
            "max_bytes" => self.max_bytes = number(key, value)?,
            "rotation_rounds" => self.rotation_rounds = number(key, value)?,
            "rotation_min_prims" => self.rotation_min_prims = number(key, value)?,
            "force_rotations" => self.force_rotations = number(key, value)?,
            "refit_parallel_threshold" => self.refit_parallel_threshold = number(key, value)?,
            "refit_frontier_depth" => self.refit_frontier_depth = number(key, value)?,
            "hybrid_switch_threshold" => self.hybrid_switch_threshold = Some(number(key, value)?),
            "presplit_factor" => self.presplit_factor = number(key, value)?,
            "presplit_budget" => self.presplit_budget = number(key, value)?,
            _ => {
                return Err(BuildError::InvalidConfig {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            }
        }
        Ok(())
    }
}

impl FromStr for BuildSettings {
    type Err = BuildError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
