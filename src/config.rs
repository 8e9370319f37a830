use std::path::PathBuf;
use std::time::Duration;

use crate::compression::Compression;

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for all indexes.
    pub dir: PathBuf,

    /// Total memory quota shared by all indexes (default: 256MB).
    pub memory_limit: usize,

    /// Number of background worker threads (default: 2).
    pub workers: usize,

    /// Scheduler timing configuration.
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./vinyl"),
            memory_limit: 256 * 1024 * 1024,
            workers: 2,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }
}

/// Periodic-trigger intervals for the background scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How often to trigger a checkpoint pass (default: 60s).
    pub checkpoint_interval: Duration,

    /// How often to trigger duplicate garbage collection (default: 30s).
    pub gc_interval: Duration,

    /// How often to evaluate LRU eviction (default: 10s).
    pub lru_interval: Duration,

    /// How often to force-flush stale in-memory generations (default: 120s).
    pub age_interval: Duration,

    /// How long an idle worker parks before re-polling (default: 10ms).
    pub idle_park: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(60),
            gc_interval: Duration::from_secs(30),
            lru_interval: Duration::from_secs(10),
            age_interval: Duration::from_secs(120),
            idle_park: Duration::from_millis(10),
        }
    }
}

impl SchedulerConfig {
    pub fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    pub fn lru_interval(mut self, interval: Duration) -> Self {
        self.lru_interval = interval;
        self
    }

    pub fn age_interval(mut self, interval: Duration) -> Self {
        self.age_interval = interval;
        self
    }

    pub fn idle_park(mut self, park: Duration) -> Self {
        self.idle_park = park;
        self
    }
}

/// Per-index configuration.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Index name; becomes a subdirectory of the engine root.
    pub name: String,

    /// Target on-disk page payload size in bytes (default: 4KB).
    pub page_size: usize,

    /// Target node size used by split planning (default: 64MB).
    pub node_size: usize,

    /// Per-page compression (default: none).
    pub compression: Compression,

    /// Attach a quotient filter to each branch footer (default: true).
    pub amqf: bool,

    /// Filter precision in remainder bits per fingerprint (default: 8).
    /// Tuning policy, not a correctness knob: the filter never reports
    /// a false negative at any setting.
    pub filter_bits: u8,

    /// Fraction of the engine quota this index may pin, in percent
    /// (default: 100, i.e. uncapped below the engine limit).
    pub quota_share: u8,

    /// Compaction zone thresholds indexed by quota-usage percentile.
    pub zones: Vec<ZoneConfig>,

    /// Keep deletes/upserts visible to snapshots no older than this
    /// window during compaction (default: retain for live snapshots only).
    pub age_window: Duration,
}

impl IndexConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            page_size: 4096,
            node_size: 64 * 1024 * 1024,
            compression: Compression::None,
            amqf: true,
            filter_bits: 8,
            quota_share: 100,
            zones: ZoneConfig::default_zones(),
            age_window: Duration::from_secs(300),
        }
    }

    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    pub fn node_size(mut self, bytes: usize) -> Self {
        self.node_size = bytes;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    pub fn amqf(mut self, enabled: bool) -> Self {
        self.amqf = enabled;
        self
    }

    pub fn filter_bits(mut self, bits: u8) -> Self {
        self.filter_bits = bits;
        self
    }

    pub fn quota_share(mut self, percent: u8) -> Self {
        self.quota_share = percent.min(100);
        self
    }

    pub fn zones(mut self, zones: Vec<ZoneConfig>) -> Self {
        self.zones = zones;
        self
    }

    pub fn age_window(mut self, window: Duration) -> Self {
        self.age_window = window;
        self
    }

    /// Select the zone for the current quota usage percentile.
    ///
    /// Zones are ordered by `usage_percent` ascending; the last zone
    /// whose threshold is <= the current percentile wins.
    pub fn zone_for(&self, usage_percent: u8) -> &ZoneConfig {
        self.zones
            .iter()
            .rev()
            .find(|z| z.usage_percent <= usage_percent)
            .unwrap_or(&self.zones[0])
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(crate::Error::Config(format!(
                "invalid index name {:?}",
                self.name
            )));
        }
        if self.page_size < 512 {
            return Err(crate::Error::Config(format!(
                "page_size {} below minimum 512",
                self.page_size
            )));
        }
        if self.zones.is_empty() {
            return Err(crate::Error::Config("no compaction zones".into()));
        }
        if self.zones[0].usage_percent != 0 {
            return Err(crate::Error::Config(
                "first zone must start at 0% quota usage".into(),
            ));
        }
        Ok(())
    }
}

/// Compaction candidate ordering within a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactMode {
    /// Order candidates by branch count (most branches first).
    BranchCount,
    /// Prefer the hottest-read nodes first. Monotonic under more reads;
    /// no exact ordering beyond that is promised.
    Temperature,
}

/// One compaction-aggressiveness profile, selected by quota usage.
#[derive(Debug, Clone)]
pub struct ZoneConfig {
    /// Quota-usage percentile at which this zone takes effect.
    pub usage_percent: u8,

    /// Flush an in-memory generation once it reaches this many bytes.
    pub branch_watermark: usize,

    /// Compact a node once it accumulates this many branches.
    pub compact_watermark: usize,

    /// Collapse duplicates once dup statements exceed this percent of a node.
    pub gc_watermark: u8,

    /// Concurrent branch (flush) workers allowed per index.
    pub branch_limit: usize,

    /// Concurrent compaction workers allowed per index.
    pub compact_limit: usize,

    /// Candidate ordering for compaction.
    pub compact_mode: CompactMode,
}

impl ZoneConfig {
    /// Three-step default ladder: relaxed, elevated, aggressive.
    pub fn default_zones() -> Vec<ZoneConfig> {
        vec![
            ZoneConfig {
                usage_percent: 0,
                branch_watermark: 8 * 1024 * 1024,
                compact_watermark: 4,
                gc_watermark: 50,
                branch_limit: 1,
                compact_limit: 1,
                compact_mode: CompactMode::BranchCount,
            },
            ZoneConfig {
                usage_percent: 60,
                branch_watermark: 4 * 1024 * 1024,
                compact_watermark: 3,
                gc_watermark: 40,
                branch_limit: 2,
                compact_limit: 2,
                compact_mode: CompactMode::BranchCount,
            },
            ZoneConfig {
                usage_percent: 85,
                branch_watermark: 1024 * 1024,
                compact_watermark: 2,
                gc_watermark: 30,
                branch_limit: 2,
                compact_limit: 4,
                compact_mode: CompactMode::Temperature,
            },
        ]
    }
}
