use std::fmt;

use crate::globals::formatted_size;

/// Why a collection was started.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GcCause {
    /// The young generation reached its target length.
    YoungPause,
    /// A mutator could not allocate without collecting first.
    AllocationFailure,
    /// Explicit full collection requested by the embedding runtime.
    Explicit,
    /// A humongous allocation found no run of free regions.
    HumongousAllocation,
    /// Last resort before reporting out of memory.
    LastDitch,
    /// Remark and cleanup at the end of a concurrent marking cycle.
    Remark,
}

impl fmt::Display for GcCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcCause::YoungPause => "young pause",
            GcCause::AllocationFailure => "allocation failure",
            GcCause::Explicit => "explicit",
            GcCause::HumongousAllocation => "humongous allocation",
            GcCause::LastDitch => "last ditch",
            GcCause::Remark => "remark",
        };
        f.write_str(name)
    }
}

/// Kind of an incremental pause.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PauseKind {
    Young,
    /// Young regions plus old candidates from the last marking cycle.
    Mixed,
    /// Young regions plus a popular region whose hot objects were relocated first.
    Popular,
    /// Nothing fitted into the pause; no evacuation took place.
    Abandoned,
}

/// Figures of one incremental pause.
#[derive(Clone, Debug)]
pub struct PauseSummary {
    pub id: usize,
    pub cause: GcCause,
    pub kind: PauseKind,
    pub cs_regions: usize,
    pub cs_young_regions: usize,
    pub scan_only_regions: usize,
    pub regions_freed: usize,
    pub failed_regions: usize,
    pub evacuation_failed: bool,
    pub objects_copied: usize,
    pub self_forwarded: usize,
    pub bytes_copied: usize,
    pub used_before_bytes: usize,
    pub used_after_bytes: usize,
    pub popular_objects: usize,
    pub initiated_conc_mark: bool,
    pub pause_time_ms: f64,
}

impl fmt::Display for PauseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GC({}) {:?} pause ({}): {} regions ({} young, {} scan-only), {} -> {}, {} freed, copied {}{} {:.3}ms",
            self.id,
            self.kind,
            self.cause,
            self.cs_regions,
            self.cs_young_regions,
            self.scan_only_regions,
            formatted_size(self.used_before_bytes),
            formatted_size(self.used_after_bytes),
            self.regions_freed,
            formatted_size(self.bytes_copied),
            if self.evacuation_failed {
                " (evacuation failed)"
            } else {
                ""
            },
            self.pause_time_ms
        )
    }
}

/// Figures of one full collection.
#[derive(Clone, Debug)]
pub struct FullGcSummary {
    pub id: usize,
    pub cause: GcCause,
    pub live_objects: usize,
    pub used_before_bytes: usize,
    pub used_after_bytes: usize,
    pub humongous_regions_freed: usize,
    pub committed_before_bytes: usize,
    pub committed_after_bytes: usize,
    pub pause_time_ms: f64,
}

impl fmt::Display for FullGcSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GC({}) full ({}): {} -> {} ({} -> {} committed), {} live objects, {:.3}ms",
            self.id,
            self.cause,
            formatted_size(self.used_before_bytes),
            formatted_size(self.used_after_bytes),
            formatted_size(self.committed_before_bytes),
            formatted_size(self.committed_after_bytes),
            self.live_objects,
            self.pause_time_ms
        )
    }
}

/// Notifications delivered to registered listeners. Listeners run on the thread
/// that drives the collection, inside the pause for prologue and epilogue; they
/// must not allocate or block.
#[derive(Clone, Debug)]
pub enum GcEvent {
    PausePrologue {
        id: usize,
        cause: GcCause,
        used_bytes: usize,
    },
    PauseEpilogue(PauseSummary),
    FullCollection(FullGcSummary),
    ConcurrentCycleStart {
        cycle: usize,
    },
    ConcurrentCycleEnd {
        cycle: usize,
        freed_regions: usize,
    },
}

pub type GcListener = Box<dyn Fn(&GcEvent) + Send + Sync>;

/// Cumulative collector statistics.
#[derive(Clone, Debug, Default)]
pub struct GcStatistics {
    pub pauses: usize,
    pub young_pauses: usize,
    pub mixed_pauses: usize,
    pub popular_pauses: usize,
    pub abandoned_pauses: usize,
    pub full_collections: usize,
    pub evacuation_failures: usize,
    pub objects_copied: usize,
    pub bytes_copied: usize,
    pub regions_freed: usize,
    pub total_pause_time_ms: f64,
    pub max_pause_time_ms: f64,
    pub concurrent_cycles: usize,
    pub heap_expansions: usize,
    pub heap_shrinks: usize,
    pub last_pause: Option<PauseSummary>,
    pub last_full_collection: Option<FullGcSummary>,
}

impl GcStatistics {
    pub fn record_pause(&mut self, summary: &PauseSummary) {
        self.pauses += 1;
        match summary.kind {
            PauseKind::Young => self.young_pauses += 1,
            PauseKind::Mixed => self.mixed_pauses += 1,
            PauseKind::Popular => self.popular_pauses += 1,
            PauseKind::Abandoned => self.abandoned_pauses += 1,
        }
        if summary.evacuation_failed {
            self.evacuation_failures += 1;
        }
        self.objects_copied += summary.objects_copied;
        self.bytes_copied += summary.bytes_copied;
        self.regions_freed += summary.regions_freed;
        self.total_pause_time_ms += summary.pause_time_ms;
        self.max_pause_time_ms = self.max_pause_time_ms.max(summary.pause_time_ms);
        self.last_pause = Some(summary.clone());
    }

    pub fn record_full_collection(&mut self, summary: &FullGcSummary) {
        self.full_collections += 1;
        self.total_pause_time_ms += summary.pause_time_ms;
        self.max_pause_time_ms = self.max_pause_time_ms.max(summary.pause_time_ms);
        self.last_full_collection = Some(summary.clone());
    }
}

impl fmt::Display for GcStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "GC statistics:")?;
        writeln!(
            f,
            "  Pauses: {} ({} young, {} mixed, {} popular, {} abandoned)",
            self.pauses, self.young_pauses, self.mixed_pauses, self.popular_pauses, self.abandoned_pauses
        )?;
        writeln!(f, "  Full collections: {}", self.full_collections)?;
        writeln!(f, "  Evacuation failures: {}", self.evacuation_failures)?;
        writeln!(f, "  Concurrent marking cycles: {}", self.concurrent_cycles)?;
        writeln!(
            f,
            "  Copied: {} objects, {}",
            self.objects_copied,
            formatted_size(self.bytes_copied)
        )?;
        writeln!(f, "  Regions freed: {}", self.regions_freed)?;
        writeln!(
            f,
            "  Heap resized: {} expansions, {} shrinks",
            self.heap_expansions, self.heap_shrinks
        )?;
        writeln!(
            f,
            "  Pause time: {:.3}ms total, {:.3}ms max",
            self.total_pause_time_ms, self.max_pause_time_ms
        )?;
        if let Some(last) = &self.last_pause {
            writeln!(f, "  Last pause: {}", last)?;
        }
        if let Some(last) = &self.last_full_collection {
            writeln!(f, "  Last full collection: {}", last)?;
        }
        Ok(())
    }
}
