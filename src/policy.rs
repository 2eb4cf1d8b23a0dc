//! Pause policy.
//!
//! Decides when a pause is due, how large the young generation may grow, which
//! regions a pause evacuates, where surviving objects are copied to, and when a
//! concurrent marking cycle starts. Predictions come from decaying averages of what
//! earlier pauses measured.

pub mod age_table;
pub mod predictor;

use std::time::Instant;

use crate::allocation::GcAllocPurpose;
use crate::collection_set::{CollectionSet, CollectionSetChooser};
use crate::config::Config;
use crate::globals::HEAP_WORD_SIZE;
use crate::region::{Region, RegionSizes};
use crate::young_list::YoungList;
use age_table::AgeTable;
use predictor::{SurvRateGroup, TruncatedSeq};

/// Old regions with less garbage than this share of a region are not worth a mixed pause.
const MIN_GARBAGE_PERCENT_FOR_MIXED: usize = 10;

/// What the heap measured during a pause, handed to the policy at its end.
#[derive(Clone, Debug, Default)]
pub struct PauseRecord {
    pub pause_time_ms: f64,
    pub update_rs_time_ms: f64,
    pub cards_processed: usize,
    pub rs_cards_scanned: usize,
    pub bytes_copied: usize,
    pub cs_regions: usize,
    pub cs_young_regions: usize,
    pub free_regions: usize,
    pub young_length: usize,
    pub old_used_bytes: usize,
    pub committed_bytes: usize,
    pub evacuation_failed: bool,
    pub abandoned: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DestinationRule {
    pub use_survivor_space: bool,
    pub tenuring_threshold: u8,
}

impl DestinationRule {
    #[inline]
    pub fn destination(&self, from_young: bool, age: u8) -> GcAllocPurpose {
        if self.use_survivor_space && from_young && age < self.tenuring_threshold {
            GcAllocPurpose::Survived
        } else {
            GcAllocPurpose::Tenured
        }
    }
}

/// Outcome of the end-of-pause bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PauseDecision {
    /// Run the initial-mark work before the world is restarted.
    pub initiate_conc_mark: bool,
    /// Bytes the heap should grow by.
    pub expand_bytes: usize,
}

pub struct Policy {
    sizes: RegionSizes,
    max_pause_time_ms: f64,
    sigma: f64,
    fixed_young_length: Option<usize>,
    min_reserve_percent: usize,
    expand_by_percent_of_available: usize,
    gc_percent: usize,

    use_survivor_space: bool,
    survivor_ratio: usize,
    target_survivor_ratio: usize,
    max_tenuring_threshold: u8,
    fixed_tenuring_threshold: bool,
    max_survivor_regions_cfg: Option<usize>,
    max_tenured_regions_cfg: Option<usize>,
    use_scan_only_prefix: bool,

    conc_mark: bool,
    marking_threshold_percent: usize,
    min_pauses_between_marks: usize,

    surv_rate_group: SurvRateGroup,
    age_table: AgeTable,
    tenuring_threshold: u8,

    cost_per_byte_ms: TruncatedSeq,
    cost_per_card_ms: TruncatedSeq,
    constant_other_time_ms: TruncatedSeq,
    pause_time_ms: TruncatedSeq,
    recent_gc_overhead: TruncatedSeq,

    young_list_target_length: usize,
    reserve_regions: usize,

    chooser: CollectionSetChooser,
    mixed_pauses_pending: bool,
    in_marking_window: bool,
    initiate_conc_mark_requested: bool,
    pauses_since_last_mark: usize,

    last_pause_end: Option<Instant>,
    pause_start: Option<Instant>,
    full_collections: usize,
    verbose: bool,
}

impl Policy {
    pub fn new(config: &Config, sizes: RegionSizes) -> Self {
        Self {
            sizes,
            max_pause_time_ms: config.max_pause_time_ms,
            sigma: config.confidence_percent as f64 / 100.0,
            fixed_young_length: config.young_list_length,
            min_reserve_percent: config.min_reserve_percent,
            expand_by_percent_of_available: config.expand_by_percent_of_available,
            gc_percent: config.gc_percent,
            use_survivor_space: config.use_survivor_space,
            survivor_ratio: config.survivor_ratio.max(1),
            target_survivor_ratio: config.target_survivor_ratio,
            max_tenuring_threshold: config.max_tenuring_threshold,
            fixed_tenuring_threshold: config.fixed_tenuring_threshold,
            max_survivor_regions_cfg: config.max_survivor_regions,
            max_tenured_regions_cfg: config.max_tenured_regions,
            use_scan_only_prefix: config.use_scan_only_prefix,
            conc_mark: config.conc_mark,
            marking_threshold_percent: config.marking_threshold_percent,
            min_pauses_between_marks: config.min_pauses_between_marks,
            surv_rate_group: SurvRateGroup::new("young", 1.0),
            age_table: AgeTable::new(),
            tenuring_threshold: config.max_tenuring_threshold,
            cost_per_byte_ms: TruncatedSeq::new(),
            cost_per_card_ms: TruncatedSeq::new(),
            constant_other_time_ms: TruncatedSeq::new(),
            pause_time_ms: TruncatedSeq::new(),
            recent_gc_overhead: TruncatedSeq::new(),
            young_list_target_length: 1,
            reserve_regions: 0,
            chooser: CollectionSetChooser::new(),
            mixed_pauses_pending: false,
            in_marking_window: false,
            initiate_conc_mark_requested: false,
            pauses_since_last_mark: 0,
            last_pause_end: None,
            pause_start: None,
            full_collections: 0,
            verbose: config.verbose,
        }
    }

    pub fn surv_rate_group(&mut self) -> &mut SurvRateGroup {
        &mut self.surv_rate_group
    }

    pub fn young_list_target_length(&self) -> usize {
        self.young_list_target_length
    }

    pub fn reserve_regions(&self) -> usize {
        self.reserve_regions
    }

    pub fn tenuring_threshold(&self) -> u8 {
        self.tenuring_threshold
    }

    pub fn in_marking_window(&self) -> bool {
        self.in_marking_window
    }

    /// Recomputes the young target from the regions the heap can hand out.
    ///
    /// `free_regions` counts committed free regions, `young_length` the young
    /// regions (survivors included) that already exist.
    pub fn calculate_young_list_target_length(&mut self, committed_regions: usize, free_regions: usize, young_length: usize) {
        self.reserve_regions = committed_regions * self.min_reserve_percent / 100;
        let absolute_max = (free_regions + young_length)
            .saturating_sub(self.reserve_regions)
            .max(young_length + 1);
        let target = match self.fixed_young_length {
            Some(fixed) => fixed.max(1).min(absolute_max),
            None => self.predicted_young_length(young_length, absolute_max),
        };
        self.young_list_target_length = target;
        crate::logln_if!(
            self.verbose,
            "young target {} (reserve {}, free {}, young {})",
            target,
            self.reserve_regions,
            free_regions,
            young_length
        );
    }

    /// Largest young length whose predicted pause fits into the pause goal.
    fn predicted_young_length(&self, young_length: usize, absolute_max: usize) -> usize {
        if self.cost_per_byte_ms.is_empty() {
            return absolute_max;
        }
        let min = young_length + 1;
        let base = self.predict_base_time_ms(0);
        let mut best = min;
        let mut lo = min;
        let mut hi = absolute_max;
        while lo <= hi {
            let mid = lo + (hi - lo) / 2;
            let eden = mid - young_length;
            let time = base + self.predict_young_time_ms(eden);
            if time <= self.max_pause_time_ms {
                best = mid;
                lo = mid + 1;
            } else if mid == 0 {
                break;
            } else {
                hi = mid - 1;
            }
        }
        best.max(min).min(absolute_max)
    }

    fn predict_base_time_ms(&self, pending_cards: usize) -> f64 {
        self.constant_other_time_ms.predict(self.sigma)
            + pending_cards as f64 * self.cost_per_card_ms.predict(self.sigma)
    }

    fn predict_young_time_ms(&self, eden_regions: usize) -> f64 {
        let bytes = self.surv_rate_group.accum_surv_rate_pred(eden_regions, self.sigma)
            * self.sizes.region_size_bytes as f64;
        bytes * self.cost_per_byte_ms.predict(self.sigma)
    }

    pub fn predict_region_time_ms(&self, region: &Region) -> f64 {
        let bytes = if region.is_young() {
            let age = region.surv_rate_age();
            if age < 0 {
                region.used() as f64
            } else {
                region.used() as f64 * self.surv_rate_group.surv_rate_pred(age as usize, self.sigma)
            }
        } else {
            region.live_bytes() as f64
        };
        bytes * self.cost_per_byte_ms.predict(self.sigma)
            + region.rem_set().occupied() as f64 * self.cost_per_card_ms.predict(self.sigma)
    }

    pub fn should_do_collection_pause(&self, young_length: usize) -> bool {
        young_length >= self.young_list_target_length
    }

    pub fn record_collection_pause_start(&mut self) {
        self.pause_start = Some(Instant::now());
        self.age_table.clear();
    }

    /// Builds the collection set: every young region, then old candidates left by
    /// the last marking cycle while the predicted pause stays within the goal.
    ///
    /// With the scan-only prefix enabled, the oldest young regions that do not fit
    /// the budget are kept in place and only scanned.
    pub fn choose_collection_set(
        &mut self,
        regions: &[Region],
        young: &mut YoungList,
        cset: &mut CollectionSet,
        pending_cards: usize,
        free_regions: usize,
    ) {
        crate::guarantee!(cset.is_empty(), "collection set must be empty at pause start");
        let mut budget = self.max_pause_time_ms - self.predict_base_time_ms(pending_cards);

        if self.use_scan_only_prefix && !self.cost_per_byte_ms.is_empty() {
            let mut fits = 0;
            let mut predicted = 0.0;
            for region in young.iter(regions) {
                if region.is_survivor() {
                    fits += 1;
                    continue;
                }
                let t = self.predict_region_time_ms(region);
                if predicted + t > budget && fits > 0 {
                    break;
                }
                predicted += t;
                fits += 1;
            }
            let excess = young.young_length() - fits;
            if excess > 0 {
                young.mark_scan_only_prefix(regions, excess);
            }
        }

        while let Some(index) = young.pop_region(regions) {
            let t = self.predict_region_time_ms(&regions[index.as_usize()]);
            budget -= t;
            cset.add(regions, index, t);
        }

        if self.mixed_pauses_pending {
            self.chooser.prune(regions);
            let reserve = self.reserve_regions.max(1);
            let mut added = 0;
            let max_old = self.chooser.per_pause();
            while let Some(index) = self.chooser.peek() {
                let region = &regions[index.as_usize()];
                let t = self.predict_region_time_ms(region);
                // Always take at least one candidate so the list makes progress.
                if added > 0 && (t > budget || added >= max_old) {
                    break;
                }
                if free_regions <= reserve + cset.young_regions() + added {
                    break;
                }
                self.chooser.pop();
                budget -= t;
                cset.add(regions, index, t);
                added += 1;
            }
            if self.chooser.is_empty() {
                self.mixed_pauses_pending = false;
            }
            crate::logln_if!(self.verbose, "mixed pause adds {} old regions", added);
        }
        crate::logln_if!(
            self.verbose,
            "collection set: {} young, {} old, {} scan-only, predicted {:.2}ms",
            cset.young_regions(),
            cset.old_regions(),
            young.scan_only_length(),
            cset.predicted_time_ms()
        );
    }

    /// Where a surviving object of `age` copied out of a region goes.
    pub fn evacuation_destination(&self, from_young: bool, age: u8) -> GcAllocPurpose {
        self.destination_rule().destination(from_young, age)
    }

    /// The tenuring decision of the current pause, detached from the policy so
    /// that GC workers can apply it without the heap lock.
    pub fn destination_rule(&self) -> DestinationRule {
        DestinationRule {
            use_survivor_space: self.use_survivor_space,
            tenuring_threshold: self.tenuring_threshold,
        }
    }

    /// Region budget of `purpose` for one pause.
    pub fn max_regions(&self, purpose: GcAllocPurpose) -> usize {
        match purpose {
            GcAllocPurpose::Survived => self
                .max_survivor_regions_cfg
                .unwrap_or_else(|| (self.young_list_target_length / self.survivor_ratio).max(1)),
            GcAllocPurpose::Tenured => self.max_tenured_regions_cfg.unwrap_or(usize::MAX),
        }
    }

    pub fn record_age_table(&mut self, table: &AgeTable) {
        self.age_table.merge(table);
    }

    pub fn record_region_survival(&mut self, age_index: i32, used_words: usize, surviving_words: usize) {
        self.surv_rate_group
            .record_surviving_words(age_index, used_words, surviving_words);
    }

    /// Bookkeeping at the end of an incremental pause.
    pub fn record_collection_pause_end(&mut self, record: &PauseRecord) -> PauseDecision {
        let now = Instant::now();
        let pause_ms = record.pause_time_ms;
        self.pause_time_ms.add(pause_ms);

        if !record.abandoned {
            if record.bytes_copied > 0 {
                let copy_ms = (pause_ms - record.update_rs_time_ms).max(0.0);
                self.cost_per_byte_ms.add(copy_ms / record.bytes_copied as f64);
            } else {
                self.cost_per_byte_ms.add(0.0);
            }
            if record.cards_processed + record.rs_cards_scanned > 0 {
                self.cost_per_card_ms.add(
                    record.update_rs_time_ms / (record.cards_processed + record.rs_cards_scanned) as f64,
                );
            }
            let other = (pause_ms - record.update_rs_time_ms).max(0.0)
                / (record.cs_regions.max(1) as f64);
            self.constant_other_time_ms.add(other.min(self.max_pause_time_ms / 4.0));
        }

        if let Some(last) = self.last_pause_end {
            let interval_ms = now.duration_since(last).as_secs_f64() * 1000.0;
            if interval_ms > 0.0 {
                self.recent_gc_overhead
                    .add((pause_ms / interval_ms * 100.0).min(100.0));
            }
        }
        self.last_pause_end = Some(now);

        self.update_tenuring_threshold();
        self.pauses_since_last_mark += 1;

        let committed_regions = record.committed_bytes / self.sizes.region_size_bytes;
        self.calculate_young_list_target_length(committed_regions, record.free_regions, record.young_length);

        let mut decision = PauseDecision::default();
        decision.initiate_conc_mark = self.should_initiate_conc_mark(record);
        if decision.initiate_conc_mark {
            self.initiate_conc_mark_requested = false;
            self.in_marking_window = true;
            self.pauses_since_last_mark = 0;
        }
        decision.expand_bytes = self.expansion_amount(record.committed_bytes);
        crate::logln_if!(
            self.verbose,
            "pause end: {:.2}ms, copied {} bytes, tenuring threshold {}, {:?}",
            pause_ms,
            record.bytes_copied,
            self.tenuring_threshold,
            decision
        );
        decision
    }

    fn should_initiate_conc_mark(&self, record: &PauseRecord) -> bool {
        if !self.conc_mark || self.in_marking_window || self.mixed_pauses_pending {
            return false;
        }
        if self.initiate_conc_mark_requested {
            return true;
        }
        let threshold = record.committed_bytes * self.marking_threshold_percent / 100;
        record.old_used_bytes > threshold
            && self.pauses_since_last_mark >= self.min_pauses_between_marks
    }

    /// Asks for a marking cycle to start at the end of the next pause.
    pub fn request_conc_mark(&mut self) {
        if self.conc_mark {
            self.initiate_conc_mark_requested = true;
        }
    }

    /// Called once remark and cleanup finished; ranks the old regions for mixed pauses.
    pub fn record_concurrent_mark_cleanup_end(&mut self, regions: &[Region], candidates: Vec<crate::region::RegionIndex>) {
        let min_garbage = self.sizes.region_size_bytes * MIN_GARBAGE_PERCENT_FOR_MIXED / 100;
        self.chooser.build(regions, candidates, min_garbage);
        self.mixed_pauses_pending = !self.chooser.is_empty();
        self.in_marking_window = false;
        crate::logln_if!(
            self.verbose,
            "marking cleanup: {} mixed candidates, {} per pause",
            self.chooser.remaining(),
            self.chooser.per_pause()
        );
    }

    pub fn record_concurrent_mark_abort(&mut self) {
        self.in_marking_window = false;
        self.initiate_conc_mark_requested = false;
    }

    pub fn mixed_pauses_pending(&self) -> bool {
        self.mixed_pauses_pending
    }

    pub fn mixed_candidates(&self) -> usize {
        self.chooser.remaining()
    }

    pub fn clear_mixed_candidates(&mut self) {
        self.chooser.clear();
        self.mixed_pauses_pending = false;
    }

    fn update_tenuring_threshold(&mut self) {
        if self.fixed_tenuring_threshold {
            self.tenuring_threshold = self.max_tenuring_threshold;
            return;
        }
        let desired = self.desired_survivor_words() / 100 * self.target_survivor_ratio;
        self.tenuring_threshold = self
            .age_table
            .compute_tenuring_threshold(desired, self.max_tenuring_threshold);
    }

    /// Bytes to grow the heap by when recent pauses took more than `gc_percent` of
    /// the time.
    pub fn expansion_amount(&self, committed_bytes: usize) -> usize {
        if self.recent_gc_overhead.num() < 2 {
            return 0;
        }
        if self.recent_gc_overhead.davg() <= self.gc_percent as f64 {
            return 0;
        }
        let uncommitted = self.sizes.max_heap_size.saturating_sub(committed_bytes);
        let amount = uncommitted * self.expand_by_percent_of_available / 100;
        if amount == 0 {
            return 0;
        }
        amount.max(self.sizes.region_size_bytes).min(uncommitted)
    }

    pub fn record_full_collection_end(&mut self, committed_regions: usize, free_regions: usize) {
        self.full_collections += 1;
        self.surv_rate_group.start_adding_regions();
        self.age_table.clear();
        self.pauses_since_last_mark = self.min_pauses_between_marks;
        self.calculate_young_list_target_length(committed_regions, free_regions, 0);
        self.last_pause_end = Some(Instant::now());
    }

    pub fn full_collections(&self) -> usize {
        self.full_collections
    }

    /// Words the survivor space may hold at most.
    fn desired_survivor_words(&self) -> usize {
        self.max_regions(GcAllocPurpose::Survived)
            .saturating_mul(self.sizes.region_size_bytes)
            / HEAP_WORD_SIZE
    }
}
