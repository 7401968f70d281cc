// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Stage orchestration: which of the three modeling stages is active,
//! when each one terminates, and the BBL-replay gate a fuzzer input file
//! imposes on stages 1 and 2 before they resume normal behavior.

use std::path::Path;

use crate::codec::{AccessRecord, SrReadRecord};
use crate::config::EngineConfig;
use crate::error::{ExtractorError, ModelError};
use crate::host::ModelExtractor;
use crate::input::ExplorationInput;

/// Which of the three modeling stages is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Classify registers; look for a fresh SR/CR_SR read site with no
    /// matching event.
    SrRId,
    /// Replay to the stage-1 finding, then explore satisfying values.
    SrRExplore,
    /// Serve the learned model; feed fuzzer input through data registers.
    Fuzzing,
}

/// A `doneWork` termination code. Values match the original engine's
/// `peri-mod.h` constants exactly (Design Note 9: "Category enum
/// collisions" — the original defined these twice; this crate defines
/// them once, here).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DoneWorkCode {
    /// Access to a register still `Uncategorized` during fuzzing.
    UncategorizedRegister = 0x40,
    /// An SR read during fuzzing had no matching model entry.
    UnmodeledSrrs = 0x41,
    /// Stage-1 identification concluded (model dumped, worker exits).
    IdentifyDone = 0x50,
    /// Failed to open/stat/read/close a file this crate owns.
    InputIoError = 0x70,
    /// The fuzzer (or stage-2 exploration) input was exhausted.
    InputExhausted = 0x71,
    /// A register reached a category this crate cannot serve a read for.
    UnsupportedCategory = 0x75,
}

impl DoneWorkCode {
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Orchestrates stage transitions, termination conditions, and the
/// BBL-replay gate described above. Owns no peripheral state itself —
/// that stays in [`crate::store::PeripheralStore`] — only the counters
/// and thresholds that decide when a stage is done.
#[derive(Debug)]
pub struct StageController {
    stage: Stage,
    bbl_cnt: u64,
    cur_bbl_s: u32,
    cur_bbl_e: u32,
    bbls_since_finding: u64,
    target_bbl_cnt: Option<u64>,
    replay_bbl_cnt: Option<u64>,
    unexpected_sr_reads: u32,
    pi_started: bool,
    /// True for exactly the one basic block in which [`Self::pi_started`]
    /// flips from false to true — the BBL that triggered stage 1, where a
    /// CR_SR register's SR-way read must be served from `SR_r_file`
    /// before the rest of the dispatch path has otherwise switched over.
    /// Design Note 9's replacement for the original's `bbl_cnt--` "hack to
    /// make stage 2 work for CR_SR SR way": rather than rewinding the BBL
    /// counter, this flag marks the transition BBL explicitly so the
    /// dispatcher can special-case it without perturbing `bbl_cnt` itself.
    pub handle_hybrid_sr_way: bool,
    exploration_input: ExplorationInput,
}

impl StageController {
    pub fn new(stage: Stage) -> Self {
        StageController {
            stage,
            bbl_cnt: 0,
            cur_bbl_s: 0,
            cur_bbl_e: 0,
            bbls_since_finding: 0,
            target_bbl_cnt: None,
            replay_bbl_cnt: None,
            unexpected_sr_reads: 0,
            pi_started: false,
            handle_hybrid_sr_way: false,
            exploration_input: ExplorationInput::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn bbl_cnt(&self) -> u64 {
        self.bbl_cnt
    }

    pub fn cur_bbl_s(&self) -> u32 {
        self.cur_bbl_s
    }

    pub fn cur_bbl_e(&self) -> u32 {
        self.cur_bbl_e
    }

    /// Whether exploration has reached the BBL immediately preceding its
    /// target — the point at which DR reads start consuming the fuzzer
    /// input rather than being served SR-way (§4.C).
    pub fn pi_started(&self) -> bool {
        self.pi_started
    }

    /// Record stage 1's `target_bbl_cnt` (the BBL that triggered stage 1,
    /// loaded from its dump) for stage 2's replay gating. Any previously
    /// set fuzzer-input replay target is clamped to `target - 1` so
    /// replay never overshoots the triggering BBL.
    pub fn set_target_bbl_cnt(&mut self, target: u64) {
        self.target_bbl_cnt = Some(target);
        self.clamp_replay_to_target();
    }

    /// Record the stage-3 `access_to_unmodeled_peri.replay_bbl_cnt`
    /// value (or clear it, if the loaded model carried none).
    pub fn set_replay_bbl_cnt(&mut self, record: Option<&AccessRecord>) {
        self.replay_bbl_cnt = record.map(|r| r.replay_bbl_cnt);
        self.clamp_replay_to_target();
    }

    fn clamp_replay_to_target(&mut self) {
        if self.stage != Stage::SrRExplore {
            return;
        }
        if let (Some(replay), Some(target)) = (self.replay_bbl_cnt, self.target_bbl_cnt) {
            self.replay_bbl_cnt = Some(replay.min(target.saturating_sub(1)));
        }
    }

    /// Whether the controller is still replaying the guest up to
    /// `replay_bbl_cnt` before engaging normal stage behavior.
    pub fn in_replay(&self) -> bool {
        matches!(self.replay_bbl_cnt, Some(target) if self.bbl_cnt < target)
    }

    pub fn load_exploration_input(&mut self, path: &Path) -> Result<(), ModelError> {
        self.exploration_input.load(path)
    }

    pub fn next_exploration_word(&mut self) -> Option<u32> {
        self.exploration_input.next_word()
    }

    /// Advance the BBL counter at the start of a new basic block, and
    /// update `pi_started` for stage 2.
    pub fn on_bbl_begin(&mut self, bbl_s: u32) {
        self.bbl_cnt += 1;
        self.cur_bbl_s = bbl_s;
        if self.stage == Stage::SrRExplore {
            if let Some(target) = self.target_bbl_cnt {
                let was_started = self.pi_started;
                self.pi_started = self.bbl_cnt >= target.saturating_sub(1);
                self.handle_hybrid_sr_way = !was_started && self.pi_started;
            }
        } else {
            self.handle_hybrid_sr_way = false;
        }
    }

    pub fn on_bbl_end(&mut self, bbl_e: u32) {
        self.cur_bbl_e = bbl_e;
    }

    /// Stage 1: tick the "BBLs elapsed with no finding" clock forward.
    /// Call once per BBL that produces no fresh finding; a finding resets
    /// the clock via [`Self::record_finding`].
    pub fn tick_identify_idle(&mut self) {
        self.bbls_since_finding += 1;
    }

    pub fn should_terminate_identify(&self, cfg: &EngineConfig) -> bool {
        self.bbls_since_finding >= cfg.me_term_threshold
    }

    /// Build the stage-1 termination record for a fresh SR/CR_SR read
    /// with no matching event, and reset the idle-BBL clock.
    pub fn record_finding(
        &mut self,
        peripheral_base: u32,
        reg_idx: usize,
        cr_val: String,
        r_idx: Option<u32>,
    ) -> SrReadRecord {
        self.bbls_since_finding = 0;
        SrReadRecord {
            peripheral_base,
            reg_idx,
            cr_val,
            bbl_cnt: self.bbl_cnt,
            cur_bbl_s: self.cur_bbl_s,
            cur_bbl_e: self.cur_bbl_e,
            r_idx,
        }
    }

    /// Stage 2: the exploration input had nothing left (or this SR read
    /// wasn't the one the file is meant to drive). Returns whether stage
    /// 2 should now terminate.
    pub fn note_unexpected_sr_read(&mut self, cfg: &EngineConfig) -> bool {
        self.unexpected_sr_reads += 1;
        self.should_terminate_explore(cfg)
    }

    pub fn should_terminate_explore(&self, cfg: &EngineConfig) -> bool {
        self.bbl_cnt >= cfg.sr_r_worker_bbl_cnt_cap || self.unexpected_sr_reads > cfg.sr_r_thresh_hold
    }

    /// Stage 3: run the out-of-process model extractor after an unmodeled
    /// access. On success the caller reloads the model via
    /// `ModelCodec::load`; a failure here is always mapped to the fatal
    /// `ReloadFailed` variant (§7: "Reload failure is fatal").
    pub fn run_model_extractor(&self, extractor: &dyn ModelExtractor, run_num: u32) -> Result<(), ModelError> {
        extractor.run(run_num).map_err(|e| match e {
            ExtractorError::Io(err) => ModelError::ReloadFailed(err.to_string()),
            ExtractorError::NonZeroExit(msg) => ModelError::ReloadFailed(msg),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_terminates_after_idle_threshold_and_resets_on_finding() {
        let cfg = EngineConfig { me_term_threshold: 3, ..EngineConfig::default() };
        let mut sc = StageController::new(Stage::SrRId);
        sc.tick_identify_idle();
        sc.tick_identify_idle();
        assert!(!sc.should_terminate_identify(&cfg));
        sc.record_finding(0x4000_0000, 1, "0:0x1".into(), None);
        assert!(!sc.should_terminate_identify(&cfg));
        sc.tick_identify_idle();
        sc.tick_identify_idle();
        sc.tick_identify_idle();
        assert!(sc.should_terminate_identify(&cfg));
    }

    #[test]
    fn explore_terminates_at_bbl_cap() {
        let cfg = EngineConfig { sr_r_worker_bbl_cnt_cap: 2, ..EngineConfig::default() };
        let mut sc = StageController::new(Stage::SrRExplore);
        sc.on_bbl_begin(0x100);
        assert!(!sc.should_terminate_explore(&cfg));
        sc.on_bbl_begin(0x200);
        assert!(sc.should_terminate_explore(&cfg));
    }

    #[test]
    fn explore_terminates_past_unexpected_sr_read_threshold_not_at_it() {
        let cfg = EngineConfig { sr_r_thresh_hold: 2, ..EngineConfig::default() };
        let mut sc = StageController::new(Stage::SrRExplore);
        assert!(!sc.note_unexpected_sr_read(&cfg));
        assert!(!sc.note_unexpected_sr_read(&cfg));
        assert!(sc.note_unexpected_sr_read(&cfg));
    }

    #[test]
    fn replay_bbl_cnt_is_clamped_to_target_minus_one_for_explore() {
        let mut sc = StageController::new(Stage::SrRExplore);
        sc.set_replay_bbl_cnt(Some(&AccessRecord { replay_bbl_cnt: 50 }));
        sc.set_target_bbl_cnt(10);
        assert!(sc.in_replay());
        for _ in 0..9 {
            sc.on_bbl_begin(0x100);
        }
        assert!(!sc.in_replay());
    }

    #[test]
    fn pi_started_flips_one_bbl_before_target() {
        let mut sc = StageController::new(Stage::SrRExplore);
        sc.set_target_bbl_cnt(5);
        for _ in 0..3 {
            sc.on_bbl_begin(0x100);
            assert!(!sc.pi_started());
        }
        sc.on_bbl_begin(0x100); // bbl_cnt == 4 == target - 1
        assert!(sc.pi_started());
    }

    #[test]
    fn identify_stage_never_sets_pi_started() {
        let mut sc = StageController::new(Stage::SrRId);
        sc.set_target_bbl_cnt(1);
        sc.on_bbl_begin(0x100);
        assert!(!sc.pi_started());
    }

    #[test]
    fn handle_hybrid_sr_way_is_true_only_on_the_transition_bbl() {
        let mut sc = StageController::new(Stage::SrRExplore);
        sc.set_target_bbl_cnt(5);
        for _ in 0..3 {
            sc.on_bbl_begin(0x100);
            assert!(!sc.handle_hybrid_sr_way);
        }
        sc.on_bbl_begin(0x100); // bbl_cnt == 4 == target - 1: pi_started flips here.
        assert!(sc.pi_started());
        assert!(sc.handle_hybrid_sr_way);
        sc.on_bbl_begin(0x100);
        assert!(!sc.handle_hybrid_sr_way);
    }
}
