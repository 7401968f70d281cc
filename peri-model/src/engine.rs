// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! `Engine`: the single handle an embedding emulator drives. Composes
//! every other module behind the two MMIO entry points
//! (`read`/`write`) and the two basic-block boundary hooks
//! (`on_bbl_begin`/`on_bbl_end`) — the crate's only public surface for
//! the guest-facing side; model persistence and stage-3 recovery are the
//! remaining public methods, invoked by the host around those hooks.

use std::path::{Path, PathBuf};

use crate::classifier::{ReadDisposition, RegisterClassifier};
use crate::codec::{AccessRecord, LoadedModel, ModelCodec, SrReadRecord};
use crate::config::EngineConfig;
use crate::error::ModelError;
use crate::event_model::EventModel;
use crate::host::{DoneWorkCode, HostOps, ModelExtractor};
use crate::input::InputFeeder;
use crate::interrupt::InterruptScheduler;
use crate::register::Category;
use crate::stage::{Stage, StageController};
use crate::store::PeripheralStore;

/// Maps an internal failure to the nearest-fitting `done_work` code. Most
/// of this crate's error variants correspond to a historical process
/// exit code (`ModelError::legacy_exit_code`) that has no matching entry
/// in the narrower `doneWork` vocabulary; those fall back to
/// `UnsupportedCategory` as a generic "fatal, host should exit" signal.
fn done_work_code_for(err: &ModelError) -> DoneWorkCode {
    match err {
        ModelError::InputExhausted => DoneWorkCode::InputExhausted,
        ModelError::Io(_) => DoneWorkCode::InputIoError,
        ModelError::UncategorizedAccess { .. } => DoneWorkCode::UncategorizedRegister,
        _ => DoneWorkCode::UnsupportedCategory,
    }
}

/// The engine's complete owned state: every peripheral, the classifier's
/// cross-access scratch, the interrupt table, the fuzzer/exploration
/// input cursors, and the active stage — plus the host upcall
/// implementation and the model file path. One `Engine` is meant to be
/// owned exclusively by whatever single call site drives the guest (see
/// the concurrency model: nothing here is `Sync`).
pub struct Engine<H: HostOps> {
    cfg: EngineConfig,
    store: PeripheralStore,
    classifier: RegisterClassifier,
    interrupts: InterruptScheduler,
    input: InputFeeder,
    stage: StageController,
    host: H,
    model_path: PathBuf,
    pending_sr_read: Option<SrReadRecord>,
    access_record: Option<AccessRecord>,
}

impl<H: HostOps> Engine<H> {
    pub fn new(cfg: EngineConfig, host: H, model_path: impl Into<PathBuf>, stage: Stage) -> Self {
        Engine {
            cfg,
            store: PeripheralStore::new(),
            classifier: RegisterClassifier::new(),
            interrupts: InterruptScheduler::new(),
            input: InputFeeder::new(),
            stage: StageController::new(stage),
            host,
            model_path: model_path.into(),
            pending_sr_read: None,
            access_record: None,
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn stage(&self) -> Stage {
        self.stage.stage()
    }

    /// Load the fuzzer input file (stage 3, or stage 1/2 with a supplied
    /// input) into the bounded data-register feed.
    pub fn load_fuzzer_input(&mut self, path: &Path) -> Result<(), ModelError> {
        self.input.load(path, self.cfg.input_buf_cap)
    }

    /// Load stage 2's `SR_r_file` exploration values.
    pub fn load_exploration_input(&mut self, path: &Path) -> Result<(), ModelError> {
        self.stage.load_exploration_input(path)
    }

    /// Load the persisted model at `model_path`, replacing all current
    /// peripheral/interrupt state and re-deriving the stage's replay
    /// gating from whichever stage-specific record was present.
    pub fn load_model(&mut self) -> Result<(), ModelError> {
        let LoadedModel { store, interrupts, sr_read, access_to_unmodeled_peri } =
            ModelCodec::load(&self.model_path, &self.cfg)?;
        self.store = store;
        self.interrupts = interrupts;
        if let Some(sr_read) = &sr_read {
            self.stage.set_target_bbl_cnt(sr_read.bbl_cnt);
        }
        self.stage.set_replay_bbl_cnt(access_to_unmodeled_peri.as_ref());
        self.pending_sr_read = sr_read;
        self.access_record = access_to_unmodeled_peri;
        Ok(())
    }

    /// Dump the current model to `model_path`, atomically.
    pub fn dump_model(&self) -> Result<(), ModelError> {
        ModelCodec::dump(
            &self.model_path,
            &self.store,
            &self.interrupts,
            self.pending_sr_read.as_ref(),
            self.access_record.as_ref(),
        )
    }

    /// Stage 3 recovery: run the out-of-process model extractor for an
    /// unmodeled access, then reload the model it wrote. Called by the
    /// host at the start of the worker that resumes after a
    /// `DoneWorkCode::UnmodeledSrrs`/`UncategorizedRegister` upcall.
    pub fn recover_from_unmodeled_access(
        &mut self,
        extractor: &dyn ModelExtractor,
        run_num: u32,
    ) -> Result<(), ModelError> {
        self.stage.run_model_extractor(extractor, run_num)?;
        self.load_model()
    }

    fn fatal(&self, err: ModelError) -> ! {
        log::error!(target: "peri_model::dispatcher", "fatal: {err}");
        self.host.done_work(done_work_code_for(&err))
    }

    /// The single MMIO read entry point. `None` means "not our address";
    /// the host's own unassigned-access handler should run instead.
    pub fn read(&mut self, addr: u32, size: u32) -> Option<u64> {
        if !self.cfg.in_peripheral_range(addr) {
            return None;
        }
        let base = self.cfg.base_addr_of(addr);
        let reg_size = {
            let peri = self.store.get_or_create(base, &self.cfg);
            if peri.reg_size.is_none() {
                peri.reg_size = Some(size.max(1));
            }
            peri.reg_size.unwrap_or(size.max(1))
        };
        let reg_idx = ((addr - base) / reg_size) as usize;

        let stage = self.stage.stage();
        let pi_started = self.stage.pi_started();
        let bbl_cnt = self.stage.bbl_cnt();
        let cur_bbl_e = self.stage.cur_bbl_e();

        let disposition = {
            let peri = self.store.get_mut(base).expect("just created");
            match self.classifier.on_read(peri, reg_idx, addr, stage, pi_started, bbl_cnt, cur_bbl_e, &self.cfg) {
                Ok(d) => d,
                Err(e) => self.fatal(e),
            }
        };

        let value: u32 = match disposition {
            ReadDisposition::ServeShadow => {
                let peri = self.store.get(base).expect("present");
                peri.reg(reg_idx).map(|r| r.shadow_value(reg_size)).unwrap_or(0)
            }
            ReadDisposition::ServeData => {
                let dr_bytes = self.store.get(base).map(|p| p.dr_bytes_num).unwrap_or(self.cfg.dr_bytes_num_default);
                match self.input.read(dr_bytes) {
                    Ok(v) => v,
                    Err(e) => self.fatal(e),
                }
            }
            ReadDisposition::ServeStatus => self.serve_status(base, reg_idx),
        };

        if matches!(stage, Stage::SrRId | Stage::SrRExplore) && pi_started {
            log::trace!(
                target: "peri_model::reg_access",
                "addr={addr:#x} direction=read value={value:#x} bbl_start={:#x} bbl_end={cur_bbl_e:#x} symbol={:?}",
                self.stage.cur_bbl_s(),
                self.host.lookup_symbol(addr)
            );
        }

        Some(value as u64)
    }

    fn serve_status(&mut self, base: u32, reg_idx: usize) -> u32 {
        let bbl_e = self.stage.cur_bbl_e();
        match self.stage.stage() {
            Stage::SrRId => {
                let has_event = {
                    let peri = self.store.get_mut(base).expect("present");
                    EventModel::has_event(peri, reg_idx, bbl_e, &self.cfg).unwrap_or(false)
                };
                if has_event {
                    let peri = self.store.get_mut(base).expect("present");
                    return EventModel::read(peri, reg_idx, bbl_e, &self.cfg).unwrap_or(0);
                }
                let (cr_val, r_idx) = {
                    let peri = self.store.get_mut(base).expect("present");
                    let cr_val = peri.cr_val_snapshot(&self.cfg).unwrap_or_default();
                    let r_idx = peri.reg(reg_idx).map(|r| r.r_idx_in_bbl);
                    (cr_val, r_idx)
                };
                let record = self.stage.record_finding(base, reg_idx, cr_val, r_idx);
                log::info!(target: "peri_model::dispatcher", "stage-1 finding peripheral={base:#x} reg={reg_idx}");
                self.pending_sr_read = Some(record);
                if let Err(e) = self.dump_model() {
                    log::error!(target: "peri_model::dispatcher", "failed to dump model at stage-1 exit: {e}");
                }
                self.host.done_work(DoneWorkCode::IdentifyDone)
            }
            Stage::SrRExplore => {
                if self.stage.handle_hybrid_sr_way {
                    log::debug!(
                        target: "peri_model::dispatcher",
                        "hybrid CR_SR SR-way read at peripheral={base:#x} reg={reg_idx} on the stage-2 transition BBL"
                    );
                }
                if self.stage.in_replay() || !self.stage.pi_started() {
                    let peri = self.store.get_mut(base).expect("present");
                    return EventModel::read(peri, reg_idx, bbl_e, &self.cfg).unwrap_or(0);
                }
                match self.stage.next_exploration_word() {
                    Some(word) => word,
                    None => {
                        let terminate = self.stage.note_unexpected_sr_read(&self.cfg);
                        if terminate {
                            log::warn!(
                                target: "peri_model::dispatcher",
                                "stage-2 exploration exhausted with unexpected SR reads outstanding"
                            );
                            if let Err(e) = self.dump_model() {
                                log::error!(target: "peri_model::dispatcher", "failed to dump model at stage-2 exit: {e}");
                            }
                            return self.host.done_work(DoneWorkCode::IdentifyDone);
                        }
                        0
                    }
                }
            }
            Stage::Fuzzing => {
                let has_event = {
                    let peri = self.store.get_mut(base).expect("present");
                    EventModel::has_event(peri, reg_idx, bbl_e, &self.cfg).unwrap_or(false)
                };
                if has_event {
                    let peri = self.store.get_mut(base).expect("present");
                    return EventModel::read(peri, reg_idx, bbl_e, &self.cfg).unwrap_or(0);
                }
                log::warn!(target: "peri_model::dispatcher", "unmodeled SRRS at peripheral={base:#x} reg={reg_idx}");
                self.access_record = Some(AccessRecord { replay_bbl_cnt: self.stage.bbl_cnt() });
                if let Err(e) = self.dump_model() {
                    log::error!(target: "peri_model::dispatcher", "failed to dump model before recovery upcall: {e}");
                }
                self.host.done_work(DoneWorkCode::UnmodeledSrrs)
            }
        }
    }

    /// The single MMIO write entry point. `false` means "not our
    /// address".
    pub fn write(&mut self, addr: u32, size: u32, value: u64) -> bool {
        if !self.cfg.in_peripheral_range(addr) {
            return false;
        }
        let base = self.cfg.base_addr_of(addr);
        let stage = self.stage.stage();

        let reg_size = {
            let peri = self.store.get_or_create(base, &self.cfg);
            if peri.reg_size.is_none() {
                peri.reg_size = Some(size.max(1));
            }
            peri.reg_size.unwrap_or(size.max(1))
        };
        let reg_idx = ((addr - base) / reg_size) as usize;

        let category = {
            let peri = self.store.get_mut(base).expect("just created");
            match self.classifier.on_write(peri, reg_idx, addr, stage, &self.cfg) {
                Ok(c) => c,
                Err(e) => self.fatal(e),
            }
        };

        if matches!(category, Category::Control | Category::ControlStatus) {
            let peri = self.store.get_mut(base).expect("present");
            if let Ok(reg) = peri.reg_mut(reg_idx, &self.cfg) {
                reg.write_shadow(reg_size, value as u32);
            }
        }

        if matches!(stage, Stage::SrRId | Stage::SrRExplore) && self.stage.pi_started() {
            log::trace!(
                target: "peri_model::reg_access",
                "addr={addr:#x} direction=write value={value:#x} bbl_start={:#x} bbl_end={:#x} symbol={:?}",
                self.stage.cur_bbl_s(),
                self.stage.cur_bbl_e(),
                self.host.lookup_symbol(addr)
            );
        }
        true
    }

    /// Advance `bbl_cnt`, reset per-BBL peripheral bookkeeping, and check
    /// stage 1's idle-termination clock.
    pub fn on_bbl_begin(&mut self, pc_start: u32) {
        self.stage.on_bbl_begin(pc_start);
        for peri in self.store.iter_mut() {
            peri.begin_bbl();
        }
        match self.stage.stage() {
            Stage::SrRId => {
                if self.pending_sr_read.is_none() {
                    self.stage.tick_identify_idle();
                }
                if self.stage.should_terminate_identify(&self.cfg) {
                    log::info!(target: "peri_model::dispatcher", "stage-1 idle threshold reached, terminating");
                    if let Err(e) = self.dump_model() {
                        log::error!(target: "peri_model::dispatcher", "failed to dump model at idle stage-1 exit: {e}");
                    }
                    self.host.done_work(DoneWorkCode::IdentifyDone);
                } else if self.interrupts.has_completed_round(&self.cfg) {
                    log::info!(target: "peri_model::dispatcher", "every enabled interrupt has fired at least once, terminating stage 1");
                    if let Err(e) = self.dump_model() {
                        log::error!(target: "peri_model::dispatcher", "failed to dump model at stage-1 exit: {e}");
                    }
                    self.host.done_work(DoneWorkCode::IdentifyDone);
                }
            }
            Stage::SrRExplore => {
                if self.stage.should_terminate_explore(&self.cfg) {
                    log::info!(target: "peri_model::dispatcher", "stage-2 bbl cap or unexpected-SR-read threshold reached, terminating");
                    if let Err(e) = self.dump_model() {
                        log::error!(target: "peri_model::dispatcher", "failed to dump model at stage-2 bbl-cap exit: {e}");
                    }
                    self.host.done_work(DoneWorkCode::IdentifyDone);
                }
            }
            Stage::Fuzzing => {}
        }
    }

    /// Update `cur_bbl_e` and drive the interrupt scheduler: every BBL
    /// boundary during modeling, every `fuzzing_int_freq` BBLs during
    /// fuzzing.
    pub fn on_bbl_end(&mut self, pc_end: u32) {
        self.stage.on_bbl_end(pc_end);
        match self.stage.stage() {
            Stage::SrRId | Stage::SrRExplore => {
                self.interrupts.fire(&self.host);
            }
            Stage::Fuzzing => {
                let bbl_cnt = self.stage.bbl_cnt();
                if bbl_cnt > 0 && bbl_cnt % self.cfg.fuzzing_int_freq == 0 {
                    self.interrupts.fire(&self.host);
                }
            }
        }
    }
}
