// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The register classification state machine: promotes a register's
//! [`Category`] from observed read/write patterns.

use crate::config::EngineConfig;
use crate::error::{Capacity, ModelError};
use crate::peripheral::Peripheral;
use crate::register::Category;
use crate::stage::Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
}

/// What the dispatcher should do to serve a read, decided by the
/// classifier from the register's post-transition category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDisposition {
    /// Hand off to the [`crate::event_model::EventModel`] — this is an
    /// SR-way read.
    ServeStatus,
    /// Hand off to the [`crate::input::InputFeeder`].
    ServeData,
    /// Return the register's last-written shadow value.
    ServeShadow,
}

/// Per-engine scratch state the classifier needs across accesses: the
/// previous access's address/kind/BBL-end, and the consecutive-same-
/// address-read counter.
#[derive(Debug, Default)]
pub struct RegisterClassifier {
    prev_addr: Option<u32>,
    prev_kind: Option<AccessKind>,
    prev_bbl_end: u32,
    consec_same_reg_r: u32,
}

impl RegisterClassifier {
    pub fn new() -> Self {
        RegisterClassifier::default()
    }

    /// End PC of the basic block containing the previous access.
    pub fn prev_bbl_end(&self) -> u32 {
        self.prev_bbl_end
    }

    /// Exposed for tests exercising the boundary behavior of the
    /// consecutive-read fix-up threshold.
    #[cfg(test)]
    pub(crate) fn consec_same_reg_r(&self) -> u32 {
        self.consec_same_reg_r
    }

    fn log_transition(addr: u32, idx: usize, from: Category, to: Category) {
        if from != to {
            log::debug!(
                target: "peri_model::classifier",
                "peripheral base={addr:#x} reg={idx} turns {from:?} into {to:?}"
            );
        }
    }

    /// Classify a read of `addr` (register `idx` within `peri`) and
    /// decide how the dispatcher should serve it.
    #[allow(clippy::too_many_arguments)]
    pub fn on_read(
        &mut self,
        peri: &mut Peripheral,
        idx: usize,
        addr: u32,
        stage: Stage,
        pi_started: bool,
        bbl_cnt: u64,
        cur_bbl_e: u32,
        cfg: &EngineConfig,
    ) -> Result<ReadDisposition, ModelError> {
        let same_addr_repeat =
            self.prev_addr == Some(addr) && self.prev_kind == Some(AccessKind::Read);
        if same_addr_repeat {
            self.consec_same_reg_r += 1;
        } else {
            self.consec_same_reg_r = 0;
        }

        let peri_base = peri.base_addr;
        let reg = peri.reg_mut(idx, cfg)?;
        reg.read = true;
        let before = reg.category;

        if reg.category == Category::Uncategorized {
            if stage == Stage::Fuzzing {
                // Categorization only runs during SR_R_ID/SR_R_EXPLORE; a
                // register still Uncategorized here was never touched by
                // a prior identify/explore run.
                return Err(ModelError::UncategorizedAccess { peripheral_base: peri_base, reg_idx: idx });
            }
            reg.category = if stage == Stage::SrRExplore && pi_started {
                Category::Data
            } else {
                Category::Status
            };
        }

        if self.consec_same_reg_r > cfg.consec_non_sr_r_threshold {
            match reg.category {
                Category::Control => {
                    reg.category = Category::ControlStatus;
                    reg.sr_locked = true;
                }
                Category::Data => {
                    reg.category = Category::Status;
                    reg.sr_locked = true;
                    reg.sr_cat_by_fixup = true;
                    self.consec_same_reg_r = 0;
                }
                Category::ControlStatus => {
                    // Category unchanged; this read is still handled SR-way below.
                }
                Category::Status => {
                    Self::log_transition(addr, idx, before, reg.category);
                    return Err(ModelError::SrHang { peripheral_base: peri.base_addr, reg_idx: idx });
                }
                Category::Uncategorized => unreachable!("promoted above"),
            }
        }

        Self::log_transition(addr, idx, before, reg.category);

        if matches!(reg.category, Category::Control | Category::ControlStatus) {
            reg.bump_r_idx_in_bbl(bbl_cnt);
        }

        self.prev_addr = Some(addr);
        self.prev_kind = Some(AccessKind::Read);
        self.prev_bbl_end = cur_bbl_e;

        let disposition = match reg.category {
            Category::Control => ReadDisposition::ServeShadow,
            Category::Data => ReadDisposition::ServeData,
            Category::Status | Category::ControlStatus => {
                if reg.already_served_sr_this_bbl(bbl_cnt) {
                    ReadDisposition::ServeShadow
                } else {
                    if peri.cur_bbl_sr_r_num >= cfg.max_sr_per_bbl {
                        return Err(ModelError::CapacityExceeded(Capacity::SrsPerBbl));
                    }
                    peri.cur_bbl_sr_r_num += 1;
                    peri.reg_mut(idx, cfg)?.mark_sr_served(bbl_cnt);
                    ReadDisposition::ServeStatus
                }
            }
            Category::Uncategorized => unreachable!("promoted above"),
        };
        Ok(disposition)
    }

    /// Classify a write of `value` (sized `size`) to register `idx`
    /// within `peri`. Returns the post-transition category so the
    /// dispatcher knows whether to update the shadow value.
    pub fn on_write(
        &mut self,
        peri: &mut Peripheral,
        idx: usize,
        addr: u32,
        stage: Stage,
        cfg: &EngineConfig,
    ) -> Result<Category, ModelError> {
        let prev_was_read_here = self.prev_addr == Some(addr) && self.prev_kind == Some(AccessKind::Read);

        let peri_base = peri.base_addr;
        let reg = peri.reg_mut(idx, cfg)?;
        reg.write = true;
        let before = reg.category;

        if reg.category == Category::Uncategorized {
            if stage == Stage::Fuzzing {
                return Err(ModelError::UncategorizedAccess { peripheral_base: peri_base, reg_idx: idx });
            }
            reg.category = Category::Data;
        } else if prev_was_read_here && stage != Stage::SrRExplore && !reg.sr_locked {
            reg.category = Category::Control;
            if stage == Stage::SrRId && peri.cur_bbl_sr_r_num > 0 {
                peri.cur_bbl_sr_r_num -= 1;
            }
        }

        Self::log_transition(addr, idx, before, reg.category);

        self.prev_addr = Some(addr);
        self.prev_kind = Some(AccessKind::Write);

        Ok(reg.category)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> (RegisterClassifier, Peripheral, EngineConfig) {
        let cfg = EngineConfig::default();
        let peri = Peripheral::new(0x4000_0000, &cfg);
        (RegisterClassifier::new(), peri, cfg)
    }

    #[test]
    fn uc_promotes_to_status_in_identify_stage() {
        let (mut c, mut peri, cfg) = fresh();
        let d = c
            .on_read(&mut peri, 0, 0x4000_0000, Stage::SrRId, false, 1, 0x100, &cfg)
            .unwrap();
        assert_eq!(d, ReadDisposition::ServeStatus);
        assert_eq!(peri.reg(0).unwrap().category, Category::Status);
        assert_eq!(peri.cur_bbl_sr_r_num, 1);
    }

    #[test]
    fn uc_promotes_to_data_when_exploring_after_pi_started() {
        let (mut c, mut peri, cfg) = fresh();
        let d = c
            .on_read(&mut peri, 0, 0x4000_0000, Stage::SrRExplore, true, 1, 0x100, &cfg)
            .unwrap();
        assert_eq!(d, ReadDisposition::ServeData);
        assert_eq!(peri.reg(0).unwrap().category, Category::Data);
    }

    #[test]
    fn rmw_demotes_status_to_control() {
        let (mut c, mut peri, cfg) = fresh();
        c.on_read(&mut peri, 0, 0x4000_0000, Stage::SrRId, false, 1, 0x100, &cfg).unwrap();
        assert_eq!(peri.cur_bbl_sr_r_num, 1);

        let cat = c.on_write(&mut peri, 0, 0x4000_0000, Stage::SrRId, &cfg).unwrap();
        assert_eq!(cat, Category::Control);
        assert_eq!(peri.cur_bbl_sr_r_num, 0);
        peri.reg_mut(0, &cfg).unwrap().write_shadow(4, 0x1);

        let d = c
            .on_read(&mut peri, 0, 0x4000_0000, Stage::SrRId, false, 1, 0x100, &cfg)
            .unwrap();
        assert_eq!(d, ReadDisposition::ServeShadow);
        assert_eq!(peri.reg(0).unwrap().shadow_value(4), 0x1);
    }

    #[test]
    fn rmw_demotes_data_and_unlocked_control_status_to_control() {
        let (mut c, mut peri, cfg) = fresh();
        peri.reg_mut(0, &cfg).unwrap().category = Category::Data;
        let cat = c.on_write(&mut peri, 0, 0x4000_0000, Stage::SrRId, &cfg).unwrap();
        // No preceding read at this address: no demotion yet.
        assert_eq!(cat, Category::Data);

        c.on_read(&mut peri, 0, 0x4000_0000, Stage::SrRId, false, 1, 0x100, &cfg).unwrap();
        let cat = c.on_write(&mut peri, 0, 0x4000_0000, Stage::SrRId, &cfg).unwrap();
        assert_eq!(cat, Category::Control);

        peri.reg_mut(1, &cfg).unwrap().category = Category::ControlStatus;
        c.on_read(&mut peri, 1, 0x4000_0004, Stage::SrRId, false, 1, 0x100, &cfg).unwrap();
        let cat = c.on_write(&mut peri, 1, 0x4000_0004, Stage::SrRId, &cfg).unwrap();
        assert_eq!(cat, Category::Control);
    }

    #[test]
    fn rmw_demotion_does_not_decrement_cur_bbl_sr_r_num_outside_identify() {
        let (mut c, mut peri, cfg) = fresh();
        c.on_read(&mut peri, 0, 0x4000_0000, Stage::SrRExplore, true, 1, 0x100, &cfg).unwrap();
        peri.reg_mut(0, &cfg).unwrap().category = Category::Status;
        peri.cur_bbl_sr_r_num = 1;
        c.on_write(&mut peri, 0, 0x4000_0000, Stage::Fuzzing, &cfg).unwrap();
        assert_eq!(peri.cur_bbl_sr_r_num, 1);
    }

    #[test]
    fn rmw_leaves_locked_sr_category_unchanged() {
        let (mut c, mut peri, cfg) = fresh();
        {
            let reg = peri.reg_mut(0, &cfg).unwrap();
            reg.category = Category::Status;
            reg.sr_locked = true;
        }
        c.on_read(&mut peri, 0, 0x4000_0000, Stage::SrRId, false, 1, 0x100, &cfg).unwrap();
        let cat = c.on_write(&mut peri, 0, 0x4000_0000, Stage::SrRId, &cfg).unwrap();
        assert_eq!(cat, Category::Status);
    }

    #[test]
    fn consecutive_reads_at_threshold_do_not_fix_up() {
        let (mut c, mut peri, cfg) = fresh();
        // First read: UC -> Data via a write, then repeated reads.
        c.on_write(&mut peri, 0, 0x4000_0000, Stage::SrRId, &cfg).unwrap();
        for _ in 0..=cfg.consec_non_sr_r_threshold {
            c.on_read(&mut peri, 0, 0x4000_0000, Stage::SrRId, false, 1, 0x100, &cfg)
                .unwrap();
        }
        assert_eq!(c.consec_same_reg_r(), cfg.consec_non_sr_r_threshold);
        assert_eq!(peri.reg(0).unwrap().category, Category::Data);
        assert!(!peri.reg(0).unwrap().sr_locked);
    }

    #[test]
    fn consecutive_reads_past_threshold_fix_up_dr_to_sr() {
        let (mut c, mut peri, cfg) = fresh();
        c.on_write(&mut peri, 0, 0x4000_0000, Stage::SrRId, &cfg).unwrap();
        for _ in 0..=(cfg.consec_non_sr_r_threshold + 1) {
            c.on_read(&mut peri, 0, 0x4000_0000, Stage::SrRId, false, 1, 0x100, &cfg)
                .unwrap();
        }
        let reg = peri.reg(0).unwrap();
        assert_eq!(reg.category, Category::Status);
        assert!(reg.sr_locked);
        assert!(reg.sr_cat_by_fixup);
        assert_eq!(c.consec_same_reg_r(), 0);
    }

    #[test]
    fn locked_status_read_loop_is_fatal() {
        let (mut c, mut peri, cfg) = fresh();
        {
            let reg = peri.reg_mut(0, &cfg).unwrap();
            reg.category = Category::Status;
            reg.sr_locked = true;
        }
        for _ in 0..cfg.consec_non_sr_r_threshold {
            c.on_read(&mut peri, 0, 0x4000_0000, Stage::SrRId, false, 1, 0x100, &cfg)
                .unwrap();
        }
        let err = c
            .on_read(&mut peri, 0, 0x4000_0000, Stage::SrRId, false, 1, 0x100, &cfg)
            .unwrap_err();
        assert!(matches!(err, ModelError::SrHang { .. }));
    }

    #[test]
    fn uc_access_during_fuzzing_is_fatal_instead_of_promoting() {
        let (mut c, mut peri, cfg) = fresh();
        let err = c
            .on_read(&mut peri, 0, 0x4000_0000, Stage::Fuzzing, false, 1, 0x100, &cfg)
            .unwrap_err();
        assert!(matches!(err, ModelError::UncategorizedAccess { reg_idx: 0, .. }));
        assert_eq!(peri.reg(0).unwrap().category, Category::Uncategorized);

        let err = c.on_write(&mut peri, 1, 0x4000_0004, Stage::Fuzzing, &cfg).unwrap_err();
        assert!(matches!(err, ModelError::UncategorizedAccess { reg_idx: 1, .. }));
    }

    #[test]
    fn only_first_sr_read_in_a_bbl_is_served_from_model() {
        let (mut c, mut peri, cfg) = fresh();
        let first = c
            .on_read(&mut peri, 0, 0x4000_0000, Stage::SrRId, false, 5, 0x100, &cfg)
            .unwrap();
        let second = c
            .on_read(&mut peri, 0, 0x4000_0000, Stage::SrRId, false, 5, 0x100, &cfg)
            .unwrap();
        assert_eq!(first, ReadDisposition::ServeStatus);
        assert_eq!(second, ReadDisposition::ServeShadow);
    }
}
