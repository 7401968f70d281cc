// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! A peripheral's register bank and its learned SR-satisfaction events.

use crate::config::EngineConfig;
use crate::error::{Capacity, ModelError};
use crate::register::Register;

/// One satisfying bit combination for a single status register
/// participating in an event: the bit indices to set (or, if `set` is
/// false, to clear) on the next poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatisfyEntry {
    pub set: bool,
    pub bits: Vec<u8>,
}

/// A learned `(CR_val, bbl_e) -> satisfying bit combinations` entry: the
/// core unit of the status-register satisfaction model.
#[derive(Debug, Clone)]
pub struct Event {
    /// The canonical CR/CR_SR snapshot this event is keyed on.
    pub cr_val: String,
    /// End PC of the basic block containing the SR read this event serves.
    pub bbl_e: u32,
    /// Number of status registers participating in one satisfying
    /// combination (1..=3).
    pub sr_num: usize,
    /// Which in-block CR_SR read index this event applies to, when the
    /// register being served is a hybrid CR_SR rather than a plain SR.
    pub r_idx: Option<u32>,
    /// `satisfy[k][s]` is the combination index `k`'s entry for
    /// participating status register `s`.
    pub satisfy: Vec<Vec<SatisfyEntry>>,
    cur_satisfy: usize,
    cur_sr: usize,
}

impl Event {
    pub fn new(cr_val: String, bbl_e: u32, sr_num: usize, r_idx: Option<u32>) -> Self {
        Event {
            cr_val,
            bbl_e,
            sr_num,
            r_idx,
            satisfy: Vec::new(),
            cur_satisfy: 0,
            cur_sr: 0,
        }
    }

    pub fn satisfy_num(&self) -> usize {
        self.satisfy.len()
    }

    pub fn push_combination(&mut self, cfg: &EngineConfig, combo: Vec<SatisfyEntry>) -> Result<(), ModelError> {
        if self.satisfy.len() >= cfg.max_satisfy_num {
            return Err(ModelError::CapacityExceeded(Capacity::SatisfyCombinations));
        }
        self.satisfy.push(combo);
        Ok(())
    }

    /// Serve one SR read from this event and advance the round-robin
    /// cursor. Returns 0 if no satisfying combination has been learned
    /// yet, matching `pm_SR_read`'s `satisfy_num == 0` behavior.
    pub fn serve(&mut self) -> u32 {
        if self.satisfy_num() == 0 {
            return 0;
        }
        let combo = &self.satisfy[self.cur_satisfy];
        let entry = &combo[self.cur_sr.min(combo.len().saturating_sub(1))];
        let mut value = 0u32;
        if entry.set {
            for &bit in &entry.bits {
                value |= 1 << bit;
            }
        }
        self.cur_sr += 1;
        if self.cur_sr >= self.sr_num {
            self.cur_sr = 0;
            self.cur_satisfy = (self.cur_satisfy + 1) % self.satisfy_num();
        }
        value
    }

    /// Cursor position, exposed for the round-robin-period test property.
    pub fn cursor(&self) -> (usize, usize) {
        (self.cur_satisfy, self.cur_sr)
    }
}

/// A contiguous bank of MMIO registers sharing a base address.
#[derive(Debug, Clone)]
pub struct Peripheral {
    pub base_addr: u32,
    /// Byte width of a single register; inferred from the first access
    /// and constant thereafter.
    pub reg_size: Option<u32>,
    pub dr_bytes_num: u32,
    pub max_reg_idx: usize,
    regs: Vec<Register>,
    events: Vec<Event>,
    /// SR reads served as SR within the current basic block; reset at
    /// every `on_bbl_begin`.
    pub cur_bbl_sr_r_num: u32,
}

impl Peripheral {
    pub fn new(base_addr: u32, cfg: &EngineConfig) -> Self {
        Peripheral {
            base_addr,
            reg_size: None,
            dr_bytes_num: cfg.dr_bytes_num_default,
            max_reg_idx: 0,
            regs: Vec::new(),
            events: Vec::new(),
            cur_bbl_sr_r_num: 0,
        }
    }

    pub fn reg(&self, idx: usize) -> Option<&Register> {
        self.regs.get(idx)
    }

    pub fn reg_mut(&mut self, idx: usize, cfg: &EngineConfig) -> Result<&mut Register, ModelError> {
        if idx >= cfg.max_reg_num {
            return Err(ModelError::CapacityExceeded(Capacity::Registers));
        }
        if idx >= self.regs.len() {
            self.regs.resize_with(idx + 1, Register::default);
        }
        self.max_reg_idx = self.max_reg_idx.max(idx);
        Ok(&mut self.regs[idx])
    }

    pub fn regs(&self) -> &[Register] {
        &self.regs
    }

    /// The canonical `CR_val` snapshot: every CR/CR_SR register's current
    /// value, ascending index order, `"<idx>:0x<hex>"` joined by `,`.
    pub fn cr_val_snapshot(&self, cfg: &EngineConfig) -> Result<String, ModelError> {
        use crate::register::Category;
        use std::fmt::Write;

        let reg_size = self.reg_size.unwrap_or(4);
        let mut out = String::new();
        for (idx, reg) in self.regs.iter().enumerate() {
            if matches!(reg.category, Category::Control | Category::ControlStatus) {
                if !out.is_empty() {
                    out.push(',');
                }
                let _ = write!(out, "{}:0x{:x}", idx, reg.shadow_value(reg_size));
                if out.len() > cfg.max_cr_val_bytes {
                    return Err(ModelError::CapacityExceeded(Capacity::CrValBytes));
                }
            }
        }
        Ok(out)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut Vec<Event> {
        &mut self.events
    }

    /// `r_idx` is the *querying* register's r-index: `None` for a plain SR
    /// read (eligible for any stored event regardless of the event's own
    /// `r_idx`), `Some(idx)` for a CR_SR read (requires an exact match
    /// against the event's `r_idx`, no wildcard).
    pub fn find_event_mut(&mut self, cr_val: &str, bbl_e: u32, r_idx: Option<u32>) -> Option<&mut Event> {
        self.events.iter_mut().find(|e| {
            e.cr_val == cr_val
                && e.bbl_e == bbl_e
                && match r_idx {
                    None => true,
                    Some(want) => e.r_idx == Some(want),
                }
        })
    }

    pub fn add_event(&mut self, cfg: &EngineConfig, event: Event) -> Result<(), ModelError> {
        if self.events.len() >= cfg.max_evt_num {
            return Err(ModelError::CapacityExceeded(Capacity::Events));
        }
        if event.sr_num == 0 || event.sr_num > cfg.max_bit_comb_sz {
            return Err(ModelError::CapacityExceeded(Capacity::SrNum));
        }
        self.events.push(event);
        Ok(())
    }

    /// Reset per-BBL bookkeeping. Called from `on_bbl_begin`.
    pub fn begin_bbl(&mut self) {
        self.cur_bbl_sr_r_num = 0;
    }
}
