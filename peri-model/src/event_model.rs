// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Looking up and serving the learned status-register satisfaction
//! model. Learning the satisfying bit combinations themselves happens
//! offline (the out-of-scope Python model-extractor, Design Note "JSON
//! for the learned model"); this crate only computes the lookup key and
//! round-robins through whatever combinations were loaded.

use crate::config::EngineConfig;
use crate::error::ModelError;
use crate::peripheral::Peripheral;
use crate::register::Category;

/// Stateless component wrapping the CR_val/event lookup and SR-read
/// serving rules (§4.D).
pub struct EventModel;

impl EventModel {
    /// The canonical `CR_val` snapshot for `peri`'s current CR/CR_SR
    /// register state.
    pub fn cr_val(peri: &Peripheral, cfg: &EngineConfig) -> Result<String, ModelError> {
        peri.cr_val_snapshot(cfg)
    }

    /// Serve an SR read of `reg_idx` within `peri` at basic-block end
    /// `bbl_e`. Returns 0 (not an error) when no event matches — the
    /// engine has not yet learned this SRRS's satisfying bits.
    pub fn read(peri: &mut Peripheral, reg_idx: usize, bbl_e: u32, cfg: &EngineConfig) -> Result<u32, ModelError> {
        let (category, r_idx_in_bbl) = {
            let reg = peri.reg(reg_idx).ok_or(ModelError::UnsupportedCategory)?;
            (reg.category, reg.r_idx_in_bbl)
        };
        let cr_val = peri.cr_val_snapshot(cfg)?;
        let want_r_idx = match category {
            Category::ControlStatus => Some(r_idx_in_bbl),
            _ => None,
        };
        match peri.find_event_mut(&cr_val, bbl_e, want_r_idx) {
            Some(event) => {
                let value = event.serve();
                log::trace!(
                    target: "peri_model::event_model",
                    "serving SR read peripheral={:#x} reg={reg_idx} bbl_e={bbl_e:#x} value={value:#x}",
                    peri.base_addr
                );
                Ok(value)
            }
            None => {
                log::trace!(
                    target: "peri_model::event_model",
                    "no event for peripheral={:#x} reg={reg_idx} cr_val={cr_val:?} bbl_e={bbl_e:#x}",
                    peri.base_addr
                );
                Ok(0)
            }
        }
    }

    /// Whether an event already exists for this read site — used by
    /// stage 1 to decide if a newly-observed SR read is a fresh SRRS
    /// worth recording.
    pub fn has_event(peri: &mut Peripheral, reg_idx: usize, bbl_e: u32, cfg: &EngineConfig) -> Result<bool, ModelError> {
        let (category, r_idx_in_bbl) = {
            let reg = peri.reg(reg_idx).ok_or(ModelError::UnsupportedCategory)?;
            (reg.category, reg.r_idx_in_bbl)
        };
        let cr_val = peri.cr_val_snapshot(cfg)?;
        let want_r_idx = match category {
            Category::ControlStatus => Some(r_idx_in_bbl),
            _ => None,
        };
        Ok(peri.find_event_mut(&cr_val, bbl_e, want_r_idx).is_some())
    }
}
