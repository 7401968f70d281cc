// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Run-time tunable capacities and thresholds for the modeling engine.
//!
//! The original implementation hardcoded every one of these as a C
//! preprocessor constant. This crate keeps the same default values but
//! threads them through an [`EngineConfig`] value instead, so a host
//! embedding a non-Cortex-M target (a different MMIO window, a wider
//! register bank) can override them without patching the crate.

/// Tunable capacities and thresholds used throughout the engine.
///
/// `EngineConfig::default()` reproduces the constants used by the
/// original engine exactly; every scenario in the module-level test
/// suites exercises the default configuration unless stated otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Size in bytes of the address window routed to a single peripheral.
    /// Must be a power of two. Default 512.
    pub peri_addr_range: u32,
    /// Maximum number of registers tracked per peripheral. Default 128.
    pub max_reg_num: usize,
    /// Maximum number of SR-satisfaction events tracked per peripheral
    /// (`PM_MAX_EVT_NUM`). Default 32.
    pub max_evt_num: usize,
    /// Maximum number of satisfying bit combinations per event
    /// (`PM_MAX_SATISFY_NUM`). Default 16.
    pub max_satisfy_num: usize,
    /// Maximum number of status registers participating in one
    /// satisfying combination (`sr_num`, §3's "1–3 status registers per
    /// call site"), not a bit count despite the name inherited from
    /// `PM_MAX_BIT_COMB_SZ`. Default 3.
    pub max_bit_comb_sz: usize,
    /// Consecutive same-address reads (no intervening write) before a
    /// category fix-up is forced (`CONSEC_NON_SR_R_THRESHOLD`). Default 100.
    pub consec_non_sr_r_threshold: u32,
    /// Basic blocks elapsed with no SRRS finding before stage 1 gives up
    /// (`ME_TERM_THRESHOLD`). Default 30 000.
    pub me_term_threshold: u64,
    /// Basic block cap for stage 2 exploration
    /// (`SR_R_WORKER_BBL_CNT_CAP`). Default 20 000.
    pub sr_r_worker_bbl_cnt_cap: u64,
    /// Unexpected SR reads tolerated past the exploration input before
    /// stage 2 terminates (`SR_R_THRESH_HOLD`). Default 4.
    pub sr_r_thresh_hold: u32,
    /// Interrupt scheduler wraps required before modeling concludes
    /// "every enabled interrupt fired at least once" (`INT_ROUND`). Default 1.
    pub int_round_target: u32,
    /// Basic blocks between forced interrupt fires during fuzzing
    /// (`FUZZING_INT_FREQ`). Default 1000.
    pub fuzzing_int_freq: u64,
    /// Default bytes consumed per data-register read (`DR_bytes_num`).
    /// Default 2.
    pub dr_bytes_num_default: u32,
    /// Maximum SR reads served as SR within a single basic block
    /// (`MAX_SR_NUM`). Default 12.
    pub max_sr_per_bbl: u32,
    /// Maximum length in bytes of the serialized `CR_val` snapshot.
    /// Default 256.
    pub max_cr_val_bytes: usize,
    /// Maximum number of distinct interrupt numbers tracked. Default 16.
    pub max_int_en_num: usize,
    /// Inclusive lower bound of the peripheral MMIO window.
    /// Default `0x4000_0000`.
    pub peri_mmio_base: u32,
    /// Exclusive upper bound of the peripheral MMIO window.
    /// Default `0x6000_0000`.
    pub peri_mmio_end: u32,
    /// Capacity of the fuzzer input byte buffer fed to data registers.
    /// Default 128.
    pub input_buf_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            peri_addr_range: 512,
            max_reg_num: 128,
            max_evt_num: 32,
            max_satisfy_num: 16,
            max_bit_comb_sz: 3,
            consec_non_sr_r_threshold: 100,
            me_term_threshold: 30_000,
            sr_r_worker_bbl_cnt_cap: 20_000,
            sr_r_thresh_hold: 4,
            int_round_target: 1,
            fuzzing_int_freq: 1000,
            dr_bytes_num_default: 2,
            max_sr_per_bbl: 12,
            max_cr_val_bytes: 256,
            max_int_en_num: 16,
            peri_mmio_base: 0x4000_0000,
            peri_mmio_end: 0x6000_0000,
            input_buf_cap: 128,
        }
    }
}

impl EngineConfig {
    /// Base address a peripheral address is masked down to.
    pub fn base_addr_of(&self, addr: u32) -> u32 {
        addr & !(self.peri_addr_range - 1)
    }

    /// Whether `addr` falls in the peripheral MMIO window this engine owns.
    pub fn in_peripheral_range(&self, addr: u32) -> bool {
        addr >= self.peri_mmio_base && addr < self.peri_mmio_end
    }
}
