// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The engine's error taxonomy.
//!
//! The original engine signaled failure with a mix of sentinel return
//! values (`-1`, `-2`) and direct `exit(code)` calls scattered across the
//! modeling pipeline. This crate never calls `std::process::exit`: every
//! fallible operation returns a [`ModelError`], and translating a
//! returned error (or a [`crate::host::DoneWorkCode`]) into the historical
//! process exit code is left to the host adapter, consistent with
//! process lifecycle being out of this crate's scope.

use std::fmt;

/// A capacity invariant of the model that was exceeded.
///
/// Every variant here is fatal by policy: these are invariants of the
/// model itself, not malformed user input, so there is no sensible
/// "recover and continue" behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// Per-peripheral event table (`PM_MAX_EVT_NUM`).
    Events,
    /// Satisfying bit combinations within one event (`PM_MAX_SATISFY_NUM`).
    SatisfyCombinations,
    /// The serialized `CR_val` snapshot buffer.
    CrValBytes,
    /// The interrupt number table.
    InterruptSlots,
    /// SR reads served as SR within a single basic block (`MAX_SR_NUM`).
    SrsPerBbl,
    /// Registers tracked by a single peripheral.
    Registers,
    /// Status registers participating in one event's satisfying
    /// combination (`PM_MAX_BIT_COMB_SZ`), or a combination with none at
    /// all.
    SrNum,
}

impl fmt::Display for Capacity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capacity::Events => "event table",
            Capacity::SatisfyCombinations => "satisfying combination table",
            Capacity::CrValBytes => "CR_val snapshot buffer",
            Capacity::InterruptSlots => "interrupt table",
            Capacity::SrsPerBbl => "SR reads per basic block",
            Capacity::Registers => "register bank",
            Capacity::SrNum => "status registers per satisfying combination",
        };
        f.write_str(s)
    }
}

/// Every way the engine can fail.
///
/// Each variant documents the historical exit code a host adapter would
/// reproduce if it wants byte-for-byte compatibility with the original
/// engine's process exit status; this crate itself never exits.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// A model invariant's capacity was exceeded. Historical codes 0x77
    /// (interrupt table), 0x79 (SRs per BBL), 0x80 (CR_val overflow);
    /// event/satisfy overflow had no single historical code and is
    /// treated the same way here.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(Capacity),

    /// The persisted model file was not valid JSON, or had the right
    /// JSON shape but a value out of the range this crate expects.
    #[error("malformed model at line {line}, column {column}: {message}")]
    Corrupt {
        line: usize,
        column: usize,
        message: String,
    },

    /// Lower-level JSON decode failure without a more specific corruption
    /// diagnosis; still reports line/column via [`serde_json::Error`].
    #[error("model JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// An I/O failure opening, reading, or writing a file this crate owns
    /// (the model file, the fuzzer input file, the exploration input
    /// file). Historical code 0x70.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The fuzzer input (or, during stage 2, the exploration input) was
    /// exhausted. Historical code 0x71.
    #[error("input exhausted")]
    InputExhausted,

    /// A register category the engine does not know how to serve was
    /// reached on the read path. Historical code 0x75.
    #[error("unsupported register category")]
    UnsupportedCategory,

    /// An access reached a register still `Uncategorized` during fuzzing.
    /// Categorization only runs during identification/exploration; a
    /// register a prior run never touched has no learned behavior to
    /// replay, so fuzzing cannot proceed past it. Historical code 0x40.
    #[error("uncategorized register accessed at peripheral {peripheral_base:#x} reg {reg_idx} during fuzzing")]
    UncategorizedAccess { peripheral_base: u32, reg_idx: usize },

    /// Reloading the model after a stage-3 upcall to the model extractor
    /// failed. Historical code 0x76. There is no recovery.
    #[error("model reload failed: {0}")]
    ReloadFailed(String),

    /// Firmware looped reading an SR register that is already
    /// `sr_locked` with no satisfying entry — an unmodeled status-poll
    /// hang. Historical code 0x78. There is no recovery.
    #[error("hang on unmodeled status register at peripheral {peripheral_base:#x} reg {reg_idx}")]
    SrHang { peripheral_base: u32, reg_idx: usize },

    /// Stage 2 exhausted its `SR_r_file` and then saw more unexpected
    /// SR reads than `sr_r_thresh_hold` tolerates. Historical code 0x23.
    #[error("stage-2 exploration exhausted with unexpected SR reads outstanding")]
    ExplorationExhausted,

    /// Stage 2 was asked to run without the stage-1 `sr_read` record it
    /// depends on. Historical code 0x24.
    #[error("stage-2 requires a prior stage-1 model with an sr_read record")]
    MissingStageOneRecord,
}

impl ModelError {
    /// The historical process exit code this error corresponds to, for a
    /// host adapter that wants byte-for-byte compatible exit statuses.
    pub fn legacy_exit_code(&self) -> u8 {
        match self {
            ModelError::CapacityExceeded(Capacity::InterruptSlots) => 0x77,
            ModelError::CapacityExceeded(Capacity::SrsPerBbl) => 0x79,
            ModelError::CapacityExceeded(Capacity::CrValBytes) => 0x80,
            ModelError::CapacityExceeded(_) => 0x79,
            ModelError::Corrupt { .. } | ModelError::Json(_) => 0x24,
            ModelError::Io(_) => 0x70,
            ModelError::InputExhausted => 0x71,
            ModelError::UnsupportedCategory => 0x75,
            ModelError::UncategorizedAccess { .. } => 0x40,
            ModelError::ReloadFailed(_) => 0x76,
            ModelError::SrHang { .. } => 0x78,
            ModelError::ExplorationExhausted => 0x23,
            ModelError::MissingStageOneRecord => 0x24,
        }
    }
}

/// Failure invoking the out-of-process model extractor (stage 3's
/// unmodeled-access recovery upcall). Any failure here is fatal per
/// [`ModelError::ReloadFailed`] — the engine has no fallback path.
#[derive(Debug, thiserror::Error)]
pub enum ExtractorError {
    #[error("model extractor I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("model extractor exited with failure: {0}")]
    NonZeroExit(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_has_nonempty_display() {
        let samples: Vec<ModelError> = vec![
            ModelError::CapacityExceeded(Capacity::Events),
            ModelError::CapacityExceeded(Capacity::SrNum),
            ModelError::Corrupt {
                line: 3,
                column: 7,
                message: "bad".into(),
            },
            ModelError::Io(std::io::Error::new(std::io::ErrorKind::Other, "x")),
            ModelError::InputExhausted,
            ModelError::UnsupportedCategory,
            ModelError::UncategorizedAccess { peripheral_base: 0x4000_0000, reg_idx: 1 },
            ModelError::ReloadFailed("extractor failed".into()),
            ModelError::SrHang {
                peripheral_base: 0x4000_0000,
                reg_idx: 2,
            },
            ModelError::ExplorationExhausted,
            ModelError::MissingStageOneRecord,
        ];
        for e in samples {
            assert!(!e.to_string().is_empty());
        }
    }

    #[test]
    fn legacy_codes_match_historical_table() {
        assert_eq!(
            ModelError::CapacityExceeded(Capacity::InterruptSlots).legacy_exit_code(),
            0x77
        );
        assert_eq!(ModelError::InputExhausted.legacy_exit_code(), 0x71);
        assert_eq!(
            ModelError::UncategorizedAccess { peripheral_base: 0, reg_idx: 0 }.legacy_exit_code(),
            0x40
        );
        assert_eq!(
            ModelError::SrHang {
                peripheral_base: 0,
                reg_idx: 0
            }
            .legacy_exit_code(),
            0x78
        );
    }
}
