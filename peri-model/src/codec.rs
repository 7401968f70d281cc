// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! Persisting and restoring the learned model: the JSON document format
//! of §6, serialized/deserialized with `serde_json` (the interchange
//! format with the out-of-scope Python model-extractor, kept exactly as
//! specified per Design Note "JSON for the learned model").

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::error::ModelError;
use crate::interrupt::InterruptScheduler;
use crate::peripheral::{Event, Peripheral, SatisfyEntry};
use crate::register::Category;
use crate::store::PeripheralStore;

#[derive(Debug, Serialize, Deserialize)]
struct RegisterDoc {
    #[serde(rename = "type")]
    ty: u8,
    read: u8,
    write: u8,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    sr_locked: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    cr_value: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EventDoc {
    sr_num: u32,
    set_bits: u32,
    #[serde(rename = "CR_SR_r_idx", skip_serializing_if = "Option::is_none", default)]
    cr_sr_r_idx: Option<u32>,
    satisfy: Vec<Vec<(Vec<u8>, u8)>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PeripheralDoc {
    #[serde(rename = "DR_bytes_num")]
    dr_bytes_num: u32,
    reg_size: u32,
    regs: Vec<RegisterDoc>,
    #[serde(default)]
    events: BTreeMap<String, BTreeMap<String, EventDoc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct InterruptDoc {
    excp_num: u32,
    enabled: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct SrReadDoc {
    peripheral_base: String,
    reg_idx: usize,
    cr_val: String,
    bbl_cnt: u64,
    cur_bbl_s: u32,
    cur_bbl_e: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    r_idx: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AccessToUnmodeledPeriDoc {
    replay_bbl_cnt: u64,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct ModelDocument {
    model: BTreeMap<String, PeripheralDoc>,
    #[serde(default)]
    interrupts: Vec<InterruptDoc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    sr_read: Option<SrReadDoc>,
    #[serde(
        rename = "access_to_unmodeled_peri",
        skip_serializing_if = "Option::is_none",
        default
    )]
    access_to_unmodeled_peri: Option<AccessToUnmodeledPeriDoc>,
}

/// Stage-1 termination record: the SRRS site a fresh `SR`/`CR_SR` read
/// with no matching event was found at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrReadRecord {
    pub peripheral_base: u32,
    pub reg_idx: usize,
    pub cr_val: String,
    pub bbl_cnt: u64,
    pub cur_bbl_s: u32,
    pub cur_bbl_e: u32,
    pub r_idx: Option<u32>,
}

/// Stage-3 upcall record: how far the guest must be replayed before the
/// controller resumes normal stage behavior after an unmodeled access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessRecord {
    pub replay_bbl_cnt: u64,
}

/// The result of `ModelCodec::load`: the restored peripheral/event/
/// interrupt state, plus whichever stage-specific metadata was present.
pub struct LoadedModel {
    pub store: PeripheralStore,
    pub interrupts: InterruptScheduler,
    pub sr_read: Option<SrReadRecord>,
    pub access_to_unmodeled_peri: Option<AccessRecord>,
}

fn format_base(addr: u32) -> String {
    format!("{addr:#x}")
}

fn parse_base(s: &str) -> Result<u32, ModelError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(digits, 16)
        .map_err(|e| ModelError::Corrupt { line: 0, column: 0, message: format!("bad base address {s:?}: {e}") })
}

fn parse_hex_u32(s: &str, what: &str) -> Result<u32, ModelError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u32::from_str_radix(digits, 16)
        .map_err(|e| ModelError::Corrupt { line: 0, column: 0, message: format!("bad {what} {s:?}: {e}") })
}

/// Persists and restores the JSON model document.
pub struct ModelCodec;

impl ModelCodec {
    /// Serialize `store`/`interrupts`/the stage records and write them to
    /// `path` atomically: a sibling temp file is written and fsynced,
    /// then renamed over `path`, so a crash mid-dump never leaves a
    /// truncated model file (the one durability guarantee this crate
    /// adds beyond the original's plain `json_dump_file`).
    pub fn dump(
        path: &Path,
        store: &PeripheralStore,
        interrupts: &InterruptScheduler,
        sr_read: Option<&SrReadRecord>,
        access_to_unmodeled_peri: Option<&AccessRecord>,
    ) -> Result<(), ModelError> {
        let mut model = BTreeMap::new();
        for peri in store.iter() {
            model.insert(format_base(peri.base_addr), peripheral_to_doc(peri));
        }
        let doc = ModelDocument {
            model,
            interrupts: interrupts
                .entries()
                .map(|(excp_num, enabled)| InterruptDoc { excp_num, enabled: enabled as u8 })
                .collect(),
            sr_read: sr_read.map(|r| SrReadDoc {
                peripheral_base: format_base(r.peripheral_base),
                reg_idx: r.reg_idx,
                cr_val: r.cr_val.clone(),
                bbl_cnt: r.bbl_cnt,
                cur_bbl_s: r.cur_bbl_s,
                cur_bbl_e: r.cur_bbl_e,
                r_idx: r.r_idx,
            }),
            access_to_unmodeled_peri: access_to_unmodeled_peri
                .map(|a| AccessToUnmodeledPeriDoc { replay_bbl_cnt: a.replay_bbl_cnt }),
        };

        let json = serde_json::to_string_pretty(&doc)?;
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::Builder::new().prefix(".peri-model-").tempfile_in(dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| ModelError::Io(e.error))?;
        log::info!(target: "peri_model::codec", "dumped model to {}", path.display());
        Ok(())
    }

    /// Parse the model document at `path` back into in-memory state.
    /// Malformed JSON is reported with the offending line/column rather
    /// than panicking.
    pub fn load(path: &Path, cfg: &EngineConfig) -> Result<LoadedModel, ModelError> {
        let text = std::fs::read_to_string(path)?;
        let doc: ModelDocument = serde_json::from_str(&text).map_err(|e| ModelError::Corrupt {
            line: e.line(),
            column: e.column(),
            message: e.to_string(),
        })?;

        let mut store = PeripheralStore::new();
        for (base_str, peri_doc) in &doc.model {
            let base = parse_base(base_str)?;
            let peri = doc_to_peripheral(base, peri_doc, cfg)?;
            *store.get_or_create(base, cfg) = peri;
        }

        let mut interrupts = InterruptScheduler::new();
        for entry in &doc.interrupts {
            interrupts.enable(entry.excp_num, cfg)?;
            if entry.enabled == 0 {
                interrupts.disable(entry.excp_num);
            }
        }

        let sr_read = doc
            .sr_read
            .as_ref()
            .map(|r| -> Result<SrReadRecord, ModelError> {
                Ok(SrReadRecord {
                    peripheral_base: parse_base(&r.peripheral_base)?,
                    reg_idx: r.reg_idx,
                    cr_val: r.cr_val.clone(),
                    bbl_cnt: r.bbl_cnt,
                    cur_bbl_s: r.cur_bbl_s,
                    cur_bbl_e: r.cur_bbl_e,
                    r_idx: r.r_idx,
                })
            })
            .transpose()?;

        let access_to_unmodeled_peri = doc
            .access_to_unmodeled_peri
            .as_ref()
            .map(|a| AccessRecord { replay_bbl_cnt: a.replay_bbl_cnt });

        log::info!(target: "peri_model::codec", "loaded model from {}", path.display());
        Ok(LoadedModel { store, interrupts, sr_read, access_to_unmodeled_peri })
    }
}

fn peripheral_to_doc(peri: &Peripheral) -> PeripheralDoc {
    let reg_size = peri.reg_size.unwrap_or(4);
    let regs = peri
        .regs()
        .iter()
        .map(|reg| RegisterDoc {
            ty: reg.category.wire_code(),
            read: reg.read as u8,
            write: reg.write as u8,
            sr_locked: reg.sr_locked.then_some(1),
            cr_value: matches!(reg.category, Category::Control | Category::ControlStatus)
                .then(|| format!("{:#x}", reg.shadow_value(reg_size))),
        })
        .collect();

    let mut events: BTreeMap<String, BTreeMap<String, EventDoc>> = BTreeMap::new();
    for event in peri.events() {
        let satisfy = event
            .satisfy
            .iter()
            .map(|combo| combo.iter().map(|e| (e.bits.clone(), e.set as u8)).collect())
            .collect();
        let set_bits = event
            .satisfy
            .first()
            .and_then(|combo| combo.first())
            .map(|e| e.bits.len() as u32)
            .unwrap_or(0);
        events.entry(event.cr_val.clone()).or_default().insert(
            format!("{:#x}", event.bbl_e),
            EventDoc { sr_num: event.sr_num as u32, set_bits, cr_sr_r_idx: event.r_idx, satisfy },
        );
    }

    PeripheralDoc { dr_bytes_num: peri.dr_bytes_num, reg_size, regs, events }
}

fn doc_to_peripheral(base: u32, doc: &PeripheralDoc, cfg: &EngineConfig) -> Result<Peripheral, ModelError> {
    let mut peri = Peripheral::new(base, cfg);
    peri.reg_size = Some(doc.reg_size);
    peri.dr_bytes_num = doc.dr_bytes_num;

    for (idx, reg_doc) in doc.regs.iter().enumerate() {
        let reg = peri.reg_mut(idx, cfg)?;
        reg.category = Category::from_wire_code(reg_doc.ty).ok_or_else(|| ModelError::Corrupt {
            line: 0,
            column: 0,
            message: format!("unknown register type {}", reg_doc.ty),
        })?;
        reg.read = reg_doc.read != 0;
        reg.write = reg_doc.write != 0;
        reg.sr_locked = reg_doc.sr_locked.unwrap_or(0) != 0;
        if let Some(cr_value) = &reg_doc.cr_value {
            let value = parse_hex_u32(cr_value, "cr_value")?;
            reg.write_shadow(doc.reg_size, value);
        }
    }

    for (cr_val, by_bbl) in &doc.events {
        for (bbl_e_str, event_doc) in by_bbl {
            let bbl_e = parse_hex_u32(bbl_e_str, "bbl_e")?;
            let mut event = Event::new(cr_val.clone(), bbl_e, event_doc.sr_num as usize, event_doc.cr_sr_r_idx);
            for combo in &event_doc.satisfy {
                let entries = combo
                    .iter()
                    .map(|(bits, sc)| SatisfyEntry { set: *sc != 0, bits: bits.clone() })
                    .collect();
                event.push_combination(cfg, entries)?;
            }
            peri.add_event(cfg, event)?;
        }
    }

    Ok(peri)
}
