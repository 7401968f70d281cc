// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! End-to-end scenarios against the public `Engine` surface: a fresh
//! peripheral through stage-1 identification, a persisted model reloaded
//! into stage-2 exploration, and stage-3 fuzzing's unmodeled-access
//! recovery upcall.

use std::cell::RefCell;
use std::io::Write as _;
use std::panic::{catch_unwind, AssertUnwindSafe};

use peri_model::{DoneWorkCode, Engine, EngineConfig, ExtractorError, HostOps, ModelError, ModelExtractor, Stage};

/// A host double that records every upcall instead of exiting a process.
/// `done_work` panics so tests can observe termination via
/// `catch_unwind` without aborting the test binary.
struct RecordingHost {
    done: RefCell<Option<DoneWorkCode>>,
    fired: RefCell<Vec<u32>>,
}

impl RecordingHost {
    fn new() -> Self {
        RecordingHost { done: RefCell::new(None), fired: RefCell::new(Vec::new()) }
    }
}

impl HostOps for RecordingHost {
    fn done_work(&self, code: DoneWorkCode) -> ! {
        *self.done.borrow_mut() = Some(code);
        panic!("done_work({code:?})");
    }
    fn nvic_set_pending(&self, excp_num: u32) {
        self.fired.borrow_mut().push(excp_num);
    }
}

fn model_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("model.json")
}

#[test]
fn stage_one_finding_persists_a_model_a_fresh_engine_can_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = model_path(&dir);

    let mut eng = Engine::new(EngineConfig::default(), RecordingHost::new(), path.clone(), Stage::SrRId);
    eng.on_bbl_begin(0x1000);
    let result = catch_unwind(AssertUnwindSafe(|| eng.read(0x4000_0000, 4)));
    assert!(result.is_err(), "a fresh SR read in stage 1 must terminate via done_work");
    assert_eq!(*eng.host().done.borrow(), Some(DoneWorkCode::IdentifyDone));
    assert!(path.exists(), "stage 1 must dump the model before terminating");

    // A second engine, standing in for the next worker process, loads the
    // dumped model and inherits the stage-2 replay target from it.
    let mut replay = Engine::new(EngineConfig::default(), RecordingHost::new(), path.clone(), Stage::SrRExplore);
    replay.load_model().unwrap();
    assert_eq!(replay.stage(), Stage::SrRExplore);
}

#[test]
fn explore_stage_replays_to_target_then_serves_from_exploration_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = model_path(&dir);

    // Stage 1 records a finding with bbl_cnt == 3 (three BBLs elapsed,
    // the read happens within the third).
    {
        let mut eng = Engine::new(EngineConfig::default(), RecordingHost::new(), path.clone(), Stage::SrRId);
        eng.on_bbl_begin(0x1000);
        eng.on_bbl_begin(0x1004);
        eng.on_bbl_begin(0x1008);
        let result = catch_unwind(AssertUnwindSafe(|| eng.read(0x4000_0000, 4)));
        assert!(result.is_err());
    }

    let mut exploration_file = tempfile::NamedTempFile::new().unwrap();
    // Two big-endian 4-byte words for the controller to serve in stage 2.
    exploration_file.write_all(&[0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0x09]).unwrap();

    let mut eng = Engine::new(EngineConfig::default(), RecordingHost::new(), path.clone(), Stage::SrRExplore);
    eng.load_model().unwrap();
    eng.load_exploration_input(exploration_file.path()).unwrap();

    // bbl_cnt == 1 < target_bbl_cnt - 1 == 2: still replaying, served from
    // the (empty) model.
    eng.on_bbl_begin(0x1000);
    assert_eq!(eng.read(0x4000_0000, 4), Some(0));

    // bbl_cnt == 2 == target_bbl_cnt - 1: the hybrid transition BBL —
    // pi_started flips here and this read is the first served from the
    // exploration file.
    eng.on_bbl_begin(0x1004);
    assert_eq!(eng.read(0x4000_0000, 4), Some(0x7));

    // A further BBL continues normal exploration, serving the next word.
    eng.on_bbl_begin(0x1008);
    assert_eq!(eng.read(0x4000_0000, 4), Some(0x9));
}

struct FailingExtractor;

impl ModelExtractor for FailingExtractor {
    fn run(&self, _run_num: u32) -> Result<(), ExtractorError> {
        Err(ExtractorError::NonZeroExit("exit 1".into()))
    }
}

struct SucceedingExtractor {
    path: std::path::PathBuf,
}

impl ModelExtractor for SucceedingExtractor {
    fn run(&self, _run_num: u32) -> Result<(), ExtractorError> {
        // Stand in for the out-of-process Python extractor: it has
        // already produced a valid model document by the time `run`
        // returns successfully.
        std::fs::write(&self.path, r#"{"model":{},"interrupts":[]}"#).unwrap();
        Ok(())
    }
}

#[test]
fn recover_from_unmodeled_access_reloads_after_a_successful_extractor_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = model_path(&dir);
    std::fs::write(&path, r#"{"model":{},"interrupts":[]}"#).unwrap();

    let mut eng = Engine::new(EngineConfig::default(), RecordingHost::new(), path.clone(), Stage::Fuzzing);
    let extractor = SucceedingExtractor { path: path.clone() };
    eng.recover_from_unmodeled_access(&extractor, 1).unwrap();
}

#[test]
fn recover_from_unmodeled_access_propagates_extractor_failure_as_reload_failed() {
    let dir = tempfile::tempdir().unwrap();
    let path = model_path(&dir);
    let mut eng = Engine::new(EngineConfig::default(), RecordingHost::new(), path.clone(), Stage::Fuzzing);
    let err = eng.recover_from_unmodeled_access(&FailingExtractor, 1).unwrap_err();
    assert!(matches!(err, ModelError::ReloadFailed(_)));
}

#[test]
fn fuzzing_stage_fires_interrupts_only_every_configured_frequency() {
    let dir = tempfile::tempdir().unwrap();
    let path = model_path(&dir);
    // Seed a persisted model with one enabled interrupt; Engine has no
    // direct interrupt-enable entry point outside of a loaded model.
    std::fs::write(&path, r#"{"model":{},"interrupts":[{"excp_num":17,"enabled":1}]}"#).unwrap();

    let cfg = EngineConfig { fuzzing_int_freq: 3, ..EngineConfig::default() };
    let mut eng = Engine::new(cfg, RecordingHost::new(), path.clone(), Stage::Fuzzing);
    eng.load_model().unwrap();

    for i in 1..=6u32 {
        eng.on_bbl_begin(0x1000 + i);
        eng.on_bbl_end(0x1000 + i + 2);
    }
    assert_eq!(*eng.host().fired.borrow(), vec![17, 17]);
}
