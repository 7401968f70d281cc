// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! An automatic MMIO peripheral modeling engine: classifies unmapped
//! memory-mapped I/O registers a guest program accesses into one of
//! five semantic roles, learns a status-register satisfaction model so
//! firmware polling loops make progress without real hardware, persists
//! that model to disk, and replays it deterministically while feeding
//! fuzzer-supplied bytes through data registers.
//!
//! [`Engine`] is the single type a host embeds: its `read`/`write`
//! methods are the two MMIO entry points, and `on_bbl_begin`/
//! `on_bbl_end` mark basic-block boundaries. Everything else in this
//! crate — register classification, the satisfaction model, the
//! interrupt scheduler, stage orchestration, model persistence — is
//! composed behind that one handle. This crate never spawns a thread,
//! never initializes a logger, and never calls `std::process::exit`;
//! process lifecycle, logging setup, and fuzzer/CPU/interrupt-controller
//! implementation are the embedding host's job.

pub mod classifier;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod event_model;
pub mod host;
pub mod input;
pub mod interrupt;
pub mod peripheral;
pub mod register;
pub mod stage;
pub mod store;

pub use codec::{AccessRecord, LoadedModel, ModelCodec, SrReadRecord};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{ExtractorError, ModelError};
pub use host::{DoneWorkCode, HostOps, ModelExtractor};
pub use stage::Stage;
