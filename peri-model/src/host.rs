// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright Tock Contributors 2022.

//! The boundary between this crate and the embedding emulator: the
//! upcalls the engine makes into the host, and the terminal codes it
//! can carry.

use crate::error::ExtractorError;

/// Re-exported from [`crate::stage`], which is the single definition
/// site (Design Note 9: "Category enum collisions").
pub use crate::stage::DoneWorkCode;

/// Host upcalls the engine invokes. The embedding emulator implements
/// this trait and hands an implementation to the engine at construction.
pub trait HostOps {
    /// Terminal: the engine has reached a state only the host can act on
    /// (snapshot, exit the worker). A conforming implementation does not
    /// return — it exits the process or otherwise diverges.
    fn done_work(&self, code: DoneWorkCode) -> !;

    /// Set `excp_num` pending in the guest's interrupt controller.
    fn nvic_set_pending(&self, excp_num: u32);

    /// Best-effort symbol name for a PC, used only for diagnostics.
    fn lookup_symbol(&self, pc: u32) -> Option<String> {
        let _ = pc;
        None
    }
}

/// Stage 3's contract with the (external, out-of-process) model
/// extractor: "run it, block for its exit status." A successful run is
/// followed by `ModelCodec::load` on the extractor's output; a failure
/// here is always fatal (Design Note: reload failure is fatal, 0x76).
pub trait ModelExtractor {
    fn run(&self, run_num: u32) -> Result<(), ExtractorError>;
}
