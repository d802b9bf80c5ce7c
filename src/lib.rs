// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 zenedge contributors
//
// Host-side shared memory IPC bridge for the ZENEDGE kernel.
//
// A 1 MiB file-backed region carries two SPSC packet rings (commands and
// responses), two streaming rings (observations and actions), a doorbell
// block and a bitmap-allocated blob heap. The bridge polls the rings,
// dispatches command packets to handlers and serves tensor storage, model
// inference, environment stepping and IFR persistence to the kernel.

pub mod proto;

pub mod error;
pub use error::{BridgeError, Result};

pub mod shm;
pub use shm::SharedMem;

pub mod ring;
pub use ring::SpscRing;

pub mod doorbell;
pub use doorbell::Doorbell;

pub mod heap;
pub use heap::{HeapManager, HeapStats};

pub mod tensor;
pub use tensor::{DType, Tensor, TensorHeader, TensorView};

pub mod ifr;
pub use ifr::{parse_ifr, IfrRecord};

pub mod stream;
pub use stream::StreamRings;

pub mod models;
pub use models::{Model, ModelCache};

pub mod env;
pub use env::{Environment, StepOutcome};

pub mod arbiter;
pub use arbiter::{Decision, ModelLifecycle};

pub mod bridge;
pub use bridge::{Bridge, BridgeConfig};

pub mod handlers;
