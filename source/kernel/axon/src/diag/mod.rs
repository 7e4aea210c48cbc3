// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel diagnostics.

#[macro_use]
pub mod log;
