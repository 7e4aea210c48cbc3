// Copyright 2025 Axon OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Board descriptions consumed by the address-space builders.

pub mod virt;
