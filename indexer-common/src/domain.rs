// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

mod bytes;
mod event;

pub use bytes::*;
pub use event::*;

/// Length of the per-script key: the first eleven bytes of the SHA-256 of a
/// script.
pub const HASHX_LEN: usize = 11;

pub type BlockHash = ByteArray<32>;
pub type TxHash = ByteArray<32>;
pub type MerkleRoot = ByteArray<32>;
pub type HashX = ByteArray<HASHX_LEN>;
pub type H160 = ByteArray<20>;
