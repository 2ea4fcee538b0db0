// This file is part of corvid-indexer.
// Copyright (C) 2026 Corvid Project
// SPDX-License-Identifier: Apache-2.0

pub mod application;
pub mod config;
pub mod domain;
pub mod infra;
