// Copyright (c) 2024 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod acquisition_controller;
pub mod archive_client;
pub mod grouping;
pub mod scratch;
