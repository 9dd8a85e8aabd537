// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

pub mod astro_util;
pub mod image_utils;
pub mod stacker_trait;
pub mod straighten;
