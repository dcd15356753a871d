// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Process-wide configuration snapshots read from `SPIRAL_*` environment
//! variables.

pub mod curvature;
pub mod determinism;
pub mod tracing;

pub(crate) fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "true" | "True" | "TRUE" | "on" | "ON" | "yes" => Some(true),
        "0" | "false" | "False" | "FALSE" | "off" | "OFF" | "no" => Some(false),
        _ => None,
    }
}
