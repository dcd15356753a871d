// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Logging bootstrap for binaries and tests that drive curvature queries.

use std::sync::OnceLock;

use spiral_config::tracing::{self as spiral_tracing, InitError};
use tracing::warn;

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the SpiralTorch subscriber once. Later calls, or a subscriber
/// installed by someone else, are not errors.
pub fn init_tracing() {
    INIT.get_or_init(|| match spiral_tracing::init_tracing() {
        Ok(()) | Err(InitError::AlreadyInitialised) => {}
        Err(err) => warn!(%err, "curvature tracing left to the existing subscriber"),
    });
}

/// Flushes the Chrome trace, if `SPIRAL_TRACE_CHROME` enabled one.
pub fn flush() {
    spiral_tracing::flush_chrome_trace();
}
