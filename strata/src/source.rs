// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

use crate::errors::Error;

/// Source acquisition as seen by the step executor.
///
/// The pull step invokes [`pull`](SourceHandler::pull) before running the
/// plugin's pull commands; fetching and caching strategies live outside
/// this crate.
pub trait SourceHandler {
    fn pull(&mut self) -> Result<(), Error>;
}
