// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

/// Lifecycle steps of a part, in execution order.
///
/// Ordering is total: `Pull < Overlay < Build < Stage < Prime`. Dispatch on
/// steps is always an exhaustive `match` so a new variant surfaces every
/// call site at compile time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Pull,
    Overlay,
    Build,
    Stage,
    Prime,
}

impl Step {
    const ORDERED: &'static [Self] = &[Step::Pull, Step::Overlay, Step::Build, Step::Stage, Step::Prime];

    pub fn next(&self) -> Option<Self> {
        let index = Self::ORDERED.iter().position(|step| step == self)?;
        Self::ORDERED.get(index + 1).copied()
    }

    pub fn previous(&self) -> Option<Self> {
        let index = Self::ORDERED.iter().position(|step| step == self)?;
        index.checked_sub(1).and_then(|i| Self::ORDERED.get(i)).copied()
    }
}
