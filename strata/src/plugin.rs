// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

/// A build plugin as seen by the step executor.
///
/// Plugins resolve a part's build system into ordered lists of shell
/// commands; registration and per-plugin behavior live outside this crate.
pub trait Plugin {
    /// Commands executed by the pull step, after source acquisition.
    fn pull_commands(&self) -> Vec<String> {
        vec![]
    }

    /// Commands executed by the build step.
    fn build_commands(&self) -> Vec<String>;
}
