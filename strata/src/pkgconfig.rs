// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Rewriting of pkg-config prefixes after staging.

use std::path::Path;

use fs_err as fs;
use itertools::Itertools;

use crate::errors::Error;

const PREFIX_KEYS: &[&str] = &["prefix=", "exec_prefix=", "libdir=", "includedir="];

/// Point the prefix directives of a `.pc` file at the stage tree.
///
/// Occurrences of `install_dir` in prefix-bearing lines are replaced with
/// `stage_dir`; all other content and the file mode are left untouched.
/// Applying the rewrite twice is a no-op.
pub fn fix_pkg_config(stage_dir: &Path, pkg_config_file: &Path, install_dir: &Path) -> Result<(), Error> {
    let content = fs::read_to_string(pkg_config_file)?;

    let install = install_dir.display().to_string();
    let stage = stage_dir.display().to_string();

    let mut rewritten = content
        .lines()
        .map(|line| {
            if PREFIX_KEYS.iter().any(|key| line.starts_with(key)) {
                line.replace(&install, &stage)
            } else {
                line.to_owned()
            }
        })
        .join("\n");

    if content.ends_with('\n') {
        rewritten.push('\n');
    }

    if rewritten != content {
        fs::write(pkg_config_file, rewritten)?;
    }

    Ok(())
}
