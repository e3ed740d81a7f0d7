// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Partition naming and partition-qualified path parsing.

/// Name of the partition unqualified paths bind to.
pub const DEFAULT_PARTITION: &str = "default";

/// Split a partition-qualified pattern into its partition and path.
///
/// `(name)/rest` binds to partition `name`; a bare path binds to
/// `default_partition`. A qualifier with no trailing path means the whole
/// partition tree.
pub fn parse_pattern<'a>(pattern: &'a str, default_partition: &'a str) -> (&'a str, &'a str) {
    if let Some(qualified) = pattern.strip_prefix('(') {
        if let Some((name, rest)) = qualified.split_once(')') {
            if !name.is_empty() {
                let path = rest.strip_prefix('/').unwrap_or(rest);
                return (name, if path.is_empty() { "*" } else { path });
            }
        }
    }

    (default_partition, pattern)
}

/// Warn about a bare pattern whose leading component names a known partition.
///
/// Such entries bind to the default partition; the author probably meant to
/// write `(name)/…`.
pub fn warn_if_unqualified(pattern: &str, known_partitions: &[&str]) {
    if pattern.starts_with('(') {
        return;
    }

    if let Some(leading) = pattern.split('/').next() {
        if known_partitions.contains(&leading) {
            log::warn!(
                "'{pattern}' begins with partition name '{leading}' but is not wrapped in \
                 parentheses; it will go into the default partition"
            );
        }
    }
}
