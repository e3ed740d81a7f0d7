// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Filesets and resolution of migratable file sets.

use std::{
    collections::BTreeSet,
    io,
    path::Path,
};

use fs_err as fs;
use glob::Pattern;

use crate::{errors::Error, partition};

/// An ordered list of include/exclude path patterns.
///
/// Excludes carry a leading `-`. An empty include list is equivalent to
/// `*`. Unqualified patterns bind to the fileset's default partition;
/// `(name)/…` patterns bind to partition `name`.
#[derive(Debug, Clone)]
pub struct Fileset {
    name: String,
    entries: Vec<String>,
    default_partition: String,
}

impl Fileset {
    pub fn new(entries: Vec<String>, name: impl ToString, default_partition: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            entries,
            default_partition: default_partition.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_partition(&self) -> &str {
        &self.default_partition
    }

    /// Patterns in insertion order, excludes still prefixed with `-`.
    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn includes(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|entry| !entry.starts_with('-'))
            .map(String::as_str)
            .collect()
    }

    pub fn excludes(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|entry| entry.strip_prefix('-'))
            .collect()
    }

    /// Merge another fileset into this one.
    ///
    /// Merging happens when this fileset is a plain wildcard or carries no
    /// includes of its own. Entries excluded here but included by `other`
    /// are an inconsistency surfaced as a fileset conflict.
    pub fn combine(&mut self, other: &Fileset) -> Result<(), Error> {
        let mut to_combine = false;

        if self.entries.iter().any(|entry| entry == "*") {
            to_combine = true;
            self.entries.retain(|entry| entry != "*");
        }

        let other_excludes = other.excludes();
        let conflicting = self
            .includes()
            .into_iter()
            .filter(|include| other_excludes.contains(include))
            .map(str::to_owned)
            .collect::<Vec<_>>();

        if !conflicting.is_empty() {
            return Err(Error::FilesetConflict {
                conflicting_files: conflicting,
            });
        }

        if self.includes().is_empty() {
            to_combine = true;
        }

        if to_combine {
            for entry in other.entries() {
                if !self.entries.contains(entry) {
                    self.entries.push(entry.clone());
                }
            }
        }

        Ok(())
    }
}

/// Resolve the files and directories a fileset selects for one partition.
///
/// Candidates come from walking `srcdir`; each pattern routes to its
/// partition and only patterns bound to `partition` participate (all of
/// them in single-tree mode, when `partition` is `None`). An include
/// matching a directory selects its whole subtree; an exclude matching a
/// directory prunes its whole subtree. The returned dir set carries every
/// selected directory plus the ancestors of every selected file, and all
/// paths are relative to `srcdir` without partition qualifiers.
pub fn migratable_filesets(
    fileset: &Fileset,
    srcdir: &Path,
    default_partition: &str,
    partition: Option<&str>,
) -> Result<(BTreeSet<String>, BTreeSet<String>), Error> {
    let mut includes = fileset.includes();
    if includes.is_empty() {
        includes = vec!["*"];
    }

    let includes = scoped_to_partition(&includes, default_partition, partition);
    let excludes = scoped_to_partition(&fileset.excludes(), default_partition, partition);

    let include_patterns = compile(&includes, fileset.name())?;
    let exclude_patterns = compile(&excludes, fileset.name())?;

    let mut files = BTreeSet::new();
    let mut dirs = BTreeSet::new();

    if !srcdir.exists() {
        return Ok((files, dirs));
    }

    for (rel, is_dir) in walk(srcdir, "")? {
        let selected = matches_any(&includes, &include_patterns, &rel)
            && !matches_any(&excludes, &exclude_patterns, &rel);

        if !selected {
            continue;
        }

        if is_dir {
            dirs.insert(rel);
        } else {
            files.insert(rel);
        }
    }

    for file in &files {
        let mut ancestor = Path::new(file).parent();
        while let Some(dir) = ancestor.filter(|dir| !dir.as_os_str().is_empty()) {
            dirs.insert(dir.to_string_lossy().to_string());
            ancestor = dir.parent();
        }
    }

    Ok((files, dirs))
}

/// Keep the patterns bound to `partition`, stripped of their qualifier.
fn scoped_to_partition(patterns: &[&str], default_partition: &str, partition: Option<&str>) -> Vec<String> {
    let Some(target) = partition else {
        return patterns.iter().map(|pattern| (*pattern).to_owned()).collect();
    };

    patterns
        .iter()
        .filter_map(|pattern| {
            partition::warn_if_unqualified(pattern, &[default_partition, target]);

            let (name, path) = partition::parse_pattern(pattern, default_partition);
            (name == target).then(|| path.to_owned())
        })
        .collect()
}

fn compile(patterns: &[String], fileset_name: &str) -> Result<Vec<Pattern>, Error> {
    patterns
        .iter()
        .map(|pattern| {
            Pattern::new(pattern).map_err(|err| Error::Fileset {
                name: fileset_name.to_owned(),
                message: format!("invalid pattern '{pattern}': {err}"),
            })
        })
        .collect()
}

/// A path matches when any pattern covers it or one of its ancestors.
fn matches_any(patterns: &[String], compiled: &[Pattern], rel: &str) -> bool {
    if patterns.iter().any(|pattern| pattern == "*") {
        return true;
    }

    let mut candidate = Some(rel);
    while let Some(path) = candidate {
        if compiled.iter().any(|pattern| pattern.matches(path)) {
            return true;
        }
        candidate = path.rsplit_once('/').map(|(parent, _)| parent);
    }

    false
}

fn walk(root: &Path, prefix: &str) -> io::Result<Vec<(String, bool)>> {
    let mut entries = vec![];

    for entry in fs::read_dir(root.join(prefix))? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let name = entry.file_name().to_string_lossy().to_string();
        let rel = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };

        if file_type.is_dir() {
            entries.extend(walk(root, &rel)?);
            entries.push((rel, true));
        } else {
            entries.push((rel, false));
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::path::Path;

    use fs_err as fs;

    use super::{migratable_filesets, Fileset};
    use crate::errors::Error;
    use crate::partition::DEFAULT_PARTITION;

    fn fileset(entries: &[&str]) -> Fileset {
        Fileset::new(
            entries.iter().map(|e| (*e).to_owned()).collect(),
            "stage",
            DEFAULT_PARTITION,
        )
    }

    fn populate(root: &Path, files: &[&str]) {
        for file in files {
            let path = root.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, file.as_bytes()).unwrap();
        }
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|i| (*i).to_owned()).collect()
    }

    #[test]
    fn include_exclude_accessors() {
        let fileset = fileset(&["usr/bin/*", "-usr/share/doc"]);

        assert_eq!(fileset.includes(), vec!["usr/bin/*"]);
        assert_eq!(fileset.excludes(), vec!["usr/share/doc"]);
    }

    #[test]
    fn combining_a_wildcard_yields_the_other_fileset() {
        let mut prime = fileset(&["*"]);
        let stage = fileset(&["usr/bin/*", "-usr/share"]);

        prime.combine(&stage).unwrap();

        assert_eq!(prime.entries(), stage.entries());
    }

    #[test]
    fn combining_with_itself_changes_nothing() {
        let mut fs1 = fileset(&["usr/bin/*", "-usr/share"]);
        let fs2 = fs1.clone();

        fs1.combine(&fs2).unwrap();

        assert_eq!(fs1.entries(), fs2.entries());
    }

    #[test]
    fn contradicting_filesets_conflict() {
        let mut prime = fileset(&["usr/lib"]);
        let stage = fileset(&["-usr/lib"]);

        assert!(matches!(
            prime.combine(&stage),
            Err(Error::FilesetConflict { .. })
        ));
    }

    #[test]
    fn wildcard_selects_everything() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path(), &["usr/bin/tool", "etc/conf"]);

        let (files, dirs) =
            migratable_filesets(&fileset(&["*"]), dir.path(), DEFAULT_PARTITION, None).unwrap();

        assert_eq!(files, set(&["etc/conf", "usr/bin/tool"]));
        assert_eq!(dirs, set(&["etc", "usr", "usr/bin"]));
    }

    #[test]
    fn empty_includes_select_everything() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path(), &["usr/bin/tool"]);

        let (files, _) =
            migratable_filesets(&fileset(&["-etc"]), dir.path(), DEFAULT_PARTITION, None).unwrap();

        assert_eq!(files, set(&["usr/bin/tool"]));
    }

    #[test]
    fn including_a_directory_selects_its_subtree() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path(), &["usr/bin/tool", "usr/lib/libfoo.so", "etc/conf"]);

        let (files, dirs) =
            migratable_filesets(&fileset(&["usr"]), dir.path(), DEFAULT_PARTITION, None).unwrap();

        assert_eq!(files, set(&["usr/bin/tool", "usr/lib/libfoo.so"]));
        assert_eq!(dirs, set(&["usr", "usr/bin", "usr/lib"]));
    }

    #[test]
    fn excluding_a_directory_prunes_its_subtree() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path(), &["usr/bin/tool", "usr/share/doc/README"]);

        let (files, dirs) = migratable_filesets(
            &fileset(&["*", "-usr/share"]),
            dir.path(),
            DEFAULT_PARTITION,
            None,
        )
        .unwrap();

        assert_eq!(files, set(&["usr/bin/tool"]));
        assert!(!dirs.contains("usr/share"));
        assert!(!dirs.contains("usr/share/doc"));
    }

    #[test]
    fn qualified_patterns_route_to_their_partition_only() {
        let dir = tempfile::tempdir().unwrap();
        populate(dir.path(), &["usr/bin/tool", "lib/mod.ko"]);

        let entries = fileset(&["usr/bin/*", "(kernel)/lib/*"]);

        let (default_files, _) =
            migratable_filesets(&entries, dir.path(), DEFAULT_PARTITION, Some(DEFAULT_PARTITION)).unwrap();
        let (kernel_files, _) =
            migratable_filesets(&entries, dir.path(), DEFAULT_PARTITION, Some("kernel")).unwrap();

        assert_eq!(default_files, set(&["usr/bin/tool"]));
        assert_eq!(kernel_files, set(&["lib/mod.ko"]));
        assert!(default_files.is_disjoint(&kernel_files));
    }

    #[test]
    fn missing_source_root_selects_nothing() {
        let dir = tempfile::tempdir().unwrap();

        let (files, dirs) = migratable_filesets(
            &fileset(&["*"]),
            &dir.path().join("nonexistent"),
            DEFAULT_PARTITION,
            None,
        )
        .unwrap();

        assert!(files.is_empty());
        assert!(dirs.is_empty());
    }

    #[test]
    fn empty_selected_directories_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("var/empty")).unwrap();

        let (files, dirs) =
            migratable_filesets(&fileset(&["*"]), dir.path(), DEFAULT_PARTITION, None).unwrap();

        assert!(files.is_empty());
        assert_eq!(dirs, set(&["var", "var/empty"]));
    }

    #[test]
    fn invalid_pattern_is_a_fileset_error() {
        let dir = tempfile::tempdir().unwrap();

        let result = migratable_filesets(&fileset(&["usr/[" ]), dir.path(), DEFAULT_PARTITION, None);

        assert!(matches!(result, Err(Error::Fileset { .. })));
    }
}
