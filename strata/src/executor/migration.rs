// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Migration of resolved file sets between trees.

use std::{
    collections::BTreeSet,
    io::{self, Read},
    os::unix::fs::{symlink, MetadataExt, PermissionsExt},
    path::Path,
};

use fs_err as fs;
use itertools::Itertools;
use nix::unistd::{chown, Gid, Uid};

use crate::{
    errors::Error,
    part::Permissions,
    util::FileOps,
};

/// What a call to [`migrate_files`] moved, plus any destination paths that
/// already held different content and were left alone. The caller decides
/// whether conflicts are fatal.
#[derive(Debug, Default)]
pub struct Migration {
    pub files: BTreeSet<String>,
    pub dirs: BTreeSet<String>,
    pub conflicts: Vec<String>,
}

/// Callback applied to each migrated regular file.
pub type FixupFunc<'a> = &'a mut dyn FnMut(&Path) -> Result<(), Error>;

/// Migrate `files` and `dirs` from `srcdir` into `destdir`.
///
/// Directories are created shortest-path-first preserving source modes;
/// files follow in lexicographic order, hard-linked when the trees share a
/// filesystem and copied otherwise. Symlinks are recreated pointing at
/// their original target. Ownership, mode, extended attributes and
/// timestamps are carried over as far as the host permits.
pub fn migrate_files(
    files: &BTreeSet<String>,
    dirs: &BTreeSet<String>,
    srcdir: &Path,
    destdir: &Path,
    ops: &dyn FileOps,
    mut fixup: Option<FixupFunc<'_>>,
    permissions: &[Permissions],
) -> Result<Migration, Error> {
    let mut migration = Migration {
        files: files.clone(),
        dirs: dirs.clone(),
        conflicts: vec![],
    };

    fs::create_dir_all(destdir)?;

    for dir in dirs.iter().sorted_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b))) {
        let src = srcdir.join(dir);
        let dst = destdir.join(dir);

        if !dst.exists() {
            fs::create_dir_all(&dst)?;
        }

        if let Ok(meta) = fs::symlink_metadata(&src) {
            fs::set_permissions(&dst, std::fs::Permissions::from_mode(meta.mode() & 0o7777))?;
        }
    }

    for file in files {
        let src = srcdir.join(file);
        let dst = destdir.join(file);

        let src_meta = fs::symlink_metadata(&src).map_err(|_| Error::CopyFileNotFound {
            name: src.display().to_string(),
        })?;

        if dst.symlink_metadata().is_ok() {
            if !paths_identical(&src, &dst)? {
                migration.conflicts.push(file.clone());
            }
            continue;
        }

        if src_meta.file_type().is_symlink() {
            let target = fs::read_link(&src)?;
            symlink(target, &dst)?;
            continue;
        }

        ops.link_or_copy(&src, &dst)?;

        // A successful hard link shares the inode and needs no fix-up;
        // detect it by device+inode rather than tracking the fallback
        let dst_meta = fs::symlink_metadata(&dst)?;
        if dst_meta.ino() != src_meta.ino() || dst_meta.dev() != src_meta.dev() {
            restore_metadata(&src_meta, &src, &dst, ops)?;
        }

        if let Some(fixup) = fixup.as_mut() {
            fixup(&dst)?;
        }
    }

    for permission in permissions {
        for path in migration.dirs.iter().chain(&migration.files) {
            if permission.applies_to(path) {
                permission.apply(&destdir.join(path))?;
            }
        }
    }

    Ok(migration)
}

fn restore_metadata(
    src_meta: &std::fs::Metadata,
    src: &Path,
    dst: &Path,
    ops: &dyn FileOps,
) -> Result<(), Error> {
    fs::set_permissions(dst, std::fs::Permissions::from_mode(src_meta.mode() & 0o7777))?;

    // Ownership and timestamps are best effort for unprivileged callers
    let _ = chown(
        dst,
        Some(Uid::from_raw(src_meta.uid())),
        Some(Gid::from_raw(src_meta.gid())),
    );

    if let (Ok(accessed), Ok(modified)) = (src_meta.accessed(), src_meta.modified()) {
        if let Ok(file) = std::fs::OpenOptions::new().write(true).open(dst) {
            let times = std::fs::FileTimes::new().set_accessed(accessed).set_modified(modified);
            let _ = file.set_times(times);
        }
    }

    let attrs = ops.read_xattrs(src)?;
    if !attrs.is_empty() {
        ops.write_xattrs(dst, &attrs)?;
    }

    Ok(())
}

/// Two paths are identical when they are the same kind of entry with the
/// same mode and payload.
fn paths_identical(a: &Path, b: &Path) -> Result<bool, Error> {
    let meta_a = fs::symlink_metadata(a)?;
    let meta_b = fs::symlink_metadata(b)?;

    if meta_a.file_type() != meta_b.file_type() {
        return Ok(false);
    }

    if meta_a.file_type().is_symlink() {
        return Ok(fs::read_link(a)? == fs::read_link(b)?);
    }

    if meta_a.mode() != meta_b.mode() || meta_a.len() != meta_b.len() {
        return Ok(false);
    }

    if meta_a.ino() == meta_b.ino() && meta_a.dev() == meta_b.dev() {
        return Ok(true);
    }

    let mut reader_a = io::BufReader::new(fs::File::open(a)?);
    let mut reader_b = io::BufReader::new(fs::File::open(b)?);
    let mut buf_a = [0u8; 8192];
    let mut buf_b = [0u8; 8192];

    loop {
        let read_a = reader_a.read(&mut buf_a)?;
        let read_b = reader_b.read(&mut buf_b)?;

        if read_a != read_b || buf_a[..read_a] != buf_b[..read_b] {
            return Ok(false);
        }
        if read_a == 0 {
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::os::unix::fs::{symlink, MetadataExt, PermissionsExt};
    use std::path::Path;

    use fs_err as fs;

    use super::migrate_files;
    use crate::errors::Error;
    use crate::part::Permissions;
    use crate::util::HostOps;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|i| (*i).to_owned()).collect()
    }

    fn populate(root: &Path, files: &[&str]) {
        for file in files {
            let path = root.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, file.as_bytes()).unwrap();
        }
    }

    #[test]
    fn migrates_dirs_then_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src, &["usr/bin/tool"]);

        let migration = migrate_files(
            &set(&["usr/bin/tool"]),
            &set(&["usr", "usr/bin"]),
            &src,
            &dst,
            &HostOps,
            None,
            &[],
        )
        .unwrap();

        assert!(dst.join("usr/bin/tool").is_file());
        assert!(migration.conflicts.is_empty());
        assert_eq!(migration.files, set(&["usr/bin/tool"]));
        assert_eq!(migration.dirs, set(&["usr", "usr/bin"]));
    }

    #[test]
    fn hard_links_share_the_inode() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src, &["file"]);

        migrate_files(&set(&["file"]), &set(&[]), &src, &dst, &HostOps, None, &[]).unwrap();

        let src_ino = fs::metadata(src.join("file")).unwrap().ino();
        let dst_ino = fs::metadata(dst.join("file")).unwrap().ino();
        assert_eq!(src_ino, dst_ino);
    }

    #[test]
    fn symlinks_are_recreated() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src, &["target"]);
        symlink("target", src.join("link")).unwrap();

        migrate_files(
            &set(&["link", "target"]),
            &set(&[]),
            &src,
            &dst,
            &HostOps,
            None,
            &[],
        )
        .unwrap();

        assert_eq!(
            fs::read_link(dst.join("link")).unwrap(),
            Path::new("target").to_path_buf()
        );
    }

    #[test]
    fn identical_existing_destination_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src, &["file"]);
        populate(&dst, &["file"]);

        let migration =
            migrate_files(&set(&["file"]), &set(&[]), &src, &dst, &HostOps, None, &[]).unwrap();

        assert!(migration.conflicts.is_empty());
    }

    #[test]
    fn different_existing_destination_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src, &["file"]);
        fs::create_dir_all(&dst).unwrap();
        fs::write(dst.join("file"), b"different").unwrap();

        let migration =
            migrate_files(&set(&["file"]), &set(&[]), &src, &dst, &HostOps, None, &[]).unwrap();

        assert_eq!(migration.conflicts, vec!["file".to_owned()]);
        assert_eq!(fs::read(dst.join("file")).unwrap(), b"different");
    }

    #[test]
    fn fixup_runs_for_regular_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src, &["foo.pc"]);
        symlink("foo.pc", src.join("bar.pc")).unwrap();

        let mut seen = vec![];
        let mut fixup = |path: &Path| -> Result<(), Error> {
            seen.push(path.to_path_buf());
            Ok(())
        };

        migrate_files(
            &set(&["bar.pc", "foo.pc"]),
            &set(&[]),
            &src,
            &dst,
            &HostOps,
            Some(&mut fixup),
            &[],
        )
        .unwrap();

        assert_eq!(seen, vec![dst.join("foo.pc")]);
    }

    #[test]
    fn permissions_are_applied_to_matching_paths() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        populate(&src, &["usr/bin/tool", "etc/conf"]);

        let permissions = vec![Permissions {
            path: Some("usr/bin/*".into()),
            mode: Some("700".into()),
            ..Default::default()
        }];

        migrate_files(
            &set(&["etc/conf", "usr/bin/tool"]),
            &set(&["etc", "usr", "usr/bin"]),
            &src,
            &dst,
            &HostOps,
            None,
            &permissions,
        )
        .unwrap();

        let tool_mode = fs::metadata(dst.join("usr/bin/tool")).unwrap().mode() & 0o777;
        let conf_mode = fs::metadata(dst.join("etc/conf")).unwrap().mode() & 0o777;
        assert_eq!(tool_mode, 0o700);
        assert_ne!(conf_mode, 0o700);
    }

    #[test]
    fn dir_modes_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("private")).unwrap();
        fs::set_permissions(src.join("private"), std::fs::Permissions::from_mode(0o700)).unwrap();

        migrate_files(&set(&[]), &set(&["private"]), &src, &dst, &HostOps, None, &[]).unwrap();

        let mode = fs::metadata(dst.join("private")).unwrap().mode() & 0o777;
        assert_eq!(mode, 0o700);
    }
}
