// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

use std::{
    ffi::OsString,
    io,
    path::Path,
};

use fs_err as fs;

use crate::errors::Error;

pub fn ensure_dir_exists(path: &Path) -> io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Host filesystem primitives the file migrator depends on.
///
/// Kept behind a trait so platform variants can be swapped in tests.
pub trait FileOps {
    /// Materialize `from` at `to`, preferring a hard link over a copy.
    fn link_or_copy(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn read_xattrs(&self, path: &Path) -> Result<Vec<(OsString, Vec<u8>)>, Error>;

    fn write_xattrs(&self, path: &Path, attrs: &[(OsString, Vec<u8>)]) -> Result<(), Error>;
}

pub struct HostOps;

impl FileOps for HostOps {
    fn link_or_copy(&self, from: &Path, to: &Path) -> io::Result<()> {
        // Hard linking fails across filesystems; fall back to a copy
        if fs::hard_link(from, to).is_err() {
            fs::copy(from, to)?;
        }
        Ok(())
    }

    fn read_xattrs(&self, path: &Path) -> Result<Vec<(OsString, Vec<u8>)>, Error> {
        let keys = match xattr::list(path) {
            Ok(keys) => keys,
            // Filesystem without xattr support has nothing to preserve
            Err(err) if err.raw_os_error() == Some(nix::libc::ENOTSUP) => return Ok(vec![]),
            Err(err) => return Err(Error::Io(err)),
        };

        let mut attrs = vec![];

        for key in keys {
            let value = xattr::get(path, &key).map_err(|_| Error::XAttribute {
                key: key.to_string_lossy().to_string(),
                path: path.display().to_string(),
                is_write: false,
            })?;
            if let Some(value) = value {
                attrs.push((key, value));
            }
        }

        Ok(attrs)
    }

    fn write_xattrs(&self, path: &Path, attrs: &[(OsString, Vec<u8>)]) -> Result<(), Error> {
        for (key, value) in attrs {
            if let Err(err) = xattr::set(path, key, value) {
                match err.raw_os_error() {
                    Some(nix::libc::ENOTSUP) => {
                        log::warn!(
                            "filesystem at {} does not support extended attributes",
                            path.display()
                        );
                        return Ok(());
                    }
                    Some(nix::libc::E2BIG) | Some(nix::libc::ERANGE) => {
                        return Err(Error::XAttributeTooLong {
                            key: key.to_string_lossy().to_string(),
                            value: String::from_utf8_lossy(value).to_string(),
                            path: path.display().to_string(),
                        });
                    }
                    _ => {
                        return Err(Error::XAttribute {
                            key: key.to_string_lossy().to_string(),
                            path: path.display().to_string(),
                            is_write: true,
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use fs_err as fs;

    use super::{ensure_dir_exists, FileOps, HostOps};

    #[test]
    fn link_or_copy_produces_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("a");
        let to = dir.path().join("b");
        fs::write(&from, b"content").unwrap();

        HostOps.link_or_copy(&from, &to).unwrap();

        assert_eq!(fs::read(&to).unwrap(), b"content");
    }

    #[test]
    fn ensure_dir_exists_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("x/y/z");

        ensure_dir_exists(&path).unwrap();
        ensure_dir_exists(&path).unwrap();

        assert!(path.is_dir());
    }
}
