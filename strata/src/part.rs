// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Parts and their resolved on-disk layout.

use std::{
    io,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use fs_err as fs;
use nix::unistd::{chown, Gid, Uid};
use serde::{Deserialize, Serialize};

use crate::{errors::Error, partition::DEFAULT_PARTITION, util};

/// A named unit of the build, fully resolved by the caller.
#[derive(Debug)]
pub struct Part {
    pub name: String,
    pub plugin_name: String,
    pub spec: PartSpec,
    pub dirs: PartDirs,
}

impl Part {
    pub fn new(name: impl ToString, plugin_name: impl ToString, spec: PartSpec, dirs: PartDirs) -> Self {
        Self {
            name: name.to_string(),
            plugin_name: plugin_name.to_string(),
            spec,
            dirs,
        }
    }
}

/// The declarative pieces of a part the step executor consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartSpec {
    pub stage_files: Vec<String>,
    pub prime_files: Vec<String>,
    pub permissions: Vec<Permissions>,
}

impl Default for PartSpec {
    fn default() -> Self {
        Self {
            stage_files: vec!["*".to_owned()],
            prime_files: vec!["*".to_owned()],
            permissions: vec![],
        }
    }
}

/// Ownership and mode overrides applied to migrated paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Permissions {
    pub path: Option<String>,
    pub owner: Option<u32>,
    pub group: Option<u32>,
    pub mode: Option<String>,
}

impl Permissions {
    /// Whether this entry covers the given relative path.
    pub fn applies_to(&self, path: &str) -> bool {
        let pattern = self.path.as_deref().unwrap_or("*");

        pattern == "*"
            || glob::Pattern::new(pattern)
                .map(|pattern| pattern.matches(path))
                .unwrap_or_default()
    }

    /// Apply the overrides to a path on disk.
    pub fn apply(&self, path: &Path) -> io::Result<()> {
        if let Some(mode) = &self.mode {
            let mode = u32::from_str_radix(mode, 8)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid mode '{mode}'")))?;
            fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        }

        if self.owner.is_some() || self.group.is_some() {
            chown(path, self.owner.map(Uid::from_raw), self.group.map(Gid::from_raw))?;
        }

        Ok(())
    }
}

/// Resolved directory layout for one part.
///
/// Partitioned layouts root every named partition under
/// `partitions/<name>`, with the default partition living at the work dir
/// root. Construction ensures the consumed directories exist.
#[derive(Debug, Clone)]
pub struct PartDirs {
    work_dir: PathBuf,
    part_base: PathBuf,
    partitions: Vec<String>,
}

impl PartDirs {
    pub fn new(work_dir: impl Into<PathBuf>, part_name: &str, partitions: Option<&[String]>) -> io::Result<Self> {
        let work_dir = work_dir.into();
        let part_base = work_dir.join("parts").join(part_name);

        let dirs = Self {
            work_dir,
            part_base,
            partitions: partitions.unwrap_or_default().to_vec(),
        };

        util::ensure_dir_exists(&dirs.part_src_subdir())?;
        util::ensure_dir_exists(&dirs.part_build_subdir())?;
        util::ensure_dir_exists(&dirs.part_run_dir())?;
        util::ensure_dir_exists(&dirs.part_export_dir())?;
        util::ensure_dir_exists(&dirs.backstage_dir())?;
        for partition in dirs.partition_names() {
            util::ensure_dir_exists(&dirs.install_dir(&partition).expect("known partition"))?;
            util::ensure_dir_exists(&dirs.stage_dir(&partition).expect("known partition"))?;
            util::ensure_dir_exists(&dirs.prime_dir(&partition).expect("known partition"))?;
        }

        Ok(dirs)
    }

    fn partition_names(&self) -> Vec<String> {
        if self.partitions.is_empty() {
            vec![DEFAULT_PARTITION.to_owned()]
        } else {
            self.partitions.clone()
        }
    }

    fn default_partition(&self) -> &str {
        self.partitions.first().map(String::as_str).unwrap_or(DEFAULT_PARTITION)
    }

    fn check_partition(&self, partition: &str) -> Result<(), Error> {
        let known = self.partitions.is_empty() && partition == DEFAULT_PARTITION
            || self.partitions.iter().any(|p| p == partition);

        if known {
            Ok(())
        } else {
            Err(Error::PartitionNotFound {
                partition_name: partition.to_owned(),
                partitions: self.partition_names(),
            })
        }
    }

    fn partition_root(&self, partition: &str) -> PathBuf {
        if partition == self.default_partition() {
            self.work_dir.clone()
        } else {
            self.work_dir.join("partitions").join(partition)
        }
    }

    pub fn install_dir(&self, partition: &str) -> Result<PathBuf, Error> {
        self.check_partition(partition)?;
        if partition == self.default_partition() {
            Ok(self.part_base.join("install"))
        } else {
            Ok(self.part_base.join("partitions").join(partition).join("install"))
        }
    }

    pub fn stage_dir(&self, partition: &str) -> Result<PathBuf, Error> {
        self.check_partition(partition)?;
        Ok(self.partition_root(partition).join("stage"))
    }

    pub fn prime_dir(&self, partition: &str) -> Result<PathBuf, Error> {
        self.check_partition(partition)?;
        Ok(self.partition_root(partition).join("prime"))
    }

    /// Install dir of the default partition.
    pub fn part_install_dir(&self) -> PathBuf {
        self.part_base.join("install")
    }

    /// Stage dir of the default partition.
    pub fn part_stage_dir(&self) -> PathBuf {
        self.work_dir.join("stage")
    }

    /// Prime dir of the default partition.
    pub fn part_prime_dir(&self) -> PathBuf {
        self.work_dir.join("prime")
    }

    pub fn part_src_subdir(&self) -> PathBuf {
        self.part_base.join("src")
    }

    pub fn part_build_subdir(&self) -> PathBuf {
        self.part_base.join("build")
    }

    pub fn part_run_dir(&self) -> PathBuf {
        self.part_base.join("run")
    }

    pub fn part_export_dir(&self) -> PathBuf {
        self.part_base.join("export")
    }

    pub fn backstage_dir(&self) -> PathBuf {
        self.work_dir.join("backstage")
    }
}
