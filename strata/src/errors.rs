// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Structured errors surfaced to the engine's caller.
//!
//! Every variant renders a one-line brief through [`std::fmt::Display`]; the
//! [`details`](Error::details), [`resolution`](Error::resolution) and
//! [`doc_slug`](Error::doc_slug) accessors carry the rest of the record so
//! frontends can format failures however they like.

use std::{io, path::PathBuf};

use itertools::Itertools;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("A circular dependency chain was detected.")]
    PartDependencyCycle,

    #[error("Application name '{name}' is invalid.")]
    InvalidApplicationName { name: String },

    #[error("A part named '{part_name}' is not defined in the parts list.")]
    InvalidPartName { part_name: String },

    #[error("Architecture '{arch_name}' is not supported.")]
    InvalidArchitecture { arch_name: String },

    #[error("Part '{part_name}' validation failed.")]
    PartSpecification { part_name: String, message: String },

    #[error("Plugin not defined for part '{part_name}'.")]
    UndefinedPlugin { part_name: String },

    #[error("Plugin '{plugin_name}' in part '{part_name}' is not registered.")]
    InvalidPlugin { plugin_name: String, part_name: String },

    #[error("Plugin '{plugin_name}' in part '{part_name}' cannot be used.")]
    PluginNotStrict { plugin_name: String, part_name: String },

    #[error("Plugin '{plugin_name}' does not support the {} {}.", humanize_list(.unsupported), noun(.unsupported, "build attribute"))]
    UnsupportedBuildAttributes {
        unsupported: Vec<String>,
        plugin_name: String,
    },

    #[error("Failed to copy or link file tree: {message}.")]
    CopyTree { message: String },

    #[error("Failed to copy '{name}': no such file or directory.")]
    CopyFileNotFound { name: String },

    #[error("Unable to {} extended attribute.", action(.is_write))]
    XAttribute { key: String, path: String, is_write: bool },

    #[error("Failed to write attribute: key and/or value is too long.")]
    XAttributeTooLong { key: String, value: String, path: String },

    #[error("Failed to organize part '{part_name}': {message}.")]
    FileOrganize { part_name: String, message: String },

    #[error("Unable to determine the host operating system ID.")]
    OsReleaseId,

    #[error("Unable to determine the host operating system name.")]
    OsReleaseName,

    #[error("Unable to determine the host operating system version ID.")]
    OsReleaseVersionId,

    #[error("Unable to determine the host operating system codename.")]
    OsReleaseCodename,

    #[error("'{name}' fileset error: {message}.")]
    Fileset { name: String, message: String },

    #[error("Failed to filter files: inconsistent 'stage' and 'prime' filesets.")]
    FilesetConflict { conflicting_files: Vec<String> },

    #[error("Failed to stage: parts list the same file with different contents or permissions.")]
    PartFilesConflict {
        part_name: String,
        other_part_name: String,
        conflicting_files: Vec<String>,
        partition: Option<String>,
    },

    #[error("Failed to stage: part files conflict with files already being staged.")]
    StageFilesConflict {
        part_name: String,
        conflicting_files: Vec<String>,
    },

    #[error("Environment validation failed for part '{part_name}': {reason}.")]
    PluginEnvironmentValidation { part_name: String, reason: String },

    #[error("Failed to run the pull script for part '{part_name}'.")]
    PluginPull { part_name: String },

    #[error("Failed to run the build script for part '{part_name}'.")]
    PluginBuild {
        part_name: String,
        plugin_name: String,
        stderr: Vec<u8>,
    },

    #[error("Failed to run the clean script for part '{part_name}'.")]
    PluginClean { part_name: String },

    #[error("'{scriptlet_name}' in part '{part_name}' executed an invalid control API call: {message}.")]
    InvalidControlApiCall {
        part_name: String,
        scriptlet_name: String,
        message: String,
    },

    #[error("'{scriptlet_name}' in part '{part_name}' failed with code {exit_code}.")]
    ScriptletRun {
        part_name: String,
        scriptlet_name: String,
        exit_code: i32,
        stderr: Vec<u8>,
    },

    #[error("Callback registration error: {message}.")]
    CallbackRegistration { message: String },

    #[error("Stage package not found in part '{part_name}': {package_name}.")]
    StagePackageNotFound { part_name: String, package_name: String },

    #[error("Overlay package not found in part '{part_name}': {package_name}.")]
    OverlayPackageNotFound { part_name: String, package_name: String },

    #[error("Failed when handling {}: command '{}' exited with code {exit_code}.", .deb_path.display(), .command.join(" "))]
    Deb {
        deb_path: PathBuf,
        command: Vec<String>,
        exit_code: i32,
    },

    #[error("{message}")]
    Feature { message: String },

    #[error("Action is invalid: {message}.")]
    InvalidAction { message: String },

    #[error("The overlay step is only supported on Linux.")]
    OverlayPlatform,

    #[error("Using the overlay step requires superuser privileges.")]
    OverlayPermission,

    #[error("{brief}")]
    Partition { brief: String },

    #[error("Invalid usage of partitions.")]
    PartitionUsage {
        error_list: Vec<String>,
        partitions: Vec<String>,
    },

    #[error("Possible misuse of partitions.")]
    PartitionUsageWarning { warning_list: Vec<String> },

    #[error("Requested partition does not exist: '{partition_name}'.")]
    PartitionNotFound {
        partition_name: String,
        partitions: Vec<String>,
    },

    #[error("Filesystem validation failed.")]
    FilesystemMount { message: String },

    #[error("io")]
    Io(#[from] io::Error),
}

impl Error {
    /// Further details on the error, if any.
    pub fn details(&self) -> Option<String> {
        match self {
            Error::PartSpecification { message, .. } => Some(message.clone()),
            Error::PluginNotStrict { .. } => {
                Some("Only plugins that are capable of building in strict mode are allowed.".into())
            }
            Error::XAttribute { key, path, is_write } => {
                Some(format!("Failed to {} attribute '{key}' on '{path}'.", action(is_write)))
            }
            Error::XAttributeTooLong { key, value, .. } => Some(format!("key='{key}', value='{value}'")),
            Error::FilesetConflict { conflicting_files } => Some(format!(
                "The following files have been excluded in the 'stage' fileset, but included by \
                 the 'prime' fileset: {conflicting_files:?}."
            )),
            Error::PartFilesConflict {
                part_name,
                other_part_name,
                conflicting_files,
                partition,
            } => {
                let partition_info = partition
                    .as_ref()
                    .map(|p| format!(" for the '{p}' partition"))
                    .unwrap_or_default();
                Some(format!(
                    "Parts '{part_name}' and '{other_part_name}' list the following files{partition_info}, \
                     but with different contents or permissions:\n{}",
                    indented(conflicting_files)
                ))
            }
            Error::StageFilesConflict {
                part_name,
                conflicting_files,
            } => Some(format!(
                "The following files in part '{part_name}' are already being staged with different \
                 content:\n{}",
                indented(conflicting_files)
            )),
            Error::PluginBuild { stderr, .. } | Error::ScriptletRun { stderr, .. } => execution_details(stderr),
            Error::PartitionUsage {
                error_list,
                partitions,
            } => Some(format!(
                "{}\nValid partitions: {}",
                error_list.join("\n"),
                partitions.join(", ")
            )),
            Error::PartitionUsageWarning { warning_list } => Some(format!(
                "The following entries begin with a valid partition name but are not wrapped in \
                 parentheses. These entries will go into the default partition.\n{}",
                warning_list.join("\n")
            )),
            Error::PartitionNotFound { partitions, .. } => {
                Some(format!("Valid partitions: {}", partitions.join(", ")))
            }
            Error::FilesystemMount { message } => Some(message.clone()),
            _ => None,
        }
    }

    /// Recommended resolution, if any.
    pub fn resolution(&self) -> Option<&str> {
        match self {
            Error::PartDependencyCycle => Some("Review the parts definition to remove dependency cycles."),
            Error::InvalidApplicationName { .. } => Some(
                "Valid application names contain letters, underscores or numbers, and must start with a letter.",
            ),
            Error::InvalidPartName { .. }
            | Error::Fileset { .. }
            | Error::PartitionUsageWarning { .. } => {
                Some("Review the parts definition and make sure it's correct.")
            }
            Error::InvalidArchitecture { .. } => Some("Make sure the architecture name is correct."),
            Error::PartSpecification { .. }
            | Error::UndefinedPlugin { .. }
            | Error::InvalidPlugin { .. } => Some("Review the part and make sure it's correct."),
            Error::UnsupportedBuildAttributes { .. } => {
                Some("Remove the build attributes, or use a different plugin.")
            }
            Error::CopyTree { .. } => Some("Make sure paths and permissions are correct."),
            Error::XAttribute { .. } => Some("Make sure your filesystem supports extended attributes."),
            Error::FilesetConflict { .. } => {
                Some("Make sure that the files included in 'prime' are also included in 'stage'.")
            }
            Error::PluginBuild { .. } => {
                Some("Check the build output and verify the project can work with the plugin.")
            }
            Error::InvalidControlApiCall { .. } | Error::ScriptletRun { .. } => {
                Some("Review the scriptlet and make sure it's correct.")
            }
            Error::Feature { .. } => Some("This operation cannot be executed."),
            Error::Deb { .. } => Some("Make sure the deb file is correctly specified."),
            Error::PartitionUsage { .. } | Error::PartitionNotFound { .. } => {
                Some("Correct the invalid partition name(s) and try again.")
            }
            _ => None,
        }
    }

    /// Documentation slug for consumers linking to reference docs.
    pub fn doc_slug(&self) -> Option<&str> {
        match self {
            Error::PluginBuild { .. } | Error::ScriptletRun { .. } => Some("/reference/plugins/"),
            _ => None,
        }
    }

    /// The brief, details and resolution joined into a printable report.
    pub fn report(&self) -> String {
        let mut components = vec![self.to_string()];
        components.extend(self.details());
        components.extend(self.resolution().map(String::from));
        components.join("\n")
    }
}

fn action(is_write: &bool) -> &'static str {
    if *is_write {
        "write"
    } else {
        "read"
    }
}

fn noun(items: &[String], singular: &str) -> String {
    if items.len() == 1 {
        singular.to_owned()
    } else {
        format!("{singular}s")
    }
}

fn humanize_list(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [only] => format!("'{only}'"),
        [first, second] => format!("'{first}' and '{second}'"),
        [head @ .., last] => {
            format!("{}, and '{last}'", head.iter().map(|i| format!("'{i}'")).join(", "))
        }
    }
}

fn indented(files: &[String]) -> String {
    files.iter().map(|f| format!("    {f}")).sorted().join("\n")
}

/// Extract the last three shell-trace lines from captured stderr.
///
/// Trace lines are the ones `set -x` emits with a leading `+`; everything
/// from the third-last trace line onwards is kept, each line prefixed `:: `.
fn execution_details(stderr: &[u8]) -> Option<String> {
    if stderr.is_empty() {
        return None;
    }

    let stderr = String::from_utf8_lossy(stderr);
    let lines = stderr.split('\n').filter(|line| !line.is_empty()).collect::<Vec<_>>();

    let mut anchor = 0;
    let mut count = 0;
    for (idx, line) in lines.iter().rev().enumerate() {
        if line.starts_with('+') {
            count += 1;
            if count > 3 {
                anchor = lines.len() - idx;
                break;
            }
        }
    }

    Some(lines[anchor..].iter().map(|line| format!("\n:: {line}")).collect())
}

#[cfg(test)]
mod test {
    use super::Error;

    #[test]
    fn brief_is_display() {
        let error = Error::PluginPull {
            part_name: "foo".into(),
        };
        assert_eq!(error.to_string(), "Failed to run the pull script for part 'foo'.");
        assert_eq!(error.details(), None);
    }

    #[test]
    fn execution_details_keeps_last_three_trace_lines() {
        let stderr = b"+ first\nout\n+ second\n+ third\n+ fourth\nmake: *** error\n".to_vec();
        let error = Error::PluginBuild {
            part_name: "foo".into(),
            plugin_name: "nil".into(),
            stderr,
        };
        let details = error.details().unwrap();
        assert_eq!(
            details,
            "\n:: out\n:: + second\n:: + third\n:: + fourth\n:: make: *** error"
        );
    }

    #[test]
    fn execution_details_with_few_trace_lines_keeps_everything() {
        let error = Error::ScriptletRun {
            part_name: "foo".into(),
            scriptlet_name: "override-build".into(),
            exit_code: 1,
            stderr: b"+ exit 1\n".to_vec(),
        };
        assert_eq!(error.details().unwrap(), "\n:: + exit 1");
    }

    #[test]
    fn empty_stderr_has_no_details() {
        let error = Error::ScriptletRun {
            part_name: "foo".into(),
            scriptlet_name: "override-build".into(),
            exit_code: 1,
            stderr: vec![],
        };
        assert_eq!(error.details(), None);
    }

    #[test]
    fn report_joins_components() {
        let error = Error::InvalidArchitecture {
            arch_name: "riscv128".into(),
        };
        assert_eq!(
            error.report(),
            "Architecture 'riscv128' is not supported.\nMake sure the architecture name is correct."
        );
    }

    #[test]
    fn unsupported_build_attributes_humanizes() {
        let error = Error::UnsupportedBuildAttributes {
            unsupported: vec!["a".into(), "b".into(), "c".into()],
            plugin_name: "make".into(),
        };
        assert_eq!(
            error.to_string(),
            "Plugin 'make' does not support the 'a', 'b', and 'c' build attributes."
        );
    }
}
