// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Execution of built-in and user-specified step commands.
//!
//! The step handler runs one step of one part: either the step's built-in
//! action, or a user scriptlet that may call back into the engine over the
//! control channel while it runs.

use std::{
    collections::{BTreeMap, BTreeSet},
    os::unix::fs::PermissionsExt,
    path::Path,
};

use fs_err as fs;
use serde::{Deserialize, Serialize};

pub mod ctl;
pub mod fileset;
pub mod migration;
pub mod script;

use self::fileset::Fileset;
use self::migration::Migration;
use self::script::Output;
use crate::{
    errors::Error,
    info::StepInfo,
    part::Part,
    partition::DEFAULT_PARTITION,
    pkgconfig,
    plugin::Plugin,
    source::SourceHandler,
    step::Step,
    util::HostOps,
};

#[cfg(test)]
#[path = "./executor_test.rs"]
mod executor_test;

/// Backstage content staged by a part for consumption by other parts.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backstage {
    pub files: BTreeSet<String>,
    pub dirs: BTreeSet<String>,
}

/// Files and directories a step contributed to one partition.
///
/// `backstage` is present exactly on stage-step records; only the default
/// partition ever carries backstage content.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionContents {
    pub files: BTreeSet<String>,
    pub dirs: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backstage: Option<Backstage>,
}

/// Everything a step wrote, keyed by partition.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepContents {
    pub partitions_contents: BTreeMap<String, PartitionContents>,
}

impl StepContents {
    /// An empty record keyed by the given partitions, or by the default
    /// partition alone. An empty partition list means no partitions.
    pub fn new(partitions: Option<&[String]>, stage: bool) -> Self {
        let names = match partitions {
            Some(partitions) if !partitions.is_empty() => partitions.to_vec(),
            _ => vec![DEFAULT_PARTITION.to_owned()],
        };

        Self {
            partitions_contents: names
                .into_iter()
                .map(|name| {
                    (
                        name,
                        PartitionContents {
                            backstage: stage.then(Backstage::default),
                            ..Default::default()
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Executes built-in or user-specified step commands for one part.
///
/// Constructed per (part, step) invocation; owns no state that survives
/// the call.
pub struct StepHandler<'a> {
    part: &'a Part,
    step_info: &'a mut StepInfo,
    plugin: &'a dyn Plugin,
    source_handler: Option<&'a mut dyn SourceHandler>,
    env: String,
    output: Output,
    partitions: Option<Vec<String>>,
}

impl<'a> StepHandler<'a> {
    pub fn new(part: &'a Part, step_info: &'a mut StepInfo, plugin: &'a dyn Plugin, env: impl ToString) -> Self {
        Self {
            part,
            step_info,
            plugin,
            source_handler: None,
            env: env.to_string(),
            output: Output::default(),
            partitions: None,
        }
    }

    pub fn with_source_handler(self, source_handler: &'a mut dyn SourceHandler) -> Self {
        Self {
            source_handler: Some(source_handler),
            ..self
        }
    }

    pub fn with_output(self, output: Output) -> Self {
        Self { output, ..self }
    }

    /// Enable partitioned mode. An empty list is the same as no partitions.
    pub fn with_partitions(self, partitions: Vec<String>) -> Self {
        Self {
            partitions: (!partitions.is_empty()).then_some(partitions),
            ..self
        }
    }

    /// Run the built-in action for the current step.
    pub fn run_builtin(&mut self) -> Result<StepContents, Error> {
        match self.step_info.step() {
            Step::Pull => self.builtin_pull(),
            Step::Overlay => self.builtin_overlay(),
            Step::Build => self.builtin_build(),
            Step::Stage => self.builtin_stage(),
            Step::Prime => self.builtin_prime(),
        }
    }

    fn builtin_pull(&mut self) -> Result<StepContents, Error> {
        if let Some(source_handler) = self.source_handler.as_deref_mut() {
            source_handler.pull()?;
        }

        let pull_commands = self.plugin.pull_commands();

        if !pull_commands.is_empty() {
            script::run(
                &pull_commands,
                &self.part.dirs.part_run_dir().join("pull.sh"),
                &self.part.dirs.part_src_subdir(),
                None,
                &self.output,
                None,
            )
            .map_err(|err| match err {
                script::Error::Process { .. } => Error::PluginPull {
                    part_name: self.part.name.clone(),
                },
                script::Error::Engine(error) => *error,
                script::Error::Io(error) => Error::Io(error),
            })?;
        }

        Ok(StepContents::new(None, false))
    }

    fn builtin_overlay(&mut self) -> Result<StepContents, Error> {
        Ok(StepContents::new(None, false))
    }

    fn builtin_build(&mut self) -> Result<StepContents, Error> {
        let build_commands = self.plugin.build_commands();

        let environment_script_path = self.part.dirs.part_run_dir().join("environment.sh");
        fs::write(&environment_script_path, &self.env)?;
        fs::set_permissions(&environment_script_path, std::fs::Permissions::from_mode(0o644))?;

        script::run(
            &build_commands,
            &self.part.dirs.part_run_dir().join("build.sh"),
            &self.part.dirs.part_build_subdir(),
            Some(&environment_script_path),
            &self.output,
            None,
        )
        .map_err(|err| match err {
            script::Error::Process { stderr, .. } => Error::PluginBuild {
                part_name: self.part.name.clone(),
                plugin_name: self.part.plugin_name.clone(),
                stderr,
            },
            script::Error::Engine(error) => *error,
            script::Error::Io(error) => Error::Io(error),
        })?;

        Ok(StepContents::new(None, false))
    }

    fn builtin_stage(&mut self) -> Result<StepContents, Error> {
        let default_partition = self.step_info.default_partition().to_owned();
        let stage_fileset = Fileset::new(self.part.spec.stage_files.clone(), "stage", &default_partition);

        // pkg-config prefixes always swap the default install dir for the
        // default stage dir, whichever partition the file migrates into
        let install_dir = self.part.dirs.part_install_dir();
        let stage_dir = self.part.dirs.part_stage_dir();
        let mut fixup = move |path: &Path| -> Result<(), Error> {
            if path.extension().and_then(|ext| ext.to_str()) != Some("pc") {
                return Ok(());
            }
            if path.symlink_metadata()?.file_type().is_symlink() {
                return Ok(());
            }
            pkgconfig::fix_pkg_config(&stage_dir, path, &install_dir)
        };

        let mut contents = StepContents::new(self.partitions.as_deref(), true);

        if let Some(partitions) = self.partitions.clone() {
            let backstage_fileset = Fileset::new(
                vec![format!("({default_partition})/*")],
                "backstage",
                &default_partition,
            );
            let (backstage_files, backstage_dirs) = fileset::migratable_filesets(
                &backstage_fileset,
                &self.part.dirs.part_export_dir(),
                &default_partition,
                Some(&default_partition),
            )?;

            for partition in &partitions {
                let partition_install_dir = self.part.dirs.install_dir(partition)?;
                let (files, dirs) = fileset::migratable_filesets(
                    &stage_fileset,
                    &partition_install_dir,
                    &default_partition,
                    Some(partition),
                )?;

                let migration = migration::migrate_files(
                    &files,
                    &dirs,
                    &partition_install_dir,
                    &self.part.dirs.stage_dir(partition)?,
                    &HostOps,
                    Some(&mut fixup),
                    &[],
                )?;
                self.ensure_no_conflicts(&migration)?;

                // Backstage content is managed only in the default partition
                let backstage = if partition == &default_partition {
                    let backstage_migration = migration::migrate_files(
                        &backstage_files,
                        &backstage_dirs,
                        &self.part.dirs.part_export_dir(),
                        &self.part.dirs.backstage_dir(),
                        &HostOps,
                        None,
                        &[],
                    )?;
                    self.ensure_no_conflicts(&backstage_migration)?;

                    Backstage {
                        files: backstage_migration.files,
                        dirs: backstage_migration.dirs,
                    }
                } else {
                    Backstage::default()
                };

                contents.partitions_contents.insert(
                    partition.clone(),
                    PartitionContents {
                        files: migration.files,
                        dirs: migration.dirs,
                        backstage: Some(backstage),
                    },
                );
            }
        } else {
            let install_dir = self.part.dirs.part_install_dir();
            let (files, dirs) = fileset::migratable_filesets(&stage_fileset, &install_dir, DEFAULT_PARTITION, None)?;

            let migration = migration::migrate_files(
                &files,
                &dirs,
                &install_dir,
                &self.part.dirs.part_stage_dir(),
                &HostOps,
                Some(&mut fixup),
                &[],
            )?;
            self.ensure_no_conflicts(&migration)?;

            let backstage_fileset = Fileset::new(vec!["*".to_owned()], "backstage", DEFAULT_PARTITION);
            let (backstage_files, backstage_dirs) = fileset::migratable_filesets(
                &backstage_fileset,
                &self.part.dirs.part_export_dir(),
                DEFAULT_PARTITION,
                None,
            )?;

            let backstage_migration = migration::migrate_files(
                &backstage_files,
                &backstage_dirs,
                &self.part.dirs.part_export_dir(),
                &self.part.dirs.backstage_dir(),
                &HostOps,
                None,
                &[],
            )?;
            self.ensure_no_conflicts(&backstage_migration)?;

            contents.partitions_contents.insert(
                DEFAULT_PARTITION.to_owned(),
                PartitionContents {
                    files: migration.files,
                    dirs: migration.dirs,
                    backstage: Some(Backstage {
                        files: backstage_migration.files,
                        dirs: backstage_migration.dirs,
                    }),
                },
            );
        }

        Ok(contents)
    }

    fn builtin_prime(&mut self) -> Result<StepContents, Error> {
        let default_partition = self.step_info.default_partition().to_owned();
        let mut prime_fileset = Fileset::new(self.part.spec.prime_files.clone(), "prime", &default_partition);

        // Without an explicit prime filter, prime what stage produced
        if prime_fileset.entries() == ["*"] || prime_fileset.includes().is_empty() {
            let stage_fileset = Fileset::new(self.part.spec.stage_files.clone(), "stage", &default_partition);
            prime_fileset.combine(&stage_fileset)?;
        }

        let mut contents = StepContents::new(self.partitions.as_deref(), false);

        if let Some(partitions) = self.partitions.clone() {
            for partition in &partitions {
                let (files, dirs) = fileset::migratable_filesets(
                    &prime_fileset,
                    &self.part.dirs.install_dir(partition)?,
                    &default_partition,
                    Some(partition),
                )?;

                let migration = migration::migrate_files(
                    &files,
                    &dirs,
                    &self.part.dirs.stage_dir(partition)?,
                    &self.part.dirs.prime_dir(partition)?,
                    &HostOps,
                    None,
                    &self.part.spec.permissions,
                )?;
                self.ensure_no_conflicts(&migration)?;

                contents.partitions_contents.insert(
                    partition.clone(),
                    PartitionContents {
                        files: migration.files,
                        dirs: migration.dirs,
                        backstage: None,
                    },
                );
            }
        } else {
            let (files, dirs) = fileset::migratable_filesets(
                &prime_fileset,
                &self.part.dirs.part_install_dir(),
                DEFAULT_PARTITION,
                None,
            )?;

            let migration = migration::migrate_files(
                &files,
                &dirs,
                &self.part.dirs.part_stage_dir(),
                &self.part.dirs.part_prime_dir(),
                &HostOps,
                None,
                &self.part.spec.permissions,
            )?;
            self.ensure_no_conflicts(&migration)?;

            contents.partitions_contents.insert(
                DEFAULT_PARTITION.to_owned(),
                PartitionContents {
                    files: migration.files,
                    dirs: migration.dirs,
                    backstage: None,
                },
            );
        }

        Ok(contents)
    }

    fn ensure_no_conflicts(&self, migration: &Migration) -> Result<(), Error> {
        if migration.conflicts.is_empty() {
            return Ok(());
        }

        Err(Error::StageFilesConflict {
            part_name: self.part.name.clone(),
            conflicting_files: migration.conflicts.clone(),
        })
    }

    /// Execute a scriptlet with a live control channel.
    ///
    /// The socket, environment script and scriptlet itself live in a
    /// private temp dir released on every exit path.
    pub fn run_scriptlet(
        &mut self,
        scriptlet: &str,
        scriptlet_name: &str,
        step: Step,
        work_dir: &Path,
    ) -> Result<(), Error> {
        let tempdir = tempfile::Builder::new().prefix("strata-scriptlet-").tempdir()?;

        let socket_path = tempdir.path().join("craftctl.socket");
        let mut server = ctl::Server::bind(&socket_path)?;

        let environment = format!("export {}={}\n{}", ctl::SOCKET_ENV, socket_path.display(), self.env);
        let environment_script_path = tempdir.path().join("scriptlet_environment.sh");
        fs::write(&environment_script_path, environment)?;
        fs::set_permissions(&environment_script_path, std::fs::Permissions::from_mode(0o644))?;

        let output = self.output.clone();
        let commands = vec![scriptlet.to_owned()];
        let part_name = self.part.name.clone();

        let mut api = ControlApi {
            handler: self,
            step,
            scriptlet_name,
        };

        let result = script::run(
            &commands,
            &tempdir.path().join("scriptlet.sh"),
            work_dir,
            Some(&environment_script_path),
            &output,
            Some(script::Ctl {
                server: &mut server,
                handler: &mut api,
            }),
        );

        match result {
            Ok(()) => Ok(()),
            Err(script::Error::Process { exit_code, stderr }) => Err(Error::ScriptletRun {
                part_name,
                scriptlet_name: scriptlet_name.to_owned(),
                exit_code,
                stderr,
            }),
            Err(script::Error::Engine(error)) => Err(*error),
            Err(script::Error::Io(error)) => Err(Error::Io(error)),
        }
    }

    /// Re-enter the step's built-in action on behalf of a control call.
    fn execute_builtin(&mut self, step: Step) -> Result<(), Error> {
        match step {
            Step::Pull => self.builtin_pull().map(drop),
            Step::Overlay => self.builtin_overlay().map(drop),
            Step::Build => self.builtin_build().map(drop),
            Step::Stage => self.builtin_stage().map(drop),
            Step::Prime => self.builtin_prime().map(drop),
        }
    }

    fn handle_control_api(
        &mut self,
        step: Step,
        scriptlet_name: &str,
        message: &str,
    ) -> Result<Option<String>, ctl::Fault> {
        let part_name = self.part.name.clone();
        let fatal = |message: String| {
            ctl::Fault::Fatal(Error::InvalidControlApiCall {
                part_name: part_name.clone(),
                scriptlet_name: scriptlet_name.to_owned(),
                message,
            })
        };

        let request: serde_json::Value = serde_json::from_str(message)
            .map_err(|_| fatal(format!("scriptlet called a function with invalid json: {message}")))?;

        let function = request
            .get("function")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| fatal("control call missing attribute 'function'".to_owned()))?
            .to_owned();

        let args = request
            .get("args")
            .cloned()
            .ok_or_else(|| fatal("control call missing attribute 'args'".to_owned()))?;
        let args: Vec<String> =
            serde_json::from_value(args).map_err(|_| fatal("control call missing attribute 'args'".to_owned()))?;

        self.process_api_command(&function, &args, step, scriptlet_name)
    }

    fn process_api_command(
        &mut self,
        command: &str,
        args: &[String],
        step: Step,
        scriptlet_name: &str,
    ) -> Result<Option<String>, ctl::Fault> {
        let part_name = self.part.name.clone();
        let invalid_call = |message: String| {
            ctl::Fault::Recoverable(Error::InvalidControlApiCall {
                part_name: part_name.clone(),
                scriptlet_name: scriptlet_name.to_owned(),
                message,
            })
        };

        match command {
            "default" => {
                if !args.is_empty() {
                    return Err(invalid_call(format!("invalid arguments to command '{command}'")));
                }

                self.execute_builtin(step).map_err(|error| match error {
                    // A failing build invoked through `default` aborts the
                    // whole scriptlet run rather than replying ERR
                    fatal @ Error::PluginBuild { .. } => ctl::Fault::Fatal(fatal),
                    recoverable => ctl::Fault::Recoverable(recoverable),
                })?;

                Ok(None)
            }
            "set" => {
                if args.len() != 1 {
                    return Err(invalid_call(format!("invalid arguments to command '{command}'")));
                }

                let Some((name, value)) = args[0].split_once('=') else {
                    return Err(invalid_call(format!(
                        "invalid arguments to command '{command}' (want key=value)"
                    )));
                };

                self.step_info
                    .set_project_var(name, value)
                    .map_err(|err| invalid_call(err.to_string()))?;

                Ok(None)
            }
            "get" => {
                if args.len() != 1 {
                    return Err(invalid_call(format!(
                        "invalid number of arguments to command '{command}'"
                    )));
                }

                let value = self
                    .step_info
                    .get_project_var(&args[0], true)
                    .map_err(|err| invalid_call(err.to_string()))?;

                Ok(Some(value))
            }
            _ => Err(invalid_call(format!("invalid command '{command}'"))),
        }
    }
}

struct ControlApi<'h, 'a> {
    handler: &'h mut StepHandler<'a>,
    step: Step,
    scriptlet_name: &'h str,
}

impl ctl::Handler for ControlApi<'_, '_> {
    fn call(&mut self, message: &str) -> Result<Option<String>, ctl::Fault> {
        self.handler.handle_control_api(self.step, self.scriptlet_name, message)
    }
}
