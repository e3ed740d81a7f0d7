// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Per-invocation step information and project variables.

use std::collections::HashMap;

use thiserror::Error;

use crate::{partition::DEFAULT_PARTITION, step::Step};

/// State passed to the step handler for one (part, step) invocation.
///
/// Project variables must be declared up front; a variable can be updated
/// once and read back raw by scriptlets through the control channel.
#[derive(Debug)]
pub struct StepInfo {
    step: Step,
    default_partition: String,
    project_vars: HashMap<String, ProjectVar>,
}

#[derive(Debug, Clone)]
struct ProjectVar {
    value: String,
    updated: bool,
}

impl StepInfo {
    pub fn new(step: Step) -> Self {
        Self {
            step,
            default_partition: DEFAULT_PARTITION.to_owned(),
            project_vars: HashMap::new(),
        }
    }

    pub fn with_default_partition(self, default_partition: impl ToString) -> Self {
        Self {
            default_partition: default_partition.to_string(),
            ..self
        }
    }

    /// Declare a project variable with an initial value.
    pub fn with_project_var(mut self, name: impl ToString, value: impl ToString) -> Self {
        self.project_vars.insert(
            name.to_string(),
            ProjectVar {
                value: value.to_string(),
                updated: false,
            },
        );
        self
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn default_partition(&self) -> &str {
        &self.default_partition
    }

    pub fn set_project_var(&mut self, name: &str, value: &str) -> Result<(), VarError> {
        let var = self.project_vars.get_mut(name).ok_or_else(|| VarError::Undefined {
            name: name.to_owned(),
        })?;

        if var.updated {
            return Err(VarError::AlreadySet { name: name.to_owned() });
        }

        var.value = value.to_owned();
        var.updated = true;

        Ok(())
    }

    /// Read a project variable.
    ///
    /// Unless `raw_read` is set, reading a variable that was never updated
    /// is an error; the control channel always reads raw.
    pub fn get_project_var(&self, name: &str, raw_read: bool) -> Result<String, VarError> {
        let var = self.project_vars.get(name).ok_or_else(|| VarError::Undefined {
            name: name.to_owned(),
        })?;

        if !raw_read && !var.updated {
            return Err(VarError::NotSet { name: name.to_owned() });
        }

        Ok(var.value.clone())
    }
}

#[derive(Debug, Error)]
pub enum VarError {
    #[error("'{name}' is not a project variable")]
    Undefined { name: String },
    #[error("variable '{name}' can be set only once")]
    AlreadySet { name: String },
    #[error("variable '{name}' has not been set")]
    NotSet { name: String },
}
