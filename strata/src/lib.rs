// SPDX-FileCopyrightText: Copyright © 2024-2026 Strata Developers
//
// SPDX-License-Identifier: MPL-2.0

//! Step execution core of a parts-based build engine.
//!
//! Turns one (part, step) invocation into filesystem effects: running
//! plugin commands, migrating fileset-selected content between the
//! install, stage and prime trees, and mediating the control channel
//! offered to user scriptlets.

pub use self::errors::Error;
pub use self::executor::script::Output;
pub use self::executor::{Backstage, PartitionContents, StepContents, StepHandler};
pub use self::info::StepInfo;
pub use self::part::{Part, PartDirs, PartSpec, Permissions};
pub use self::plugin::Plugin;
pub use self::source::SourceHandler;
pub use self::step::Step;

pub mod errors;
pub mod executor;
pub mod info;
pub mod part;
pub mod partition;
pub mod pkgconfig;
pub mod plugin;
pub mod source;
pub mod step;
pub mod util;
