#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod ast;
mod coerce;
mod core;
mod engine;
mod error;
pub mod graph;
#[cfg(feature = "logging")]
pub mod logging;
pub mod name;
pub mod plugin;
pub mod plugins;
pub mod repo;
mod value;

pub use crate::core::Hash32;
pub use crate::engine::{BuildReport, Diagnostics, Engine, EngineOptions, TaskExecution, scheduler};
pub use crate::error::*;
pub use crate::graph::global::{GlobalTaskId, ProjectId, ProjectLocation, TaskContext};
pub use crate::plugin::{
    BuildContext, NativeRule, NativeRules, NoInvoker, PluginInvoker, PluginReturn, PreloadedPlugin,
    RuleIdentity, ScriptParser,
};
pub use crate::repo::{Repo, RunConfig};
pub use crate::value::{RuleRef, Type, Value};
