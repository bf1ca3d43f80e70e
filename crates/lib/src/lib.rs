//! stackrun-lib: discovery, dependency graph, and concurrent execution of IaC units
//!
//! This crate provides the engine behind stackrun:
//! - `Discoverer`: walks a directory tree and collects units and stacks
//! - `GraphBuilder`: resolves declared dependencies into a validated DAG
//! - `StackRunner`: runs an action across the graph with bounded concurrency

pub mod component;
pub mod config;
pub mod consts;
pub mod discovery;
pub mod graph;
pub mod parser;
pub mod runner;
pub mod util;

pub use component::{Component, ComponentId, Components, Kind, Stack, Unit, UnitStatus};
pub use config::{ConfigError, EngineConfig, RunOptions, RunSettings};
pub use discovery::{Discoverer, DiscoveryError, DiscoveryOptions, ParseErrorPolicy};
pub use graph::{DependencyGraph, GraphBuilder, GraphError};
pub use parser::{ComponentConfig, ConfigParser, Expression, ParseError, TomlConfigParser};
pub use runner::{
  ExecuteError, ExecutionOutcome, ExecutionRequest, Executor, ProcessExecutor, RunEvent, RunFailure, RunSummary,
  StackError, StackRunner, UnitError, find_stack_in_subfolders,
};
