//! Core of the bilingual listing generator: rules synchronisation with a
//! two-stage trust chain, requirement-file discovery, the bounded-concurrency
//! run controller with per-job polling and tracing, trace-event rendering,
//! output naming, DOCX conversion, and the dual-sink logger.

pub mod config;
pub mod docx;
pub mod input;
pub mod logger;
pub mod output;
pub mod rules;
pub mod run;
pub mod trace;

pub use docx::{MarkdownToDocx, SylMd2Doc};
pub use input::RequirementFile;
pub use logger::Logger;
pub use run::{run_gen, run_update_rules, GenOptions, RunCancelled, RunConfig, UpdateRulesOptions};
