//! The import engine: legacy sources, the id registry, phase transforms, the
//! COPY loader and post-load fixup.

pub mod context;
pub mod copy;
pub mod db;
pub mod entity;
pub mod etl;
pub mod fixup;
pub mod merge;
pub mod names;
pub mod process;
pub mod progress;
pub mod records;
pub mod registry;
pub mod runner;
pub mod source;
pub mod sources;
pub mod uploads;

#[cfg(test)]
pub mod testing;
