//! Infrastructure layer: job storage, runner, schedules, config.

pub mod config;
pub mod db;
pub mod jobs;

#[cfg(test)]
mod integration_tests;
