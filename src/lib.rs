pub mod calendar;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod error;
mod fs_util;
pub mod normalize;
pub mod output;
pub mod pipeline;
pub mod retrieval;
pub mod staging;
pub mod summary;
