pub mod context;
pub mod error;
pub mod executable_utils;
pub mod model;
pub mod processor;
pub mod queue;
pub mod scorers;
pub mod segments;
pub mod settings;
pub mod storage;
