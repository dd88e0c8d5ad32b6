pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod graph;
pub mod packaging;
pub mod server;
pub mod staging;
pub mod storage;
pub mod submit;
