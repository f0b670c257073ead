pub mod archive;
pub mod catalog;
pub mod cleanup;
pub mod commands;
pub mod config;
pub mod context;
pub mod download;
pub mod error;
pub mod http;
pub mod install;
pub mod manifest;
pub mod repository;
pub mod rules;
pub mod runtime;
