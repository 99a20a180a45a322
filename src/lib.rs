pub mod attest;
pub mod checkpoint;
pub mod conductor_config;
pub mod constraints;
pub mod dag;
pub mod errors;
pub mod evidence;
pub mod executor;
pub mod init;
pub mod manifest;
pub mod scope;
pub mod tracker;
pub mod ui;
