//! modvault - mod package manager engine
//!
//! Installs packages (zip archives or folders) into a destination folder,
//! keeps a reversible backup of everything they overwrite, and keeps the
//! local library in sync with remote repositories.

pub mod backup;
pub mod batch;
pub mod codec;
pub mod document;
pub mod hash;
pub mod identity;
pub mod install;
pub mod location;
pub mod overlap;
pub mod package;
pub mod paths;
pub mod repository;
pub mod warning;
pub mod worker;
pub mod xml;
