//! Shared test support (not a standalone test target).

pub mod faulty_directory;

pub use faulty_directory::FaultyDirectory;
