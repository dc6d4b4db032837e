//! Shared configuration for the `taskrun` harness.

pub mod settings;
