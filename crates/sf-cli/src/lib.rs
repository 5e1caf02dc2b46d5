// SPDX-License-Identifier: MIT OR Apache-2.0
//! Library-level building blocks for the run engine CLI, factored out of
//! `main.rs` so they can be exercised without spawning the binary.
#![deny(unsafe_code)]

pub mod commands;
pub mod format;
