//! # Kernel Information
//!
//! Boot-handoff data and fixed memory-layout constants shared by the memory
//! subsystem crates.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod boot;
pub mod memory;
