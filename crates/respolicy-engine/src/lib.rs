#![doc = include_str!("../readme.md")]

pub mod controllers;
pub mod core;
pub mod engine;
pub mod policies;
pub mod runtime;
