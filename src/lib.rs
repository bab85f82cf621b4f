//! Prepare a decoder for LoRA fine-tuning: build the base and adapted
//! models, copy the base weights across and mark only the adapters
//! trainable.
#![recursion_limit = "256"]

pub mod application;
pub mod cli;
pub mod domain;
pub mod infra;
pub mod ml;
