#![doc = "repo-wiki: repository ingestion and incremental documentation pipeline."]

//! This crate ingests tracked source repositories, incrementally reconciles an
//! LLM-planned documentation catalogue against their new commits, generates
//! changelogs, builds per-warehouse knowledge maps and drives cancellable
//! translation tasks.
//!
//! The pipeline core talks to its collaborators (git plumbing, LLM backend,
//! durable store, document/map builders) through the traits in [`contract`];
//! concrete implementations live in [`git`], [`llm`] and [`store`].

pub mod analysis;
pub mod changelog;
pub mod cli;
pub mod config;
pub mod contract;
pub mod coordinator;
pub mod extract;
pub mod git;
pub mod llm;
pub mod minimap;
pub mod model;
pub mod retry;
pub mod store;
pub mod translation;
