//! Tutor Core
//!
//! The tutoring engine: a per-learner session state machine, the pipeline
//! that turns a generated explanation into interleaved text and image
//! segments, and the similarity-search subsystem that finds those images.
//! Hosting (HTTP, CLI, durable storage) lives in the service crate.

pub mod augment;
pub mod embedding;
pub mod generation;
pub mod history;
pub mod images;
pub mod index;
pub mod prompts;
pub mod session;
pub mod stack;
