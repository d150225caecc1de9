pub mod acts;
pub mod config;
pub mod context;
pub mod generation;
pub mod iap;
pub mod judge;
pub mod lexicon;
pub mod matcher;
pub mod orchestrator;
pub mod pipeline;
pub mod prompts;
pub mod registry;
pub mod tracker;
pub mod zap;
