//! Dialogue Engine: affective-state tracking and action-preserving
//! translation for scripted dialogue.
//!
//! Each character's emotional pressure is tracked turn by turn while every
//! line goes through a three-stage generation pipeline. Translations are
//! scored for illocutionary fidelity (IAP) and surface-marker fidelity (ZAP).

pub mod core;
pub mod schema;

pub use crate::core::config::EngineConfig;
pub use crate::core::generation::{FnGenerator, GenerationError, Generator};
pub use crate::core::orchestrator::{DialogueEngine, EngineError, SceneError};
pub use crate::core::registry::PersonaRegistry;
pub use crate::schema::record::{SceneReport, TurnRecord};
pub use crate::schema::scene::SceneDefinition;
