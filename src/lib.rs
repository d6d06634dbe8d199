//! Voice-to-visualization backend: database connect/execute, natural-language
//! to SQL via Gemini, speech transcription, query screening and chart relay.

pub mod assistant;
pub mod charts;
pub mod db;
pub mod error;
pub mod gemini;
pub mod logging;
pub mod pipeline;
pub mod server;
pub mod session;
pub mod settings;
pub mod speech;
pub mod sql_guard;
pub mod text_to_sql;
