//! Translation between the OpenAI dialect and the two native dialects.
//!
//! Claude and Gemini are the pivot formats spoken upstream; OpenAI requests
//! are converted on the way in and replies converted on the way out. All
//! functions here are pure apart from the stream adapters, which only pull
//! from the byte stream they are given.

pub mod claude_types;
pub mod gemini_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod streaming;
