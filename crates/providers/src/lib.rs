//! Concrete chat providers and the factory that builds them from layered
//! configuration.

mod factory;
mod http;
mod openai;
mod qianfan;
mod sse;

pub use factory::{DEFAULT_CONFIG_TTL, ProviderFactory};
pub use openai::OpenAiCompatibleProvider;
pub use qianfan::{DEFAULT_API_BASE, DEFAULT_AUTH_BASE, QianfanEndpoints, QianfanProvider};
pub use sse::{SseFrame, sse_frames};
