//! axum ingress for relaygate: the OpenAI/Anthropic/Gemini request paths,
//! proxy-key auth middleware, and SSE body-streaming plumbing over the
//! dispatcher (component E).

pub mod auth;
pub mod error;
pub mod router;
pub mod state;

pub use router::build_router;
pub use state::{AppState, RouterConfig};
