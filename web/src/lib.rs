//! Axum integration for the correlation logging framework.
//!
//! Every HTTP request handled through [`HttpContext`] produces exactly one
//! Detail and one Summary record, tied to the client's session id.
//!
//! # Request Flow
//!
//! 1. **Session**: [`session_layer`] reads `x-session-id` (or generates one)
//! 2. **Extract**: [`HttpContext`] buffers headers, query, path params, and body
//! 3. **Open**: the handler calls [`HttpContext::common_log`] with its scenario
//! 4. **Call**: downstream calls are recorded through the
//!    [`Transaction`](correlate_core::Transaction)
//! 5. **Respond**: [`HttpContext::respond`] closes both logs and builds the JSON response
//!
//! # Example
//!
//! ```ignore
//! use axum::{Router, routing::post, response::Response};
//! use correlate_web::{AppError, AppState, HttpContext, session_layer};
//!
//! async fn register(mut ctx: HttpContext) -> Result<Response, AppError> {
//!     let request: Register = ctx.read_json()?;
//!     ctx.common_log("service.register")?;
//!     Ok(ctx.respond(201, &json!({ "email": request.email })))
//! }
//!
//! let app = Router::new()
//!     .route("/register", post(register))
//!     .layer(session_layer())
//!     .with_state(AppState::new(logger));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod context;
pub mod error;
pub mod extractors;
pub mod middleware;
pub mod state;

// Re-export key types for convenience
pub use context::{HttpContext, CLIENT_NODE};
pub use error::AppError;
pub use extractors::Session;
pub use middleware::{session_layer, SESSION_HEADER};
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;
