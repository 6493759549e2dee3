//! Application state for Axum handlers.

use axum::extract::FromRef;
use correlate_core::CorrelationLogger;

/// State shared across HTTP handlers.
///
/// [`HttpContext`](crate::HttpContext) extracts its logger from any state
/// implementing `FromRef` for [`CorrelationLogger`]; applications with more
/// state embed this struct or implement `FromRef` themselves.
///
/// # Examples
///
/// ```ignore
/// let logger = CorrelationLogger::new(LogConfig::from_env())?;
/// let app = Router::new()
///     .route("/register", post(register))
///     .layer(session_layer())
///     .with_state(AppState::new(logger));
/// ```
#[derive(Clone, Debug)]
pub struct AppState {
    logger: CorrelationLogger,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub const fn new(logger: CorrelationLogger) -> Self {
        Self { logger }
    }

    /// The logger opening one transaction per request.
    #[must_use]
    pub const fn logger(&self) -> &CorrelationLogger {
        &self.logger
    }
}

impl FromRef<AppState> for CorrelationLogger {
    fn from_ref(state: &AppState) -> Self {
        state.logger.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_clone() {
        // Axum requires Clone state
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}
