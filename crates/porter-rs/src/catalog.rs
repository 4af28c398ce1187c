//! Model-identifier mapping between caller-facing and backend ids.
//!
//! Callers address models through the `relay:` namespace (`relay:gpt-5`,
//! `relay:claude-sonnet-4`). The backend knows nothing about the prefix, so
//! it is stripped before a call goes out — and every response object echoes
//! the caller's original id back, never the stripped one.

/// Namespace prefix callers use to address models through the bridge.
pub const MODEL_PREFIX: &str = "relay:";

/// Default model for hosts that don't pick one.
pub const DEFAULT_MODEL: &str = "relay:gpt-5-mini";

/// Map a caller-facing model id to the backend id.
///
/// Strips one leading [`MODEL_PREFIX`]; ids without the prefix pass through
/// unchanged.
pub fn backend_model(model: &str) -> &str {
    model.strip_prefix(MODEL_PREFIX).unwrap_or(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_relay_prefix() {
        assert_eq!(backend_model("relay:gpt-5"), "gpt-5");
        assert_eq!(backend_model("relay:claude-sonnet-4"), "claude-sonnet-4");
    }

    #[test]
    fn foreign_ids_pass_through() {
        assert_eq!(backend_model("gpt-5"), "gpt-5");
        assert_eq!(backend_model("some/vendor-model"), "some/vendor-model");
    }

    #[test]
    fn strips_only_one_prefix() {
        // A doubly-prefixed id is the caller's problem; only the outer
        // namespace belongs to the bridge.
        assert_eq!(backend_model("relay:relay:gpt-5"), "relay:gpt-5");
    }

    #[test]
    fn default_model_is_addressable() {
        assert!(DEFAULT_MODEL.starts_with(MODEL_PREFIX));
    }
}
