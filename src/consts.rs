/// Default REST base URL for a locally running storefront backend.
pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";

/// Default push channel endpoint for a locally running storefront backend.
pub const DEFAULT_WS_URL: &str = "ws://localhost:5000/ws";

/// Identifier of the single cart entity kept per session.
pub const CART_ID: &str = "cart";

/// Prefix of client-generated provisional identifiers.
pub const PROVISIONAL_PREFIX: &str = "local-";
