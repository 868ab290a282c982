//! Version information for circuitry.

/// Circuitry version from Cargo.toml
pub const CIRCUITRY_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `User-Agent` sent by HTTP circuits.
pub fn user_agent() -> String {
    format!("circuitry/{CIRCUITRY_VERSION}")
}
