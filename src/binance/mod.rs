// =============================================================================
// Binance exchange integration
// =============================================================================

pub mod client;

pub use client::BinanceClient;
