//! Browser-driven scraping job engine for e-commerce marketplaces.
//!
//! A job loads a pending task, drives an isolated browsing context through
//! the platform's pages, extracts product records and reconciles them into
//! the product catalogue with price history.

pub mod browser;
pub mod cli;
pub mod crawler;
pub mod error;
pub mod extract;
pub mod proxy;
pub mod storage;
pub mod utils;

pub use error::EngineError;
