#![forbid(unsafe_code)]

//! Resolve social-media page URLs into direct media URLs and relay the bytes.

pub mod config;
pub mod error;
pub mod extractor;
pub mod logging;
pub mod media;
pub mod mirror;
pub mod resolver;
pub mod security;
pub mod streamer;
