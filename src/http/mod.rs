//! HTTP protocol layer module
//!
//! Response builders, MIME detection and cache validation shared by the
//! upload and static file handlers.

pub mod cache;
pub mod mime;
pub mod response;

pub use response::{
    build_304_response, build_404_response, build_413_response,
    build_health_response, build_options_response, build_text_response,
};
