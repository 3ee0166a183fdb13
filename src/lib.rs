//! HTTP gateway in front of `yt-dlp`: analyze a media page, download it in a
//! chosen quality, and proxy its thumbnail.

pub mod analyze;
pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod extractor;
pub mod filename;
pub mod installer;
pub mod routes;
pub mod scratch;
pub mod selector;
pub mod server;
pub mod thumbnail;

#[cfg(test)]
mod test_support;
