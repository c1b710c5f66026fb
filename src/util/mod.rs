//! Utility functions for common operations.
//!
//! - **URL validation**: subscription URLs are vetted against SSRF targets
//! - **Text processing**: name sanitizing and category normalization
//! - **Files**: atomic temp-file-and-rename writes

mod fs;
mod text;
mod url_validator;

pub use fs::write_atomic;
pub use text::{normalize_category, sanitize_name, strip_control_chars};
pub use url_validator::{
    host_of, parse_http_url, site_authority, validate_url, UrlValidationError,
};
