// Tagbus - A tag-based in-process event bus for Rust
//
// This library routes positional payloads to subscribers registered under
// string tags, with subscriber bindings generated at compile time.

// Re-export core functionality
pub use tagbus_core::*;

// Re-export procedural macros
pub use tagbus_macros::{subscribe, subscriber};
