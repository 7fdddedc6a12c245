//! Type-safe tool argument modules.
//!
//! Each struct implements `ToolArgs` for one external tool invocation and
//! maps its fields to the exact argv (and env) the tool expects.

pub mod disk;
pub mod encryption;
pub mod mount;
