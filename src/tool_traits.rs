//! Type-safe external tool contracts.
//!
//! Every command the executor issues is a struct implementing [`ToolArgs`].
//! The struct definition is the contract: flag spellings live in one place,
//! and the runner never builds argv from loose strings.
//!
//! # Example
//!
//! ```
//! use std::path::PathBuf;
//! use lnos::tool_traits::ToolArgs;
//! use lnos::tools::disk::WipeSignaturesArgs;
//!
//! let args = WipeSignaturesArgs { disk: PathBuf::from("/dev/sda") };
//! assert_eq!(args.program(), "wipefs");
//! assert_eq!(args.to_cli_args(), vec!["--all", "--force", "/dev/sda"]);
//! assert_eq!(args.step(), "wipe");
//! ```

/// Trait for typed tool arguments.
///
/// # Contract
///
/// - `program()`: binary name, resolved through `PATH` at execution time
/// - `to_cli_args()`: argv after the program name, exactly as the tool expects it
/// - `get_env_vars()`: extra environment for the child; values here are logged
///   by name only
/// - `step()`: executor step reported in `ToolFailure` when the tool fails
///
/// Secrets never appear in argv. Tools that need a key read it from a file.
pub trait ToolArgs {
    fn program(&self) -> &'static str;

    fn to_cli_args(&self) -> Vec<String>;

    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    fn step(&self) -> &'static str;

    /// Returns true if the tool destroys data on the target.
    fn is_destructive(&self) -> bool {
        false
    }

    /// The full command line, for logs and dry-run output.
    fn command_line(&self) -> String {
        std::iter::once(self.program().to_string())
            .chain(self.to_cli_args())
            .collect::<Vec<_>>()
            .join(" ")
    }
}
