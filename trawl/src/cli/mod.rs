//! Command-line interface of the `trawl` binary.

mod args;

pub use args::{Args, Unwinding};
