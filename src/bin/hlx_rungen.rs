//! HLX filter runner
//!
//! Usage:
//!   hlx_rungen --module=PATH argument=value [argument=value... ] [flags]
//!
//! Run with no arguments (or `--help`) for the full flag list.

fn main() {
    std::process::exit(hlx_rungen::cli::execute(std::env::args_os()));
}
