//! `remlaunch-entry`: runs the payload in `REMLAUNCH_PAYLOAD` against the
//! built-in function registry.

use std::process::ExitCode;

fn main() -> ExitCode {
    remlaunch::entry::main_with(remlaunch::payload::builtin_registry())
}
