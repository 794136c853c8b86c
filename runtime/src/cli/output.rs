//! Output helpers shared by the CLI commands.
//!
//! Global flags are exported as `UPM_*` environment variables by `main` so
//! every command can check them without threading them through.

use std::io::IsTerminal;

pub fn is_json() -> bool {
    flag("UPM_JSON")
}

pub fn is_quiet() -> bool {
    flag("UPM_QUIET")
}

pub fn is_verbose() -> bool {
    flag("UPM_VERBOSE")
}

fn flag(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| v == "1")
}

/// Print one pretty JSON document to stdout.
pub fn print_json(value: &serde_json::Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("  failed to encode output: {e}"),
    }
}

/// Status symbols, plain when stderr is not a terminal.
pub struct Styled {
    fancy: bool,
}

impl Default for Styled {
    fn default() -> Self {
        Self::new()
    }
}

impl Styled {
    pub fn new() -> Self {
        Self {
            fancy: std::io::stderr().is_terminal() && !flag("UPM_NO_COLOR"),
        }
    }

    pub fn ok_sym(&self) -> &'static str {
        if self.fancy {
            "\u{2713}"
        } else {
            "[ok]"
        }
    }

    pub fn warn_sym(&self) -> &'static str {
        if self.fancy {
            "!"
        } else {
            "[warn]"
        }
    }

    pub fn err_sym(&self) -> &'static str {
        if self.fancy {
            "\u{2717}"
        } else {
            "[error]"
        }
    }
}
