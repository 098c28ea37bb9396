//! The universal binary: dispatches to a tool based on the executable
//! name (so a symlink named `mkdwarfs` behaves as mkdwarfs), or on an
//! explicit `--tool=<name>` first argument.

use std::ffi::OsString;
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut args: Vec<OsString> = std::env::args_os().collect();

    let stem = std::path::Path::new(args.first().map(OsString::as_os_str).unwrap_or_default())
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some(code) = dwarfs_tools::run_tool(&stem, args.clone()) {
        return exit_code(code);
    }

    if let Some(tool_arg) = args.get(1).and_then(|a| a.to_str()) {
        if let Some(name) = tool_arg.strip_prefix("--tool=") {
            let name = name.to_owned();
            args.remove(1);
            return match dwarfs_tools::run_tool(&name, args) {
                Some(code) => exit_code(code),
                None => {
                    eprintln!("ERROR: unknown tool: {name}");
                    print_tools();
                    ExitCode::from(dwarfs_tools::EXIT_ERROR as u8)
                }
            };
        }
    }

    print_tools();
    ExitCode::SUCCESS
}

fn print_tools() {
    eprintln!("available tools:");
    for name in dwarfs_tools::TOOL_NAMES {
        eprintln!("  {name}");
    }
    eprintln!("run as <tool> (via symlink) or with --tool=<name>");
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
