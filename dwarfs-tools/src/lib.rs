//! Shared plumbing for the `mkdwarfs`, `dwarfsck` and `dwarfsextract`
//! command line tools, plus the universal-binary dispatch.
//!
//! Every tool exposes `main(args) -> i32` taking its full argv (including
//! the program name), so the universal binary, the per-tool binaries and
//! the integration tests all drive the same code.
//!
//! Exit codes: 0 on success, 1 on user or I/O errors, 2 when the request
//! was well-formed but the answer is absent (e.g. `--print-header` on an
//! image without a header).

use std::ffi::OsString;

pub mod dwarfsck;
pub mod extract;
pub mod mkdwarfs;

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_ABSENT: i32 = 2;

/// The tools known to the universal binary.
pub const TOOL_NAMES: &[&str] = &["mkdwarfs", "dwarfsck", "dwarfsextract"];

/// Run a tool by name. Returns `None` for unknown names.
pub fn run_tool(name: &str, args: Vec<OsString>) -> Option<i32> {
    match name {
        "mkdwarfs" => Some(mkdwarfs::main(args)),
        "dwarfsck" => Some(dwarfsck::main(args)),
        "dwarfsextract" => Some(extract::main(args)),
        _ => None,
    }
}

/// Print a fatal error the way every tool does and return the exit code.
pub(crate) fn fatal(err: impl std::fmt::Display) -> i32 {
    eprintln!("ERROR: {err}");
    EXIT_ERROR
}

/// Handle a clap parse result uniformly: `--help`/`--version` print and
/// exit 0, real argument errors exit 1.
pub(crate) fn parse_cli<T: clap::Parser>(args: Vec<OsString>) -> Result<T, i32> {
    match T::try_parse_from(args) {
        Ok(cli) => Ok(cli),
        Err(err) => {
            let code = if err.use_stderr() { EXIT_ERROR } else { EXIT_OK };
            let _ = err.print();
            Err(code)
        }
    }
}

/// Initialize logging from `--log-level`; later calls are no-ops so
/// tests can invoke tools repeatedly.
pub(crate) fn init_logger(level: Option<&str>) {
    let level = level.unwrap_or("warn");
    let _ = env_logger::Builder::new()
        .parse_filters(level)
        .format_timestamp(None)
        .try_init();
}

/// Parse `--image-offset={auto|<bytes>}`.
pub(crate) fn parse_image_offset(s: &str) -> Result<dwarfs::reader::ImageOffset, String> {
    if s == "auto" {
        return Ok(dwarfs::reader::ImageOffset::Auto);
    }
    s.parse()
        .map(dwarfs::reader::ImageOffset::Exact)
        .map_err(|_| format!("invalid image offset: {s}"))
}
