//! The `dwarfsck` tool: verify and inspect an image.

use std::{ffi::OsString, fs, io::Write, path::PathBuf};

use clap::Parser;
use dwarfs::{
    Filesystem, InodeKind,
    metadata::Metadata,
    reader::Config,
    section::VerifyLevel,
};
use dwarfs_writer::dedup::FileHash;
use serde_json::json;

use crate::{EXIT_ABSENT, EXIT_ERROR, EXIT_OK, fatal, init_logger, parse_cli, parse_image_offset};

#[derive(Debug, Parser)]
#[command(name = "dwarfsck", about = "check a DwarFS archive", disable_version_flag = true)]
struct Cli {
    /// The image to check.
    image: PathBuf,
    /// Verify strong checksums and decompress everything.
    #[arg(long)]
    check_integrity: bool,
    /// Skip checksum verification entirely.
    #[arg(long, conflicts_with = "check_integrity")]
    no_check: bool,
    /// Print file checksums (sha512, sha512-256, sha256, xxh3-128).
    #[arg(long)]
    checksum: Option<String>,
    /// List archive contents.
    #[arg(long)]
    list: bool,
    /// Print image information as JSON.
    #[arg(long)]
    json: bool,
    /// Write the image header to stdout; exits 2 if there is none.
    #[arg(long)]
    print_header: bool,
    /// Export the parsed metadata as JSON into a file.
    #[arg(long)]
    export_metadata: Option<PathBuf>,
    /// Archive start: `auto` or a byte offset.
    #[arg(long, default_value = "auto")]
    image_offset: String,
    /// Verification worker threads.
    #[arg(short = 'n', long, default_value_t = 4)]
    num_workers: usize,
    /// Detail level for textual output.
    #[arg(short = 'd', long, default_value_t = 1)]
    detail: u32,
    #[arg(long)]
    log_level: Option<String>,
}

pub fn main(args: Vec<OsString>) -> i32 {
    let cli: Cli = match parse_cli(args) {
        Ok(cli) => cli,
        Err(code) => return code,
    };
    init_logger(cli.log_level.as_deref());
    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            if cli.json {
                println!("{}", json!({ "error": err.to_string() }));
            }
            fatal(err)
        }
    }
}

fn run(cli: &Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let mut config = Config::default();
    config.image_offset = parse_image_offset(&cli.image_offset)?;
    config.cache.num_workers = cli.num_workers;
    let fs = Filesystem::open_with_config(fs::File::open(&cli.image)?, &config)?;

    if cli.print_header {
        return match fs.header()? {
            Some(header) => {
                std::io::stdout().write_all(&header)?;
                Ok(EXIT_OK)
            }
            None => {
                eprintln!("ERROR: no header found");
                Ok(EXIT_ABSENT)
            }
        };
    }

    if let Some(path) = &cli.export_metadata {
        fs::write(path, metadata_as_json(fs.metadata()).to_string())?;
    }

    if cli.json {
        println!("{}", fs.info_as_json(cli.detail.max(2)));
    } else if cli.detail > 0 && !cli.list && cli.checksum.is_none() {
        fs.dump(&mut std::io::stdout().lock(), cli.detail)?;
    }

    if cli.list {
        let mut out = std::io::stdout().lock();
        fs.walk(|path, inode| {
            if path.is_empty() {
                return;
            }
            let suffix = match inode.kind() {
                InodeKind::Directory(_) => "/",
                _ => "",
            };
            let _ = writeln!(out, "{path}{suffix}");
        });
    }

    if let Some(algo) = &cli.checksum {
        let hash: FileHash = algo.parse()?;
        if hash == FileHash::None {
            return Err("--checksum needs a real algorithm".into());
        }
        let mut out = std::io::stdout().lock();
        let mut failed = false;
        fs.walk(|path, inode| {
            if let InodeKind::File(_) = inode.kind() {
                match fs.read_file(inode) {
                    Ok(data) => {
                        let digest = hash.digest(&data);
                        let hex: String =
                            digest.iter().map(|b| format!("{b:02x}")).collect();
                        let _ = writeln!(out, "{hex}  {path}");
                    }
                    Err(err) => {
                        log::error!("{path}: {err}");
                        failed = true;
                    }
                }
            }
        });
        if failed {
            return Ok(EXIT_ERROR);
        }
    }

    if cli.no_check {
        return Ok(EXIT_OK);
    }
    let level = if cli.check_integrity { VerifyLevel::Full } else { VerifyLevel::Checksum };
    let errors = fs.check(level, cli.num_workers)?;
    if errors > 0 {
        eprintln!("ERROR: {errors} error(s) found");
        return Ok(EXIT_ERROR);
    }
    if cli.detail > 0 && !cli.json {
        println!("no errors found");
    }
    Ok(EXIT_OK)
}

/// The full parsed metadata as JSON, for `--export-metadata`.
fn metadata_as_json(m: &Metadata) -> serde_json::Value {
    json!({
        "chunks": m.chunks.iter().map(|c| json!([c.block, c.offset, c.size])).collect::<Vec<_>>(),
        "directories": m.directories.iter()
            .map(|d| json!([d.parent_entry, d.first_entry, d.self_entry]))
            .collect::<Vec<_>>(),
        "inodes": m.inodes.iter()
            .map(|i| json!({
                "mode_index": i.mode_index,
                "owner_index": i.owner_index,
                "group_index": i.group_index,
                "atime_offset": i.atime_offset,
                "mtime_offset": i.mtime_offset,
                "ctime_offset": i.ctime_offset,
            }))
            .collect::<Vec<_>>(),
        "dir_entries": m.dir_entries.iter()
            .map(|e| json!([e.name_index, e.inode_num]))
            .collect::<Vec<_>>(),
        "chunk_table": m.chunk_table,
        "symlink_table": m.symlink_table,
        "shared_files_table": m.shared_files_table,
        "uids": m.uids,
        "gids": m.gids,
        "modes": m.modes,
        "devices": m.devices,
        "names": m.names.iter().map(String::from_utf8_lossy).collect::<Vec<_>>(),
        "symlinks": m.symlinks.iter().map(String::from_utf8_lossy).collect::<Vec<_>>(),
        "category_names": m.category_names.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
        "block_categories": m.block_categories,
        "timestamp_base": m.timestamp_base,
        "time_resolution": m.time_resolution,
        "block_size": m.block_size,
        "total_fs_size": m.total_fs_size,
        "creator": m.creator.as_ref().map(|c| c.to_string()),
        "create_timestamp": m.create_timestamp,
    })
}
