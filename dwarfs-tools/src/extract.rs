//! The `dwarfsextract` tool: unpack an image to a directory or dump it
//! in mtree format.

use std::{ffi::OsString, fs, io::Write, path::PathBuf};

use bstr::{BStr, ByteSlice};
use clap::Parser;
use dwarfs::{Filesystem, InodeKind, reader::Config};

use crate::{EXIT_OK, fatal, init_logger, parse_cli, parse_image_offset};

#[derive(Debug, Parser)]
#[command(name = "dwarfsextract", about = "extract a DwarFS archive", disable_version_flag = true)]
struct Cli {
    /// The image to extract.
    image: PathBuf,
    /// Output format: dir, mtree (cpio and tar are not supported).
    #[arg(short = 'f', long, default_value = "dir")]
    format: String,
    /// Output directory for `-f dir`.
    #[arg(short = 'o', long)]
    output: Option<PathBuf>,
    /// Archive start: `auto` or a byte offset.
    #[arg(long, default_value = "auto")]
    image_offset: String,
    /// Print extraction progress to stdout.
    #[arg(long)]
    stdout_progress: bool,
    /// Decompression worker threads.
    #[arg(short = 'n', long, default_value_t = 2)]
    num_workers: usize,
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
        Err(err) => fatal(err),
    }
}

fn run(cli: &Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let mut config = Config::default();
    config.image_offset = parse_image_offset(&cli.image_offset)?;
    config.cache.num_workers = cli.num_workers;
    let fs = Filesystem::open_with_config(fs::File::open(&cli.image)?, &config)?;

    match cli.format.as_str() {
        "dir" => {
            let out = cli
                .output
                .as_deref()
                .ok_or("-f dir needs an output directory (-o)")?;
            extract_dir(&fs, out, cli.stdout_progress)?;
            Ok(EXIT_OK)
        }
        "mtree" => {
            dump_mtree(&mut std::io::stdout().lock(), &fs)?;
            Ok(EXIT_OK)
        }
        "cpio" | "tar" => Err(format!("unsupported output format: {}", cli.format).into()),
        other => Err(format!("unknown output format: {other}").into()),
    }
}

/// Extract everything below `out`. Non-file entries are created first in
/// path order; file contents follow in data order so the block cache
/// streams each block once.
fn extract_dir(
    fs: &Filesystem,
    out: &std::path::Path,
    stdout_progress: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(out)?;

    let mut failure: Option<String> = None;
    let mut extracted = 0u64;
    // Directory permissions go last (deepest first): a read-only
    // directory must still accept its children while extracting.
    let mut dir_perms: Vec<(std::path::PathBuf, u32)> = Vec::new();
    fs.walk_data_order(|path, inode| {
        if failure.is_some() {
            return;
        }
        if let Err(err) = extract_entry(
            fs,
            out,
            path,
            inode,
            &mut extracted,
            &mut dir_perms,
            stdout_progress,
        ) {
            failure = Some(format!("{}: {err}", path));
        }
    });
    if let Some(msg) = failure {
        return Err(msg.into());
    }
    for (target, mode) in dir_perms.iter().rev() {
        set_permissions(target, *mode)?;
    }
    Ok(())
}

fn extract_entry(
    fs: &Filesystem,
    out: &std::path::Path,
    path: &BStr,
    inode: dwarfs::Inode<'_>,
    extracted: &mut u64,
    dir_perms: &mut Vec<(std::path::PathBuf, u32)>,
    stdout_progress: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let target = out.join(path.to_str_lossy().as_ref());
    let attr = inode.attr();
    match inode.kind() {
        InodeKind::Directory(_) => {
            if !path.is_empty() {
                fs::create_dir_all(&target)?;
            }
            dir_perms.push((target, attr.mode));
        }
        InodeKind::File(_) => {
            let mut f = fs::File::create(&target)?;
            for fut in fs.readv(inode, u64::MAX, 0)? {
                let range = fut.wait()?;
                f.write_all(&range.bytes())?;
                *extracted += range.len() as u64;
            }
            set_permissions(&target, attr.mode)?;
            f.set_times(
                fs::FileTimes::new().set_modified(
                    std::time::SystemTime::UNIX_EPOCH
                        + std::time::Duration::from_secs(attr.mtime),
                ),
            )?;
            if stdout_progress {
                println!("extracted {} bytes", extracted);
            }
        }
        InodeKind::Symlink(link) => {
            #[cfg(unix)]
            std::os::unix::fs::symlink(link.target().to_str_lossy().as_ref(), &target)?;
            #[cfg(not(unix))]
            log::warn!("skipping symlink {path} -> {}", link.target());
        }
        InodeKind::Device(_) | InodeKind::Ipc(_) => {
            // Devices and sockets need privileges; skip rather than fail.
            log::warn!("skipping special file: {path}");
        }
        _ => {}
    }
    Ok(())
}

fn set_permissions(path: &std::path::Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
        Ok(())
    }
}

/// Dump the hierarchy in mtree(5) text format.
pub fn dump_mtree(w: &mut dyn Write, fs: &Filesystem) -> std::io::Result<()> {
    writeln!(w, "#mtree")?;
    let mut path = String::from(".");
    dump_mtree_dir(w, fs.root().as_dir().expect("root is a directory"), &mut path)
}

/// mtree escapes `/`, `\`, `#` and non-printable bytes as `\ooo`.
fn escape_into(buf: &mut String, s: &BStr) {
    for &b in s.iter() {
        if (33..=126).contains(&b) && !b"\\/#".contains(&b) {
            buf.push(b as char);
        } else {
            let digit = |x: u8| (b'0' + x) as char;
            buf.push('\\');
            buf.push(digit(b / 64));
            buf.push(digit(b / 8 % 8));
            buf.push(digit(b % 8));
        }
    }
}

fn dump_mtree_dir(
    w: &mut dyn Write,
    dir: dwarfs::reader::Dir<'_>,
    path: &mut String,
) -> std::io::Result<()> {
    // Files first, then the subdirectories, as mtree consumers expect.
    for dirs_pass in [false, true] {
        for ent in dir.entries() {
            let inode = ent.inode();
            let prev_len = path.len();
            path.push('/');
            escape_into(path, ent.name());

            let attr = inode.attr();
            let mtime = attr.mtime;
            let mode = attr.mode & 0o7777;
            let (uid, gid) = (attr.uid, attr.gid);
            match inode.kind() {
                InodeKind::Directory(d) => {
                    if dirs_pass {
                        writeln!(
                            w,
                            "{path} time={mtime}.0 mode={mode:03o} gid={gid} uid={uid} type=dir",
                        )?;
                        dump_mtree_dir(w, d, path)?;
                    }
                }
                InodeKind::File(f) if !dirs_pass => {
                    let size = f.size();
                    writeln!(
                        w,
                        "{path} time={mtime}.0 mode={mode:03o} gid={gid} uid={uid} \
                         type=file size={size}",
                    )?;
                }
                InodeKind::Symlink(l) if !dirs_pass => {
                    let link = l.target();
                    writeln!(
                        w,
                        "{path} time={mtime}.0 mode={mode:03o} gid={gid} uid={uid} \
                         type=link link={link}",
                    )?;
                }
                InodeKind::Device(d) if !dirs_pass => {
                    // Block vs character from the file type bits.
                    let ty = if attr.mode & 0o170000 == 0o060000 { "block" } else { "char" };
                    writeln!(
                        w,
                        "{path} time={mtime}.0 mode={mode:03o} gid={gid} uid={uid} \
                         type={ty} device={}",
                        d.device_id(),
                    )?;
                }
                InodeKind::Ipc(_) if !dirs_pass => {
                    let ty = if attr.mode & 0o170000 == 0o140000 { "socket" } else { "fifo" };
                    writeln!(
                        w,
                        "{path} time={mtime}.0 mode={mode:03o} gid={gid} uid={uid} type={ty}",
                    )?;
                }
                _ => {}
            }
            path.truncate(prev_len);
        }
    }
    Ok(())
}
