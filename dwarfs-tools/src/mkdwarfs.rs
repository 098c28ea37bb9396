//! The `mkdwarfs` tool: build (or recompress) an image from a directory
//! tree.

use std::{
    ffi::OsString,
    fs,
    io::{BufRead, BufReader},
    path::PathBuf,
    time::SystemTime,
};

use clap::Parser;
use dwarfs_writer::{
    ArchiveWriter, BuildStats, WriterOptions,
    archive::{BuildEvent, CdcConfig},
    filter::{FilterRules, FsRuleFiles},
    metadata::{BuilderConfig, MetadataPacking},
    recompress::{CategoryFilter, RecompressOptions, recompress},
    scan::{ScanOptions, scan_input_list, scan_tree},
};
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};

use crate::{EXIT_OK, fatal, init_logger, parse_cli};

/// Preset levels `-l 0..=9`: block size exponent and default compression.
const LEVEL_PRESETS: [(u32, &str); 10] = [
    (20, "null"),
    (20, "zstd:level=1"),
    (21, "zstd:level=4"),
    (22, "zstd:level=7"),
    (23, "zstd:level=11"),
    (23, "zstd:level=16"),
    (24, "zstd:level=19"),
    (24, "zstd:level=22"),
    (24, "lzma:level=6"),
    (26, "lzma:level=9"),
];

#[derive(Debug, Parser)]
#[command(name = "mkdwarfs", about = "create a DwarFS archive", disable_version_flag = true)]
struct Cli {
    /// Input directory (or image, with --recompress).
    #[arg(short = 'i', long)]
    input: PathBuf,
    /// Output image path.
    #[arg(short = 'o', long)]
    output: PathBuf,
    /// Compression preset, 0 (fastest) through 9 (smallest).
    #[arg(short = 'l', long, default_value_t = 6, value_parser = clap::value_parser!(u32).range(0..=9))]
    level: u32,
    /// Block size exponent; blocks hold 2^N bytes.
    #[arg(short = 'S', long)]
    block_size_bits: Option<u32>,
    /// Enable categorizers (comma separated list).
    #[arg(long, num_args = 0..=1, default_missing_value = "incompressible")]
    categorize: Option<String>,
    /// Compression binding: `codec[:opts]` or `category::codec[:opts]`.
    #[arg(short = 'C', long = "compression")]
    compression: Vec<String>,
    /// Fragment ordering: none, path, revpath, similarity,
    /// nilsimsa[:max-children=K][:max-cluster-size=N].
    #[arg(long, default_value = "similarity")]
    order: String,
    /// Hash for content deduplication, or `none` to disable.
    #[arg(long, default_value = "sha512")]
    file_hash: String,
    /// Time granularity: sec, min, hour, day, or seconds.
    #[arg(long, default_value = "sec")]
    time_resolution: String,
    /// Set all file times: epoch seconds, `now`, or `YYYY-MM-DD [HH:MM[:SS]]`.
    #[arg(long)]
    set_time: Option<String>,
    /// Set all file owners to this uid.
    #[arg(long)]
    set_owner: Option<u32>,
    /// Set all file groups to this gid.
    #[arg(long)]
    set_group: Option<u32>,
    /// Permission normalization; only `norm` is recognized.
    #[arg(long)]
    chmod: Option<String>,
    /// Store atime and ctime in addition to mtime.
    #[arg(long)]
    keep_all_times: bool,
    /// Metadata packing flags (comma separated; `all`, `none`, `plain`,
    /// `chunk_table`, `directories`, `shared_files`, `names`,
    /// `names_index`, `symlinks`, `symlinks_index`, `force`).
    #[arg(long)]
    pack_metadata: Option<String>,
    /// Prepend the contents of this file as an image header.
    #[arg(long)]
    header: Option<PathBuf>,
    /// Drop the image header (recompress mode).
    #[arg(long)]
    remove_header: bool,
    /// Read input paths from a file (`-` for stdin) instead of walking.
    #[arg(long)]
    input_list: Option<String>,
    /// Filter rule (`+pattern`, `-pattern`, or `. rulefile`); repeatable.
    #[arg(short = 'F', long = "filter", allow_hyphen_values = true)]
    filter: Vec<String>,
    /// Recompress an existing image: all, none, metadata, block.
    #[arg(long, num_args = 0..=1, default_missing_value = "all")]
    recompress: Option<String>,
    /// Restrict --recompress to these categories (prefix `!` to invert).
    #[arg(long)]
    recompress_categories: Option<String>,
    /// Similarity ordering emits files larger than this first.
    #[arg(long)]
    max_similarity_size: Option<String>,
    /// Use content-defined chunking for sub-file deduplication.
    #[arg(long)]
    cdc: bool,
    /// Overwrite the output if it exists.
    #[arg(long)]
    force: bool,
    /// Progress style: none, simple, ascii, unicode.
    #[arg(long, default_value = "unicode")]
    progress: String,
    /// Print filter decisions instead of building: included, excluded,
    /// included-files, excluded-files, files, all.
    #[arg(long)]
    debug_filter: Option<String>,
    /// Compression worker threads.
    #[arg(short = 'n', long, default_value_t = 4)]
    num_workers: usize,
    /// Log filter, e.g. `error`, `info`, `debug`.
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
    let mut rules = FilterRules::new();
    for rule in &cli.filter {
        rules.add_rule(rule, &mut FsRuleFiles)?;
    }

    if cli.recompress.is_some() || cli.remove_header {
        return run_recompress(cli);
    }

    let scan_opts = ScanOptions {
        set_time: cli.set_time.as_deref().map(parse_set_time).transpose()?,
        set_owner: cli.set_owner,
        set_group: cli.set_group,
        chmod_norm: match cli.chmod.as_deref() {
            None => false,
            Some("norm") => true,
            Some(other) => return Err(format!("unsupported chmod mode: {other}").into()),
        },
    };

    if let Some(mode) = &cli.debug_filter {
        return run_debug_filter(cli, &rules, &scan_opts, mode);
    }

    let entries = match &cli.input_list {
        None => scan_tree(&cli.input, &rules, &scan_opts, None)?,
        Some(list) => {
            let rdr: Box<dyn BufRead> = if list == "-" {
                Box::new(BufReader::new(std::io::stdin()))
            } else {
                Box::new(BufReader::new(fs::File::open(list)?))
            };
            scan_input_list(&cli.input, rdr, &scan_opts)?
        }
    };

    let (level_exp, level_compression) = LEVEL_PRESETS[cli.level as usize];
    let mut options = WriterOptions {
        block_size_exp: cli.block_size_bits.unwrap_or(level_exp),
        default_compression: level_compression.to_owned(),
        category_compression: Vec::new(),
        categorize: cli.categorize.clone(),
        order: cli.order.parse()?,
        max_similarity_size: cli
            .max_similarity_size
            .as_deref()
            .map(dwarfs_writer::parse_size)
            .transpose()?,
        file_hash: cli.file_hash.parse()?,
        cdc: cli.cdc.then(CdcConfig::default),
        num_workers: cli.num_workers,
        builder: BuilderConfig {
            time_resolution: parse_time_resolution(&cli.time_resolution)?,
            mtime_only: !cli.keep_all_times,
            packing: match &cli.pack_metadata {
                Some(flags) => MetadataPacking::parse(flags)?,
                None => MetadataPacking::default(),
            },
            create_timestamp: scan_opts.set_time,
            ..BuilderConfig::default()
        },
        image_header: cli.header.as_deref().map(fs::read).transpose()?,
        history_args: history_args(cli),
    };
    for binding in &cli.compression {
        match binding.split_once("::") {
            Some((category, codec)) => options
                .category_compression
                .push((category.to_owned(), codec.to_owned())),
            None => options.default_compression = binding.clone(),
        }
    }

    let writer = ArchiveWriter::new(options)?;
    let out = open_output(cli)?;

    let total_bytes: u64 = entries.iter().map(|e| e.size()).sum();
    let bar = progress_bar(&cli.progress, total_bytes)?;
    let (_, stats) = writer.write(&entries, out, |event| match event {
        BuildEvent::Stage(stage) => {
            if let Some(bar) = &bar {
                bar.set_message(stage.to_owned());
            } else if cli.progress == "simple" {
                eprintln!("{stage}...");
            }
        }
        BuildEvent::PackedBytes(n) => {
            if let Some(bar) = &bar {
                bar.set_position(n);
            }
        }
    })?;
    if let Some(bar) = bar {
        bar.finish_and_clear();
    }

    print_stats(&stats);
    Ok(EXIT_OK)
}

fn run_recompress(cli: &Cli) -> Result<i32, Box<dyn std::error::Error>> {
    let mode = cli.recompress.as_deref().unwrap_or("none").parse()?;
    let (_, level_compression) = LEVEL_PRESETS[cli.level as usize];
    let mut opts = RecompressOptions {
        mode,
        categories: cli.recompress_categories.as_deref().map(CategoryFilter::parse),
        default_compression: level_compression.to_owned(),
        num_workers: cli.num_workers,
        strip_header: cli.remove_header,
        new_header: cli.header.as_deref().map(fs::read).transpose()?,
        packing: cli
            .pack_metadata
            .as_deref()
            .map(MetadataPacking::parse)
            .transpose()?,
        history_args: history_args(cli),
        ..RecompressOptions::default()
    };
    for binding in &cli.compression {
        match binding.split_once("::") {
            Some((category, codec)) => opts
                .category_compression
                .push((category.to_owned(), codec.to_owned())),
            None => opts.default_compression = binding.clone(),
        }
    }

    let input = fs::File::open(&cli.input)?;
    let out = open_output(cli)?;
    let (_, written) = recompress(input, out, &opts)?;
    eprintln!("recompressed into {}", HumanBytes(written));
    Ok(EXIT_OK)
}

fn run_debug_filter(
    cli: &Cli,
    rules: &FilterRules,
    scan_opts: &ScanOptions,
    mode: &str,
) -> Result<i32, Box<dyn std::error::Error>> {
    let (want_included, want_excluded, files_only) = match mode {
        "included" => (true, false, false),
        "excluded" => (false, true, false),
        "included-files" => (true, false, true),
        "excluded-files" => (false, true, true),
        "files" => (true, true, true),
        "all" => (true, true, false),
        _ => return Err(format!("unknown debug-filter mode: {mode}").into()),
    };
    let mut cb = |path: &bstr::BStr, keep: bool, is_dir: bool| {
        if files_only && is_dir {
            return;
        }
        if keep && want_included {
            println!("+ {path}");
        } else if !keep && want_excluded {
            println!("- {path}");
        }
    };
    scan_tree(&cli.input, rules, scan_opts, Some(&mut cb))?;
    Ok(EXIT_OK)
}

fn open_output(cli: &Cli) -> std::io::Result<std::io::BufWriter<fs::File>> {
    let f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .create_new(!cli.force)
        .open(&cli.output)?;
    Ok(std::io::BufWriter::new(f))
}

fn history_args(cli: &Cli) -> Vec<String> {
    vec![
        format!("-i {}", cli.input.display()),
        format!("-o {}", cli.output.display()),
        format!("-l {}", cli.level),
    ]
}

fn progress_bar(mode: &str, total: u64) -> Result<Option<ProgressBar>, String> {
    let template = "{msg:>9} {bytes}/{total_bytes} ({bytes_per_sec}) {wide_bar}";
    let style = match mode {
        "none" | "simple" => return Ok(None),
        "ascii" => ProgressStyle::with_template(template)
            .expect("static template")
            .progress_chars("#>-"),
        "unicode" => ProgressStyle::with_template(template).expect("static template"),
        _ => return Err(format!("unknown progress mode: {mode}")),
    };
    Ok(Some(ProgressBar::new(total).with_style(style)))
}

fn print_stats(stats: &BuildStats) {
    eprintln!(
        "{} dirs, {} files ({}), {} symlinks, {} specials",
        stats.dirs,
        stats.files,
        HumanBytes(stats.original_bytes),
        stats.symlinks,
        stats.specials,
    );
    eprintln!(
        "deduplicated {}, {} blocks, image size {}",
        HumanBytes(stats.duplicate_bytes),
        stats.blocks,
        HumanBytes(stats.image_bytes),
    );
}

/// Parse `--set-time`: `now`, epoch seconds, or a civil date/time.
fn parse_set_time(s: &str) -> Result<u64, String> {
    if s == "now" {
        return Ok(SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_err(|_| "clock before epoch".to_owned())?
            .as_secs());
    }
    if s.bytes().all(|b| b.is_ascii_digit()) && !s.is_empty() {
        return s.parse().map_err(|_| format!("invalid epoch: {s}"));
    }
    parse_civil(s).ok_or_else(|| format!("invalid time: {s}"))
}

/// `YYYY-MM-DD[ HH:MM[:SS]]` to epoch seconds.
fn parse_civil(s: &str) -> Option<u64> {
    let (date, time) = match s.split_once(' ') {
        Some((d, t)) => (d, Some(t)),
        None => (s, None),
    };
    let mut parts = date.split('-');
    let year: i64 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    let mut secs = 0u64;
    if let Some(time) = time {
        let mut hms = time.split(':');
        let hour: u64 = hms.next()?.parse().ok()?;
        let minute: u64 = hms.next()?.parse().ok()?;
        let second: u64 = hms.next().map_or(Some(0), |s| s.parse().ok())?;
        if hms.next().is_some() || hour > 23 || minute > 59 || second > 60 {
            return None;
        }
        secs = hour * 3600 + minute * 60 + second;
    }

    let days = days_from_civil(year, month, day);
    u64::try_from(days * 86400 + secs as i64).ok()
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(y: i64, m: u32, d: u32) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = i64::from((m + 9) % 12);
    let doy = (153 * mp + 2) / 5 + i64::from(d) - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146097 + doe - 719468
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_dates() {
        assert_eq!(days_from_civil(1970, 1, 1), 0);
        assert_eq!(days_from_civil(2000, 3, 1), 11017);
        assert_eq!(parse_civil("1970-01-01"), Some(0));
        assert_eq!(parse_civil("1970-01-02 00:00"), Some(86400));
        assert_eq!(parse_civil("2001-09-09 01:46:40"), Some(1_000_000_000));
        assert_eq!(parse_civil("2001-13-01"), None);
        assert_eq!(parse_civil("2001-09-09 25:00"), None);
    }

    #[test]
    fn set_time_forms() {
        assert_eq!(parse_set_time("100000001").unwrap(), 100000001);
        assert!(parse_set_time("now").unwrap() > 1_500_000_000);
        assert!(parse_set_time("garbage").is_err());
    }

    #[test]
    fn time_resolutions() {
        assert_eq!(parse_time_resolution("sec").unwrap(), 1);
        assert_eq!(parse_time_resolution("min").unwrap(), 60);
        assert_eq!(parse_time_resolution("hour").unwrap(), 3600);
        assert_eq!(parse_time_resolution("day").unwrap(), 86400);
        assert_eq!(parse_time_resolution("120").unwrap(), 120);
        assert!(parse_time_resolution("0").is_err());
        assert!(parse_time_resolution("weekly").is_err());
    }
}

fn parse_time_resolution(s: &str) -> Result<u32, String> {
    let res = match s {
        "sec" => 1,
        "min" => 60,
        "hour" => 3600,
        "day" => 86400,
        n => n.parse().map_err(|_| format!("invalid time resolution: {n}"))?,
    };
    if res == 0 {
        return Err("time resolution must be positive".into());
    }
    Ok(res)
}
