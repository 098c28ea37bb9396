//! End-to-end tool scenarios, driving the real tool entry points
//! in-process over scratch trees.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use dwarfs::{Filesystem, InodeKind};

fn tool(args: &[&str]) -> i32 {
    let argv: Vec<OsString> = args.iter().map(OsString::from).collect();
    dwarfs_tools::run_tool(args[0], argv).expect("known tool")
}

fn mkdwarfs(extra: &[&str], input: &Path, output: &Path) -> i32 {
    let mut args = vec![
        "mkdwarfs".to_owned(),
        "-i".to_owned(),
        input.display().to_string(),
        "-o".to_owned(),
        output.display().to_string(),
        "--progress".to_owned(),
        "none".to_owned(),
        "--force".to_owned(),
    ];
    args.extend(extra.iter().map(|s| s.to_string()));
    let argv: Vec<&str> = args.iter().map(String::as_str).collect();
    tool(&argv)
}

fn open(image: &Path) -> Filesystem {
    Filesystem::open(fs::File::open(image).unwrap()).unwrap()
}

#[test]
fn large_tree_builds_and_verifies() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    // 20 x 20 x 20 directories, one file each, sizes averaging 4 KiB.
    let mut n = 0u64;
    for a in 0..20 {
        for b in 0..20 {
            let dir = root.join(format!("d{a:02}/d{b:02}"));
            fs::create_dir_all(&dir).unwrap();
            for c in 0..20 {
                let size = (n % 8192) as usize + 1;
                let content: Vec<u8> = (0..size).map(|i| ((i as u64 + n) % 251) as u8).collect();
                fs::write(dir.join(format!("f{c:02}")), content).unwrap();
                n += 1;
            }
        }
    }
    assert_eq!(n, 8000);

    let image = tmp.path().join("img.dwarfs");
    assert_eq!(mkdwarfs(&["-l", "1"], &root, &image), 0);
    assert!(fs::metadata(&image).unwrap().len() > 0);

    assert_eq!(
        tool(&[
            "dwarfsck",
            image.to_str().unwrap(),
            "--check-integrity",
            "-d",
            "0",
        ]),
        0
    );

    let fs_ = open(&image);
    assert_eq!(fs_.inode_count() as u64, 1 + 20 + 400 + 8000);
}

#[test]
fn set_time_collapses_to_one_timestamp() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir(&root).unwrap();
    // Eleven files with eleven distinct mtimes; directories aligned to
    // the first of them.
    let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
    let mut set_mtime = |path: &Path, secs: u64| {
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_times(fs::FileTimes::new().set_modified(base + Duration::from_secs(secs)))
            .unwrap();
    };
    for i in 0..11u64 {
        let path = root.join(format!("f{i:02}"));
        fs::write(&path, b"x").unwrap();
        set_mtime(&path, i * 3600);
    }
    fs::File::open(&root)
        .unwrap()
        .set_times(fs::FileTimes::new().set_modified(base))
        .unwrap();

    let image = tmp.path().join("img.dwarfs");
    assert_eq!(mkdwarfs(&[], &root, &image), 0);
    let distinct = |image: &Path| -> BTreeSet<u64> {
        let fs_ = open(image);
        (0..fs_.inode_count())
            .map(|i| fs_.getattr(fs_.inode(i).unwrap()).mtime)
            .collect()
    };
    assert_eq!(distinct(&image).len(), 11);

    assert_eq!(mkdwarfs(&["--set-time", "100000001"], &root, &image), 0);
    let times = distinct(&image);
    assert_eq!(times.len(), 1);
    assert_eq!(times.into_iter().next(), Some(100000001));
}

fn perm_string(mode: u32) -> String {
    let mut s = String::new();
    for shift in [6, 3, 0] {
        let bits = (mode >> shift) & 7;
        s.push(if bits & 4 != 0 { 'r' } else { '-' });
        s.push(if bits & 2 != 0 { 'w' } else { '-' });
        s.push(if bits & 1 != 0 { 'x' } else { '-' });
    }
    s
}

#[cfg(unix)]
#[test]
fn chmod_norm_collapses_permissions() {
    use std::os::unix::fs::PermissionsExt;

    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir_all(root.join("sub")).unwrap();
    for (name, mode) in [("a", 0o644), ("b", 0o755), ("c", 0o600), ("d", 0o711)] {
        let path = root.join(name);
        fs::write(&path, name).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    let image = tmp.path().join("img.dwarfs");
    assert_eq!(mkdwarfs(&["--chmod", "norm"], &root, &image), 0);

    let fs_ = open(&image);
    let mut perms = BTreeSet::new();
    for i in 0..fs_.inode_count() {
        let attr = fs_.getattr(fs_.inode(i).unwrap());
        perms.insert(perm_string(attr.mode & 0o777));
    }
    let expect: BTreeSet<String> =
        [String::from("r--r--r--"), String::from("r-xr-xr-x")].into();
    assert_eq!(perms, expect);
}

#[test]
fn header_roundtrip_and_removal() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir(&root).unwrap();
    fs::write(root.join("file"), b"content goes here").unwrap();

    let header = b"#!/bin/sh\nexec mount-me \"$0\" \"$@\"\n";
    let header_path = tmp.path().join("header.sh");
    fs::write(&header_path, header).unwrap();

    let image = tmp.path().join("img.dwarfs");
    assert_eq!(
        mkdwarfs(&["--header", header_path.to_str().unwrap()], &root, &image),
        0
    );

    // The header is reproduced byte for byte, and both the explicit
    // offset and auto-detection find the archive behind it.
    let fs_ = open(&image);
    assert_eq!(fs_.header().unwrap().unwrap(), header);
    assert_eq!(fs_.archive_start(), header.len() as u64);
    let content = fs_.read_file(fs_.find("file").unwrap()).unwrap();
    assert_eq!(content, b"content goes here");
    drop(fs_);
    assert_eq!(tool(&["dwarfsck", image.to_str().unwrap(), "--print-header"]), 0);

    // Removing the header yields an image with none; --print-header on
    // it reports "absent" through exit code 2.
    let stripped = tmp.path().join("stripped.dwarfs");
    let code = tool(&[
        "mkdwarfs",
        "-i",
        image.to_str().unwrap(),
        "-o",
        stripped.to_str().unwrap(),
        "--remove-header",
        "--force",
        "--progress",
        "none",
    ]);
    assert_eq!(code, 0);
    let fs_ = open(&stripped);
    assert!(fs_.header().unwrap().is_none());
    drop(fs_);
    assert_eq!(
        tool(&["dwarfsck", stripped.to_str().unwrap(), "--print-header"]),
        2
    );
}

#[test]
fn similarity_order_emits_large_files_first() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir(&root).unwrap();
    let sizes = [5000usize, 64, 2000, 128, 1500, 96, 900];
    for (i, &size) in sizes.iter().enumerate() {
        // Incompressible-ish unique contents so chunks stay distinct.
        let content: Vec<u8> = (0..size)
            .map(|j| ((j as u64 * 2654435761 + i as u64 * 97) >> 7) as u8)
            .collect();
        fs::write(root.join(format!("f{i}")), content).unwrap();
    }

    let image = tmp.path().join("img.dwarfs");
    assert_eq!(
        mkdwarfs(
            &[
                "--order",
                "similarity",
                "--max-similarity-size",
                "1000",
                "--file-hash",
                "none",
            ],
            &root,
            &image,
        ),
        0
    );

    // Files in first-chunk order: a strictly descending >1000 prefix,
    // then the remainder.
    let fs_ = open(&image);
    let mut data_order_sizes = Vec::new();
    fs_.walk_data_order(|_, inode| {
        if matches!(inode.kind(), InodeKind::File(_)) {
            data_order_sizes.push(fs_.getattr(inode).size);
        }
    });
    assert_eq!(data_order_sizes.len(), sizes.len());
    let large: Vec<u64> = data_order_sizes.iter().copied().take_while(|&s| s > 1000).collect();
    assert_eq!(large, [5000, 2000, 1500]);
    assert!(data_order_sizes[3..].iter().all(|&s| s <= 1000));
}

#[test]
fn pack_metadata_all_reports_options() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir_all(root.join("deep/deeper")).unwrap();
    let content = b"shared file content".repeat(10);
    fs::write(root.join("one"), &content).unwrap();
    fs::write(root.join("two"), &content).unwrap();
    fs::write(root.join("deep/three"), b"unique").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("one", root.join("link")).unwrap();

    let image = tmp.path().join("img.dwarfs");
    assert_eq!(mkdwarfs(&["--pack-metadata", "all"], &root, &image), 0);

    let fs_ = open(&image);
    let info = fs_.info_as_json(2);
    let options: BTreeSet<&str> = info["options"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    for expect in [
        "packed_chunk_table",
        "packed_directories",
        "packed_names",
        "packed_names_index",
        "packed_shared_files_table",
        "packed_symlinks_index",
    ] {
        assert!(options.contains(expect), "missing {expect} in {options:?}");
    }

    // Shared content is stored once.
    let one = fs_.find("one").unwrap();
    let two = fs_.find("two").unwrap();
    assert_eq!(fs_.read_file(one).unwrap(), content);
    let c1: Vec<_> = one.as_file().unwrap().chunks().collect();
    let c2: Vec<_> = two.as_file().unwrap().chunks().collect();
    assert_eq!(c1, c2);
}

#[test]
fn extract_roundtrips_content() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir_all(root.join("a/b")).unwrap();
    fs::write(root.join("a/hello.txt"), b"hello world").unwrap();
    fs::write(root.join("a/b/data.bin"), (0u16..1000).map(|i| i as u8).collect::<Vec<_>>())
        .unwrap();
    fs::write(root.join("empty"), b"").unwrap();
    #[cfg(unix)]
    std::os::unix::fs::symlink("a/hello.txt", root.join("link")).unwrap();

    let image = tmp.path().join("img.dwarfs");
    assert_eq!(mkdwarfs(&["-l", "3"], &root, &image), 0);

    let out = tmp.path().join("out");
    assert_eq!(
        tool(&[
            "dwarfsextract",
            image.to_str().unwrap(),
            "-f",
            "dir",
            "-o",
            out.to_str().unwrap(),
        ]),
        0
    );
    assert_eq!(fs::read(out.join("a/hello.txt")).unwrap(), b"hello world");
    assert_eq!(
        fs::read(out.join("a/b/data.bin")).unwrap(),
        (0u16..1000).map(|i| i as u8).collect::<Vec<_>>()
    );
    assert_eq!(fs::read(out.join("empty")).unwrap(), b"");
    #[cfg(unix)]
    assert_eq!(
        fs::read_link(out.join("link")).unwrap().to_str().unwrap(),
        "a/hello.txt"
    );

    // Unsupported formats are rejected cleanly.
    assert_eq!(
        tool(&["dwarfsextract", image.to_str().unwrap(), "-f", "cpio"]),
        1
    );
}

#[test]
fn filter_rules_shape_the_tree() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir_all(root.join("src")).unwrap();
    fs::create_dir_all(root.join("target/debug")).unwrap();
    fs::write(root.join("src/lib.rs"), b"pub fn x() {}").unwrap();
    fs::write(root.join("src/junk.tmp"), b"scratch").unwrap();
    fs::write(root.join("target/debug/out.o"), b"\x7fELF").unwrap();

    let image = tmp.path().join("img.dwarfs");
    assert_eq!(
        mkdwarfs(&["-F", "- /target", "-F", "- *.tmp"], &root, &image),
        0
    );

    let fs_ = open(&image);
    assert!(fs_.find("src/lib.rs").is_some());
    assert!(fs_.find("src/junk.tmp").is_none());
    assert!(fs_.find("target").is_none());
}

#[test]
fn recompress_preserves_content() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().join("root");
    fs::create_dir(&root).unwrap();
    let content = b"recompress me please ".repeat(1000);
    fs::write(root.join("big"), &content).unwrap();

    let image = tmp.path().join("img.dwarfs");
    assert_eq!(mkdwarfs(&["-l", "1"], &root, &image), 0);

    let better = tmp.path().join("better.dwarfs");
    let code = tool(&[
        "mkdwarfs",
        "-i",
        image.to_str().unwrap(),
        "-o",
        better.to_str().unwrap(),
        "--recompress",
        "-l",
        "7",
        "--force",
        "--progress",
        "none",
    ]);
    assert_eq!(code, 0);

    let fs_ = open(&better);
    assert_eq!(fs_.read_file(fs_.find("big").unwrap()).unwrap(), content);
    assert_eq!(
        tool(&["dwarfsck", better.to_str().unwrap(), "--check-integrity", "-d", "0"]),
        0
    );
}
