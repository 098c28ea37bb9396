//! Input tree scanning.
//!
//! Produces a flat, parent-before-child list of [`ScanEntry`] records in
//! deterministic order (children sorted by name). Filter rules prune
//! excluded entries, and excluded directories are not descended into.
//! Ownership, permission and time overrides are applied here so every
//! later stage sees final values.

use std::{
    fs,
    io::BufRead,
    path::{Path, PathBuf},
};

use bstr::{BStr, BString, ByteSlice};

use crate::{
    Error, Result,
    filter::{FilterAction, FilterRules},
};

/// Inode attributes captured at scan time, after overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeMeta {
    /// Permission bits only (`0o7777` mask); the file type comes from
    /// [`EntryKind`].
    pub perms: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub atime: u64,
    pub ctime: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Dir,
    File { size: u64 },
    Symlink { target: BString },
    BlockDev { rdev: u64 },
    CharDev { rdev: u64 },
    Fifo,
    Socket,
}

/// One scanned entry. `parent` indexes into the scan result; the root is
/// entry 0 with an empty name.
#[derive(Debug, Clone)]
pub struct ScanEntry {
    pub parent: u32,
    pub name: BString,
    /// On-disk path, for reading file contents later.
    pub path: PathBuf,
    pub kind: EntryKind,
    pub meta: InodeMeta,
}

impl ScanEntry {
    pub fn is_file(&self) -> bool {
        matches!(self.kind, EntryKind::File { .. })
    }

    pub fn size(&self) -> u64 {
        match self.kind {
            EntryKind::File { size } => size,
            _ => 0,
        }
    }
}

/// Overrides applied while scanning.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    pub set_time: Option<u64>,
    pub set_owner: Option<u32>,
    pub set_group: Option<u32>,
    /// Normalize permissions: everything becomes `r--r--r--`, or
    /// `r-xr-xr-x` if any execute bit was set (directories always are).
    pub chmod_norm: bool,
}

impl ScanOptions {
    fn apply(&self, is_dir: bool, mut meta: InodeMeta) -> InodeMeta {
        if let Some(t) = self.set_time {
            (meta.mtime, meta.atime, meta.ctime) = (t, t, t);
        }
        if let Some(uid) = self.set_owner {
            meta.uid = uid;
        }
        if let Some(gid) = self.set_group {
            meta.gid = gid;
        }
        if self.chmod_norm {
            meta.perms = if is_dir || meta.perms & 0o111 != 0 { 0o555 } else { 0o444 };
        }
        meta
    }
}

fn meta_of(md: &fs::Metadata) -> InodeMeta {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        InodeMeta {
            perms: md.mode() & 0o7777,
            uid: md.uid(),
            gid: md.gid(),
            mtime: md.mtime().max(0) as u64,
            atime: md.atime().max(0) as u64,
            ctime: md.ctime().max(0) as u64,
        }
    }
    #[cfg(not(unix))]
    {
        let mtime = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs());
        InodeMeta {
            perms: if md.is_dir() { 0o755 } else { 0o644 },
            uid: 0,
            gid: 0,
            mtime,
            atime: mtime,
            ctime: mtime,
        }
    }
}

fn kind_of(path: &Path, md: &fs::Metadata) -> Result<Option<EntryKind>> {
    let ft = md.file_type();
    if ft.is_dir() {
        return Ok(Some(EntryKind::Dir));
    }
    if ft.is_file() {
        return Ok(Some(EntryKind::File { size: md.len() }));
    }
    if ft.is_symlink() {
        let target = fs::read_link(path)?;
        let target = BString::from(target.to_string_lossy().into_owned());
        return Ok(Some(EntryKind::Symlink { target }));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::{FileTypeExt, MetadataExt};
        if ft.is_block_device() {
            return Ok(Some(EntryKind::BlockDev { rdev: md.rdev() }));
        }
        if ft.is_char_device() {
            return Ok(Some(EntryKind::CharDev { rdev: md.rdev() }));
        }
        if ft.is_fifo() {
            return Ok(Some(EntryKind::Fifo));
        }
        if ft.is_socket() {
            return Ok(Some(EntryKind::Socket));
        }
    }
    Ok(None)
}

/// Scan the tree rooted at `root`.
///
/// `on_filter` observes every filter decision as
/// `(rel_path, included, is_dir)`, for `--debug-filter` style reporting.
pub fn scan_tree(
    root: &Path,
    filter: &FilterRules,
    options: &ScanOptions,
    mut on_filter: Option<&mut dyn FnMut(&BStr, bool, bool)>,
) -> Result<Vec<ScanEntry>> {
    let root_md = fs::symlink_metadata(root)?;
    if !root_md.is_dir() {
        bail!(Error::bad_args(format!("input is not a directory: {}", root.display())));
    }

    let mut entries = vec![ScanEntry {
        parent: 0,
        name: BString::default(),
        path: root.to_owned(),
        kind: EntryKind::Dir,
        meta: options.apply(true, meta_of(&root_md)),
    }];

    // Iterative DFS; (parent index, dir path, rel path).
    let mut stack = vec![(0u32, root.to_owned(), BString::default())];
    while let Some((parent, dir_path, rel)) = stack.pop() {
        let mut children: Vec<(BString, PathBuf)> = fs::read_dir(&dir_path)?
            .map(|ent| {
                let ent = ent?;
                let name = BString::from(ent.file_name().to_string_lossy().into_owned());
                Ok((name, ent.path()))
            })
            .collect::<Result<_>>()?;
        children.sort();

        for (name, path) in children {
            let mut rel_child = rel.clone();
            rel_child.push(b'/');
            rel_child.extend_from_slice(&name);

            let md = fs::symlink_metadata(&path)?;
            let Some(kind) = kind_of(&path, &md)? else {
                log::warn!("ignoring unsupported file type: {}", path.display());
                continue;
            };
            let is_dir = kind == EntryKind::Dir;

            let keep = filter.evaluate(&rel_child.to_str_lossy()) == FilterAction::Keep;
            if let Some(cb) = on_filter.as_mut() {
                cb(rel_child.as_bstr(), keep, is_dir);
            }
            if !keep {
                log::debug!("excluded: {rel_child}");
                continue;
            }

            let ent = ScanEntry {
                parent,
                name,
                path: path.clone(),
                meta: options.apply(is_dir, meta_of(&md)),
                kind,
            };
            let idx = push_entry(&mut entries, ent)?;
            if is_dir {
                stack.push((idx, path, rel_child));
            }
        }
    }

    Ok(entries)
}

/// Build the entry list from an explicit list of paths (one per line,
/// relative to `root`). Parent directories are materialized implicitly;
/// filter rules do not apply.
pub fn scan_input_list(
    root: &Path,
    list: impl BufRead,
    options: &ScanOptions,
) -> Result<Vec<ScanEntry>> {
    let root_md = fs::symlink_metadata(root)?;
    let mut entries = vec![ScanEntry {
        parent: 0,
        name: BString::default(),
        path: root.to_owned(),
        kind: EntryKind::Dir,
        meta: options.apply(true, meta_of(&root_md)),
    }];
    // rel dir path -> entry index.
    let mut dirs = std::collections::HashMap::<BString, u32>::new();
    dirs.insert(BString::default(), 0);

    let mut ensure_dir = |entries: &mut Vec<ScanEntry>,
                          dirs: &mut std::collections::HashMap<BString, u32>,
                          rel: &BStr|
     -> Result<u32> {
        if let Some(&idx) = dirs.get(rel) {
            return Ok(idx);
        }
        // Materialize ancestors bottom-up through recursion-free splitting.
        let mut have: BString = BString::default();
        let mut at = 0u32;
        for comp in rel.split(|&b| b == b'/').filter(|c| !c.is_empty()) {
            if !have.is_empty() {
                have.push(b'/');
            }
            have.extend_from_slice(comp);
            if let Some(&idx) = dirs.get(&have) {
                at = idx;
                continue;
            }
            let path = root.join(have.to_str_lossy().as_ref());
            let md = fs::symlink_metadata(&path)?;
            let ent = ScanEntry {
                parent: at,
                name: comp.into(),
                path,
                kind: EntryKind::Dir,
                meta: options.apply(true, meta_of(&md)),
            };
            at = push_entry(entries, ent)?;
            dirs.insert(have.clone(), at);
        }
        Ok(at)
    };

    let mut lines: Vec<String> = list.lines().collect::<std::io::Result<_>>()?;
    lines.retain(|l| !l.trim().is_empty());
    lines.sort();
    for line in lines {
        let rel = line.trim_matches('/');
        let (dir, name) = match rel.rfind('/') {
            Some(pos) => (&rel[..pos], &rel[pos + 1..]),
            None => ("", rel),
        };
        let parent = ensure_dir(&mut entries, &mut dirs, <&BStr>::from(dir))?;
        let path = root.join(rel);
        let md = fs::symlink_metadata(&path)?;
        let Some(kind) = kind_of(&path, &md)? else {
            log::warn!("ignoring unsupported file type: {}", path.display());
            continue;
        };
        if kind == EntryKind::Dir {
            ensure_dir(&mut entries, &mut dirs, <&BStr>::from(rel))?;
            continue;
        }
        let ent = ScanEntry {
            parent,
            name: name.into(),
            path,
            meta: options.apply(false, meta_of(&md)),
            kind,
        };
        push_entry(&mut entries, ent)?;
    }

    Ok(entries)
}

fn push_entry(entries: &mut Vec<ScanEntry>, ent: ScanEntry) -> Result<u32> {
    let idx = u32::try_from(entries.len())
        .map_err(|_| Error::from(crate::ErrorInner::Limit("entry count exceeds 2^32")))?;
    entries.push(ent);
    Ok(idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FsRuleFiles;
    use std::io::Cursor;

    fn build_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path();
        fs::create_dir_all(p.join("src/deep")).unwrap();
        fs::create_dir(p.join("build")).unwrap();
        fs::write(p.join("src/main.c"), "int main;").unwrap();
        fs::write(p.join("src/deep/util.c"), "// util").unwrap();
        fs::write(p.join("build/out.o"), [0u8; 16]).unwrap();
        fs::write(p.join("README"), "hi").unwrap();
        dir
    }

    #[test]
    fn deterministic_order_and_parents() {
        let dir = build_tree();
        let entries =
            scan_tree(dir.path(), &FilterRules::new(), &ScanOptions::default(), None).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.to_string()).collect();
        // Children are name-sorted; subtrees follow their parent in LIFO
        // order of discovery.
        assert_eq!(
            names,
            ["", "README", "build", "src", "deep", "main.c", "util.c", "out.o"]
        );
        for (i, ent) in entries.iter().enumerate().skip(1) {
            assert!((ent.parent as usize) < i, "parent before child");
            assert!(entries[ent.parent as usize].kind == EntryKind::Dir);
        }
    }

    #[test]
    fn excluded_dirs_are_pruned() {
        let dir = build_tree();
        let mut rules = FilterRules::new();
        rules.add_rule("- /build", &mut FsRuleFiles).unwrap();
        let mut decisions = Vec::new();
        let mut cb = |path: &BStr, keep: bool, _is_dir: bool| decisions.push((path.to_string(), keep));
        let entries =
            scan_tree(dir.path(), &rules, &ScanOptions::default(), Some(&mut cb)).unwrap();
        assert!(entries.iter().all(|e| e.name != "out.o" && e.name != "build"));
        assert!(decisions.contains(&("/build".into(), false)));
        // Nothing under an excluded directory is even visited.
        assert!(!decisions.iter().any(|(p, _)| p.contains("out.o")));
    }

    #[test]
    fn overrides() {
        let dir = build_tree();
        let opts = ScanOptions {
            set_time: Some(100000001),
            set_owner: Some(1000),
            set_group: Some(100),
            chmod_norm: true,
        };
        let entries = scan_tree(dir.path(), &FilterRules::new(), &opts, None).unwrap();
        for ent in &entries {
            assert_eq!(ent.meta.mtime, 100000001);
            assert_eq!(ent.meta.uid, 1000);
            assert_eq!(ent.meta.gid, 100);
            assert!(matches!(ent.meta.perms, 0o444 | 0o555));
        }
        assert!(entries.iter().any(|e| e.kind == EntryKind::Dir && e.meta.perms == 0o555));
    }

    #[test]
    fn input_list() {
        let dir = build_tree();
        let list = "src/main.c\nsrc/deep/util.c\n";
        let entries =
            scan_input_list(dir.path(), Cursor::new(list), &ScanOptions::default()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.to_string()).collect();
        assert_eq!(names, ["", "src", "deep", "util.c", "main.c"]);
    }
}
