//! Rule-based entry filtering.
//!
//! Rules are `+pattern` (keep) or `-pattern` (remove); the first matching
//! rule wins, and unmatched entries are kept. A pattern that does not
//! start with `/` is *floating*: it may match at any depth. Glob syntax:
//!
//! - `*` matches within one path component (`[^/]*`, or `[^/]+` when it
//!   stands alone between two `/`),
//! - `**` matches across components,
//! - `?` matches one non-`/` character,
//! - `\x` escapes the next character.
//!
//! A rule line starting with `.` is a merge directive naming another rule
//! file to inline; recursive inclusion is detected and rejected. In rule
//! files, `#` comments and blank lines are skipped.

use std::{
    collections::HashSet,
    fmt,
    io::{BufRead, BufReader},
};

use regex::Regex;

use crate::{Error, ErrorInner, Result};

/// The verdict of [`FilterRules::evaluate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Keep,
    Remove,
}

#[derive(Debug)]
struct Rule {
    keep: bool,
    re: Regex,
    raw: String,
}

/// An ordered first-match-wins rule set.
#[derive(Debug, Default)]
pub struct FilterRules {
    rules: Vec<Rule>,
}

/// Provides the contents of rule files named by merge directives.
/// Abstracted for tests; [`FsRuleFiles`] reads the real filesystem.
pub trait RuleFiles {
    fn open(&mut self, name: &str) -> std::io::Result<Box<dyn BufRead + '_>>;
}

/// Reads rule files from the filesystem.
#[derive(Debug, Default)]
pub struct FsRuleFiles;

impl RuleFiles for FsRuleFiles {
    fn open(&mut self, name: &str) -> std::io::Result<Box<dyn BufRead + '_>> {
        Ok(Box::new(BufReader::new(std::fs::File::open(name)?)))
    }
}

impl FilterRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Add a single rule line, resolving merge directives through `files`.
    pub fn add_rule(&mut self, rule: &str, files: &mut dyn RuleFiles) -> Result<()> {
        let mut seen = HashSet::new();
        self.add_rule_inner(rule, files, &mut seen)
    }

    /// Add every rule from a reader, skipping comments and blank lines.
    pub fn add_rules(&mut self, rdr: impl BufRead, files: &mut dyn RuleFiles) -> Result<()> {
        let mut seen = HashSet::new();
        self.add_rules_inner(rdr, files, &mut seen)
    }

    fn add_rule_inner(
        &mut self,
        rule: &str,
        files: &mut dyn RuleFiles,
        seen: &mut HashSet<String>,
    ) -> Result<()> {
        if let Some(rest) = rule.strip_prefix('.') {
            let file = rest.trim_start_matches([' ', '\t']);
            if file.is_empty() {
                bail!(ErrorInner::BadFilterRule(format!(
                    "no file specified in merge rule: {rule}"
                )));
            }
            if !seen.insert(file.to_owned()) {
                bail!(ErrorInner::RecursiveInclude(file.to_owned()));
            }
            let rdr = files.open(file)?;
            // Re-borrow dance: the reader borrows `files`, so buffer lines
            // before recursing into nested directives.
            let lines: Vec<String> =
                rdr.lines().collect::<std::io::Result<_>>()?;
            for line in lines {
                if line.starts_with('#') || line.trim().is_empty() {
                    continue;
                }
                self.add_rule_inner(&line, files, seen)?;
            }
            seen.remove(file);
            Ok(())
        } else {
            self.rules.push(compile_rule(rule)?);
            Ok(())
        }
    }

    fn add_rules_inner(
        &mut self,
        rdr: impl BufRead,
        files: &mut dyn RuleFiles,
        seen: &mut HashSet<String>,
    ) -> Result<()> {
        for line in rdr.lines() {
            let line = line?;
            if line.starts_with('#') || line.trim().is_empty() {
                continue;
            }
            self.add_rule_inner(&line, files, seen)?;
        }
        Ok(())
    }

    /// Evaluate a path relative to the scan root. `rel_path` must start
    /// with `/` (the root itself is `/`).
    pub fn evaluate(&self, rel_path: &str) -> FilterAction {
        debug_assert!(rel_path.starts_with('/'));
        for rule in &self.rules {
            if rule.re.is_match(rel_path) {
                log::trace!("[{rel_path}] matched rule '{}'", rule.raw);
                return if rule.keep { FilterAction::Keep } else { FilterAction::Remove };
            }
        }
        FilterAction::Keep
    }
}

impl fmt::Display for FilterRules {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for rule in &self.rules {
            writeln!(f, "{}", rule.raw)?;
        }
        Ok(())
    }
}

fn compile_rule(raw: &str) -> Result<Rule> {
    let bad = |msg: &str| -> Error {
        ErrorInner::BadFilterRule(format!("{msg}: {raw}")).into()
    };

    let mut chars = raw.chars().peekable();
    let keep = match chars.next() {
        Some('+') => true,
        Some('-') => false,
        _ => return Err(bad("rules must start with + or -")),
    };
    while chars.peek() == Some(&' ') {
        chars.next();
    }

    let pattern: String = chars.collect();
    // Patterns not anchored at the root float to any depth.
    let floating = !pattern.is_empty() && !pattern.starts_with('/');
    let mut re = String::from("^");
    if floating {
        re.push_str(".*/");
    }

    let mut rest = pattern.as_str();
    while let Some(c) = rest.chars().next() {
        rest = &rest[c.len_utf8()..];
        match c {
            '\\' => {
                let Some(esc) = rest.chars().next() else {
                    return Err(bad("dangling escape"));
                };
                rest = &rest[esc.len_utf8()..];
                re.push('\\');
                re.push(esc);
            }
            '*' => {
                let mut stars = 1;
                while rest.starts_with('*') {
                    stars += 1;
                    rest = &rest[1..];
                }
                match stars {
                    1 => {
                        // A lone `*` component must match at least one
                        // character, so `a/*/b` does not match `a//b`.
                        if re.ends_with('/') && (rest.starts_with('/') || rest.is_empty()) {
                            re.push_str("[^/]+");
                        } else {
                            re.push_str("[^/]*");
                        }
                    }
                    2 => re.push_str(".*"),
                    _ => return Err(bad("too many *s")),
                }
            }
            '?' => re.push_str("[^/]"),
            '.' | '+' | '^' | '$' | '(' | ')' | '{' | '}' | '|' | '[' | ']' => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
    }
    re.push('$');

    log::debug!("'{raw}' -> '{re}' [floating={floating}]");
    let re = Regex::new(&re).map_err(|err| bad(&format!("bad pattern ({err})")))?;
    Ok(Rule { keep, re, raw: raw.to_owned() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Cursor;

    struct MapFiles(HashMap<&'static str, &'static str>);

    impl RuleFiles for MapFiles {
        fn open(&mut self, name: &str) -> std::io::Result<Box<dyn BufRead + '_>> {
            match self.0.get(name) {
                Some(content) => Ok(Box::new(Cursor::new(content.as_bytes()))),
                None => Err(std::io::Error::from(std::io::ErrorKind::NotFound)),
            }
        }
    }

    fn rules(lines: &[&str]) -> FilterRules {
        let mut f = FilterRules::new();
        for line in lines {
            f.add_rule(line, &mut FsRuleFiles).unwrap();
        }
        f
    }

    #[test]
    fn first_match_wins() {
        let f = rules(&["+ /keep/*.c", "- /keep/**", "- *.o"]);
        assert_eq!(f.evaluate("/keep/x.c"), FilterAction::Keep);
        assert_eq!(f.evaluate("/keep/x.h"), FilterAction::Remove);
        assert_eq!(f.evaluate("/src/x.o"), FilterAction::Remove);
        assert_eq!(f.evaluate("/src/x.c"), FilterAction::Keep);
    }

    #[test]
    fn floating_vs_anchored() {
        let f = rules(&["- build"]);
        assert_eq!(f.evaluate("/build"), FilterAction::Remove);
        assert_eq!(f.evaluate("/deep/build"), FilterAction::Remove);
        assert_eq!(f.evaluate("/builds"), FilterAction::Keep);

        let f = rules(&["- /build"]);
        assert_eq!(f.evaluate("/build"), FilterAction::Remove);
        assert_eq!(f.evaluate("/deep/build"), FilterAction::Keep);
    }

    #[test]
    fn glob_translation() {
        let f = rules(&["- /a/*/b"]);
        assert_eq!(f.evaluate("/a/x/b"), FilterAction::Remove);
        assert_eq!(f.evaluate("/a/x/y/b"), FilterAction::Keep);

        let f = rules(&["- /a/**/b"]);
        assert_eq!(f.evaluate("/a/x/y/b"), FilterAction::Remove);

        let f = rules(&["- /f?o.txt"]);
        assert_eq!(f.evaluate("/foo.txt"), FilterAction::Remove);
        assert_eq!(f.evaluate("/fo.txt"), FilterAction::Keep);
        assert_eq!(f.evaluate("/fxo.txt"), FilterAction::Remove);

        let f = rules(&[r"- /lit\*eral"]);
        assert_eq!(f.evaluate("/lit*eral"), FilterAction::Remove);
        assert_eq!(f.evaluate("/litXeral"), FilterAction::Keep);

        assert!(compile_rule("- a***b").is_err());
        assert!(compile_rule("no-sign").is_err());
    }

    #[test]
    fn merge_directives() {
        let mut files = MapFiles(HashMap::from([
            ("common", "# a comment\n- *.tmp\n\n. extra\n"),
            ("extra", "- *.bak\n"),
        ]));
        let mut f = FilterRules::new();
        f.add_rule(". common", &mut files).unwrap();
        assert_eq!(f.evaluate("/x.tmp"), FilterAction::Remove);
        assert_eq!(f.evaluate("/x.bak"), FilterAction::Remove);
        assert_eq!(f.evaluate("/x.c"), FilterAction::Keep);
    }

    #[test]
    fn merge_recursion_is_detected() {
        let mut files = MapFiles(HashMap::from([
            ("a", ". b\n"),
            ("b", ". a\n"),
        ]));
        let mut f = FilterRules::new();
        let err = f.add_rule(". a", &mut files).unwrap_err();
        assert!(err.to_string().contains("recursion detected"));
    }

    #[test]
    fn sibling_includes_are_not_recursion() {
        let mut files = MapFiles(HashMap::from([
            ("shared", "- *.log\n"),
            ("main", ". shared\n. again\n"),
            ("again", ". shared\n"),
        ]));
        let mut f = FilterRules::new();
        f.add_rule(". main", &mut files).unwrap();
        assert_eq!(f.evaluate("/x.log"), FilterAction::Remove);
    }
}
