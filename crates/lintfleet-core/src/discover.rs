//! File discovery: glob matching over a directory tree.
//!
//! Patterns are shell-style with `*`, `?`, `[set]`, `{a,b}` braces, and
//! `**` (globstar) spanning directory boundaries. Discovery walks the
//! target, skips hidden directories and `node_modules`, and returns the
//! matching files as sorted absolute paths.

use std::path::{Path, PathBuf};

use crate::error::{CoreError, CoreResult};

/// One component of a path pattern.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    /// Literal name: "src", "main.ts"
    Literal(String),
    /// Name with wildcards: "*.ts", "test_?"
    Wildcard(String),
    /// `**`: zero or more directory components.
    Globstar,
}

/// A parsed path pattern with globstar support.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    segments: Vec<Segment>,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> CoreResult<Self> {
        let trimmed = pattern.trim_matches('/');
        if trimmed.is_empty() {
            return Err(CoreError::Discover("empty glob pattern".into()));
        }

        let mut segments = Vec::new();
        for part in trimmed.split('/') {
            if part.is_empty() {
                continue;
            }
            if part == "**" {
                // Consecutive globstars collapse to one.
                if !matches!(segments.last(), Some(Segment::Globstar)) {
                    segments.push(Segment::Globstar);
                }
            } else if part.contains(['*', '?', '[', '{']) {
                segments.push(Segment::Wildcard(part.to_string()));
            } else {
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(Self { segments })
    }

    /// Match a path relative to the discovery root.
    pub fn matches(&self, rel: &Path) -> bool {
        let components: Vec<&str> = rel
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();
        match_from(&self.segments, &components)
    }
}

fn match_from(segments: &[Segment], components: &[&str]) -> bool {
    match segments.first() {
        None => components.is_empty(),
        Some(Segment::Globstar) => {
            // Try consuming 0..=n components.
            (0..=components.len()).any(|skip| match_from(&segments[1..], &components[skip..]))
        }
        Some(Segment::Literal(name)) => match components.first() {
            Some(head) if head == name => match_from(&segments[1..], &components[1..]),
            _ => false,
        },
        Some(Segment::Wildcard(pattern)) => match components.first() {
            Some(head) if name_match(pattern, head) => match_from(&segments[1..], &components[1..]),
            _ => false,
        },
    }
}

/// Match a single path component against a wildcard pattern.
///
/// Braces expand first; each alternative then goes through the
/// character-level matcher.
fn name_match(pattern: &str, input: &str) -> bool {
    expand_braces(pattern).iter().any(|p| {
        let pat: Vec<char> = p.chars().collect();
        let inp: Vec<char> = input.chars().collect();
        chars_match(&pat, &inp)
    })
}

fn chars_match(pattern: &[char], input: &[char]) -> bool {
    match pattern.first() {
        None => input.is_empty(),
        Some('*') => {
            (0..=input.len()).any(|skip| chars_match(&pattern[1..], &input[skip..]))
        }
        Some('?') => !input.is_empty() && chars_match(&pattern[1..], &input[1..]),
        Some('[') => match pattern.iter().position(|&c| c == ']') {
            Some(close) if close > 1 => {
                let set = &pattern[1..close];
                match input.first() {
                    Some(&c) if set_contains(set, c) => {
                        chars_match(&pattern[close + 1..], &input[1..])
                    }
                    _ => false,
                }
            }
            // Unterminated set: treat the bracket literally.
            _ => input.first() == Some(&'[') && chars_match(&pattern[1..], &input[1..]),
        },
        Some(&ch) => input.first() == Some(&ch) && chars_match(&pattern[1..], &input[1..]),
    }
}

fn set_contains(set: &[char], c: char) -> bool {
    let (negated, set) = match set.first() {
        Some('!') | Some('^') => (true, &set[1..]),
        _ => (false, set),
    };
    let mut hit = false;
    let mut i = 0;
    while i < set.len() {
        if i + 2 < set.len() && set[i + 1] == '-' {
            if set[i] <= c && c <= set[i + 2] {
                hit = true;
            }
            i += 3;
        } else {
            if set[i] == c {
                hit = true;
            }
            i += 1;
        }
    }
    hit != negated
}

/// Expand the first top-level `{a,b}` group; recurse for the rest.
fn expand_braces(pattern: &str) -> Vec<String> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut depth = 0usize;
    let mut open = None;
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '{' => {
                if depth == 0 {
                    open = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(start) = open {
                        let prefix: String = chars[..start].iter().collect();
                        let suffix: String = chars[i + 1..].iter().collect();
                        let body: String = chars[start + 1..i].iter().collect();
                        let mut out = Vec::new();
                        for alt in split_alternatives(&body) {
                            out.extend(expand_braces(&format!("{prefix}{alt}{suffix}")));
                        }
                        return out;
                    }
                }
            }
            _ => {}
        }
    }
    vec![pattern.to_string()]
}

fn split_alternatives(body: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in body.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => out.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    out.push(current);
    out
}

/// Directories never descended into.
fn skip_dir(name: &str) -> bool {
    name.starts_with('.') || name == "node_modules"
}

/// Walk `target` and return the absolute paths matching `pattern`, sorted.
pub async fn discover_files(target: &Path, pattern: &GlobPattern) -> CoreResult<Vec<PathBuf>> {
    let root = target
        .canonicalize()
        .map_err(|e| CoreError::io(target, e))?;

    let mut found = Vec::new();
    let mut stack = vec![root.clone()];

    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| CoreError::io(&dir, e))?;
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|e| CoreError::io(&dir, e))?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            let file_type = entry
                .file_type()
                .await
                .map_err(|e| CoreError::io(&path, e))?;
            if file_type.is_dir() {
                if !skip_dir(name) {
                    stack.push(path);
                }
            } else if file_type.is_file() {
                if let Ok(rel) = path.strip_prefix(&root) {
                    if pattern.matches(rel) {
                        found.push(path);
                    }
                }
            }
        }
    }

    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(pattern: &str, path: &str) -> bool {
        GlobPattern::new(pattern).unwrap().matches(Path::new(path))
    }

    #[test]
    fn globstar_spans_directories() {
        assert!(matches("src/**/*.ts", "src/index.ts"));
        assert!(matches("src/**/*.ts", "src/a/b/c/deep.ts"));
        assert!(!matches("src/**/*.ts", "lib/index.ts"));
        assert!(!matches("src/**/*.ts", "src/index.js"));
    }

    #[test]
    fn bare_globstar_matches_everything_below() {
        assert!(matches("**/*.ts", "a.ts"));
        assert!(matches("**/*.ts", "x/y/a.ts"));
        assert!(!matches("**/*.ts", "x/y/a.rs"));
    }

    #[test]
    fn literal_segments_must_match_exactly() {
        assert!(matches("src/main.ts", "src/main.ts"));
        assert!(!matches("src/main.ts", "src/main.tsx"));
    }

    #[test]
    fn question_mark_and_sets() {
        assert!(matches("src/file?.ts", "src/file1.ts"));
        assert!(!matches("src/file?.ts", "src/file10.ts"));
        assert!(matches("src/[ab].ts", "src/a.ts"));
        assert!(matches("src/[a-c].ts", "src/b.ts"));
        assert!(!matches("src/[!a].ts", "src/a.ts"));
        assert!(matches("src/[!a].ts", "src/b.ts"));
    }

    #[test]
    fn braces_expand_alternatives() {
        assert!(matches("src/**/*.{ts,tsx}", "src/app/view.tsx"));
        assert!(matches("src/**/*.{ts,tsx}", "src/app/logic.ts"));
        assert!(!matches("src/**/*.{ts,tsx}", "src/app/style.css"));
    }

    #[test]
    fn consecutive_globstars_collapse() {
        assert!(matches("src/**/**/*.ts", "src/a.ts"));
    }

    #[test]
    fn empty_pattern_is_an_error() {
        assert!(GlobPattern::new("").is_err());
        assert!(GlobPattern::new("/").is_err());
    }

    #[tokio::test]
    async fn walk_finds_sorted_matches_and_skips_noise() {
        let root = std::env::temp_dir().join(format!("lintfleet-discover-{}", std::process::id()));
        let src = root.join("src");
        let nested = src.join("app");
        tokio::fs::create_dir_all(&nested).await.unwrap();
        tokio::fs::create_dir_all(root.join("src/node_modules/dep")).await.unwrap();
        tokio::fs::create_dir_all(root.join("src/.cache")).await.unwrap();

        for p in [
            src.join("b.ts"),
            src.join("a.ts"),
            nested.join("c.ts"),
            src.join("readme.md"),
            root.join("src/node_modules/dep/d.ts"),
            root.join("src/.cache/e.ts"),
        ] {
            tokio::fs::write(&p, "export {};\n").await.unwrap();
        }

        let pattern = GlobPattern::new("src/**/*.ts").unwrap();
        let files = discover_files(&root, &pattern).await.unwrap();
        let names: Vec<String> = files
            .iter()
            .map(|p| {
                p.strip_prefix(root.canonicalize().unwrap())
                    .unwrap()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect();

        assert_eq!(names, vec!["src/a.ts", "src/app/c.ts", "src/b.ts"]);

        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
