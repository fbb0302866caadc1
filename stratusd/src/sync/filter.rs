use std::io;
use std::path::Path;

const TMP_PREFIX: &str = ".";
const TMP_SUFFIX: &str = ".stratuspart";

/// Patterns every drive carries: in-flight download temporaries and names the
/// remote side rejects outright.
const BUILTIN_RULES: [&str; 2] = [".*.stratuspart", "*[<>?*:\"|]*"];

#[derive(Debug, Clone)]
struct Rule {
    segments: Vec<Vec<char>>,
    negate: bool,
    dir_only: bool,
    anchored: bool,
}

/// Gitignore-style ignore list, matched case-insensitively against
/// drive-relative paths. The last matching rule wins; negated rules
/// (`!pattern`) re-include.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    rules: Vec<Rule>,
}

impl PathFilter {
    pub fn new<I, S>(rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self { rules: Vec::new() };
        for rule in BUILTIN_RULES {
            filter.add_rule(rule);
        }
        for rule in rules {
            filter.add_rule(rule.as_ref());
        }
        filter
    }

    pub fn with_builtins() -> Self {
        Self::new(std::iter::empty::<&str>())
    }

    pub async fn load(path: &Path) -> io::Result<Self> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(Self::new(text.lines()))
    }

    fn add_rule(&mut self, line: &str) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return;
        }
        let (negate, rest) = match line.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        let (dir_only, rest) = match rest.strip_suffix('/') {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        let anchored = rest.contains('/');
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            return;
        }
        let segments = rest
            .split('/')
            .map(|seg| seg.to_lowercase().chars().collect())
            .collect();
        self.rules.push(Rule { segments, negate, dir_only, anchored });
    }

    /// `rel_path` is drive-relative (`"/Docs/A.txt"`); a trailing slash forces
    /// directory semantics, matching the original rule format.
    pub fn should_ignore(&self, rel_path: &str, is_dir: bool) -> bool {
        let is_dir = is_dir || rel_path.ends_with('/');
        let path: Vec<Vec<char>> = rel_path
            .trim_matches('/')
            .split('/')
            .filter(|seg| !seg.is_empty())
            .map(|seg| seg.to_lowercase().chars().collect())
            .collect();
        if path.is_empty() {
            return false;
        }

        let mut ignored = false;
        for rule in &self.rules {
            if rule.dir_only && !is_dir {
                continue;
            }
            let hit = if rule.anchored || rule.segments.len() > 1 {
                segments_match(&rule.segments, &path)
            } else {
                // Bare patterns match the basename at any depth.
                path.last()
                    .is_some_and(|name| segment_match(&rule.segments[0], name))
            };
            if hit {
                ignored = !rule.negate;
            }
        }
        ignored
    }

    pub fn temp_name(name: &str) -> String {
        format!("{TMP_PREFIX}{name}{TMP_SUFFIX}")
    }

    pub fn is_temp_name(name: &str) -> bool {
        name.starts_with(TMP_PREFIX)
            && name.ends_with(TMP_SUFFIX)
            && name.len() > TMP_PREFIX.len() + TMP_SUFFIX.len()
    }
}

fn segments_match(pattern: &[Vec<char>], path: &[Vec<char>]) -> bool {
    let Some((first, rest)) = pattern.split_first() else {
        return path.is_empty();
    };
    if matches!(first.as_slice(), ['*', '*']) {
        return (0..=path.len()).any(|skip| segments_match(rest, &path[skip..]));
    }
    let Some((seg, path_rest)) = path.split_first() else {
        return false;
    };
    segment_match(first, seg) && segments_match(rest, path_rest)
}

fn segment_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|skip| segment_match(rest, &text[skip..])),
        Some(('?', rest)) => !text.is_empty() && segment_match(rest, &text[1..]),
        Some(('[', rest)) => {
            let Some(end) = rest.iter().position(|c| *c == ']') else {
                // Unterminated class matches a literal bracket.
                return text.first() == Some(&'[') && segment_match(rest, &text[1..]);
            };
            let (class, after) = rest.split_at(end);
            let Some(first) = text.first() else {
                return false;
            };
            class_match(class, *first) && segment_match(&after[1..], &text[1..])
        }
        Some((ch, rest)) => text.first() == Some(ch) && segment_match(rest, &text[1..]),
    }
}

fn class_match(class: &[char], ch: char) -> bool {
    let (negated, class) = match class.split_first() {
        Some(('!', rest)) => (true, rest),
        _ => (false, class),
    };
    let mut hit = false;
    let mut i = 0;
    while i < class.len() {
        if i + 2 < class.len() && class[i + 1] == '-' {
            if (class[i]..=class[i + 2]).contains(&ch) {
                hit = true;
            }
            i += 3;
        } else {
            if class[i] == ch {
                hit = true;
            }
            i += 1;
        }
    }
    hit != negated
}
