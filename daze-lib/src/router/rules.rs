use std::io::BufRead;

use async_trait::async_trait;
use glob::Pattern;

use crate::error::{DazeError, Result};
use crate::router::{Road, Router};

/// Glob-pattern router loaded from a rule file.
///
/// One directive per line: `<mode> <pattern>...` with mode `L` (locale),
/// `R` (remote) or `B` (blocked). Lines starting with `#` and lines with
/// fewer than two fields are ignored, as are unknown modes. Globs are
/// shell-style: `?`, `*`, `[chars]`, `[^chars]`, `[a-b]`.
///
/// Blocked patterns are checked first so a block line always wins over a
/// broader locale or remote wildcard, then locale, then remote.
pub struct RouterRules {
    locale: Vec<Pattern>,
    remote: Vec<Pattern>,
    fucked: Vec<Pattern>,
}

impl RouterRules {
    pub fn new() -> Self {
        Self { locale: Vec::new(), remote: Vec::new(), fucked: Vec::new() }
    }

    pub fn from_reader<R: BufRead>(reader: R) -> Result<Self> {
        let mut rules = Self::new();
        for line in reader.lines() {
            let line = line.map_err(DazeError::Io)?;
            rules.push_line(&line)?;
        }
        Ok(rules)
    }

    fn push_line(&mut self, line: &str) -> Result<()> {
        let mut fields = line.split_whitespace();
        let mode = match fields.next() {
            Some(m) => m,
            None => return Ok(()),
        };
        let bucket = match mode {
            "L" => &mut self.locale,
            "R" => &mut self.remote,
            "B" => &mut self.fucked,
            _ => return Ok(()),
        };
        for pat in fields {
            bucket.push(compile(pat)?);
        }
        Ok(())
    }
}

impl Default for RouterRules {
    fn default() -> Self {
        Self::new()
    }
}

fn compile(pat: &str) -> Result<Pattern> {
    // The rule grammar writes negated classes as [^chars].
    let normalized = pat.replace("[^", "[!");
    Pattern::new(&normalized)
        .map_err(|e| DazeError::Config(format!("bad rule pattern {pat:?}: {e}")))
}

#[async_trait]
impl Router for RouterRules {
    async fn road(&self, host: &str) -> Road {
        if self.fucked.iter().any(|p| p.matches(host)) {
            return Road::Fucked;
        }
        if self.locale.iter().any(|p| p.matches(host)) {
            return Road::Locale;
        }
        if self.remote.iter().any(|p| p.matches(host)) {
            return Road::Remote;
        }
        Road::Puzzle
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn rule_precedence() {
        let file = "R google.com\nL *.google.com\nB ads.google.com\n";
        let rules = RouterRules::from_reader(Cursor::new(file)).unwrap();
        assert_eq!(rules.road("google.com").await, Road::Remote);
        assert_eq!(rules.road("mail.google.com").await, Road::Locale);
        assert_eq!(rules.road("ads.google.com").await, Road::Fucked);
        assert_eq!(rules.road("example.com").await, Road::Puzzle);
    }

    #[tokio::test]
    async fn comments_short_lines_and_unknown_modes_are_ignored() {
        let file = "# B everything\nB\nX *.example.com\n\nL intranet\n";
        let rules = RouterRules::from_reader(Cursor::new(file)).unwrap();
        assert_eq!(rules.road("everything").await, Road::Puzzle);
        assert_eq!(rules.road("www.example.com").await, Road::Puzzle);
        assert_eq!(rules.road("intranet").await, Road::Locale);
    }

    #[tokio::test]
    async fn multiple_patterns_per_line() {
        let file = "L a.com b.com c.com\n";
        let rules = RouterRules::from_reader(Cursor::new(file)).unwrap();
        assert_eq!(rules.road("a.com").await, Road::Locale);
        assert_eq!(rules.road("b.com").await, Road::Locale);
        assert_eq!(rules.road("c.com").await, Road::Locale);
        assert_eq!(rules.road("d.com").await, Road::Puzzle);
    }

    #[tokio::test]
    async fn character_classes() {
        let file = "L host[0-3].lan\nR host[^0-3].lan\nB host?.x[ab].lan\n";
        let rules = RouterRules::from_reader(Cursor::new(file)).unwrap();
        assert_eq!(rules.road("host2.lan").await, Road::Locale);
        assert_eq!(rules.road("host7.lan").await, Road::Remote);
        assert_eq!(rules.road("host9.xa.lan").await, Road::Fucked);
    }

    #[test]
    fn bad_pattern_is_an_error() {
        let file = "L [abc\n";
        assert!(RouterRules::from_reader(Cursor::new(file)).is_err());
    }
}
