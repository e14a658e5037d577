//! Include/exclude target patterns describing the sync universe.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::label::{split_repo, Label};

/// What part of a package tree a pattern covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PatternKind {
    /// `//pkg:name`
    Target(String),
    /// `//pkg:all`, `//pkg:*`, `//pkg:all-targets`
    AllInPackage,
    /// `//pkg/...`
    Recursive,
}

/// One include or exclude target pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetPattern {
    exclude: bool,
    repo: String,
    package: String,
    kind: PatternKind,
}

/// Error returned when a target pattern fails to parse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid target pattern '{0}'")]
pub struct ParsePatternError(String);

impl TargetPattern {
    /// Whether this pattern removes matches instead of adding them.
    #[must_use]
    pub fn is_exclude(&self) -> bool {
        self.exclude
    }

    /// Whether `label` falls under this pattern, ignoring include/exclude.
    #[must_use]
    pub fn matches(&self, label: &Label) -> bool {
        if label.repo() != self.repo {
            return false;
        }
        match &self.kind {
            PatternKind::Target(name) => label.package() == self.package && label.name() == name,
            PatternKind::AllInPackage => label.package() == self.package,
            PatternKind::Recursive => {
                self.package.is_empty()
                    || label.package() == self.package
                    || label
                        .package()
                        .strip_prefix(self.package.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
        }
    }
}

impl FromStr for TargetPattern {
    type Err = ParsePatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParsePatternError(s.to_string());
        let (exclude, body) = match s.strip_prefix('-') {
            Some(body) => (true, body),
            None => (false, s),
        };
        let (repo, rest) = split_repo(body).map_err(|_| err())?;

        let (package, kind) = if rest == "..." {
            (String::new(), PatternKind::Recursive)
        } else if let Some(package) = rest.strip_suffix("/...") {
            (package.to_string(), PatternKind::Recursive)
        } else if let Some((package, target)) = rest.split_once(':') {
            let kind = match target {
                "all" | "*" | "all-targets" => PatternKind::AllInPackage,
                _ => {
                    let label = Label::new(repo, package, target).map_err(|_| err())?;
                    PatternKind::Target(label.name().to_string())
                }
            };
            (package.to_string(), kind)
        } else {
            let label: Label = body.parse().map_err(|_| err())?;
            (label.package().to_string(), PatternKind::Target(label.name().to_string()))
        };
        if package.starts_with('/') || package.ends_with('/') || package.contains("...") {
            return Err(err());
        }
        Ok(Self {
            exclude,
            repo: repo.to_string(),
            package,
            kind,
        })
    }
}

impl fmt::Display for TargetPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exclude {
            write!(f, "-")?;
        }
        if !self.repo.is_empty() {
            write!(f, "@{}", self.repo)?;
        }
        match &self.kind {
            PatternKind::Recursive if self.package.is_empty() => write!(f, "//..."),
            PatternKind::Recursive => write!(f, "//{}/...", self.package),
            PatternKind::AllInPackage => write!(f, "//{}:all", self.package),
            PatternKind::Target(name) => write!(f, "//{}:{}", self.package, name),
        }
    }
}

impl Serialize for TargetPattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TargetPattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Ordered include/exclude patterns; later patterns override earlier ones.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TargetScope {
    patterns: Vec<TargetPattern>,
}

impl TargetScope {
    /// Scope from an ordered pattern list.
    #[must_use]
    pub fn new(patterns: Vec<TargetPattern>) -> Self {
        Self { patterns }
    }

    /// Parse every pattern in order.
    ///
    /// # Errors
    ///
    /// Returns the first `ParsePatternError`.
    pub fn parse<I, S>(patterns: I) -> Result<Self, ParsePatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        patterns
            .into_iter()
            .map(|p| p.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()
            .map(Self::new)
    }

    /// Patterns in evaluation order.
    #[must_use]
    pub fn patterns(&self) -> &[TargetPattern] {
        &self.patterns
    }

    /// Whether no pattern is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `label` is inside the scope.
    #[must_use]
    pub fn contains(&self, label: &Label) -> bool {
        self.patterns
            .iter()
            .rev()
            .find(|p| p.matches(label))
            .is_some_and(|p| !p.is_exclude())
    }
}

impl fmt::Display for TargetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.patterns.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(s: &str) -> Label {
        s.parse().unwrap()
    }

    #[test]
    fn test_recursive_pattern() {
        let p: TargetPattern = "//a/...".parse().unwrap();
        assert!(p.matches(&label("//a:x")));
        assert!(p.matches(&label("//a/b/c:x")));
        assert!(!p.matches(&label("//ab:x")));
        assert!(!p.matches(&label("@r//a:x")));

        let all: TargetPattern = "//...".parse().unwrap();
        assert!(all.matches(&label("//anything/deep:x")));
        assert!(all.matches(&label("//:root")));
    }

    #[test]
    fn test_package_and_target_patterns() {
        let p: TargetPattern = "//a:all".parse().unwrap();
        assert!(p.matches(&label("//a:x")));
        assert!(!p.matches(&label("//a/b:x")));

        let t: TargetPattern = "@r//a:lib".parse().unwrap();
        assert!(t.matches(&label("@r//a:lib")));
        assert!(!t.matches(&label("@r//a:other")));

        let short: TargetPattern = "//a/b".parse().unwrap();
        assert!(short.matches(&label("//a/b:b")));
    }

    #[test]
    fn test_scope_later_patterns_win() {
        let scope = TargetScope::parse(["//...", "-//third_party/...", "//third_party/keep:all"]).unwrap();
        assert!(scope.contains(&label("//app:main")));
        assert!(!scope.contains(&label("//third_party/zlib:z")));
        assert!(scope.contains(&label("//third_party/keep:k")));
        assert!(!TargetScope::default().contains(&label("//app:main")));
    }

    #[test]
    fn test_display_roundtrip() {
        for text in ["//...", "-//a/...", "@r//x:all", "//p:t", "@r//..."] {
            assert_eq!(text.parse::<TargetPattern>().unwrap().to_string(), text);
        }
        assert_eq!("//p:*".parse::<TargetPattern>().unwrap().to_string(), "//p:all");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "a/...", "//a/.../b", "-", "//a:b:c"] {
            assert!(bad.parse::<TargetPattern>().is_err(), "{bad}");
        }
    }
}
