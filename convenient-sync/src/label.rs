//! Canonical build target labels.

use convenient_storage::codec::{Codec, CodecBuffer, CodecContext, CodecResult, StringCodec};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Identifier of one build target: repository, package path and name.
///
/// Canonical text is `//pkg:name` for the main repository and
/// `@repo//pkg:name` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label {
    repo: String,
    package: String,
    name: String,
}

/// Error returned when a label fails to parse
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid label '{input}': {reason}")]
pub struct ParseLabelError {
    input: String,
    reason: &'static str,
}

impl ParseLabelError {
    pub(crate) fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

impl Label {
    /// Build a label from its parts.
    ///
    /// # Errors
    ///
    /// Returns `ParseLabelError` if the name is empty or a part contains
    /// label syntax characters.
    pub fn new(repo: &str, package: &str, name: &str) -> Result<Self, ParseLabelError> {
        let text = format!("@{repo}//{package}:{name}");
        if name.is_empty() {
            return Err(ParseLabelError::new(&text, "empty target name"));
        }
        if [repo, package, name]
            .iter()
            .any(|part| part.contains(':') || part.contains("//") || part.contains('@'))
        {
            return Err(ParseLabelError::new(&text, "unexpected label syntax in part"));
        }
        if package.starts_with('/') || package.ends_with('/') {
            return Err(ParseLabelError::new(&text, "package must not start or end with '/'"));
        }
        Ok(Self {
            repo: repo.to_string(),
            package: package.to_string(),
            name: name.to_string(),
        })
    }

    /// Repository name; empty for the main repository.
    #[must_use]
    pub fn repo(&self) -> &str {
        &self.repo
    }

    /// Package path.
    #[must_use]
    pub fn package(&self) -> &str {
        &self.package
    }

    /// Target name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the label belongs to the main repository.
    #[must_use]
    pub fn is_main_repo(&self) -> bool {
        self.repo.is_empty()
    }
}

impl FromStr for Label {
    type Err = ParseLabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (repo, rest) = split_repo(s)?;
        let (package, name) = match rest.split_once(':') {
            Some((package, name)) => (package, name),
            // `//foo/bar` is shorthand for `//foo/bar:bar`
            None => (rest, rest.rsplit('/').next().unwrap_or(rest)),
        };
        if name.is_empty() {
            return Err(ParseLabelError::new(s, "empty target name"));
        }
        Self::new(repo, package, name).map_err(|e| ParseLabelError::new(s, e.reason))
    }
}

/// Split `@repo//rest` or `//rest` into `(repo, rest)`.
pub(crate) fn split_repo(s: &str) -> Result<(&str, &str), ParseLabelError> {
    let trimmed = s.trim_start_matches('@');
    let (repo, rest) = if trimmed.len() == s.len() {
        ("", s)
    } else {
        let idx = trimmed
            .find("//")
            .ok_or_else(|| ParseLabelError::new(s, "missing '//' after repository"))?;
        (&trimmed[..idx], &trimmed[idx..])
    };
    let rest = rest
        .strip_prefix("//")
        .ok_or_else(|| ParseLabelError::new(s, "label must start with '//' or '@'"))?;
    Ok((repo, rest))
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.repo.is_empty() {
            write!(f, "@{}", self.repo)?;
        }
        write!(f, "//{}:{}", self.package, self.name)
    }
}

impl Serialize for Label {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Label {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Codec for [`Label`]: repository, package and name as strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelCodec;

impl Codec for LabelCodec {
    type Value = Label;

    fn encode(&self, ctx: &CodecContext, buf: &mut CodecBuffer, value: &Label) -> CodecResult<()> {
        StringCodec.encode(ctx, buf, &value.repo)?;
        StringCodec.encode(ctx, buf, &value.package)?;
        StringCodec.encode(ctx, buf, &value.name)
    }

    fn decode(&self, ctx: &CodecContext, buf: &mut CodecBuffer) -> CodecResult<Label> {
        Ok(Label {
            repo: StringCodec.decode(ctx, buf)?,
            package: StringCodec.decode(ctx, buf)?,
            name: StringCodec.decode(ctx, buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convenient_storage::codec::{decode_from_slice, encode_to_bytes};

    #[test]
    fn test_parse_forms() {
        let label: Label = "//a/b:lib".parse().unwrap();
        assert_eq!((label.repo(), label.package(), label.name()), ("", "a/b", "lib"));
        assert!(label.is_main_repo());

        let label: Label = "@rules_cc//cc:toolchain".parse().unwrap();
        assert_eq!(label.repo(), "rules_cc");
        assert_eq!(label.to_string(), "@rules_cc//cc:toolchain");

        let label: Label = "@@canonical~1//pkg:t".parse().unwrap();
        assert_eq!(label.repo(), "canonical~1");

        let label: Label = "//a/b".parse().unwrap();
        assert_eq!(label.to_string(), "//a/b:b");

        let label: Label = "//:root".parse().unwrap();
        assert_eq!(label.package(), "");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "a:b", "//a:", "@repo", "//a:b:c", "///a:b", "//"] {
            assert!(bad.parse::<Label>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_display_roundtrip() {
        for text in ["//a:lib", "@r//x/y:z", "//:all_files"] {
            assert_eq!(text.parse::<Label>().unwrap().to_string(), text);
        }
    }

    #[test]
    fn test_codec_roundtrip() {
        let ctx = CodecContext::default();
        let label: Label = "@r//p/q:name".parse().unwrap();
        let bytes = encode_to_bytes(&LabelCodec, &ctx, &label).unwrap();
        assert_eq!(decode_from_slice(&LabelCodec, &ctx, &bytes).unwrap(), label);
    }

    #[test]
    fn test_serde_as_string() {
        let label: Label = "//a:lib".parse().unwrap();
        let json = serde_json::to_string(&label).unwrap();
        assert_eq!(json, "\"//a:lib\"");
        assert_eq!(serde_json::from_str::<Label>(&json).unwrap(), label);
        assert!(serde_json::from_str::<Label>("\"nope\"").is_err());
    }
}
