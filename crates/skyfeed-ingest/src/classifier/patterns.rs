//! Compiled pattern groups and the match string they run against.

use regex::{RegexSet, RegexSetBuilder};
use skyfeed_core::ContentItem;

use super::{GroupKind, PatternGroup};

/// Outcome of evaluating the pattern groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// An exclude group matched (index into the configured groups).
    Excluded(usize),
    /// An include group matched (index into the configured groups).
    Included(usize),
    NoMatch,
}

impl Verdict {
    pub fn is_accept(self) -> bool {
        matches!(self, Self::Included(_))
    }
}

struct CompiledGroup {
    index: usize,
    set: RegexSet,
}

/// Pattern groups split by kind, each compiled into one `RegexSet`.
pub struct CompiledPatterns {
    exclude: Vec<CompiledGroup>,
    include: Vec<CompiledGroup>,
}

impl CompiledPatterns {
    pub fn compile(groups: &[PatternGroup]) -> std::result::Result<Self, regex::Error> {
        let mut exclude = Vec::new();
        let mut include = Vec::new();

        for (index, group) in groups.iter().enumerate() {
            let set = RegexSetBuilder::new(&group.patterns)
                .case_insensitive(group.case_insensitive)
                .build()?;
            let compiled = CompiledGroup { index, set };

            match group.kind {
                GroupKind::Exclude => exclude.push(compiled),
                GroupKind::Include => include.push(compiled),
            }
        }

        Ok(Self { exclude, include })
    }

    /// Whether any include group exists; without one nothing can match.
    pub fn can_accept(&self) -> bool {
        self.include.iter().any(|g| !g.set.is_empty())
    }

    pub fn evaluate(&self, text: &str) -> Verdict {
        for group in &self.exclude {
            if group.set.is_match(text) {
                return Verdict::Excluded(group.index);
            }
        }

        for group in &self.include {
            if group.set.is_match(text) {
                return Verdict::Included(group.index);
            }
        }

        Verdict::NoMatch
    }
}

/// Build the string pattern groups are matched against.
///
/// Text, `#`-prefixed hashtags, embed alt texts and external link title and
/// description, joined with single spaces. Case is left alone; folding is a
/// per-group setting.
pub fn build_match_string(item: &ContentItem) -> String {
    let mut parts: Vec<String> = vec![item.text.clone()];
    parts.extend(item.tags.iter().map(|t| format!("#{t}")));

    if let Some(embed) = &item.embed {
        parts.extend(embed.alt_texts.iter().cloned());
        parts.extend(embed.external_title.iter().cloned());
        parts.extend(embed.external_description.iter().cloned());
    }

    parts
        .iter()
        .flat_map(|p| p.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}
