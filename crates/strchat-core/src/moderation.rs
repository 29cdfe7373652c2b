use regex::Regex;

use crate::config::PatternEntry;

/// A filter or mute pattern. `/body/` is a regex; a body that does not
/// compile degrades to a literal substring match.
#[derive(Clone, Debug)]
pub enum CompiledPattern {
    Regex(Regex),
    Literal(String),
}

impl CompiledPattern {
    pub fn compile(raw: &str) -> Self {
        let p = raw.trim();
        if p.len() > 1 && p.starts_with('/') && p.ends_with('/') {
            let body = &p[1..p.len() - 1];
            return match Regex::new(body) {
                Ok(re) => Self::Regex(re),
                Err(err) => {
                    tracing::debug!(pattern = %p, %err, "pattern is not a valid regex, matching literally");
                    Self::Literal(body.to_string())
                }
            };
        }
        Self::Literal(p.to_string())
    }

    pub fn is_match(&self, content: &str) -> bool {
        match self {
            Self::Regex(re) => re.is_match(content),
            Self::Literal(lit) => !lit.is_empty() && content.contains(lit.as_str()),
        }
    }
}

/// Compile only the enabled entries.
pub fn compile_enabled(entries: &[PatternEntry]) -> Vec<CompiledPattern> {
    entries
        .iter()
        .filter(|e| e.enabled)
        .map(|e| CompiledPattern::compile(&e.pattern))
        .collect()
}

pub fn matches_any(content: &str, patterns: &[CompiledPattern]) -> bool {
    patterns.iter().any(|p| p.is_match(content))
}
