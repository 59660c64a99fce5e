//! Per-target level directives, e.g. `info,btcnode_chainstate::chain=debug`.

use crate::Level;

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Filter {
    default: Option<Level>,
    directives: Vec<(String, Level)>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FilterError {
    Empty,
    InvalidLevel(String),
    InvalidDirective(String),
}

impl std::fmt::Display for FilterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterError::Empty => write!(f, "empty log filter"),
            FilterError::InvalidLevel(level) => write!(f, "invalid log level '{level}'"),
            FilterError::InvalidDirective(directive) => {
                write!(f, "invalid log directive '{directive}'")
            }
        }
    }
}

impl std::error::Error for FilterError {}

impl Filter {
    pub(crate) const fn empty() -> Self {
        Self {
            default: None,
            directives: Vec::new(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, FilterError> {
        let mut filter = Filter::default();
        let mut seen = false;
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            seen = true;
            match part.split_once('=') {
                None => {
                    let level = Level::parse(part)
                        .ok_or_else(|| FilterError::InvalidLevel(part.to_string()))?;
                    filter.default = Some(level);
                }
                Some((target, level)) => {
                    let target = target.trim();
                    if target.is_empty() {
                        return Err(FilterError::InvalidDirective(part.to_string()));
                    }
                    let level = Level::parse(level)
                        .ok_or_else(|| FilterError::InvalidLevel(level.trim().to_string()))?;
                    filter.directives.push((target.to_string(), level));
                }
            }
        }
        if !seen {
            return Err(FilterError::Empty);
        }
        // Longest prefix first so lookups can stop at the first match.
        filter
            .directives
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Ok(filter)
    }

    pub fn default_level(&self) -> Option<Level> {
        self.default
    }

    pub fn directives(&self) -> &[(String, Level)] {
        &self.directives
    }

    pub fn max_level(&self, fallback: Level) -> Level {
        self.directives
            .iter()
            .map(|(_, level)| *level)
            .chain(std::iter::once(self.default.unwrap_or(fallback)))
            .max()
            .unwrap_or(fallback)
    }

    pub fn level_for(&self, target: &str, fallback: Level) -> Level {
        for (prefix, level) in &self.directives {
            if target_matches(target, prefix) {
                return *level;
            }
        }
        self.default.unwrap_or(fallback)
    }
}

fn target_matches(target: &str, prefix: &str) -> bool {
    match target.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with("::"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_default_and_targets() {
        let filter = Filter::parse("warn, btcnode_chainstate=debug,btcnode_chainstate::chain=trace")
            .expect("filter");
        assert_eq!(filter.default_level(), Some(Level::Warn));
        assert_eq!(
            filter.level_for("btcnode_chainstate::chain", Level::Info),
            Level::Trace
        );
        assert_eq!(
            filter.level_for("btcnode_chainstate::utxoviewpoint", Level::Info),
            Level::Debug
        );
        assert_eq!(filter.level_for("btcnode_storage", Level::Info), Level::Warn);
        assert_eq!(filter.max_level(Level::Info), Level::Trace);
    }

    #[test]
    fn prefix_must_end_on_path_boundary() {
        let filter = Filter::parse("btcnode_script=debug").expect("filter");
        assert_eq!(filter.level_for("btcnode_scripts", Level::Info), Level::Info);
        assert_eq!(filter.level_for("btcnode_script::interpreter", Level::Info), Level::Debug);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(Filter::parse(" , "), Err(FilterError::Empty));
        assert!(matches!(Filter::parse("loud"), Err(FilterError::InvalidLevel(_))));
        assert!(matches!(Filter::parse("=debug"), Err(FilterError::InvalidDirective(_))));
    }
}
