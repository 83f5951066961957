//! Local rule-sets
//!
//! A rule-set is a named list of headless rules loaded from a file and
//! referenced by `rule_set` items. It matches when any of its rules matches.
//! Only the JSON source format is supported; binary `.srs` files are
//! rejected at load time.

use crate::error::RuleError;
use crate::router::rule::{build_headless_rule, Partition, Rule, RuleContext, RuleItem};
use parking_lot::RwLock;
use sb_config::{PlainRuleSet, RuleSetOptions};
use sb_types::InboundContext;
use std::path::{Path, PathBuf};

/// Rule-set file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleSetFormat {
    /// JSON `{"version": 1, "rules": [...]}`
    Source,
    /// Binary `.srs`
    Binary,
}

impl RuleSetFormat {
    /// Explicit format first, then the file extension; JSON otherwise.
    pub fn resolve(format: &str, path: &str) -> Result<Self, RuleError> {
        match format {
            "source" | "json" => Ok(Self::Source),
            "binary" => Ok(Self::Binary),
            "" if path.ends_with(".srs") => Ok(Self::Binary),
            "" => Ok(Self::Source),
            other => Err(RuleError::RuleSetFormat(other.to_string())),
        }
    }
}

/// What kinds of items the set contains; consulted by rule construction and
/// by the router to decide which metadata to collect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleSetMetadata {
    pub contains_process_rule: bool,
    pub contains_wifi_rule: bool,
    pub contains_ip_cidr_rule: bool,
}

impl RuleSetMetadata {
    fn from_rules(rules: &[Rule]) -> Self {
        let any = |pred: &dyn Fn(&RuleItem) -> bool| rules.iter().any(|r| r.any_item(pred));
        Self {
            contains_process_rule: any(&RuleItem::is_process),
            contains_wifi_rule: any(&RuleItem::is_wifi),
            contains_ip_cidr_rule: any(&|item: &RuleItem| {
                item.partition() == Partition::DestinationIpCidr
            }),
        }
    }
}

#[derive(Debug)]
pub struct RuleSet {
    tag: String,
    path: PathBuf,
    format: RuleSetFormat,
    state: RwLock<(Vec<Rule>, RuleSetMetadata)>,
}

impl RuleSet {
    pub fn load(options: &RuleSetOptions, ctx: &RuleContext) -> Result<Self, RuleError> {
        if !options.kind.is_empty() && options.kind != "local" {
            return Err(RuleError::RuleSetFormat(options.kind.clone()));
        }
        let format = RuleSetFormat::resolve(&options.format, &options.path)?;
        let path = PathBuf::from(&options.path);
        let rules = read_rules(&path, format, ctx)?;
        let metadata = RuleSetMetadata::from_rules(&rules);
        tracing::debug!(
            target: "sb_core::router::rule_set",
            tag = %options.tag,
            rules = rules.len(),
            "rule-set loaded"
        );
        Ok(Self {
            tag: options.tag.clone(),
            path,
            format,
            state: RwLock::new((rules, metadata)),
        })
    }

    /// Build a set from already constructed rules, without a backing file.
    pub fn from_rules(tag: impl Into<String>, rules: Vec<Rule>) -> Self {
        let metadata = RuleSetMetadata::from_rules(&rules);
        Self {
            tag: tag.into(),
            path: PathBuf::new(),
            format: RuleSetFormat::Source,
            state: RwLock::new((rules, metadata)),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn metadata(&self) -> RuleSetMetadata {
        self.state.read().1
    }

    pub fn len(&self) -> usize {
        self.state.read().0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-read the backing file. On failure the previous rules stay active.
    pub fn reload(&self, ctx: &RuleContext) -> Result<(), RuleError> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let rules = read_rules(&self.path, self.format, ctx)?;
        let metadata = RuleSetMetadata::from_rules(&rules);
        tracing::info!(
            target: "sb_core::router::rule_set",
            tag = %self.tag,
            rules = rules.len(),
            "rule-set reloaded"
        );
        *self.state.write() = (rules, metadata);
        Ok(())
    }

    /// Any rule matches. Each rule starts from a clean match cache.
    pub fn matches(&self, m: &mut InboundContext) -> bool {
        let state = self.state.read();
        state.0.iter().any(|rule| {
            m.reset_rule_match_cache();
            rule.matches(m)
        })
    }

    pub fn update_geosite(&self) -> Result<(), RuleError> {
        self.state.read().0.iter().try_for_each(Rule::update_geosite)
    }
}

fn read_rules(path: &Path, format: RuleSetFormat, ctx: &RuleContext) -> Result<Vec<Rule>, RuleError> {
    if format == RuleSetFormat::Binary {
        return Err(RuleError::RuleSetFormat("binary".to_string()));
    }
    let load_err = |source: anyhow::Error| RuleError::Load {
        path: path.display().to_string(),
        source,
    };
    let data = std::fs::read(path).map_err(|e| load_err(e.into()))?;
    let plain: PlainRuleSet = serde_json::from_slice(&data).map_err(|e| load_err(e.into()))?;
    plain
        .rules
        .iter()
        .map(|r| build_headless_rule(r, ctx))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sb_types::{Destination, Network};
    use std::io::Write;

    fn set_file(json: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        f.write_all(json.as_bytes()).unwrap();
        f
    }

    fn options(tag: &str, path: &Path) -> RuleSetOptions {
        RuleSetOptions {
            tag: tag.into(),
            kind: "local".into(),
            format: String::new(),
            path: path.display().to_string(),
        }
    }

    fn to(host: &str) -> InboundContext {
        let mut m = InboundContext::new("in", Network::Tcp);
        m.destination = Some(Destination::from((host, 443)));
        m
    }

    #[test]
    fn load_match_and_reload() {
        let f = set_file(r#"{"version":1,"rules":[{"domain_suffix":"ads.example"},{"ip_cidr":"203.0.113.0/24"}]}"#);
        let ctx = RuleContext::default();
        let set = RuleSet::load(&options("ads", f.path()), &ctx).unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.metadata().contains_ip_cidr_rule);
        assert!(!set.metadata().contains_process_rule);
        assert!(set.matches(&mut to("x.ads.example")));
        assert!(set.matches(&mut to("203.0.113.7")));
        assert!(!set.matches(&mut to("example.org")));

        std::fs::write(f.path(), r#"{"version":1,"rules":[{"process_name":"curl"}]}"#).unwrap();
        set.reload(&ctx).unwrap();
        assert!(set.metadata().contains_process_rule);
        assert!(!set.matches(&mut to("x.ads.example")));

        std::fs::write(f.path(), "not json").unwrap();
        assert!(set.reload(&ctx).is_err());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn binary_format_rejected() {
        let f = set_file("{}");
        let mut o = options("bin", f.path());
        o.format = "binary".into();
        assert!(matches!(RuleSet::load(&o, &RuleContext::default()), Err(RuleError::RuleSetFormat(_))));
        assert_eq!(RuleSetFormat::resolve("", "geo.srs").unwrap(), RuleSetFormat::Binary);
    }

    #[test]
    fn remote_sets_are_not_loaded_here() {
        let mut o = options("r", Path::new("x.json"));
        o.kind = "remote".into();
        assert!(RuleSet::load(&o, &RuleContext::default()).is_err());
    }
}
