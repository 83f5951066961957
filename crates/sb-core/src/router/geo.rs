//! GeoIP / GeoSite text databases for routing rules
//!
//! - GeoIP: one `CIDR,COUNTRY` entry per line.
//! - GeoSite: one `CATEGORY:TYPE:PATTERN` entry per line, where TYPE is
//!   `exact` (alias `full`), `suffix` (alias `domain`), `keyword` or `regex`.
//!
//! Blank lines and `#` comments are skipped. Both databases can be reloaded
//! in place; rule items that cached a category pick up the new data on
//! `update_geosite`.

use crate::error::RuleError;
use ipnet::IpNet;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Exact and suffix domain matching.
///
/// A suffix `example.com` matches the domain itself and every subdomain; a
/// suffix written with a leading dot (`.example.com`) matches subdomains only.
#[derive(Debug, Clone, Default)]
pub struct DomainMatcher {
    exact: HashSet<String>,
    suffixes: Vec<String>,
}

impl DomainMatcher {
    pub fn new<'a>(
        exact: impl IntoIterator<Item = &'a String>,
        suffixes: impl IntoIterator<Item = &'a String>,
    ) -> Self {
        Self {
            exact: exact.into_iter().map(|d| d.to_ascii_lowercase()).collect(),
            suffixes: suffixes
                .into_iter()
                .map(|s| s.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.suffixes.is_empty()
    }

    pub fn matches(&self, domain: &str) -> bool {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        if self.exact.contains(&domain) {
            return true;
        }
        self.suffixes.iter().any(|suffix| {
            if let Some(bare) = suffix.strip_prefix('.') {
                domain.len() > bare.len() && domain.ends_with(suffix.as_str())
            } else {
                domain == *suffix
                    || (domain.ends_with(suffix.as_str())
                        && domain.as_bytes()[domain.len() - suffix.len() - 1] == b'.')
            }
        })
    }
}

/// All domain rules of one GeoSite category.
#[derive(Debug, Default)]
pub struct DomainSet {
    domains: DomainMatcher,
    keywords: Vec<String>,
    regexes: Vec<Regex>,
}

impl DomainSet {
    pub fn matches(&self, domain: &str) -> bool {
        if self.domains.matches(domain) {
            return true;
        }
        let lower = domain.to_ascii_lowercase();
        self.keywords.iter().any(|k| lower.contains(k.as_str()))
            || self.regexes.iter().any(|r| r.is_match(domain))
    }

    pub fn len(&self) -> usize {
        self.domains.exact.len()
            + self.domains.suffixes.len()
            + self.keywords.len()
            + self.regexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// GeoSite categories, reloadable from the backing file.
#[derive(Debug)]
pub struct GeoSite {
    path: PathBuf,
    categories: RwLock<HashMap<String, Arc<DomainSet>>>,
}

impl GeoSite {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref().to_path_buf();
        let categories = parse_geosite(&path)?;
        Ok(Self {
            path,
            categories: RwLock::new(categories),
        })
    }

    /// Re-read the file; the old data stays in place when parsing fails.
    pub fn reload(&self) -> Result<(), RuleError> {
        let categories = parse_geosite(&self.path)?;
        tracing::info!(
            target: "sb_core::router::geo",
            path = %self.path.display(),
            categories = categories.len(),
            "geosite reloaded"
        );
        *self.categories.write() = categories;
        Ok(())
    }

    pub fn category(&self, code: &str) -> Option<Arc<DomainSet>> {
        self.categories.read().get(&code.to_ascii_lowercase()).cloned()
    }

    pub fn categories(&self) -> Vec<String> {
        let mut out: Vec<String> = self.categories.read().keys().cloned().collect();
        out.sort();
        out
    }
}

fn read_db(path: &Path) -> Result<String, RuleError> {
    std::fs::read_to_string(path).map_err(|e| RuleError::Load {
        path: path.display().to_string(),
        source: e.into(),
    })
}

fn parse_geosite(path: &Path) -> Result<HashMap<String, Arc<DomainSet>>, RuleError> {
    let data = read_db(path)?;
    let mut raw: HashMap<String, (Vec<String>, Vec<String>, Vec<String>, Vec<Regex>)> =
        HashMap::new();
    for (line_no, line) in data.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(3, ':');
        let (Some(category), Some(kind), Some(pattern)) = (parts.next(), parts.next(), parts.next())
        else {
            tracing::warn!(
                target: "sb_core::router::geo",
                line_no = line_no + 1,
                line,
                "malformed geosite line"
            );
            continue;
        };
        let category = category.trim().to_ascii_lowercase();
        let pattern = pattern.trim();
        if category.is_empty() || pattern.is_empty() {
            continue;
        }
        let entry = raw.entry(category).or_default();
        match kind.trim().to_ascii_lowercase().as_str() {
            "exact" | "full" => entry.0.push(pattern.to_string()),
            "suffix" | "domain" => entry.1.push(pattern.to_string()),
            "keyword" => entry.2.push(pattern.to_ascii_lowercase()),
            "regex" => {
                let re = Regex::new(pattern).map_err(|source| RuleError::Regex {
                    pattern: pattern.to_string(),
                    source,
                })?;
                entry.3.push(re);
            }
            other => {
                tracing::warn!(
                    target: "sb_core::router::geo",
                    line_no = line_no + 1,
                    kind = other,
                    "unknown geosite rule type"
                );
            }
        }
    }
    Ok(raw
        .into_iter()
        .map(|(category, (exact, suffix, keywords, regexes))| {
            let set = DomainSet {
                domains: DomainMatcher::new(&exact, &suffix),
                keywords,
                regexes,
            };
            (category, Arc::new(set))
        })
        .collect())
}

/// GeoIP CIDR table, reloadable from the backing file.
#[derive(Debug)]
pub struct GeoIp {
    path: PathBuf,
    entries: RwLock<Vec<(IpNet, String)>>,
}

impl GeoIp {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RuleError> {
        let path = path.as_ref().to_path_buf();
        let entries = parse_geoip(&path)?;
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn reload(&self) -> Result<(), RuleError> {
        let entries = parse_geoip(&self.path)?;
        *self.entries.write() = entries;
        Ok(())
    }

    /// Country code (lowercase) of the most specific network containing `ip`.
    pub fn lookup(&self, ip: IpAddr) -> Option<String> {
        self.entries
            .read()
            .iter()
            .filter(|(net, _)| net.contains(&ip))
            .max_by_key(|(net, _)| net.prefix_len())
            .map(|(_, code)| code.clone())
    }
}

fn parse_geoip(path: &Path) -> Result<Vec<(IpNet, String)>, RuleError> {
    let data = read_db(path)?;
    let mut entries = Vec::new();
    for line in data.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((cidr, code)) = line.split_once(',') else {
            continue;
        };
        let net: IpNet = cidr
            .trim()
            .parse()
            .map_err(|_| RuleError::Cidr(cidr.trim().to_string()))?;
        entries.push((net, code.trim().to_ascii_lowercase()));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn file(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn suffix_semantics() {
        let m = DomainMatcher::new(
            &["exact.org".to_string()],
            &["example.com".to_string(), ".only-sub.net".to_string()],
        );
        assert!(m.matches("example.com"));
        assert!(m.matches("www.EXAMPLE.com"));
        assert!(!m.matches("badexample.com"));
        assert!(m.matches("a.only-sub.net"));
        assert!(!m.matches("only-sub.net"));
        assert!(m.matches("exact.org."));
        assert!(!m.matches("www.exact.org"));
    }

    #[test]
    fn geosite_load_and_reload() {
        let f = file("# comment\ngoogle:suffix:google.com\ngoogle:keyword:gstatic\nads:regex:^ad[0-9]+\\.\n");
        let db = GeoSite::load(f.path()).unwrap();
        let google = db.category("GOOGLE").unwrap();
        assert!(google.matches("mail.google.com"));
        assert!(google.matches("fonts.gstatic.com"));
        assert!(db.category("ads").unwrap().matches("ad12.example"));
        assert_eq!(db.categories(), vec!["ads", "google"]);

        std::fs::write(f.path(), "cn:suffix:cn\n").unwrap();
        db.reload().unwrap();
        assert!(db.category("google").is_none());
        assert!(db.category("cn").unwrap().matches("gov.cn"));
    }

    #[test]
    fn geoip_most_specific_wins() {
        let f = file("10.0.0.0/8,US\n10.1.0.0/16,CN\n2001:db8::/32,JP\n");
        let db = GeoIp::load(f.path()).unwrap();
        assert_eq!(db.lookup("10.2.0.1".parse().unwrap()).as_deref(), Some("us"));
        assert_eq!(db.lookup("10.1.0.1".parse().unwrap()).as_deref(), Some("cn"));
        assert_eq!(db.lookup("2001:db8::1".parse().unwrap()).as_deref(), Some("jp"));
        assert_eq!(db.lookup("8.8.8.8".parse().unwrap()), None);
    }

    #[test]
    fn geoip_bad_cidr_fails() {
        let f = file("not-a-cidr,US\n");
        assert!(matches!(GeoIp::load(f.path()), Err(RuleError::Cidr(_))));
    }
}
