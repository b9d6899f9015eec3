//! Label selector compiled into a predicate over a label map.
//!
//! A `LabelSelector` from the resource spec is validated once and turned into a flat
//! list of requirements; every requirement must hold for a label set to match.
//! Evaluation is pure. The same selector renders to Kubernetes query syntax so list
//! calls can filter server-side.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Equals(String),
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub op: Op,
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match &self.op {
            Op::Equals(v) => value == Some(v),
            Op::In(set) => value.map_or(false, |v| set.contains(v)),
            // absent keys satisfy NotIn, as in Kubernetes
            Op::NotIn(set) => value.map_or(true, |v| !set.contains(v)),
            Op::Exists => value.is_some(),
            Op::DoesNotExist => value.is_none(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("unknown operator {op:?} for key {key:?}")]
    UnknownOperator { key: String, op: String },
    #[error("operator {op} for key {key:?} requires at least one value")]
    MissingValues { key: String, op: &'static str },
    #[error("operator {op} for key {key:?} takes no values")]
    UnexpectedValues { key: String, op: &'static str },
    #[error("invalid label key {0:?}")]
    InvalidKey(String),
    #[error("invalid label value {value:?} for key {key:?}")]
    InvalidValue { key: String, value: String },
}

/// Conjunction of requirements. An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    /// Exact-match selector, e.g. for the ownership marker.
    pub fn from_labels<I, K, V>(labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut requirements: Vec<Requirement> = labels
            .into_iter()
            .map(|(k, v)| Requirement { key: k.into(), op: Op::Equals(v.into()) })
            .collect();
        requirements.sort_by(|a, b| a.key.cmp(&b.key));
        Self { requirements }
    }

    pub fn compile(ls: &LabelSelector) -> Result<Self, SelectorError> {
        let mut requirements = Vec::new();
        for (key, value) in ls.match_labels.iter().flatten() {
            check_key(key)?;
            check_value(key, value)?;
            requirements.push(Requirement { key: key.clone(), op: Op::Equals(value.clone()) });
        }
        for expr in ls.match_expressions.iter().flatten() {
            let key = &expr.key;
            check_key(key)?;
            let values: BTreeSet<String> = expr.values.iter().flatten().cloned().collect();
            let op = match expr.operator.as_str() {
                "In" => Op::In(with_values(key, "In", values)?),
                "NotIn" => Op::NotIn(with_values(key, "NotIn", values)?),
                "Exists" => without_values(key, "Exists", &values).map(|_| Op::Exists)?,
                "DoesNotExist" => without_values(key, "DoesNotExist", &values).map(|_| Op::DoesNotExist)?,
                other => {
                    return Err(SelectorError::UnknownOperator { key: key.clone(), op: other.to_string() })
                }
            };
            requirements.push(Requirement { key: key.clone(), op });
        }
        requirements.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(Self { requirements })
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_everything(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    /// Convenience for `metadata.labels`, which is optional on objects.
    pub fn matches_opt(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        match labels {
            Some(l) => self.matches(l),
            None => self.matches(&BTreeMap::new()),
        }
    }

    /// Render as a Kubernetes label selector query (`a=b,c in (d,e),!f`).
    pub fn to_query(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.requirements.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match &r.op {
                Op::Equals(v) => write!(f, "{}={}", r.key, v)?,
                Op::In(set) => write!(f, "{} in ({})", r.key, join(set))?,
                Op::NotIn(set) => write!(f, "{} notin ({})", r.key, join(set))?,
                Op::Exists => write!(f, "{}", r.key)?,
                Op::DoesNotExist => write!(f, "!{}", r.key)?,
            }
        }
        Ok(())
    }
}

fn join(set: &BTreeSet<String>) -> String {
    set.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}

// Qualified name segment: <=63 chars, alphanumeric at both ends, [-_.] inside.
fn is_name_segment(s: &str) -> bool {
    let b = s.as_bytes();
    if b.is_empty() || b.len() > 63 {
        return false;
    }
    let edge = |c: u8| c.is_ascii_alphanumeric();
    edge(b[0])
        && edge(b[b.len() - 1])
        && b.iter().all(|&c| c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b'.')
}

fn is_dns_subdomain(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 253
        && s.split('.').all(|part| {
            let b = part.as_bytes();
            !b.is_empty()
                && b[0].is_ascii_alphanumeric()
                && b[b.len() - 1].is_ascii_alphanumeric()
                && b.iter().all(|&c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'-')
        })
}

fn with_values(key: &str, op: &'static str, values: BTreeSet<String>) -> Result<BTreeSet<String>, SelectorError> {
    if values.is_empty() {
        return Err(SelectorError::MissingValues { key: key.to_string(), op });
    }
    for v in &values {
        check_value(key, v)?;
    }
    Ok(values)
}

fn without_values(key: &str, op: &'static str, values: &BTreeSet<String>) -> Result<(), SelectorError> {
    if values.is_empty() {
        Ok(())
    } else {
        Err(SelectorError::UnexpectedValues { key: key.to_string(), op })
    }
}

fn check_key(key: &str) -> Result<(), SelectorError> {
    let ok = match key.split_once('/') {
        Some((prefix, name)) => is_dns_subdomain(prefix) && is_name_segment(name),
        None => is_name_segment(key),
    };
    if ok { Ok(()) } else { Err(SelectorError::InvalidKey(key.to_string())) }
}

fn check_value(key: &str, value: &str) -> Result<(), SelectorError> {
    if value.is_empty() || is_name_segment(value) {
        Ok(())
    } else {
        Err(SelectorError::InvalidValue { key: key.to_string(), value: value.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn expr(key: &str, op: &str, values: Option<&[&str]>) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: op.to_string(),
            values: values.map(|vs| vs.iter().map(|v| v.to_string()).collect()),
        }
    }

    #[test]
    fn match_labels_and_expressions_are_conjunctive() {
        let ls = LabelSelector {
            match_labels: Some(labels(&[("app", "myapp")])),
            match_expressions: Some(vec![
                expr("tier", "In", Some(&["web", "api"])),
                expr("legacy", "DoesNotExist", None),
            ]),
        };
        let sel = Selector::compile(&ls).unwrap();
        assert!(sel.matches(&labels(&[("app", "myapp"), ("tier", "web")])));
        assert!(!sel.matches(&labels(&[("app", "myapp"), ("tier", "db")])));
        assert!(!sel.matches(&labels(&[("app", "myapp"), ("tier", "web"), ("legacy", "1")])));
        assert!(!sel.matches(&labels(&[("tier", "web")])));
    }

    #[test]
    fn not_in_matches_absent_key() {
        let ls = LabelSelector { match_expressions: Some(vec![expr("env", "NotIn", Some(&["prod"]))]), ..Default::default() };
        let sel = Selector::compile(&ls).unwrap();
        assert!(sel.matches(&BTreeMap::new()));
        assert!(sel.matches(&labels(&[("env", "dev")])));
        assert!(!sel.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn empty_selector_matches_everything() {
        let sel = Selector::compile(&LabelSelector::default()).unwrap();
        assert!(sel.is_everything());
        assert!(sel.matches_opt(None));
        assert_eq!(sel.to_query(), "");
    }

    #[test]
    fn malformed_selectors_are_errors() {
        let bad_op = LabelSelector { match_expressions: Some(vec![expr("a", "Near", Some(&["x"]))]), ..Default::default() };
        assert!(matches!(Selector::compile(&bad_op), Err(SelectorError::UnknownOperator { .. })));

        let no_values = LabelSelector { match_expressions: Some(vec![expr("a", "In", Some(&[]))]), ..Default::default() };
        assert!(matches!(Selector::compile(&no_values), Err(SelectorError::MissingValues { .. })));

        let extra_values = LabelSelector { match_expressions: Some(vec![expr("a", "Exists", Some(&["x"]))]), ..Default::default() };
        assert!(matches!(Selector::compile(&extra_values), Err(SelectorError::UnexpectedValues { .. })));

        let bad_key = LabelSelector { match_labels: Some(labels(&[("-bad", "x")])), ..Default::default() };
        assert!(matches!(Selector::compile(&bad_key), Err(SelectorError::InvalidKey(_))));

        let bad_value = LabelSelector { match_labels: Some(labels(&[("a", "has space")])), ..Default::default() };
        assert!(matches!(Selector::compile(&bad_value), Err(SelectorError::InvalidValue { .. })));
    }

    #[test]
    fn query_rendering_is_sorted_and_kube_compatible() {
        let ls = LabelSelector {
            match_labels: Some(labels(&[("replicate", "true"), ("app", "myapp")])),
            match_expressions: Some(vec![
                expr("zone", "NotIn", Some(&["b", "a"])),
                expr("mirror.skelops.io/skip", "DoesNotExist", None),
                expr("tier", "Exists", None),
            ]),
        };
        let sel = Selector::compile(&ls).unwrap();
        assert_eq!(sel.to_query(), "app=myapp,!mirror.skelops.io/skip,replicate=true,tier,zone notin (a,b)");
    }

    #[test]
    fn from_labels_builds_exact_match() {
        let sel = Selector::from_labels([("mirror.skelops.io/owner", "ns.m")]);
        assert_eq!(sel.to_query(), "mirror.skelops.io/owner=ns.m");
        assert!(sel.matches(&labels(&[("mirror.skelops.io/owner", "ns.m"), ("x", "y")])));
        assert!(!sel.matches(&labels(&[("mirror.skelops.io/owner", "ns.other")])));
    }
}
