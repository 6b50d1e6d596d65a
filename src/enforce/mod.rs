//! Tenant label enforcement for PromQL.
//!
//! # Data Flow
//! ```text
//! query string (GET params or POST form)
//!     → QueryValues (ordered key/value pairs)
//!     → TenantMatcher::enforce (parse → walk AST → inject → re-serialize)
//!     → rewritten query string / form body
//!
//! match[] selectors (series, labels, label values, rules)
//!     → selector.rs::inject_matcher (one output selector per input)
//! ```
//!
//! # Design Decisions
//! - The parser is `promql-parser`; this module never interprets PromQL text
//! - An existing matcher on the tenant label is legal only when it is
//!   exactly `label="<tenant>"`; anything else is rejected, never replaced
//! - An identical existing matcher is kept and not duplicated, so enforcing
//!   twice yields the same query as enforcing once

pub mod selector;

use promql_parser::label::{MatchOp, Matcher, Matchers};
use promql_parser::parser::{self, Expr};
use thiserror::Error;
use url::form_urlencoded;

pub use selector::inject_matcher;

/// Name of the PromQL expression parameter on query endpoints.
pub const QUERY_PARAM: &str = "query";

/// Name of the repeatable selector parameter on metadata endpoints.
pub const MATCH_PARAM: &str = "match[]";

/// Failure categories produced while enforcing the tenant label.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnforceError {
    #[error("failed to parse query: {0}")]
    QueryParse(String),

    #[error("conflicting tenant label matcher: {0}")]
    IllegalLabelMatcher(String),

    #[error("failed to enforce tenant label: {0}")]
    EnforceLabel(String),
}

/// Equality matcher binding the tenant label to the resolved tenant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantMatcher {
    label: String,
    tenant: String,
}

impl TenantMatcher {
    pub fn new(label: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            tenant: tenant.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// The `label="tenant"` matcher in parser form.
    pub fn matcher(&self) -> Matcher {
        Matcher {
            op: MatchOp::Equal,
            name: self.label.clone(),
            value: self.tenant.clone(),
        }
    }

    /// Parse `raw_query`, scope every selector to the tenant and return the
    /// canonical string form of the rewritten expression.
    pub fn enforce(&self, raw_query: &str) -> Result<String, EnforceError> {
        let mut expr = parser::parse(raw_query).map_err(EnforceError::QueryParse)?;
        self.enforce_node(&mut expr)?;
        Ok(expr.to_string())
    }

    fn enforce_node(&self, expr: &mut Expr) -> Result<(), EnforceError> {
        match expr {
            Expr::VectorSelector(vs) => self.enforce_matchers(&mut vs.matchers),
            Expr::MatrixSelector(ms) => self.enforce_matchers(&mut ms.vs.matchers),
            Expr::Aggregate(agg) => {
                self.enforce_node(&mut agg.expr)?;
                if let Some(param) = agg.param.as_mut() {
                    self.enforce_node(param)?;
                }
                Ok(())
            }
            Expr::Unary(unary) => self.enforce_node(&mut unary.expr),
            Expr::Binary(binary) => {
                self.enforce_node(&mut binary.lhs)?;
                self.enforce_node(&mut binary.rhs)
            }
            Expr::Paren(paren) => self.enforce_node(&mut paren.expr),
            Expr::Subquery(subquery) => self.enforce_node(&mut subquery.expr),
            Expr::Call(call) => {
                for arg in call.args.args.iter_mut() {
                    self.enforce_node(arg)?;
                }
                Ok(())
            }
            Expr::NumberLiteral(_) | Expr::StringLiteral(_) => Ok(()),
            _ => Err(EnforceError::EnforceLabel(
                "unsupported expression node".to_string(),
            )),
        }
    }

    /// AND the tenant matcher into every matcher group of a selector.
    pub(crate) fn enforce_matchers(&self, matchers: &mut Matchers) -> Result<(), EnforceError> {
        if matchers.or_matchers.is_empty() {
            return self.enforce_group(&mut matchers.matchers);
        }

        // `a{x="1" or y="2"}`: each alternative must carry the tenant.
        if !matchers.matchers.is_empty() {
            self.enforce_group(&mut matchers.matchers)?;
        }
        for group in matchers.or_matchers.iter_mut() {
            self.enforce_group(group)?;
        }
        Ok(())
    }

    fn enforce_group(&self, group: &mut Vec<Matcher>) -> Result<(), EnforceError> {
        let mut pinned = false;
        for existing in group.iter().filter(|m| m.name == self.label) {
            if matches!(existing.op, MatchOp::Equal) && existing.value == self.tenant {
                pinned = true;
                continue;
            }
            return Err(EnforceError::IllegalLabelMatcher(describe_matcher(existing)));
        }

        if !pinned {
            group.push(self.matcher());
        }
        Ok(())
    }
}

/// Render a matcher as PromQL text, e.g. `tenant_id!="b"`.
pub(crate) fn describe_matcher(matcher: &Matcher) -> String {
    let op = match matcher.op {
        MatchOp::Equal => "=",
        MatchOp::NotEqual => "!=",
        MatchOp::Re(_) => "=~",
        MatchOp::NotRe(_) => "!~",
    };
    format!("{}{}{:?}", matcher.name, op, matcher.value)
}

/// Ordered `application/x-www-form-urlencoded` pairs.
///
/// Keeps parameter order and repeated keys intact so a rewritten query
/// string differs from the original only in the enforced values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryValues {
    pairs: Vec<(String, String)>,
}

impl QueryValues {
    pub fn parse(input: &[u8]) -> Self {
        Self {
            pairs: form_urlencoded::parse(input).into_owned().collect(),
        }
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in order.
    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Replace every value of `key` with `value`, keeping the position of
    /// the first occurrence. Appends when `key` is absent.
    pub fn set(&mut self, key: &str, value: String) {
        self.set_all(key, vec![value]);
    }

    /// Replace every value of `key` with `values`.
    pub fn set_all(&mut self, key: &str, values: Vec<String>) {
        let position = self.pairs.iter().position(|(k, _)| k == key);
        self.pairs.retain(|(k, _)| k != key);

        let at = position.unwrap_or(self.pairs.len());
        for (offset, value) in values.into_iter().enumerate() {
            self.pairs.insert(at + offset, (key.to_string(), value));
        }
    }

    pub fn encode(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.pairs.iter())
            .finish()
    }
}

/// Enforce the tenant on the `query` parameter of `values`.
///
/// Returns `Ok(false)` without touching `values` when no query is present:
/// some endpoints are driven purely by selector parameters.
pub fn enforce_query_values(
    values: &mut QueryValues,
    matcher: &TenantMatcher,
) -> Result<bool, EnforceError> {
    let raw = match values.get(QUERY_PARAM) {
        Some(q) if !q.is_empty() => q.to_string(),
        _ => return Ok(false),
    };

    let rewritten = matcher.enforce(&raw)?;
    values.set(QUERY_PARAM, rewritten);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use promql_parser::parser::VectorSelector;

    fn matcher() -> TenantMatcher {
        TenantMatcher::new("tenant_id", "tenant1")
    }

    fn selectors(expr: &Expr) -> Vec<VectorSelector> {
        let mut out = Vec::new();
        collect(expr, &mut out);
        out
    }

    fn collect(expr: &Expr, out: &mut Vec<VectorSelector>) {
        match expr {
            Expr::VectorSelector(vs) => out.push(vs.clone()),
            Expr::MatrixSelector(ms) => out.push(ms.vs.clone()),
            Expr::Aggregate(a) => {
                collect(&a.expr, out);
                if let Some(p) = &a.param {
                    collect(p, out);
                }
            }
            Expr::Unary(u) => collect(&u.expr, out),
            Expr::Binary(b) => {
                collect(&b.lhs, out);
                collect(&b.rhs, out);
            }
            Expr::Paren(p) => collect(&p.expr, out),
            Expr::Subquery(s) => collect(&s.expr, out),
            Expr::Call(c) => c.args.args.iter().for_each(|a| collect(a, out)),
            _ => {}
        }
    }

    fn has_tenant(vs: &VectorSelector, tenant: &str) -> bool {
        vs.matchers
            .matchers
            .iter()
            .any(|m| m.name == "tenant_id" && m.value == tenant && matches!(m.op, MatchOp::Equal))
    }

    #[test]
    fn injects_into_bare_selector() {
        let out = matcher().enforce("up").unwrap();
        let expr = parser::parse(&out).unwrap();
        let sels = selectors(&expr);
        assert_eq!(sels.len(), 1);
        assert_eq!(sels[0].name.as_deref(), Some("up"));
        assert!(has_tenant(&sels[0], "tenant1"));
    }

    #[test]
    fn injects_into_every_selector_of_nested_expression() {
        let query = r#"sum by (job) (rate(http_requests_total{code="500"}[5m])) / ignoring(code) sum(rate(http_requests_total[5m])) > 0.1"#;
        let out = matcher().enforce(query).unwrap();
        let expr = parser::parse(&out).unwrap();
        let sels = selectors(&expr);
        assert_eq!(sels.len(), 2);
        assert!(sels.iter().all(|vs| has_tenant(vs, "tenant1")));
    }

    #[test]
    fn keeps_existing_matchers() {
        let out = matcher().enforce(r#"up{job="node",instance=~"10\\..*"}"#).unwrap();
        let expr = parser::parse(&out).unwrap();
        let sels = selectors(&expr);
        let names: Vec<&str> = sels[0].matchers.matchers.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"job"));
        assert!(names.contains(&"instance"));
        assert!(names.contains(&"tenant_id"));
    }

    #[test]
    fn subquery_and_function_arguments_are_scoped() {
        let out = matcher()
            .enforce("max_over_time(deriv(rate(node_cpu_seconds_total[1m])[5m:1m])[10m:])")
            .unwrap();
        let expr = parser::parse(&out).unwrap();
        let sels = selectors(&expr);
        assert_eq!(sels.len(), 1);
        assert!(has_tenant(&sels[0], "tenant1"));
    }

    #[test]
    fn literals_pass_through() {
        let out = matcher().enforce("1 + 2").unwrap();
        assert!(!out.contains("tenant_id"));
    }

    #[test]
    fn same_tenant_matcher_is_not_duplicated() {
        let once = matcher().enforce("up").unwrap();
        let twice = matcher().enforce(&once).unwrap();
        assert_eq!(once, twice);

        let expr = parser::parse(&twice).unwrap();
        let sels = selectors(&expr);
        let count = sels[0]
            .matchers
            .matchers
            .iter()
            .filter(|m| m.name == "tenant_id")
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn conflicting_tenant_matcher_is_illegal() {
        for query in [
            r#"up{tenant_id="tenant2"}"#,
            r#"up{tenant_id!="tenant1"}"#,
            r#"up{tenant_id=~"tenant.*"}"#,
            r#"up{tenant_id!~"x"}"#,
        ] {
            let err = matcher().enforce(query).unwrap_err();
            assert!(
                matches!(err, EnforceError::IllegalLabelMatcher(_)),
                "{query} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn parse_failure_is_distinguishable() {
        let err = matcher().enforce("sum(up").unwrap_err();
        assert!(matches!(err, EnforceError::QueryParse(_)));
    }

    #[test]
    fn query_values_without_query_are_unchanged() {
        let mut values = QueryValues::parse(b"start=1&end=2");
        let changed = enforce_query_values(&mut values, &matcher()).unwrap();
        assert!(!changed);
        assert_eq!(values.encode(), "start=1&end=2");

        let mut values = QueryValues::parse(b"query=&time=1");
        assert!(!enforce_query_values(&mut values, &matcher()).unwrap());
    }

    #[test]
    fn query_values_keep_parameter_order() {
        let mut values = QueryValues::parse(b"time=10&query=up&step=15");
        assert!(enforce_query_values(&mut values, &matcher()).unwrap());

        let keys: Vec<&str> = values.pairs.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["time", "query", "step"]);
        assert!(values.get(QUERY_PARAM).unwrap().contains("tenant1"));
    }

    #[test]
    fn set_all_replaces_repeated_keys_in_place() {
        let mut values = QueryValues::parse(b"a=1&match%5B%5D=x&b=2&match%5B%5D=y");
        values.set_all(MATCH_PARAM, vec!["p".into(), "q".into()]);
        assert_eq!(values.get_all(MATCH_PARAM), vec!["p", "q"]);
        assert_eq!(values.encode(), "a=1&match%5B%5D=p&match%5B%5D=q&b=2");
    }
}
