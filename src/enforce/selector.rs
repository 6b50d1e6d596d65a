//! `match[]` selector rewriting for metadata endpoints.
//!
//! Series, label names, label values and rules endpoints are scoped through
//! repeatable selector parameters instead of a query expression. Every
//! selector gets the tenant matcher appended; an absent parameter becomes a
//! single selector holding only the tenant matcher.

use promql_parser::label::{MatchOp, Matcher};
use promql_parser::parser::{self, Expr, VectorSelector};

use super::{describe_matcher, EnforceError, QueryValues, TenantMatcher};

/// Scope the selectors stored under `param` to the tenant.
///
/// The number of selectors is preserved and each keeps its matcher order
/// with the tenant matcher last.
pub fn inject_matcher(
    values: &mut QueryValues,
    matcher: &TenantMatcher,
    param: &str,
) -> Result<(), EnforceError> {
    let existing = values.get_all(param);
    if existing.is_empty() {
        let only_tenant = format!("{{{}}}", describe_matcher(&matcher.matcher()));
        values.set(param, only_tenant);
        return Ok(());
    }

    let rewritten = existing
        .into_iter()
        .map(|raw| inject_selector(raw, matcher))
        .collect::<Result<Vec<_>, _>>()?;
    values.set_all(param, rewritten);
    Ok(())
}

/// Parse one metric selector, append the tenant matcher and serialize it.
pub fn inject_selector(raw: &str, matcher: &TenantMatcher) -> Result<String, EnforceError> {
    let mut selector = parse_metric_selector(raw)?;
    matcher.enforce_matchers(&mut selector.matchers)?;
    Ok(format_selector(&selector))
}

fn parse_metric_selector(raw: &str) -> Result<VectorSelector, EnforceError> {
    match parser::parse(raw).map_err(EnforceError::QueryParse)? {
        Expr::VectorSelector(vs) if vs.offset.is_none() && vs.at.is_none() => Ok(vs),
        _ => Err(EnforceError::QueryParse(format!(
            "{raw:?} is not a metric selector"
        ))),
    }
}

/// Serialize a selector keeping matcher order as stored.
fn format_selector(selector: &VectorSelector) -> String {
    let name = selector.name.as_deref();
    let render = |group: &[Matcher]| {
        group
            .iter()
            .filter(|m| !is_name_matcher(m, name))
            .map(describe_matcher)
            .collect::<Vec<_>>()
            .join(",")
    };

    let mut groups = Vec::new();
    if !selector.matchers.matchers.is_empty() || selector.matchers.or_matchers.is_empty() {
        groups.push(render(selector.matchers.matchers.as_slice()));
    }
    groups.extend(selector.matchers.or_matchers.iter().map(|g| render(g.as_slice())));

    format!("{}{{{}}}", name.unwrap_or_default(), groups.join(" or "))
}

fn is_name_matcher(matcher: &Matcher, name: Option<&str>) -> bool {
    matcher.name == "__name__"
        && matches!(matcher.op, MatchOp::Equal)
        && Some(matcher.value.as_str()) == name
}
