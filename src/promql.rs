// Copyright 2023 Greptime Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Small PromQL helpers shared by codecs, splitting and merging.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use promql_parser::label::{MatchOp, Matcher, METRIC_NAME};
use promql_parser::parser::token;
use promql_parser::parser::{self, AtModifier, Expr};

use crate::error::{Error, Result};
use crate::request::MatcherSet;

fn parse_query(query: &str) -> Result<Expr> {
    parser::parse(query).map_err(|reason| Error::ParseQuery {
        query: query.to_string(),
        reason,
    })
}

/// Replaces `@ start()` and `@ end()` with constants equal to the given
/// window. The query comes back in canonical formatting.
pub fn rewrite_at_modifiers(query: &str, start_ms: i64, end_ms: i64) -> Result<String> {
    let mut expr = parse_query(query)?;
    rewrite_expr(&mut expr, millis_to_system_time(start_ms), millis_to_system_time(end_ms));
    Ok(expr.to_string())
}

fn millis_to_system_time(ms: i64) -> SystemTime {
    if ms >= 0 {
        UNIX_EPOCH + Duration::from_millis(ms as u64)
    } else {
        UNIX_EPOCH - Duration::from_millis(ms.unsigned_abs())
    }
}

fn rewrite_at(at: &mut Option<AtModifier>, start: SystemTime, end: SystemTime) {
    match at {
        Some(AtModifier::Start) => *at = Some(AtModifier::At(start)),
        Some(AtModifier::End) => *at = Some(AtModifier::At(end)),
        _ => {}
    }
}

fn rewrite_expr(expr: &mut Expr, start: SystemTime, end: SystemTime) {
    match expr {
        Expr::Aggregate(aggr) => {
            rewrite_expr(&mut aggr.expr, start, end);
            if let Some(param) = aggr.param.as_mut() {
                rewrite_expr(param, start, end);
            }
        }
        Expr::Unary(unary) => rewrite_expr(&mut unary.expr, start, end),
        Expr::Binary(binary) => {
            rewrite_expr(&mut binary.lhs, start, end);
            rewrite_expr(&mut binary.rhs, start, end);
        }
        Expr::Paren(paren) => rewrite_expr(&mut paren.expr, start, end),
        Expr::Subquery(subquery) => {
            rewrite_at(&mut subquery.at, start, end);
            rewrite_expr(&mut subquery.expr, start, end);
        }
        Expr::VectorSelector(vs) => rewrite_at(&mut vs.at, start, end),
        Expr::MatrixSelector(ms) => rewrite_at(&mut ms.vs.at, start, end),
        Expr::Call(call) => {
            for arg in call.args.args.iter_mut() {
                rewrite_expr(arg, start, end);
            }
        }
        Expr::NumberLiteral(_) | Expr::StringLiteral(_) | Expr::Extension(_) => {}
    }
}

/// Parses one `match[]`-style series selector, e.g. `up{job="api"}`, into its
/// matchers. The metric name becomes a `__name__` matcher.
pub fn parse_metric_selector(selector: &str) -> Result<MatcherSet> {
    let expr = parse_query(selector)?;
    let Expr::VectorSelector(vs) = expr else {
        return Err(Error::ParseQuery {
            query: selector.to_string(),
            reason: "expected a series selector".to_string(),
        });
    };

    let mut matchers = Vec::new();
    if let Some(name) = vs.name {
        matchers.push(Matcher {
            op: MatchOp::Equal,
            name: METRIC_NAME.to_string(),
            value: name,
        });
    }
    matchers.extend(vs.matchers.matchers.clone());
    Ok(matchers)
}

/// Formats matcher sets back into selector strings for the wire.
pub fn format_matcher_sets(sets: &[MatcherSet]) -> Vec<String> {
    sets.iter().map(|set| format_matcher_set(set)).collect()
}

fn format_matcher_set(set: &[Matcher]) -> String {
    let inner = set
        .iter()
        .map(format_matcher)
        .collect::<Vec<_>>()
        .join(", ");
    format!("{{{inner}}}")
}

fn format_matcher(matcher: &Matcher) -> String {
    let op = match matcher.op {
        MatchOp::Equal => "=",
        MatchOp::NotEqual => "!=",
        MatchOp::Re(_) => "=~",
        MatchOp::NotRe(_) => "!~",
    };
    format!("{}{}\"{}\"", matcher.name, op, escape_value(&matcher.value))
}

fn escape_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// How a merged vector should be ordered, derived from the query root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortPlan {
    /// Keep the order samples were discovered in (topk / bottomk).
    MergeOnly,
    SortByValuesAsc,
    SortByValuesDesc,
    SortByLabels,
}

/// Decides the merged-vector ordering for a query: `topk`/`bottomk` keep the
/// merge order, a root `sort`/`sort_desc` orders by value, everything else by
/// label key.
pub fn sort_plan_for_query(query: &str) -> Result<SortPlan> {
    let expr = parse_query(query)?;

    if let Expr::Aggregate(aggr) = &expr {
        if aggr.op.id() == token::T_TOPK || aggr.op.id() == token::T_BOTTOMK {
            return Ok(SortPlan::MergeOnly);
        }
    }

    if let Some(plan) = sort_call(&expr) {
        return Ok(plan);
    }
    if let Expr::Binary(binary) = &expr {
        if let Some(plan) = sort_call(&binary.lhs).or_else(|| sort_call(&binary.rhs)) {
            return Ok(plan);
        }
    }
    Ok(SortPlan::SortByLabels)
}

fn sort_call(expr: &Expr) -> Option<SortPlan> {
    if let Expr::Call(call) = expr {
        if call.func.name == "sort" {
            return Some(SortPlan::SortByValuesAsc);
        }
        if call.func.name == "sort_desc" {
            return Some(SortPlan::SortByValuesDesc);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrite_at_modifiers() {
        let rewritten =
            rewrite_at_modifiers("http_requests_total @ start()", 1_000, 61_000).unwrap();
        assert!(rewritten.contains("@ 1"), "got: {rewritten}");
        assert!(!rewritten.contains("start()"), "got: {rewritten}");

        let rewritten = rewrite_at_modifiers(
            "sum(rate(http_requests_total[5m] @ end())) + avg(up @ start())",
            0,
            3_600_000,
        )
        .unwrap();
        assert!(!rewritten.contains("end()"), "got: {rewritten}");
        assert!(!rewritten.contains("start()"), "got: {rewritten}");
        assert!(rewritten.contains("@ 3600"), "got: {rewritten}");
    }

    #[test]
    fn test_rewrite_leaves_plain_queries_valid() {
        let rewritten = rewrite_at_modifiers("sum by (job) (rate(up[1m]))", 0, 1_000).unwrap();
        // still parseable after canonical re-formatting
        parser::parse(&rewritten).unwrap();
    }

    #[test]
    fn test_rewrite_rejects_garbage() {
        assert!(rewrite_at_modifiers("up{", 0, 1).is_err());
    }

    #[test]
    fn test_parse_metric_selector() {
        let matchers = parse_metric_selector(r#"up{job="api", env!="dev"}"#).unwrap();
        let names: Vec<_> = matchers.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&METRIC_NAME));
        assert!(names.contains(&"job"));
        assert!(names.contains(&"env"));
    }

    #[test]
    fn test_parse_metric_selector_rejects_non_selector() {
        assert!(parse_metric_selector("sum(up)").is_err());
    }

    #[test]
    fn test_format_matcher_sets_roundtrip() {
        let set = parse_metric_selector(r#"up{job="a\"b"}"#).unwrap();
        let formatted = format_matcher_sets(&[set.clone()]);
        let reparsed = parse_metric_selector(&formatted[0]).unwrap();
        assert_eq!(set, reparsed);
    }

    #[test]
    fn test_sort_plan() {
        assert_eq!(
            sort_plan_for_query("topk(5, up)").unwrap(),
            SortPlan::MergeOnly
        );
        assert_eq!(
            sort_plan_for_query("bottomk(5, up)").unwrap(),
            SortPlan::MergeOnly
        );
        assert_eq!(
            sort_plan_for_query("sort(up)").unwrap(),
            SortPlan::SortByValuesAsc
        );
        assert_eq!(
            sort_plan_for_query("sort_desc(up) + 1").unwrap(),
            SortPlan::SortByValuesDesc
        );
        assert_eq!(
            sort_plan_for_query("sum(rate(up[1m]))").unwrap(),
            SortPlan::SortByLabels
        );
    }
}
