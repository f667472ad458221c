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

//! Deciding whether a PromQL expression can be evaluated in vertical shards.
//!
//! An expression is shardable when every series group it aggregates over can
//! be pinned to one shard by hashing a fixed label set. Aggregations with a
//! grouping clause provide that label set; functions that rewrite labels at
//! evaluation time break the property.

use std::collections::BTreeSet;

use promql_parser::parser::{self, Expr, LabelModifier};

use crate::error::{Error, Result};

/// Functions whose output labels cannot be predicted from the input series,
/// making the surrounding query non-shardable.
const DYNAMIC_LABEL_FUNCS: &[&str] = &[
    "label_replace",
    "label_join",
    "absent",
    "absent_over_time",
    "scalar",
    "vector",
];

/// The outcome of analyzing one query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryAnalysis {
    shardable: bool,
    /// True to hash the listed labels, false to hash everything but them.
    shard_by: bool,
    labels: Vec<String>,
}

impl QueryAnalysis {
    pub fn is_shardable(&self) -> bool {
        self.shardable
    }

    pub fn shard_by(&self) -> bool {
        self.shard_by
    }

    pub fn sharding_labels(&self) -> &[String] {
        &self.labels
    }
}

/// Analyzes PromQL expressions for vertical shardability.
#[derive(Debug, Default, Clone, Copy)]
pub struct QueryAnalyzer;

impl QueryAnalyzer {
    pub fn new() -> Self {
        Self
    }

    pub fn analyze(&self, query: &str) -> Result<QueryAnalysis> {
        let expr = parser::parse(query).map_err(|reason| Error::ParseQuery {
            query: query.to_string(),
            reason,
        })?;

        let mut walker = Walker::default();
        walker.visit(&expr);

        match (&walker.grouping, walker.disqualified) {
            (Some(grouping), false) if !grouping.labels.is_empty() => Ok(QueryAnalysis {
                shardable: true,
                shard_by: grouping.by,
                labels: grouping.labels.iter().cloned().collect(),
            }),
            _ => Ok(QueryAnalysis::default()),
        }
    }
}

#[derive(Debug, Clone)]
struct Grouping {
    by: bool,
    labels: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Walker {
    grouping: Option<Grouping>,
    disqualified: bool,
}

impl Walker {
    fn visit(&mut self, expr: &Expr) {
        match expr {
            Expr::Aggregate(aggr) => {
                match &aggr.modifier {
                    Some(LabelModifier::Include(labels)) => {
                        self.scope_to_labels(true, &labels.labels);
                    }
                    Some(LabelModifier::Exclude(labels)) => {
                        self.scope_to_labels(false, &labels.labels);
                    }
                    // aggregating everything into one series cannot be split
                    None => self.disqualified = true,
                }
                self.visit(&aggr.expr);
                if let Some(param) = &aggr.param {
                    self.visit(param);
                }
            }
            Expr::Binary(binary) => {
                let lhs_vector = is_vector_like(&binary.lhs);
                let rhs_vector = is_vector_like(&binary.rhs);
                if lhs_vector && rhs_vector {
                    match binary.modifier.as_ref().and_then(|m| m.matching.as_ref()) {
                        Some(LabelModifier::Include(labels)) => {
                            self.scope_to_labels(true, &labels.labels);
                        }
                        Some(LabelModifier::Exclude(labels)) => {
                            self.scope_to_labels(false, &labels.labels);
                        }
                        // default matching pairs identical label sets, which
                        // hash to the same shard regardless of the label set
                        None => {}
                    }
                }
                self.visit(&binary.lhs);
                self.visit(&binary.rhs);
            }
            Expr::Call(call) => {
                if DYNAMIC_LABEL_FUNCS.contains(&call.func.name) {
                    self.disqualified = true;
                }
                for arg in &call.args.args {
                    self.visit(arg);
                }
            }
            Expr::Unary(unary) => self.visit(&unary.expr),
            Expr::Paren(paren) => self.visit(&paren.expr),
            Expr::Subquery(subquery) => self.visit(&subquery.expr),
            Expr::VectorSelector(_)
            | Expr::MatrixSelector(_)
            | Expr::NumberLiteral(_)
            | Expr::StringLiteral(_)
            | Expr::Extension(_) => {}
        }
    }

    /// Narrows the sharding label set with another grouping clause. `by`
    /// clauses intersect, `without` clauses union; mixing the two defeats
    /// sharding.
    fn scope_to_labels(&mut self, by: bool, labels: &[String]) {
        let labels: BTreeSet<String> = labels.iter().cloned().collect();
        match &mut self.grouping {
            None => {
                self.grouping = Some(Grouping { by, labels });
            }
            Some(current) if current.by == by => {
                if by {
                    current.labels = current.labels.intersection(&labels).cloned().collect();
                    if current.labels.is_empty() {
                        self.disqualified = true;
                    }
                } else {
                    current.labels.extend(labels);
                }
            }
            Some(_) => self.disqualified = true,
        }
    }
}

fn is_vector_like(expr: &Expr) -> bool {
    !matches!(expr, Expr::NumberLiteral(_) | Expr::StringLiteral(_))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(query: &str) -> QueryAnalysis {
        QueryAnalyzer::new().analyze(query).unwrap()
    }

    #[test]
    fn test_grouped_aggregations_are_shardable() {
        let analysis = analyze("sum by (pod) (rate(http_requests_total[5m]))");
        assert!(analysis.is_shardable());
        assert!(analysis.shard_by());
        assert_eq!(analysis.sharding_labels(), ["pod"]);

        let analysis = analyze("max without (instance) (up)");
        assert!(analysis.is_shardable());
        assert!(!analysis.shard_by());
        assert_eq!(analysis.sharding_labels(), ["instance"]);
    }

    #[test]
    fn test_ungrouped_aggregation_is_not_shardable() {
        assert!(!analyze("sum(rate(http_requests_total[5m]))").is_shardable());
    }

    #[test]
    fn test_plain_selector_is_not_shardable() {
        assert!(!analyze("up").is_shardable());
        assert!(!analyze("rate(up[5m])").is_shardable());
    }

    #[test]
    fn test_nested_by_groupings_intersect() {
        let analysis =
            analyze("sum by (pod) (sum by (pod, container) (rate(http_requests_total[1m])))");
        assert!(analysis.is_shardable());
        assert_eq!(analysis.sharding_labels(), ["pod"]);

        // disjoint groupings leave nothing to hash
        assert!(!analyze("sum by (pod) (sum by (node) (up))").is_shardable());
    }

    #[test]
    fn test_without_groupings_union() {
        let analysis =
            analyze("sum without (instance) (sum without (replica) (up))");
        assert!(analysis.is_shardable());
        assert_eq!(analysis.sharding_labels(), ["instance", "replica"]);
    }

    #[test]
    fn test_mixed_by_and_without_disqualifies() {
        assert!(!analyze("sum by (pod) (sum without (pod) (up))").is_shardable());
    }

    #[test]
    fn test_dynamic_label_functions_disqualify() {
        assert!(!analyze(
            r#"sum by (dst) (label_replace(up, "dst", "$1", "src", "(.*)"))"#
        )
        .is_shardable());
        assert!(!analyze("sum by (job) (absent(up))").is_shardable());
    }

    #[test]
    fn test_binary_with_on_matching() {
        let analysis = analyze(
            "sum by (pod) (rate(a[1m])) / on (pod) sum by (pod) (rate(b[1m]))",
        );
        assert!(analysis.is_shardable());
        assert_eq!(analysis.sharding_labels(), ["pod"]);
    }

    #[test]
    fn test_scalar_operand_keeps_shardability() {
        let analysis = analyze("sum by (pod) (rate(a[1m])) > 0.5");
        assert!(analysis.is_shardable());
    }

    #[test]
    fn test_parse_error_propagates() {
        assert!(QueryAnalyzer::new().analyze("sum by (").is_err());
    }
}
