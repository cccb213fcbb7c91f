//! Control-flow evaluator for `condition`, `loop`, `group` and `random` steps
//!
//! The evaluator only makes decisions (which branch, whether to iterate
//! again). Child steps are always run by the execution controller so that
//! failures and cancellation propagate the same way at every depth.

use crate::config::EngineConfig;
use crate::error::StepError;
use crate::expression::Expr;
use crate::model::{Branch, Step};
use crate::variables::{as_number, VariableStore};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::{Map, Value};

/// Variable that receives the zero-based iteration index by default
pub const DEFAULT_INDEX_VARIABLE: &str = "loop_index";

/// How many times a loop body runs
#[derive(Debug, Clone, PartialEq)]
pub enum LoopBound {
    /// Exactly this many iterations
    Count(u32),
    /// While the expression holds, checked before each iteration
    While(Expr),
}

/// A parsed control-flow step borrowing its child lists
#[derive(Debug)]
pub enum ControlFlow<'a> {
    Condition {
        expr: Expr,
        then_steps: &'a [Step],
        else_steps: &'a [Step],
    },
    Loop {
        bound: LoopBound,
        /// Per-step ceiling, already clamped to the engine ceiling
        limit: u32,
        index_variable: String,
        body: &'a [Step],
    },
    Group {
        steps: &'a [Step],
    },
    Random {
        branches: &'a [Branch],
    },
}

impl<'a> ControlFlow<'a> {
    /// Whether a step type is handled here instead of the registry
    #[must_use]
    pub fn handles(step_type: &str) -> bool {
        matches!(step_type, "condition" | "loop" | "group" | "random")
    }

    /// Parse a control-flow step, returning `None` for leaf steps
    ///
    /// Numeric loop settings may be `{{name}}` references; expressions keep
    /// their references and are evaluated later.
    pub fn parse(
        step: &'a Step,
        vars: &VariableStore,
        engine: &EngineConfig,
    ) -> Result<Option<Self>, StepError> {
        const EMPTY: &[Step] = &[];
        let children = step.children.as_ref();
        let config = &step.config;

        let flow = match step.step_type.as_str() {
            "condition" => {
                let source = expression_source(config, &["expression", "if"])?;
                Self::Condition {
                    expr: Expr::parse(source)?,
                    then_steps: children.map_or(EMPTY, |c| c.then_steps.as_slice()),
                    else_steps: children.map_or(EMPTY, |c| c.else_steps.as_slice()),
                }
            }
            "loop" => {
                let bound = match (config.get("count"), config.get("while")) {
                    (Some(_), Some(_)) => {
                        return Err(StepError::Validation(
                            "loop takes either `count` or `while`, not both".into(),
                        ))
                    }
                    (Some(count), None) => LoopBound::Count(whole_number(count, "count", vars)?),
                    (None, Some(_)) => {
                        LoopBound::While(Expr::parse(expression_source(config, &["while"])?)?)
                    }
                    (None, None) => {
                        return Err(StepError::Validation("loop needs `count` or `while`".into()))
                    }
                };
                let limit = match config.get("max_iterations") {
                    Some(max) => whole_number(max, "max_iterations", vars)?
                        .min(engine.max_loop_iterations),
                    None => engine.max_loop_iterations,
                };
                let index_variable = config
                    .get("index_variable")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_INDEX_VARIABLE)
                    .to_string();
                Self::Loop {
                    bound,
                    limit,
                    index_variable,
                    body: children.map_or(EMPTY, |c| c.body.as_slice()),
                }
            }
            "group" => Self::Group {
                steps: children.map_or(EMPTY, |c| c.steps.as_slice()),
            },
            "random" => {
                let branches = children.map_or(&[] as &[Branch], |c| c.branches.as_slice());
                if branches.is_empty() {
                    return Err(StepError::Validation("random step has no branches".into()));
                }
                Self::Random { branches }
            }
            _ => return Ok(None),
        };
        Ok(Some(flow))
    }
}

fn expression_source<'c>(config: &'c Map<String, Value>, keys: &[&str]) -> Result<&'c str, StepError> {
    keys.iter()
        .find_map(|key| config.get(*key))
        .and_then(Value::as_str)
        .ok_or_else(|| StepError::Validation(format!("missing `{}` expression", keys[0])))
}

fn whole_number(value: &Value, key: &str, vars: &VariableStore) -> Result<u32, StepError> {
    let n = as_number(&vars.resolve_value(value)?)?;
    if n < 0.0 || n.fract() != 0.0 || n > f64::from(u32::MAX) {
        return Err(StepError::Validation(format!(
            "`{key}` must be a non-negative whole number, got {n}"
        )));
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Ok(n as u32)
}

/// Per-run decision maker for control-flow steps
pub struct ControlFlowEvaluator {
    rng: StdRng,
}

impl ControlFlowEvaluator {
    /// Create an evaluator, seeding branch selection from the config if set
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        let rng = match config.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng }
    }

    /// Evaluate a `condition` expression
    pub fn evaluate_condition(&self, expr: &Expr, vars: &VariableStore) -> Result<bool, StepError> {
        expr.evaluate(vars)
    }

    /// Reject fixed counts above the ceiling before any iteration runs
    pub fn check_bound(&self, bound: &LoopBound, limit: u32) -> Result<(), StepError> {
        match bound {
            LoopBound::Count(count) if *count > limit => {
                Err(StepError::LoopBoundExceeded { limit })
            }
            _ => Ok(()),
        }
    }

    /// Decide whether iteration number `iteration` (zero-based) should run
    ///
    /// A while-loop still wanting to run once `limit` iterations are done
    /// fails with [`StepError::LoopBoundExceeded`].
    pub fn next_iteration(
        &self,
        bound: &LoopBound,
        iteration: u32,
        limit: u32,
        vars: &VariableStore,
    ) -> Result<bool, StepError> {
        match bound {
            LoopBound::Count(count) => Ok(iteration < *count),
            LoopBound::While(expr) => {
                let go = expr.evaluate(vars)?;
                if go && iteration >= limit {
                    return Err(StepError::LoopBoundExceeded { limit });
                }
                Ok(go)
            }
        }
    }

    /// Pick one branch by weight; missing weights count as 1
    pub fn select_branch(&mut self, branches: &[Branch]) -> Result<usize, StepError> {
        let weights: Vec<f64> = branches.iter().map(|b| b.weight.unwrap_or(1.0)).collect();
        if weights.iter().any(|w| !w.is_finite()) {
            return Err(StepError::Validation("branch weights must be finite".into()));
        }
        let dist = WeightedIndex::new(&weights)
            .map_err(|e| StepError::Validation(format!("invalid branch weights: {e}")))?;
        Ok(dist.sample(&mut self.rng))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepChildren;
    use serde_json::json;

    fn branch(weight: Option<f64>) -> Branch {
        Branch {
            weight,
            steps: vec![],
        }
    }

    #[test]
    fn test_parse_leaf_is_none() {
        let step = Step::new("s", "notify", json!({"message": "x"}));
        let parsed = ControlFlow::parse(&step, &VariableStore::new(), &EngineConfig::default());
        assert!(parsed.unwrap().is_none());
    }

    #[test]
    fn test_parse_loop_count_from_variable() {
        let mut vars = VariableStore::new();
        vars.set("times", "4");
        let step = Step::new("l", "loop", json!({"count": "{{times}}", "max_iterations": 5000}));
        let parsed = ControlFlow::parse(&step, &vars, &EngineConfig::default()).unwrap();
        match parsed {
            Some(ControlFlow::Loop { bound, limit, index_variable, body }) => {
                assert_eq!(bound, LoopBound::Count(4));
                assert_eq!(limit, 1000);
                assert_eq!(index_variable, "loop_index");
                assert!(body.is_empty());
            }
            other => panic!("expected loop, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_bad_configs() {
        let vars = VariableStore::new();
        let config = EngineConfig::default();
        for step in [
            Step::new("l", "loop", json!({})),
            Step::new("l", "loop", json!({"count": 2, "while": "true"})),
            Step::new("l", "loop", json!({"count": 2.5})),
            Step::new("c", "condition", json!({})),
            Step::new("c", "condition", json!({"expression": "x >"})),
            Step::new("r", "random", json!({})),
        ] {
            assert!(
                matches!(ControlFlow::parse(&step, &vars, &config), Err(StepError::Validation(_))),
                "{} should be invalid",
                step.step_type
            );
        }
    }

    #[test]
    fn test_condition_without_else_has_empty_branch() {
        let step = Step::new("c", "condition", json!({"if": "true"})).with_children(StepChildren {
            then_steps: vec![Step::new("t", "log", json!({"message": "x"}))],
            ..Default::default()
        });
        let vars = VariableStore::new();
        match ControlFlow::parse(&step, &vars, &EngineConfig::default()).unwrap() {
            Some(ControlFlow::Condition { then_steps, else_steps, .. }) => {
                assert_eq!(then_steps.len(), 1);
                assert!(else_steps.is_empty());
            }
            other => panic!("expected condition, got {other:?}"),
        }
    }

    #[test]
    fn test_fixed_count_over_ceiling() {
        let evaluator = ControlFlowEvaluator::new(&EngineConfig::default());
        assert_eq!(
            evaluator.check_bound(&LoopBound::Count(1001), 1000),
            Err(StepError::LoopBoundExceeded { limit: 1000 })
        );
        assert!(evaluator.check_bound(&LoopBound::Count(1000), 1000).is_ok());
    }

    #[test]
    fn test_while_loop_hits_ceiling() {
        let evaluator = ControlFlowEvaluator::new(&EngineConfig::default());
        let bound = LoopBound::While(Expr::parse("true").unwrap());
        let vars = VariableStore::new();
        assert_eq!(evaluator.next_iteration(&bound, 9, 10, &vars), Ok(true));
        assert_eq!(
            evaluator.next_iteration(&bound, 10, 10, &vars),
            Err(StepError::LoopBoundExceeded { limit: 10 })
        );
    }

    #[test]
    fn test_seeded_selection_is_reproducible() {
        let config = EngineConfig {
            random_seed: Some(42),
            ..Default::default()
        };
        let branches = vec![branch(None), branch(Some(2.0)), branch(Some(1.0))];
        let picks = |mut e: ControlFlowEvaluator| -> Vec<usize> {
            (0..20).map(|_| e.select_branch(&branches).unwrap()).collect()
        };
        assert_eq!(
            picks(ControlFlowEvaluator::new(&config)),
            picks(ControlFlowEvaluator::new(&config))
        );
    }

    #[test]
    fn test_zero_weight_branch_never_selected() {
        let mut evaluator = ControlFlowEvaluator::new(&EngineConfig::default());
        let branches = vec![branch(Some(0.0)), branch(Some(3.0))];
        for _ in 0..50 {
            assert_eq!(evaluator.select_branch(&branches).unwrap(), 1);
        }
        let all_zero = vec![branch(Some(0.0)), branch(Some(0.0))];
        assert!(matches!(
            evaluator.select_branch(&all_zero),
            Err(StepError::Validation(_))
        ));
    }
}
