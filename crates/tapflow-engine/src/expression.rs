//! Condition expressions evaluated against the variable store
//!
//! The grammar is deliberately small: comparisons joined by boolean
//! connectives over literals and variable references.
//!
//! ```text
//! expr    := or
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | compare
//! compare := operand (("==" | "!=" | ">" | ">=" | "<" | "<=") operand)?
//! operand := number | string | true | false | null
//!          | name | "{{" name "}}" | "(" expr ")"
//! ```

use crate::error::StepError;
use crate::variables::{as_bool, as_number, as_text, VariableStore};
use serde_json::Value;
use std::cmp::Ordering;

/// Deepest `!` / parenthesis nesting accepted by the parser
const MAX_NESTING: usize = 64;

/// Longest token stream accepted, which also bounds `&&` / `||` chains
const MAX_TOKENS: usize = 1024;

/// Comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Parsed condition expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Variable(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl Expr {
    /// Parse an expression string
    pub fn parse(source: &str) -> Result<Self, StepError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(StepError::Validation("empty expression".to_string()));
        }
        if tokens.len() > MAX_TOKENS {
            return Err(StepError::Validation(format!(
                "expression has more than {MAX_TOKENS} tokens"
            )));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            depth: 0,
        };
        let expr = parser.or()?;
        if parser.pos != parser.tokens.len() {
            return Err(StepError::Validation(format!(
                "unexpected token {:?} in expression {source:?}",
                parser.tokens[parser.pos]
            )));
        }
        Ok(expr)
    }

    /// Evaluate to a boolean
    pub fn evaluate(&self, vars: &VariableStore) -> Result<bool, StepError> {
        match self {
            Self::Not(inner) => Ok(!inner.evaluate(vars)?),
            Self::And(lhs, rhs) => Ok(lhs.evaluate(vars)? && rhs.evaluate(vars)?),
            Self::Or(lhs, rhs) => Ok(lhs.evaluate(vars)? || rhs.evaluate(vars)?),
            Self::Compare(lhs, op, rhs) => {
                compare(&lhs.operand(vars)?, *op, &rhs.operand(vars)?)
            }
            Self::Literal(_) | Self::Variable(_) => as_bool(&self.operand(vars)?),
        }
    }

    /// Evaluate as an operand value
    fn operand(&self, vars: &VariableStore) -> Result<Value, StepError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Variable(name) => vars
                .lookup(name)
                .cloned()
                .ok_or_else(|| StepError::UnresolvedVariable(name.clone())),
            other => other.evaluate(vars).map(Value::Bool),
        }
    }
}

/// Parse and evaluate in one go
pub fn evaluate(source: &str, vars: &VariableStore) -> Result<bool, StepError> {
    Expr::parse(source)?.evaluate(vars)
}

fn compare(lhs: &Value, op: CompareOp, rhs: &Value) -> Result<bool, StepError> {
    let ordering = match (op, lhs, rhs) {
        (CompareOp::Eq | CompareOp::Ne, Value::Number(_), _)
        | (CompareOp::Eq | CompareOp::Ne, _, Value::Number(_)) => {
            numeric_ordering(lhs, rhs)?
        }
        (CompareOp::Eq | CompareOp::Ne, Value::Bool(_), _)
        | (CompareOp::Eq | CompareOp::Ne, _, Value::Bool(_)) => {
            as_bool(lhs)?.cmp(&as_bool(rhs)?)
        }
        (CompareOp::Eq | CompareOp::Ne, _, _) => as_text(lhs).cmp(&as_text(rhs)),
        (_, Value::String(a), Value::String(b))
            if as_number(lhs).is_err() && as_number(rhs).is_err() =>
        {
            a.cmp(b)
        }
        _ => numeric_ordering(lhs, rhs)?,
    };
    Ok(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
    })
}

fn numeric_ordering(lhs: &Value, rhs: &Value) -> Result<Ordering, StepError> {
    let a = as_number(lhs)?;
    let b = as_number(rhs)?;
    a.partial_cmp(&b)
        .ok_or_else(|| StepError::Validation("cannot compare NaN".to_string()))
}

fn tokenize(source: &str) -> Result<Vec<Token>, StepError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '{' if next == Some('{') => {
                let start = i + 2;
                let end = (start..chars.len().saturating_sub(1))
                    .find(|&j| chars[j] == '}' && chars[j + 1] == '}')
                    .ok_or_else(|| StepError::Validation("unterminated {{ in expression".into()))?;
                let name: String = chars[start..end].iter().collect();
                tokens.push(Token::Ident(name.trim().to_string()));
                i = end + 2;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Op(CompareOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '>' | '<' => {
                let op = match (c, next == Some('=')) {
                    ('>', true) => CompareOp::Ge,
                    ('>', false) => CompareOp::Gt,
                    ('<', true) => CompareOp::Le,
                    _ => CompareOp::Lt,
                };
                tokens.push(Token::Op(op));
                i += if next == Some('=') { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(StepError::Validation(
                                "unterminated string in expression".into(),
                            ))
                        }
                        Some('\\') if chars.get(i + 1).is_some() => {
                            value.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.is_some_and(|n| n.is_ascii_digit() || n == '.'))
                || (c == '.' && next.is_some_and(|n| n.is_ascii_digit())) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| StepError::Validation(format!("invalid number {text:?}")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(StepError::Validation(format!(
                    "unexpected character {other:?} in expression"
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, StepError>,
    ) -> Result<T, StepError> {
        if self.depth >= MAX_NESTING {
            return Err(StepError::Validation("expression nested too deeply".into()));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr, StepError> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, StepError> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            lhs = Expr::And(Box::new(lhs), Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, StepError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let inner = self.nested(Self::unary)?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, StepError> {
        let lhs = self.operand()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let rhs = self.operand()?;
            return Ok(Expr::Compare(Box::new(lhs), op, Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn operand(&mut self) -> Result<Expr, StepError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(crate::variables::number_value(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" => Expr::Literal(Value::Null),
                _ => Expr::Variable(word),
            }),
            Some(Token::LParen) => {
                let inner = self.nested(Self::or)?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(StepError::Validation("missing closing parenthesis".into())),
                }
            }
            Some(other) => Err(StepError::Validation(format!(
                "expected a value, found {other:?}"
            ))),
            None => Err(StepError::Validation(
                "expression ended unexpectedly".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars() -> VariableStore {
        let mut vars = VariableStore::new();
        vars.set("varX", 3);
        vars.set("count", "7");
        vars.set("mode", "away");
        vars.set("armed", true);
        vars.set("device", json!({"battery": 12}));
        vars
    }

    #[test]
    fn test_numeric_comparisons() {
        let vars = vars();
        assert!(!evaluate("varX > 5", &vars).unwrap());
        assert!(evaluate("varX <= 3", &vars).unwrap());
        assert!(evaluate("count > varX", &vars).unwrap());
        assert!(evaluate("count == 7", &vars).unwrap());
        assert!(evaluate("device.battery < 20", &vars).unwrap());
        assert!(evaluate("-1 < varX", &vars).unwrap());
    }

    #[test]
    fn test_connectives_and_precedence() {
        let vars = vars();
        assert!(evaluate("varX > 5 || mode == 'away' && armed", &vars).unwrap());
        assert!(!evaluate("(varX > 5 || mode == \"away\") && !armed", &vars).unwrap());
        assert!(evaluate("not (varX > 5) and armed", &vars).unwrap());
        assert!(evaluate("{{mode}} != 'home'", &vars).unwrap());
    }

    #[test]
    fn test_string_ordering_falls_back_to_lexicographic() {
        let vars = vars();
        assert!(evaluate("mode < 'home'", &vars).unwrap());
    }

    #[test]
    fn test_non_numeric_in_numeric_context_is_type_mismatch() {
        let vars = vars();
        assert!(matches!(
            evaluate("mode > 5", &vars),
            Err(StepError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_undefined_variable_is_unresolved() {
        let vars = vars();
        assert_eq!(
            evaluate("missing == 1", &vars),
            Err(StepError::UnresolvedVariable("missing".into()))
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Expr::parse(""), Err(StepError::Validation(_))));
        assert!(matches!(Expr::parse("a >"), Err(StepError::Validation(_))));
        assert!(matches!(Expr::parse("(a"), Err(StepError::Validation(_))));
        assert!(matches!(Expr::parse("a b"), Err(StepError::Validation(_))));
        assert!(matches!(Expr::parse("a # b"), Err(StepError::Validation(_))));
    }

    #[test]
    fn test_deep_nesting_is_rejected() {
        let too_deep = StepError::Validation("expression nested too deeply".into());
        let nots = format!("{}true", "!".repeat(100));
        assert_eq!(Expr::parse(&nots).err(), Some(too_deep.clone()));
        let parens = format!("{}true{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(Expr::parse(&parens).err(), Some(too_deep));

        let vars = vars();
        let shallow = format!("{}true{}", "(".repeat(10), ")".repeat(10));
        assert!(evaluate(&shallow, &vars).unwrap());
        assert!(evaluate("!!true", &vars).unwrap());
    }

    #[test]
    fn test_long_chain_is_rejected() {
        let chain = vec!["true"; 5_000].join(" || ");
        assert!(matches!(Expr::parse(&chain), Err(StepError::Validation(_))));
        let vars = vars();
        assert!(evaluate(&vec!["true"; 100].join(" && "), &vars).unwrap());
    }
}
