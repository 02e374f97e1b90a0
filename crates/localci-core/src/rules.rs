//! Rule expression grammar and evaluation.
//!
//! `rules:` entries carry an `if:` expression written in GitLab's small
//! comparison language. We tokenize and parse it ourselves rather than
//! rewriting it into a host-language `eval` — a textual rewrite into a
//! generic interpreter would let pipeline authors (or attackers able to
//! influence a pipeline file) smuggle arbitrary expressions into our
//! process. The grammar below is the entire surface we support.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::variables::Scope;

#[derive(Debug, Error)]
pub enum RuleErrorKind {
    #[error("unexpected character {0:?} in rule expression")]
    UnexpectedChar(char),
    #[error("unterminated string literal in rule expression")]
    UnterminatedString,
    #[error("unterminated regex literal in rule expression")]
    UnterminatedRegex,
    #[error("invalid regex /{0}/: {1}")]
    InvalidRegex(String, regex::Error),
    #[error("unexpected end of rule expression")]
    UnexpectedEof,
    #[error("expected operand, found operator `{0}`")]
    ExpectedOperand(String),
}

#[derive(Debug, Error)]
#[error(transparent)]
pub struct RuleError(#[from] pub RuleErrorKind);

/// When a job should run, mirroring GitLab's `when:` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum When {
    #[default]
    OnSuccess,
    Always,
    Manual,
    Never,
}

/// The outcome of evaluating a job's `rules:` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleOutcome {
    pub when: When,
    pub allow_failure: bool,
}

impl Default for RuleOutcome {
    fn default() -> Self {
        Self {
            when: When::OnSuccess,
            allow_failure: false,
        }
    }
}

/// One `if`/`when`/`allow_failure` entry as authored in the pipeline file.
#[derive(Debug, Clone)]
pub struct Rule {
    pub condition: Option<String>,
    pub when: When,
    pub allow_failure: bool,
}

// --- tokenizer -------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Var(String),
    Str(String),
    Regex(String),
    Null,
    Eq,
    NotEq,
    Match,
    NotMatch,
    And,
    Or,
}

fn tokenize(expr: &str) -> Result<Vec<Token>, RuleError> {
    let chars: Vec<char> = expr.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '$' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Var(chars[start..i].iter().collect()));
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(RuleErrorKind::UnterminatedString.into());
                }
                tokens.push(Token::Str(chars[start..i].iter().collect()));
                i += 1;
            }
            '/' => {
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != '/' {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(RuleErrorKind::UnterminatedRegex.into());
                }
                tokens.push(Token::Regex(chars[start..i].iter().collect()));
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::NotEq);
                i += 2;
            }
            '=' if chars.get(i + 1) == Some(&'~') => {
                tokens.push(Token::Match);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'~') => {
                tokens.push(Token::NotMatch);
                i += 2;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            'n' if chars[i..].starts_with(&['n', 'u', 'l', 'l']) => {
                tokens.push(Token::Null);
                i += 4;
            }
            other => return Err(RuleErrorKind::UnexpectedChar(other).into()),
        }
    }

    Ok(tokens)
}

// --- operand/comparison evaluation ------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Str(String),
    Regex(String),
    Null,
}

fn operand_from_token(token: &Token, scope: &Scope) -> Result<Operand, RuleError> {
    match token {
        Token::Var(name) => Ok(match scope.get(name) {
            Some(value) => Operand::Str(value.to_string()),
            None => Operand::Null,
        }),
        Token::Str(s) => Ok(Operand::Str(s.clone())),
        Token::Regex(r) => Ok(Operand::Regex(r.clone())),
        Token::Null => Ok(Operand::Null),
        other => Err(RuleErrorKind::ExpectedOperand(format!("{other:?}")).into()),
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, RuleError> {
    Regex::new(pattern).map_err(|e| RuleErrorKind::InvalidRegex(pattern.to_string(), e).into())
}

fn eval_comparison(op: &Token, lhs: &Operand, rhs: &Operand) -> Result<bool, RuleError> {
    match op {
        Token::Eq => Ok(lhs == rhs),
        Token::NotEq => Ok(lhs != rhs),
        Token::Match | Token::NotMatch => {
            let pattern = match rhs {
                Operand::Regex(r) => r.as_str(),
                Operand::Str(s) => s.as_str(),
                Operand::Null => return Ok(matches!(op, Token::NotMatch)),
            };
            let text = match lhs {
                Operand::Str(s) => s,
                Operand::Null => return Ok(matches!(op, Token::NotMatch)),
                Operand::Regex(_) => {
                    return Err(RuleErrorKind::ExpectedOperand("regex on left-hand side".into()).into())
                }
            };
            let re = compile_regex(pattern)?;
            let matched = re.is_match(text);
            Ok(if matches!(op, Token::Match) { matched } else { !matched })
        }
        other => Err(RuleErrorKind::ExpectedOperand(format!("{other:?}")).into()),
    }
}

/// Evaluates a single `if:` expression under `scope`.
///
/// Grammar: a sequence of `operand operator operand` comparisons joined by
/// `&&`/`||`, evaluated strictly left to right (no operator precedence —
/// matching GitLab's own documented behavior for chained conditions).
pub fn eval_condition(expr: &str, scope: &Scope) -> Result<bool, RuleError> {
    let tokens = tokenize(expr)?;
    let mut pos = 0;

    let mut result = eval_clause(&tokens, &mut pos, scope)?;
    while pos < tokens.len() {
        let joiner = tokens[pos].clone();
        pos += 1;
        let rhs = eval_clause(&tokens, &mut pos, scope)?;
        result = match joiner {
            Token::And => result && rhs,
            Token::Or => result || rhs,
            other => return Err(RuleErrorKind::ExpectedOperand(format!("{other:?}")).into()),
        };
    }
    Ok(result)
}

fn eval_clause(tokens: &[Token], pos: &mut usize, scope: &Scope) -> Result<bool, RuleError> {
    let lhs_tok = tokens.get(*pos).ok_or(RuleErrorKind::UnexpectedEof)?;
    let lhs = operand_from_token(lhs_tok, scope)?;
    *pos += 1;

    let op = tokens.get(*pos).ok_or(RuleErrorKind::UnexpectedEof)?.clone();
    *pos += 1;

    let rhs_tok = tokens.get(*pos).ok_or(RuleErrorKind::UnexpectedEof)?;
    let rhs = operand_from_token(rhs_tok, scope)?;
    *pos += 1;

    eval_comparison(&op, &lhs, &rhs)
}

/// Evaluates an ordered rule list: the first matching rule wins, falling
/// back to `when: never` if none match (or the list is empty).
pub fn evaluate_rules(rules: &[Rule], scope: &Scope) -> Result<RuleOutcome, RuleError> {
    for rule in rules {
        let matched = match &rule.condition {
            None => true,
            Some(expr) => eval_condition(expr, scope)?,
        };
        if matched {
            return Ok(RuleOutcome {
                when: rule.when,
                allow_failure: rule.allow_failure,
            });
        }
    }
    Ok(RuleOutcome {
        when: When::Never,
        allow_failure: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(pairs: &[(&str, &str)]) -> Scope {
        let mut s = Scope::new();
        for (k, v) in pairs {
            s.insert(*k, *v);
        }
        s
    }

    #[test]
    fn equality_match() {
        let s = scope(&[("CI_COMMIT_BRANCH", "main")]);
        assert!(eval_condition("$CI_COMMIT_BRANCH == 'main'", &s).unwrap());
        assert!(!eval_condition("$CI_COMMIT_BRANCH == 'dev'", &s).unwrap());
    }

    #[test]
    fn null_var_compares_to_null() {
        let s = scope(&[]);
        assert!(eval_condition("$MISSING == null", &s).unwrap());
    }

    #[test]
    fn regex_match() {
        let s = scope(&[("CI_COMMIT_REF_NAME", "release/1.2.3")]);
        assert!(eval_condition(r"$CI_COMMIT_REF_NAME =~ /^release\//", &s).unwrap());
    }

    #[test]
    fn conjunction_left_to_right() {
        let s = scope(&[("A", "1"), ("B", "2")]);
        assert!(eval_condition("$A == '1' && $B == '2'", &s).unwrap());
        assert!(!eval_condition("$A == '1' && $B == '3'", &s).unwrap());
    }

    #[test]
    fn disjunction() {
        let s = scope(&[("A", "1")]);
        assert!(eval_condition("$A == '9' || $A == '1'", &s).unwrap());
    }

    #[test]
    fn no_rule_matches_is_never() {
        let rules = vec![Rule {
            condition: Some("$A == '1'".into()),
            when: When::OnSuccess,
            allow_failure: false,
        }];
        let s = scope(&[("A", "2")]);
        let outcome = evaluate_rules(&rules, &s).unwrap();
        assert_eq!(outcome.when, When::Never);
    }

    #[test]
    fn first_matching_rule_wins() {
        let rules = vec![
            Rule { condition: Some("$A == '2'".into()), when: When::Manual, allow_failure: false },
            Rule { condition: None, when: When::OnSuccess, allow_failure: true },
        ];
        let s = scope(&[("A", "1")]);
        let outcome = evaluate_rules(&rules, &s).unwrap();
        assert_eq!(outcome.when, When::OnSuccess);
        assert!(outcome.allow_failure);
    }

    #[test]
    fn rejects_unknown_syntax() {
        assert!(tokenize("$A @@ '1'").is_err());
    }
}
