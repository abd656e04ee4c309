//! Evaluates stage `when` expressions.
//!
//! The grammar is small and closed: string literals, parameter identifiers,
//! boolean literals, `==`, `!=`, `!`, `&&`, `||` and parentheses. Before
//! evaluation, `${VAR}` references are expanded through the env resolver.
//! Evaluation is side-effect free; the same input and parameters always
//! produce the same result.

use crate::envvar::EnvvarHelper;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum WhenError {
    #[error("when expression is empty")]
    EmptyExpression,

    #[error("unexpected character {0:?} in when expression")]
    UnexpectedCharacter(char),

    #[error("unterminated string literal in when expression")]
    UnterminatedString,

    #[error("unexpected token {0:?} in when expression")]
    UnexpectedToken(String),

    #[error("when expression ended unexpectedly")]
    UnexpectedEnd,

    #[error("unknown parameter {0:?} in when expression")]
    UnknownParameter(String),

    #[error("cannot compare {left} with {right}")]
    TypeMismatch {
        left: &'static str,
        right: &'static str,
    },

    #[error("operator {operator} requires boolean operands")]
    BooleanOperandRequired { operator: &'static str },

    #[error("result of when expression is not a boolean")]
    NotBoolean,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Bool(bool),
    Eq,
    Ne,
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Str(String),
    Bool(bool),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::Bool(_) => "boolean",
        }
    }
}

fn lex(input: &str) -> Result<Vec<Token>, WhenError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut literal = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some(ch) => literal.push(ch),
                        None => return Err(WhenError::UnterminatedString),
                    }
                }
                tokens.push(Token::Str(literal));
            }
            '=' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Eq);
                } else {
                    return Err(WhenError::UnexpectedCharacter('='));
                }
            }
            '!' => {
                chars.next();
                if chars.next_if_eq(&'=').is_some() {
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '&' => {
                chars.next();
                if chars.next_if_eq(&'&').is_some() {
                    tokens.push(Token::And);
                } else {
                    return Err(WhenError::UnexpectedCharacter('&'));
                }
            }
            '|' => {
                chars.next();
                if chars.next_if_eq(&'|').is_some() {
                    tokens.push(Token::Or);
                } else {
                    return Err(WhenError::UnexpectedCharacter('|'));
                }
            }
            c if c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' => {
                let mut ident = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '-' || ch == '.' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match ident.as_str() {
                    "true" => tokens.push(Token::Bool(true)),
                    "false" => tokens.push(Token::Bool(false)),
                    _ => tokens.push(Token::Ident(ident)),
                }
            }
            other => return Err(WhenError::UnexpectedCharacter(other)),
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    position: usize,
    parameters: &'a HashMap<String, String>,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expression(&mut self) -> Result<Value, WhenError> {
        let mut left = self.conjunction()?;

        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.conjunction()?;
            left = Value::Bool(as_bool(left, "||")? || as_bool(right, "||")?);
        }

        Ok(left)
    }

    fn conjunction(&mut self) -> Result<Value, WhenError> {
        let mut left = self.unary()?;

        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.unary()?;
            left = Value::Bool(as_bool(left, "&&")? && as_bool(right, "&&")?);
        }

        Ok(left)
    }

    fn unary(&mut self) -> Result<Value, WhenError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let value = self.unary()?;
            return Ok(Value::Bool(!as_bool(value, "!")?));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Value, WhenError> {
        let left = self.primary()?;

        let negated = match self.peek() {
            Some(Token::Eq) => false,
            Some(Token::Ne) => true,
            _ => return Ok(left),
        };
        self.next();

        let right = self.primary()?;
        let equal = match (&left, &right) {
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            _ => {
                return Err(WhenError::TypeMismatch {
                    left: left.type_name(),
                    right: right.type_name(),
                });
            }
        };

        Ok(Value::Bool(equal != negated))
    }

    fn primary(&mut self) -> Result<Value, WhenError> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Value::Str(s)),
            Some(Token::Bool(b)) => Ok(Value::Bool(b)),
            Some(Token::Ident(name)) => self
                .parameters
                .get(&name)
                .map(|v| Value::Str(v.clone()))
                .ok_or(WhenError::UnknownParameter(name)),
            Some(Token::LParen) => {
                let value = self.expression()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    Some(token) => Err(WhenError::UnexpectedToken(format!("{token:?}"))),
                    None => Err(WhenError::UnexpectedEnd),
                }
            }
            Some(token) => Err(WhenError::UnexpectedToken(format!("{token:?}"))),
            None => Err(WhenError::UnexpectedEnd),
        }
    }
}

fn as_bool(value: Value, operator: &'static str) -> Result<bool, WhenError> {
    match value {
        Value::Bool(b) => Ok(b),
        Value::Str(_) => Err(WhenError::BooleanOperandRequired { operator }),
    }
}

fn env_ref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z0-9_]+)\}").expect("env ref regex is valid"))
}

pub struct WhenEvaluator {
    envvar_helper: Arc<EnvvarHelper>,
}

impl WhenEvaluator {
    pub fn new(envvar_helper: Arc<EnvvarHelper>) -> Self {
        WhenEvaluator { envvar_helper }
    }

    /// Evaluates the expression against the parameters; `${VAR}` references
    /// are expanded through the env resolver first.
    pub fn evaluate(
        &self,
        pipeline: &str,
        input: &str,
        parameters: &HashMap<String, String>,
    ) -> Result<bool, WhenError> {
        if input.trim().is_empty() {
            return Err(WhenError::EmptyExpression);
        }

        debug!(pipeline, expression = input, "Evaluating when expression");

        let expanded = env_ref_regex()
            .replace_all(input, |caps: &regex::Captures| {
                self.envvar_helper.expand(&caps[1])
            })
            .to_string();

        let tokens = lex(&expanded)?;
        let mut parser = Parser {
            tokens,
            position: 0,
            parameters,
        };

        let value = parser.expression()?;
        if parser.peek().is_some() {
            return Err(WhenError::UnexpectedToken(format!(
                "{:?}",
                parser.peek().unwrap()
            )));
        }

        match value {
            Value::Bool(result) => {
                debug!(pipeline, expression = input, result, "Evaluated when expression");
                Ok(result)
            }
            Value::Str(_) => Err(WhenError::NotBoolean),
        }
    }

    /// Snapshot of the parameters a when expression may reference.
    pub fn parameters(&self) -> HashMap<String, String> {
        let mut parameters = HashMap::with_capacity(5);
        parameters.insert(
            "branch".to_string(),
            self.envvar_helper.expand("ZIPLINEE_GIT_BRANCH"),
        );
        parameters.insert(
            "trigger".to_string(),
            self.envvar_helper.expand("ZIPLINEE_TRIGGER"),
        );
        parameters.insert(
            "status".to_string(),
            self.envvar_helper.expand("ZIPLINEE_BUILD_STATUS"),
        );
        parameters.insert(
            "action".to_string(),
            self.envvar_helper.expand("ZIPLINEE_RELEASE_ACTION"),
        );
        parameters.insert(
            "server".to_string(),
            self.envvar_helper.ci_server().to_string(),
        );
        parameters
    }
}
