// Condition Parser
// Recursive descent parser turning gate expression tokens into a Condition tree

use crate::expression::condition::{CompareOp, Condition};
use crate::expression::lexer::{LexError, Lexer, Spanned, Token};

use thiserror::Error;

/// Parser error with the byte offset of the offending token
#[derive(Debug, Clone, PartialEq, Error)]
#[error("condition parse error at position {position}: {message}")]
pub struct ParseConditionError {
    pub message: String,
    pub position: usize,
}

impl From<LexError> for ParseConditionError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            position: err.position,
        }
    }
}

/// Deepest nesting of `!` and parentheses accepted in one condition
pub const MAX_NESTING_DEPTH: usize = 64;

/// Recursive descent parser for gate expressions
pub struct ConditionParser {
    tokens: Vec<Spanned>,
    position: usize,
    depth: usize,
}

impl ConditionParser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            position: 0,
            depth: 0,
        }
    }

    /// Parse a condition from text
    pub fn parse_str(input: &str) -> Result<Condition, ParseConditionError> {
        let tokens = Lexer::new(input).tokenize()?;
        Self::new(tokens).parse()
    }

    pub fn parse(&mut self) -> Result<Condition, ParseConditionError> {
        if self.peek() == &Token::Eof {
            return Err(self.error("empty condition"));
        }

        let condition = self.parse_or()?;

        if self.peek() != &Token::Eof {
            return Err(self.error(&format!("unexpected token '{}'", self.peek())));
        }

        Ok(condition)
    }

    // Precedence (lowest to highest):
    // 1. ||
    // 2. &&
    // 3. ! (unary)
    // 4. primary: literal, comparison, function call, parenthesized

    fn parse_or(&mut self) -> Result<Condition, ParseConditionError> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::Or) {
            let right = self.parse_and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Condition, ParseConditionError> {
        let mut left = self.parse_unary()?;
        while self.eat(&Token::And) {
            let right = self.parse_unary()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Condition, ParseConditionError> {
        if self.eat(&Token::Not) {
            self.enter()?;
            let inner = self.parse_unary();
            self.depth -= 1;
            return Ok(Condition::Not(Box::new(inner?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition, ParseConditionError> {
        if self.eat(&Token::LParen) {
            self.enter()?;
            let inner = self.parse_or();
            self.depth -= 1;
            let inner = inner?;
            self.expect(&Token::RParen)?;
            return Ok(inner);
        }

        let ident = match self.peek().clone() {
            Token::Identifier(name) => {
                self.advance();
                name
            }
            other => return Err(self.error(&format!("unexpected token '{}'", other))),
        };

        match ident.as_str() {
            "true" => return Ok(Condition::Literal(true)),
            "false" => return Ok(Condition::Literal(false)),
            _ => {}
        }

        if self.eat(&Token::LParen) {
            return self.parse_call(&ident);
        }

        let op = if self.eat(&Token::Eq) {
            CompareOp::Eq
        } else if self.eat(&Token::Ne) {
            CompareOp::Ne
        } else {
            return Err(self.error(&format!("expected '==' or '!=' after '{}'", ident)));
        };

        let value = self.expect_string()?;
        Ok(Condition::Compare {
            field: ident,
            op,
            value,
        })
    }

    /// Function call after its opening parenthesis
    fn parse_call(&mut self, name: &str) -> Result<Condition, ParseConditionError> {
        match name {
            "always" => {
                self.expect(&Token::RParen)?;
                Ok(Condition::Always)
            }
            "success" | "failure" => {
                let jobs = self.parse_job_list(name)?;
                if name == "success" {
                    Ok(Condition::AllSucceeded(jobs))
                } else {
                    Ok(Condition::AnyFailed(jobs))
                }
            }
            "startsWith" => {
                let field = self.expect_identifier()?;
                self.expect(&Token::Comma)?;
                let prefix = self.expect_string()?;
                self.expect(&Token::RParen)?;
                Ok(Condition::StartsWith { field, prefix })
            }
            other => Err(self.error(&format!("unknown function '{}'", other))),
        }
    }

    fn parse_job_list(&mut self, function: &str) -> Result<Vec<String>, ParseConditionError> {
        let mut jobs = Vec::new();
        if self.eat(&Token::RParen) {
            return Err(self.error(&format!("{}() expects at least one job name", function)));
        }
        loop {
            jobs.push(self.expect_identifier()?);
            if self.eat(&Token::RParen) {
                return Ok(jobs);
            }
            self.expect(&Token::Comma)?;
        }
    }

    fn enter(&mut self) -> Result<(), ParseConditionError> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(self.error(&format!(
                "condition nested deeper than {} levels",
                MAX_NESTING_DEPTH
            )));
        }
        self.depth += 1;
        Ok(())
    }

    fn expect_identifier(&mut self) -> Result<String, ParseConditionError> {
        match self.peek().clone() {
            Token::Identifier(name) => {
                self.advance();
                Ok(name)
            }
            other => Err(self.error(&format!("expected identifier, found '{}'", other))),
        }
    }

    fn expect_string(&mut self) -> Result<String, ParseConditionError> {
        match self.peek().clone() {
            Token::String(value) => {
                self.advance();
                Ok(value)
            }
            other => Err(self.error(&format!("expected quoted string, found '{}'", other))),
        }
    }

    fn expect(&mut self, token: &Token) -> Result<(), ParseConditionError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(&format!("expected '{}', found '{}'", token, self.peek())))
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.position)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn error(&self, message: &str) -> ParseConditionError {
        let position = self
            .tokens
            .get(self.position)
            .or_else(|| self.tokens.last())
            .map(|s| s.position)
            .unwrap_or(0);
        ParseConditionError {
            message: message.to_string(),
            position,
        }
    }
}
