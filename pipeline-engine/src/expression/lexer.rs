// Condition Lexer
// Tokenizes gate expressions such as `branch == 'main' && success(lint, test)`

use std::fmt;

/// Token types for gate expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Identifier(String),
    String(String),

    Eq,  // ==
    Ne,  // !=
    And, // &&
    Or,  // ||
    Not, // !

    LParen, // (
    RParen, // )
    Comma,  // ,

    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Identifier(s) => write!(f, "{}", s),
            Token::String(s) => write!(f, "'{}'", s),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::Comma => write!(f, ","),
            Token::Eof => write!(f, "end of input"),
        }
    }
}

/// A token with the byte offset where it starts
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub position: usize,
}

/// Lexer error
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

/// Lexer for gate expressions
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    len: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            len: input.len(),
        }
    }

    /// Tokenize the entire input; the last token is always `Eof`
    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let spanned = self.next_token()?;
            let done = spanned.token == Token::Eof;
            tokens.push(spanned);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Spanned, LexError> {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }

        let Some((position, c)) = self.chars.next() else {
            return Ok(Spanned {
                token: Token::Eof,
                position: self.len,
            });
        };

        let token = match c {
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '=' => self.expect_next('=', Token::Eq, position)?,
            '&' => self.expect_next('&', Token::And, position)?,
            '|' => self.expect_next('|', Token::Or, position)?,
            '!' => {
                if matches!(self.chars.peek(), Some((_, '='))) {
                    self.chars.next();
                    Token::Ne
                } else {
                    Token::Not
                }
            }
            '\'' | '"' => Token::String(self.read_string(c, position)?),
            c if c.is_ascii_alphabetic() || c == '_' => Token::Identifier(self.read_identifier(c)),
            other => {
                return Err(LexError {
                    message: format!("unexpected character '{}'", other),
                    position,
                })
            }
        };

        Ok(Spanned { token, position })
    }

    fn expect_next(
        &mut self,
        expected: char,
        token: Token,
        position: usize,
    ) -> Result<Token, LexError> {
        match self.chars.next() {
            Some((_, c)) if c == expected => Ok(token),
            _ => Err(LexError {
                message: format!("expected '{}{}'", expected, expected),
                position,
            }),
        }
    }

    /// Quoted string; a doubled quote inside the string is an escaped quote
    fn read_string(&mut self, quote: char, start: usize) -> Result<String, LexError> {
        let mut value = String::new();
        while let Some((_, c)) = self.chars.next() {
            if c == quote {
                if matches!(self.chars.peek(), Some((_, next)) if *next == quote) {
                    self.chars.next();
                    value.push(quote);
                    continue;
                }
                return Ok(value);
            }
            value.push(c);
        }
        Err(LexError {
            message: "unterminated string".to_string(),
            position: start,
        })
    }

    fn read_identifier(&mut self, first: char) -> String {
        let mut ident = String::from(first);
        while let Some((_, c)) = self.chars.peek() {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') {
                ident.push(*c);
                self.chars.next();
            } else {
                break;
            }
        }
        ident
    }
}
