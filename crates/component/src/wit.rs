//! WIT Lexer
//!
//! Tokenizes WebAssembly Interface Type definitions. Only the token layer lives here: parsing
//! is the embedder's job, the ABI layer just needs the primitive type keywords mapped onto
//! component value types.

use alloc::string::{String, ToString};
use alloc::vec::Vec;

use thiserror::Error;

use crate::types::ValType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LexError {
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("unterminated block comment starting at offset {0}")]
    UnterminatedComment(usize),
}

/// A WIT token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    // Keywords.
    Package,
    Interface,
    World,
    Use,
    Type,
    Func,
    Record,
    Variant,
    Enum,
    Flags,
    Resource,
    Static,
    Constructor,
    Import,
    Export,
    Include,
    As,
    With,
    Own,
    Borrow,
    List,
    Tuple,
    Option,
    Result,

    /// A primitive type keyword, carrying the component value type it names.
    Primitive(ValType),

    // Punctuation.
    Colon,
    Semicolon,
    Comma,
    Period,
    Equals,
    Arrow,
    LBrace,
    RBrace,
    LParen,
    RParen,
    LAngle,
    RAngle,
    At,
    Slash,
    Underscore,

    /// A kebab-case identifier (`%`-escaped ones lex to the bare name).
    Ident(String),
    /// An integer literal, as found in package versions.
    Integer(u64),
}

/// A token and the byte range it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned {
    pub token: Token,
    pub start: usize,
    pub end: usize,
}

/// A cursor producing WIT tokens from source text.
pub struct Lexer<'a> {
    source: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self { source, pos: 0 }
    }

    /// Tokenizes a whole source text.
    pub fn tokenize(source: &'a str) -> Result<Vec<Spanned>, LexError> {
        Lexer::new(source).collect()
    }

    /// Returns the next token, or `None` at the end of input.
    pub fn next_token(&mut self) -> Result<Option<Spanned>, LexError> {
        self.skip_trivia()?;
        let start = self.pos;
        let Some(c) = self.peek() else {
            return Ok(None);
        };

        let token = match c {
            ':' => self.single(Token::Colon),
            ';' => self.single(Token::Semicolon),
            ',' => self.single(Token::Comma),
            '.' => self.single(Token::Period),
            '=' => self.single(Token::Equals),
            '{' => self.single(Token::LBrace),
            '}' => self.single(Token::RBrace),
            '(' => self.single(Token::LParen),
            ')' => self.single(Token::RParen),
            '<' => self.single(Token::LAngle),
            '>' => self.single(Token::RAngle),
            '@' => self.single(Token::At),
            '/' => self.single(Token::Slash),
            '-' => {
                // `-` only appears in `->`; kebab dashes are consumed inside words.
                self.bump();
                match self.peek() {
                    Some('>') => {
                        self.bump();
                        Token::Arrow
                    }
                    _ => return Err(LexError::UnexpectedChar('-', start)),
                }
            }
            '%' => {
                self.bump();
                let word = self.word();
                if word.is_empty() {
                    return Err(LexError::UnexpectedChar('%', start));
                }
                Token::Ident(word)
            }
            '_' => {
                self.bump();
                Token::Underscore
            }
            c if c.is_ascii_digit() => {
                let mut value: u64 = 0;
                while let Some(digit) = self.peek().and_then(|c| c.to_digit(10)) {
                    value = value.wrapping_mul(10).wrapping_add(digit as u64);
                    self.bump();
                }
                Token::Integer(value)
            }
            c if c.is_ascii_alphabetic() => {
                let word = self.word();
                keyword(&word).unwrap_or(Token::Ident(word))
            }
            c => return Err(LexError::UnexpectedChar(c, start)),
        };

        Ok(Some(Spanned {
            token,
            start,
            end: self.pos,
        }))
    }

    /// Skips whitespace, line comments, and nested block comments.
    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                Some(c) if c.is_whitespace() => {
                    self.bump();
                }
                Some('/') if self.rest().starts_with("//") => {
                    while let Some(c) = self.peek() {
                        self.bump();
                        if c == '\n' {
                            break;
                        }
                    }
                }
                Some('/') if self.rest().starts_with("/*") => {
                    let start = self.pos;
                    self.bump();
                    self.bump();
                    let mut depth = 1;
                    while depth > 0 {
                        if self.rest().starts_with("/*") {
                            self.bump();
                            self.bump();
                            depth += 1;
                        } else if self.rest().starts_with("*/") {
                            self.bump();
                            self.bump();
                            depth -= 1;
                        } else if self.bump().is_none() {
                            return Err(LexError::UnterminatedComment(start));
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Consumes a kebab-case word.
    fn word(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '-' {
                self.bump();
            } else {
                break;
            }
        }
        self.source[start..self.pos].to_string()
    }

    fn single(&mut self, token: Token) -> Token {
        self.bump();
        token
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn rest(&self) -> &str {
        &self.source[self.pos..]
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Spanned, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_token().transpose()
    }
}

fn keyword(word: &str) -> Option<Token> {
    let token = match word {
        "package" => Token::Package,
        "interface" => Token::Interface,
        "world" => Token::World,
        "use" => Token::Use,
        "type" => Token::Type,
        "func" => Token::Func,
        "record" => Token::Record,
        "variant" => Token::Variant,
        "enum" => Token::Enum,
        "flags" => Token::Flags,
        "resource" => Token::Resource,
        "static" => Token::Static,
        "constructor" => Token::Constructor,
        "import" => Token::Import,
        "export" => Token::Export,
        "include" => Token::Include,
        "as" => Token::As,
        "with" => Token::With,
        "own" => Token::Own,
        "borrow" => Token::Borrow,
        "list" => Token::List,
        "tuple" => Token::Tuple,
        "option" => Token::Option,
        "result" => Token::Result,
        "bool" => Token::Primitive(ValType::Bool),
        "s8" => Token::Primitive(ValType::S8),
        "u8" => Token::Primitive(ValType::U8),
        "s16" => Token::Primitive(ValType::S16),
        "u16" => Token::Primitive(ValType::U16),
        "s32" => Token::Primitive(ValType::S32),
        "u32" => Token::Primitive(ValType::U32),
        "s64" => Token::Primitive(ValType::S64),
        "u64" => Token::Primitive(ValType::U64),
        "f32" | "float32" => Token::Primitive(ValType::F32),
        "f64" | "float64" => Token::Primitive(ValType::F64),
        "char" => Token::Primitive(ValType::Char),
        "string" => Token::Primitive(ValType::String),
        _ => return None,
    };
    Some(token)
}
