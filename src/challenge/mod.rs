//! Authentication Challenges
//!
//! Parser for `WWW-Authenticate`-style headers.
//!
//! A header holds a comma-separated list of challenges. Each challenge is a scheme token
//! followed either by a single token68 value or by `name=value` pairs, where a value is a
//! token or a quoted string:
//!
//! ```text
//! Bearer realm="api", error="invalid_token", Basic realm="legacy", Negotiate a87421==
//! ```
//!
//! Parsing is all-or-nothing: a malformed header yields `None`, never a partial map.

use std::collections::HashMap;

/// Parameters attached to one challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChallengeParams {
    /// `name=value` pairs. Empty for a bare scheme.
    Params(HashMap<String, String>),
    /// Positional token68 value(s).
    Token68(Vec<String>),
}

impl ChallengeParams {
    /// Named parameter lookup. Always `None` for token68 challenges.
    pub fn get(&self, name: &str) -> Option<&str> {
        match self {
            Self::Params(params) => params.get(name).map(String::as_str),
            Self::Token68(_) => None,
        }
    }

    /// The `error` parameter of a Bearer challenge.
    pub fn error(&self) -> Option<&str> {
        self.get("error")
    }
}

/// Parsed challenges keyed by scheme exactly as it appeared in the header.
pub type Challenges = HashMap<String, ChallengeParams>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Token(String),
    Quoted(String),
    Equals,
    Comma,
}

fn is_tchar(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~/".contains(c)
}

fn tokenize(input: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Equals);
            }
            '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, c)) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => return None,
                        },
                        _ => value.push(c),
                    }
                }
                if !closed {
                    return None;
                }
                tokens.push(Token::Quoted(value));
            }
            c if is_tchar(c) => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if !is_tchar(c) {
                        break;
                    }
                    end = i + c.len_utf8();
                    chars.next();
                }
                let mut value = input[start..end].to_string();

                // token68 padding: one or two '=' ending the header.
                let rest = &input[end..];
                if rest == "=" || rest == "==" {
                    value.push_str(rest);
                    for _ in 0..rest.len() {
                        chars.next();
                    }
                }
                tokens.push(Token::Token(value));
            }
            _ => return None,
        }
    }

    Some(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn skip_commas(&mut self) {
        while self.peek(0) == Some(&Token::Comma) {
            self.pos += 1;
        }
    }

    /// `name = value` starting at the cursor.
    fn at_param(&self) -> bool {
        matches!(
            (self.peek(0), self.peek(1)),
            (Some(Token::Token(_)), Some(Token::Equals))
        )
    }

    fn parse_param(&mut self) -> Option<(String, String)> {
        let name = match self.peek(0) {
            Some(Token::Token(name)) => name.clone(),
            _ => return None,
        };
        let value = match self.peek(2) {
            Some(Token::Token(value)) | Some(Token::Quoted(value)) => value.clone(),
            _ => return None,
        };
        self.pos += 3;
        Some((name, value))
    }

    fn parse_challenge(&mut self) -> Option<(String, ChallengeParams)> {
        let scheme = match self.peek(0) {
            Some(Token::Token(scheme)) => scheme.clone(),
            _ => return None,
        };
        self.pos += 1;

        match self.peek(0) {
            None | Some(Token::Comma) => {
                // Bare scheme, or the start of its parameter list after a comma.
            }
            Some(Token::Token(_)) if !self.at_param() => {
                let value = match self.peek(0) {
                    Some(Token::Token(value)) => value.clone(),
                    _ => return None,
                };
                self.pos += 1;
                return match self.peek(0) {
                    None | Some(Token::Comma) => {
                        Some((scheme, ChallengeParams::Token68(vec![value])))
                    }
                    _ => None,
                };
            }
            Some(Token::Token(_)) => {}
            _ => return None,
        }

        let mut params = HashMap::new();
        loop {
            if self.at_param() {
                let (name, value) = self.parse_param()?;
                params.insert(name, value);
            }

            match self.peek(0) {
                None => break,
                Some(Token::Comma) => {
                    let mut lookahead = 1;
                    while self.peek(lookahead) == Some(&Token::Comma) {
                        lookahead += 1;
                    }
                    let next_is_param = matches!(
                        (self.peek(lookahead), self.peek(lookahead + 1)),
                        (Some(Token::Token(_)), Some(Token::Equals))
                    );
                    if next_is_param {
                        self.pos += lookahead;
                    } else {
                        break;
                    }
                }
                _ => return None,
            }
        }

        Some((scheme, ChallengeParams::Params(params)))
    }

    fn parse(mut self) -> Option<Challenges> {
        let mut challenges = HashMap::new();
        self.skip_commas();
        while self.peek(0).is_some() {
            let (scheme, params) = self.parse_challenge()?;
            challenges.insert(scheme, params);
            self.skip_commas();
        }
        Some(challenges)
    }
}

/// Parse every challenge in a header value.
///
/// Returns `None` for an absent, empty or malformed header.
pub fn parse_challenges(value: Option<&str>) -> Option<Challenges> {
    let value = value?.trim();
    if value.is_empty() {
        return None;
    }
    let tokens = tokenize(value)?;
    Parser { tokens, pos: 0 }.parse()
}

/// Parse a header value and return the parameters of one scheme.
///
/// The scheme is matched case-sensitively against the header's own spelling.
pub fn parse_challenge(value: Option<&str>, scheme: &str) -> Option<ChallengeParams> {
    parse_challenges(value)?.remove(scheme)
}
