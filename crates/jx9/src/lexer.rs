//! Tokenizer for JX9 source text.
//!
//! Byte-level scanner producing a flat token vector. Tokens carry their
//! 1-based source line for diagnostics. Double-quoted string bodies are kept
//! raw: escape resolution and `$variable` interpolation happen in the
//! compiler, which re-enters the lexer on the embedded slices.

use strum::Display;

/// Reserved words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub(crate) enum Kw {
    If,
    Else,
    Elseif,
    While,
    For,
    Foreach,
    As,
    Switch,
    Case,
    Default,
    Break,
    Continue,
    Function,
    Return,
    Die,
    Exit,
    Static,
    Const,
    Uplink,
    Print,
    /// `int` type hint / cast.
    Int,
    /// `float` type hint / cast.
    Float,
    /// `string` type hint / cast.
    String,
    /// `bool` type hint / cast.
    Bool,
}

fn keyword(ident: &str) -> Option<Kw> {
    Some(match ident {
        "if" => Kw::If,
        "else" => Kw::Else,
        "elseif" => Kw::Elseif,
        "while" => Kw::While,
        "for" => Kw::For,
        "foreach" => Kw::Foreach,
        "as" => Kw::As,
        "switch" => Kw::Switch,
        "case" => Kw::Case,
        "default" => Kw::Default,
        "break" => Kw::Break,
        "continue" => Kw::Continue,
        "function" => Kw::Function,
        "return" => Kw::Return,
        "die" => Kw::Die,
        "exit" => Kw::Exit,
        "static" => Kw::Static,
        "const" => Kw::Const,
        "uplink" => Kw::Uplink,
        "print" => Kw::Print,
        "int" => Kw::Int,
        "float" => Kw::Float,
        "string" => Kw::String,
        "bool" => Kw::Bool,
        _ => return None,
    })
}

/// One lexical token.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Int(i64),
    Real(f64),
    /// Single-quoted string, escapes already resolved (`\\` and `\'` only;
    /// any other backslash stays verbatim).
    SingleStr(String),
    /// Double-quoted string, raw body: the compiler resolves escapes and
    /// embedded variable references.
    DoubleStr(String),
    /// Nowdoc body, verbatim.
    Nowdoc(String),
    Ident(String),
    /// `$name` variable reference.
    Var(String),
    Kw(Kw),

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Dot,
    Assign,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,
    DotEq,
    ShlEq,
    ShrEq,
    AmpEq,
    PipeEq,
    CaretEq,
    EqEq,
    NotEq,
    EqEqEq,
    NotEqEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Not,
    Tilde,
    Amp,
    Pipe,
    Caret,
    Shl,
    Shr,
    PlusPlus,
    MinusMinus,
    Question,
    Colon,
    Comma,
    Semi,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
}

/// Token plus source position.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub tok: Tok,
    pub line: u32,
}

/// Tokenizes a complete source buffer.
///
/// The scanner is reentrant: the compiler calls it again on slices embedded
/// in double-quoted strings. Errors are returned as `(line, message)` pairs
/// for the caller's diagnostic accumulator.
pub(crate) fn tokenize(src: &str) -> Result<Vec<Token>, (u32, String)> {
    Lexer {
        bytes: src.as_bytes(),
        src,
        pos: 0,
        line: 1,
    }
    .run()
}

struct Lexer<'a> {
    bytes: &'a [u8],
    src: &'a str,
    pos: usize,
    line: u32,
}

impl Lexer<'_> {
    fn run(mut self) -> Result<Vec<Token>, (u32, String)> {
        let mut out = Vec::new();
        loop {
            self.skip_trivia();
            let line = self.line;
            let Some(b) = self.peek() else { break };
            let tok = match b {
                b'0'..=b'9' => self.number(),
                b'$' => self.variable()?,
                b'\'' => self.single_quoted()?,
                b'"' => self.double_quoted()?,
                b'<' if self.lookahead(b"<<<") => self.nowdoc()?,
                _ if b.is_ascii_alphabetic() || b == b'_' || b >= 0x80 => {
                    let ident = self.ident();
                    keyword(&ident).map_or(Tok::Ident(ident), Tok::Kw)
                }
                _ => self.operator()?,
            };
            out.push(Token { tok, line });
        }
        Ok(out)
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn lookahead(&self, prefix: &[u8]) -> bool {
        self.bytes[self.pos..].starts_with(prefix)
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.line += 1;
        }
        Some(b)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.peek() {
                Some(b) if b.is_ascii_whitespace() => {
                    self.bump();
                }
                Some(b'#') => self.skip_line(),
                Some(b'/') if self.peek_at(1) == Some(b'/') => self.skip_line(),
                Some(b'/') if self.peek_at(1) == Some(b'*') => {
                    self.bump();
                    self.bump();
                    while self.pos < self.bytes.len() && !self.lookahead(b"*/") {
                        self.bump();
                    }
                    self.bump();
                    self.bump();
                }
                _ => break,
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(b) = self.peek() {
            if b == b'\n' {
                break;
            }
            self.bump();
        }
    }

    fn ident(&mut self) -> String {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' || b >= 0x80 {
                self.bump();
            } else {
                break;
            }
        }
        self.src[start..self.pos].to_string()
    }

    fn variable(&mut self) -> Result<Tok, (u32, String)> {
        self.bump(); // '$'
        let name = self.ident();
        if name.is_empty() {
            return Err((self.line, "missing variable name after '$'".to_string()));
        }
        Ok(Tok::Var(name))
    }

    /// Integer (decimal, hex, binary, octal) or real literal.
    fn number(&mut self) -> Tok {
        let start = self.pos;
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'x' | b'X')) {
            self.bump();
            self.bump();
            while matches!(self.peek(), Some(b) if b.is_ascii_hexdigit()) {
                self.bump();
            }
            return Tok::Int(crate::value::str_to_int(&self.src[start..self.pos]));
        }
        if self.peek() == Some(b'0') && matches!(self.peek_at(1), Some(b'b' | b'B')) {
            self.bump();
            self.bump();
            while matches!(self.peek(), Some(b'0' | b'1')) {
                self.bump();
            }
            return Tok::Int(crate::value::str_to_int(&self.src[start..self.pos]));
        }
        while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
            self.bump();
        }
        let mut is_real = false;
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(b) if b.is_ascii_digit()) {
            is_real = true;
            self.bump();
            while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                self.bump();
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            let mut ahead = 1;
            if matches!(self.peek_at(1), Some(b'+' | b'-')) {
                ahead = 2;
            }
            if matches!(self.peek_at(ahead), Some(b) if b.is_ascii_digit()) {
                is_real = true;
                for _ in 0..=ahead {
                    self.bump();
                }
                while matches!(self.peek(), Some(b) if b.is_ascii_digit()) {
                    self.bump();
                }
            }
        }
        let image = &self.src[start..self.pos];
        if is_real {
            Tok::Real(crate::value::str_to_real(image))
        } else {
            // A leading zero selects octal, per the integer-image rules.
            Tok::Int(crate::value::str_to_int(image))
        }
    }

    /// Single-quoted string: only `\\` and `\'` unescape; any other
    /// backslash sequence is kept verbatim.
    fn single_quoted(&mut self) -> Result<Tok, (u32, String)> {
        let open_line = self.line;
        self.bump(); // opening quote
        let mut body = String::new();
        loop {
            match self.peek() {
                None => return Err((open_line, "unterminated string literal".to_string())),
                Some(b'\'') => {
                    self.bump();
                    break;
                }
                Some(b'\\') => {
                    self.bump();
                    match self.peek() {
                        Some(b'\\') => {
                            self.bump();
                            body.push('\\');
                        }
                        Some(b'\'') => {
                            self.bump();
                            body.push('\'');
                        }
                        // Unknown escapes stay verbatim.
                        _ => body.push('\\'),
                    }
                }
                Some(b) if b < 0x80 => {
                    self.bump();
                    body.push(char::from(b));
                }
                Some(_) => {
                    let ch = self.src[self.pos..].chars().next().expect("valid UTF-8 source");
                    for _ in 0..ch.len_utf8() {
                        self.bump();
                    }
                    body.push(ch);
                }
            }
        }
        Ok(Tok::SingleStr(body))
    }

    /// Double-quoted string: the raw body is captured; escapes and `$`
    /// references are resolved by the compiler.
    fn double_quoted(&mut self) -> Result<Tok, (u32, String)> {
        let open_line = self.line;
        self.bump(); // opening quote
        let start = self.pos;
        loop {
            match self.bump() {
                None => return Err((open_line, "unterminated string literal".to_string())),
                Some(b'"') => break,
                Some(b'\\') => {
                    // Skip the escaped byte so an escaped quote cannot close.
                    self.bump();
                }
                Some(_) => {}
            }
        }
        Ok(Tok::DoubleStr(self.src[start..self.pos - 1].to_string()))
    }

    /// Nowdoc: `<<<TAG` or `<<<'TAG'` up to a line starting with `TAG`.
    fn nowdoc(&mut self) -> Result<Tok, (u32, String)> {
        let open_line = self.line;
        self.pos += 3; // '<<<'
        let quoted = self.peek() == Some(b'\'');
        if quoted {
            self.bump();
        }
        let tag = self.ident();
        if tag.is_empty() {
            return Err((open_line, "missing nowdoc tag".to_string()));
        }
        if quoted && self.peek() == Some(b'\'') {
            self.bump();
        }
        // Consume up to and including the end of the opener line.
        while let Some(b) = self.bump() {
            if b == b'\n' {
                break;
            }
        }
        let body_start = self.pos;
        loop {
            let line_start = self.pos;
            if self.lookahead(tag.as_bytes()) {
                let body_end = line_start.saturating_sub(1).max(body_start);
                let body = self.src[body_start..body_end].to_string();
                self.pos += tag.len();
                return Ok(Tok::Nowdoc(body));
            }
            if self.pos >= self.bytes.len() {
                return Err((open_line, format!("unterminated nowdoc (missing '{tag}')")));
            }
            while let Some(b) = self.bump() {
                if b == b'\n' {
                    break;
                }
            }
        }
    }

    fn operator(&mut self) -> Result<Tok, (u32, String)> {
        let line = self.line;
        let b = self.bump().expect("caller checked non-empty");
        let tok = match b {
            b'+' => match self.peek() {
                Some(b'+') => {
                    self.bump();
                    Tok::PlusPlus
                }
                Some(b'=') => {
                    self.bump();
                    Tok::PlusEq
                }
                _ => Tok::Plus,
            },
            b'-' => match self.peek() {
                Some(b'-') => {
                    self.bump();
                    Tok::MinusMinus
                }
                Some(b'=') => {
                    self.bump();
                    Tok::MinusEq
                }
                _ => Tok::Minus,
            },
            b'*' => {
                if self.peek() == Some(b'=') {
                    self.bump();
                    Tok::StarEq
                } else {
                    Tok::Star
                }
            }
            b'/' => {
                if self.peek() == Some(b'=') {
                    self.bump();
                    Tok::SlashEq
                } else {
                    Tok::Slash
                }
            }
            b'%' => {
                if self.peek() == Some(b'=') {
                    self.bump();
                    Tok::PercentEq
                } else {
                    Tok::Percent
                }
            }
            b'.' => {
                if self.peek() == Some(b'=') {
                    self.bump();
                    Tok::DotEq
                } else {
                    Tok::Dot
                }
            }
            b'=' => match (self.peek(), self.peek_at(1)) {
                (Some(b'='), Some(b'=')) => {
                    self.bump();
                    self.bump();
                    Tok::EqEqEq
                }
                (Some(b'='), _) => {
                    self.bump();
                    Tok::EqEq
                }
                _ => Tok::Assign,
            },
            b'!' => match (self.peek(), self.peek_at(1)) {
                (Some(b'='), Some(b'=')) => {
                    self.bump();
                    self.bump();
                    Tok::NotEqEq
                }
                (Some(b'='), _) => {
                    self.bump();
                    Tok::NotEq
                }
                _ => Tok::Not,
            },
            b'<' => match self.peek() {
                Some(b'=') => {
                    self.bump();
                    Tok::Le
                }
                Some(b'<') => {
                    self.bump();
                    if self.peek() == Some(b'=') {
                        self.bump();
                        Tok::ShlEq
                    } else {
                        Tok::Shl
                    }
                }
                _ => Tok::Lt,
            },
            b'>' => match self.peek() {
                Some(b'=') => {
                    self.bump();
                    Tok::Ge
                }
                Some(b'>') => {
                    self.bump();
                    if self.peek() == Some(b'=') {
                        self.bump();
                        Tok::ShrEq
                    } else {
                        Tok::Shr
                    }
                }
                _ => Tok::Gt,
            },
            b'&' => match self.peek() {
                Some(b'&') => {
                    self.bump();
                    Tok::AndAnd
                }
                Some(b'=') => {
                    self.bump();
                    Tok::AmpEq
                }
                _ => Tok::Amp,
            },
            b'|' => match self.peek() {
                Some(b'|') => {
                    self.bump();
                    Tok::OrOr
                }
                Some(b'=') => {
                    self.bump();
                    Tok::PipeEq
                }
                _ => Tok::Pipe,
            },
            b'^' => {
                if self.peek() == Some(b'=') {
                    self.bump();
                    Tok::CaretEq
                } else {
                    Tok::Caret
                }
            }
            b'~' => Tok::Tilde,
            b'?' => Tok::Question,
            b':' => Tok::Colon,
            b',' => Tok::Comma,
            b';' => Tok::Semi,
            b'(' => Tok::LParen,
            b')' => Tok::RParen,
            b'[' => Tok::LBracket,
            b']' => Tok::RBracket,
            b'{' => Tok::LBrace,
            b'}' => Tok::RBrace,
            other => {
                return Err((line, format!("unexpected character '{}'", char::from(other))));
            }
        };
        Ok(tok)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn kinds(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn numbers_in_all_bases() {
        assert_eq!(
            kinds("42 0x2a 0b101010 052 1.5 2e3"),
            vec![
                Tok::Int(42),
                Tok::Int(42),
                Tok::Int(42),
                Tok::Int(42),
                Tok::Real(1.5),
                Tok::Real(2000.0),
            ]
        );
    }

    #[test]
    fn variables_and_keywords() {
        assert_eq!(
            kinds("foreach($m as $k, $v)"),
            vec![
                Tok::Kw(Kw::Foreach),
                Tok::LParen,
                Tok::Var("m".to_string()),
                Tok::Kw(Kw::As),
                Tok::Var("k".to_string()),
                Tok::Comma,
                Tok::Var("v".to_string()),
                Tok::RParen,
            ]
        );
    }

    #[test]
    fn single_quote_escapes_are_minimal() {
        assert_eq!(
            kinds(r"'a\'b\\c\nd'"),
            vec![Tok::SingleStr("a'b\\c\\nd".to_string())]
        );
    }

    #[test]
    fn double_quote_body_is_raw() {
        assert_eq!(kinds(r#""x\n$v""#), vec![Tok::DoubleStr(r"x\n$v".to_string())]);
    }

    #[test]
    fn operators_longest_match() {
        assert_eq!(
            kinds("=== !== == != <= >= << >> <<= .= ++ --"),
            vec![
                Tok::EqEqEq,
                Tok::NotEqEq,
                Tok::EqEq,
                Tok::NotEq,
                Tok::Le,
                Tok::Ge,
                Tok::Shl,
                Tok::Shr,
                Tok::ShlEq,
                Tok::DotEq,
                Tok::PlusPlus,
                Tok::MinusMinus,
            ]
        );
    }

    #[test]
    fn comments_are_trivia() {
        assert_eq!(
            kinds("1 // line\n2 # hash\n/* block\n */ 3"),
            vec![Tok::Int(1), Tok::Int(2), Tok::Int(3)]
        );
    }

    #[test]
    fn nowdoc_is_verbatim() {
        let src = "<<<EOT\nline $not interpolated\nEOT;";
        assert_eq!(
            kinds(src),
            vec![Tok::Nowdoc("line $not interpolated".to_string()), Tok::Semi]
        );
    }

    #[test]
    fn line_numbers_advance() {
        let toks = tokenize("1\n\n2").unwrap();
        assert_eq!(toks[0].line, 1);
        assert_eq!(toks[1].line, 3);
    }
}
