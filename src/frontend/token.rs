#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Int(i64),
    Float(f64),
    Char(char),
    Str(std::string::String),
    True,
    False,
    Nil,

    // Identifier (names and type names)
    Ident(std::string::String),

    // Arithmetic
    Plus,
    Minus,
    Star,
    Slash,
    Percent,

    // Compound assignment
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    PercentEq,

    // Comparison
    EqEq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,

    // Logic
    Amp,
    Pipe,
    Bang,

    // Punctuation
    Assign,
    Arrow,    // ->
    LArrow,   // <-
    Ellipsis, // ...
    Dot,
    Comma,
    Colon,
    Semicolon,
    Backslash,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,

    // Keywords
    Def,
    Ret,
    For,
    Aop,
    If,
    Ef,
    Nf,
    New,
    Out,
    Go,
    Use,

    // Special
    Eof,
}

impl Token {
    /// Keyword lookup for an identifier-shaped word.
    pub fn keyword(word: &str) -> Option<Token> {
        let token = match word {
            "def" => Token::Def,
            "ret" => Token::Ret,
            "for" => Token::For,
            "aop" => Token::Aop,
            "if" => Token::If,
            "ef" => Token::Ef,
            "nf" => Token::Nf,
            "new" => Token::New,
            "out" => Token::Out,
            "go" => Token::Go,
            "use" => Token::Use,
            "true" => Token::True,
            "false" => Token::False,
            "nil" => Token::Nil,
            _ => return None,
        };
        Some(token)
    }

    /// Returns true for the five compound assignment operators
    pub fn is_compound_assign(&self) -> bool {
        matches!(
            self,
            Token::PlusEq | Token::MinusEq | Token::StarEq | Token::SlashEq | Token::PercentEq
        )
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Int(n) => write!(f, "{}", n),
            Token::Float(n) => write!(f, "{}", n),
            Token::Char(c) => write!(f, "'{}'", c),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Nil => write!(f, "nil"),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::PlusEq => write!(f, "+="),
            Token::MinusEq => write!(f, "-="),
            Token::StarEq => write!(f, "*="),
            Token::SlashEq => write!(f, "/="),
            Token::PercentEq => write!(f, "%="),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::LtEq => write!(f, "<="),
            Token::GtEq => write!(f, ">="),
            Token::Amp => write!(f, "&"),
            Token::Pipe => write!(f, "|"),
            Token::Bang => write!(f, "!"),
            Token::Assign => write!(f, "="),
            Token::Arrow => write!(f, "->"),
            Token::LArrow => write!(f, "<-"),
            Token::Ellipsis => write!(f, "..."),
            Token::Dot => write!(f, "."),
            Token::Comma => write!(f, ","),
            Token::Colon => write!(f, ":"),
            Token::Semicolon => write!(f, ";"),
            Token::Backslash => write!(f, "\\"),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::Def => write!(f, "def"),
            Token::Ret => write!(f, "ret"),
            Token::For => write!(f, "for"),
            Token::Aop => write!(f, "aop"),
            Token::If => write!(f, "if"),
            Token::Ef => write!(f, "ef"),
            Token::Nf => write!(f, "nf"),
            Token::New => write!(f, "new"),
            Token::Out => write!(f, "out"),
            Token::Go => write!(f, "go"),
            Token::Use => write!(f, "use"),
            Token::Eof => write!(f, "EOF"),
        }
    }
}
