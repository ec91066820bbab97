use crate::frontend::lexer::Spanned;
use crate::frontend::token::Token;

pub struct TokenDumper {
    pub color: bool,
    pub show_debug_repr: bool, // if false, prints the source spelling of each token
}

impl Default for TokenDumper {
    fn default() -> Self {
        Self {
            color: true,
            show_debug_repr: true,
        }
    }
}

impl TokenDumper {
    // ANSI colors
    const RESET: &'static str = "\x1b[0m";
    const DIM: &'static str = "\x1b[2m";
    const GRN: &'static str = "\x1b[32m";
    const YEL: &'static str = "\x1b[33m";
    const CYN: &'static str = "\x1b[36m";
    const MAG: &'static str = "\x1b[35m";
    const BLU: &'static str = "\x1b[34m";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn no_color(mut self) -> Self {
        self.color = false;
        self
    }

    pub fn pretty(mut self) -> Self {
        self.show_debug_repr = false;
        self
    }

    pub fn dump(&self, tokens: &[Spanned]) {
        print!("{}", self.render(tokens));
    }

    /// One line per token: index, position, line indentation, kind, token.
    pub fn render(&self, tokens: &[Spanned]) -> String {
        let mut out = String::new();
        for (i, s) in tokens.iter().enumerate() {
            let kind = self.kind(&s.token);
            let colr = if self.color { self.color(&s.token) } else { "" };
            let reset = if self.color { Self::RESET } else { "" };

            let shown = if self.show_debug_repr {
                format!("{:?}", s.token)
            } else {
                s.token.to_string()
            };

            out.push_str(&format!(
                "[{:3}] {:02}:{:02} >{:<3} {}{:<8} {}{}\n",
                i, s.span.line, s.span.col, s.span.indent, colr, kind, shown, reset
            ));
        }
        out
    }

    fn kind(&self, t: &Token) -> &'static str {
        use Token::*;
        match t {
            Eof => "EOF",

            // literals
            Int(_) => "INT",
            Float(_) => "FLOAT",
            Char(_) => "CHAR",
            Str(_) => "STRING",
            True | False => "BOOL",
            Nil => "NIL",

            // names
            Ident(_) => "IDENT",

            // structure
            LParen | RParen => "PAREN",
            LBracket | RBracket => "BRACKET",
            LBrace | RBrace => "BRACE",
            Dot | Comma | Colon | Semicolon | Backslash | Arrow | LArrow | Ellipsis => "PUNCT",

            // ops / comparisons
            Plus | Minus | Star | Slash | Percent | Amp | Pipe | Bang => "OP",
            PlusEq | MinusEq | StarEq | SlashEq | PercentEq | Assign => "ASSIGN",
            EqEq | NotEq | Lt | LtEq | Gt | GtEq => "CMP",

            // everything else is a keyword
            _ => "KEYWORD",
        }
    }

    fn color(&self, t: &Token) -> &'static str {
        use Token::*;
        match t {
            Eof => Self::DIM,
            Str(_) | Char(_) => Self::GRN,
            Int(_) | Float(_) | True | False | Nil => Self::CYN,
            Ident(_) => Self::YEL,
            Plus | Minus | Star | Slash | Percent | Amp | Pipe | Bang => Self::MAG,
            EqEq | NotEq | Lt | LtEq | Gt | GtEq => Self::MAG,
            Def | Ret | For | Aop | If | Ef | Nf | New | Out | Go | Use => Self::BLU,
            _ => Self::RESET,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;

    #[test]
    fn test_render_plain() {
        let tokens = Lexer::new("x int = 5").tokenize().unwrap();
        let out = TokenDumper::new().no_color().pretty().render(&tokens);
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(lines.len(), 5);
        assert!(lines[0].contains("IDENT"));
        assert!(lines[2].contains("ASSIGN"));
        assert!(lines[3].ends_with("5"));
        assert!(lines[4].contains("EOF"));
        assert!(!out.contains("\x1b["));
    }

    #[test]
    fn test_render_debug_repr_with_color() {
        let tokens = Lexer::new("def").tokenize().unwrap();
        let out = TokenDumper::new().render(&tokens);
        assert!(out.contains("Def"));
        assert!(out.contains("KEYWORD"));
        assert!(out.contains("\x1b[34m"));
    }
}
