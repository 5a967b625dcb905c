use super::lexer::Token;
use super::SandboxError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BinOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(serde_json::Value),
    Name(String),
    List(Vec<Expr>),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// Recursive-descent parser with a nesting ceiling.
pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    max_depth: usize,
}

impl Parser {
    pub(crate) fn new(tokens: Vec<Token>, max_depth: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            max_depth,
        }
    }

    pub(crate) fn parse(mut self) -> Result<Expr, SandboxError> {
        if self.tokens.is_empty() {
            return Err(SandboxError::Syntax("empty expression".into()));
        }
        let expr = self.or()?;
        if let Some(tok) = self.peek() {
            return Err(SandboxError::Syntax(format!("unexpected token {:?}", tok)));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Token) -> Result<(), SandboxError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(SandboxError::Syntax(format!(
                "expected {:?}, found {:?}",
                tok,
                self.peek()
            )))
        }
    }

    fn enter(&mut self) -> Result<(), SandboxError> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(SandboxError::Limit(format!(
                "nesting deeper than {}",
                self.max_depth
            )));
        }
        Ok(())
    }

    fn or(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            let rhs = self.and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.not()?;
        while self.eat(&Token::And) {
            let rhs = self.not()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr, SandboxError> {
        if self.eat(&Token::Not) {
            self.enter()?;
            let inner = self.not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, SandboxError> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            Some(Token::In) => BinOp::In,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, SandboxError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, SandboxError> {
        if self.eat(&Token::Minus) {
            self.enter()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        if self.eat(&Token::Not) {
            self.enter()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, SandboxError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                match self.advance() {
                    Some(Token::Ident(name)) => expr = Expr::Member(Box::new(expr), name),
                    other => {
                        return Err(SandboxError::Syntax(format!(
                            "expected field name after '.', found {:?}",
                            other
                        )))
                    }
                }
            } else if self.eat(&Token::LBracket) {
                self.enter()?;
                let index = self.or()?;
                self.depth -= 1;
                self.expect(&Token::RBracket)?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, SandboxError> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(super::number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(serde_json::Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(serde_json::Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(serde_json::Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(serde_json::Value::Null)),
            Some(Token::Ident(name)) => {
                if self.eat(&Token::LParen) {
                    self.enter()?;
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.or()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(&Token::Comma)?;
                        }
                    }
                    self.depth -= 1;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Name(name))
                }
            }
            Some(Token::LParen) => {
                self.enter()?;
                let inner = self.or()?;
                self.depth -= 1;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                self.enter()?;
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.or()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(&Token::Comma)?;
                    }
                }
                self.depth -= 1;
                Ok(Expr::List(items))
            }
            other => Err(SandboxError::Syntax(format!("unexpected token {:?}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn parse(s: &str) -> Result<Expr, SandboxError> {
        Parser::new(tokenize(s).unwrap(), 16).parse()
    }

    #[test]
    fn test_precedence() {
        // a || b && c  ==  a || (b && c)
        match parse("a || b && c").unwrap() {
            Expr::Binary(BinOp::Or, _, rhs) => {
                assert!(matches!(*rhs, Expr::Binary(BinOp::And, _, _)))
            }
            other => panic!("unexpected {:?}", other),
        }
        // 1 + 2 * 3
        match parse("1 + 2 * 3").unwrap() {
            Expr::Binary(BinOp::Add, _, rhs) => {
                assert!(matches!(*rhs, Expr::Binary(BinOp::Mul, _, _)))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_member_index_call() {
        let e = parse("len(output.items[0].tags)").unwrap();
        match e {
            Expr::Call(name, args) => {
                assert_eq!(name, "len");
                assert!(matches!(args[0], Expr::Member(_, _)));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_syntax_errors() {
        assert!(parse("a ==").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("f(a,)").is_err());
        assert!(Parser::new(vec![], 4).parse().is_err());
    }

    #[test]
    fn test_depth_limit() {
        let deep = format!("{}1{}", "(".repeat(40), ")".repeat(40));
        assert!(matches!(parse(&deep), Err(SandboxError::Limit(_))));
    }
}
