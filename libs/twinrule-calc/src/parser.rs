//! Pratt parser for rule formulas
//!
//! ```text
//! expr    := prefix (infix expr)*
//! prefix  := '-' expr | '!' expr | postfix
//! postfix := atom ('.' IDENT)*
//! atom    := NUMBER | DURATION | STRING | '[' ref ']' | IDENT | IDENT '(' args ')' | '(' expr ')'
//! ```

use crate::ast::{BinaryOp, Expr, Function, Reference, UnaryOp};
use crate::error::{CalcError, Result};
use crate::lexer::{tokenize, Spanned, Token};

/// Parse a formula into an expression tree
pub fn parse(formula: &str) -> Result<Expr> {
    let tokens = tokenize(formula)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.expr(0)?;
    match parser.peek() {
        Token::Eof => Ok(expr),
        other => Err(CalcError::parse(
            parser.position(),
            format!("unexpected {:?} after expression", other),
        )),
    }
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

/// Prefix operators bind tighter than `*` but looser than `^`, so `-2^2 == -4`
const PREFIX_BP: u8 = 12;

fn infix_binding_power(token: &Token) -> Option<(BinaryOp, u8, u8)> {
    let (op, l, r) = match token {
        Token::Or => (BinaryOp::Or, 1, 2),
        Token::And => (BinaryOp::And, 3, 4),
        Token::Eq => (BinaryOp::Eq, 5, 6),
        Token::Ne => (BinaryOp::Ne, 5, 6),
        Token::Lt => (BinaryOp::Lt, 7, 8),
        Token::Le => (BinaryOp::Le, 7, 8),
        Token::Gt => (BinaryOp::Gt, 7, 8),
        Token::Ge => (BinaryOp::Ge, 7, 8),
        Token::Plus => (BinaryOp::Add, 9, 10),
        Token::Minus => (BinaryOp::Sub, 9, 10),
        Token::Star => (BinaryOp::Mul, 11, 12),
        Token::Slash => (BinaryOp::Div, 11, 12),
        Token::Percent => (BinaryOp::Rem, 11, 12),
        Token::Caret => (BinaryOp::Pow, 14, 13),
        _ => return None,
    };
    Some((op, l, r))
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)].token
    }

    fn position(&self) -> usize {
        self.tokens[self.pos.min(self.tokens.len() - 1)].position
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(CalcError::parse(
                self.position(),
                format!("expected {}, found {:?}", what, self.peek()),
            ))
        }
    }

    fn expr(&mut self, min_bp: u8) -> Result<Expr> {
        let mut left = self.prefix()?;

        while let Some((op, l_bp, r_bp)) = infix_binding_power(self.peek()) {
            if l_bp < min_bp {
                break;
            }
            self.advance();
            let right = self.expr(r_bp)?;
            left = Expr::binary(op, left, right);
        }

        Ok(left)
    }

    fn prefix(&mut self) -> Result<Expr> {
        match self.peek() {
            Token::Minus => {
                self.advance();
                let operand = self.expr(PREFIX_BP)?;
                Ok(match operand {
                    Expr::Number(n) => Expr::Number(-n),
                    Expr::Duration(d) => Expr::Duration(-d),
                    other => Expr::Unary {
                        op: UnaryOp::Neg,
                        operand: Box::new(other),
                    },
                })
            },
            Token::Not => {
                self.advance();
                let operand = self.expr(PREFIX_BP)?;
                Ok(Expr::Unary {
                    op: UnaryOp::Not,
                    operand: Box::new(operand),
                })
            },
            _ => self.postfix(),
        }
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.atom()?;
        while *self.peek() == Token::Dot {
            self.advance();
            let position = self.position();
            match self.advance() {
                Token::Ident(member) => {
                    expr = Expr::Member {
                        target: Box::new(expr),
                        member,
                    }
                },
                other => {
                    return Err(CalcError::parse(
                        position,
                        format!("expected member name after '.', found {:?}", other),
                    ))
                },
            }
        }
        Ok(expr)
    }

    fn atom(&mut self) -> Result<Expr> {
        let position = self.position();
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Duration(d) => Ok(Expr::Duration(d)),
            Token::Str(s) => Ok(Expr::Text(s)),
            Token::Bracket(inner) => Ok(Expr::Reference(Reference::parse(&inner))),
            Token::LParen => {
                let inner = self.expr(0)?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            },
            Token::Ident(name) => {
                if *self.peek() == Token::LParen {
                    return self.call(name, position);
                }
                Ok(match name.to_ascii_uppercase().as_str() {
                    "TRUE" => Expr::Bool(true),
                    "FALSE" => Expr::Bool(false),
                    "NOW" => Expr::Now,
                    "THIS" => Expr::This,
                    _ => Expr::Variable(name),
                })
            },
            Token::Eof => Err(CalcError::parse(position, "unexpected end of formula")),
            other => Err(CalcError::parse(position, format!("unexpected {:?}", other))),
        }
    }

    fn call(&mut self, name: String, position: usize) -> Result<Expr> {
        let function =
            Function::from_name(&name).ok_or_else(|| CalcError::UnknownFunction(name.clone()))?;
        self.expect(Token::LParen, "'('")?;

        let mut args = Vec::new();
        if *self.peek() != Token::RParen {
            loop {
                args.push(self.expr(0)?);
                if *self.peek() == Token::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "')'")?;

        let (min, max) = function.arity();
        if args.len() < min || args.len() > max {
            return Err(CalcError::parse(
                position,
                format!(
                    "{} takes {} argument(s), got {}",
                    function.name(),
                    if min == max {
                        min.to_string()
                    } else if max == usize::MAX {
                        format!("at least {}", min)
                    } else {
                        format!("{} to {}", min, max)
                    },
                    args.len()
                ),
            ));
        }

        Ok(Expr::call(function, args))
    }
}
