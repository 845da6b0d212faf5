//! `FromStr` for `Program`: a logos lexer and an LL(1) recursive-descent
//! parser over the textual LIR format.

use std::collections::{BTreeMap as Map, BTreeSet as Set};
use std::ops::Range;
use std::str::FromStr;

use derive_more::Display;
use logos::Logos;

use super::*;

// SECTION: interface

impl FromStr for Program {
    type Err = ParseError;

    fn from_str(code: &str) -> Result<Self, ParseError> {
        let mut parser = Parser::new(code)?;
        program_r(&mut parser)
    }
}

/// A parse error with explanatory message.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub struct ParseError(pub String);
impl std::error::Error for ParseError {}

// SECTION: lexer

#[derive(Logos, Clone, Copy, Debug, PartialEq, Eq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
enum TokenKind {
    #[token("fn")]
    Fn,
    #[token("let")]
    Let,
    #[token("int")]
    IntTy,
    #[token("flt")]
    FltTy,
    #[token("vec")]
    VecTy,
    #[token("->")]
    Arrow,
    #[token("&")]
    Address,
    #[token("<")]
    LAngle,
    #[token(">")]
    RAngle,
    #[token(":")]
    Colon,
    #[token(",")]
    Comma,
    #[token("=")]
    Equal,
    #[token("_", priority = 10)]
    Underscore,
    #[token("(")]
    OpenParen,
    #[token(")")]
    CloseParen,
    #[token("{")]
    OpenBrace,
    #[token("}")]
    CloseBrace,
    #[token("$arith")]
    DollarArith,
    #[token("$cmp")]
    DollarCmp,
    #[token("$copy")]
    DollarCopy,
    #[token("$load")]
    DollarLoad,
    #[token("$store")]
    DollarStore,
    #[token("$gep")]
    DollarGep,
    #[token("$phi")]
    DollarPhi,
    #[token("$call_ext")]
    DollarCallExt,
    #[token("$branch")]
    DollarBranch,
    #[token("$jump")]
    DollarJump,
    #[token("$ret")]
    DollarRet,
    #[regex(r"[a-zA-Z_][a-zA-Z0-9_.]*")]
    Id,
    #[regex(r"-?[0-9]+")]
    IntLit,
    #[regex(r"-?[0-9]+\.[0-9]+", priority = 3)]
    FltLit,
    // not produced by logos; stands in for unlexable input.
    Unknown,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Clone, Debug)]
struct Token {
    kind: TokenKind,
    span: Range<usize>,
}

fn lex(code: &str) -> Vec<Token> {
    TokenKind::lexer(code)
        .spanned()
        .map(|(kind, span)| Token {
            kind: kind.unwrap_or(TokenKind::Unknown),
            span,
        })
        .collect()
}

// SECTION: parser functionality

#[derive(Clone, Debug)]
struct Parser<'a> {
    code: &'a str,      // the source code being parsed
    tokens: Vec<Token>, // the token stream
    pos: usize,         // the position in the token stream
    // variables declared by the function currently being parsed.
    scope: Map<String, Type>,
}

impl<'a> Parser<'a> {
    fn new(code: &'a str) -> Result<Self, ParseError> {
        let tokens = lex(code);
        if tokens.is_empty() {
            Err(ParseError("empty token stream".to_string()))
        } else {
            Ok(Parser {
                code,
                tokens,
                pos: 0,
                scope: Map::new(),
            })
        }
    }

    // if the next token has the given kind advances the iterator and returns
    // true, otherwise returns false.
    fn eat(&mut self, kind: TokenKind) -> bool {
        match self.peek() {
            Some(k) if k == kind => {
                self.next();
                true
            }
            _ => false,
        }
    }

    // returns an Ok or Err result depending on whether the next token has the
    // given kind, advancing the iterator on an Ok result.
    fn expect(&mut self, kind: TokenKind) -> Result<(), ParseError> {
        if self.eat(kind) {
            Ok(())
        } else {
            self.error_next(&format!("expected `{kind}`"))
        }
    }

    fn next(&mut self) -> Option<TokenKind> {
        if !self.end() {
            self.pos += 1;
            Some(self.tokens[self.pos - 1].kind)
        } else {
            None
        }
    }

    fn peek(&self) -> Option<TokenKind> {
        if !self.end() {
            Some(self.tokens[self.pos].kind)
        } else {
            None
        }
    }

    fn next_is(&self, kind: TokenKind) -> bool {
        self.peek() == Some(kind)
    }

    // returns the kind of the token after the next one, if any.
    fn peek2(&self) -> Option<TokenKind> {
        self.tokens.get(self.pos + 1).map(|t| t.kind)
    }

    fn end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    // returns the lexeme of the token immediately prior to the current token.
    fn slice_prev(&self) -> &str {
        &self.code[self.tokens[self.pos - 1].span.clone()]
    }

    // returns a parse error knowing that the next token to be inspected
    // causes an error.
    fn error_next<T>(&self, msg: &str) -> Result<T, ParseError> {
        if self.pos >= self.tokens.len() {
            Err(ParseError(format!(
                "parse error: unexpected end of input ({msg})\n"
            )))
        } else {
            self.error(self.pos, msg)
        }
    }

    // constructs a parse error given the position of the error-causing token
    // in the token stream.
    fn error<T>(&self, pos: usize, msg: &str) -> Result<T, ParseError> {
        let span = &self.tokens[pos].span;

        let (row, row_start) = {
            let mut row = 0;
            let mut row_start = 0;
            for (idx, _) in self.code.match_indices('\n') {
                if idx > span.start {
                    break;
                }
                row += 1;
                row_start = idx + 1;
            }
            (row, row_start)
        };
        let col = span.start - row_start;
        let line = self.code.lines().nth(row).unwrap_or("");

        Err(ParseError(format!(
            "parse error in line {row}, column {col}\n{line}\n{:width$}^\n{msg}\n",
            " ",
            width = col
        )))
    }

    // resolves an identifier against the current function's declarations.
    fn lookup_var(&self, name: &str) -> Result<VarId, ParseError> {
        match self.scope.get(name) {
            Some(typ) => Ok(var_id(name, typ.clone())),
            None => self.error(self.pos - 1, &format!("undeclared variable `{name}`")),
        }
    }
}

// SECTION: parsing functions

use TokenKind::*;

fn program_r(parser: &mut Parser) -> Result<Program, ParseError> {
    let mut functions = Map::new();
    while !parser.end() {
        let f = function_r(parser)?;
        functions.insert(f.id.clone(), f);
    }
    Ok(Program { functions })
}

fn function_r(parser: &mut Parser) -> Result<Function, ParseError> {
    parser.expect(Fn)?;
    parser.expect(Id)?;
    let id = func_id(parser.slice_prev());
    parser.scope = Map::new();

    parser.expect(OpenParen)?;
    let mut params = vec![];
    if !parser.next_is(CloseParen) {
        loop {
            parser.expect(Id)?;
            let name = parser.slice_prev().to_string();
            parser.expect(Colon)?;
            let typ = type_r(parser)?;
            parser.scope.insert(name.clone(), typ.clone());
            params.push(var_id(&name, typ));
            if !parser.eat(Comma) {
                break;
            }
        }
    }
    parser.expect(CloseParen)?;

    parser.expect(Arrow)?;
    let ret_ty = if parser.eat(Underscore) {
        None
    } else {
        Some(type_r(parser)?)
    };

    parser.expect(OpenBrace)?;

    let mut locals = Set::new();
    while parser.eat(Let) {
        loop {
            parser.expect(Id)?;
            let name = parser.slice_prev().to_string();
            parser.expect(Colon)?;
            let typ = type_r(parser)?;
            parser.scope.insert(name.clone(), typ.clone());
            locals.insert(var_id(&name, typ));
            if !parser.eat(Comma) {
                break;
            }
        }
    }

    let mut body = Map::new();
    while !parser.eat(CloseBrace) {
        let bb = block_r(parser)?;
        body.insert(bb.id.clone(), bb);
    }

    Ok(Function {
        id,
        params,
        ret_ty,
        locals,
        body,
    })
}

// type.
fn type_r(parser: &mut Parser) -> Result<Type, ParseError> {
    if parser.eat(Address) {
        Ok(ptr_ty(type_r(parser)?))
    } else if parser.eat(IntTy) {
        Ok(int_ty())
    } else if parser.eat(FltTy) {
        Ok(flt_ty())
    } else if parser.eat(VecTy) {
        parser.expect(LAngle)?;
        let elem = type_r(parser)?;
        parser.expect(Comma)?;
        parser.expect(IntLit)?;
        let lanes = parser
            .slice_prev()
            .parse::<usize>()
            .map_err(|e| ParseError(format!("bad lane count: {e}")))?;
        parser.expect(RAngle)?;
        Ok(vec_ty(elem, lanes))
    } else {
        parser.error_next("expected a type")
    }
}

fn block_r(parser: &mut Parser) -> Result<BasicBlock, ParseError> {
    parser.expect(Id)?;
    let id = bb_id(parser.slice_prev());
    parser.expect(Colon)?;

    let mut insts = vec![];
    loop {
        match parser.peek() {
            Some(DollarBranch) | Some(DollarJump) | Some(DollarRet) => break,
            Some(_) => insts.push(inst_r(parser)?),
            None => return parser.error_next("unterminated basic block"),
        }
    }
    let term = term_r(parser)?;

    Ok(BasicBlock { id, insts, term })
}

fn inst_r(parser: &mut Parser) -> Result<Instruction, ParseError> {
    // `x = $...` or a lhs-less `$store` / `$call_ext`.
    let lhs = if parser.next_is(Id) && parser.peek2() == Some(Equal) {
        parser.expect(Id)?;
        let v = parser.lookup_var(parser.slice_prev())?;
        parser.expect(Equal)?;
        Some(v)
    } else {
        None
    };

    let require_lhs = |lhs: Option<VarId>, parser: &Parser| match lhs {
        Some(v) => Ok(v),
        None => parser.error_next("this instruction requires a left-hand side"),
    };

    if parser.eat(DollarArith) {
        parser.expect(Id)?;
        let aop = match parser.slice_prev() {
            "add" => Aop::Add,
            "sub" => Aop::Sub,
            "mul" => Aop::Mul,
            "div" => Aop::Div,
            "xor" => Aop::Xor,
            "fadd" => Aop::FAdd,
            "fsub" => Aop::FSub,
            "fmul" => Aop::FMul,
            other => return parser.error(parser.pos - 1, &format!("unknown aop `{other}`")),
        };
        let op1 = operand_r(parser)?;
        let op2 = operand_r(parser)?;
        Ok(Instruction::Arith {
            lhs: require_lhs(lhs, parser)?,
            aop,
            op1,
            op2,
        })
    } else if parser.eat(DollarCmp) {
        parser.expect(Id)?;
        let rop = match parser.slice_prev() {
            "eq" => Rop::Eq,
            "neq" => Rop::Neq,
            "lt" => Rop::Lt,
            "lte" => Rop::Lte,
            "gt" => Rop::Gt,
            "gte" => Rop::Gte,
            "fone" => Rop::Fone,
            other => return parser.error(parser.pos - 1, &format!("unknown rop `{other}`")),
        };
        let op1 = operand_r(parser)?;
        let op2 = operand_r(parser)?;
        Ok(Instruction::Cmp {
            lhs: require_lhs(lhs, parser)?,
            rop,
            op1,
            op2,
        })
    } else if parser.eat(DollarCopy) {
        let op = operand_r(parser)?;
        Ok(Instruction::Copy {
            lhs: require_lhs(lhs, parser)?,
            op,
        })
    } else if parser.eat(DollarLoad) {
        parser.expect(Id)?;
        let src = parser.lookup_var(parser.slice_prev())?;
        Ok(Instruction::Load {
            lhs: require_lhs(lhs, parser)?,
            src,
        })
    } else if parser.eat(DollarStore) {
        if lhs.is_some() {
            return parser.error_next("$store does not produce a value");
        }
        parser.expect(Id)?;
        let dst = parser.lookup_var(parser.slice_prev())?;
        let op = operand_r(parser)?;
        Ok(Instruction::Store { dst, op })
    } else if parser.eat(DollarGep) {
        parser.expect(Id)?;
        let src = parser.lookup_var(parser.slice_prev())?;
        let idx = operand_r(parser)?;
        Ok(Instruction::Gep {
            lhs: require_lhs(lhs, parser)?,
            src,
            idx,
        })
    } else if parser.eat(DollarPhi) {
        parser.expect(OpenParen)?;
        let mut ops = vec![];
        if !parser.next_is(CloseParen) {
            loop {
                ops.push(operand_r(parser)?);
                if !parser.eat(Comma) {
                    break;
                }
            }
        }
        parser.expect(CloseParen)?;
        Ok(Instruction::Phi {
            lhs: require_lhs(lhs, parser)?,
            ops,
        })
    } else if parser.eat(DollarCallExt) {
        parser.expect(Id)?;
        let ext_callee = parser.slice_prev().to_string();
        parser.expect(OpenParen)?;
        let mut args = vec![];
        if !parser.next_is(CloseParen) {
            loop {
                args.push(operand_r(parser)?);
                if !parser.eat(Comma) {
                    break;
                }
            }
        }
        parser.expect(CloseParen)?;
        Ok(Instruction::CallExt {
            lhs,
            ext_callee,
            args,
        })
    } else {
        parser.error_next("expected an instruction")
    }
}

fn term_r(parser: &mut Parser) -> Result<Terminal, ParseError> {
    if parser.eat(DollarBranch) {
        let cond = operand_r(parser)?;
        parser.expect(Id)?;
        let tt = bb_id(parser.slice_prev());
        parser.expect(Id)?;
        let ff = bb_id(parser.slice_prev());
        Ok(Terminal::Branch { cond, tt, ff })
    } else if parser.eat(DollarJump) {
        parser.expect(Id)?;
        Ok(Terminal::Jump(bb_id(parser.slice_prev())))
    } else if parser.eat(DollarRet) {
        // an identifier followed by `:` is the next block's label, not a
        // return operand.
        match parser.peek() {
            Some(Id) if parser.peek2() != Some(Colon) => {
                Ok(Terminal::Ret(Some(operand_r(parser)?)))
            }
            Some(IntLit) | Some(FltLit) => Ok(Terminal::Ret(Some(operand_r(parser)?))),
            _ => Ok(Terminal::Ret(None)),
        }
    } else {
        parser.error_next("expected a terminal")
    }
}

fn operand_r(parser: &mut Parser) -> Result<Operand, ParseError> {
    if parser.eat(FltLit) {
        let x = parser
            .slice_prev()
            .parse::<f64>()
            .map_err(|e| ParseError(format!("bad float literal: {e}")))?;
        Ok(Operand::CFlt(x))
    } else if parser.eat(IntLit) {
        let n = parser
            .slice_prev()
            .parse::<i64>()
            .map_err(|e| ParseError(format!("bad int literal: {e}")))?;
        Ok(Operand::CInt(n))
    } else if parser.eat(Id) {
        Ok(Operand::Var(parser.lookup_var(parser.slice_prev())?))
    } else {
        parser.error_next("expected an operand")
    }
}
