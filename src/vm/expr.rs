//! A small expression-language backend implementing the [`VmBackend`]
//! contract.
//!
//! This is the reference VM the crate ships with: assignment statements over
//! `in<N>`/`out<N>` channel variables, `srate`, named parameters, numeric
//! literals and `+ - * /` arithmetic. `@init` runs once at compile time on the
//! non-real-time thread, `@block` runs once per processed block, `@sample`
//! runs once per frame. Variables are interned to dense cell indices during
//! compilation so that `process()` performs no hashing or allocation.

use std::collections::HashMap;

use log::error;

use super::{DspVm, VmBackend, VmSpec};
use crate::error::CompileError;
use crate::script::ScriptRecord;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Plus,
    Minus,
    Star,
    Slash,
    Assign,
    LParen,
    RParen,
    Semi,
}

fn lex(source: &str) -> Result<Vec<Token>, CompileError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            // Newlines terminate statements just like semicolons do
            '\n' | ';' => {
                chars.next();
                tokens.push(Token::Semi);
            }
            '/' => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    while let Some(&c) = chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        chars.next();
                    }
                } else {
                    tokens.push(Token::Slash);
                }
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '=' => {
                chars.next();
                tokens.push(Token::Assign);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            c if c.is_ascii_digit() || c == '.' => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() || c == '.' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = text
                    .parse::<f64>()
                    .map_err(|_| CompileError(format!("malformed number \"{text}\"")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(name));
            }
            other => return Err(CompileError(format!("unexpected character {other:?}"))),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone)]
enum Expr {
    Const(f64),
    Cell(usize),
    Neg(Box<Expr>),
    Bin(BinOp, Box<Expr>, Box<Expr>),
}

/// One statement: an assignment into a cell, or a bare expression whose value
/// is discarded.
#[derive(Debug, Clone)]
struct Stmt {
    target: Option<usize>,
    value: Expr,
}

/// Interning table mapping variable names to cell indices. Cells start at 0.0.
#[derive(Debug, Default)]
struct CellTable {
    names: HashMap<String, usize>,
    values: Vec<f64>,
}

impl CellTable {
    fn intern(&mut self, name: &str) -> usize {
        if let Some(&cell) = self.names.get(name) {
            return cell;
        }
        let cell = self.values.len();
        self.values.push(0.0);
        self.names.insert(name.to_owned(), cell);
        cell
    }
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    cells: &'a mut CellTable,
}

impl<'a> Parser<'a> {
    fn new(source: &str, cells: &'a mut CellTable) -> Result<Self, CompileError> {
        Ok(Self {
            tokens: lex(source)?,
            pos: 0,
            cells,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn program(&mut self) -> Result<Vec<Stmt>, CompileError> {
        let mut stmts = Vec::new();
        loop {
            while self.peek() == Some(&Token::Semi) {
                self.pos += 1;
            }
            if self.peek().is_none() {
                return Ok(stmts);
            }
            stmts.push(self.statement()?);
            match self.advance() {
                Some(Token::Semi) | None => {}
                Some(token) => {
                    return Err(CompileError(format!(
                        "expected end of statement, found {token:?}"
                    )))
                }
            }
        }
    }

    fn statement(&mut self) -> Result<Stmt, CompileError> {
        // `ident =` starts an assignment, anything else is a bare expression
        if let Some(Token::Ident(name)) = self.tokens.get(self.pos) {
            if self.tokens.get(self.pos + 1) == Some(&Token::Assign) {
                let name = name.clone();
                self.pos += 2;
                let target = self.cells.intern(&name);
                let value = self.expr()?;
                return Ok(Stmt {
                    target: Some(target),
                    value,
                });
            }
        }
        let value = self.expr()?;
        Ok(Stmt {
            target: None,
            value,
        })
    }

    fn expr(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, CompileError> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.factor()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn factor(&mut self) -> Result<Expr, CompileError> {
        match self.advance() {
            Some(Token::Number(value)) => Ok(Expr::Const(value)),
            Some(Token::Ident(name)) => Ok(Expr::Cell(self.cells.intern(&name))),
            Some(Token::Minus) => Ok(Expr::Neg(Box::new(self.factor()?))),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(CompileError("expected closing parenthesis".to_owned())),
                }
            }
            Some(token) => Err(CompileError(format!("unexpected token {token:?}"))),
            None => Err(CompileError("unexpected end of script".to_owned())),
        }
    }
}

fn compile_section(source: &str, cells: &mut CellTable) -> Result<Vec<Stmt>, CompileError> {
    Parser::new(source, cells)?.program()
}

fn eval(expr: &Expr, cells: &[f64]) -> f64 {
    match expr {
        Expr::Const(value) => *value,
        Expr::Cell(cell) => cells[*cell],
        Expr::Neg(inner) => -eval(inner, cells),
        Expr::Bin(op, lhs, rhs) => {
            let lhs = eval(lhs, cells);
            let rhs = eval(rhs, cells);
            match op {
                BinOp::Add => lhs + rhs,
                BinOp::Sub => lhs - rhs,
                BinOp::Mul => lhs * rhs,
                BinOp::Div => lhs / rhs,
            }
        }
    }
}

fn run(stmts: &[Stmt], cells: &mut [f64]) {
    for stmt in stmts {
        let value = eval(&stmt.value, cells);
        if let Some(target) = stmt.target {
            cells[target] = value;
        }
    }
}

/// A compiled expression script.
struct ExprVm {
    cells: Vec<f64>,
    block: Vec<Stmt>,
    sample: Vec<Stmt>,
    /// Cell index of `in<N>` for each input channel.
    input_cells: Vec<usize>,
    /// Cell index of `out<N>` for each output channel.
    output_cells: Vec<usize>,
    /// Cell index for each unit parameter slot, `None` for null bindings.
    param_cells: Vec<Option<usize>>,
}

impl DspVm for ExprVm {
    fn process(&mut self, inputs: &[&[f32]], outputs: &mut [&mut [f32]], params: &[f32]) {
        for (slot, cell) in self.param_cells.iter().enumerate() {
            if let Some(cell) = cell {
                self.cells[*cell] = f64::from(params.get(slot).copied().unwrap_or(0.0));
            }
        }

        run(&self.block, &mut self.cells);

        let num_samples = outputs.first().map_or(0, |channel| channel.len());
        for frame in 0..num_samples {
            for (channel, cell) in self.input_cells.iter().enumerate() {
                self.cells[*cell] = inputs
                    .get(channel)
                    .map_or(0.0, |buffer| f64::from(buffer[frame]));
            }
            run(&self.sample, &mut self.cells);
            for (channel, cell) in self.output_cells.iter().enumerate() {
                if let Some(buffer) = outputs.get_mut(channel) {
                    buffer[frame] = self.cells[*cell] as f32;
                }
            }
        }
    }
}

/// The backend constructing [`ExprVm`] instances.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExprBackend;

impl VmBackend for ExprBackend {
    fn compile(
        &self,
        script: &ScriptRecord,
        param_indices: &[i32],
        spec: &VmSpec,
    ) -> Result<Box<dyn DspVm>, CompileError> {
        let mut cells = CellTable::default();

        let srate_cell = cells.intern("srate");
        let input_cells: Vec<usize> = (0..spec.num_inputs)
            .map(|channel| cells.intern(&format!("in{channel}")))
            .collect();
        let output_cells: Vec<usize> = (0..spec.num_outputs)
            .map(|channel| cells.intern(&format!("out{channel}")))
            .collect();

        let param_cells: Vec<Option<usize>> = param_indices
            .iter()
            .map(|&index| {
                match usize::try_from(index)
                    .ok()
                    .and_then(|index| script.parameter_name(index))
                {
                    Some(name) => Some(cells.intern(name)),
                    None => {
                        error!(
                            "parameter index {index} is out of range, compiling with a null \
                             binding"
                        );
                        None
                    }
                }
            })
            .collect();

        let sections = script.sections();
        let init = compile_section(sections.init.as_deref().unwrap_or(""), &mut cells)?;
        let block = compile_section(sections.block.as_deref().unwrap_or(""), &mut cells)?;
        let sample = compile_section(&sections.sample, &mut cells)?;

        let mut values = cells.values;
        values[srate_cell] = spec.sample_rate;
        // The init section runs exactly once, here on the compiling thread
        run(&init, &mut values);

        Ok(Box::new(ExprVm {
            cells: values,
            block,
            sample,
            input_cells,
            output_cells,
            param_cells,
        }))
    }
}
