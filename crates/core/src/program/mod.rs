//! Per-pixel image program.
//!
//! A program is a list of `name = expression;` statements evaluated in order
//! for every canvas pixel. It must assign `r`, `g` and `b`; their values are
//! clamped to `[0, 1]` after evaluation, with NaN mapped to 0.
//!
//! ```text
//! band = spectrum(x);
//! r = step(y, band);
//! g = 0.2 * r;
//! b = 1 - r;
//! ```
//!
//! All name resolution, arity checks and syntax errors surface from
//! [`Program::compile`]; evaluation itself cannot fail.

use std::collections::HashMap;
use std::f32::consts::PI;

use crate::{inputs::InputFrame, LedWallError, Result};

/// Deepest expression nesting a program may use.
pub const MAX_DEPTH: usize = 256;

/// Per-pixel evaluation environment.
#[derive(Debug, Clone, Copy)]
pub struct PixelEnv<'a> {
    pub frame: &'a InputFrame,
    /// Normalized pixel centre, `y = 0` at the bottom.
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Var {
    X,
    Y,
    Width,
    Height,
    Time,
    MouseX,
    MouseY,
    LastBeat,
    LastMouse,
    Progress,
    Playing,
    Pi,
}

impl Var {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "x" => Self::X,
            "y" => Self::Y,
            "width" => Self::Width,
            "height" => Self::Height,
            "time" => Self::Time,
            "mouse_x" => Self::MouseX,
            "mouse_y" => Self::MouseY,
            "last_beat" => Self::LastBeat,
            "last_mouse" => Self::LastMouse,
            "progress" => Self::Progress,
            "playing" => Self::Playing,
            "pi" => Self::Pi,
            _ => return None,
        })
    }

    fn value(self, env: &PixelEnv<'_>) -> f32 {
        match self {
            Self::X => env.x,
            Self::Y => env.y,
            Self::Width => env.width,
            Self::Height => env.height,
            Self::Time => env.frame.time_ms,
            Self::MouseX => env.frame.mouse[0],
            Self::MouseY => env.frame.mouse[1],
            Self::LastBeat => env.frame.last_beat_ms,
            Self::LastMouse => env.frame.last_mouse_ms,
            Self::Progress => env.frame.progress,
            Self::Playing => {
                if env.frame.playing {
                    1.0
                } else {
                    0.0
                }
            }
            Self::Pi => PI,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Func {
    Sin,
    Cos,
    Tan,
    Abs,
    Floor,
    Ceil,
    Fract,
    Sqrt,
    Exp,
    Log,
    Sign,
    Pow,
    Min,
    Max,
    Atan2,
    Mod,
    Step,
    Clamp,
    Mix,
    Smoothstep,
    Spectrum,
    ArtR,
    ArtG,
    ArtB,
}

impl Func {
    fn lookup(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Self::Sin,
            "cos" => Self::Cos,
            "tan" => Self::Tan,
            "abs" => Self::Abs,
            "floor" => Self::Floor,
            "ceil" => Self::Ceil,
            "fract" => Self::Fract,
            "sqrt" => Self::Sqrt,
            "exp" => Self::Exp,
            "log" => Self::Log,
            "sign" => Self::Sign,
            "pow" => Self::Pow,
            "min" => Self::Min,
            "max" => Self::Max,
            "atan2" => Self::Atan2,
            "mod" => Self::Mod,
            "step" => Self::Step,
            "clamp" => Self::Clamp,
            "mix" => Self::Mix,
            "smoothstep" => Self::Smoothstep,
            "spectrum" => Self::Spectrum,
            "art_r" => Self::ArtR,
            "art_g" => Self::ArtG,
            "art_b" => Self::ArtB,
            _ => return None,
        })
    }

    fn arity(self) -> usize {
        match self {
            Self::Pow | Self::Min | Self::Max | Self::Atan2 | Self::Mod | Self::Step => 2,
            Self::ArtR | Self::ArtG | Self::ArtB => 2,
            Self::Clamp | Self::Mix | Self::Smoothstep => 3,
            _ => 1,
        }
    }

    fn apply(self, args: &[f32], env: &PixelEnv<'_>) -> f32 {
        let a = args[0];
        match self {
            Self::Sin => a.sin(),
            Self::Cos => a.cos(),
            Self::Tan => a.tan(),
            Self::Abs => a.abs(),
            Self::Floor => a.floor(),
            Self::Ceil => a.ceil(),
            Self::Fract => a - a.floor(),
            Self::Sqrt => a.sqrt(),
            Self::Exp => a.exp(),
            Self::Log => a.ln(),
            Self::Sign => {
                if a > 0.0 {
                    1.0
                } else if a < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            Self::Pow => a.powf(args[1]),
            Self::Min => a.min(args[1]),
            Self::Max => a.max(args[1]),
            Self::Atan2 => a.atan2(args[1]),
            Self::Mod => glsl_mod(a, args[1]),
            Self::Step => {
                if args[1] < a {
                    0.0
                } else {
                    1.0
                }
            }
            Self::Clamp => a.max(args[1]).min(args[2]),
            Self::Mix => a + (args[1] - a) * args[2],
            Self::Smoothstep => {
                let t = ((args[2] - a) / (args[1] - a)).clamp(0.0, 1.0);
                t * t * (3.0 - 2.0 * t)
            }
            Self::Spectrum => env.frame.sample_spectrum(a),
            Self::ArtR => env.frame.sample_art(a, args[1])[0],
            Self::ArtG => env.frame.sample_art(a, args[1])[1],
            Self::ArtB => env.frame.sample_art(a, args[1])[2],
        }
    }
}

fn glsl_mod(a: f32, b: f32) -> f32 {
    a - b * (a / b).floor()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Pow,
    Lt,
    Gt,
    Le,
    Ge,
}

impl BinOp {
    fn apply(self, a: f32, b: f32) -> f32 {
        let truth = |cond: bool| if cond { 1.0 } else { 0.0 };
        match self {
            Self::Add => a + b,
            Self::Sub => a - b,
            Self::Mul => a * b,
            Self::Div => a / b,
            Self::Rem => glsl_mod(a, b),
            Self::Pow => a.powf(b),
            Self::Lt => truth(a < b),
            Self::Gt => truth(a > b),
            Self::Le => truth(a <= b),
            Self::Ge => truth(a >= b),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Const(f32),
    Var(Var),
    Local(usize),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

impl Expr {
    /// Height of the expression tree. Only called on trees whose subtrees
    /// were already checked against [`MAX_DEPTH`].
    fn depth(&self) -> usize {
        match self {
            Self::Const(_) | Self::Var(_) | Self::Local(_) => 1,
            Self::Neg(inner) => 1 + inner.depth(),
            Self::Binary(_, lhs, rhs) => 1 + lhs.depth().max(rhs.depth()),
            Self::Call(_, args) => 1 + args.iter().map(Self::depth).max().unwrap_or(0),
        }
    }

    fn eval(&self, env: &PixelEnv<'_>, locals: &[f32]) -> f32 {
        match self {
            Self::Const(value) => *value,
            Self::Var(var) => var.value(env),
            Self::Local(slot) => locals[*slot],
            Self::Neg(inner) => -inner.eval(env, locals),
            Self::Binary(op, lhs, rhs) => op.apply(lhs.eval(env, locals), rhs.eval(env, locals)),
            Self::Call(func, args) => {
                let mut values = [0.0f32; 3];
                for (value, arg) in values.iter_mut().zip(args) {
                    *value = arg.eval(env, locals);
                }
                func.apply(&values[..args.len()], env)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f32),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    Semi,
    Assign,
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;
        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'0'..=b'9' | b'.' => {
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
                    i += 1;
                    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
                        i += 1;
                    }
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text = &source[start..i];
                let value = text
                    .parse::<f32>()
                    .map_err(|_| LedWallError::build(start, format!("invalid number `{text}`")))?;
                tokens.push((start, Token::Number(value)));
            }
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                tokens.push((start, Token::Ident(source[start..i].to_string())));
            }
            b'(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            b')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            b',' => {
                tokens.push((start, Token::Comma));
                i += 1;
            }
            b';' => {
                tokens.push((start, Token::Semi));
                i += 1;
            }
            b'<' | b'>' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push((start, Token::Op(if c == b'<' { "<=" } else { ">=" })));
                i += 2;
            }
            b'=' => {
                tokens.push((start, Token::Assign));
                i += 1;
            }
            b'+' | b'-' | b'*' | b'/' | b'%' | b'^' | b'<' | b'>' => {
                let op = match c {
                    b'+' => "+",
                    b'-' => "-",
                    b'*' => "*",
                    b'/' => "/",
                    b'%' => "%",
                    b'^' => "^",
                    b'<' => "<",
                    _ => ">",
                };
                tokens.push((start, Token::Op(op)));
                i += 1;
            }
            _ => {
                let ch = source[start..].chars().next().unwrap_or('?');
                return Err(LedWallError::build(start, format!("unexpected character `{ch}`")));
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [(usize, Token)],
    pos: usize,
    end: usize,
    locals: &'a HashMap<String, usize>,
    nesting: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos).map(|(_, token)| token)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(offset, _)| *offset)
            .unwrap_or(self.end)
    }

    fn next(&mut self) -> Option<&'a Token> {
        let token = self.peek();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                self.pos += 1;
                Some(*op)
            }
            _ => None,
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<()> {
        let offset = self.offset();
        match self.next() {
            Some(token) if *token == expected => Ok(()),
            Some(token) => Err(LedWallError::build(
                offset,
                format!("expected {what}, found {token:?}"),
            )),
            None => Err(LedWallError::build(offset, format!("expected {what}, found end of input"))),
        }
    }

    /// Rejects trees too deep to evaluate on a render thread's stack.
    fn node(&self, offset: usize, expr: Expr) -> Result<Expr> {
        if expr.depth() > MAX_DEPTH {
            return Err(LedWallError::build(offset, "expression nested too deeply"));
        }
        Ok(expr)
    }

    fn expression(&mut self) -> Result<Expr> {
        let offset = self.offset();
        let lhs = self.additive()?;
        let op = match self.eat_op(&["<", ">", "<=", ">="]) {
            Some("<") => BinOp::Lt,
            Some(">") => BinOp::Gt,
            Some("<=") => BinOp::Le,
            Some(_) => BinOp::Ge,
            None => return Ok(lhs),
        };
        let rhs = self.additive()?;
        self.node(offset, Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Expr> {
        let offset = self.offset();
        let mut lhs = self.term()?;
        while let Some(op) = self.eat_op(&["+", "-"]) {
            let rhs = self.term()?;
            let op = if op == "+" { BinOp::Add } else { BinOp::Sub };
            lhs = self.node(offset, Expr::Binary(op, Box::new(lhs), Box::new(rhs)))?;
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr> {
        let offset = self.offset();
        let mut lhs = self.unary()?;
        while let Some(op) = self.eat_op(&["*", "/", "%"]) {
            let rhs = self.unary()?;
            let op = match op {
                "*" => BinOp::Mul,
                "/" => BinOp::Div,
                _ => BinOp::Rem,
            };
            lhs = self.node(offset, Expr::Binary(op, Box::new(lhs), Box::new(rhs)))?;
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        let offset = self.offset();
        if self.nesting >= MAX_DEPTH {
            return Err(LedWallError::build(offset, "expression nested too deeply"));
        }
        self.nesting += 1;
        let result = self.unary_nested(offset);
        self.nesting -= 1;
        result
    }

    fn unary_nested(&mut self, offset: usize) -> Result<Expr> {
        if self.eat_op(&["-"]).is_some() {
            let inner = self.unary()?;
            return self.node(offset, Expr::Neg(Box::new(inner)));
        }
        let base = self.primary()?;
        if self.eat_op(&["^"]).is_some() {
            let exponent = self.unary()?;
            return self.node(offset, Expr::Binary(BinOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<Expr> {
        let offset = self.offset();
        match self.next() {
            Some(Token::Number(value)) => Ok(Expr::Const(*value)),
            Some(Token::LParen) => {
                let inner = self.expression()?;
                self.expect(Token::RParen, "`)`")?;
                Ok(inner)
            }
            Some(Token::Ident(name)) if self.peek() == Some(&Token::LParen) => {
                self.pos += 1;
                let func = Func::lookup(name).ok_or_else(|| {
                    LedWallError::build(offset, format!("unknown function `{name}`"))
                })?;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.expression()?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RParen, "`)`")?;
                if args.len() != func.arity() {
                    return Err(LedWallError::build(
                        offset,
                        format!(
                            "`{name}` takes {} argument(s), got {}",
                            func.arity(),
                            args.len()
                        ),
                    ));
                }
                self.node(offset, Expr::Call(func, args))
            }
            Some(Token::Ident(name)) => {
                if let Some(slot) = self.locals.get(name) {
                    Ok(Expr::Local(*slot))
                } else if let Some(var) = Var::lookup(name) {
                    Ok(Expr::Var(var))
                } else {
                    Err(LedWallError::build(offset, format!("unknown identifier `{name}`")))
                }
            }
            Some(token) => Err(LedWallError::build(
                offset,
                format!("unexpected {token:?} in expression"),
            )),
            None => Err(LedWallError::build(offset, "unexpected end of input")),
        }
    }
}

/// Compiled image program.
#[derive(Debug, Clone)]
pub struct Program {
    statements: Vec<(usize, Expr)>,
    slots: usize,
    rgb: [usize; 3],
}

impl Program {
    /// Parses and resolves `source`. Every build failure is reported here.
    pub fn compile(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut locals: HashMap<String, usize> = HashMap::new();
        let mut statements = Vec::new();
        let mut pos = 0;

        while pos < tokens.len() {
            if tokens[pos].1 == Token::Semi {
                pos += 1;
                continue;
            }

            let (offset, name) = match &tokens[pos] {
                (offset, Token::Ident(name)) => (*offset, name.clone()),
                (offset, token) => {
                    return Err(LedWallError::build(
                        *offset,
                        format!("expected assignment target, found {token:?}"),
                    ))
                }
            };
            if Var::lookup(&name).is_some() || Func::lookup(&name).is_some() {
                return Err(LedWallError::build(
                    offset,
                    format!("`{name}` is built in and cannot be assigned"),
                ));
            }

            let mut parser = Parser {
                tokens: &tokens,
                pos: pos + 1,
                end: source.len(),
                locals: &locals,
                nesting: 0,
            };
            parser.expect(Token::Assign, "`=`")?;
            let expr = parser.expression()?;
            match parser.peek() {
                None | Some(Token::Semi) => {}
                Some(token) => {
                    return Err(LedWallError::build(
                        parser.offset(),
                        format!("expected `;`, found {token:?}"),
                    ))
                }
            }
            pos = parser.pos;

            let next_slot = locals.len();
            let slot = *locals.entry(name).or_insert(next_slot);
            statements.push((slot, expr));
        }

        let channel = |name: &str| {
            locals.get(name).copied().ok_or_else(|| {
                LedWallError::build(source.len(), format!("program never assigns `{name}`"))
            })
        };
        let rgb = [channel("r")?, channel("g")?, channel("b")?];

        Ok(Self {
            statements,
            slots: locals.len(),
            rgb,
        })
    }

    /// Number of local slots a caller must provide to [`Program::shade`].
    pub fn slot_count(&self) -> usize {
        self.slots
    }

    /// Evaluates one pixel. `locals` is scratch space of at least
    /// [`Program::slot_count`] entries, reused across pixels.
    pub fn shade(&self, env: &PixelEnv<'_>, locals: &mut [f32]) -> [f32; 3] {
        for (slot, expr) in &self.statements {
            let value = expr.eval(env, locals);
            locals[*slot] = value;
        }
        self.rgb.map(|slot| saturate(locals[slot]))
    }
}

fn saturate(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shade_at(program: &Program, frame: &InputFrame, x: f32, y: f32) -> [f32; 3] {
        let env = PixelEnv {
            frame,
            x,
            y,
            width: 4.0,
            height: 4.0,
        };
        let mut locals = vec![0.0; program.slot_count()];
        program.shade(&env, &mut locals)
    }

    #[test]
    fn evaluates_arithmetic_and_locals() {
        let program = Program::compile("a = 1 + 2 * 3; r = a / 14; g = -(0.5 - 1); b = 2 ^ -1").unwrap();
        let rgb = shade_at(&program, &InputFrame::default(), 0.0, 0.0);
        assert_eq!(rgb, [0.5, 0.5, 0.5]);
    }

    #[test]
    fn reads_builtins_and_functions() {
        let frame = InputFrame {
            spectrum: vec![0.0, 1.0],
            playing: true,
            ..Default::default()
        };
        let program = Program::compile(
            "r = spectrum(x); g = playing * step(0.5, y); # comment\n b = clamp(x + y, 0, 0.25)",
        )
        .unwrap();
        let rgb = shade_at(&program, &frame, 1.0, 0.75);
        assert_eq!(rgb, [1.0, 1.0, 0.25]);
    }

    #[test]
    fn numeric_anomalies_are_clamped() {
        let program = Program::compile("r = 1 / 0; g = 0 / 0; b = -1 / 0;").unwrap();
        let rgb = shade_at(&program, &InputFrame::default(), 0.5, 0.5);
        assert_eq!(rgb, [1.0, 0.0, 0.0]);
    }

    #[test]
    fn comparisons_yield_unit_values() {
        let program = Program::compile("r = x < 0.5; g = x >= 0.5; b = mod(-1, 3) / 2").unwrap();
        let rgb = shade_at(&program, &InputFrame::default(), 0.25, 0.0);
        assert_eq!(rgb, [1.0, 0.0, 1.0]);
    }

    #[test]
    fn build_errors_fail_at_compile_time() {
        let cases = [
            "r = 1; g = 1;",
            "r = 1 +; g = 1; b = 1",
            "r = foo; g = 1; b = 1",
            "r = bar(1); g = 1; b = 1",
            "r = sin(1, 2); g = 1; b = 1",
            "x = 1; r = 1; g = 1; b = 1",
            "r = (1; g = 1; b = 1",
            "r = 1 g = 1; b = 1",
            "r = 1 $ 2; g = 1; b = 1",
        ];
        for source in cases {
            let err = Program::compile(source).unwrap_err();
            assert!(
                matches!(err, LedWallError::ProgramBuild { .. }),
                "{source}: {err}"
            );
        }
    }

    #[test]
    fn deep_nesting_fails_at_compile_time() {
        let parens = format!("r = {}1{}; g = 0; b = 0", "(".repeat(10_000), ")".repeat(10_000));
        let negations = format!("r = {}x; g = 0; b = 0", "-".repeat(20_000));
        let chain = format!("r = x{}; g = 0; b = 0", " + x".repeat(10_000));
        let calls = format!("r = {}x{}; g = 0; b = 0", "abs(".repeat(5_000), ")".repeat(5_000));
        for source in [parens, negations, chain, calls] {
            let err = Program::compile(&source).unwrap_err();
            assert!(
                matches!(err, LedWallError::ProgramBuild { ref message, .. } if message.contains("nested too deeply")),
                "{err}"
            );
        }
    }

    #[test]
    fn moderate_nesting_shades_on_a_small_stack() {
        let source = format!("r = {}0.5; g = 0; b = 0", "-".repeat(200));
        let program = Program::compile(&source).unwrap();
        let rgb = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || shade_at(&program, &InputFrame::default(), 0.0, 0.0))
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(rgb, [0.5, 0.0, 0.0]);
    }

    #[test]
    fn locals_must_be_assigned_before_use() {
        let err = Program::compile("r = later; later = 1; g = 0; b = 0").unwrap_err();
        assert!(format!("{err}").contains("later"));
    }

    #[test]
    fn reassignment_reuses_slot() {
        let program = Program::compile("r = 0.25; r = r * 2; g = r; b = 0").unwrap();
        assert_eq!(program.slot_count(), 3);
        let rgb = shade_at(&program, &InputFrame::default(), 0.0, 0.0);
        assert_eq!(rgb, [0.5, 0.5, 0.0]);
    }
}
