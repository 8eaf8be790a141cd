//! Column expressions evaluated over whole tables.
//!
//! Row transforms and predicates are written as short text expressions such as
//! `event + 30` or `samples_over_threshold > 7 && adc_peak >= 20`. They are
//! parsed once into an [`Expr`] and evaluated column-wise with Arrow compute
//! kernels. Expressions are pure: they read existing columns of the same row
//! and never have side effects.
//!
//! Supported syntax, loosest binding first:
//!
//! | level | operators |
//! |---|---|
//! | logical or | `\|\|` |
//! | logical and | `&&` |
//! | comparison | `==` `!=` `<` `<=` `>` `>=` |
//! | additive | `+` `-` |
//! | multiplicative | `*` `/` `%` |
//! | unary | `-` `!` |
//!
//! Operands are column names, integer or float literals, `true`/`false`, or
//! parenthesised expressions. Integer arithmetic runs in `Int64`; anything
//! touching a float runs in `Float64`.

use anyhow::{Context, Result, anyhow, bail};
use arrow::array::{Array, ArrayRef, AsArray, BooleanArray, Float64Array, Int64Array};
use arrow::compute::kernels::{cmp, numeric};
use arrow::compute::{CastOptions, and, cast_with_options, filter_record_batch, not, or};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

/// Parsed column expression.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Column(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(c) => f.write_str(c),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Unary(UnaryOp::Neg, e) => write!(f, "-({e})"),
            Self::Unary(UnaryOp::Not, e) => write!(f, "!({e})"),
            Self::Binary(op, l, r) => write!(f, "({l} {} {r})", op.symbol()),
        }
    }
}

impl FromStr for Expr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Op(&'static str),
    LParen,
    RParen,
}

const OPERATORS: [&str; 16] = [
    "&&", "||", "==", "!=", "<=", ">=", "<", ">", "+", "-", "*", "/", "%", "!", "(", ")",
];

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let bytes = src.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_ascii_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            let text = &src[start..i];
            if text.contains('.') {
                out.push(Token::Float(
                    text.parse().with_context(|| format!("bad number {text:?}"))?,
                ));
            } else {
                out.push(Token::Int(
                    text.parse().with_context(|| format!("bad integer {text:?}"))?,
                ));
            }
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            out.push(Token::Ident(src[start..i].to_string()));
        } else {
            let op = OPERATORS
                .iter()
                .find(|op| src[i..].starts_with(*op))
                .ok_or_else(|| anyhow!("unexpected character {c:?} at offset {i} in {src:?}"))?;
            i += op.len();
            out.push(match *op {
                "(" => Token::LParen,
                ")" => Token::RParen,
                other => Token::Op(other),
            });
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Parser (precedence climbing)
// ---------------------------------------------------------------------------

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek_op(&self) -> Option<&'static str> {
        match self.tokens.get(self.pos) {
            Some(Token::Op(op)) => Some(*op),
            _ => None,
        }
    }

    fn binary_level(
        &mut self,
        ops: &[(&str, BinaryOp)],
        next: fn(&mut Self) -> Result<Expr>,
        chain: bool,
    ) -> Result<Expr> {
        let mut lhs = next(self)?;
        while let Some(tok) = self.peek_op() {
            let Some(&(_, op)) = ops.iter().find(|(s, _)| *s == tok) else {
                break;
            };
            self.pos += 1;
            let rhs = next(self)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
            if !chain {
                break;
            }
        }
        Ok(lhs)
    }

    fn or(&mut self) -> Result<Expr> {
        self.binary_level(&[("||", BinaryOp::Or)], Self::and, true)
    }

    fn and(&mut self) -> Result<Expr> {
        self.binary_level(&[("&&", BinaryOp::And)], Self::comparison, true)
    }

    fn comparison(&mut self) -> Result<Expr> {
        self.binary_level(
            &[
                ("==", BinaryOp::Eq),
                ("!=", BinaryOp::Ne),
                ("<=", BinaryOp::Le),
                (">=", BinaryOp::Ge),
                ("<", BinaryOp::Lt),
                (">", BinaryOp::Gt),
            ],
            Self::additive,
            false,
        )
    }

    fn additive(&mut self) -> Result<Expr> {
        self.binary_level(&[("+", BinaryOp::Add), ("-", BinaryOp::Sub)], Self::multiplicative, true)
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        self.binary_level(
            &[("*", BinaryOp::Mul), ("/", BinaryOp::Div), ("%", BinaryOp::Rem)],
            Self::unary,
            true,
        )
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek_op() {
            Some("-") => {
                self.pos += 1;
                Ok(match self.unary()? {
                    Expr::Int(v) => Expr::Int(-v),
                    Expr::Float(v) => Expr::Float(-v),
                    e => Expr::Unary(UnaryOp::Neg, Box::new(e)),
                })
            }
            Some("!") => {
                self.pos += 1;
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| anyhow!("unexpected end of expression"))?;
        self.pos += 1;
        match tok {
            Token::Int(v) => Ok(Expr::Int(v)),
            Token::Float(v) => Ok(Expr::Float(v)),
            Token::Ident(name) => Ok(match name.as_str() {
                "true" => Expr::Bool(true),
                "false" => Expr::Bool(false),
                _ => Expr::Column(name),
            }),
            Token::LParen => {
                let inner = self.or()?;
                match self.tokens.get(self.pos) {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => bail!("missing closing parenthesis"),
                }
            }
            other => bail!("unexpected token {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn promote(l: &ArrayRef, r: &ArrayRef) -> Result<(ArrayRef, ArrayRef)> {
    let numeric = |dt: &DataType| dt.is_integer() || dt.is_floating();
    if !numeric(l.data_type()) || !numeric(r.data_type()) {
        bail!(
            "expected numeric operands, got {} and {}",
            l.data_type(),
            r.data_type()
        );
    }
    let target = if l.data_type().is_floating() || r.data_type().is_floating() {
        DataType::Float64
    } else {
        DataType::Int64
    };
    Ok((cast_strict(l, &target)?, cast_strict(r, &target)?))
}

fn as_bool(a: &ArrayRef) -> Result<&BooleanArray> {
    a.as_boolean_opt()
        .ok_or_else(|| anyhow!("expected a boolean operand, got {}", a.data_type()))
}

impl Expr {
    /// Parse an expression.
    ///
    /// # Errors
    /// Fails on unknown characters, unbalanced parentheses or trailing input.
    pub fn parse(src: &str) -> Result<Self> {
        let tokens = tokenize(src)?;
        if tokens.is_empty() {
            bail!("empty expression");
        }
        let mut p = Parser { tokens, pos: 0 };
        let expr = p.or().with_context(|| format!("parse expression {src:?}"))?;
        if p.pos != p.tokens.len() {
            bail!("trailing input after position {} in {src:?}", p.pos);
        }
        Ok(expr)
    }

    /// Build `column + offset`.
    #[must_use]
    pub fn column_plus(column: &str, offset: i64) -> Self {
        Self::Binary(
            BinaryOp::Add,
            Box::new(Self::Column(column.to_string())),
            Box::new(Self::Int(offset)),
        )
    }

    /// Evaluate against every row of `batch`, yielding one value per row.
    ///
    /// # Errors
    /// Fails on unknown columns, type mismatches, overflow or division by zero.
    pub fn eval(&self, batch: &RecordBatch) -> Result<ArrayRef> {
        let n = batch.num_rows();
        Ok(match self {
            Self::Column(name) => batch
                .column_by_name(name)
                .cloned()
                .ok_or_else(|| anyhow!("unknown column {name:?}"))?,
            Self::Int(v) => Arc::new(Int64Array::from_value(*v, n)),
            Self::Float(v) => Arc::new(Float64Array::from_value(*v, n)),
            Self::Bool(v) => Arc::new(BooleanArray::from(vec![*v; n])),
            Self::Unary(UnaryOp::Not, e) => {
                let v = e.eval(batch)?;
                Arc::new(not(as_bool(&v)?)?)
            }
            Self::Unary(UnaryOp::Neg, e) => {
                let v = e.eval(batch)?;
                let zero: ArrayRef = Arc::new(Int64Array::from_value(0, n));
                let (z, v) = promote(&zero, &v)?;
                numeric::sub(&z, &v)?
            }
            Self::Binary(op, l, r) => {
                let l = l.eval(batch)?;
                let r = r.eval(batch)?;
                eval_binary(*op, &l, &r)?
            }
        })
    }
}

fn eval_binary(op: BinaryOp, l: &ArrayRef, r: &ArrayRef) -> Result<ArrayRef> {
    use BinaryOp as B;
    Ok(match op {
        B::And => Arc::new(and(as_bool(l)?, as_bool(r)?)?),
        B::Or => Arc::new(or(as_bool(l)?, as_bool(r)?)?),
        B::Eq | B::Ne
            if l.data_type() == &DataType::Boolean && r.data_type() == &DataType::Boolean =>
        {
            Arc::new(if op == B::Eq { cmp::eq(l, r)? } else { cmp::neq(l, r)? })
        }
        B::Eq | B::Ne | B::Lt | B::Le | B::Gt | B::Ge => {
            let (l, r) = promote(l, r)?;
            Arc::new(match op {
                B::Eq => cmp::eq(&l, &r)?,
                B::Ne => cmp::neq(&l, &r)?,
                B::Lt => cmp::lt(&l, &r)?,
                B::Le => cmp::lt_eq(&l, &r)?,
                B::Gt => cmp::gt(&l, &r)?,
                _ => cmp::gt_eq(&l, &r)?,
            })
        }
        B::Add | B::Sub | B::Mul | B::Div | B::Rem => {
            let (l, r) = promote(l, r)?;
            match op {
                B::Add => numeric::add(&l, &r)?,
                B::Sub => numeric::sub(&l, &r)?,
                B::Mul => numeric::mul(&l, &r)?,
                B::Div => numeric::div(&l, &r)?,
                _ => numeric::rem(&l, &r)?,
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Table operations
// ---------------------------------------------------------------------------

/// Cast that fails on values the target type cannot hold instead of nulling them.
fn cast_strict(values: &ArrayRef, to: &DataType) -> Result<ArrayRef> {
    let options = CastOptions { safe: false, ..Default::default() };
    Ok(cast_with_options(values, to, &options)?)
}

fn replace_schema(batch: &RecordBatch, fields: Vec<Field>, columns: Vec<ArrayRef>) -> Result<RecordBatch> {
    let schema = Schema::new_with_metadata(fields, batch.schema().metadata().clone());
    RecordBatch::try_new(Arc::new(schema), columns).context("rebuild table")
}

/// Replace an existing column with `expr`, keeping its data type.
///
/// # Errors
/// Fails when the column is missing or any value does not fit the column type.
pub fn redefine(batch: &RecordBatch, column: &str, expr: &Expr) -> Result<RecordBatch> {
    let schema = batch.schema();
    let (idx, field) = schema
        .column_with_name(column)
        .ok_or_else(|| anyhow!("cannot redefine missing column {column:?}"))?;
    let values = expr
        .eval(batch)
        .with_context(|| format!("evaluate {expr} for column {column:?}"))?;
    let values = cast_strict(&values, field.data_type())
        .with_context(|| format!("cast {column:?} back to {}", field.data_type()))?;

    let mut columns = batch.columns().to_vec();
    columns[idx] = values;
    let fields = schema.fields().iter().map(|f| f.as_ref().clone()).collect();
    replace_schema(batch, fields, columns)
}

/// Append a new column computed by `expr`, cast to `data_type` when given.
///
/// # Errors
/// Fails when the column already exists or evaluation fails.
pub fn define(
    batch: &RecordBatch,
    column: &str,
    expr: &Expr,
    data_type: Option<&DataType>,
) -> Result<RecordBatch> {
    if batch.schema().column_with_name(column).is_some() {
        bail!("column {column:?} already exists");
    }
    let mut values = expr
        .eval(batch)
        .with_context(|| format!("evaluate {expr} for new column {column:?}"))?;
    if let Some(dt) = data_type {
        values = cast_strict(&values, dt).with_context(|| format!("cast {column:?} to {dt}"))?;
    }

    let mut fields: Vec<Field> = batch.schema().fields().iter().map(|f| f.as_ref().clone()).collect();
    fields.push(Field::new(column, values.data_type().clone(), values.null_count() > 0));
    let mut columns = batch.columns().to_vec();
    columns.push(values);
    replace_schema(batch, fields, columns)
}

/// Keep the rows for which `predicate` is true. Null results drop the row.
///
/// # Errors
/// Fails when the predicate does not evaluate to booleans.
pub fn filter(batch: &RecordBatch, predicate: &Expr, label: &str) -> Result<RecordBatch> {
    let mask = predicate
        .eval(batch)
        .with_context(|| format!("evaluate filter {label:?}"))?;
    let mask = mask
        .as_boolean_opt()
        .ok_or_else(|| anyhow!("filter {label:?} is not a predicate ({})", mask.data_type()))?;
    filter_record_batch(batch, mask).with_context(|| format!("apply filter {label:?}"))
}
