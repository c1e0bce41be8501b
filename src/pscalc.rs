// # PS Calculator
//
// A very small PostScript "compiler" that flattens simple procedures
// into a linear array of tagged cells, executable on a private stack
// without the full interpreter. Designed for type 4 (PostScript
// calculator) functions, extended with `repeat`, `exec` and `for` so
// standard DeviceN custom-conversion callbacks run too.
//
// Sub-procedures are inlined with a single header cell carrying a
// half-open [start, end) index range into the same array; there is no
// tree structure. Executing a procedure cell just pushes the header;
// `if`, `ifelse` and friends use the indices to run the body.
//
// Compilation failure is not an error: callers must fall back to the
// full interpreter.

use std::collections::HashMap;

use once_cell::sync::Lazy;

/// Maximum number of cells compiled into a single procedure. There is
/// also an implementation ceiling of 64k because indices are 16-bit.
pub const PSCALC_MAXOBJS: usize = 1000;

/// Maximum evaluation stack depth.
pub const PSCALC_MAXSTACK: usize = 100;

/// Safety slots above the stack limit.
const STACK_SAFETY: usize = 10;

/// Evaluation errors, returned as codes; no host error is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PsCalcError {
    NoErr = 0,
    StackUnderflow,
    StackOverflow,
    TypeCheck,
    RangeCheck,
    UndefinedResult,
}

pub type PsCalcResult<T> = std::result::Result<T, PsCalcError>;

/// Input tokens: the flattened form of a PostScript executable array.
#[derive(Debug, Clone, PartialEq)]
pub enum PsToken {
    Integer(i32),
    Real(f32),
    Boolean(bool),
    /// An executable name; must resolve to a supported operator
    /// (`true`/`false` are literal-name exceptions).
    Name(String),
    /// A nested executable array.
    Procedure(Vec<PsToken>),
    /// Literal string: not supported, compilation fails.
    String(Vec<u8>),
    Null,
}

/// Operator opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    // Arithmetic
    Abs,
    Add,
    Atan,
    Ceiling,
    Cos,
    Cvi,
    Cvr,
    Div,
    Exp,
    Floor,
    Idiv,
    Ln,
    Log,
    Mod,
    Mul,
    Neg,
    Round,
    Sin,
    Sqrt,
    Sub,
    Truncate,
    // Relational
    And,
    Bitshift,
    Eq,
    False,
    Ge,
    Gt,
    Le,
    Lt,
    Ne,
    Not,
    Or,
    True,
    Xor,
    // Conditional
    If,
    IfElse,
    // Stack
    Copy,
    Dup,
    Exch,
    Index,
    Pop,
    Roll,
    // Extensions beyond type 4 functions
    Repeat,
    Exec,
    For,
}

static NAME_TO_OP: Lazy<HashMap<&'static str, OpCode>> = Lazy::new(|| {
    use OpCode::*;
    HashMap::from([
        ("abs", Abs),
        ("add", Add),
        ("atan", Atan),
        ("ceiling", Ceiling),
        ("cos", Cos),
        ("cvi", Cvi),
        ("cvr", Cvr),
        ("div", Div),
        ("exp", Exp),
        ("floor", Floor),
        ("idiv", Idiv),
        ("ln", Ln),
        ("log", Log),
        ("mod", Mod),
        ("mul", Mul),
        ("neg", Neg),
        ("round", Round),
        ("sin", Sin),
        ("sqrt", Sqrt),
        ("sub", Sub),
        ("truncate", Truncate),
        ("and", And),
        ("bitshift", Bitshift),
        ("eq", Eq),
        ("false", False),
        ("ge", Ge),
        ("gt", Gt),
        ("le", Le),
        ("lt", Lt),
        ("ne", Ne),
        ("not", Not),
        ("or", Or),
        ("true", True),
        ("xor", Xor),
        ("if", If),
        ("ifelse", IfElse),
        ("copy", Copy),
        ("dup", Dup),
        ("exch", Exch),
        ("index", Index),
        ("pop", Pop),
        ("roll", Roll),
        ("repeat", Repeat),
        ("exec", Exec),
        ("for", For),
    ])
});

/// Argument-type restrictions for operator arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arg {
    Any,
    Num,
    Int,
    Bool,
    /// Int or bool (the bitwise/logical operators).
    IntOrBool,
    Proc,
}

impl OpCode {
    /// Required fixed argument count and restrictions on the first two.
    /// Operators with more than two fixed arguments do their own
    /// checking for the rest.
    fn args(self) -> (usize, Arg, Arg) {
        use OpCode::*;
        match self {
            Abs | Ceiling | Cos | Cvi | Cvr | Floor | Ln | Log | Neg | Round | Sin | Sqrt
            | Truncate => (1, Arg::Num, Arg::Any),
            Add | Atan | Div | Exp | Mul | Sub | Ge | Gt | Le | Lt => (2, Arg::Num, Arg::Num),
            Idiv | Mod | Bitshift | Roll => (2, Arg::Int, Arg::Int),
            And | Ne | Or | Xor => (2, Arg::IntOrBool, Arg::IntOrBool),
            Not => (1, Arg::IntOrBool, Arg::Any),
            Eq => (2, Arg::Any, Arg::Any),
            False | True => (0, Arg::Any, Arg::Any),
            If => (2, Arg::Proc, Arg::Bool),
            IfElse => (3, Arg::Proc, Arg::Proc),
            Copy | Index => (1, Arg::Int, Arg::Any),
            Dup | Pop => (1, Arg::Any, Arg::Any),
            Exch => (2, Arg::Any, Arg::Any),
            Repeat => (2, Arg::Proc, Arg::Int),
            Exec => (1, Arg::Proc, Arg::Any),
            For => (4, Arg::Proc, Arg::Num),
        }
    }
}

/// One compiled cell. Procedure headers carry [start, end) into the
/// containing array.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Cell {
    Int(i32),
    Real(f32),
    Bool(bool),
    Op(OpCode),
    Proc { start: u16, end: u16 },
}

impl Cell {
    fn number(self) -> Option<f64> {
        match self {
            Cell::Int(i) => Some(i as f64),
            Cell::Real(r) => Some(r as f64),
            _ => None,
        }
    }

    fn matches(self, arg: Arg) -> bool {
        match arg {
            Arg::Any => true,
            Arg::Num => matches!(self, Cell::Int(_) | Cell::Real(_)),
            Arg::Int => matches!(self, Cell::Int(_)),
            Arg::Bool => matches!(self, Cell::Bool(_)),
            Arg::IntOrBool => matches!(self, Cell::Int(_) | Cell::Bool(_)),
            Arg::Proc => matches!(self, Cell::Proc { .. }),
        }
    }

    /// Equality with int/real cross-promotion, as `eq` sees it.
    fn loose_eq(self, other: Cell) -> bool {
        match (self, other) {
            (Cell::Int(a), Cell::Int(b)) => a == b,
            (Cell::Int(a), Cell::Real(b)) | (Cell::Real(b), Cell::Int(a)) => a as f32 == b,
            (Cell::Real(a), Cell::Real(b)) => a == b,
            (Cell::Bool(a), Cell::Bool(b)) => a == b,
            (Cell::Op(a), Cell::Op(b)) => a == b,
            _ => false,
        }
    }
}

/// A compiled PS-calculator procedure: a flat array of cells whose
/// first cell is the top-level procedure header.
pub struct PsCalcFunc {
    cells: Box<[Cell]>,
}

/// Flatten one executable array into `cells` starting at the current
/// end. Returns `None` on anything unsupported or out of bounds.
fn add_to_array(proc: &[PsToken], cells: &mut Vec<Cell>) -> Option<()> {
    let header = cells.len();
    if header >= PSCALC_MAXOBJS {
        return None;
    }
    cells.push(Cell::Proc { start: (header + 1) as u16, end: 0 });

    if cells.len() + proc.len() >= PSCALC_MAXOBJS {
        return None;
    }

    for token in proc {
        match token {
            PsToken::Integer(i) => cells.push(Cell::Int(*i)),
            PsToken::Real(r) => cells.push(Cell::Real(*r)),
            PsToken::Boolean(b) => cells.push(Cell::Bool(*b)),
            // A name must be a supported operator; true/false are
            // names for the boolean values, not operators.
            PsToken::Name(name) => match name.as_str() {
                "true" => cells.push(Cell::Bool(true)),
                "false" => cells.push(Cell::Bool(false)),
                _ => cells.push(Cell::Op(*NAME_TO_OP.get(name.as_str())?)),
            },
            PsToken::Procedure(body) => {
                add_to_array(body, cells)?;
            }
            PsToken::String(_) | PsToken::Null => return None,
        }
        if cells.len() > PSCALC_MAXOBJS {
            return None;
        }
    }
    let end = cells.len();
    if end > u16::MAX as usize {
        return None;
    }
    match &mut cells[header] {
        Cell::Proc { end: e, .. } => *e = end as u16,
        _ => unreachable!(),
    }
    Some(())
}

impl PsCalcFunc {
    /// Attempt to compile a procedure. May fail for many reasons: too
    /// big, unsupported operators, unsupported object types. Returns
    /// `None` without raising an error; the caller must have a
    /// fallback.
    pub fn compile(proc: &[PsToken]) -> Option<PsCalcFunc> {
        let mut cells = Vec::new();
        add_to_array(proc, &mut cells)?;
        Some(PsCalcFunc { cells: cells.into_boxed_slice() })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        // A compiled function always has at least its header.
        self.cells.len() <= 1
    }

    /// Execute with `inputs` pushed as reals; exactly `outputs.len()`
    /// numeric results must remain, popped in reverse order.
    pub fn exec(&self, inputs: &[f32], outputs: &mut [f32]) -> PsCalcResult<()> {
        let mut stack = Stack::new();
        if inputs.len() > stack.size {
            return Err(PsCalcError::StackOverflow);
        }
        for &v in inputs {
            stack.obj[stack.top] = Cell::Real(v);
            stack.top += 1;
        }

        let top_level = match self.cells.first() {
            Some(&proc @ Cell::Proc { .. }) => proc,
            _ => return Err(PsCalcError::TypeCheck),
        };
        run(&self.cells, &mut stack, top_level)?;

        if stack.top != outputs.len() {
            return Err(PsCalcError::RangeCheck);
        }
        for i in (0..outputs.len()).rev() {
            stack.top -= 1;
            outputs[i] = match stack.obj[stack.top] {
                Cell::Real(r) => r,
                Cell::Int(n) => n as f32,
                _ => return Err(PsCalcError::TypeCheck),
            };
        }
        Ok(())
    }
}

/// The private evaluation stack, with a safety zone above the limit.
struct Stack {
    size: usize,
    top: usize,
    obj: [Cell; PSCALC_MAXSTACK + STACK_SAFETY],
}

impl Stack {
    fn new() -> Stack {
        Stack {
            size: PSCALC_MAXSTACK,
            top: 0,
            obj: [Cell::Int(0); PSCALC_MAXSTACK + STACK_SAFETY],
        }
    }
}

/// Run one procedure body.
fn run(cells: &[Cell], stack: &mut Stack, proc: Cell) -> PsCalcResult<()> {
    let (start, end) = match proc {
        Cell::Proc { start, end } => (start as usize, end as usize),
        _ => return Err(PsCalcError::TypeCheck),
    };
    debug_assert!(start > 0 && start <= end && end <= cells.len(), "corrupt procedure");

    let mut i = start;
    while i < end {
        let cell = cells[i];
        if stack.top >= stack.size {
            return Err(PsCalcError::StackOverflow);
        }
        match cell {
            Cell::Int(_) | Cell::Real(_) | Cell::Bool(_) => {
                stack.obj[stack.top] = cell;
                stack.top += 1;
            }
            Cell::Proc { end: body_end, .. } => {
                // Only the header goes on the stack; skip the body. It
                // runs when `if`/`ifelse`/`exec` invokes it.
                stack.obj[stack.top] = cell;
                stack.top += 1;
                i = body_end as usize - 1;
            }
            Cell::Op(op) => do_op(op, cells, stack)?,
        }
        i += 1;
    }
    Ok(())
}

/// Execute a single operator.
fn do_op(op: OpCode, cells: &[Cell], stack: &mut Stack) -> PsCalcResult<()> {
    let (nargs, arg1, arg2) = op.args();
    if nargs > stack.top {
        return Err(PsCalcError::StackUnderflow);
    }
    let op1 = if stack.top >= 1 { stack.obj[stack.top - 1] } else { Cell::Int(0) };
    let op2 = if stack.top >= 2 { stack.obj[stack.top - 2] } else { Cell::Int(0) };
    let v1 = op1.number().unwrap_or(0.0);
    let v2 = op2.number().unwrap_or(0.0);

    if nargs >= 1 && !op1.matches(arg1) {
        return Err(PsCalcError::TypeCheck);
    }
    if nargs >= 2 {
        if !op2.matches(arg2) {
            return Err(PsCalcError::TypeCheck);
        }
        // The bitwise/logical operators need both operands of one kind.
        if arg1 == Arg::IntOrBool && arg2 == Arg::IntOrBool {
            if std::mem::discriminant(&op1) != std::mem::discriminant(&op2) {
                return Err(PsCalcError::TypeCheck);
            }
        }
    }

    use OpCode::*;
    match op {
        // Arithmetic
        Abs => {
            stack.obj[stack.top - 1] = match op1 {
                Cell::Int(n) => Cell::Int(n.wrapping_abs()),
                Cell::Real(r) => Cell::Real(r.abs()),
                _ => op1,
            };
        }
        Add => {
            stack.obj[stack.top - 2] = match (op1, op2) {
                (Cell::Int(a), Cell::Int(b)) => Cell::Int(b.wrapping_add(a)),
                _ => Cell::Real((v1 + v2) as f32),
            };
            stack.top -= 1;
        }
        Atan => {
            if v1 == 0.0 && v2 == 0.0 {
                return Err(PsCalcError::UndefinedResult);
            }
            let mut deg = v2.atan2(v1).to_degrees();
            if deg < 0.0 {
                deg += 360.0;
            }
            stack.obj[stack.top - 2] = Cell::Real(deg as f32);
            stack.top -= 1;
        }
        Ceiling => {
            if let Cell::Real(r) = op1 {
                let mut n = r as i32;
                if n >= 0 && n as f32 - r != 0.0 {
                    n += 1;
                }
                stack.obj[stack.top - 1] = Cell::Real(n as f32);
            }
        }
        Cos => {
            stack.obj[stack.top - 1] = Cell::Real(v1.to_radians().cos() as f32);
        }
        Cvi => {
            if let Cell::Real(r) = op1 {
                stack.obj[stack.top - 1] = Cell::Int(r as i32);
            }
        }
        Cvr => {
            if let Cell::Int(n) = op1 {
                stack.obj[stack.top - 1] = Cell::Real(n as f32);
            }
        }
        Div => {
            if v1 == 0.0 {
                return Err(PsCalcError::UndefinedResult);
            }
            stack.obj[stack.top - 2] = Cell::Real((v2 / v1) as f32);
            stack.top -= 1;
        }
        Exp => {
            if v2 < 0.0 && v1 != (v1 as i32) as f64 {
                return Err(PsCalcError::UndefinedResult);
            }
            stack.obj[stack.top - 2] = Cell::Real(v2.powf(v1) as f32);
            stack.top -= 1;
        }
        Floor => {
            if let Cell::Real(r) = op1 {
                let mut n = r as i32;
                if n <= 0 && n as f32 - r != 0.0 {
                    n -= 1;
                }
                stack.obj[stack.top - 1] = Cell::Real(n as f32);
            }
        }
        Idiv => {
            let (Cell::Int(a), Cell::Int(b)) = (op1, op2) else {
                return Err(PsCalcError::TypeCheck);
            };
            if a == 0 {
                return Err(PsCalcError::UndefinedResult);
            }
            stack.obj[stack.top - 2] = Cell::Int(b.wrapping_div(a));
            stack.top -= 1;
        }
        Ln => {
            if v1 <= 0.0 {
                return Err(PsCalcError::UndefinedResult);
            }
            stack.obj[stack.top - 1] = Cell::Real(v1.ln() as f32);
        }
        Log => {
            if v1 <= 0.0 {
                return Err(PsCalcError::UndefinedResult);
            }
            stack.obj[stack.top - 1] = Cell::Real(v1.log10() as f32);
        }
        Mod => {
            let (Cell::Int(a), Cell::Int(b)) = (op1, op2) else {
                return Err(PsCalcError::TypeCheck);
            };
            if a == 0 {
                return Err(PsCalcError::UndefinedResult);
            }
            stack.obj[stack.top - 2] = Cell::Int(b.wrapping_rem(a));
            stack.top -= 1;
        }
        Mul => {
            stack.obj[stack.top - 2] = match (op1, op2) {
                (Cell::Int(a), Cell::Int(b)) => Cell::Int(b.wrapping_mul(a)),
                _ => Cell::Real((v1 * v2) as f32),
            };
            stack.top -= 1;
        }
        Neg => {
            stack.obj[stack.top - 1] = match op1 {
                Cell::Int(n) => Cell::Int(n.wrapping_neg()),
                Cell::Real(r) => Cell::Real(-r),
                _ => op1,
            };
        }
        Round => {
            if let Cell::Real(r) = op1 {
                let mut n = (r + 0.5) as i32;
                if n <= 0 && n as f32 - r != 0.5 {
                    n -= 1;
                }
                stack.obj[stack.top - 1] = Cell::Real(n as f32);
            }
        }
        Sin => {
            stack.obj[stack.top - 1] = Cell::Real(v1.to_radians().sin() as f32);
        }
        Sqrt => {
            if v1 < 0.0 {
                return Err(PsCalcError::UndefinedResult);
            }
            stack.obj[stack.top - 1] = Cell::Real(v1.sqrt() as f32);
        }
        Sub => {
            stack.obj[stack.top - 2] = match (op1, op2) {
                (Cell::Int(a), Cell::Int(b)) => Cell::Int(b.wrapping_sub(a)),
                _ => Cell::Real((v2 - v1) as f32),
            };
            stack.top -= 1;
        }
        Truncate => {
            if let Cell::Real(r) = op1 {
                stack.obj[stack.top - 1] = Cell::Real(r.trunc());
            }
        }

        // Relational
        And => {
            stack.obj[stack.top - 2] = match (op1, op2) {
                (Cell::Int(a), Cell::Int(b)) => Cell::Int(a & b),
                (Cell::Bool(a), Cell::Bool(b)) => Cell::Bool(a & b),
                _ => return Err(PsCalcError::TypeCheck),
            };
            stack.top -= 1;
        }
        Bitshift => {
            let (Cell::Int(n), Cell::Int(v)) = (op1, op2) else {
                return Err(PsCalcError::TypeCheck);
            };
            let shifted = if n < 0 {
                v.checked_shr((-n) as u32).unwrap_or(0)
            } else if n > 0 {
                v.checked_shl(n as u32).unwrap_or(0)
            } else {
                v
            };
            stack.obj[stack.top - 2] = Cell::Int(shifted);
            stack.top -= 1;
        }
        Eq => {
            stack.obj[stack.top - 2] = Cell::Bool(op1.loose_eq(op2));
            stack.top -= 1;
        }
        False | True => {
            if stack.top >= stack.size {
                return Err(PsCalcError::StackOverflow);
            }
            stack.obj[stack.top] = Cell::Bool(op == True);
            stack.top += 1;
        }
        Ge => {
            stack.obj[stack.top - 2] = Cell::Bool(v2 >= v1);
            stack.top -= 1;
        }
        Gt => {
            stack.obj[stack.top - 2] = Cell::Bool(v2 > v1);
            stack.top -= 1;
        }
        Le => {
            stack.obj[stack.top - 2] = Cell::Bool(v2 <= v1);
            stack.top -= 1;
        }
        Lt => {
            stack.obj[stack.top - 2] = Cell::Bool(v2 < v1);
            stack.top -= 1;
        }
        Ne => {
            stack.obj[stack.top - 2] = Cell::Bool(!op1.loose_eq(op2));
            stack.top -= 1;
        }
        Not => {
            stack.obj[stack.top - 1] = match op1 {
                Cell::Int(n) => Cell::Int(!n),
                Cell::Bool(b) => Cell::Bool(!b),
                _ => return Err(PsCalcError::TypeCheck),
            };
        }
        Or => {
            stack.obj[stack.top - 2] = match (op1, op2) {
                (Cell::Int(a), Cell::Int(b)) => Cell::Int(a | b),
                (Cell::Bool(a), Cell::Bool(b)) => Cell::Bool(a | b),
                _ => return Err(PsCalcError::TypeCheck),
            };
            stack.top -= 1;
        }
        Xor => {
            stack.obj[stack.top - 2] = match (op1, op2) {
                (Cell::Int(a), Cell::Int(b)) => Cell::Int(a ^ b),
                (Cell::Bool(a), Cell::Bool(b)) => Cell::Bool(a ^ b),
                _ => return Err(PsCalcError::TypeCheck),
            };
            stack.top -= 1;
        }

        // Conditional
        If => {
            let Cell::Bool(cond) = op2 else {
                return Err(PsCalcError::TypeCheck);
            };
            stack.top -= 2;
            if cond {
                run(cells, stack, op1)?;
            }
        }
        IfElse => {
            // Only two arguments come checked; pick up the third by hand.
            let Cell::Bool(cond) = stack.obj[stack.top - 3] else {
                return Err(PsCalcError::TypeCheck);
            };
            stack.top -= 3;
            if cond {
                run(cells, stack, op2)?;
            } else {
                run(cells, stack, op1)?;
            }
        }
        Repeat => {
            let Cell::Int(n) = op2 else {
                return Err(PsCalcError::TypeCheck);
            };
            stack.top -= 2;
            for _ in 0..n.max(0) {
                run(cells, stack, op1)?;
            }
        }
        Exec => {
            stack.top -= 1;
            run(cells, stack, op1)?;
        }
        For => {
            let initial = stack.obj[stack.top - 4];
            let step = stack.obj[stack.top - 3];
            let limit = stack.obj[stack.top - 2];
            let (Some(f1), Some(f3), Some(f2)) = (initial.number(), step.number(), limit.number())
            else {
                return Err(PsCalcError::TypeCheck);
            };
            let use_ints = matches!(initial, Cell::Int(_))
                && matches!(step, Cell::Int(_))
                && matches!(limit, Cell::Int(_));
            let proc = op1;
            stack.top -= 4;

            let mut ff = f1;
            while if f3 > 0.0 { ff <= f2 } else { ff >= f2 } {
                if stack.top + 1 >= stack.size {
                    return Err(PsCalcError::StackOverflow);
                }
                stack.obj[stack.top] = if use_ints {
                    Cell::Int((ff + 0.5) as i32)
                } else {
                    Cell::Real(ff as f32)
                };
                stack.top += 1;
                run(cells, stack, proc)?;
                ff += f3;
            }
        }

        // Stack
        Copy => {
            let Cell::Int(n) = op1 else {
                return Err(PsCalcError::TypeCheck);
            };
            if n < 0 {
                return Err(PsCalcError::RangeCheck);
            }
            let n = n as usize;
            stack.top -= 1;
            if stack.top < n {
                return Err(PsCalcError::StackUnderflow);
            }
            if stack.top + n >= stack.size {
                return Err(PsCalcError::StackOverflow);
            }
            for _ in 0..n {
                stack.obj[stack.top] = stack.obj[stack.top - n];
                stack.top += 1;
            }
        }
        Dup => {
            if stack.top >= stack.size {
                return Err(PsCalcError::StackOverflow);
            }
            stack.obj[stack.top] = op1;
            stack.top += 1;
        }
        Exch => {
            stack.obj[stack.top - 1] = op2;
            stack.obj[stack.top - 2] = op1;
        }
        Index => {
            let Cell::Int(n) = op1 else {
                return Err(PsCalcError::TypeCheck);
            };
            if n < 0 {
                return Err(PsCalcError::RangeCheck);
            }
            let n = n as usize;
            if n >= stack.top - 1 {
                return Err(PsCalcError::StackUnderflow);
            }
            stack.obj[stack.top - 1] = stack.obj[stack.top - 2 - n];
        }
        Pop => {
            stack.top -= 1;
        }
        Roll => {
            let (Cell::Int(mut m), Cell::Int(n)) = (op1, op2) else {
                return Err(PsCalcError::TypeCheck);
            };
            if n < 0 {
                return Err(PsCalcError::RangeCheck);
            }
            let n = n as usize;
            stack.top -= 2;
            if stack.top < n {
                return Err(PsCalcError::StackUnderflow);
            }
            while m != 0 && n > 0 {
                if m > 0 {
                    let tmp = stack.obj[stack.top - 1];
                    for i in (stack.top - n + 1..stack.top).rev() {
                        stack.obj[i] = stack.obj[i - 1];
                    }
                    stack.obj[stack.top - n] = tmp;
                    m -= 1;
                } else {
                    let tmp = stack.obj[stack.top - n];
                    for i in stack.top - n..stack.top - 1 {
                        stack.obj[i] = stack.obj[i + 1];
                    }
                    stack.obj[stack.top - 1] = tmp;
                    m += 1;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i32) -> PsToken {
        PsToken::Integer(v)
    }

    fn real(v: f32) -> PsToken {
        PsToken::Real(v)
    }

    fn name(s: &str) -> PsToken {
        PsToken::Name(s.to_string())
    }

    fn compile(tokens: Vec<PsToken>) -> PsCalcFunc {
        PsCalcFunc::compile(&tokens).expect("compilation failed")
    }

    fn exec1(func: &PsCalcFunc, input: f32) -> PsCalcResult<f32> {
        let mut out = [0.0f32];
        func.exec(&[input], &mut out)?;
        Ok(out[0])
    }

    #[test]
    fn rgb_to_gray_weights() {
        // {.11 mul exch .59 mul add exch .3 mul add}
        let func = compile(vec![
            real(0.11),
            name("mul"),
            name("exch"),
            real(0.59),
            name("mul"),
            name("add"),
            name("exch"),
            real(0.3),
            name("mul"),
            name("add"),
        ]);
        let mut out = [0.0f32];
        func.exec(&[1.0, 0.0, 0.0], &mut out).unwrap();
        assert!((out[0] - 0.3).abs() < 1e-6);
        func.exec(&[0.0, 1.0, 0.0], &mut out).unwrap();
        assert!((out[0] - 0.59).abs() < 1e-6);
        func.exec(&[0.0, 0.0, 1.0], &mut out).unwrap();
        assert!((out[0] - 0.11).abs() < 1e-6);
        func.exec(&[1.0, 1.0, 1.0], &mut out).unwrap();
        assert!((out[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn gray_to_cmykogv_tail() {
        // {0. 0. 0. 4 -1 roll 1 exch sub 0. 0. 0.}
        let func = compile(vec![
            real(0.0),
            real(0.0),
            real(0.0),
            int(4),
            int(-1),
            name("roll"),
            int(1),
            name("exch"),
            name("sub"),
            real(0.0),
            real(0.0),
            real(0.0),
        ]);
        let mut out = [0.0f32; 7];
        func.exec(&[0.25], &mut out).unwrap();
        assert_eq!(out, [0.0, 0.0, 0.0, 0.75, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn repeat_extension() {
        // {3 {1 exch sub 3 1 roll} repeat} over an RGB triple inverts it.
        let func = compile(vec![
            int(3),
            PsToken::Procedure(vec![
                int(1),
                name("exch"),
                name("sub"),
                int(3),
                int(1),
                name("roll"),
            ]),
            name("repeat"),
        ]);
        let mut out = [0.0f32; 3];
        func.exec(&[0.25, 0.5, 1.0], &mut out).unwrap();
        assert_eq!(out, [0.75, 0.5, 0.0]);
    }

    #[test]
    fn conditionals() {
        // {dup 0.5 gt {1} {0} ifelse exch pop}
        let func = compile(vec![
            name("dup"),
            real(0.5),
            name("gt"),
            PsToken::Procedure(vec![int(1)]),
            PsToken::Procedure(vec![int(0)]),
            name("ifelse"),
            name("exch"),
            name("pop"),
        ]);
        assert_eq!(exec1(&func, 0.75).unwrap(), 1.0);
        assert_eq!(exec1(&func, 0.25).unwrap(), 0.0);
    }

    #[test]
    fn for_loop_sums() {
        // {0 exch pop 1 1 4 {add} for} with any input -> 1+2+3+4.
        let func = compile(vec![
            int(0),
            name("exch"),
            name("pop"),
            int(1),
            int(1),
            int(4),
            PsToken::Procedure(vec![name("add")]),
            name("for"),
        ]);
        assert_eq!(exec1(&func, 9.0).unwrap(), 10.0);
    }

    #[test]
    fn arithmetic_domain_errors() {
        let div0 = compile(vec![real(0.0), name("div")]);
        assert_eq!(exec1(&div0, 1.0), Err(PsCalcError::UndefinedResult));

        let sqrt_neg = compile(vec![name("sqrt")]);
        assert_eq!(exec1(&sqrt_neg, -1.0), Err(PsCalcError::UndefinedResult));

        let ln0 = compile(vec![name("ln")]);
        assert_eq!(exec1(&ln0, 0.0), Err(PsCalcError::UndefinedResult));

        let atan00 = compile(vec![real(0.0), name("atan")]);
        assert_eq!(exec1(&atan00, 0.0), Err(PsCalcError::UndefinedResult));
    }

    #[test]
    fn atan_normalises_to_0_360() {
        // -1 1 atan is 315 degrees.
        let func = compile(vec![int(1), name("atan")]);
        let got = exec1(&func, -1.0).unwrap();
        assert!((got - 315.0).abs() < 1e-4);
    }

    #[test]
    fn integer_arithmetic_stays_integral() {
        let func = compile(vec![int(7), int(2), name("idiv"), name("add")]);
        assert_eq!(exec1(&func, 1.0).unwrap(), 4.0);

        let func = compile(vec![int(7), int(2), name("mod"), name("add")]);
        assert_eq!(exec1(&func, 1.0).unwrap(), 2.0);
    }

    #[test]
    fn true_false_literal_names() {
        let func = compile(vec![
            name("true"),
            PsToken::Procedure(vec![real(1.0), name("add")]),
            name("if"),
        ]);
        assert_eq!(exec1(&func, 1.0).unwrap(), 2.0);
    }

    #[test]
    fn result_count_mismatch_is_rangecheck() {
        let func = compile(vec![name("dup")]);
        let mut out = [0.0f32];
        assert_eq!(func.exec(&[1.0], &mut out), Err(PsCalcError::RangeCheck));
    }

    #[test]
    fn stack_overflow_detected() {
        // 200 dups overflow the 100-slot stack.
        let func = compile(vec![
            int(200),
            PsToken::Procedure(vec![name("dup")]),
            name("repeat"),
        ]);
        let mut out = [0.0f32];
        assert_eq!(func.exec(&[1.0], &mut out), Err(PsCalcError::StackOverflow));
    }

    #[test]
    fn underflow_detected() {
        let func = compile(vec![name("add")]);
        assert_eq!(exec1(&func, 1.0), Err(PsCalcError::StackUnderflow));
    }

    #[test]
    fn compile_rejects_unknown_names_and_strings() {
        assert!(PsCalcFunc::compile(&[name("get")]).is_none());
        assert!(PsCalcFunc::compile(&[PsToken::String(b"x".to_vec())]).is_none());
        assert!(PsCalcFunc::compile(&[PsToken::Null]).is_none());
    }

    #[test]
    fn compile_rejects_oversized_procedures() {
        let tokens: Vec<PsToken> = (0..1001).map(|_| int(1)).collect();
        assert!(PsCalcFunc::compile(&tokens).is_none());

        let tokens: Vec<PsToken> = (0..998).map(|_| int(1)).collect();
        assert!(PsCalcFunc::compile(&tokens).is_some());
    }

    #[test]
    fn copy_and_index_edges() {
        let func = compile(vec![int(-1), name("copy")]);
        assert_eq!(exec1(&func, 1.0), Err(PsCalcError::RangeCheck));

        let func = compile(vec![int(5), name("index")]);
        assert_eq!(exec1(&func, 1.0), Err(PsCalcError::StackUnderflow));

        // 1 copy duplicates the top.
        let func = compile(vec![int(1), name("copy"), name("add")]);
        assert_eq!(exec1(&func, 3.0).unwrap(), 6.0);
    }

    #[test]
    fn bitshift_directions() {
        let func = compile(vec![name("pop"), int(4), int(2), name("bitshift")]);
        assert_eq!(exec1(&func, 0.0).unwrap(), 16.0);
        let func = compile(vec![name("pop"), int(4), int(-2), name("bitshift")]);
        assert_eq!(exec1(&func, 0.0).unwrap(), 1.0);
    }
}
