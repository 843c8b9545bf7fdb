use std::fmt::Display;

use thiserror::Error;

/// One compile error, pinned to where it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    /// Source line of the offending token.
    pub line: usize,
    /// e.g. ` at 'foo'` or ` at end`. Empty for errors the scanner reported.
    pub location: String,
    /// What was wrong.
    pub message: String,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[line {}] Error{}: {}", self.line, self.location, self.message)
    }
}

/// Everything that was wrong with a program that failed to compile.
#[derive(Debug, Clone, Error)]
#[error("{}", render_lines(.diagnostics))]
pub struct CompileError {
    /// In source order. Never empty.
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileError {
    /// The bare messages, handy for asserting on.
    pub fn messages(&self) -> Vec<&str> {
        self.diagnostics.iter().map(|d| d.message.as_str()).collect()
    }
}

/// What went wrong while running.
#[derive(Debug, Error)]
pub enum RuntimeErrorKind {
    /// Unary minus on a non-number.
    #[error("Operand must be a number.")]
    OperandMustBeNumber,
    /// Arithmetic or comparison on non-numbers.
    #[error("Operands must be numbers.")]
    OperandsMustBeNumbers,
    /// `+` on mismatched operands.
    #[error("Operands must be two numbers or two strings.")]
    OperandsMustBeNumbersOrStrings,
    /// Read or assignment of a global that was never defined.
    #[error("Undefined variable '{0}'.")]
    UndefinedVariable(String),
    /// No field or method by that name.
    #[error("Undefined property '{0}'.")]
    UndefinedProperty(String),
    /// Property read on something that isn't an instance.
    #[error("Only instances have properties.")]
    OnlyInstancesHaveProperties,
    /// Property write on something that isn't an instance.
    #[error("Only instances have fields.")]
    OnlyInstancesHaveFields,
    /// Method invocation on something that isn't an instance.
    #[error("Only instances have methods.")]
    OnlyInstancesHaveMethods,
    /// Call of a value that isn't callable.
    #[error("Can only call functions and classes.")]
    NotCallable,
    /// Wrong number of arguments.
    #[error("Expected {expected} arguments but got {got}.")]
    ArityMismatch {
        /// The callee's arity.
        expected: usize,
        /// Arguments actually passed.
        got: usize,
    },
    /// `class A < x` where `x` isn't a class.
    #[error("Superclass must be a class.")]
    SuperclassMustBeClass,
    /// Either the frame stack or the value stack ran out.
    #[error("Stack overflow.")]
    StackOverflow,
    /// A native function failed with this message.
    #[error("{0}")]
    Native(String),
    /// `print` couldn't write.
    #[error("Could not write output: {0}")]
    Output(#[from] std::io::Error),
    /// A bug in the compiler or VM.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

/// One line of a runtime stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Line of the instruction that was executing.
    pub line: usize,
    /// None for the top-level script.
    pub function: Option<String>,
}

impl Display for TraceFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.function {
            Some(name) => write!(f, "[line {}] in {}()", self.line, name),
            None => write!(f, "[line {}] in script", self.line),
        }
    }
}

/// A fatal error while running, with the call stack at the moment it happened, innermost frame first.
#[derive(Debug, Error)]
#[error("{kind}\n{}", render_lines(.trace))]
pub struct RuntimeError {
    /// What went wrong.
    #[source]
    pub kind: RuntimeErrorKind,
    /// Innermost frame first.
    pub trace: Vec<TraceFrame>,
}

/// Errors that can be returned by running the interpreter.
#[derive(Debug, Error)]
pub enum InterpretError {
    /// The program didn't compile, so none of it ran.
    #[error(transparent)]
    Compile(#[from] CompileError),
    /// The program failed part way through.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Clone, Error)]
/// VM error that should never come up in code that compiled correctly
pub enum InternalError {
    /// An internal error due to Chunks having a limited number of slots for constants.
    #[error("tried to store more than the maximum number of constants in a chunk")]
    TooManyConstants,
    /// Tried to get the top value from an empty stack
    #[error("popped from an empty stack")]
    EmptyStack,
    /// Ran an instruction with no function executing.
    #[error("no call frame is active")]
    NoFrame,
    /// Bytes that don't decode to an instruction.
    #[error("invalid instruction at offset {0}")]
    InvalidInstruction(usize),
    /// An operand named a constant that isn't there or isn't what the instruction needs.
    #[error("constant {0} is missing or has the wrong type")]
    BadConstant(u8),
    /// The stack held the wrong kind of value for an instruction.
    #[error("expected a {0} on the stack")]
    UnexpectedValue(&'static str),
}

fn render_lines<T: Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}
