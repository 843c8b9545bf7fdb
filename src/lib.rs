//! The lib crate for a Lox bytecode compiler and interpreter.
#![warn(missing_debug_implementations, missing_docs, rust_2018_idioms)]

/// vm is the bits about running code.
pub mod vm;

/// scanner scans!
pub mod scanner;

/// Takes tokens from the scanner and emits bytecode
pub mod compiler;

/// Bytecode and the chunks that hold it.
pub mod chunk;

/// Settings for the VM and its collector.
pub mod config;

/// Compile and runtime errors.
pub mod error;

/// The garbage collected heap.
pub mod heap;

/// What lives on the heap.
pub mod object;

/// Hash table keyed by interned strings.
pub mod table;

/// Lox values.
pub mod value;

pub use config::{GcConfig, VmConfig};
pub use error::{CompileError, InterpretError, RuntimeError};
pub use value::Value;
pub use vm::Vm;
