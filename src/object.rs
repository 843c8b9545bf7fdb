//! The kinds of things that live on the heap.
//!
//! `Object` is the type tag: every heap allocation is one variant of it, and every behaviour that
//! differs per kind (rendering, tracing, sizing) is a `match` over it. References between objects
//! are `HeapRef`s, which never own what they point at, so cycles between objects are fine.

use std::fmt::{Debug, Display};
use std::rc::Rc;

use crate::chunk::Chunk;
use crate::heap::{HeapRef, Marker};
use crate::table::Table;
use crate::value::Value;

/// An immutable, interned string.
#[derive(Debug)]
pub struct LoxString {
    chars: Box<str>,
    hash: u32,
}

impl LoxString {
    pub(crate) fn new(chars: &str, hash: u32) -> LoxString {
        LoxString {
            chars: chars.into(),
            hash,
        }
    }

    /// The contents.
    pub fn as_str(&self) -> &str {
        &self.chars
    }

    /// FNV-1a hash of the contents, computed at creation.
    pub fn hash(&self) -> u32 {
        self.hash
    }
}

/// 32-bit FNV-1a.
pub fn hash_string(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in s.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// A compiled function. Immutable once the compiler hands it over.
#[derive(Debug)]
pub struct Function {
    /// Number of parameters.
    pub arity: usize,
    /// The bytecode. Shared so that call frames can hold on to it without borrowing the heap object.
    pub chunk: Rc<Chunk>,
    /// If it's the main script, it has no name
    pub name: Option<HeapRef>,
    /// How many variables closures over this function capture.
    pub upvalue_count: usize,
}

/// Signature of host functions. Errors become runtime errors with the given message.
pub type NativeFn = fn(&[Value]) -> Result<Value, String>;

/// A function implemented in Rust.
pub struct NativeFunction {
    /// Name the function is defined under.
    pub name: &'static str,
    /// Number of arguments it takes.
    pub arity: usize,
    function: NativeFn,
}

impl NativeFunction {
    /// Wrap a Rust function.
    pub fn new(name: &'static str, arity: usize, function: NativeFn) -> NativeFunction {
        NativeFunction {
            name,
            arity,
            function,
        }
    }

    /// Call it. `args` has already been checked against the arity.
    pub fn call(&self, args: &[Value]) -> Result<Value, String> {
        (self.function)(args)
    }
}

impl Debug for NativeFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<native fn {}>", self.name)
    }
}

/// A function together with the variables it captured.
#[derive(Debug)]
pub struct Closure {
    /// The `Function` being closed over.
    pub function: HeapRef,
    /// One `Upvalue` object per captured variable.
    pub upvalues: Vec<HeapRef>,
}

/// A captured variable.
#[derive(Debug)]
pub enum Upvalue {
    /// Still lives on the VM stack, at this absolute slot.
    Open(usize),
    /// The declaring frame returned; the upvalue owns the value now.
    Closed(Value),
}

/// A class: its own methods plus a link to the class it inherits from.
#[derive(Debug)]
pub struct Class {
    /// Interned name.
    pub name: HeapRef,
    /// Method name to closure. Inherited methods aren't copied in.
    pub methods: Table,
    /// Set by `OP_INHERIT`.
    pub superclass: Option<HeapRef>,
}

/// An instance of a class.
#[derive(Debug)]
pub struct Instance {
    /// The class it was made from.
    pub class: HeapRef,
    /// Fields, which shadow methods of the same name.
    pub fields: Table,
}

/// A method read off an instance without calling it right away.
#[derive(Debug)]
pub struct BoundMethod {
    /// Becomes `this` when the method runs.
    pub receiver: Value,
    /// The method's closure.
    pub method: HeapRef,
}

/// Anything that lives on the heap.
#[allow(missing_docs)]
#[derive(Debug)]
pub enum Object {
    String(LoxString),
    Function(Function),
    Native(NativeFunction),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

impl Object {
    /// Short name of the kind of object, for logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Object::String(_) => "string",
            Object::Function(_) => "function",
            Object::Native(_) => "native",
            Object::Closure(_) => "closure",
            Object::Upvalue(_) => "upvalue",
            Object::Class(_) => "class",
            Object::Instance(_) => "instance",
            Object::BoundMethod(_) => "bound method",
        }
    }

    /// The string, if this is one.
    pub fn as_string(&self) -> Option<&LoxString> {
        match self {
            Object::String(s) => Some(s),
            _ => None,
        }
    }

    /// The function, if this is one.
    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Object::Function(f) => Some(f),
            _ => None,
        }
    }

    /// The closure, if this is one.
    pub fn as_closure(&self) -> Option<&Closure> {
        match self {
            Object::Closure(c) => Some(c),
            _ => None,
        }
    }

    /// The class, if this is one.
    pub fn as_class(&self) -> Option<&Class> {
        match self {
            Object::Class(c) => Some(c),
            _ => None,
        }
    }

    /// Mutable access to a class, to add methods or set the superclass.
    pub fn as_class_mut(&mut self) -> Option<&mut Class> {
        match self {
            Object::Class(c) => Some(c),
            _ => None,
        }
    }

    /// The instance, if this is one.
    pub fn as_instance(&self) -> Option<&Instance> {
        match self {
            Object::Instance(i) => Some(i),
            _ => None,
        }
    }

    /// Mutable access to an instance's fields.
    pub fn as_instance_mut(&mut self) -> Option<&mut Instance> {
        match self {
            Object::Instance(i) => Some(i),
            _ => None,
        }
    }

    /// Mutable access to an upvalue, for closing it.
    pub fn as_upvalue_mut(&mut self) -> Option<&mut Upvalue> {
        match self {
            Object::Upvalue(u) => Some(u),
            _ => None,
        }
    }

    /// Hand every reference this object holds to the marker.
    pub(crate) fn trace(&self, marker: &mut Marker) {
        match self {
            Object::String(_) | Object::Native(_) => {}
            Object::Function(f) => {
                if let Some(name) = &f.name {
                    marker.mark_object(name);
                }
                for constant in f.chunk.constants() {
                    marker.mark_value(constant);
                }
            }
            Object::Closure(c) => {
                marker.mark_object(&c.function);
                for upvalue in &c.upvalues {
                    marker.mark_object(upvalue);
                }
            }
            Object::Upvalue(Upvalue::Closed(value)) => marker.mark_value(value),
            Object::Upvalue(Upvalue::Open(_)) => {}
            Object::Class(c) => {
                marker.mark_object(&c.name);
                if let Some(superclass) = &c.superclass {
                    marker.mark_object(superclass);
                }
                marker.mark_table(&c.methods);
            }
            Object::Instance(i) => {
                marker.mark_object(&i.class);
                marker.mark_table(&i.fields);
            }
            Object::BoundMethod(b) => {
                marker.mark_value(&b.receiver);
                marker.mark_object(&b.method);
            }
        }
    }

    /// Rough number of bytes this object keeps alive, for deciding when to collect.
    pub(crate) fn size_hint(&self) -> usize {
        let extra = match self {
            Object::String(s) => s.chars.len(),
            Object::Function(f) => f.chunk.size_hint(),
            Object::Closure(c) => c.upvalues.len() * std::mem::size_of::<HeapRef>(),
            Object::Class(c) => c.methods.size_hint(),
            Object::Instance(i) => i.fields.size_hint(),
            Object::Native(_) | Object::Upvalue(_) | Object::BoundMethod(_) => 0,
        };
        std::mem::size_of::<Object>() + extra
    }
}

// Rendering only ever follows a fixed number of name links (closure -> function -> name), never
// into values, so it terminates on cyclic object graphs.
impl Display for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Object::String(s) => write!(f, "{}", s.as_str()),
            Object::Function(func) => match &func.name {
                None => write!(f, "<script>"),
                Some(name) => write!(f, "<fn {}>", name),
            },
            Object::Native(_) => write!(f, "<native fn>"),
            Object::Closure(c) => Display::fmt(&c.function, f),
            Object::Upvalue(_) => write!(f, "upvalue"),
            Object::Class(c) => write!(f, "<class {}>", c.name),
            Object::Instance(i) => {
                let class_name = i
                    .class
                    .with(|class| class.as_class().map(|c| c.name.clone()));
                match class_name {
                    Some(name) => write!(f, "{} instance", name),
                    None => write!(f, "instance"),
                }
            }
            Object::BoundMethod(b) => Display::fmt(&b.method, f),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fnv1a_matches_reference_values() {
        assert_eq!(hash_string(""), 2166136261);
        assert_eq!(hash_string("a"), 0xe40c292c);
        assert_ne!(hash_string("init"), hash_string("tini"));
    }
}
