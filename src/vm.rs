use std::io::Write;
use std::rc::Rc;

use crate::{
    chunk::{Chunk, Instruction},
    compiler,
    config::VmConfig,
    error::{InternalError, InterpretError, RuntimeError, RuntimeErrorKind, TraceFrame},
    heap::{Heap, HeapRef, Marker, Roots},
    object::{BoundMethod, Class, Closure, Instance, NativeFn, NativeFunction, Object, Upvalue},
    table::Table,
    value::Value,
};

mod native;

/// Maximum depth of the call stack.
pub const FRAMES_MAX: usize = 64;
/// Maximum number of values on the value stack: every frame may use all of its 256 slots.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

// Pop two numbers and push the result of the operator; the operands stay put if either isn't a number.
macro_rules! binary_arithmetic {
    ($self:ident, $op:tt) => {{
        let (a, b) = match ($self.peek(1)?, $self.peek(0)?) {
            (Value::Number(a), Value::Number(b)) => (*a, *b),
            _ => return Err(RuntimeErrorKind::OperandsMustBeNumbers),
        };
        $self.stack_pop()?;
        $self.stack_pop()?;
        // Lox is lax about comparing NaNs and stuff
        #[allow(clippy::float_cmp)]
        $self.stack_push((a $op b).into())?;
    }};
}

#[derive(Debug)]
struct CallFrame {
    closure: HeapRef,
    // The closure's code, kept here so that running it never has to go through the heap.
    chunk: Rc<Chunk>,
    ip: usize,
    // Index in the value stack of slot zero of this frame.
    slots: usize,
}

// What the run loop should do after an instruction.
enum Step {
    Continue,
    Halt,
}

// Everything the VM holds on to outside of the heap.
struct VmRoots<'r> {
    stack: &'r [Value],
    frames: &'r [CallFrame],
    globals: &'r Table,
    open_upvalues: &'r [HeapRef],
    init_string: &'r HeapRef,
}

impl Roots for VmRoots<'_> {
    fn mark_roots(&self, marker: &mut Marker) {
        for value in self.stack {
            marker.mark_value(value);
        }
        for frame in self.frames {
            marker.mark_object(&frame.closure);
        }
        marker.mark_table(self.globals);
        for upvalue in self.open_upvalues {
            marker.mark_object(upvalue);
        }
        marker.mark_object(self.init_string);
    }
}

/// The bytecode virtual machine.
///
/// A `Vm` can interpret any number of programs one after another; globals defined by one are visible to the next,
/// which is what the REPL relies on. After a runtime error the stacks are reset and the VM stays usable.
#[derive(Debug)]
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    // Upvalues still pointing into the stack, sorted by slot, lowest first.
    open_upvalues: Vec<HeapRef>,
    init_string: HeapRef,
    config: VmConfig,
}

impl Vm {
    /// A VM with the default configuration and the standard natives defined.
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    /// A VM with the given settings and the standard natives defined.
    pub fn with_config(config: VmConfig) -> Self {
        let mut heap = Heap::with_config(config.gc);
        let init_string = heap.intern("init", &());
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            config,
        };
        native::define_all(&mut vm);
        vm
    }

    /// Compile and run `source`, writing whatever it prints to `out`.
    pub fn interpret(&mut self, source: &str, out: &mut dyn Write) -> Result<(), InterpretError> {
        let function = {
            let roots = VmRoots {
                stack: &self.stack,
                frames: &self.frames,
                globals: &self.globals,
                open_upvalues: &self.open_upvalues,
                init_string: &self.init_string,
            };
            compiler::compile_with_listing(source, &mut self.heap, &roots, self.config.print_code)?
        };

        // The function has to stay reachable while its closure is allocated.
        self.stack.push(Value::Object(function.clone()));
        let closure = self.alloc(Object::Closure(Closure {
            function,
            upvalues: Vec::new(),
        }));
        self.stack.pop();
        self.stack.push(Value::Object(closure.clone()));

        let result = match self.call_closure(closure, 0) {
            Ok(()) => self.run(out),
            Err(e) => Err(e),
        };
        result.map_err(|kind| self.runtime_error(kind).into())
    }

    /// Make a Rust function callable from Lox as a global.
    pub fn define_native(&mut self, name: &'static str, arity: usize, function: NativeFn) {
        // Both objects sit on the stack until they're in the globals table, so a collection can't free them.
        let name_ref = self.intern(name);
        self.stack.push(Value::Object(name_ref.clone()));
        let native = self.alloc(Object::Native(NativeFunction::new(name, arity, function)));
        self.stack.push(Value::Object(native.clone()));
        self.globals.set(name_ref, Value::Object(native));
        self.stack.pop();
        self.stack.pop();
    }

    /// Run a full collection now.
    pub fn collect_garbage(&mut self) {
        let roots = VmRoots {
            stack: &self.stack,
            frames: &self.frames,
            globals: &self.globals,
            open_upvalues: &self.open_upvalues,
            init_string: &self.init_string,
        };
        self.heap.collect(&roots);
    }

    /// The heap, for inspecting collector state.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    fn alloc(&mut self, object: Object) -> HeapRef {
        let roots = VmRoots {
            stack: &self.stack,
            frames: &self.frames,
            globals: &self.globals,
            open_upvalues: &self.open_upvalues,
            init_string: &self.init_string,
        };
        self.heap.alloc(object, &roots)
    }

    fn intern(&mut self, chars: &str) -> HeapRef {
        let roots = VmRoots {
            stack: &self.stack,
            frames: &self.frames,
            globals: &self.globals,
            open_upvalues: &self.open_upvalues,
            init_string: &self.init_string,
        };
        self.heap.intern(chars, &roots)
    }

    // Capture the call stack for the error, then reset so the next interpret starts fresh.
    fn runtime_error(&mut self, kind: RuntimeErrorKind) -> RuntimeError {
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|frame| TraceFrame {
                line: frame.chunk.line(frame.ip.saturating_sub(1)),
                function: function_name(&frame.closure),
            })
            .collect();
        tracing::debug!(error = %kind, depth = self.frames.len(), "runtime error");
        // Closures that escaped keep their captured values once the stack is gone.
        self.close_upvalues(0);
        self.stack.clear();
        self.frames.clear();
        RuntimeError { kind, trace }
    }

    /// Run the interpreter until the script returns or an error occurs.
    fn run(&mut self, out: &mut dyn Write) -> Result<(), RuntimeErrorKind> {
        loop {
            let frame = self.frames.last_mut().ok_or(InternalError::NoFrame)?;
            let (instruction, width) = frame
                .chunk
                .instruction_at(frame.ip)
                .ok_or(InternalError::InvalidInstruction(frame.ip))?;
            #[cfg(feature = "trace")]
            {
                let stack: Vec<String> = self.stack.iter().map(|v| format!("[ {} ]", v)).collect();
                tracing::trace!("          {}", stack.concat());
                tracing::trace!("{}", frame.chunk.disassemble_instruction(frame.ip).0);
            }
            frame.ip += width;
            if let Step::Halt = self.execute(instruction, out)? {
                return Ok(());
            }
        }
    }

    fn execute(&mut self, instruction: Instruction, out: &mut dyn Write) -> Result<Step, RuntimeErrorKind> {
        match instruction {
            Instruction::Constant(idx) => {
                let value = self.read_constant(idx)?;
                self.stack_push(value)?;
            }
            Instruction::Nil => self.stack_push(Value::Nil)?,
            Instruction::True => self.stack_push(Value::Boolean(true))?,
            Instruction::False => self.stack_push(Value::Boolean(false))?,
            Instruction::Pop => {
                self.stack_pop()?;
            }
            Instruction::GetLocal(slot) => {
                let value = self.local_slot(slot)?.clone();
                self.stack_push(value)?;
            }
            Instruction::SetLocal(slot) => {
                let value = self.peek(0)?.clone();
                *self.local_slot(slot)? = value;
            }
            Instruction::GetGlobal(idx) => {
                let name = self.read_string(idx)?;
                match self.globals.get(&name) {
                    Some(value) => self.stack_push(value)?,
                    None => return Err(RuntimeErrorKind::UndefinedVariable(name.string_contents())),
                }
            }
            Instruction::DefineGlobal(idx) => {
                let name = self.read_string(idx)?;
                let value = self.peek(0)?.clone();
                self.globals.set(name, value);
                self.stack_pop()?;
            }
            Instruction::SetGlobal(idx) => {
                let name = self.read_string(idx)?;
                let value = self.peek(0)?.clone();
                // Assignment never creates a global, so undo the insert if there was nothing there.
                if self.globals.set(name.clone(), value) {
                    self.globals.delete(&name);
                    return Err(RuntimeErrorKind::UndefinedVariable(name.string_contents()));
                }
            }
            Instruction::GetUpvalue(idx) => {
                let upvalue = self.frame_upvalue(idx)?;
                let value = upvalue
                    .with(|o| match o {
                        Object::Upvalue(Upvalue::Open(slot)) => self.stack.get(*slot).cloned(),
                        Object::Upvalue(Upvalue::Closed(value)) => Some(value.clone()),
                        _ => None,
                    })
                    .ok_or(InternalError::UnexpectedValue("upvalue"))?;
                self.stack_push(value)?;
            }
            Instruction::SetUpvalue(idx) => {
                let upvalue = self.frame_upvalue(idx)?;
                let value = self.peek(0)?.clone();
                let open_slot = upvalue
                    .with_mut(|o| match o.as_upvalue_mut() {
                        Some(Upvalue::Open(slot)) => Some(Some(*slot)),
                        Some(Upvalue::Closed(closed)) => {
                            *closed = value.clone();
                            Some(None)
                        }
                        None => None,
                    })
                    .ok_or(InternalError::UnexpectedValue("upvalue"))?;
                if let Some(slot) = open_slot {
                    let target = self.stack.get_mut(slot).ok_or(InternalError::EmptyStack)?;
                    *target = value;
                }
            }
            Instruction::GetProperty(idx) => {
                let instance = match self.peek(0)? {
                    Value::Object(o) if o.with(|o| o.as_instance().is_some()) => o.clone(),
                    _ => return Err(RuntimeErrorKind::OnlyInstancesHaveProperties),
                };
                let name = self.read_string(idx)?;
                let (field, class) = instance.with(|o| match o.as_instance() {
                    Some(i) => Ok((i.fields.get(&name), i.class.clone())),
                    None => Err(InternalError::UnexpectedValue("instance")),
                })?;
                // Fields shadow methods.
                match field {
                    Some(value) => {
                        self.stack_pop()?;
                        self.stack_push(value)?;
                    }
                    None => self.bind_method(&class, &name)?,
                }
            }
            Instruction::SetProperty(idx) => {
                let instance = match self.peek(1)? {
                    Value::Object(o) if o.with(|o| o.as_instance().is_some()) => o.clone(),
                    _ => return Err(RuntimeErrorKind::OnlyInstancesHaveFields),
                };
                let name = self.read_string(idx)?;
                let value = self.peek(0)?.clone();
                instance.with_mut(|o| {
                    if let Some(i) = o.as_instance_mut() {
                        i.fields.set(name, value.clone());
                    }
                });
                self.heap.reaccount(&instance);
                self.stack_pop()?;
                self.stack_pop()?;
                self.stack_push(value)?;
            }
            Instruction::GetSuper(idx) => {
                let name = self.read_string(idx)?;
                let superclass = self.pop_object("class")?;
                self.bind_method(&superclass, &name)?;
            }
            Instruction::Equal => {
                let b = self.stack_pop()?;
                let a = self.stack_pop()?;
                self.stack_push(Value::Boolean(a == b))?;
            }
            Instruction::Greater => binary_arithmetic!(self, >),
            Instruction::Less => binary_arithmetic!(self, <),
            Instruction::Add => self.add()?,
            Instruction::Subtract => binary_arithmetic!(self, -),
            Instruction::Multiply => binary_arithmetic!(self, *),
            Instruction::Divide => binary_arithmetic!(self, /),
            Instruction::Not => {
                let value = self.stack_pop()?;
                self.stack_push(Value::Boolean(value.is_falsey()))?;
            }
            Instruction::Negate => {
                let number = self
                    .peek(0)?
                    .as_number()
                    .ok_or(RuntimeErrorKind::OperandMustBeNumber)?;
                self.stack_pop()?;
                self.stack_push(Value::Number(-number))?;
            }
            Instruction::Print => {
                let value = self.stack_pop()?;
                writeln!(out, "{}", value)?;
            }
            Instruction::Jump(offset) => {
                self.frame_mut()?.ip += usize::from(offset);
            }
            Instruction::JumpIfFalse(offset) => {
                if self.peek(0)?.is_falsey() {
                    self.frame_mut()?.ip += usize::from(offset);
                }
            }
            Instruction::Loop(offset) => {
                let frame = self.frame_mut()?;
                frame.ip = frame
                    .ip
                    .checked_sub(usize::from(offset))
                    .ok_or(InternalError::InvalidInstruction(frame.ip))?;
            }
            Instruction::Call(arg_count) => {
                let callee = self.peek(usize::from(arg_count))?.clone();
                self.call_value(callee, usize::from(arg_count))?;
            }
            Instruction::Invoke(idx, arg_count) => {
                let name = self.read_string(idx)?;
                self.invoke(&name, usize::from(arg_count))?;
            }
            Instruction::SuperInvoke(idx, arg_count) => {
                let name = self.read_string(idx)?;
                let superclass = self.pop_object("class")?;
                self.invoke_from_class(&superclass, &name, usize::from(arg_count))?;
            }
            Instruction::Closure(idx) => self.make_closure(idx)?,
            Instruction::CloseUpvalue => {
                let top = self.stack.len().checked_sub(1).ok_or(InternalError::EmptyStack)?;
                self.close_upvalues(top);
                self.stack_pop()?;
            }
            Instruction::Return => {
                let result = self.stack_pop()?;
                let frame = self.frames.pop().ok_or(InternalError::NoFrame)?;
                self.close_upvalues(frame.slots);
                self.stack.truncate(frame.slots);
                if self.frames.is_empty() {
                    return Ok(Step::Halt);
                }
                self.stack_push(result)?;
            }
            Instruction::Class(idx) => {
                let name = self.read_string(idx)?;
                let class = self.alloc(Object::Class(Class {
                    name,
                    methods: Table::new(),
                    superclass: None,
                }));
                self.stack_push(Value::Object(class))?;
            }
            Instruction::Inherit => {
                let superclass = match self.peek(1)? {
                    Value::Object(o) if o.with(|o| o.as_class().is_some()) => o.clone(),
                    _ => return Err(RuntimeErrorKind::SuperclassMustBeClass),
                };
                let subclass = self.pop_object("class")?;
                subclass.with_mut(|o| {
                    if let Some(class) = o.as_class_mut() {
                        class.superclass = Some(superclass);
                    }
                });
            }
            Instruction::Method(idx) => {
                let name = self.read_string(idx)?;
                let method = self.peek(0)?.clone();
                let class = match self.peek(1)? {
                    Value::Object(o) => o.clone(),
                    _ => return Err(InternalError::UnexpectedValue("class").into()),
                };
                class.with_mut(|o| {
                    if let Some(class) = o.as_class_mut() {
                        class.methods.set(name, method);
                    }
                });
                self.heap.reaccount(&class);
                self.stack_pop()?;
            }
        }
        Ok(Step::Continue)
    }

    fn add(&mut self) -> Result<(), RuntimeErrorKind> {
        match (self.peek(1)?, self.peek(0)?) {
            (Value::Number(a), Value::Number(b)) => {
                let sum = a + b;
                self.stack_pop()?;
                self.stack_pop()?;
                self.stack_push(Value::Number(sum))
            }
            (Value::Object(a), Value::Object(b)) => {
                let concatenated = match (a.map_as_string(|a| a.as_str().to_string()), b.map_as_string(|b| b.as_str().to_string())) {
                    (Some(a), Some(b)) => a + &b,
                    _ => return Err(RuntimeErrorKind::OperandsMustBeNumbersOrStrings),
                };
                // Operands are still on the stack, in case interning collects.
                let result = self.intern(&concatenated);
                self.stack_pop()?;
                self.stack_pop()?;
                self.stack_push(Value::Object(result))
            }
            _ => Err(RuntimeErrorKind::OperandsMustBeNumbersOrStrings),
        }
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), RuntimeErrorKind> {
        let callee = match callee {
            Value::Object(o) => o,
            _ => return Err(RuntimeErrorKind::NotCallable),
        };
        let callee_slot = self
            .stack
            .len()
            .checked_sub(arg_count + 1)
            .ok_or(InternalError::EmptyStack)?;

        enum Kind {
            Bound(Value, HeapRef),
            Class,
            Closure,
            Native(usize),
            Other,
        }
        let kind = callee.with(|o| match o {
            Object::BoundMethod(b) => Kind::Bound(b.receiver.clone(), b.method.clone()),
            Object::Class(_) => Kind::Class,
            Object::Closure(_) => Kind::Closure,
            Object::Native(n) => Kind::Native(n.arity),
            _ => Kind::Other,
        });

        match kind {
            Kind::Bound(receiver, method) => {
                self.stack[callee_slot] = receiver;
                self.call_closure(method, arg_count)
            }
            Kind::Class => {
                // The class is still in the callee slot, so it survives allocating the instance.
                let instance = self.alloc(Object::Instance(Instance {
                    class: callee.clone(),
                    fields: Table::new(),
                }));
                self.stack[callee_slot] = Value::Object(instance);
                let init_string = self.init_string.clone();
                match find_method(&callee, &init_string) {
                    Some(initializer) => self.call_closure(initializer, arg_count),
                    None if arg_count != 0 => Err(RuntimeErrorKind::ArityMismatch {
                        expected: 0,
                        got: arg_count,
                    }),
                    None => Ok(()),
                }
            }
            Kind::Closure => self.call_closure(callee, arg_count),
            Kind::Native(arity) => {
                if arity != arg_count {
                    return Err(RuntimeErrorKind::ArityMismatch {
                        expected: arity,
                        got: arg_count,
                    });
                }
                let args = &self.stack[callee_slot + 1..];
                let result = callee
                    .with(|o| match o {
                        Object::Native(n) => Ok(n.call(args)),
                        _ => Err(InternalError::UnexpectedValue("native function")),
                    })?
                    .map_err(RuntimeErrorKind::Native)?;
                self.stack.truncate(callee_slot);
                self.stack_push(result)
            }
            Kind::Other => Err(RuntimeErrorKind::NotCallable),
        }
    }

    fn call_closure(&mut self, closure: HeapRef, arg_count: usize) -> Result<(), RuntimeErrorKind> {
        let function = closure
            .with(|o| o.as_closure().map(|c| c.function.clone()))
            .ok_or(InternalError::UnexpectedValue("closure"))?;
        let (arity, chunk) = function
            .with(|o| o.as_function().map(|f| (f.arity, f.chunk.clone())))
            .ok_or(InternalError::UnexpectedValue("function"))?;
        if arg_count != arity {
            return Err(RuntimeErrorKind::ArityMismatch {
                expected: arity,
                got: arg_count,
            });
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(RuntimeErrorKind::StackOverflow);
        }
        let slots = self
            .stack
            .len()
            .checked_sub(arg_count + 1)
            .ok_or(InternalError::EmptyStack)?;
        self.frames.push(CallFrame {
            closure,
            chunk,
            ip: 0,
            slots,
        });
        Ok(())
    }

    fn invoke(&mut self, name: &HeapRef, arg_count: usize) -> Result<(), RuntimeErrorKind> {
        let receiver = match self.peek(arg_count)? {
            Value::Object(o) => o.clone(),
            _ => return Err(RuntimeErrorKind::OnlyInstancesHaveMethods),
        };
        let (field, class) = receiver
            .with(|o| o.as_instance().map(|i| (i.fields.get(name), i.class.clone())))
            .ok_or(RuntimeErrorKind::OnlyInstancesHaveMethods)?;
        match field {
            // A field holding something callable, not a method.
            Some(value) => {
                let callee_slot = self.stack.len() - arg_count - 1;
                self.stack[callee_slot] = value.clone();
                self.call_value(value, arg_count)
            }
            None => self.invoke_from_class(&class, name, arg_count),
        }
    }

    fn invoke_from_class(&mut self, class: &HeapRef, name: &HeapRef, arg_count: usize) -> Result<(), RuntimeErrorKind> {
        let method = find_method(class, name)
            .ok_or_else(|| RuntimeErrorKind::UndefinedProperty(name.string_contents()))?;
        self.call_closure(method, arg_count)
    }

    // Replace the instance on top of the stack with the named method bound to it.
    fn bind_method(&mut self, class: &HeapRef, name: &HeapRef) -> Result<(), RuntimeErrorKind> {
        let method = find_method(class, name)
            .ok_or_else(|| RuntimeErrorKind::UndefinedProperty(name.string_contents()))?;
        let receiver = self.peek(0)?.clone();
        let bound = self.alloc(Object::BoundMethod(BoundMethod { receiver, method }));
        self.stack_pop()?;
        self.stack_push(Value::Object(bound))
    }

    fn make_closure(&mut self, idx: u8) -> Result<(), RuntimeErrorKind> {
        let function = match self.read_constant(idx)? {
            Value::Object(o) => o,
            _ => return Err(InternalError::BadConstant(idx).into()),
        };
        let upvalue_count = function
            .with(|o| o.as_function().map(|f| f.upvalue_count))
            .ok_or(InternalError::BadConstant(idx))?;

        // Every upvalue is either in open_upvalues or already owned by the running closure, so they're all rooted
        // while the rest get allocated.
        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let (is_local, index, slots) = {
                let frame = self.frame_mut()?;
                let is_local = frame.chunk.byte(frame.ip);
                let index = frame.chunk.byte(frame.ip + 1);
                frame.ip += 2;
                match (is_local, index) {
                    (Some(is_local), Some(index)) => (is_local == 1, index, frame.slots),
                    _ => return Err(InternalError::InvalidInstruction(frame.ip).into()),
                }
            };
            let upvalue = if is_local {
                self.capture_upvalue(slots + usize::from(index))
            } else {
                self.frame_upvalue(index)?
            };
            upvalues.push(upvalue);
        }

        let closure = self.alloc(Object::Closure(Closure { function, upvalues }));
        self.stack_push(Value::Object(closure))
    }

    // The open upvalue for a stack slot, creating it if this is the first closure to capture the slot.
    fn capture_upvalue(&mut self, slot: usize) -> HeapRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, upvalue) in self.open_upvalues.iter().enumerate().rev() {
            match open_slot(upvalue) {
                Some(s) if s == slot => return upvalue.clone(),
                Some(s) if s < slot => break,
                _ => insert_at = i,
            }
        }
        let upvalue = self.alloc(Object::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, upvalue.clone());
        upvalue
    }

    // Close every open upvalue at or above `last`, moving the variable off the stack and into the upvalue.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(upvalue) = self.open_upvalues.last() {
            let slot = match open_slot(upvalue) {
                Some(slot) if slot >= last => slot,
                _ => break,
            };
            let value = self.stack.get(slot).cloned().unwrap_or(Value::Nil);
            upvalue.with_mut(|o| {
                if let Some(u) = o.as_upvalue_mut() {
                    *u = Upvalue::Closed(value);
                }
            });
            self.open_upvalues.pop();
        }
    }

    fn frame(&self) -> Result<&CallFrame, InternalError> {
        self.frames.last().ok_or(InternalError::NoFrame)
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame, InternalError> {
        self.frames.last_mut().ok_or(InternalError::NoFrame)
    }

    fn local_slot(&mut self, slot: u8) -> Result<&mut Value, InternalError> {
        let index = self.frame()?.slots + usize::from(slot);
        self.stack.get_mut(index).ok_or(InternalError::EmptyStack)
    }

    fn frame_upvalue(&self, idx: u8) -> Result<HeapRef, InternalError> {
        self.frame()?
            .closure
            .with(|o| o.as_closure().and_then(|c| c.upvalues.get(usize::from(idx)).cloned()))
            .ok_or(InternalError::UnexpectedValue("upvalue"))
    }

    fn read_constant(&self, idx: u8) -> Result<Value, InternalError> {
        self.frame()?
            .chunk
            .constant(idx)
            .cloned()
            .ok_or(InternalError::BadConstant(idx))
    }

    fn read_string(&self, idx: u8) -> Result<HeapRef, InternalError> {
        match self.read_constant(idx)? {
            Value::Object(o) if o.with(|o| o.as_string().is_some()) => Ok(o),
            _ => Err(InternalError::BadConstant(idx)),
        }
    }

    fn pop_object(&mut self, expected: &'static str) -> Result<HeapRef, InternalError> {
        match self.stack_pop()? {
            Value::Object(o) => Ok(o),
            _ => Err(InternalError::UnexpectedValue(expected)),
        }
    }

    fn peek(&self, distance: usize) -> Result<&Value, InternalError> {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .and_then(|idx| self.stack.get(idx))
            .ok_or(InternalError::EmptyStack)
    }

    fn stack_push(&mut self, value: Value) -> Result<(), RuntimeErrorKind> {
        if self.stack.len() >= STACK_MAX {
            Err(RuntimeErrorKind::StackOverflow)
        } else {
            self.stack.push(value);
            Ok(())
        }
    }

    fn stack_pop(&mut self) -> Result<Value, InternalError> {
        self.stack.pop().ok_or(InternalError::EmptyStack)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

// Look a method up on the class, then on each superclass in turn.
fn find_method(class: &HeapRef, name: &HeapRef) -> Option<HeapRef> {
    let mut current = Some(class.clone());
    while let Some(class) = current {
        let (method, superclass) = class.with(|o| {
            o.as_class()
                .map(|c| (c.methods.get(name), c.superclass.clone()))
        })?;
        if let Some(Value::Object(method)) = method {
            return Some(method);
        }
        current = superclass;
    }
    None
}

fn open_slot(upvalue: &HeapRef) -> Option<usize> {
    upvalue.with(|o| match o {
        Object::Upvalue(Upvalue::Open(slot)) => Some(*slot),
        _ => None,
    })
}

fn function_name(closure: &HeapRef) -> Option<String> {
    let function = closure.with(|o| o.as_closure().map(|c| c.function.clone()))?;
    let name = function.with(|o| o.as_function().and_then(|f| f.name.clone()))?;
    Some(name.string_contents())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run(vm: &mut Vm, source: &str) -> Result<String, InterpretError> {
        let mut out = Vec::new();
        vm.interpret(source, &mut out)?;
        Ok(String::from_utf8(out).unwrap())
    }

    #[test]
    fn arithmetic_and_printing() {
        let mut vm = Vm::new();
        assert_eq!(run(&mut vm, "print 1 + 2 * 3;").unwrap(), "7\n");
        assert_eq!(run(&mut vm, "print (5 - 1) / 2;").unwrap(), "2\n");
        assert_eq!(run(&mut vm, "print -2.5;").unwrap(), "-2.5\n");
        assert_eq!(run(&mut vm, "print !nil == true;").unwrap(), "true\n");
        assert_eq!(run(&mut vm, "print 1 < 2 and 3 >= 4;").unwrap(), "false\n");
        assert_eq!(run(&mut vm, "print nil or \"x\";").unwrap(), "x\n");
    }

    #[test]
    fn truthiness() {
        let mut vm = Vm::new();
        let out = run(
            &mut vm,
            "print !0; print !\"\"; print !nil; print !false; if (0) print \"zero is true\";",
        )
        .unwrap();
        assert_eq!(out, "false\nfalse\ntrue\ntrue\nzero is true\n");
    }

    #[test]
    fn strings_concatenate_and_intern() {
        let mut vm = Vm::new();
        let out = run(
            &mut vm,
            "var a = \"con\" + \"cat\"; print a; print a == \"concat\";",
        )
        .unwrap();
        assert_eq!(out, "concat\ntrue\n");
    }

    #[test]
    fn globals_persist_between_runs() {
        let mut vm = Vm::new();
        run(&mut vm, "var x = 10;").unwrap();
        assert_eq!(run(&mut vm, "x = x + 1; print x;").unwrap(), "11\n");
    }

    #[test]
    fn undefined_global_assignment_is_an_error_and_defines_nothing() {
        let mut vm = Vm::new();
        let err = run(&mut vm, "y = 1;").unwrap_err();
        assert_eq!(err.to_string(), "Undefined variable 'y'.\n[line 1] in script");
        let err = run(&mut vm, "print y;").unwrap_err();
        assert!(matches!(
            err,
            InterpretError::Runtime(RuntimeError {
                kind: RuntimeErrorKind::UndefinedVariable(_),
                ..
            })
        ));
    }

    #[test]
    fn vm_is_usable_after_a_runtime_error() {
        let mut vm = Vm::new();
        let err = run(&mut vm, "fun f() { return 1 + nil; }\nf();").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Operands must be two numbers or two strings.\n[line 1] in f()\n[line 2] in script"
        );
        assert_eq!(run(&mut vm, "print f;").unwrap(), "<fn f>\n");
    }

    #[test]
    fn escaped_closures_keep_their_values_after_a_runtime_error() {
        let mut vm = Vm::new();
        let source = r#"
            var get;
            var set;
            fun outer() {
                var x = "captured";
                fun g() { return x; }
                fun s(v) { x = v; }
                get = g;
                set = s;
                nil();
            }
            outer();
        "#;
        let err = run(&mut vm, source).unwrap_err();
        assert!(err.to_string().starts_with("Can only call functions and classes."));
        assert!(vm.open_upvalues.is_empty());

        let out = run(&mut vm, "{ var y = \"other\"; print get(); set(\"changed\"); print y; print get(); }")
            .unwrap();
        assert_eq!(out, "captured\nother\nchanged\n");
    }

    #[test]
    fn type_errors() {
        let cases = [
            ("-\"a\";", "Operand must be a number."),
            ("1 < \"a\";", "Operands must be numbers."),
            ("\"a\" + 1;", "Operands must be two numbers or two strings."),
            ("nil();", "Can only call functions and classes."),
            ("var x = 1; x.y;", "Only instances have properties."),
            ("var x = 1; x.y = 2;", "Only instances have fields."),
            ("var x = 1; x.y();", "Only instances have methods."),
            ("class A {} A().nope;", "Undefined property 'nope'."),
            ("fun f(a) {} f();", "Expected 1 arguments but got 0."),
            ("class A {} A(1);", "Expected 0 arguments but got 1."),
            ("var B = 1; class A < B {}", "Superclass must be a class."),
        ];
        for (source, message) in cases {
            let mut vm = Vm::new();
            match run(&mut vm, source) {
                Err(InterpretError::Runtime(e)) => assert_eq!(e.kind.to_string(), message, "{}", source),
                other => panic!("{}: expected a runtime error, got {:?}", source, other),
            }
        }
    }

    #[test]
    fn deep_recursion_overflows() {
        let mut vm = Vm::new();
        let err = run(&mut vm, "fun f() { f(); } f();").unwrap_err();
        match err {
            InterpretError::Runtime(e) => {
                assert!(matches!(e.kind, RuntimeErrorKind::StackOverflow));
                assert_eq!(e.trace.len(), FRAMES_MAX);
                assert_eq!(e.trace.last().unwrap().function, None);
            }
            other => panic!("{:?}", other),
        }
    }

    #[test]
    fn recursion_within_the_limit() {
        let mut vm = Vm::new();
        let out = run(
            &mut vm,
            "fun fib(n) { if (n < 2) return n; return fib(n - 2) + fib(n - 1); } print fib(15);",
        )
        .unwrap();
        assert_eq!(out, "610\n");
    }

    #[test]
    fn clock_is_a_number() {
        let mut vm = Vm::new();
        assert_eq!(
            run(&mut vm, "var t = clock(); print t >= 0; print clock;").unwrap(),
            "true\n<native fn>\n"
        );
    }

    #[test]
    fn natives_can_fail() {
        fn fail(_args: &[Value]) -> Result<Value, String> {
            Err("it broke".to_string())
        }
        let mut vm = Vm::new();
        vm.define_native("fail", 0, fail);
        let err = run(&mut vm, "fail();").unwrap_err();
        assert_eq!(err.to_string(), "it broke\n[line 1] in script");
    }

    #[test]
    fn temporaries_are_collected() {
        let mut vm = Vm::new();
        run(
            &mut vm,
            "var keep = \"kept\"; for (var i = 0; i < 100; i = i + 1) { var s = \"tmp\" + \"orary\" + \"!\"; }",
        )
        .unwrap();
        vm.collect_garbage();
        let after_first = vm.heap().object_count();
        run(&mut vm, "for (var i = 0; i < 100; i = i + 1) { var s = \"more\" + \"garbage\"; }").unwrap();
        vm.collect_garbage();
        assert_eq!(vm.heap().object_count(), after_first);
    }

    #[test]
    fn field_growth_is_counted_and_released() {
        let mut vm = Vm::new();
        run(&mut vm, "class Bag {} var bag = Bag();").unwrap();
        vm.collect_garbage();
        let baseline = vm.heap().bytes_allocated();

        let fields: String = (0..100).map(|i| format!("bag.f{} = nil;\n", i)).collect();
        run(&mut vm, &fields).unwrap();
        vm.collect_garbage();
        let with_fields = vm.heap().bytes_allocated();
        // 100 interned names plus the instance's grown field table
        let names_only = {
            let mut other = Vm::new();
            run(&mut other, "class Bag {} var bag = Bag();").unwrap();
            let names: String = (0..100).map(|i| format!("var f{};\n", i)).collect();
            run(&mut other, &names).unwrap();
            other.collect_garbage();
            other.heap().bytes_allocated()
        };
        assert!(with_fields > names_only);

        run(&mut vm, "bag = Bag();").unwrap();
        vm.collect_garbage();
        assert_eq!(vm.heap().bytes_allocated(), baseline);
    }
}
