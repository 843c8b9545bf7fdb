// heap is our internal interface for allocating objects that can be tracked and garbage collected.
//
// The entry point is the `Heap` type and its `alloc`/`intern` methods. These allocate a new Lox object and return a
// reference which can be used to access the object: a `HeapRef`. The underlying objects are all owned by the Heap, in
// one singly linked list of nodes, and a `HeapRef` is only a weak pointer into it. That means a HeapRef never keeps
// anything alive by itself: an object survives a collection only if the collector reached it from a root. Accessing a
// HeapRef whose object has been swept is a collector bug, and panics.
//
// ```rust
//    use rslox::heap::Heap;
//    let mut heap = Heap::new();
//    let string_ref = heap.intern("my string", &());
//    // the `map_as_*` methods can access the inner value in a convenient way.
//    string_ref.map_as_string(|s| assert_eq!(s.as_str(), "my string"));
// ```
//
// Internally, each node keeps an `Rc<HeapObject>`, and `HeapRef` is a `Weak` to it. The object itself sits in a
// RefCell, so borrowing it mutably while it's already borrowed is a runtime panic; the VM never holds a borrow across
// an allocation, which is the only point at which the collector looks at objects.

use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Display};
use std::rc::{Rc, Weak};

use crate::config::GcConfig;
use crate::object::{hash_string, LoxString, Object};
use crate::table::Table;
use crate::value::Value;

/// Header plus body of a heap allocation.
#[derive(Debug)]
struct HeapObject {
    marked: Cell<bool>,
    // Bytes this object is counted for in `Heap::bytes_allocated`.
    size: Cell<usize>,
    object: RefCell<Object>,
}

// Internal representation of a heap object. The objects are arranged in a linked list using the `next` field, and the objects
// are owned by the nodes (with the head node owned by the Heap itself)
#[derive(Debug)]
struct HeapNode {
    next: Option<Box<HeapNode>>,
    object: Rc<HeapObject>,
}

/// A non-owning handle to a heap object.
#[derive(Clone)]
pub struct HeapRef {
    value: Weak<HeapObject>,
}

impl HeapRef {
    fn upgrade(&self) -> Rc<HeapObject> {
        self.value
            .upgrade()
            .expect("heap object used after the collector freed it")
    }

    /// Identity comparison.
    pub fn ptr_eq(&self, other: &HeapRef) -> bool {
        Weak::ptr_eq(&self.value, &other.value)
    }

    /// Run `f` with a shared borrow of the object.
    pub fn with<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&Object) -> Ret,
    {
        let obj = self.upgrade();
        let borrowed = obj.object.borrow();
        let ret = f(&borrowed);
        ret
    }

    /// Run `f` with a mutable borrow of the object.
    pub fn with_mut<F, Ret>(&self, f: F) -> Ret
    where
        F: FnOnce(&mut Object) -> Ret,
    {
        let obj = self.upgrade();
        let mut borrowed = obj.object.borrow_mut();
        let ret = f(&mut borrowed);
        ret
    }

    /// Apply a function to the inner object if it's a string, returning the result if it's a string
    /// And none if it isn't a string
    pub fn map_as_string<F, Ret>(&self, f: F) -> Option<Ret>
    where
        F: FnOnce(&LoxString) -> Ret,
    {
        self.with(|o| o.as_string().map(f))
    }

    /// Cached hash of a string object; 0 for anything else, which never ends up as a table key.
    pub fn string_hash(&self) -> u32 {
        self.map_as_string(|s| s.hash()).unwrap_or(0)
    }

    /// Copy of the string's contents, for error messages.
    pub fn string_contents(&self) -> String {
        self.map_as_string(|s| s.as_str().to_string())
            .unwrap_or_default()
    }

    pub(crate) fn is_marked(&self) -> bool {
        self.upgrade().marked.get()
    }

    /// Whether the object is still alive. Only tests should need this.
    pub fn is_live(&self) -> bool {
        self.value.strong_count() > 0
    }
}

impl PartialEq for HeapRef {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

// Never render the object graph here: Debug output of a Value must not depend on (or walk through) what it points at.
impl Debug for HeapRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.value.upgrade() {
            Some(obj) => match obj.object.try_borrow() {
                Ok(o) => write!(f, "HeapRef({} @ {:p})", o.kind_name(), Rc::as_ptr(&obj)),
                Err(_) => write!(f, "HeapRef(<borrowed> @ {:p})", Rc::as_ptr(&obj)),
            },
            None => write!(f, "HeapRef(<freed>)"),
        }
    }
}

impl Display for HeapRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.with(|o| Display::fmt(o, f))
    }
}

/// Anything that holds references the collector must treat as live.
pub trait Roots {
    /// Mark everything held directly.
    fn mark_roots(&self, marker: &mut Marker);
}

impl Roots for () {
    fn mark_roots(&self, _marker: &mut Marker) {}
}

impl Roots for Vec<Value> {
    fn mark_roots(&self, marker: &mut Marker) {
        for value in self {
            marker.mark_value(value);
        }
    }
}

impl<const N: usize> Roots for [Value; N] {
    fn mark_roots(&self, marker: &mut Marker) {
        for value in self {
            marker.mark_value(value);
        }
    }
}

impl Roots for Table {
    fn mark_roots(&self, marker: &mut Marker) {
        marker.mark_table(self);
    }
}

/// Mark state of one collection: the gray worklist of objects marked but not yet traced.
#[derive(Debug, Default)]
pub struct Marker {
    gray: Vec<HeapRef>,
}

impl Marker {
    /// Mark the object a value refers to, if any.
    pub fn mark_value(&mut self, value: &Value) {
        if let Value::Object(r) = value {
            self.mark_object(r);
        }
    }

    /// Mark an object and queue it for tracing, unless it's already marked.
    pub fn mark_object(&mut self, r: &HeapRef) {
        let obj = r.upgrade();
        if !obj.marked.replace(true) {
            self.gray.push(r.clone());
        }
    }

    /// Mark every key and value.
    pub fn mark_table(&mut self, table: &Table) {
        for (key, value) in table.iter() {
            self.mark_object(key);
            self.mark_value(value);
        }
    }

    fn trace_references(&mut self) {
        while let Some(r) = self.gray.pop() {
            r.with(|o| o.trace(self));
        }
    }
}

/// A type for allocating, tracking, and GCing heap-allocated Lox objects
pub struct Heap {
    head: Option<Box<HeapNode>>,
    // Weak: entries whose string wasn't marked are removed before each sweep.
    strings: Table,
    object_count: usize,
    bytes_allocated: usize,
    next_gc: usize,
    config: GcConfig,
}

impl Heap {
    /// A new, empty heap with the default collector settings.
    pub fn new() -> Heap {
        Heap::with_config(GcConfig::default())
    }

    /// A new, empty heap that collects according to `config`.
    pub fn with_config(config: GcConfig) -> Heap {
        Heap {
            head: None,
            strings: Table::new(),
            object_count: 0,
            bytes_allocated: 0,
            next_gc: config.initial_threshold,
            config,
        }
    }

    /// Number of objects currently allocated.
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// Estimated bytes held by live objects.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Move `object` onto the heap. This may first run a collection, in which `roots` and whatever `object` itself
    /// refers to are kept alive.
    pub fn alloc(&mut self, object: Object, roots: &dyn Roots) -> HeapRef {
        let size = object.size_hint();
        if self.config.stress || self.bytes_allocated + size > self.next_gc {
            self.collect_with_pending(roots, Some(&object));
        }
        self.bytes_allocated += size;
        self.object_count += 1;

        let o = Rc::new(HeapObject {
            marked: Cell::new(false),
            size: Cell::new(size),
            object: RefCell::new(object),
        });
        let node = HeapNode {
            object: o.clone(),
            next: self.head.take(),
        };
        self.head = Some(Box::new(node));
        HeapRef {
            value: Rc::downgrade(&o),
        }
    }

    /// Recount `r` after it grew in place, like an instance gaining fields or a class gaining methods. The new size
    /// counts towards the next collection.
    pub fn reaccount(&mut self, r: &HeapRef) {
        let obj = r.upgrade();
        let size = obj.object.borrow().size_hint();
        let old = obj.size.replace(size);
        self.bytes_allocated = self.bytes_allocated - old + size;
    }

    /// The canonical string object with these contents, allocating it if this is the first time it's been seen.
    pub fn intern(&mut self, chars: &str, roots: &dyn Roots) -> HeapRef {
        let hash = hash_string(chars);
        if let Some(existing) = self.strings.find_string(chars, hash) {
            return existing;
        }
        let string = self.alloc(Object::String(LoxString::new(chars, hash)), roots);
        self.strings.set(string.clone(), Value::Nil);
        string
    }

    /// Free every object not reachable from `roots`.
    pub fn collect(&mut self, roots: &dyn Roots) {
        self.collect_with_pending(roots, None);
    }

    fn collect_with_pending(&mut self, roots: &dyn Roots, pending: Option<&Object>) {
        let before = self.bytes_allocated;
        let objects_before = self.object_count;
        tracing::debug!(bytes = before, objects = objects_before, "gc begin");

        let mut marker = Marker::default();
        roots.mark_roots(&mut marker);
        if let Some(object) = pending {
            object.trace(&mut marker);
        }
        marker.trace_references();
        self.strings.remove_unmarked();
        self.sweep();

        self.next_gc = (self.bytes_allocated * self.config.growth_factor)
            .max(self.config.initial_threshold);
        tracing::debug!(
            freed_bytes = before - self.bytes_allocated,
            freed_objects = objects_before - self.object_count,
            remaining = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc end"
        );
    }

    // Rebuild the list from the survivors, clearing their mark for next time. Dropping a node drops the only
    // strong reference to its object, which frees it.
    fn sweep(&mut self) {
        let mut survivors: Option<Box<HeapNode>> = None;
        let mut next = self.head.take();
        while let Some(mut node) = next {
            next = node.next.take();
            if node.object.marked.replace(false) {
                node.next = survivors;
                survivors = Some(node);
            } else {
                #[cfg(feature = "trace")]
                tracing::trace!(kind = node.object.object.borrow().kind_name(), "free");
                self.bytes_allocated -= node.object.size.get();
                self.object_count -= 1;
            }
        }
        self.head = survivors;
    }
}

impl Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("object_count", &self.object_count)
            .field("interned", &self.strings.len())
            .field("bytes_allocated", &self.bytes_allocated)
            .field("next_gc", &self.next_gc)
            .field("config", &self.config)
            .finish()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

// The default drop would recurse once per node.
impl Drop for Heap {
    fn drop(&mut self) {
        let mut next = self.head.take();
        while let Some(mut node) = next {
            next = node.next.take();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::object::{Closure, Function, Upvalue};
    use crate::chunk::Chunk;

    #[test]
    fn test_heap() {
        let mut heap = Heap::new();
        let n1 = heap.intern("Goodbye, world", &());
        let n2 = heap.intern("Hello, world", &());

        n1.map_as_string(|s| assert_eq!(s.as_str(), "Goodbye, world"));
        n2.map_as_string(|s| assert_eq!(s.as_str(), "Hello, world"));
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn interning_gives_one_object_per_content() {
        let mut heap = Heap::new();
        let a = heap.intern("same", &());
        let owned = String::from("sa") + "me";
        let b = heap.intern(&owned, &());
        let c = heap.intern("different", &());
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&c));
        assert_eq!(heap.object_count(), 2);
    }

    #[test]
    fn collect_keeps_exactly_the_rooted_set() {
        let mut heap = Heap::new();
        let rooted: Vec<Value> = (0..5)
            .map(|i| Value::Object(heap.intern(&format!("kept {}", i), &())))
            .collect();
        let garbage: Vec<HeapRef> = (0..20)
            .map(|i| heap.intern(&format!("garbage {}", i), &()))
            .collect();
        assert_eq!(heap.object_count(), 25);

        heap.collect(&rooted);

        assert_eq!(heap.object_count(), 5);
        assert!(garbage.iter().all(|g| !g.is_live()));
        assert!(rooted.iter().all(|v| v.as_object().unwrap().is_live()));

        // A collected string can be interned again and is a new object.
        let again = heap.intern("garbage 3", &rooted);
        assert!(again.is_live());
        assert_eq!(heap.object_count(), 6);
    }

    #[test]
    fn collect_traces_through_closures() {
        let mut heap = Heap::new();
        let captured = heap.intern("captured", &());
        let upvalue = heap.alloc(
            Object::Upvalue(Upvalue::Closed(Value::Object(captured.clone()))),
            &(),
        );
        let name = heap.intern("f", &());
        let function = heap.alloc(
            Object::Function(Function {
                arity: 0,
                chunk: Rc::new(Chunk::new()),
                name: Some(name.clone()),
                upvalue_count: 1,
            }),
            &(),
        );
        let closure = heap.alloc(
            Object::Closure(Closure {
                function: function.clone(),
                upvalues: vec![upvalue.clone()],
            }),
            &(),
        );
        heap.intern("unreachable", &());
        assert_eq!(heap.object_count(), 6);

        let roots = [Value::Object(closure.clone())];
        heap.collect(&roots);

        assert_eq!(heap.object_count(), 5);
        for r in [&captured, &upvalue, &name, &function, &closure] {
            assert!(r.is_live());
        }
    }

    #[test]
    fn cycles_are_collected() {
        let mut heap = Heap::new();
        let name = heap.intern("Node", &());
        let class = heap.alloc(
            Object::Class(crate::object::Class {
                name,
                methods: Table::new(),
                superclass: None,
            }),
            &(),
        );
        let field = heap.intern("self", &());
        let instance = heap.alloc(
            Object::Instance(crate::object::Instance {
                class: class.clone(),
                fields: Table::new(),
            }),
            &(),
        );
        instance.with_mut(|o| {
            o.as_instance_mut()
                .unwrap()
                .fields
                .set(field.clone(), Value::Object(instance.clone()))
        });

        heap.collect(&[Value::Object(instance.clone())]);
        assert_eq!(heap.object_count(), 4);
        assert_eq!(instance.to_string(), "Node instance");

        heap.collect(&());
        assert_eq!(heap.object_count(), 0);
        assert!(!instance.is_live());
    }

    #[test]
    fn growth_in_place_is_counted() {
        let mut heap = Heap::new();
        let name = heap.intern("Bag", &());
        let class = heap.alloc(
            Object::Class(crate::object::Class {
                name,
                methods: Table::new(),
                superclass: None,
            }),
            &(),
        );
        let instance = heap.alloc(
            Object::Instance(crate::object::Instance {
                class,
                fields: Table::new(),
            }),
            &(),
        );
        let keys: Vec<HeapRef> = (0..64).map(|i| heap.intern(&format!("f{}", i), &())).collect();
        let before = heap.bytes_allocated();

        instance.with_mut(|o| {
            let fields = &mut o.as_instance_mut().unwrap().fields;
            for key in &keys {
                fields.set(key.clone(), Value::Nil);
            }
        });
        assert_eq!(heap.bytes_allocated(), before);
        heap.reaccount(&instance);
        let grown = heap.bytes_allocated();
        assert!(grown > before);
        heap.reaccount(&instance);
        assert_eq!(heap.bytes_allocated(), grown);

        heap.collect(&());
        assert_eq!(heap.object_count(), 0);
        assert_eq!(heap.bytes_allocated(), 0);
    }

    #[test]
    fn allocation_triggers_collection_past_threshold() {
        let mut heap = Heap::with_config(GcConfig {
            initial_threshold: 1024,
            growth_factor: 2,
            stress: false,
        });
        for i in 0..1000 {
            heap.intern(&format!("temporary string number {}", i), &());
        }
        assert!(heap.object_count() < 1000);
        assert!(heap.bytes_allocated() <= 2048 + 256);
    }
}
