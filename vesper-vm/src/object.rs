// vesper-vm - Bytecode compiler and virtual machine for the Vesper programming language
// Copyright (c) 2025 Tom Waddington. MIT licensed.

//! Heap objects and the arena that owns them.
//!
//! The heap is a single vector of objects; everything else refers to an
//! object by its index. There is no collector: objects live until the
//! heap is dropped, which frees the whole program's allocations at
//! once. String construction always goes through interning, so at most
//! one live string exists for any given byte content.

use crate::chunk::Chunk;
use crate::table::Table;
use crate::value::Value;

/// Handle to a heap object. Identity (index) equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjId(pub(crate) u32);

/// An interned, immutable string with its precomputed FNV-1a hash.
#[derive(Debug)]
pub struct StringObj {
    pub chars: Box<str>,
    pub hash: u32,
}

/// A compiled function: the compile-time artifact closures are built
/// from at runtime.
#[derive(Debug)]
pub struct Function {
    /// Number of declared parameters.
    pub arity: u8,
    /// Number of variables captured from enclosing functions.
    pub upvalue_count: u16,
    /// High-water mark of local slots, including the reserved slot 0.
    pub local_count: u32,
    /// The function's bytecode.
    pub chunk: Chunk,
    /// Interned name; `None` for the top-level script.
    pub name: Option<ObjId>,
}

/// A host function callable from scripts.
pub type NativeFn = fn(&[Value]) -> Value;

/// A native (host) function plus its declared arity.
pub struct Native {
    pub function: NativeFn,
    pub arity: u8,
}

impl std::fmt::Debug for Native {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Native").field("arity", &self.arity).finish()
    }
}

/// A runtime function: a `Function` paired with its captured upvalues.
#[derive(Debug)]
pub struct Closure {
    pub function: ObjId,
    /// Upvalue objects, length `function.upvalue_count`.
    pub upvalues: Vec<ObjId>,
}

/// A captured variable.
///
/// Open upvalues point at a live stack slot; when that slot is popped
/// the value moves into the upvalue, which then owns it.
#[derive(Debug, Clone, Copy)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

/// A heap object, tagged with its kind.
#[derive(Debug)]
pub enum Obj {
    Str(StringObj),
    Function(Function),
    Native(Native),
    Closure(Closure),
    Upvalue(Upvalue),
}

/// FNV-1a, 32 bits.
pub fn hash_string(chars: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in chars.bytes() {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// The object arena. Owns every heap allocation the VM ever makes,
/// plus the intern table that maps string contents to their single
/// live object.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<Obj>,
    strings: Table,
}

impl Heap {
    /// Create an empty heap.
    pub fn new() -> Self {
        Heap {
            objects: Vec::new(),
            strings: Table::new(),
        }
    }

    fn alloc(&mut self, obj: Obj) -> ObjId {
        let id = ObjId(self.objects.len() as u32);
        self.objects.push(obj);
        id
    }

    /// Intern a string: return the existing object for these contents,
    /// or allocate and register a new one. The only way to make a
    /// string.
    pub fn intern(&mut self, chars: &str) -> ObjId {
        let hash = hash_string(chars);
        if let Some(existing) = self.strings.find_string(&self.objects, chars, hash) {
            return existing;
        }
        let id = self.alloc(Obj::Str(StringObj {
            chars: chars.into(),
            hash,
        }));
        self.strings.set(id, hash, Value::Nil);
        id
    }

    /// Concatenate two strings, interning the result.
    pub fn concat(&mut self, a: ObjId, b: ObjId) -> ObjId {
        let mut chars = String::with_capacity(self.string(a).chars.len() + self.string(b).chars.len());
        chars.push_str(&self.string(a).chars);
        chars.push_str(&self.string(b).chars);
        self.intern(&chars)
    }

    pub fn new_function(&mut self, function: Function) -> ObjId {
        self.alloc(Obj::Function(function))
    }

    pub fn new_native(&mut self, native: Native) -> ObjId {
        self.alloc(Obj::Native(native))
    }

    pub fn new_closure(&mut self, closure: Closure) -> ObjId {
        self.alloc(Obj::Closure(closure))
    }

    pub fn new_upvalue(&mut self, upvalue: Upvalue) -> ObjId {
        self.alloc(Obj::Upvalue(upvalue))
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Iterate every live object.
    pub fn iter(&self) -> std::slice::Iter<'_, Obj> {
        self.objects.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, id: ObjId) -> &Obj {
        &self.objects[id.0 as usize]
    }

    // The typed accessors below encode compiler/VM invariants: a handle
    // stored where a string (function, ...) belongs always refers to
    // one. A mismatch is a bug in bytecode emission, not a user error.

    pub fn string(&self, id: ObjId) -> &StringObj {
        match self.get(id) {
            Obj::Str(s) => s,
            other => panic!("expected string object, found {:?}", other),
        }
    }

    pub fn function(&self, id: ObjId) -> &Function {
        match self.get(id) {
            Obj::Function(f) => f,
            other => panic!("expected function object, found {:?}", other),
        }
    }

    pub fn closure(&self, id: ObjId) -> &Closure {
        match self.get(id) {
            Obj::Closure(c) => c,
            other => panic!("expected closure object, found {:?}", other),
        }
    }

    pub fn upvalue(&self, id: ObjId) -> &Upvalue {
        match self.get(id) {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue object, found {:?}", other),
        }
    }

    pub fn upvalue_mut(&mut self, id: ObjId) -> &mut Upvalue {
        match &mut self.objects[id.0 as usize] {
            Obj::Upvalue(u) => u,
            other => panic!("expected upvalue object, found {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1a_reference_values() {
        // Reference vectors for 32-bit FNV-1a.
        assert_eq!(hash_string(""), 2166136261);
        assert_eq!(hash_string("a"), 0xe40c292c);
        assert_eq!(hash_string("foobar"), 0xbf9cf968);
    }

    #[test]
    fn interning_deduplicates() {
        let mut heap = Heap::new();
        let a = heap.intern("alpha");
        let b = heap.intern("beta");
        let a2 = heap.intern("alpha");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(heap.len(), 2);
    }

    #[test]
    fn concat_interns_the_result() {
        let mut heap = Heap::new();
        let hello = heap.intern("hello ");
        let world = heap.intern("world");
        let joined = heap.concat(hello, world);
        assert_eq!(&*heap.string(joined).chars, "hello world");

        // Concatenating again yields the same object.
        let again = heap.concat(hello, world);
        assert_eq!(joined, again);

        // And interning the same contents does too.
        let direct = heap.intern("hello world");
        assert_eq!(joined, direct);
    }

    #[test]
    fn every_allocation_is_tracked() {
        let mut heap = Heap::new();
        heap.intern("s");
        heap.new_upvalue(Upvalue::Closed(Value::Nil));
        heap.new_function(Function {
            arity: 0,
            upvalue_count: 0,
            local_count: 1,
            chunk: crate::chunk::Chunk::new(),
            name: None,
        });
        assert_eq!(heap.len(), 3);
    }
}
