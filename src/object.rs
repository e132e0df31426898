use super::chunk::Chunk;
use super::value::Value;
use super::vm::Vm;

/// Stable index of a heap object. Values carry these instead of pointers;
/// the arena they index into lives for the whole VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef(usize);

pub type Native = fn(&mut Vm, usize) -> Result<Value, String>;

pub struct StrObj {
    pub chars: String,
    pub hash: u32,
}

pub struct Function {
    pub arity: u8,
    pub up_values_count: usize,
    pub chunk: Chunk,
    pub name: Option<ObjRef>,
}

impl Function {
    pub fn new(name: Option<ObjRef>) -> Self {
        Self {
            arity: 0,
            up_values_count: 0,
            chunk: Chunk::new(),
            name,
        }
    }
}

pub struct Closure {
    pub function: ObjRef,
    pub up_values: Vec<ObjRef>,
}

impl Closure {
    pub fn new(function: ObjRef, up_values: Vec<ObjRef>) -> Self {
        Self {
            function,
            up_values,
        }
    }
}

#[derive(Clone)]
pub enum UpValue {
    Open(usize),
    Closed(Value),
}

impl UpValue {
    pub fn new(slot: usize) -> Self {
        Self::Open(slot)
    }

    pub fn close(&mut self, value: Value) {
        *self = UpValue::Closed(value);
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }

    pub fn as_open(&self) -> usize {
        match self {
            UpValue::Open(slot) => *slot,
            UpValue::Closed(_) => unreachable!(),
        }
    }
}

pub enum Obj {
    Str(StrObj),
    Function(Function),
    Closure(Closure),
    Native(Native),
    UpValue(UpValue),
}

/// The owning arena of every heap object. Dropping the heap releases the
/// whole object graph at once.
pub struct Heap {
    objects: Vec<Obj>,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
        }
    }

    pub fn alloc(&mut self, obj: Obj) -> ObjRef {
        self.objects.push(obj);
        ObjRef(self.objects.len() - 1)
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        &self.objects[r.0]
    }

    pub fn as_str(&self, r: ObjRef) -> &StrObj {
        match self.get(r) {
            Obj::Str(string) => string,
            _ => unreachable!(),
        }
    }

    pub fn str_chars(&self, r: ObjRef) -> &str {
        &self.as_str(r).chars
    }

    pub fn function(&self, r: ObjRef) -> &Function {
        match self.get(r) {
            Obj::Function(function) => function,
            _ => unreachable!(),
        }
    }

    pub fn closure(&self, r: ObjRef) -> &Closure {
        match self.get(r) {
            Obj::Closure(closure) => closure,
            _ => unreachable!(),
        }
    }

    pub fn up_value(&self, r: ObjRef) -> &UpValue {
        match self.get(r) {
            Obj::UpValue(up_value) => up_value,
            _ => unreachable!(),
        }
    }

    pub fn up_value_mut(&mut self, r: ObjRef) -> &mut UpValue {
        match &mut self.objects[r.0] {
            Obj::UpValue(up_value) => up_value,
            _ => unreachable!(),
        }
    }

    pub fn function_name(&self, function: ObjRef) -> Option<&str> {
        self.function(function).name.map(|name| self.str_chars(name))
    }

    pub fn show(&self, r: ObjRef) -> String {
        match self.get(r) {
            Obj::Str(string) => string.chars.clone(),
            Obj::Function(function) => match function.name {
                Some(name) => format!("<fn {}>", self.str_chars(name)),
                None => "<script>".to_string(),
            },
            Obj::Closure(closure) => self.show(closure.function),
            Obj::Native(_) => "<native fn>".to_string(),
            Obj::UpValue(_) => "upvalue".to_string(),
        }
    }
}

/// 32-bit FNV-1a, the hash every interned string carries.
pub fn hash_string(chars: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for byte in chars.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fnv1a_reference_values() {
        assert_eq!(hash_string(""), 2166136261);
        assert_eq!(hash_string("a"), 0xe40c292c);
        assert_eq!(hash_string("foobar"), 0xbf9cf968);
    }

    #[test]
    fn up_value_closes_over_a_value() {
        let mut up_value = UpValue::new(3);
        assert!(up_value.is_open());
        assert_eq!(up_value.as_open(), 3);

        up_value.close(Value::Number(9.0));
        assert!(!up_value.is_open());
        match up_value {
            UpValue::Closed(value) => assert_eq!(value, Value::Number(9.0)),
            UpValue::Open(_) => unreachable!(),
        }
    }

    #[test]
    fn closure_shows_as_its_function() {
        let mut heap = Heap::new();
        let name = heap.alloc(Obj::Str(StrObj {
            chars: "riddle".to_string(),
            hash: hash_string("riddle"),
        }));
        let function = heap.alloc(Obj::Function(Function::new(Some(name))));
        let closure = heap.alloc(Obj::Closure(Closure::new(function, Vec::new())));
        assert_eq!(heap.show(closure), "<fn riddle>");
    }
}
