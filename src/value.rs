use std::cell::{Ref, RefCell, RefMut};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive};

use crate::error::{Error, ErrorCode, Result};

/// A mutable value handle. Cloning shares the underlying allocation, which is
/// what gives the memo its identity semantics: a value stored in the memo and
/// sitting in a list is the same object through both paths.
#[derive(Debug, Eq, PartialOrd, Ord, Clone)]
pub struct Shared<T>(Rc<RefCell<T>>);

impl<T> Shared<T> {
    pub fn new(value: T) -> Self {
        Shared(Rc::new(RefCell::new(value)))
    }

    pub fn inner(&self) -> Ref<'_, T> {
        self.0.borrow()
    }

    pub fn inner_mut(&self) -> RefMut<'_, T> {
        self.0.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> From<T> for Shared<T> {
    fn from(value: T) -> Self {
        Shared::new(value)
    }
}

impl<T> std::cmp::PartialEq for Shared<T>
where
    T: std::cmp::PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        let this_inner = self.0.borrow();
        let other_inner = other.0.borrow();
        this_inner.eq(&other_inner)
    }
}

/// An immutable value handle with the same sharing behavior as [`Shared`].
#[derive(Debug, Eq, PartialOrd, Ord, Clone)]
pub struct SharedFrozen<T>(Rc<T>);

impl<T> SharedFrozen<T> {
    pub fn new(value: T) -> Self {
        SharedFrozen(Rc::new(value))
    }

    pub fn inner(&self) -> &T {
        self.0.as_ref()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> From<T> for SharedFrozen<T> {
    fn from(value: T) -> Self {
        SharedFrozen::new(value)
    }
}

impl<T> std::cmp::PartialEq for SharedFrozen<T>
where
    T: std::cmp::PartialEq,
{
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        self.inner().eq(other.inner())
    }
}

/// Hook invoked for the constructor path (`cls(*args)`).
pub type CallHook = Rc<dyn Fn(Vec<Value>) -> Result<Value>>;
/// Hook invoked for the allocator path with keyword arguments
/// (`cls.__new__(cls, *args, **kwargs)`). The second argument is a dict value.
pub type CallExHook = Rc<dyn Fn(Vec<Value>, Value) -> Result<Value>>;
/// Hook invoked by BUILD when the class restores its own state.
pub type SetStateHook = Rc<dyn Fn(&Value, Value) -> Result<()>>;

/// A resolved external symbol: a class or callable living outside the stream.
///
/// The machine treats symbols as opaque. Hosts (and hermetic tests) may attach
/// behavior; a symbol without hooks materializes generic instances that simply
/// record how they were made, which is exactly what a debugger wants to show.
pub struct Symbol {
    module: String,
    qualname: String,
    call: Option<CallHook>,
    new: Option<CallHook>,
    new_ex: Option<CallExHook>,
    setstate: Option<SetStateHook>,
    has_initargs: bool,
}

impl Symbol {
    pub fn new(module: impl Into<String>, qualname: impl Into<String>) -> Self {
        Symbol {
            module: module.into(),
            qualname: qualname.into(),
            call: None,
            new: None,
            new_ex: None,
            setstate: None,
            has_initargs: false,
        }
    }

    pub fn with_call(mut self, hook: CallHook) -> Self {
        self.call = Some(hook);
        self
    }

    pub fn with_new(mut self, hook: CallHook) -> Self {
        self.new = Some(hook);
        self
    }

    pub fn with_new_ex(mut self, hook: CallExHook) -> Self {
        self.new_ex = Some(hook);
        self
    }

    pub fn with_setstate(mut self, hook: SetStateHook) -> Self {
        self.setstate = Some(hook);
        self
    }

    /// Marks the symbol as exposing init-args, which forces INST/OBJ down the
    /// constructor path even with an empty argument list.
    pub fn with_initargs(mut self) -> Self {
        self.has_initargs = true;
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn qualname(&self) -> &str {
        &self.qualname
    }

    pub fn has_initargs(&self) -> bool {
        self.has_initargs
    }

    pub fn setstate_hook(&self) -> Option<SetStateHook> {
        self.setstate.clone()
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("module", &self.module)
            .field("qualname", &self.qualname)
            .finish()
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.module == other.module && self.qualname == other.qualname
    }
}

/// Invocation helpers live on `Rc<Symbol>` because a generic result has to
/// hold a reference back to its class.
pub trait SymbolCall {
    /// Constructor path (`cls(*args)`).
    fn call(&self, args: Vec<Value>) -> Result<Value>;
    /// Allocator path (`cls.__new__(cls, *args)`).
    fn allocate(&self, args: Vec<Value>) -> Result<Value>;
    /// Allocator path with keyword arguments.
    fn allocate_ex(&self, args: Vec<Value>, kwargs: Value) -> Result<Value>;
}

impl SymbolCall for Rc<Symbol> {
    fn call(&self, args: Vec<Value>) -> Result<Value> {
        match &self.call {
            Some(hook) => hook(args),
            None => Ok(Value::Instance(Shared::new(Instance::with_args(
                self.clone(),
                args,
            )))),
        }
    }

    fn allocate(&self, args: Vec<Value>) -> Result<Value> {
        match &self.new {
            Some(hook) => hook(args),
            None => Ok(Value::Instance(Shared::new(Instance::with_args(
                self.clone(),
                args,
            )))),
        }
    }

    fn allocate_ex(&self, args: Vec<Value>, kwargs: Value) -> Result<Value> {
        match &self.new_ex {
            Some(hook) => hook(args, kwargs),
            None => {
                let mut inst = Instance::with_args(self.clone(), args);
                inst.kwargs = Some(kwargs);
                Ok(Value::Instance(Shared::new(inst)))
            }
        }
    }
}

/// An instance of a [`Symbol`], with fields BUILD can populate later.
#[derive(Debug, Clone)]
pub struct Instance {
    pub class: Rc<Symbol>,
    /// Positional arguments the instance was constructed/allocated with.
    pub args: Vec<Value>,
    /// Keyword arguments, when it came through NEWOBJ_EX.
    pub kwargs: Option<Value>,
    /// The attribute dictionary; BUILD merges state and slot-state into it.
    pub attrs: BTreeMap<HashableValue, Value>,
}

impl Instance {
    pub fn with_args(class: Rc<Symbol>, args: Vec<Value>) -> Self {
        Instance {
            class,
            args,
            kwargs: None,
            attrs: BTreeMap::new(),
        }
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.class == other.class && self.args == other.args && self.attrs == other.attrs
    }
}

/// Every value the pickle machine can push.
///
/// Integers live in two variants: `I64` for everything that fits, `Int` only
/// for magnitudes beyond `i64`. Decoders normalize, so equality never has to
/// compare across the two.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    I64(i64),
    Int(BigInt),
    F64(f64),
    /// Immutable byte string.
    Bytes(SharedFrozen<Vec<u8>>),
    /// Unicode string.
    String(SharedFrozen<String>),
    /// Mutable byte buffer.
    Bytearray(Shared<Vec<u8>>),
    List(Shared<Vec<Value>>),
    Tuple(SharedFrozen<Vec<Value>>),
    Dict(Shared<BTreeMap<HashableValue, Value>>),
    Set(Shared<BTreeSet<HashableValue>>),
    FrozenSet(SharedFrozen<BTreeSet<HashableValue>>),
    /// A resolved class or callable.
    Global(Rc<Symbol>),
    /// An instance of a resolved class.
    Instance(Shared<Instance>),
    /// An out-of-band buffer view.
    Buffer {
        data: Shared<Vec<u8>>,
        readonly: bool,
    },
}

impl Value {
    /// Normalize a big integer into the canonical variant.
    pub fn from_bigint(value: BigInt) -> Value {
        match i64::try_from(&value) {
            Ok(v) => Value::I64(v),
            Err(_) => Value::Int(value),
        }
    }

    pub fn string(s: impl Into<String>) -> Value {
        Value::String(SharedFrozen::new(s.into()))
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(SharedFrozen::new(b.into()))
    }

    pub fn tuple(items: Vec<Value>) -> Value {
        Value::Tuple(SharedFrozen::new(items))
    }

    pub fn list(items: Vec<Value>) -> Value {
        Value::List(Shared::new(items))
    }

    /// The Python-facing name of the value's type, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::I64(_) | Value::Int(_) => "int",
            Value::F64(_) => "float",
            Value::Bytes(_) => "bytes",
            Value::String(_) => "str",
            Value::Bytearray(_) => "bytearray",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::Set(_) => "set",
            Value::FrozenSet(_) => "frozenset",
            Value::Global(_) => "type",
            Value::Instance(_) => "object",
            Value::Buffer { .. } => "memoryview",
        }
    }

    /// Convert the value into a hashable version, if possible.
    pub fn into_hashable(self) -> Result<HashableValue> {
        match self {
            Value::None => Ok(HashableValue::None),
            Value::Bool(b) => Ok(HashableValue::Bool(b)),
            Value::I64(i) => Ok(HashableValue::I64(i)),
            Value::Int(i) => Ok(HashableValue::Int(i)),
            Value::F64(f) => Ok(HashableValue::F64(f)),
            Value::Bytes(b) => Ok(HashableValue::Bytes(b)),
            Value::String(s) => Ok(HashableValue::String(s)),
            Value::FrozenSet(v) => Ok(HashableValue::FrozenSet(v)),
            Value::Tuple(v) => {
                let items = v
                    .inner()
                    .iter()
                    .cloned()
                    .map(Value::into_hashable)
                    .collect::<Result<Vec<_>>>()?;
                Ok(HashableValue::Tuple(SharedFrozen::new(items)))
            }
            other => Err(Error::new(ErrorCode::NotHashable(other.type_name()))),
        }
    }
}

/// The subset of values usable as dict keys and set elements.
///
/// Not `Hash` in the Rust sense: like the corpus this models dicts and sets
/// with B-trees, which needs a consistent total order between all the
/// possible kinds instead (numbers compare by value across variants).
#[derive(Clone, Debug)]
pub enum HashableValue {
    None,
    Bool(bool),
    I64(i64),
    Int(BigInt),
    F64(f64),
    Bytes(SharedFrozen<Vec<u8>>),
    String(SharedFrozen<String>),
    Tuple(SharedFrozen<Vec<HashableValue>>),
    FrozenSet(SharedFrozen<BTreeSet<HashableValue>>),
}

impl HashableValue {
    /// Convert back into the general value form. This always works.
    pub fn into_value(self) -> Value {
        match self {
            HashableValue::None => Value::None,
            HashableValue::Bool(b) => Value::Bool(b),
            HashableValue::I64(i) => Value::I64(i),
            HashableValue::Int(i) => Value::Int(i),
            HashableValue::F64(f) => Value::F64(f),
            HashableValue::Bytes(b) => Value::Bytes(b),
            HashableValue::String(s) => Value::String(s),
            HashableValue::FrozenSet(v) => Value::FrozenSet(v),
            HashableValue::Tuple(v) => {
                let items = v
                    .inner()
                    .iter()
                    .cloned()
                    .map(HashableValue::into_value)
                    .collect::<Vec<_>>();
                Value::Tuple(SharedFrozen::new(items))
            }
        }
    }
}

impl PartialEq for HashableValue {
    fn eq(&self, other: &HashableValue) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HashableValue {}

impl PartialOrd for HashableValue {
    fn partial_cmp(&self, other: &HashableValue) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A consistent ordering between all hashable kinds, so they can live in
/// B-tree dicts and sets. Numeric values with the same value compare equal
/// across variants; other kinds order by kind.
impl Ord for HashableValue {
    fn cmp(&self, other: &HashableValue) -> Ordering {
        use self::HashableValue::*;
        match *self {
            None => match *other {
                None => Ordering::Equal,
                _ => Ordering::Less,
            },
            Bool(b) => match *other {
                None => Ordering::Greater,
                Bool(b2) => b.cmp(&b2),
                I64(i2) => (b as i64).cmp(&i2),
                Int(ref bi) => BigInt::from(b as i64).cmp(bi),
                F64(f) => float_ord(b as i64 as f64, f),
                _ => Ordering::Less,
            },
            I64(i) => match *other {
                None => Ordering::Greater,
                Bool(b) => i.cmp(&(b as i64)),
                I64(i2) => i.cmp(&i2),
                Int(ref bi) => BigInt::from(i).cmp(bi),
                F64(f) => float_ord(i as f64, f),
                _ => Ordering::Less,
            },
            Int(ref bi) => match *other {
                None => Ordering::Greater,
                Bool(b) => bi.cmp(&BigInt::from(b as i64)),
                I64(i) => bi.cmp(&BigInt::from(i)),
                Int(ref bi2) => bi.cmp(bi2),
                F64(f) => float_bigint_ord(bi, f),
                _ => Ordering::Less,
            },
            F64(f) => match *other {
                None => Ordering::Greater,
                Bool(b) => float_ord(f, b as i64 as f64),
                I64(i) => float_ord(f, i as f64),
                Int(ref bi) => float_bigint_ord(bi, f).reverse(),
                F64(f2) => float_ord(f, f2),
                _ => Ordering::Less,
            },
            Bytes(ref bs) => match *other {
                String(_) | FrozenSet(_) | Tuple(_) => Ordering::Less,
                Bytes(ref bs2) => bs.cmp(bs2),
                _ => Ordering::Greater,
            },
            String(ref s) => match *other {
                FrozenSet(_) | Tuple(_) => Ordering::Less,
                String(ref s2) => s.cmp(s2),
                _ => Ordering::Greater,
            },
            FrozenSet(ref s) => match *other {
                Tuple(_) => Ordering::Less,
                FrozenSet(ref s2) => s.cmp(s2),
                _ => Ordering::Greater,
            },
            Tuple(ref t) => match *other {
                Tuple(ref t2) => t.cmp(t2),
                _ => Ordering::Greater,
            },
        }
    }
}

/// A "reasonable" total ordering for floats.
fn float_ord(f: f64, g: f64) -> Ordering {
    match f.partial_cmp(&g) {
        Some(o) => o,
        Option::None => Ordering::Less,
    }
}

/// Ordering between big integers and floats.
fn float_bigint_ord(bi: &BigInt, g: f64) -> Ordering {
    match bi.to_f64() {
        Some(f) => float_ord(f, g),
        Option::None => {
            if bi.is_positive() {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
    }
}

fn write_float(f: &mut fmt::Formatter, v: f64) -> fmt::Result {
    let s = v.to_string();
    if s.contains('.') || s.contains('e') || s.contains("inf") || s.contains("NaN") {
        write!(f, "{s}")
    } else {
        write!(f, "{s}.0")
    }
}

fn write_bytes_repr(f: &mut fmt::Formatter, bytes: &[u8]) -> fmt::Result {
    f.write_str("b'")?;
    for &b in bytes {
        match b {
            b'\\' => f.write_str("\\\\")?,
            b'\'' => f.write_str("\\'")?,
            b'\n' => f.write_str("\\n")?,
            b'\r' => f.write_str("\\r")?,
            b'\t' => f.write_str("\\t")?,
            0x20..=0x7e => write!(f, "{}", b as char)?,
            _ => write!(f, "\\x{b:02x}")?,
        }
    }
    f.write_str("'")
}

fn write_elements<'a, I, T>(
    f: &mut fmt::Formatter,
    it: I,
    prefix: &'static str,
    suffix: &'static str,
    len: usize,
    always_comma: bool,
) -> fmt::Result
where
    I: Iterator<Item = &'a T>,
    T: fmt::Display + 'a,
{
    f.write_str(prefix)?;
    for (i, item) in it.enumerate() {
        if i < len - 1 || always_comma {
            write!(f, "{item}, ")?;
        } else {
            write!(f, "{item}")?;
        }
    }
    f.write_str(suffix)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", if b { "True" } else { "False" }),
            Value::I64(i) => write!(f, "{i}"),
            Value::Int(ref i) => write!(f, "{i}"),
            Value::F64(v) => write_float(f, v),
            Value::Bytes(ref b) => write_bytes_repr(f, b.inner()),
            Value::String(ref s) => write!(f, "{:?}", s.inner()),
            Value::Bytearray(ref b) => {
                f.write_str("bytearray(")?;
                write_bytes_repr(f, &b.inner())?;
                f.write_str(")")
            }
            Value::List(ref v) => {
                let v = v.inner();
                write_elements(f, v.iter(), "[", "]", v.len(), false)
            }
            Value::Tuple(ref v) => {
                let v = v.inner();
                write_elements(f, v.iter(), "(", ")", v.len(), v.len() == 1)
            }
            Value::FrozenSet(ref v) => {
                let v = v.inner();
                write_elements(f, v.iter(), "frozenset([", "])", v.len(), false)
            }
            Value::Set(ref v) => {
                let v = v.inner();
                if v.is_empty() {
                    write!(f, "set()")
                } else {
                    write_elements(f, v.iter(), "{", "}", v.len(), false)
                }
            }
            Value::Dict(ref v) => {
                write!(f, "{{")?;
                let v = v.inner();
                for (i, (key, value)) in v.iter().enumerate() {
                    if i < v.len() - 1 {
                        write!(f, "{key}: {value}, ")?;
                    } else {
                        write!(f, "{key}: {value}")?;
                    }
                }
                write!(f, "}}")
            }
            Value::Global(ref sym) => {
                write!(f, "<class '{}.{}'>", sym.module(), sym.qualname())
            }
            Value::Instance(ref inst) => {
                let inst = inst.inner();
                write!(
                    f,
                    "<{}.{} object>",
                    inst.class.module(),
                    inst.class.qualname()
                )
            }
            Value::Buffer { ref data, readonly } => {
                let n = data.inner().len();
                if readonly {
                    write!(f, "<readonly buffer of {n} bytes>")
                } else {
                    write!(f, "<buffer of {n} bytes>")
                }
            }
        }
    }
}

impl fmt::Display for HashableValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            HashableValue::None => write!(f, "None"),
            HashableValue::Bool(b) => write!(f, "{}", if b { "True" } else { "False" }),
            HashableValue::I64(i) => write!(f, "{i}"),
            HashableValue::Int(ref i) => write!(f, "{i}"),
            HashableValue::F64(v) => write_float(f, v),
            HashableValue::Bytes(ref b) => write_bytes_repr(f, b.inner()),
            HashableValue::String(ref s) => write!(f, "{:?}", s.inner()),
            HashableValue::Tuple(ref v) => {
                let v = v.inner();
                write_elements(f, v.iter(), "(", ")", v.len(), v.len() == 1)
            }
            HashableValue::FrozenSet(ref v) => {
                let v = v.inner();
                write_elements(f, v.iter(), "frozenset([", "])", v.len(), false)
            }
        }
    }
}
