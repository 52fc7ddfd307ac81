use std::collections::VecDeque;
use std::io::BufRead;
use std::mem;
use std::rc::Rc;

use crate::codec::{self, TextCodec};
use crate::compat;
use crate::error::{Error, ErrorCode, Result};
use crate::machine::{PickleMemo, PickleStack};
use crate::ops::p_op;
use crate::read::{Unframer, MAX_SIZE};
use crate::resolve::{registered_extension, ClassResolver, ExtensionCache, RegistryResolver};
use crate::value::{Shared, SymbolCall, Value};

/// The highest stream format this machine understands.
pub const HIGHEST_PROTOCOL: u8 = 5;

/// Hook resolving persistent IDs (PERSID/BINPERSID). Without one configured,
/// encountering a persistent ID is fatal.
pub type PersistentLoadHook = Rc<dyn Fn(Value) -> Result<Value>>;

/// Hook observing every class resolution, called before any remapping.
pub type AuditHook = Rc<dyn Fn(&str, &str)>;

/// Options recognized at machine construction.
#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Remap legacy module/class names when the protocol is below 3.
    pub fix_imports: bool,
    /// Encoding for legacy string opcodes; the value `bytes` keeps them raw.
    pub encoding: String,
    /// Error policy paired with `encoding`.
    pub errors: String,
}

impl Default for MachineOptions {
    fn default() -> Self {
        MachineOptions {
            fix_imports: true,
            encoding: "ASCII".into(),
            errors: "strict".into(),
        }
    }
}

/// What a single [`PickleMachine::step`] produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The instruction ran; more follow.
    Continue,
    /// STOP delivered the stream's value.
    Stopped(Value),
}

/// Machine lifecycle, observable by the debugger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    Initialized,
    Running,
    Stopped,
    Failed,
}

/// The pickle virtual machine, stepped one instruction at a time.
pub struct PickleMachine<R> {
    reader: Unframer<R>,
    stack: PickleStack,
    metastack: Vec<PickleStack>,
    memo: PickleMemo,
    proto: u8,
    codec: TextCodec,
    fix_imports: bool,
    buffers: Option<VecDeque<Value>>,
    resolver: Box<dyn ClassResolver>,
    persistent_load: Option<PersistentLoadHook>,
    audit: Option<AuditHook>,
    ext_cache: ExtensionCache,
    state: MachineState,
    current_pos: u64,
    current_opcode: Option<u8>,
}

impl<R: BufRead> PickleMachine<R> {
    pub fn new(source: R, options: &MachineOptions) -> Result<Self> {
        let codec = TextCodec::new(&options.encoding, &options.errors)?;
        Ok(PickleMachine {
            reader: Unframer::new(source),
            stack: PickleStack::default(),
            metastack: Vec::new(),
            memo: PickleMemo::default(),
            proto: 0,
            codec,
            fix_imports: options.fix_imports,
            buffers: None,
            resolver: Box::new(RegistryResolver::synthesizing()),
            persistent_load: None,
            audit: None,
            ext_cache: ExtensionCache::new(),
            state: MachineState::Initialized,
            current_pos: 0,
            current_opcode: None,
        })
    }

    /// Replace the default synthesizing resolver.
    pub fn with_resolver(mut self, resolver: Box<dyn ClassResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Supply the out-of-band buffers NEXT_BUFFER consumes, in order.
    pub fn with_buffers(mut self, buffers: Vec<Vec<u8>>) -> Self {
        self.buffers = Some(
            buffers
                .into_iter()
                .map(|data| Value::Buffer {
                    data: Shared::new(data),
                    readonly: false,
                })
                .collect(),
        );
        self
    }

    pub fn with_persistent_load(mut self, hook: PersistentLoadHook) -> Self {
        self.persistent_load = Some(hook);
        self
    }

    pub fn with_audit_hook(mut self, hook: AuditHook) -> Self {
        self.audit = Some(hook);
        self
    }

    /// Share a resolved-extension cache with other machines.
    pub fn with_extension_cache(mut self, cache: ExtensionCache) -> Self {
        self.ext_cache = cache;
        self
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn metastack(&self) -> &[PickleStack] {
        &self.metastack
    }

    pub fn memo(&self) -> &PickleMemo {
        &self.memo
    }

    pub fn protocol(&self) -> u8 {
        self.proto
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Stream position of the next instruction (or, mid-failure, of the one
    /// that failed).
    pub fn pos(&self) -> u64 {
        self.reader.pos()
    }

    /// Position of the most recently dispatched instruction.
    pub fn current_pos(&self) -> u64 {
        self.current_pos
    }

    /// Opcode byte of the most recently dispatched instruction.
    pub fn current_opcode(&self) -> Option<u8> {
        self.current_opcode
    }

    /// Execute exactly one instruction.
    pub fn step(&mut self) -> Result<Step> {
        match self.state {
            MachineState::Stopped | MachineState::Failed => {
                return Err(Error::new(ErrorCode::MachineHalted))
            }
            _ => self.state = MachineState::Running,
        }
        let pos = self.reader.pos();
        let opcode = match self.reader.read_u8() {
            Ok(b) => b,
            Err(mut e) => {
                self.state = MachineState::Failed;
                e.pos.get_or_insert(pos);
                return Err(e);
            }
        };
        self.current_pos = pos;
        self.current_opcode = Some(opcode);
        match self.dispatch(opcode) {
            Ok(Some(value)) => {
                self.state = MachineState::Stopped;
                Ok(Step::Stopped(value))
            }
            Ok(None) => Ok(Step::Continue),
            Err(e) => {
                self.state = MachineState::Failed;
                Err(e.at(pos, opcode))
            }
        }
    }

    /// Run to completion: step until STOP delivers the value.
    pub fn run(&mut self) -> Result<Value> {
        loop {
            if let Step::Stopped(value) = self.step()? {
                return Ok(value);
            }
        }
    }

    /// The dense opcode dispatch. Returns the final value on STOP.
    fn dispatch(&mut self, opcode: u8) -> Result<Option<Value>> {
        match opcode {
            p_op::STOP => return Ok(Some(self.stack.pop()?)),
            p_op::PROTO => self.load_proto()?,
            p_op::FRAME => self.load_frame()?,
            p_op::PERSID => self.load_persid()?,
            p_op::BINPERSID => self.load_binpersid()?,
            p_op::NONE => self.stack.push(Value::None),
            p_op::NEWFALSE => self.stack.push(Value::Bool(false)),
            p_op::NEWTRUE => self.stack.push(Value::Bool(true)),
            p_op::INT => self.load_int()?,
            p_op::BININT => self.load_binint()?,
            p_op::BININT1 => self.load_binint1()?,
            p_op::BININT2 => self.load_binint2()?,
            p_op::LONG => self.load_long()?,
            p_op::LONG1 => self.load_long1()?,
            p_op::LONG4 => self.load_long4()?,
            p_op::FLOAT => self.load_float()?,
            p_op::BINFLOAT => self.load_binfloat()?,
            p_op::STRING => self.load_string()?,
            p_op::BINSTRING => self.load_binstring()?,
            p_op::SHORT_BINSTRING => self.load_short_binstring()?,
            p_op::BINBYTES => self.load_binbytes()?,
            p_op::SHORT_BINBYTES => self.load_short_binbytes()?,
            p_op::BINBYTES8 => self.load_binbytes8()?,
            p_op::BYTEARRAY8 => self.load_bytearray8()?,
            p_op::NEXT_BUFFER => self.load_next_buffer()?,
            p_op::READONLY_BUFFER => self.load_readonly_buffer()?,
            p_op::UNICODE => self.load_unicode()?,
            p_op::BINUNICODE => self.load_binunicode()?,
            p_op::BINUNICODE8 => self.load_binunicode8()?,
            p_op::SHORT_BINUNICODE => self.load_short_binunicode()?,
            p_op::MARK => self.load_mark(),
            p_op::POP => self.load_pop()?,
            p_op::POP_MARK => {
                self.pop_mark()?;
            }
            p_op::DUP => self.load_dup()?,
            p_op::TUPLE => self.load_tuple()?,
            p_op::EMPTY_TUPLE => self.stack.push(Value::tuple(Vec::new())),
            p_op::TUPLE1 => self.load_tuple1()?,
            p_op::TUPLE2 => self.load_tuple2()?,
            p_op::TUPLE3 => self.load_tuple3()?,
            p_op::EMPTY_LIST => self.stack.push(Value::list(Vec::new())),
            p_op::EMPTY_DICT => self.stack.push(Value::Dict(Shared::new(Default::default()))),
            p_op::EMPTY_SET => self.stack.push(Value::Set(Shared::new(Default::default()))),
            p_op::FROZENSET => self.load_frozenset()?,
            p_op::LIST => self.load_list()?,
            p_op::DICT => self.load_dict()?,
            p_op::INST => self.load_inst()?,
            p_op::OBJ => self.load_obj()?,
            p_op::NEWOBJ => self.load_newobj()?,
            p_op::NEWOBJ_EX => self.load_newobj_ex()?,
            p_op::GLOBAL => self.load_global()?,
            p_op::STACK_GLOBAL => self.load_stack_global()?,
            p_op::EXT1 => {
                let code = self.reader.read_u8()?;
                self.get_extension(code as i64)?;
            }
            p_op::EXT2 => {
                let code = self.read_u16()?;
                self.get_extension(code as i64)?;
            }
            p_op::EXT4 => {
                let code = self.read_i32()?;
                self.get_extension(code as i64)?;
            }
            p_op::REDUCE => self.load_reduce()?,
            p_op::GET => self.load_get()?,
            p_op::BINGET => self.load_binget()?,
            p_op::LONG_BINGET => self.load_long_binget()?,
            p_op::PUT => self.load_put()?,
            p_op::BINPUT => self.load_binput()?,
            p_op::LONG_BINPUT => self.load_long_binput()?,
            p_op::MEMOIZE => self.load_memoize()?,
            p_op::APPEND => self.load_append()?,
            p_op::APPENDS => self.load_appends()?,
            p_op::SETITEM => self.load_setitem()?,
            p_op::SETITEMS => self.load_setitems()?,
            p_op::ADDITEMS => self.load_additems()?,
            p_op::BUILD => self.load_build()?,
            _ => return Err(Error::new(ErrorCode::UnknownOpcode(opcode))),
        }
        Ok(None)
    }

    // -- operand readers ---------------------------------------------------

    fn read_u16(&mut self) -> Result<u16> {
        let b = self.reader.read(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let b = self.reader.read(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.reader.read(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let b = self.reader.read(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// A line operand, terminator stripped.
    fn readline(&mut self) -> Result<Vec<u8>> {
        let mut line = self.reader.readline()?;
        line.pop();
        Ok(line)
    }

    fn readline_str(&mut self, what: &'static str) -> Result<String> {
        codec::decode_utf8(self.readline()?, what)
    }

    /// A counted payload whose length was already decoded; rejects lengths
    /// beyond the addressable maximum before consuming any payload bytes.
    fn read_counted(&mut self, len: u64, what: &'static str) -> Result<Vec<u8>> {
        if len > MAX_SIZE {
            return Err(Error::new(ErrorCode::LengthTooLarge(what, len)));
        }
        self.reader.read(len as usize)
    }

    // -- mark handling -----------------------------------------------------

    fn load_mark(&mut self) {
        self.metastack.push(mem::take(&mut self.stack));
    }

    /// Items pushed since the last MARK; restores the saved stack.
    fn pop_mark(&mut self) -> Result<Vec<Value>> {
        let saved = self
            .metastack
            .pop()
            .ok_or_else(|| Error::new(ErrorCode::UnmatchedMark))?;
        let items = mem::replace(&mut self.stack, saved);
        Ok(items.0)
    }

    // -- framing and protocol ----------------------------------------------

    fn load_proto(&mut self) -> Result<()> {
        let proto = self.reader.read_u8()?;
        if proto > HIGHEST_PROTOCOL {
            return Err(Error::new(ErrorCode::UnsupportedProtocol(proto)));
        }
        self.proto = proto;
        Ok(())
    }

    fn load_frame(&mut self) -> Result<()> {
        let frame_size = self.read_u64()?;
        self.reader.load_frame(frame_size)
    }

    // -- persistent ids ----------------------------------------------------

    fn load_persid(&mut self) -> Result<()> {
        let line = self.readline()?;
        if !line.is_ascii() {
            return Err(Error::new(ErrorCode::BadEncoding(
                "persistent IDs in protocol 0 must be ASCII strings".into(),
            )));
        }
        let pid = Value::string(String::from_utf8(line).expect("ascii checked"));
        self.call_persistent_hook(pid)
    }

    fn load_binpersid(&mut self) -> Result<()> {
        let pid = self.stack.pop()?;
        self.call_persistent_hook(pid)
    }

    fn call_persistent_hook(&mut self, pid: Value) -> Result<()> {
        match &self.persistent_load {
            Some(hook) => {
                let value = hook(pid)?;
                self.stack.push(value);
                Ok(())
            }
            None => Err(Error::new(ErrorCode::UnsupportedPersistentId)),
        }
    }

    // -- numbers -----------------------------------------------------------

    fn load_int(&mut self) -> Result<()> {
        let line = self.readline()?;
        let value = match line.as_slice() {
            b"00" => Value::Bool(false),
            b"01" => Value::Bool(true),
            _ => {
                let s = codec::decode_utf8(line, "INT")?;
                codec::parse_int_auto(&s)?
            }
        };
        self.stack.push(value);
        Ok(())
    }

    fn load_binint(&mut self) -> Result<()> {
        let v = self.read_i32()?;
        self.stack.push(Value::I64(v as i64));
        Ok(())
    }

    fn load_binint1(&mut self) -> Result<()> {
        let v = self.reader.read_u8()?;
        self.stack.push(Value::I64(v as i64));
        Ok(())
    }

    fn load_binint2(&mut self) -> Result<()> {
        let v = self.read_u16()?;
        self.stack.push(Value::I64(v as i64));
        Ok(())
    }

    fn load_long(&mut self) -> Result<()> {
        let mut line = self.readline()?;
        if line.last() == Some(&b'L') {
            line.pop();
        }
        let s = codec::decode_utf8(line, "LONG")?;
        let value = codec::parse_int_auto(&s)?;
        self.stack.push(value);
        Ok(())
    }

    fn load_long1(&mut self) -> Result<()> {
        let n = self.reader.read_u8()?;
        let data = self.reader.read(n as usize)?;
        self.stack.push(codec::decode_long(&data));
        Ok(())
    }

    fn load_long4(&mut self) -> Result<()> {
        let n = self.read_i32()?;
        if n < 0 {
            // Corrupt or hostile pickle -- we never write one like this
            return Err(Error::new(ErrorCode::NegativeLength("LONG")));
        }
        let data = self.reader.read(n as usize)?;
        self.stack.push(codec::decode_long(&data));
        Ok(())
    }

    fn load_float(&mut self) -> Result<()> {
        let s = self.readline_str("FLOAT")?;
        let v: f64 = s
            .trim()
            .parse()
            .map_err(|_| Error::new(ErrorCode::BadNumber(s.clone())))?;
        self.stack.push(Value::F64(v));
        Ok(())
    }

    fn load_binfloat(&mut self) -> Result<()> {
        let b = self.reader.read(8)?;
        let v = f64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]);
        self.stack.push(Value::F64(v));
        Ok(())
    }

    // -- strings and bytes -------------------------------------------------

    fn load_string(&mut self) -> Result<()> {
        let data = self.readline()?;
        // Strip outermost quotes
        let inner = if data.len() >= 2
            && data.first() == data.last()
            && matches!(data[0], b'"' | b'\'')
        {
            &data[1..data.len() - 1]
        } else {
            return Err(Error::new(ErrorCode::BadString(
                "the STRING opcode argument must be quoted".into(),
            )));
        };
        let unescaped = codec::escape_decode(inner)?;
        let value = self.codec.decode(unescaped)?;
        self.stack.push(value);
        Ok(())
    }

    fn load_binstring(&mut self) -> Result<()> {
        // Deprecated BINSTRING uses signed 32-bit length
        let len = self.read_i32()?;
        if len < 0 {
            return Err(Error::new(ErrorCode::NegativeLength("BINSTRING")));
        }
        let data = self.reader.read(len as usize)?;
        let value = self.codec.decode(data)?;
        self.stack.push(value);
        Ok(())
    }

    fn load_short_binstring(&mut self) -> Result<()> {
        let len = self.reader.read_u8()?;
        let data = self.reader.read(len as usize)?;
        let value = self.codec.decode(data)?;
        self.stack.push(value);
        Ok(())
    }

    fn load_binbytes(&mut self) -> Result<()> {
        let len = self.read_u32()?;
        let data = self.read_counted(len as u64, "BINBYTES")?;
        self.stack.push(Value::bytes(data));
        Ok(())
    }

    fn load_short_binbytes(&mut self) -> Result<()> {
        let len = self.reader.read_u8()?;
        let data = self.reader.read(len as usize)?;
        self.stack.push(Value::bytes(data));
        Ok(())
    }

    fn load_binbytes8(&mut self) -> Result<()> {
        let len = self.read_u64()?;
        let data = self.read_counted(len, "BINBYTES8")?;
        self.stack.push(Value::bytes(data));
        Ok(())
    }

    fn load_bytearray8(&mut self) -> Result<()> {
        let len = self.read_u64()?;
        let data = self.read_counted(len, "BYTEARRAY8")?;
        self.stack.push(Value::Bytearray(Shared::new(data)));
        Ok(())
    }

    fn load_next_buffer(&mut self) -> Result<()> {
        let buffers = self
            .buffers
            .as_mut()
            .ok_or_else(|| Error::new(ErrorCode::NoBuffers))?;
        let buf = buffers
            .pop_front()
            .ok_or_else(|| Error::new(ErrorCode::BuffersExhausted))?;
        self.stack.push(buf);
        Ok(())
    }

    fn load_readonly_buffer(&mut self) -> Result<()> {
        let replacement = match self.stack.top()?.clone() {
            Value::Buffer { data, readonly } => {
                if readonly {
                    None
                } else {
                    Some(Value::Buffer {
                        data,
                        readonly: true,
                    })
                }
            }
            Value::Bytearray(data) => Some(Value::Buffer {
                data,
                readonly: true,
            }),
            // bytes already are a readonly view
            Value::Bytes(_) => None,
            other => {
                return Err(Error::new(ErrorCode::TypeMismatch(format!(
                    "READONLY_BUFFER requires a buffer, found {}",
                    other.type_name()
                ))))
            }
        };
        if let Some(value) = replacement {
            *self.stack.top_mut()? = value;
        }
        Ok(())
    }

    fn load_unicode(&mut self) -> Result<()> {
        let line = self.readline()?;
        let s = codec::raw_unicode_escape(&line)?;
        self.stack.push(Value::string(s));
        Ok(())
    }

    fn load_binunicode(&mut self) -> Result<()> {
        let len = self.read_u32()?;
        let data = self.read_counted(len as u64, "BINUNICODE")?;
        self.stack
            .push(Value::string(codec::decode_utf8(data, "BINUNICODE")?));
        Ok(())
    }

    fn load_binunicode8(&mut self) -> Result<()> {
        let len = self.read_u64()?;
        let data = self.read_counted(len, "BINUNICODE8")?;
        self.stack
            .push(Value::string(codec::decode_utf8(data, "BINUNICODE8")?));
        Ok(())
    }

    fn load_short_binunicode(&mut self) -> Result<()> {
        let len = self.reader.read_u8()?;
        let data = self.reader.read(len as usize)?;
        self.stack
            .push(Value::string(codec::decode_utf8(data, "SHORT_BINUNICODE")?));
        Ok(())
    }

    // -- stack shuffling ---------------------------------------------------

    fn load_pop(&mut self) -> Result<()> {
        // An empty stack means the top is a mark; discard that instead.
        if !self.stack.is_empty() {
            self.stack.pop()?;
        } else {
            self.pop_mark()?;
        }
        Ok(())
    }

    fn load_dup(&mut self) -> Result<()> {
        let top = self.stack.top()?.clone();
        self.stack.push(top);
        Ok(())
    }

    // -- aggregates --------------------------------------------------------

    fn load_tuple(&mut self) -> Result<()> {
        let items = self.pop_mark()?;
        self.stack.push(Value::tuple(items));
        Ok(())
    }

    fn load_tuple1(&mut self) -> Result<()> {
        let t1 = self.stack.pop()?;
        self.stack.push(Value::tuple(vec![t1]));
        Ok(())
    }

    fn load_tuple2(&mut self) -> Result<()> {
        let t2 = self.stack.pop()?;
        let t1 = self.stack.pop()?;
        self.stack.push(Value::tuple(vec![t1, t2]));
        Ok(())
    }

    fn load_tuple3(&mut self) -> Result<()> {
        let t3 = self.stack.pop()?;
        let t2 = self.stack.pop()?;
        let t1 = self.stack.pop()?;
        self.stack.push(Value::tuple(vec![t1, t2, t3]));
        Ok(())
    }

    fn load_list(&mut self) -> Result<()> {
        let items = self.pop_mark()?;
        self.stack.push(Value::list(items));
        Ok(())
    }

    fn load_dict(&mut self) -> Result<()> {
        let items = self.pop_mark()?;
        if items.len() % 2 != 0 {
            return Err(Error::new(ErrorCode::OddDictItems("DICT")));
        }
        let mut dict = std::collections::BTreeMap::new();
        let mut it = items.into_iter();
        while let (Some(k), Some(v)) = (it.next(), it.next()) {
            dict.insert(k.into_hashable()?, v);
        }
        self.stack.push(Value::Dict(Shared::new(dict)));
        Ok(())
    }

    fn load_frozenset(&mut self) -> Result<()> {
        let items = self.pop_mark()?;
        let set = items
            .into_iter()
            .map(Value::into_hashable)
            .collect::<Result<_>>()?;
        self.stack.push(Value::FrozenSet(crate::value::SharedFrozen::new(set)));
        Ok(())
    }

    fn load_append(&mut self) -> Result<()> {
        let value = self.stack.pop()?;
        match self.stack.top()? {
            Value::List(list) => {
                list.inner_mut().push(value);
                Ok(())
            }
            other => Err(Error::new(ErrorCode::TypeMismatch(format!(
                "APPEND requires a list below the value, found {}",
                other.type_name()
            )))),
        }
    }

    fn load_appends(&mut self) -> Result<()> {
        let items = self.pop_mark()?;
        match self.stack.top()? {
            Value::List(list) => {
                list.inner_mut().extend(items);
                Ok(())
            }
            other => Err(Error::new(ErrorCode::TypeMismatch(format!(
                "APPENDS requires a list below the mark, found {}",
                other.type_name()
            )))),
        }
    }

    fn load_setitem(&mut self) -> Result<()> {
        let value = self.stack.pop()?;
        let key = self.stack.pop()?;
        match self.stack.top()? {
            Value::Dict(dict) => {
                dict.inner_mut().insert(key.into_hashable()?, value);
                Ok(())
            }
            other => Err(Error::new(ErrorCode::TypeMismatch(format!(
                "SETITEM requires a dict below the pair, found {}",
                other.type_name()
            )))),
        }
    }

    fn load_setitems(&mut self) -> Result<()> {
        let items = self.pop_mark()?;
        if items.len() % 2 != 0 {
            return Err(Error::new(ErrorCode::OddDictItems("SETITEMS")));
        }
        match self.stack.top()? {
            Value::Dict(dict) => {
                let mut dict = dict.inner_mut();
                let mut it = items.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    dict.insert(k.into_hashable()?, v);
                }
                Ok(())
            }
            other => Err(Error::new(ErrorCode::TypeMismatch(format!(
                "SETITEMS requires a dict below the mark, found {}",
                other.type_name()
            )))),
        }
    }

    fn load_additems(&mut self) -> Result<()> {
        let items = self.pop_mark()?;
        match self.stack.top()? {
            Value::Set(set) => {
                let mut set = set.inner_mut();
                for item in items {
                    set.insert(item.into_hashable()?);
                }
                Ok(())
            }
            other => Err(Error::new(ErrorCode::TypeMismatch(format!(
                "ADDITEMS requires a set below the mark, found {}",
                other.type_name()
            )))),
        }
    }

    // -- memo --------------------------------------------------------------

    fn load_get(&mut self) -> Result<()> {
        let line = self.readline_str("GET")?;
        let i = codec::parse_index(&line)?;
        if !(0..=u32::MAX as i64).contains(&i) {
            return Err(Error::new(ErrorCode::MemoNotFound(i)));
        }
        let value = self.memo.get(i as u32)?;
        self.stack.push(value);
        Ok(())
    }

    fn load_binget(&mut self) -> Result<()> {
        let i = self.reader.read_u8()?;
        let value = self.memo.get(i as u32)?;
        self.stack.push(value);
        Ok(())
    }

    fn load_long_binget(&mut self) -> Result<()> {
        let i = self.read_u32()?;
        let value = self.memo.get(i)?;
        self.stack.push(value);
        Ok(())
    }

    fn load_put(&mut self) -> Result<()> {
        let line = self.readline_str("PUT")?;
        let i = codec::parse_index(&line)?;
        if i < 0 {
            return Err(Error::new(ErrorCode::NegativeIndex("PUT")));
        }
        if i > u32::MAX as i64 {
            return Err(Error::new(ErrorCode::BadNumber(line)));
        }
        let top = self.stack.top()?.clone();
        self.memo.insert(i as u32, top);
        Ok(())
    }

    fn load_binput(&mut self) -> Result<()> {
        let i = self.reader.read_u8()?;
        let top = self.stack.top()?.clone();
        self.memo.insert(i as u32, top);
        Ok(())
    }

    fn load_long_binput(&mut self) -> Result<()> {
        let i = self.read_u32()?;
        if i as u64 > MAX_SIZE {
            return Err(Error::new(ErrorCode::NegativeIndex("LONG_BINPUT")));
        }
        let top = self.stack.top()?.clone();
        self.memo.insert(i, top);
        Ok(())
    }

    fn load_memoize(&mut self) -> Result<()> {
        let top = self.stack.top()?.clone();
        self.memo.insert(self.memo.next_index(), top);
        Ok(())
    }

    // -- resolution and construction ---------------------------------------

    fn find_class(&mut self, module: &str, name: &str) -> Result<Value> {
        if let Some(audit) = &self.audit {
            audit(module, name);
        }
        let (module, name) = if self.proto < 3 && self.fix_imports {
            compat::remap(module, name)
        } else {
            (module.to_owned(), name.to_owned())
        };
        self.resolver.import_module(&module)?;
        self.resolver.lookup(&module, &name, self.proto)
    }

    fn load_global(&mut self) -> Result<()> {
        let module = self.readline_str("GLOBAL")?;
        let name = self.readline_str("GLOBAL")?;
        let klass = self.find_class(&module, &name)?;
        self.stack.push(klass);
        Ok(())
    }

    fn load_stack_global(&mut self) -> Result<()> {
        let name = self.stack.pop()?;
        let module = self.stack.pop()?;
        let (module, name) = match (&module, &name) {
            (Value::String(m), Value::String(n)) => {
                (m.inner().clone(), n.inner().clone())
            }
            _ => {
                return Err(Error::new(ErrorCode::TypeMismatch(
                    "STACK_GLOBAL requires str".into(),
                )))
            }
        };
        let klass = self.find_class(&module, &name)?;
        self.stack.push(klass);
        Ok(())
    }

    fn get_extension(&mut self, code: i64) -> Result<()> {
        if let Some(cached) = self.ext_cache.get(code) {
            self.stack.push(cached);
            return Ok(());
        }
        let Some((module, name)) = registered_extension(code) else {
            if code <= 0 {
                // Corrupt or hostile pickle.
                return Err(Error::new(ErrorCode::ExtCodeOutOfRange(code)));
            }
            return Err(Error::new(ErrorCode::UnregisteredExtCode(code)));
        };
        let value = self.find_class(&module, &name)?;
        self.ext_cache.insert(code, value.clone());
        self.stack.push(value);
        Ok(())
    }

    fn call_value(&self, callable: &Value, args: Vec<Value>) -> Result<Value> {
        match callable {
            Value::Global(sym) => sym.call(args),
            other => Err(Error::new(ErrorCode::Construction(format!(
                "'{}' object is not callable",
                other.type_name()
            )))),
        }
    }

    fn load_reduce(&mut self) -> Result<()> {
        let args = self.stack.pop()?;
        let args = match args {
            Value::Tuple(t) => t.inner().clone(),
            other => {
                return Err(Error::new(ErrorCode::TypeMismatch(format!(
                    "REDUCE expects an argument tuple, found {}",
                    other.type_name()
                ))))
            }
        };
        let func = self.stack.top()?.clone();
        let value = self.call_value(&func, args)?;
        *self.stack.top_mut()? = value;
        Ok(())
    }

    /// INST and OBJ differ only in how they get the class object; the
    /// construction rule is shared. A class with init-args, or any non-empty
    /// argument list, goes through the constructor; otherwise the allocator.
    fn instantiate(&mut self, klass: Value, args: Vec<Value>) -> Result<()> {
        let value = match &klass {
            Value::Global(sym) => {
                if !args.is_empty() || sym.has_initargs() {
                    sym.call(args)?
                } else {
                    sym.allocate(Vec::new())?
                }
            }
            other => {
                return Err(Error::new(ErrorCode::Construction(format!(
                    "'{}' object is not callable",
                    other.type_name()
                ))))
            }
        };
        self.stack.push(value);
        Ok(())
    }

    fn load_inst(&mut self) -> Result<()> {
        let line = self.readline()?;
        if !line.is_ascii() {
            return Err(Error::new(ErrorCode::BadEncoding(
                "INST module name must be ASCII".into(),
            )));
        }
        let module = String::from_utf8(line).expect("ascii checked");
        let line = self.readline()?;
        if !line.is_ascii() {
            return Err(Error::new(ErrorCode::BadEncoding(
                "INST class name must be ASCII".into(),
            )));
        }
        let name = String::from_utf8(line).expect("ascii checked");
        let klass = self.find_class(&module, &name)?;
        let args = self.pop_mark()?;
        self.instantiate(klass, args)
    }

    fn load_obj(&mut self) -> Result<()> {
        // Stack is ... markobject classobject arg1 arg2 ...
        let mut items = self.pop_mark()?;
        if items.is_empty() {
            return Err(Error::new(ErrorCode::StackUnderflow));
        }
        let klass = items.remove(0);
        self.instantiate(klass, items)
    }

    fn load_newobj(&mut self) -> Result<()> {
        let args = match self.stack.pop()? {
            Value::Tuple(t) => t.inner().clone(),
            other => {
                return Err(Error::new(ErrorCode::TypeMismatch(format!(
                    "NEWOBJ expects an argument tuple, found {}",
                    other.type_name()
                ))))
            }
        };
        match self.stack.pop()? {
            Value::Global(sym) => {
                let obj = sym.allocate(args)?;
                self.stack.push(obj);
                Ok(())
            }
            other => Err(Error::new(ErrorCode::TypeMismatch(format!(
                "NEWOBJ expects a class, found {}",
                other.type_name()
            )))),
        }
    }

    fn load_newobj_ex(&mut self) -> Result<()> {
        let kwargs = self.stack.pop()?;
        if !matches!(kwargs, Value::Dict(_)) {
            return Err(Error::new(ErrorCode::TypeMismatch(format!(
                "NEWOBJ_EX expects a kwargs dict, found {}",
                kwargs.type_name()
            ))));
        }
        let args = match self.stack.pop()? {
            Value::Tuple(t) => t.inner().clone(),
            other => {
                return Err(Error::new(ErrorCode::TypeMismatch(format!(
                    "NEWOBJ_EX expects an argument tuple, found {}",
                    other.type_name()
                ))))
            }
        };
        match self.stack.pop()? {
            Value::Global(sym) => {
                let obj = sym.allocate_ex(args, kwargs)?;
                self.stack.push(obj);
                Ok(())
            }
            other => Err(Error::new(ErrorCode::TypeMismatch(format!(
                "NEWOBJ_EX expects a class, found {}",
                other.type_name()
            )))),
        }
    }

    fn load_build(&mut self) -> Result<()> {
        let state = self.stack.pop()?;
        let target = self.stack.top()?.clone();
        let inst = match &target {
            Value::Instance(inst) => inst.clone(),
            other => {
                return Err(Error::new(ErrorCode::TypeMismatch(format!(
                    "BUILD requires an instance, found {}",
                    other.type_name()
                ))))
            }
        };
        let setstate = inst.inner().class.setstate_hook();
        if let Some(setstate) = setstate {
            return setstate(&target, state);
        }
        let (state, slotstate) = match state {
            Value::Tuple(t) if t.inner().len() == 2 => {
                let pair = t.inner();
                (pair[0].clone(), Some(pair[1].clone()))
            }
            other => (other, None),
        };
        let mut apply = |mapping: Value| -> Result<()> {
            match mapping {
                Value::None => Ok(()),
                Value::Dict(d) => {
                    let mut attrs = inst.inner_mut();
                    for (k, v) in d.inner().iter() {
                        attrs.attrs.insert(k.clone(), v.clone());
                    }
                    Ok(())
                }
                other => Err(Error::new(ErrorCode::Construction(format!(
                    "invalid BUILD state: {}",
                    other.type_name()
                )))),
            }
        };
        apply(state)?;
        if let Some(slotstate) = slotstate {
            apply(slotstate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::io::Cursor;

    use crate::asm;
    use crate::error::ErrorKind;
    use crate::resolve::{register_extension, RegistryResolver};
    use crate::value::{CallHook, HashableValue, SetStateHook, SharedFrozen, Symbol};

    fn machine(bytes: &[u8]) -> PickleMachine<Cursor<Vec<u8>>> {
        PickleMachine::new(Cursor::new(bytes.to_vec()), &MachineOptions::default()).unwrap()
    }

    fn load(bytes: &[u8]) -> Result<Value> {
        machine(bytes).run()
    }

    fn load_ok(bytes: &[u8]) -> Value {
        load(bytes).unwrap()
    }

    fn dict_value(pairs: Vec<(HashableValue, Value)>) -> Value {
        Value::Dict(Shared::new(pairs.into_iter().collect::<BTreeMap<_, _>>()))
    }

    // -- the end-to-end scenarios ------------------------------------------

    #[test]
    fn bare_stop_underflows() {
        let err = load(b".").unwrap_err();
        assert_eq!(err.code, ErrorCode::StackUnderflow);
        assert_eq!(err.pos, Some(0));
        assert_eq!(err.opcode, Some(b'.'));
    }

    #[test]
    fn empty_list_scenario() {
        assert_eq!(load_ok(b"]."), Value::list(vec![]));
    }

    #[test]
    fn empty_tuple_scenario() {
        assert_eq!(load_ok(b")."), Value::tuple(vec![]));
    }

    #[test]
    fn binint1_scenario() {
        let mut m = machine(b"\x80\x04K\x2a.");
        assert_eq!(m.run().unwrap(), Value::I64(42));
        assert_eq!(m.protocol(), 4);
    }

    #[test]
    fn appends_scenario() {
        assert_eq!(
            load_ok(b"\x80\x04](K\x01K\x02K\x03e."),
            Value::list(vec![Value::I64(1), Value::I64(2), Value::I64(3)])
        );
    }

    #[test]
    fn append_pushes_single_item_into_list() {
        let stream = [
            asm::proto(4),
            asm::empty_list(),
            asm::binint1(7),
            asm::append(),
            asm::short_binunicode("x"),
            asm::append(),
            asm::stop(),
        ]
        .concat();
        assert_eq!(
            load_ok(&stream),
            Value::list(vec![Value::I64(7), Value::string("x")])
        );
    }

    #[test]
    fn memoize_identity_scenario() {
        let mut m = machine(b"\x80\x04\x8c\x03foo\x94h\x00\x85.");
        let value = m.run().unwrap();
        let tuple = match &value {
            Value::Tuple(t) => t.inner().clone(),
            other => panic!("expected tuple, got {other}"),
        };
        assert_eq!(tuple.len(), 1);
        assert_eq!(tuple[0], Value::string("foo"));
        match (&tuple[0], m.memo().get(0).unwrap()) {
            (Value::String(a), Value::String(b)) => assert!(a.ptr_eq(&b)),
            other => panic!("expected shared strings, got {other:?}"),
        }
    }

    #[test]
    fn setitems_scenario() {
        assert_eq!(
            load_ok(b"\x80\x04}q\x00(K\x01K\x02u."),
            dict_value(vec![(HashableValue::I64(1), Value::I64(2))])
        );
    }

    // -- invariants --------------------------------------------------------

    #[test]
    fn determinism() {
        let stream = [
            asm::proto(4),
            asm::empty_dict(),
            asm::mark(),
            asm::short_binunicode("k"),
            asm::mark(),
            asm::binint1(1),
            asm::binfloat(2.5),
            asm::list(),
            asm::setitems(),
            asm::stop(),
        ]
        .concat();
        assert_eq!(load_ok(&stream), load_ok(&stream));
    }

    #[test]
    fn framing_is_transparent() {
        let body = [
            asm::empty_list(),
            asm::mark(),
            asm::binint1(1),
            asm::binint1(2),
            asm::binint1(3),
            asm::appends(),
            asm::stop(),
        ]
        .concat();
        let plain = [asm::proto(4), body.clone()].concat();
        let framed = [asm::proto(4), asm::frame(&body)].concat();
        assert_eq!(load_ok(&plain), load_ok(&framed));
    }

    #[test]
    fn mark_balance_at_stop() {
        let stream = [
            asm::proto(4),
            asm::empty_list(),
            asm::mark(),
            asm::binint1(1),
            asm::mark(),
            asm::binint1(2),
            asm::tuple(),
            asm::appends(),
            asm::stop(),
        ]
        .concat();
        let mut m = machine(&stream);
        let mut depth = 0usize;
        loop {
            let step = m.step().unwrap();
            match m.current_opcode() {
                Some(p_op::MARK) => depth += 1,
                Some(p_op::TUPLE) | Some(p_op::APPENDS) => depth -= 1,
                _ => {}
            }
            assert_eq!(m.metastack().len(), depth);
            if let Step::Stopped(_) = step {
                break;
            }
        }
        assert!(m.metastack().is_empty());
        assert!(m.stack().is_empty());
    }

    #[test]
    fn every_byte_dispatches_or_is_unknown() {
        for byte in 0u16..=255 {
            let byte = byte as u8;
            let result = machine(&[byte]).step();
            let known = crate::ops::mnemonic(byte).is_some();
            match result {
                Err(Error {
                    code: ErrorCode::UnknownOpcode(b),
                    ..
                }) => {
                    assert!(!known, "opcode 0x{byte:02x} has a mnemonic but no handler");
                    assert_eq!(b, byte);
                }
                _ => assert!(known, "opcode 0x{byte:02x} dispatched without a handler"),
            }
        }
    }

    #[test]
    fn negative_lengths_rejected() {
        let mut long4 = vec![p_op::LONG4];
        long4.extend_from_slice(&(-1i32).to_le_bytes());
        let err = load(&long4).unwrap_err();
        assert_eq!(err.code, ErrorCode::NegativeLength("LONG"));

        let mut binstring = vec![p_op::BINSTRING];
        binstring.extend_from_slice(&(-1i32).to_le_bytes());
        let err = load(&binstring).unwrap_err();
        assert_eq!(err.code, ErrorCode::NegativeLength("BINSTRING"));
    }

    #[test]
    fn oversized_lengths_rejected_before_consuming() {
        for opcode in [p_op::BINBYTES8, p_op::BINUNICODE8, p_op::BYTEARRAY8] {
            let mut stream = vec![opcode];
            stream.extend_from_slice(&u64::MAX.to_le_bytes());
            stream.extend_from_slice(b"leftover");
            let err = load(&stream).unwrap_err();
            assert!(
                matches!(err.code, ErrorCode::LengthTooLarge(..)),
                "0x{opcode:02x}: {err}"
            );
        }
    }

    #[test]
    fn assembler_round_trips() {
        let cases: Vec<(Vec<u8>, Value)> = vec![
            (asm::none(), Value::None),
            (asm::newtrue(), Value::Bool(true)),
            (asm::int_bool(false), Value::Bool(false)),
            (asm::int(-17), Value::I64(-17)),
            (asm::binint(-70000), Value::I64(-70000)),
            (asm::binint2(65535), Value::I64(65535)),
            (asm::long(99), Value::I64(99)),
            (asm::long1(&(-259).into()), Value::I64(-259)),
            (asm::long4(&987654321.into()), Value::I64(987654321)),
            (asm::float(-2.5), Value::F64(-2.5)),
            (asm::binfloat(1.5e300), Value::F64(1.5e300)),
            (asm::string("abc"), Value::string("abc")),
            (asm::binunicode("caf\u{e9}"), Value::string("caf\u{e9}")),
            (asm::short_binbytes(b"\x00\xff"), Value::bytes(b"\x00\xff".to_vec())),
            (
                asm::bytearray8(b"mut"),
                Value::Bytearray(Shared::new(b"mut".to_vec())),
            ),
        ];
        for (body, expected) in cases {
            let stream = [body, asm::stop()].concat();
            assert_eq!(load_ok(&stream), expected, "{stream:?}");
        }
    }

    #[test]
    fn big_long_round_trips() {
        let big: num_bigint::BigInt = num_bigint::BigInt::from(u64::MAX) * 12345;
        let stream = [asm::long1(&big), asm::stop()].concat();
        assert_eq!(load_ok(&stream), Value::Int(big));
    }

    // -- individual handler behavior ---------------------------------------

    #[test]
    fn int_line_specials_and_bases() {
        assert_eq!(load_ok(b"I01\n."), Value::Bool(true));
        assert_eq!(load_ok(b"I00\n."), Value::Bool(false));
        assert_eq!(load_ok(b"I0x10\n."), Value::I64(16));
        assert!(load(b"Inope\n.").is_err());
    }

    #[test]
    fn long_line_strips_suffix() {
        assert_eq!(load_ok(b"L123L\n."), Value::I64(123));
        assert_eq!(load_ok(b"L-5\n."), Value::I64(-5));
    }

    #[test]
    fn float_line_accepts_special_spellings() {
        assert_eq!(load_ok(b"F2.5\n."), Value::F64(2.5));
        assert_eq!(load_ok(b"Finf\n."), Value::F64(f64::INFINITY));
        match load_ok(b"Fnan\n.") {
            Value::F64(v) => assert!(v.is_nan()),
            other => panic!("expected float, got {other}"),
        }
    }

    #[test]
    fn string_requires_quotes() {
        assert_eq!(load_ok(b"S'abc'\n."), Value::string("abc"));
        assert_eq!(load_ok(b"S\"a\\nb\"\n."), Value::string("a\nb"));
        let err = load(b"Sabc\n.").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Format);
    }

    #[test]
    fn legacy_strings_follow_encoding_config() {
        let options = MachineOptions {
            encoding: "bytes".into(),
            ..MachineOptions::default()
        };
        let stream = [asm::short_binstring(b"\xffraw"), asm::stop()].concat();
        let mut m = PickleMachine::new(Cursor::new(stream.clone()), &options).unwrap();
        assert_eq!(m.run().unwrap(), Value::bytes(b"\xffraw".to_vec()));
        // default ASCII strict rejects the same stream
        assert!(load(&stream).is_err());
    }

    #[test]
    fn unicode_line_uses_raw_escapes() {
        assert_eq!(load_ok(b"V\\u00e9\n."), Value::string("\u{e9}"));
    }

    #[test]
    fn binunicode_rejects_invalid_utf8() {
        let stream = [vec![p_op::BINUNICODE], 2u32.to_le_bytes().to_vec(), vec![0xff, 0xfe], asm::stop()]
            .concat();
        let err = load(&stream).unwrap_err();
        assert!(matches!(err.code, ErrorCode::BadEncoding(_)));
    }

    #[test]
    fn pop_discards_top_or_mark() {
        assert_eq!(load_ok(b"K\x01K\x020."), Value::I64(1));
        // empty stack: POP takes the mark instead
        assert_eq!(load_ok(b"(0K\x05."), Value::I64(5));
        let err = load(b"0.").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnmatchedMark);
    }

    #[test]
    fn pop_mark_restores_saved_stack() {
        assert_eq!(load_ok(b"K\x05(K\x01K\x021."), Value::I64(5));
    }

    #[test]
    fn dup_shares_identity() {
        let value = load_ok(b"]2\x86.");
        match value {
            Value::Tuple(t) => match (&t.inner()[0], &t.inner()[1]) {
                (Value::List(a), Value::List(b)) => assert!(a.ptr_eq(b)),
                other => panic!("expected lists, got {other:?}"),
            },
            other => panic!("expected tuple, got {other}"),
        }
    }

    #[test]
    fn fixed_tuples_preserve_order() {
        assert_eq!(
            load_ok(b"K\x01K\x02\x86."),
            Value::tuple(vec![Value::I64(1), Value::I64(2)])
        );
        assert_eq!(
            load_ok(b"K\x01K\x02K\x03\x87."),
            Value::tuple(vec![Value::I64(1), Value::I64(2), Value::I64(3)])
        );
    }

    #[test]
    fn dict_from_mark() {
        assert_eq!(
            load_ok(b"(K\x01K\x02d."),
            dict_value(vec![(HashableValue::I64(1), Value::I64(2))])
        );
        let err = load(b"(K\x01d.").unwrap_err();
        assert_eq!(err.code, ErrorCode::OddDictItems("DICT"));
    }

    #[test]
    fn sets_and_frozensets() {
        let stream = [
            asm::empty_set(),
            asm::mark(),
            asm::binint1(1),
            asm::binint1(2),
            asm::additems(),
            asm::stop(),
        ]
        .concat();
        match load_ok(&stream) {
            Value::Set(set) => {
                assert_eq!(set.inner().len(), 2);
                assert!(set.inner().contains(&HashableValue::I64(1)));
            }
            other => panic!("expected set, got {other}"),
        }

        let stream = [asm::mark(), asm::binint1(7), asm::frozenset(), asm::stop()].concat();
        match load_ok(&stream) {
            Value::FrozenSet(set) => assert!(set.inner().contains(&HashableValue::I64(7))),
            other => panic!("expected frozenset, got {other}"),
        }
    }

    #[test]
    fn container_type_mismatches() {
        // APPEND below a non-list
        let err = load(b"K\x01K\x02a.").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
        // ADDITEMS below a non-set
        let stream = [
            asm::empty_list(),
            asm::mark(),
            asm::binint1(1),
            asm::additems(),
            asm::stop(),
        ]
        .concat();
        assert_eq!(load(&stream).unwrap_err().kind(), ErrorKind::Type);
    }

    #[test]
    fn unhashable_key_is_a_type_error() {
        let stream = [
            asm::empty_dict(),
            asm::mark(),
            asm::empty_list(),
            asm::binint1(1),
            asm::setitems(),
            asm::stop(),
        ]
        .concat();
        let err = load(&stream).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotHashable("list"));
    }

    // -- memo --------------------------------------------------------------

    #[test]
    fn get_put_families() {
        let stream = [
            asm::binint1(9),
            asm::put(0),
            asm::pop(),
            asm::get(0),
            asm::stop(),
        ]
        .concat();
        assert_eq!(load_ok(&stream), Value::I64(9));

        let stream = [
            asm::binint1(9),
            asm::long_binput(3),
            asm::pop(),
            asm::long_binget(3),
            asm::stop(),
        ]
        .concat();
        assert_eq!(load_ok(&stream), Value::I64(9));
    }

    #[test]
    fn memo_misses_and_bad_indexes() {
        let err = load(b"g7\n.").unwrap_err();
        assert_eq!(err.code, ErrorCode::MemoNotFound(7));
        let err = load(b"g-1\n.").unwrap_err();
        assert_eq!(err.code, ErrorCode::MemoNotFound(-1));
        let err = load(b"K\x01p-4\n.").unwrap_err();
        assert_eq!(err.code, ErrorCode::NegativeIndex("PUT"));
        let err = load(b"h\x09.").unwrap_err();
        assert_eq!(err.code, ErrorCode::MemoNotFound(9));
    }

    #[test]
    fn memo_shares_mutable_identity() {
        // list memoized, fetched back and appended into itself
        let value = load_ok(b"]q\x00h\x00a.");
        match value {
            Value::List(list) => {
                let inner = list.inner();
                assert_eq!(inner.len(), 1);
                match &inner[0] {
                    Value::List(elem) => assert!(elem.ptr_eq(&list)),
                    other => panic!("expected list, got {other:?}"),
                }
            }
            other => panic!("expected list, got {other}"),
        }
    }

    #[test]
    fn memoize_uses_entry_count_even_with_gaps() {
        let stream = [
            asm::binint1(1),
            asm::binput(5),
            asm::binint1(2),
            asm::memoize(),
            asm::stop(),
        ]
        .concat();
        let mut m = machine(&stream);
        m.run().unwrap();
        assert_eq!(m.memo().get(5).unwrap(), Value::I64(1));
        // one prior entry, so MEMOIZE stored at index 1
        assert_eq!(m.memo().get(1).unwrap(), Value::I64(2));
    }

    // -- resolution and construction ---------------------------------------

    #[test]
    fn global_resolves_through_registry() {
        let mut resolver = RegistryResolver::strict();
        resolver.register_symbol("os", "system");
        let stream = [asm::proto(4), asm::global("os", "system"), asm::stop()].concat();
        let mut m = machine(&stream).with_resolver(Box::new(resolver));
        match m.run().unwrap() {
            Value::Global(sym) => {
                assert_eq!(sym.module(), "os");
                assert_eq!(sym.qualname(), "system");
            }
            other => panic!("expected symbol, got {other}"),
        }
    }

    #[test]
    fn fix_imports_remaps_legacy_names() {
        let mut resolver = RegistryResolver::strict();
        resolver.register_symbol("builtins", "range");
        let stream = [asm::global("__builtin__", "xrange"), asm::stop()].concat();
        // protocol 0 + fix_imports: the legacy pair is remapped
        let mut m = machine(&stream).with_resolver(Box::new(resolver));
        assert!(m.run().is_ok());

        let mut resolver = RegistryResolver::strict();
        resolver.register_symbol("builtins", "range");
        let options = MachineOptions {
            fix_imports: false,
            ..MachineOptions::default()
        };
        let mut m = PickleMachine::new(Cursor::new(stream.clone()), &options)
            .unwrap()
            .with_resolver(Box::new(resolver));
        assert_eq!(m.run().unwrap_err().kind(), ErrorKind::Resolution);
    }

    #[test]
    fn stack_global_requires_strings() {
        let stream = [
            asm::proto(4),
            asm::short_binunicode("collections"),
            asm::short_binunicode("OrderedDict"),
            asm::stack_global(),
            asm::stop(),
        ]
        .concat();
        match load_ok(&stream) {
            Value::Global(sym) => assert_eq!(sym.qualname(), "OrderedDict"),
            other => panic!("expected symbol, got {other}"),
        }

        let stream = [
            asm::proto(4),
            asm::binint1(1),
            asm::binint1(2),
            asm::stack_global(),
            asm::stop(),
        ]
        .concat();
        let err = load(&stream).unwrap_err();
        assert_eq!(
            err.code,
            ErrorCode::TypeMismatch("STACK_GLOBAL requires str".into())
        );
    }

    #[test]
    fn audit_hook_sees_resolutions_in_stream_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let hook: AuditHook = Rc::new(move |module: &str, name: &str| {
            sink.borrow_mut().push((module.to_owned(), name.to_owned()));
        });
        let stream = [
            asm::global("a", "X"),
            asm::pop(),
            asm::global("b", "Y"),
            asm::stop(),
        ]
        .concat();
        machine(&stream).with_audit_hook(hook).run().unwrap();
        assert_eq!(
            *seen.borrow(),
            vec![("a".to_owned(), "X".to_owned()), ("b".to_owned(), "Y".to_owned())]
        );
    }

    #[test]
    fn reduce_invokes_registered_callable() {
        let mut resolver = RegistryResolver::strict();
        let hook: CallHook = Rc::new(|args| {
            let sum = args
                .iter()
                .map(|v| match v {
                    Value::I64(i) => *i,
                    _ => 0,
                })
                .sum();
            Ok(Value::I64(sum))
        });
        let sym = Rc::new(Symbol::new("m", "add").with_call(hook));
        resolver.register("m", "add", Value::Global(sym));
        let stream = [
            asm::proto(4),
            asm::global("m", "add"),
            asm::mark(),
            asm::binint1(2),
            asm::binint1(3),
            asm::tuple(),
            asm::reduce(),
            asm::stop(),
        ]
        .concat();
        let mut m = machine(&stream).with_resolver(Box::new(resolver));
        assert_eq!(m.run().unwrap(), Value::I64(5));
    }

    #[test]
    fn reduce_on_opaque_symbol_records_arguments() {
        let stream = [
            asm::proto(4),
            asm::global("torch._utils", "_rebuild_tensor_v2"),
            asm::mark(),
            asm::binint1(1),
            asm::tuple(),
            asm::reduce(),
            asm::stop(),
        ]
        .concat();
        match load_ok(&stream) {
            Value::Instance(inst) => {
                let inst = inst.inner();
                assert_eq!(inst.class.qualname(), "_rebuild_tensor_v2");
                assert_eq!(inst.args, vec![Value::I64(1)]);
            }
            other => panic!("expected instance, got {other}"),
        }
    }

    #[test]
    fn reduce_requires_tuple_args() {
        let stream = [
            asm::proto(4),
            asm::global("m", "f"),
            asm::binint1(1),
            asm::reduce(),
            asm::stop(),
        ]
        .concat();
        assert_eq!(load(&stream).unwrap_err().kind(), ErrorKind::Type);
    }

    #[test]
    fn newobj_and_newobj_ex() {
        let stream = [
            asm::proto(2),
            asm::global("m", "K"),
            asm::empty_tuple(),
            asm::newobj(),
            asm::stop(),
        ]
        .concat();
        match load_ok(&stream) {
            Value::Instance(inst) => assert!(inst.inner().args.is_empty()),
            other => panic!("expected instance, got {other}"),
        }

        let stream = [
            asm::proto(4),
            asm::global("m", "K"),
            asm::mark(),
            asm::binint1(1),
            asm::tuple(),
            asm::empty_dict(),
            asm::newobj_ex(),
            asm::stop(),
        ]
        .concat();
        match load_ok(&stream) {
            Value::Instance(inst) => {
                let inst = inst.inner();
                assert_eq!(inst.args, vec![Value::I64(1)]);
                assert!(inst.kwargs.is_some());
            }
            other => panic!("expected instance, got {other}"),
        }
    }

    #[test]
    fn inst_and_obj_construct_instances() {
        let stream = [
            asm::mark(),
            asm::binint1(1),
            asm::binint1(2),
            asm::inst("m", "Point"),
            asm::stop(),
        ]
        .concat();
        match load_ok(&stream) {
            Value::Instance(inst) => {
                let inst = inst.inner();
                assert_eq!(inst.class.qualname(), "Point");
                assert_eq!(inst.args, vec![Value::I64(1), Value::I64(2)]);
            }
            other => panic!("expected instance, got {other}"),
        }

        let stream = [
            asm::proto(1),
            asm::mark(),
            asm::global("m", "Point"),
            asm::binint1(3),
            asm::obj(),
            asm::stop(),
        ]
        .concat();
        match load_ok(&stream) {
            Value::Instance(inst) => assert_eq!(inst.inner().args, vec![Value::I64(3)]),
            other => panic!("expected instance, got {other}"),
        }
    }

    #[test]
    fn build_merges_state_dicts() {
        let stream = [
            asm::proto(4),
            asm::global("m", "K"),
            asm::empty_tuple(),
            asm::newobj(),
            asm::empty_dict(),
            asm::short_binunicode("x"),
            asm::binint1(1),
            asm::setitem(),
            asm::build(),
            asm::stop(),
        ]
        .concat();
        match load_ok(&stream) {
            Value::Instance(inst) => {
                let inst = inst.inner();
                assert_eq!(
                    inst.attrs
                        .get(&HashableValue::String(SharedFrozen::new("x".into()))),
                    Some(&Value::I64(1))
                );
            }
            other => panic!("expected instance, got {other}"),
        }
    }

    #[test]
    fn build_applies_slot_state_pair() {
        let stream = [
            asm::proto(4),
            asm::global("m", "K"),
            asm::empty_tuple(),
            asm::newobj(),
            // state is (None, {"s": 2})
            asm::none(),
            asm::empty_dict(),
            asm::short_binunicode("s"),
            asm::binint1(2),
            asm::setitem(),
            asm::tuple2(),
            asm::build(),
            asm::stop(),
        ]
        .concat();
        match load_ok(&stream) {
            Value::Instance(inst) => {
                let inst = inst.inner();
                assert_eq!(
                    inst.attrs
                        .get(&HashableValue::String(SharedFrozen::new("s".into()))),
                    Some(&Value::I64(2))
                );
            }
            other => panic!("expected instance, got {other}"),
        }
    }

    #[test]
    fn build_prefers_setstate_hook() {
        let captured = Rc::new(RefCell::new(None));
        let sink = captured.clone();
        let hook: SetStateHook = Rc::new(move |_target, state| {
            *sink.borrow_mut() = Some(state);
            Ok(())
        });
        let mut resolver = RegistryResolver::strict();
        let sym = Rc::new(Symbol::new("m", "K").with_setstate(hook));
        resolver.register("m", "K", Value::Global(sym));
        let stream = [
            asm::proto(4),
            asm::global("m", "K"),
            asm::empty_tuple(),
            asm::newobj(),
            asm::binint1(9),
            asm::build(),
            asm::stop(),
        ]
        .concat();
        let mut m = machine(&stream).with_resolver(Box::new(resolver));
        m.run().unwrap();
        assert_eq!(*captured.borrow(), Some(Value::I64(9)));
    }

    #[test]
    fn build_on_non_instance_is_a_type_error() {
        let stream = [asm::empty_list(), asm::none(), asm::build(), asm::stop()].concat();
        assert_eq!(load(&stream).unwrap_err().kind(), ErrorKind::Type);
    }

    // -- extensions --------------------------------------------------------

    #[test]
    fn extension_codes_resolve_and_cache() {
        register_extension(61001, "extmod", "ExtClass");
        let cache = crate::resolve::ExtensionCache::new();
        let stream = [asm::proto(2), asm::ext2(61001), asm::stop()].concat();
        let mut m = machine(&stream).with_extension_cache(cache.clone());
        match m.run().unwrap() {
            Value::Global(sym) => assert_eq!(sym.qualname(), "ExtClass"),
            other => panic!("expected symbol, got {other}"),
        }
        assert!(cache.get(61001).is_some());
    }

    #[test]
    fn cached_extensions_skip_resolution() {
        let cache = crate::resolve::ExtensionCache::new();
        cache.insert(77, Value::I64(123));
        let stream = [asm::proto(2), asm::ext1(77), asm::stop()].concat();
        let mut m = machine(&stream)
            .with_resolver(Box::new(RegistryResolver::strict()))
            .with_extension_cache(cache);
        assert_eq!(m.run().unwrap(), Value::I64(123));
    }

    #[test]
    fn bad_extension_codes() {
        let stream = [asm::proto(2), asm::ext4(-2), asm::stop()].concat();
        assert_eq!(
            load(&stream).unwrap_err().code,
            ErrorCode::ExtCodeOutOfRange(-2)
        );
        let stream = [asm::proto(2), asm::ext2(59999), asm::stop()].concat();
        assert_eq!(
            load(&stream).unwrap_err().code,
            ErrorCode::UnregisteredExtCode(59999)
        );
    }

    // -- persistent ids and buffers ----------------------------------------

    #[test]
    fn persistent_ids_need_a_hook() {
        let err = load(b"Pkey\n.").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedPersistentId);
        assert_eq!(err.kind(), ErrorKind::Policy);

        let hook: PersistentLoadHook =
            Rc::new(|pid| Ok(Value::tuple(vec![Value::string("loaded"), pid])));
        let mut m = machine(b"Pkey\n.").with_persistent_load(hook);
        assert_eq!(
            m.run().unwrap(),
            Value::tuple(vec![Value::string("loaded"), Value::string("key")])
        );
    }

    #[test]
    fn binpersid_pops_the_id() {
        let hook: PersistentLoadHook = Rc::new(|pid| Ok(pid));
        let stream = [asm::proto(4), asm::binint1(3), asm::binpersid(), asm::stop()].concat();
        let mut m = machine(&stream).with_persistent_load(hook);
        assert_eq!(m.run().unwrap(), Value::I64(3));
    }

    #[test]
    fn out_of_band_buffers() {
        let stream = [asm::proto(5), asm::next_buffer(), asm::stop()].concat();
        let err = load(&stream).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoBuffers);

        let mut m = machine(&stream).with_buffers(vec![b"payload".to_vec()]);
        match m.run().unwrap() {
            Value::Buffer { data, readonly } => {
                assert!(!readonly);
                assert_eq!(*data.inner(), b"payload");
            }
            other => panic!("expected buffer, got {other}"),
        }

        let stream = [
            asm::proto(5),
            asm::next_buffer(),
            asm::pop(),
            asm::next_buffer(),
            asm::stop(),
        ]
        .concat();
        let mut m = machine(&stream).with_buffers(vec![b"only-one".to_vec()]);
        assert_eq!(m.run().unwrap_err().code, ErrorCode::BuffersExhausted);
    }

    #[test]
    fn readonly_buffer_shares_backing_storage() {
        let stream = [
            asm::proto(5),
            asm::next_buffer(),
            asm::readonly_buffer(),
            asm::stop(),
        ]
        .concat();
        let mut m = machine(&stream).with_buffers(vec![b"abc".to_vec()]);
        match m.run().unwrap() {
            Value::Buffer { data, readonly } => {
                assert!(readonly);
                assert_eq!(*data.inner(), b"abc");
            }
            other => panic!("expected buffer, got {other}"),
        }

        let err = load(b"\x80\x05K\x01\x98.").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    // -- engine state machine ----------------------------------------------

    #[test]
    fn protocol_gate() {
        let err = load(b"\x80\x06.").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnsupportedProtocol(6));
        assert_eq!(err.pos, Some(0));
    }

    #[test]
    fn nested_frame_is_fatal() {
        let inner = asm::frame(&asm::stop());
        let outer = [asm::binint1(1), inner].concat();
        let stream = [asm::proto(4), asm::frame(&outer)].concat();
        let err = load(&stream).unwrap_err();
        assert_eq!(err.code, ErrorCode::NestedFrame);
    }

    #[test]
    fn step_after_stop_is_a_state_error() {
        let mut m = machine(b"N.");
        assert_eq!(m.run().unwrap(), Value::None);
        assert_eq!(m.state(), MachineState::Stopped);
        assert_eq!(m.step().unwrap_err().code, ErrorCode::MachineHalted);
    }

    #[test]
    fn failed_machine_stays_inspectable() {
        let stream = [asm::binint1(7), vec![0xff]].concat();
        let mut m = machine(&stream);
        assert_eq!(m.step().unwrap(), Step::Continue);
        let err = m.step().unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownOpcode(0xff));
        assert_eq!(err.pos, Some(2));
        assert_eq!(m.state(), MachineState::Failed);
        // the stack is still observable for debugging
        assert_eq!(m.stack(), &[Value::I64(7)]);
        assert_eq!(m.step().unwrap_err().code, ErrorCode::MachineHalted);
    }

    #[test]
    fn truncated_stream_reports_position() {
        let mut m = machine(b"K");
        let err = m.run().unwrap_err();
        assert_eq!(err.code, ErrorCode::Truncated);
        assert_eq!(m.state(), MachineState::Failed);
    }

    #[test]
    fn step_walks_one_instruction_at_a_time() {
        let mut m = machine(b"\x80\x04K\x2a.");
        assert_eq!(m.state(), MachineState::Initialized);
        assert_eq!(m.step().unwrap(), Step::Continue);
        assert_eq!(m.state(), MachineState::Running);
        assert_eq!(m.current_pos(), 0);
        assert_eq!(m.step().unwrap(), Step::Continue);
        assert_eq!(m.current_pos(), 2);
        assert_eq!(m.stack(), &[Value::I64(42)]);
        assert_eq!(m.step().unwrap(), Step::Stopped(Value::I64(42)));
        assert_eq!(m.state(), MachineState::Stopped);
    }
}
