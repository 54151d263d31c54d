//! The interpreter: one accumulator, one stack, one pool, and a
//! fetch-execute loop that never recurses on the host stack.

use std::io::{self, Read, Write};

use kombi_core::bytecode::model::{tag, ExOpcode, Instruction, Opcode, Operand, Token};
use kombi_core::BOOTSTRAP_LEN;

use crate::error::{LoadResult, VmError, VmResult};
use crate::pool::Pool;
use crate::program::Program;
use crate::stack::Stack;
use crate::value::{Addr, Value};

/// Bootstrap entry: apply the top of the stack, then fall through the
/// `XCH, LA, LA, LA` tail that finishes a substitution.
const SUBST_ENTRY: Addr = 0;
/// Bootstrap entry: pop a function, apply it, then return through the `~j` below it.
const APPLY_ENTRY: Addr = 3;

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmOptions {
    /// Name reported in diagnostics.
    pub file_name: String,
    /// Values per stack segment.
    pub stack_segment_size: u32,
    /// Pool capacity, in elements.
    pub pool_size: u32,
    /// Tolerate a bytecode version mismatch.
    pub force_exec: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self { file_name: "<memory>".to_owned(), stack_segment_size: 256, pool_size: 65_536, force_exec: false }
    }
}

/// Counters of the last run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Instructions executed.
    pub steps: u64,
    /// Deepest stack.
    pub peak_depth: u32,
    /// Most pool elements live at once.
    pub peak_pool: u32,
    /// Pool elements live now.
    pub live: u32,
}

enum Flow {
    Next,
    Jump(Addr),
    Halt(Value),
}

/// One interpreter instance. Instances share nothing.
#[derive(Debug)]
pub struct Vm {
    program: Program,
    pool: Pool,
    stack: Stack,
    acc: Value,
    ip: Addr,
    current: Option<u8>,
    steps: u64,
}

impl Vm {
    /// Sizes the pool and stack for `program`.
    pub fn new(program: Program, opts: &VmOptions) -> LoadResult<Self> {
        let pool = Pool::new(opts.pool_size, program.code().len())?;
        let stack = Stack::new(opts.stack_segment_size)?;
        Ok(Self { program, pool, stack, acc: Value::Empty, ip: BOOTSTRAP_LEN, current: None, steps: 0 })
    }

    /// Loads an image and builds a VM for it.
    pub fn load(bytes: &[u8], opts: &VmOptions) -> LoadResult<Self> {
        Self::new(Program::load(bytes, &opts.file_name, opts.force_exec)?, opts)
    }

    /// The loaded program.
    pub const fn program(&self) -> &Program { &self.program }

    /// The object pool.
    pub const fn pool(&self) -> &Pool { &self.pool }

    /// The stack.
    pub const fn stack(&self) -> &Stack { &self.stack }

    /// Address of the instruction executing, or that failed.
    pub const fn ip(&self) -> Addr { self.ip }

    /// Counters of the last run.
    pub fn stats(&self) -> RunStats {
        RunStats {
            steps: self.steps,
            peak_depth: self.stack.peak_depth(),
            peak_pool: self.pool.peak_live(),
            live: self.pool.live(),
        }
    }

    /// Runs from the first `.text` instruction until `e` is applied.
    ///
    /// The returned value is owned by the caller; hand it back to
    /// [`Vm::release`] when done. Any error is fatal for this run.
    pub fn execute(&mut self, input: &mut dyn Read, output: &mut dyn Write) -> VmResult<Value> {
        self.reset()?;
        #[cfg(feature = "tracing")]
        tracing::debug!(file = self.program.file_name(), "execution started");

        let result = self.run_loop(input, output);
        let flushed = output.flush();
        let value = result?;
        if let Err(e) = flushed {
            self.release(value)?;
            return Err(VmError::Io(e));
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(steps = self.steps, result = %value, "execution halted");
        Ok(value)
    }

    /// Like [`Vm::execute`], but logs a failure and yields [`Value::Empty`].
    pub fn run(&mut self, input: &mut dyn Read, output: &mut dyn Write) -> Value {
        match self.execute(input, output) {
            Ok(v) => v,
            Err(err) => {
                self.report(&err);
                Value::Empty
            }
        }
    }

    fn report(&self, err: &VmError) {
        #[cfg(feature = "tracing")]
        {
            let instruction = self.program.listing_line(self.ip);
            tracing::error!(stage = "runtime error", file = self.program.file_name(), ip = self.ip, %instruction, "{err}");
        }
        #[cfg(not(feature = "tracing"))]
        let _ = err;
    }

    /// Drops the reference owned by `v`.
    pub fn release(&mut self, v: Value) -> VmResult<()> { self.pool.release(v, &mut self.stack) }

    /// Releases the accumulator and everything on the stack.
    pub fn unwind(&mut self) -> VmResult<()> {
        let acc = std::mem::take(&mut self.acc);
        self.release(acc)?;
        self.stack.clear(&mut self.pool)
    }

    /// Forgets all state, including anything leaked by a failed run.
    pub fn reset(&mut self) -> VmResult<()> {
        self.acc = Value::Empty;
        self.ip = BOOTSTRAP_LEN;
        self.current = None;
        self.steps = 0;
        self.pool.clear();
        self.stack.forget()
    }

    fn run_loop(&mut self, input: &mut dyn Read, output: &mut dyn Write) -> VmResult<Value> {
        loop {
            let ins = self.program.fetch(self.ip)?;
            self.steps += 1;
            match self.step(ins, input, output)? {
                Flow::Next => self.ip += 1,
                Flow::Jump(target) => self.ip = target,
                Flow::Halt(v) => return Ok(v),
            }
        }
    }

    fn take_acc(&mut self) -> Value { std::mem::take(&mut self.acc) }

    fn push<const N: usize>(&mut self, values: [Value; N]) -> VmResult<()> {
        self.stack.push_all(values, &mut self.pool)
    }

    fn pop(&mut self) -> VmResult<Value> { self.stack.pop(&mut self.pool) }

    fn step(&mut self, ins: Instruction, input: &mut dyn Read, output: &mut dyn Write) -> VmResult<Flow> {
        let op = Opcode::from_byte(ins.op).ok_or(VmError::InvalidOpcode(ins.op))?;
        match (op, ins.operand) {
            (Opcode::Apply, Operand::Pair(first, second)) => {
                let (func, arg) = if first.is_acc() {
                    let arg = literal(second)?;
                    (self.take_acc(), arg)
                } else if second.is_acc() {
                    (literal(first)?, self.take_acc())
                } else {
                    let pair = (literal(first)?, literal(second)?);
                    let old = self.take_acc();
                    self.release(old)?;
                    pair
                };
                self.apply(func, arg, input, output)
            }
            (Opcode::PopApply, _) => {
                let func = self.pop()?;
                let arg = self.take_acc();
                self.apply(func, arg, input, output)
            }
            (Opcode::Save, Operand::Offset(skip)) if self.acc == Value::D => self.delay(skip),
            (Opcode::Save, _) => {
                let v = self.pool.retain(self.acc)?;
                self.push([v])?;
                Ok(Flow::Next)
            }
            (Opcode::Exchange, _) if self.acc == Value::D => {
                let func = self.pop()?;
                let arg = self.pop()?;
                self.acc = Value::D1App(self.pool.alloc2(func, arg)?);
                Ok(Flow::Next)
            }
            (Opcode::Exchange, _) => {
                let acc = self.take_acc();
                self.acc = self.stack.xch(acc, &mut self.pool)?;
                Ok(Flow::Next)
            }
            (Opcode::Delay, Operand::Offset(skip)) => self.delay(skip),
            (Opcode::LoadConst, Operand::Offset(off)) => match ins.ex_opcode() {
                Some(ExOpcode::Print) => {
                    let old = self.take_acc();
                    self.release(old)?;
                    self.acc = Value::Print(off);
                    Ok(Flow::Next)
                }
                None => Err(VmError::InvalidExtendedOpcode(ins.op_ex)),
            },
            _ => Err(VmError::InvalidOpcode(ins.op)),
        }
    }

    /// Leaves a thunk for the body after `ip` and skips to `.text` index `skip`.
    fn delay(&mut self, skip: u32) -> VmResult<Flow> {
        let old = self.take_acc();
        self.release(old)?;
        self.acc = Value::D1Code(self.ip + 1);
        let target = BOOTSTRAP_LEN
            .checked_add(skip)
            .ok_or(VmError::InvalidAddress { section: ".text", addr: skip })?;
        Ok(Flow::Jump(target))
    }

    fn apply(&mut self, func: Value, arg: Value, input: &mut dyn Read, output: &mut dyn Write) -> VmResult<Flow> {
        let ip = self.ip;
        let flow = match func {
            Value::I => {
                self.acc = arg;
                Flow::Next
            }
            Value::V => {
                self.release(arg)?;
                self.acc = Value::V;
                Flow::Next
            }
            Value::K => {
                self.acc = Value::K1(self.pool.alloc1(arg)?);
                Flow::Next
            }
            Value::K1(h) => {
                let x = self.pool.retain(self.pool.get1(h)?)?;
                self.release(arg)?;
                self.acc = x;
                Flow::Next
            }
            Value::S => {
                self.acc = Value::S1(self.pool.alloc1(arg)?);
                Flow::Next
            }
            Value::S1(h) => {
                let x = self.pool.retain(self.pool.get1(h)?)?;
                self.acc = Value::S2(self.pool.alloc2(x, arg)?);
                Flow::Next
            }
            Value::S2(h) => {
                let (x, y) = self.pool.get2(h)?;
                let x = self.pool.retain(x)?;
                let y = self.pool.retain(y)?;
                self.acc = self.pool.retain(arg)?;
                if ip == APPLY_ENTRY {
                    self.push([arg, y, x])?;
                } else {
                    self.push([Value::Jump(ip), arg, y, x])?;
                }
                Flow::Jump(SUBST_ENTRY)
            }
            Value::Out(ch) => {
                output.write_all(&[ch])?;
                self.acc = arg;
                Flow::Next
            }
            Value::Print(off) => {
                output.write_all(self.program.constant(off)?)?;
                self.acc = arg;
                Flow::Next
            }
            Value::Jump(r) => {
                self.acc = arg;
                Flow::Jump(r + 1)
            }
            Value::Finalize(r) => {
                self.acc = self.pop()?;
                self.push([Value::Jump(r), arg])?;
                Flow::Jump(APPLY_ENTRY)
            }
            Value::C => {
                let saved = self.stack.save()?;
                self.push([Value::Jump(ip), arg])?;
                self.acc = Value::C1(self.pool.alloc_continuation(saved, ip)?);
                Flow::Jump(APPLY_ENTRY)
            }
            Value::C1(h) => {
                let (segment, resume) = self.pool.get2_separate(h, &mut self.stack)?;
                self.stack.resume(segment, &mut self.pool)?;
                self.acc = arg;
                Flow::Jump(resume + 1)
            }
            Value::D => {
                self.acc = Value::D1Value(self.pool.alloc1(arg)?);
                Flow::Next
            }
            Value::D1Value(h) => {
                let x = self.pool.retain(self.pool.get1(h)?)?;
                self.push([Value::Jump(ip), x])?;
                self.acc = arg;
                Flow::Jump(APPLY_ENTRY)
            }
            Value::D1App(h) => {
                let (f, a) = self.pool.get2(h)?;
                let f = self.pool.retain(f)?;
                self.acc = self.pool.retain(a)?;
                self.push([arg, Value::Finalize(ip), f])?;
                Flow::Jump(APPLY_ENTRY)
            }
            Value::D1Code(body) => {
                self.push([arg, Value::Finalize(ip)])?;
                Flow::Jump(body)
            }
            Value::Read => {
                self.current = read_byte(input);
                self.push([Value::Jump(ip), arg])?;
                self.acc = if self.current.is_some() { Value::I } else { Value::V };
                Flow::Jump(APPLY_ENTRY)
            }
            Value::Cmp(ch) => {
                self.push([Value::Jump(ip), arg])?;
                self.acc = if self.current == Some(ch) { Value::I } else { Value::V };
                Flow::Jump(APPLY_ENTRY)
            }
            Value::Pipe => {
                self.push([Value::Jump(ip), arg])?;
                self.acc = self.current.map_or(Value::V, Value::Out);
                Flow::Jump(APPLY_ENTRY)
            }
            Value::E => Flow::Halt(arg),
            Value::Empty => return Err(VmError::InvalidCombinator(tag::ACC)),
        };
        self.release(func)?;
        Ok(flow)
    }
}

/// Builtin value of a literal operand.
fn literal(t: Token) -> VmResult<Value> { Value::from_token(t).ok_or(VmError::InvalidCombinator(t.tag)) }

/// One byte of input, `None` at end of input. A failing stream counts as exhausted.
fn read_byte(input: &mut dyn Read) -> Option<u8> {
    let mut buf = [0u8; 1];
    loop {
        match input.read(&mut buf) {
            Ok(0) => return None,
            Ok(_) => return Some(buf[0]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(error = %_e, "input failed, treating as end of input");
                return None;
            }
        }
    }
}
