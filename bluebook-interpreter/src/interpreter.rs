use anyhow::{bail, Error};
use bluebook_core::bytecode::{opcode_width, opcodes::*, special, SPECIAL_SELECTORS};
use bluebook_core::MethodFlag;
use bluebook_gc::{Heap, ObjectFormat};
use bluebook_value::Oop;
use log::{trace, warn};

use crate::builder::MethodBuilder;
use crate::method_cache::MethodCache;
use crate::primitives::{self, integer, PrimitiveError};
use crate::universe::Universe;
use crate::vm_objects::context::{self, ContextPool};
use crate::vm_objects::{association, class, message, method};

/// What the dispatch loop does once an instruction has executed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Step {
    /// Fetch the next instruction of the active context.
    Continue,
    /// Resume `context` with `value` pushed on its stack, discarding every context from the
    /// active one up to it. A nil context ends the run with `value`.
    ReturnTo { context: Oop, value: Oop },
    /// Leave the dispatch loop at once with a result.
    Unwind(Oop),
}

type Handler = fn(&mut Interpreter, &mut Universe, u8) -> Result<Step, Error>;

/// The execution engine.
///
/// Registers holding references are roots: the collector updates them in place. The cached
/// positions (stack, temporaries and bytecode bases) are not, and are recomputed from the active
/// context after every collection.
pub struct Interpreter {
    pub(crate) active_context: Oop,
    /// The method context whose temporaries are in use: the active context itself, or the home
    /// of the active block context.
    pub(crate) home_context: Oop,
    pub(crate) method: Oop,
    pub(crate) receiver: Oop,
    pub(crate) literals: Oop,

    pc: usize,
    /// Slots in use in the active context's tail, temporaries included.
    sp: usize,
    stack_base: usize,
    stack_limit: usize,
    temp_base: usize,
    temp_limit: usize,
    bytecode_base: usize,
    bytecode_len: usize,

    // The send in progress.
    pub(crate) message_selector: Oop,
    pub(crate) argument_count: usize,
    pub(crate) lookup_class: Oop,
    pub(crate) new_method: Oop,

    cache: MethodCache,
    pub(crate) contexts: ContextPool,
}

impl Interpreter {
    pub fn new(method_cache_size: usize) -> Result<Self, Error> {
        Ok(Self {
            active_context: Oop::NULL,
            home_context: Oop::NULL,
            method: Oop::NULL,
            receiver: Oop::NULL,
            literals: Oop::NULL,
            pc: 0,
            sp: 0,
            stack_base: 0,
            stack_limit: 0,
            temp_base: 0,
            temp_limit: 0,
            bytecode_base: 0,
            bytecode_len: 0,
            message_selector: Oop::NULL,
            argument_count: 0,
            lookup_class: Oop::NULL,
            new_method: Oop::NULL,
            cache: MethodCache::new(method_cache_size)?,
            contexts: ContextPool::default(),
        })
    }

    pub fn active_context(&self) -> Oop {
        self.active_context
    }

    pub fn receiver(&self) -> Oop {
        self.receiver
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn method_cache(&self) -> &MethodCache {
        &self.cache
    }

    pub fn context_pool(&self) -> &ContextPool {
        &self.contexts
    }

    pub fn flush_method_cache(&mut self) {
        self.cache.flush();
    }

    /// Resolves a send the way the dispatch loop does, through the method cache.
    pub fn lookup(&mut self, universe: &Universe, class: Oop, selector: Oop) -> Option<Oop> {
        if let Some(method) = self.cache.probe(class, selector) {
            return Some(method);
        }
        let method = universe.lookup_method(class, selector)?;
        self.cache.insert(class, selector, method);
        Some(method)
    }

    pub(crate) fn visit_registers(&mut self, visitor: &mut dyn FnMut(&mut Oop)) {
        let registers = [
            &mut self.active_context,
            &mut self.home_context,
            &mut self.method,
            &mut self.receiver,
            &mut self.literals,
            &mut self.message_selector,
            &mut self.lookup_class,
            &mut self.new_method,
        ];
        for register in registers {
            visitor(register);
        }
    }

    // ----- registers -----

    /// Writes the pc and sp back to the active context.
    pub(crate) fn flush_registers(&self, heap: &mut Heap) {
        if !self.active_context.is_pointer() {
            return;
        }
        heap.store_pointer(self.active_context, context::PC, Oop::from_small_integer(self.pc as i64));
        heap.store_pointer(self.active_context, context::SP, Oop::from_small_integer(self.sp as i64));
    }

    /// Recomputes every derived register after the active context moved.
    pub(crate) fn reload_registers(&mut self, heap: &Heap) {
        if self.active_context.is_pointer() {
            self.load_context(heap, self.active_context);
        }
    }

    /// Makes `context` the active context.
    pub(crate) fn load_context(&mut self, heap: &Heap, context: Oop) {
        self.active_context = context;
        self.home_context = context::home(heap, context);
        self.method = heap.fetch_pointer(self.home_context, context::METHOD);
        self.receiver = heap.fetch_pointer(self.home_context, context::RECEIVER);
        self.literals = method::literals(heap, self.method);
        let bytecodes = method::bytecodes(heap, self.method);
        self.bytecode_base = heap.bytes_offset(bytecodes);
        self.bytecode_len = heap.indexable_len(bytecodes);
        self.pc = context::pc(heap, context).unwrap_or(0);
        self.sp = context::sp(heap, context).unwrap_or(0);
        self.stack_base = heap.elements_index(context);
        self.stack_limit = heap.indexable_len(context);
        self.temp_base = heap.elements_index(self.home_context);
        // Only the declared temporaries: the slots above them are the home's stack.
        self.temp_limit = method::header(heap, self.method).temp_count().min(heap.indexable_len(self.home_context));
    }

    fn clear_registers(&mut self) {
        self.active_context = Oop::NULL;
        self.home_context = Oop::NULL;
        self.method = Oop::NULL;
        self.receiver = Oop::NULL;
        self.literals = Oop::NULL;
        self.pc = 0;
        self.sp = 0;
        self.stack_limit = 0;
        self.temp_limit = 0;
        self.bytecode_len = 0;
    }

    // ----- operand stack -----

    #[inline]
    pub fn push(&mut self, heap: &mut Heap, value: Oop) {
        if self.sp >= self.stack_limit {
            self.stack_overflow();
        }
        heap.set_slot(self.stack_base + self.sp, value);
        self.sp += 1;
    }

    #[cold]
    fn stack_overflow(&self) -> ! {
        panic!("operand stack overflow in {:?} ({} slots)", self.active_context, self.stack_limit)
    }

    #[inline]
    pub fn pop(&mut self, heap: &Heap) -> Oop {
        debug_assert!(self.sp > 0, "operand stack underflow");
        self.sp -= 1;
        heap.slot(self.stack_base + self.sp)
    }

    #[inline]
    pub fn pop_n(&mut self, count: usize) {
        debug_assert!(self.sp >= count, "operand stack underflow");
        self.sp -= count;
    }

    /// The value `depth` slots below the top of the stack.
    #[inline]
    pub fn stack_value(&self, heap: &Heap, depth: usize) -> Oop {
        heap.slot(self.stack_base + self.sp - 1 - depth)
    }

    #[inline]
    pub fn stack_top(&self, heap: &Heap) -> Oop {
        self.stack_value(heap, 0)
    }

    #[inline]
    pub fn set_stack_value(&self, heap: &mut Heap, depth: usize, value: Oop) {
        heap.set_slot(self.stack_base + self.sp - 1 - depth, value);
    }

    /// Slots in use in the active context, temporaries included.
    pub fn stack_pointer(&self) -> usize {
        self.sp
    }

    /// Free slots left above the top of the stack.
    pub fn stack_room(&self) -> usize {
        self.stack_limit - self.sp
    }

    // ----- entry points -----

    /// Creates the first context of a run: `method` activated on `receiver` with no sender.
    pub fn start(&mut self, universe: &mut Universe, receiver: Oop, method: Oop, args: &[Oop]) -> Result<(), Error> {
        if self.active_context.is_pointer() {
            bail!("an activation is already in progress");
        }
        let header = method::header(&universe.heap, method);
        if header.arg_count() != args.len() {
            bail!("method expects {} arguments, {} given", header.arg_count(), args.len());
        }

        let base = universe.remappable_len();
        universe.push_remappable(method);
        universe.push_remappable(receiver);
        args.iter().for_each(|arg| universe.push_remappable(*arg));
        let class = universe.core.method_context_class;
        let context = self.new_context(universe, header.frame_size(), class);

        let (method, receiver) = (universe.remappable(base), universe.remappable(base + 1));
        let args: Vec<Oop> = (0..args.len()).map(|i| universe.remappable(base + 2 + i)).collect();
        universe.truncate_remappable(base);

        let heap = &mut universe.heap;
        let nil = heap.nil();
        init_method_context(heap, context, nil, method, receiver, header.temp_count());
        for (index, arg) in args.into_iter().enumerate() {
            heap.store_element(context, index, arg);
        }
        self.load_context(heap, context);
        Ok(())
    }

    /// Runs `method` on `receiver` to completion and answers its result.
    ///
    /// An activation already in progress is suspended for the duration and resumed afterwards.
    pub fn execute(&mut self, universe: &mut Universe, receiver: Oop, method: Oop, args: &[Oop]) -> Result<Oop, Error> {
        self.flush_registers(&mut universe.heap);
        let base = universe.remappable_len();
        universe.push_remappable(self.active_context);
        self.clear_registers();

        let result = self.start(universe, receiver, method, args).and_then(|()| self.run(universe));

        let outer = universe.remappable(base);
        universe.truncate_remappable(base);
        if outer.is_pointer() {
            self.load_context(&universe.heap, outer);
        } else {
            self.clear_registers();
        }
        result
    }

    /// Sends a message from outside the interpreter and answers its result.
    pub fn send_message(&mut self, universe: &mut Universe, receiver: Oop, selector: &str, args: &[Oop]) -> Result<Oop, Error> {
        let base = universe.remappable_len();
        universe.push_remappable(receiver);
        args.iter().for_each(|arg| universe.push_remappable(*arg));

        let mut builder = MethodBuilder::new(args.len());
        builder.push_self();
        for index in 0..args.len() {
            builder.push_temp(index);
        }
        builder.send(selector, args.len()).return_top();
        let nil = universe.core.nil;
        let trampoline = builder.build(universe, self, nil);

        let receiver = universe.remappable(base);
        let args: Vec<Oop> = (0..args.len()).map(|i| universe.remappable(base + 1 + i)).collect();
        universe.truncate_remappable(base);
        self.execute(universe, receiver, trampoline?, &args)
    }

    /// Runs the dispatch loop until the bottom context returns.
    pub fn run(&mut self, universe: &mut Universe) -> Result<Oop, Error> {
        loop {
            if let Some(result) = self.step(universe)? {
                return Ok(result);
            }
        }
    }

    /// Executes a single instruction. Answers the result of the run once it is over.
    #[inline]
    pub fn step(&mut self, universe: &mut Universe) -> Result<Option<Oop>, Error> {
        let opcode = self.fetch_byte(&universe.heap)?;
        match DISPATCH[opcode as usize](self, universe, opcode)? {
            Step::Continue => Ok(None),
            Step::ReturnTo { context, value } => Ok(self.return_to(universe, context, value)),
            Step::Unwind(value) => {
                self.clear_registers();
                Ok(Some(value))
            }
        }
    }

    #[inline]
    fn fetch_byte(&mut self, heap: &Heap) -> Result<u8, Error> {
        if self.pc >= self.bytecode_len {
            bail!("pc {} ran past the end of the {} bytes of bytecode of {:?}", self.pc, self.bytecode_len, self.method);
        }
        let byte = heap.byte_at_offset(self.bytecode_base + self.pc);
        self.pc += 1;
        Ok(byte)
    }

    fn fetch_jump_offset(&mut self, heap: &Heap, opcode: u8) -> Result<isize, Error> {
        if opcode < LONG_JUMP {
            return Ok(self.fetch_byte(heap)? as i8 as isize);
        }
        let high = self.fetch_byte(heap)?;
        let low = self.fetch_byte(heap)?;
        Ok(i16::from_be_bytes([high, low]) as isize)
    }

    // ----- variable access -----

    fn literal(&self, heap: &Heap, index: usize) -> Result<Oop, Error> {
        if index >= heap.indexable_len(self.literals) {
            bail!("literal {index} out of range in {:?}", self.method);
        }
        Ok(heap.fetch_element(self.literals, index))
    }

    fn literal_association(&self, heap: &Heap, index: usize) -> Result<Oop, Error> {
        let literal = self.literal(heap, index)?;
        if !literal.is_pointer() || heap.fixed_fields(literal) != association::FIXED_FIELDS {
            bail!("literal {index} of {:?} is not an association", self.method);
        }
        Ok(literal)
    }

    fn temporary_slot(&self, index: usize) -> Result<usize, Error> {
        if index >= self.temp_limit {
            bail!("temporary {index} out of range in {:?}", self.method);
        }
        Ok(self.temp_base + index)
    }

    fn receiver_field(&self, heap: &Heap, index: usize) -> Result<usize, Error> {
        if !self.receiver.is_pointer() || index >= heap.fixed_fields(self.receiver) {
            bail!("receiver {:?} has no instance variable {index}", self.receiver);
        }
        Ok(index)
    }

    fn push_receiver_variable(&mut self, universe: &mut Universe, _: u8) -> Result<Step, Error> {
        let heap = &mut universe.heap;
        let index = self.fetch_byte(heap)? as usize;
        let value = heap.fetch_pointer(self.receiver, self.receiver_field(heap, index)?);
        self.push(heap, value);
        Ok(Step::Continue)
    }

    fn push_temporary(&mut self, universe: &mut Universe, _: u8) -> Result<Step, Error> {
        let heap = &mut universe.heap;
        let index = self.fetch_byte(heap)? as usize;
        let value = heap.slot(self.temporary_slot(index)?);
        self.push(heap, value);
        Ok(Step::Continue)
    }

    fn push_literal_constant(&mut self, universe: &mut Universe, _: u8) -> Result<Step, Error> {
        let heap = &mut universe.heap;
        let index = self.fetch_byte(heap)? as usize;
        let value = self.literal(heap, index)?;
        self.push(heap, value);
        Ok(Step::Continue)
    }

    fn push_literal_variable(&mut self, universe: &mut Universe, _: u8) -> Result<Step, Error> {
        let heap = &mut universe.heap;
        let index = self.fetch_byte(heap)? as usize;
        let association = self.literal_association(heap, index)?;
        let value = heap.fetch_pointer(association, association::VALUE);
        self.push(heap, value);
        Ok(Step::Continue)
    }

    /// Stores and pop-and-stores into receiver variables, temporaries and literal variables.
    fn store(&mut self, universe: &mut Universe, opcode: u8) -> Result<Step, Error> {
        let heap = &mut universe.heap;
        let index = self.fetch_byte(heap)? as usize;
        let value = if opcode >= POP_INTO_RECEIVER_VARIABLE {
            self.pop(heap)
        } else {
            self.stack_top(heap)
        };
        match opcode {
            STORE_RECEIVER_VARIABLE | POP_INTO_RECEIVER_VARIABLE => {
                let field = self.receiver_field(heap, index)?;
                heap.store_pointer(self.receiver, field, value);
            }
            STORE_TEMPORARY | POP_INTO_TEMPORARY => heap.set_slot(self.temporary_slot(index)?, value),
            _ => {
                let association = self.literal_association(heap, index)?;
                heap.store_pointer(association, association::VALUE, value);
            }
        }
        Ok(Step::Continue)
    }

    fn push_constant(&mut self, universe: &mut Universe, opcode: u8) -> Result<Step, Error> {
        let core = &universe.core;
        let value = match opcode {
            PUSH_SELF => self.receiver,
            PUSH_NIL => core.nil,
            PUSH_TRUE => core.true_object,
            PUSH_FALSE => core.false_object,
            PUSH_MINUS_ONE => Oop::from_small_integer(-1),
            PUSH_ZERO => Oop::ZERO,
            PUSH_ONE => Oop::ONE,
            _ => Oop::from_small_integer(2),
        };
        self.push(&mut universe.heap, value);
        Ok(Step::Continue)
    }

    fn push_this_context(&mut self, universe: &mut Universe, _: u8) -> Result<Step, Error> {
        let heap = &mut universe.heap;
        self.flush_registers(heap);
        heap.set_captured(self.active_context, true);
        self.push(heap, self.active_context);
        Ok(Step::Continue)
    }

    fn dup(&mut self, universe: &mut Universe, _: u8) -> Result<Step, Error> {
        let heap = &mut universe.heap;
        let top = self.stack_top(heap);
        self.push(heap, top);
        Ok(Step::Continue)
    }

    fn pop_top(&mut self, universe: &mut Universe, _: u8) -> Result<Step, Error> {
        self.pop(&universe.heap);
        Ok(Step::Continue)
    }

    // ----- control -----

    fn jump(&mut self, universe: &mut Universe, opcode: u8) -> Result<Step, Error> {
        let offset = self.fetch_jump_offset(&universe.heap, opcode)?;
        if matches!(opcode, JUMP | LONG_JUMP) {
            self.jump_by(offset)?;
            return Ok(Step::Continue);
        }

        let value = self.pop(&universe.heap);
        let (taken, other) = match opcode {
            JUMP_IF_TRUE | LONG_JUMP_IF_TRUE => (universe.core.true_object, universe.core.false_object),
            _ => (universe.core.false_object, universe.core.true_object),
        };
        if value == taken {
            self.jump_by(offset)?;
        } else if value != other {
            self.push(&mut universe.heap, value);
            let selector = universe.core.must_be_boolean_selector;
            return self.send(universe, selector, 0);
        }
        Ok(Step::Continue)
    }

    fn jump_by(&mut self, offset: isize) -> Result<(), Error> {
        let target = self.pc as isize + offset;
        if target < 0 || target as usize > self.bytecode_len {
            bail!("jump from pc {} by {offset} leaves the method", self.pc);
        }
        self.pc = target as usize;
        Ok(())
    }

    // ----- returns -----

    fn return_top(&mut self, universe: &mut Universe, _: u8) -> Result<Step, Error> {
        let value = self.pop(&universe.heap);
        self.method_return(universe, value)
    }

    fn return_constant(&mut self, universe: &mut Universe, opcode: u8) -> Result<Step, Error> {
        let core = &universe.core;
        let value = match opcode {
            RETURN_SELF => self.receiver,
            RETURN_NIL => core.nil,
            RETURN_TRUE => core.true_object,
            _ => core.false_object,
        };
        self.method_return(universe, value)
    }

    fn block_return(&mut self, universe: &mut Universe, _: u8) -> Result<Step, Error> {
        let heap = &universe.heap;
        let value = self.pop(heap);
        Ok(Step::ReturnTo {
            context: context::sender(heap, self.active_context),
            value,
        })
    }

    /// Returns from the home method. From inside a block this is a non-local return, possible
    /// only while the home context is still on the sender chain.
    fn method_return(&mut self, universe: &mut Universe, value: Oop) -> Result<Step, Error> {
        let heap = &universe.heap;
        if self.active_context == self.home_context {
            return Ok(Step::ReturnTo {
                context: context::sender(heap, self.active_context),
                value,
            });
        }
        let home = self.home_context;
        if context::is_dead(heap, home) || !context::has_sender(heap, self.active_context, home) {
            return self.escaped_block(universe, value);
        }
        Ok(Step::ReturnTo {
            context: context::sender(heap, home),
            value,
        })
    }

    /// A block tried to return from a home context that already returned. The block is left
    /// as if it had returned normally, and its caller sends `escapedBlock:` to the home's
    /// receiver, whose answer replaces the block's value.
    fn escaped_block(&mut self, universe: &mut Universe, value: Oop) -> Result<Step, Error> {
        warn!(
            "block tried to return {} from a dead home context of {}",
            universe.describe(value),
            universe.describe(self.receiver)
        );
        let heap = &mut universe.heap;
        let block = self.active_context;
        let receiver = self.receiver;
        let caller = context::sender(heap, block);
        heap.set_captured(block, true);
        if !self.leave_to(heap, caller) {
            bail!("a block escaped its home context and has no caller to report to");
        }
        self.push(heap, receiver);
        self.push(heap, block);
        let selector = universe.core.escaped_block_selector;
        self.send(universe, selector, 1)
    }

    /// Finishes a [`Step::ReturnTo`]. Answers the value if it ends the run.
    fn return_to(&mut self, universe: &mut Universe, target: Oop, value: Oop) -> Option<Oop> {
        let heap = &mut universe.heap;
        if !self.leave_to(heap, target) {
            self.clear_registers();
            return Some(value);
        }
        self.push(heap, value);
        None
    }

    /// Kills every context from the active one up to `target` and activates `target`. Answers
    /// false if there is nothing to activate.
    fn leave_to(&mut self, heap: &mut Heap, target: Oop) -> bool {
        let nil = heap.nil();
        let mut current = self.active_context;
        while current != target && current.is_pointer() && current != nil {
            let sender = context::sender(heap, current);
            context::kill(heap, current);
            self.contexts.recycle(heap, current);
            current = sender;
        }
        if !target.is_pointer() || target == nil {
            return false;
        }
        self.load_context(heap, target);
        true
    }

    // ----- sends -----

    fn send_bytecode(&mut self, universe: &mut Universe, opcode: u8) -> Result<Step, Error> {
        let heap = &universe.heap;
        let index = self.fetch_byte(heap)? as usize;
        let arg_count = self.fetch_byte(heap)? as usize;
        let selector = self.literal(heap, index)?;
        if opcode == SEND {
            return self.send(universe, selector, arg_count);
        }
        let Some(method_class) = method::method_class(heap, self.method) else {
            bail!("super send of {} from a method without a class binding", universe.describe(selector));
        };
        let superclass = class::superclass(heap, method_class);
        self.send_to_class(universe, selector, superclass, arg_count)
    }

    fn send_special(&mut self, universe: &mut Universe, opcode: u8) -> Result<Step, Error> {
        let index = opcode - SEND_SPECIAL;
        if self.special_fast_path(universe, index) {
            return Ok(Step::Continue);
        }
        let selector = universe.core.special_selectors[index as usize];
        let arg_count = SPECIAL_SELECTORS[index as usize].arg_count as usize;
        self.send(universe, selector, arg_count)
    }

    /// Answers special sends the interpreter can answer without a lookup. Answers false, with
    /// the stack untouched, when the send has to go through the generic machinery.
    fn special_fast_path(&mut self, universe: &mut Universe, index: u8) -> bool {
        let heap = &universe.heap;
        match index {
            special::IDENTICAL => {
                let answer = universe.boolean(self.stack_value(heap, 1) == self.stack_value(heap, 0));
                self.replace_top(universe, 2, answer);
                true
            }
            special::CLASS => {
                let class = universe.class_of(self.stack_top(heap));
                self.replace_top(universe, 1, class);
                true
            }
            special::IS_NIL | special::NOT_NIL => {
                let is_nil = self.stack_top(heap) == universe.core.nil;
                let answer = universe.boolean(if index == special::IS_NIL { is_nil } else { !is_nil });
                self.replace_top(universe, 1, answer);
                true
            }
            special::SIZE => {
                let receiver = self.stack_top(heap);
                if !self.is_plain_collection(universe, receiver) {
                    return false;
                }
                let size = Oop::from_small_integer(heap.indexable_len(receiver) as i64);
                self.replace_top(universe, 1, size);
                true
            }
            special::AT => {
                let (array, index) = (self.stack_value(heap, 1), self.stack_value(heap, 0));
                match self.array_slot(universe, array, index) {
                    Some(slot) => {
                        let value = heap.fetch_element(array, slot);
                        self.replace_top(universe, 2, value);
                        true
                    }
                    None => false,
                }
            }
            special::AT_PUT => {
                let (array, index, value) = (self.stack_value(heap, 2), self.stack_value(heap, 1), self.stack_value(heap, 0));
                match self.array_slot(universe, array, index) {
                    Some(slot) => {
                        universe.heap.store_element(array, slot, value);
                        self.replace_top(universe, 3, value);
                        true
                    }
                    None => false,
                }
            }
            special::VALUE | special::VALUE_1 | special::VALUE_2 => {
                let arg_count = SPECIAL_SELECTORS[index as usize].arg_count as usize;
                let block = self.stack_value(heap, arg_count);
                if !block.is_pointer()
                    || heap.class_of(block) != universe.core.block_context_class
                    || context::block_arg_count(heap, block) != arg_count
                {
                    return false;
                }
                self.activate_block(universe, arg_count);
                true
            }
            _ => self.small_integer_fast_path(universe, index),
        }
    }

    fn small_integer_fast_path(&mut self, universe: &mut Universe, index: u8) -> bool {
        let heap = &universe.heap;
        let (receiver, arg) = (self.stack_value(heap, 1), self.stack_value(heap, 0));
        if !receiver.is_small_integer() || !arg.is_small_integer() {
            return false;
        }
        let (a, b) = (receiver.as_small_integer(), arg.as_small_integer());
        let boolean = |value: bool| Some(universe.boolean(value));
        let result = match index {
            special::ADD => a.checked_add(b).and_then(Oop::try_from_small_integer),
            special::SUBTRACT => a.checked_sub(b).and_then(Oop::try_from_small_integer),
            special::MULTIPLY => a.checked_mul(b).and_then(Oop::try_from_small_integer),
            special::LESS_THAN => boolean(a < b),
            special::GREATER_THAN => boolean(a > b),
            special::LESS_OR_EQUAL => boolean(a <= b),
            special::GREATER_OR_EQUAL => boolean(a >= b),
            special::EQUAL => boolean(a == b),
            special::NOT_EQUAL => boolean(a != b),
            special::DIVIDE => integer::exact_quotient(a, b).and_then(Oop::try_from_small_integer),
            special::MODULO => integer::floored_modulo(a, b).and_then(Oop::try_from_small_integer),
            special::INTEGER_DIVIDE => integer::floored_quotient(a, b).and_then(Oop::try_from_small_integer),
            special::BIT_SHIFT => integer::shifted(a, b).and_then(Oop::try_from_small_integer),
            special::BIT_AND => Some(Oop::from_small_integer(a & b)),
            special::BIT_OR => Some(Oop::from_small_integer(a | b)),
            special::BIT_XOR => Some(Oop::from_small_integer(a ^ b)),
            special::MAX => Some(Oop::from_small_integer(a.max(b))),
            special::MIN => Some(Oop::from_small_integer(a.min(b))),
            _ => None,
        };
        match result {
            Some(value) => {
                self.replace_top(universe, 2, value);
                true
            }
            None => false,
        }
    }

    /// Whether `size` and indexing may be answered directly: an instance of `Array`.
    fn is_plain_collection(&self, universe: &Universe, oop: Oop) -> bool {
        oop.is_pointer() && universe.heap.class_of(oop) == universe.core.array_class
    }

    /// The zero-based slot of a one-based index into an `Array`, if in bounds.
    fn array_slot(&self, universe: &Universe, array: Oop, index: Oop) -> Option<usize> {
        if !self.is_plain_collection(universe, array) || !index.is_small_integer() {
            return None;
        }
        let index = index.as_small_integer();
        (index >= 1 && index as usize <= universe.heap.indexable_len(array)).then(|| index as usize - 1)
    }

    fn replace_top(&mut self, universe: &mut Universe, count: usize, value: Oop) {
        self.pop_n(count);
        self.push(&mut universe.heap, value);
    }

    /// Sends the selector to the receiver found below `arg_count` arguments on the stack.
    pub(crate) fn send(&mut self, universe: &mut Universe, selector: Oop, arg_count: usize) -> Result<Step, Error> {
        let receiver = self.stack_value(&universe.heap, arg_count);
        let class = universe.class_of(receiver);
        self.send_to_class(universe, selector, class, arg_count)
    }

    fn send_to_class(&mut self, universe: &mut Universe, selector: Oop, class: Oop, arg_count: usize) -> Result<Step, Error> {
        self.message_selector = selector;
        self.argument_count = arg_count;
        self.lookup_class = class;
        self.find_new_method(universe)?;
        self.execute_new_method(universe)
    }

    /// Resolves the send in progress into `new_method`. A failed lookup turns the send into a
    /// `doesNotUnderstand:` send carrying the reified message.
    fn find_new_method(&mut self, universe: &mut Universe) -> Result<(), Error> {
        if let Some(method) = self.lookup(universe, self.lookup_class, self.message_selector) {
            self.new_method = method;
            return Ok(());
        }

        let heap = &universe.heap;
        let receiver = self.stack_value(heap, self.argument_count);
        if self.message_selector == universe.core.does_not_understand_selector {
            // An explicit send may carry anything, not only a reified message.
            let argument = self.stack_top(heap);
            let selector = if argument.is_pointer() && heap.class_of(argument) == universe.core.message_class {
                heap.fetch_pointer(argument, message::SELECTOR)
            } else {
                self.message_selector
            };
            bail!(
                "{} does not understand {}, and has no doesNotUnderstand: method",
                universe.describe(receiver),
                universe.describe(selector)
            );
        }
        warn!(
            "{} does not understand {}",
            universe.describe(receiver),
            universe.describe(self.message_selector)
        );
        self.create_actual_message(universe);
        self.message_selector = universe.core.does_not_understand_selector;
        self.find_new_method(universe)
    }

    /// Replaces the arguments of the send in progress with a message object holding the
    /// selector and the arguments.
    fn create_actual_message(&mut self, universe: &mut Universe) {
        let arg_count = self.argument_count;
        let arguments = universe.new_array(self, arg_count);
        let heap = &mut universe.heap;
        for index in 0..arg_count {
            heap.store_element(arguments, index, self.stack_value(heap, arg_count - 1 - index));
        }

        universe.push_remappable(arguments);
        let class = universe.core.message_class;
        let message = universe.allocate(self, class, ObjectFormat::Plain, message::FIXED_FIELDS, 0);
        let arguments = universe.pop_remappable();

        let heap = &mut universe.heap;
        heap.store_pointer(message, message::SELECTOR, self.message_selector);
        heap.store_pointer(message, message::ARGUMENTS, arguments);
        self.pop_n(arg_count);
        self.push(heap, message);
        self.argument_count = 1;
    }

    fn execute_new_method(&mut self, universe: &mut Universe) -> Result<Step, Error> {
        let heap = &mut universe.heap;
        let header = method::header(heap, self.new_method);
        let arg_count = self.argument_count;
        match header.flag() {
            Some(MethodFlag::Normal) => {}
            Some(MethodFlag::ReturnSelf) => {
                self.pop_n(arg_count);
                return Ok(Step::Continue);
            }
            Some(MethodFlag::ReturnInstanceVariable) => {
                let receiver = self.stack_value(heap, arg_count);
                let index = header.primitive_index();
                if !receiver.is_pointer() || index >= heap.fixed_fields(receiver) {
                    bail!("{} has no instance variable {index} to answer", universe.describe(receiver));
                }
                let value = heap.fetch_pointer(receiver, index);
                self.pop_n(arg_count + 1);
                self.push(heap, value);
                return Ok(Step::Continue);
            }
            Some(MethodFlag::ReturnLiteral) => {
                if method::literal_count(heap, self.new_method) == 0 {
                    bail!("literal-answering method {:?} has no literal", self.new_method);
                }
                let value = method::literal(heap, self.new_method, 0);
                self.pop_n(arg_count + 1);
                self.push(heap, value);
                return Ok(Step::Continue);
            }
            None => bail!("method {:?} has a reserved flag in {:?}", self.new_method, header),
        }

        let index = header.primitive_index();
        if index != 0 {
            match primitives::invoke(index, self, universe, arg_count) {
                Ok(()) => return Ok(Step::Continue),
                Err(PrimitiveError::Failed) => trace!("primitive {index} failed, activating its method"),
                Err(PrimitiveError::Exit(value)) => return Ok(Step::Unwind(value)),
            }
        }
        self.activate_new_method(universe)?;
        Ok(Step::Continue)
    }

    /// Creates a context for `new_method`, moves the arguments into it, and makes it active.
    fn activate_new_method(&mut self, universe: &mut Universe) -> Result<(), Error> {
        let header = method::header(&universe.heap, self.new_method);
        let arg_count = self.argument_count;
        if header.arg_count() != arg_count {
            bail!(
                "{} takes {} arguments but was sent with {arg_count}",
                universe.describe(self.message_selector),
                header.arg_count()
            );
        }
        let class = universe.core.method_context_class;
        let context = self.new_context(universe, header.frame_size(), class);

        let heap = &mut universe.heap;
        let receiver = self.stack_value(heap, arg_count);
        init_method_context(heap, context, self.active_context, self.new_method, receiver, header.temp_count());
        for index in 0..arg_count {
            heap.store_element(context, index, self.stack_value(heap, arg_count - 1 - index));
        }
        self.pop_n(arg_count + 1);
        self.flush_registers(heap);
        self.load_context(heap, context);
        Ok(())
    }

    /// A context with at least `needed` tail slots, from the free-list if possible.
    fn new_context(&mut self, universe: &mut Universe, needed: usize, class: Oop) -> Oop {
        let size = ContextPool::frame_size_for(needed);
        if let Some(context) = self.contexts.take(size) {
            universe.heap.set_class_of(context, class);
            return context;
        }
        universe.allocate(self, class, ObjectFormat::Context, context::FIXED_FIELDS, size)
    }

    // ----- blocks -----

    fn create_block(&mut self, universe: &mut Universe, _: u8) -> Result<Step, Error> {
        let heap = &universe.heap;
        let arg_count = self.fetch_byte(heap)? as usize;
        let jump = if self.pc < self.bytecode_len {
            heap.byte_at_offset(self.bytecode_base + self.pc)
        } else {
            0
        };
        let Some(width) = opcode_width(jump).filter(|_| matches!(jump, JUMP | LONG_JUMP)) else {
            bail!("block creation at pc {} is not followed by a jump over the block", self.pc - 2);
        };
        let initial_pc = Oop::from_small_integer((self.pc + width) as i64);
        let frame = arg_count + method::header(heap, self.method).stack_depth();

        universe.heap.set_captured(self.home_context, true);
        let class = universe.core.block_context_class;
        let block = universe.allocate(self, class, ObjectFormat::Context, context::FIXED_FIELDS, frame);

        let heap = &mut universe.heap;
        let nil = heap.nil();
        heap.store_pointer(block, context::CALLER, nil);
        heap.store_pointer(block, context::PC, initial_pc);
        heap.store_pointer(block, context::SP, Oop::ZERO);
        heap.store_pointer(block, context::BLOCK_ARG_COUNT, Oop::from_small_integer(arg_count as i64));
        heap.store_pointer(block, context::INITIAL_PC, initial_pc);
        heap.store_pointer(block, context::HOME, self.home_context);
        self.push(heap, block);
        Ok(Step::Continue)
    }

    /// Activates the block found below `arg_count` arguments on the stack. The block itself is
    /// only a template: every activation runs in a fresh copy, so blocks are re-entrant.
    pub(crate) fn activate_block(&mut self, universe: &mut Universe, arg_count: usize) {
        let frame = context::frame_size(&universe.heap, self.stack_value(&universe.heap, arg_count));
        let class = universe.core.block_context_class;
        let activation = self.new_context(universe, frame, class);

        let heap = &mut universe.heap;
        let block = self.stack_value(heap, arg_count);
        let initial_pc = heap.fetch_pointer(block, context::INITIAL_PC);
        heap.store_pointer(activation, context::CALLER, self.active_context);
        heap.store_pointer(activation, context::PC, initial_pc);
        heap.store_pointer(activation, context::SP, Oop::from_small_integer(arg_count as i64));
        heap.store_pointer(activation, context::BLOCK_ARG_COUNT, heap.fetch_pointer(block, context::BLOCK_ARG_COUNT));
        heap.store_pointer(activation, context::INITIAL_PC, initial_pc);
        heap.store_pointer(activation, context::HOME, heap.fetch_pointer(block, context::HOME));
        for index in 0..arg_count {
            heap.store_element(activation, index, self.stack_value(heap, arg_count - 1 - index));
        }
        self.pop_n(arg_count + 1);
        self.flush_registers(heap);
        self.load_context(heap, activation);
    }

    fn unknown_opcode(&mut self, _: &mut Universe, opcode: u8) -> Result<Step, Error> {
        bail!("unknown opcode {opcode:#04x} at pc {} in {:?}", self.pc - 1, self.method)
    }
}

fn init_method_context(heap: &mut Heap, context: Oop, sender: Oop, method: Oop, receiver: Oop, temp_count: usize) {
    let nil = heap.nil();
    heap.store_pointer(context, context::SENDER, sender);
    heap.store_pointer(context, context::PC, Oop::ZERO);
    heap.store_pointer(context, context::SP, Oop::from_small_integer(temp_count as i64));
    heap.store_pointer(context, context::METHOD, method);
    heap.store_pointer(context, context::INITIAL_PC, nil);
    heap.store_pointer(context, context::RECEIVER, receiver);
    for index in 0..temp_count {
        heap.store_element(context, index, nil);
    }
}

const fn dispatch_table() -> [Handler; 256] {
    let mut table: [Handler; 256] = [Interpreter::unknown_opcode as Handler; 256];
    table[PUSH_RECEIVER_VARIABLE as usize] = Interpreter::push_receiver_variable;
    table[PUSH_TEMPORARY as usize] = Interpreter::push_temporary;
    table[PUSH_LITERAL_CONSTANT as usize] = Interpreter::push_literal_constant;
    table[PUSH_LITERAL_VARIABLE as usize] = Interpreter::push_literal_variable;
    let mut opcode = STORE_RECEIVER_VARIABLE;
    while opcode <= POP_INTO_LITERAL_VARIABLE {
        table[opcode as usize] = Interpreter::store;
        opcode += 1;
    }
    table[PUSH_SELF as usize] = Interpreter::push_constant;
    table[PUSH_NIL as usize] = Interpreter::push_constant;
    table[PUSH_TRUE as usize] = Interpreter::push_constant;
    table[PUSH_FALSE as usize] = Interpreter::push_constant;
    table[PUSH_THIS_CONTEXT as usize] = Interpreter::push_this_context;
    table[PUSH_MINUS_ONE as usize] = Interpreter::push_constant;
    table[PUSH_ZERO as usize] = Interpreter::push_constant;
    table[PUSH_ONE as usize] = Interpreter::push_constant;
    table[PUSH_TWO as usize] = Interpreter::push_constant;
    table[DUP as usize] = Interpreter::dup;
    table[POP as usize] = Interpreter::pop_top;
    table[RETURN_TOP as usize] = Interpreter::return_top;
    table[RETURN_SELF as usize] = Interpreter::return_constant;
    table[RETURN_NIL as usize] = Interpreter::return_constant;
    table[RETURN_TRUE as usize] = Interpreter::return_constant;
    table[RETURN_FALSE as usize] = Interpreter::return_constant;
    table[BLOCK_RETURN as usize] = Interpreter::block_return;
    let mut opcode = JUMP;
    while opcode <= LONG_JUMP_IF_FALSE {
        table[opcode as usize] = Interpreter::jump;
        opcode += 1;
    }
    table[SEND as usize] = Interpreter::send_bytecode;
    table[SUPER_SEND as usize] = Interpreter::send_bytecode;
    table[CREATE_BLOCK as usize] = Interpreter::create_block;
    let mut opcode = SEND_SPECIAL;
    while opcode <= SEND_SPECIAL_LAST {
        table[opcode as usize] = Interpreter::send_special;
        opcode += 1;
    }
    table
}

/// Handlers indexed by opcode.
static DISPATCH: [Handler; 256] = dispatch_table();
