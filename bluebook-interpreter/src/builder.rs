use anyhow::{anyhow, bail, Context, Error};
use bluebook_core::bytecode::SPECIAL_SELECTORS;
use bluebook_core::{Bytecode, MethodFlag, MethodHeader};
use bluebook_gc::ObjectFormat;
use bluebook_value::Oop;
use num_bigint::BigInt;

use crate::interpreter::Interpreter;
use crate::universe::Universe;
use crate::vm_objects::method;

/// A constant in a method's literal frame, before it exists in the heap.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Nil,
    True,
    False,
    Integer(BigInt),
    Character(char),
    Float(f64),
    String(String),
    Symbol(String),
    /// The association binding a global, accessed with the literal variable instructions.
    Global(String),
    /// The binding of the class the method is installed in, looked up by super sends.
    MethodClass,
}

/// A position in the byte-code, bound once and jumped to any number of times.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Label(usize);

/// A jump whose offset is filled in when its label is bound.
#[derive(Debug)]
struct Fixup {
    label: Label,
    /// Offset of the operand.
    operand: usize,
    /// Offset of the next instruction, which jump offsets are relative to.
    end: usize,
    long: bool,
}

/// Assembles compiled methods.
///
/// Emitting methods can be chained. Mistakes such as too many literals or a jump too far for a
/// short offset are reported by [`MethodBuilder::build`].
///
/// The operand stack depth is tracked along the straight-line order of emission, which is an
/// upper bound for the structured code built here.
#[derive(Debug)]
pub struct MethodBuilder {
    arg_count: usize,
    extra_temps: usize,
    flag: MethodFlag,
    primitive: usize,
    literals: Vec<Literal>,
    bytes: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    depth: usize,
    max_depth: usize,
    uses_super: bool,
    error: Option<Error>,
}

impl MethodBuilder {
    pub fn new(arg_count: usize) -> Self {
        Self {
            arg_count,
            extra_temps: 0,
            flag: MethodFlag::Normal,
            primitive: 0,
            literals: Vec::new(),
            bytes: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
            depth: 0,
            max_depth: 0,
            uses_super: false,
            error: None,
        }
    }

    /// Temporaries besides the arguments. They follow the arguments, so the first one has index
    /// `arg_count`.
    pub fn temporaries(&mut self, count: usize) -> &mut Self {
        self.extra_temps = count;
        self
    }

    pub fn primitive(&mut self, index: usize) -> &mut Self {
        self.primitive = index;
        self
    }

    /// Makes the method answer its receiver without being activated.
    pub fn returns_self(&mut self) -> &mut Self {
        self.flag = MethodFlag::ReturnSelf;
        self
    }

    /// Makes the method answer one of the receiver's fields without being activated.
    pub fn returns_instance_variable(&mut self, index: usize) -> &mut Self {
        self.flag = MethodFlag::ReturnInstanceVariable;
        self.primitive = index;
        self
    }

    /// Makes the method answer a constant without being activated.
    pub fn returns_literal(&mut self, literal: Literal) -> &mut Self {
        self.flag = MethodFlag::ReturnLiteral;
        self.literal_index(literal);
        self
    }

    fn fail(&mut self, error: Error) {
        self.error.get_or_insert(error);
    }

    fn grow(&mut self, count: usize) {
        self.depth += count;
        self.max_depth = self.max_depth.max(self.depth);
    }

    fn shrink(&mut self, count: usize) {
        self.depth = self.depth.saturating_sub(count);
    }

    fn emit(&mut self, bytecode: Bytecode) {
        bytecode.encode(&mut self.bytes);
    }

    fn operand(&mut self, index: usize, what: &str) -> u8 {
        match u8::try_from(index) {
            Ok(index) => index,
            Err(_) => {
                self.fail(anyhow!("{what} {index} does not fit in an operand"));
                0
            }
        }
    }

    fn literal_index(&mut self, literal: Literal) -> u8 {
        let index = match self.literals.iter().position(|existing| *existing == literal) {
            Some(index) => index,
            None => {
                self.literals.push(literal);
                self.literals.len() - 1
            }
        };
        self.operand(index, "literal")
    }

    // ----- pushes -----

    pub fn push_self(&mut self) -> &mut Self {
        self.emit(Bytecode::PushSelf);
        self.grow(1);
        self
    }

    pub fn push_nil(&mut self) -> &mut Self {
        self.emit(Bytecode::PushNil);
        self.grow(1);
        self
    }

    pub fn push_true(&mut self) -> &mut Self {
        self.emit(Bytecode::PushTrue);
        self.grow(1);
        self
    }

    pub fn push_false(&mut self) -> &mut Self {
        self.emit(Bytecode::PushFalse);
        self.grow(1);
        self
    }

    pub fn push_this_context(&mut self) -> &mut Self {
        self.emit(Bytecode::PushThisContext);
        self.grow(1);
        self
    }

    /// Pushes an integer, with a dedicated instruction for -1, 0, 1 and 2.
    pub fn push_integer(&mut self, value: i64) -> &mut Self {
        match value {
            -1 => self.emit(Bytecode::PushMinusOne),
            0 => self.emit(Bytecode::PushZero),
            1 => self.emit(Bytecode::PushOne),
            2 => self.emit(Bytecode::PushTwo),
            _ => {
                let index = self.literal_index(Literal::Integer(BigInt::from(value)));
                self.emit(Bytecode::PushLiteralConstant(index));
            }
        }
        self.grow(1);
        self
    }

    pub fn push_literal(&mut self, literal: Literal) -> &mut Self {
        let index = self.literal_index(literal);
        self.emit(Bytecode::PushLiteralConstant(index));
        self.grow(1);
        self
    }

    pub fn push_temp(&mut self, index: usize) -> &mut Self {
        let index = self.operand(index, "temporary");
        self.emit(Bytecode::PushTemporary(index));
        self.grow(1);
        self
    }

    pub fn push_inst_var(&mut self, index: usize) -> &mut Self {
        let index = self.operand(index, "instance variable");
        self.emit(Bytecode::PushReceiverVariable(index));
        self.grow(1);
        self
    }

    pub fn push_global(&mut self, name: &str) -> &mut Self {
        let index = self.literal_index(Literal::Global(name.to_owned()));
        self.emit(Bytecode::PushLiteralVariable(index));
        self.grow(1);
        self
    }

    // ----- stores -----

    pub fn store_temp(&mut self, index: usize) -> &mut Self {
        let index = self.operand(index, "temporary");
        self.emit(Bytecode::StoreTemporary(index));
        self
    }

    pub fn pop_into_temp(&mut self, index: usize) -> &mut Self {
        let index = self.operand(index, "temporary");
        self.emit(Bytecode::PopIntoTemporary(index));
        self.shrink(1);
        self
    }

    pub fn store_inst_var(&mut self, index: usize) -> &mut Self {
        let index = self.operand(index, "instance variable");
        self.emit(Bytecode::StoreReceiverVariable(index));
        self
    }

    pub fn pop_into_inst_var(&mut self, index: usize) -> &mut Self {
        let index = self.operand(index, "instance variable");
        self.emit(Bytecode::PopIntoReceiverVariable(index));
        self.shrink(1);
        self
    }

    pub fn store_global(&mut self, name: &str) -> &mut Self {
        let index = self.literal_index(Literal::Global(name.to_owned()));
        self.emit(Bytecode::StoreLiteralVariable(index));
        self
    }

    pub fn pop_into_global(&mut self, name: &str) -> &mut Self {
        let index = self.literal_index(Literal::Global(name.to_owned()));
        self.emit(Bytecode::PopIntoLiteralVariable(index));
        self.shrink(1);
        self
    }

    pub fn dup(&mut self) -> &mut Self {
        self.emit(Bytecode::Dup);
        self.grow(1);
        self
    }

    pub fn pop(&mut self) -> &mut Self {
        self.emit(Bytecode::Pop);
        self.shrink(1);
        self
    }

    // ----- returns -----

    pub fn return_top(&mut self) -> &mut Self {
        self.emit(Bytecode::ReturnTop);
        self.shrink(1);
        self
    }

    pub fn return_self(&mut self) -> &mut Self {
        self.emit(Bytecode::ReturnSelf);
        self
    }

    pub fn return_nil(&mut self) -> &mut Self {
        self.emit(Bytecode::ReturnNil);
        self
    }

    pub fn return_true(&mut self) -> &mut Self {
        self.emit(Bytecode::ReturnTrue);
        self
    }

    pub fn return_false(&mut self) -> &mut Self {
        self.emit(Bytecode::ReturnFalse);
        self
    }

    /// Ends a block, answering the top of the stack to whoever activated it.
    pub fn block_return(&mut self) -> &mut Self {
        self.emit(Bytecode::BlockReturn);
        self.shrink(1);
        self
    }

    // ----- sends -----

    /// Sends a message, through a special selector instruction when there is one.
    pub fn send(&mut self, selector: &str, arg_count: usize) -> &mut Self {
        let special = SPECIAL_SELECTORS
            .iter()
            .position(|special| special.selector == selector && special.arg_count as usize == arg_count);
        match special {
            Some(index) => {
                self.emit(Bytecode::SendSpecial(index as u8));
                self.shrink(arg_count);
                self
            }
            None => self.send_general(selector, arg_count),
        }
    }

    /// Sends a message with the generic send instruction.
    pub fn send_general(&mut self, selector: &str, arg_count: usize) -> &mut Self {
        let index = self.literal_index(Literal::Symbol(selector.to_owned()));
        let arg_count = self.operand(arg_count, "argument count");
        self.emit(Bytecode::Send(index, arg_count));
        self.shrink(arg_count as usize);
        self
    }

    /// Sends a message to `self`, starting the lookup above the class the method is installed
    /// in.
    pub fn super_send(&mut self, selector: &str, arg_count: usize) -> &mut Self {
        self.uses_super = true;
        let index = self.literal_index(Literal::Symbol(selector.to_owned()));
        let arg_count = self.operand(arg_count, "argument count");
        self.emit(Bytecode::SuperSend(index, arg_count));
        self.shrink(arg_count as usize);
        self
    }

    // ----- control -----

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Makes the label designate the next instruction emitted.
    pub fn bind(&mut self, label: Label) -> &mut Self {
        let position = self.bytes.len();
        match self.labels.get(label.0).copied() {
            Some(None) => self.labels[label.0] = Some(position),
            Some(Some(_)) => self.fail(anyhow!("label {} bound twice", label.0)),
            None => self.fail(anyhow!("label {} belongs to another builder", label.0)),
        }
        self
    }

    /// The current offset, for callers that want to reason about jump distances.
    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    fn emit_jump(&mut self, label: Label, bytecode: Bytecode, long: bool) -> &mut Self {
        self.emit(bytecode);
        let end = self.bytes.len();
        let operand = if long { end - 2 } else { end - 1 };
        self.fixups.push(Fixup { label, operand, end, long });
        self
    }

    pub fn jump(&mut self, label: Label) -> &mut Self {
        self.emit_jump(label, Bytecode::LongJump(0), true)
    }

    pub fn jump_if_true(&mut self, label: Label) -> &mut Self {
        self.shrink(1);
        self.emit_jump(label, Bytecode::LongJumpIfTrue(0), true)
    }

    pub fn jump_if_false(&mut self, label: Label) -> &mut Self {
        self.shrink(1);
        self.emit_jump(label, Bytecode::LongJumpIfFalse(0), true)
    }

    /// A jump with a one-byte offset. The label must end up within 127 bytes.
    pub fn short_jump(&mut self, label: Label) -> &mut Self {
        self.emit_jump(label, Bytecode::Jump(0), false)
    }

    pub fn short_jump_if_true(&mut self, label: Label) -> &mut Self {
        self.shrink(1);
        self.emit_jump(label, Bytecode::JumpIfTrue(0), false)
    }

    pub fn short_jump_if_false(&mut self, label: Label) -> &mut Self {
        self.shrink(1);
        self.emit_jump(label, Bytecode::JumpIfFalse(0), false)
    }

    /// Emits a block taking `arg_count` arguments. On activation the arguments are on the
    /// block's stack, last on top, and `body` usually starts by popping them into temporaries.
    /// The body should end with a return.
    pub fn block(&mut self, arg_count: usize, body: impl FnOnce(&mut Self)) -> &mut Self {
        let operand = self.operand(arg_count, "block argument count");
        self.emit(Bytecode::CreateBlock(operand));
        let end = self.new_label();
        self.jump(end);

        let outer_depth = self.depth;
        self.depth = 0;
        self.grow(arg_count);
        body(self);
        self.bind(end);
        self.depth = outer_depth;
        self.grow(1);
        self
    }

    /// Emits `condition` then `body` while the condition holds, leaving nothing on the stack.
    pub fn while_true(&mut self, condition: impl FnOnce(&mut Self), body: impl FnOnce(&mut Self)) -> &mut Self {
        let start = self.new_label();
        let done = self.new_label();
        self.bind(start);
        condition(self);
        self.jump_if_false(done);
        body(self);
        self.jump(start);
        self.bind(done)
    }

    /// Emits `if_true` or `if_false` depending on the value on top of the stack. Both branches
    /// should leave the same number of values behind.
    pub fn if_true_if_false(&mut self, if_true: impl FnOnce(&mut Self), if_false: impl FnOnce(&mut Self)) -> &mut Self {
        let otherwise = self.new_label();
        let done = self.new_label();
        self.jump_if_false(otherwise);
        let depth = self.depth;
        if_true(self);
        self.jump(done);
        self.depth = depth;
        self.bind(otherwise);
        if_false(self);
        self.bind(done)
    }

    // ----- assembly -----

    /// Resolves the jumps and answers the byte-code.
    fn assemble(&self) -> Result<Vec<u8>, Error> {
        let mut bytes = self.bytes.clone();
        for fixup in &self.fixups {
            let Some(target) = self.labels[fixup.label.0] else {
                bail!("jump at {} to a label that was never bound", fixup.end);
            };
            let offset = target as isize - fixup.end as isize;
            if fixup.long {
                let offset = i16::try_from(offset).map_err(|_| anyhow!("jump at {} too far: {offset}", fixup.end))?;
                bytes[fixup.operand..fixup.end].copy_from_slice(&offset.to_be_bytes());
            } else {
                let offset = i8::try_from(offset).map_err(|_| anyhow!("short jump at {} too far: {offset}", fixup.end))?;
                bytes[fixup.operand] = offset as u8;
            }
        }
        Ok(bytes)
    }

    /// The header the method will get.
    pub fn header(&self) -> Result<MethodHeader, Error> {
        // Room for the two values an escaped block pushes on its caller's stack.
        let depth = self.max_depth + 2;
        MethodHeader::new(self.flag, self.arg_count, self.arg_count + self.extra_temps, depth, self.primitive)
    }

    /// Creates the compiled method in the heap. `class` is the class the method is meant for;
    /// it is only recorded if the method performs super sends.
    pub fn build(&mut self, universe: &mut Universe, interpreter: &mut Interpreter, class: Oop) -> Result<Oop, Error> {
        if let Some(error) = self.error.take() {
            return Err(error).context("malformed method");
        }
        let bytes = self.assemble()?;
        let header = self.header()?;
        let mut literals = self.literals.clone();
        if self.uses_super {
            literals.push(Literal::MethodClass);
        }
        if literals.len() > u8::MAX as usize + 1 {
            bail!("too many literals: {}", literals.len());
        }

        let base = universe.remappable_len();
        universe.push_remappable(class);
        for literal in &literals {
            let oop = materialize(universe, interpreter, literal, base);
            universe.push_remappable(oop);
        }
        let literal_array = universe.new_array(interpreter, literals.len());
        for index in 0..literals.len() {
            let literal = universe.remappable(base + 1 + index);
            universe.heap.store_element(literal_array, index, literal);
        }
        universe.truncate_remappable(base);

        universe.push_remappable(literal_array);
        let bytecodes = universe.new_byte_array(interpreter, &bytes);
        universe.push_remappable(bytecodes);
        let class = universe.core.compiled_method_class;
        let method = universe.allocate(interpreter, class, ObjectFormat::Plain, method::FIXED_FIELDS, 0);
        let bytecodes = universe.pop_remappable();
        let literal_array = universe.pop_remappable();

        let heap = &mut universe.heap;
        heap.store_pointer(method, method::HEADER, header.to_oop());
        heap.store_pointer(method, method::LITERALS, literal_array);
        heap.store_pointer(method, method::BYTECODES, bytecodes);
        Ok(method)
    }

    /// Builds the method and installs it in `class` under `selector`.
    pub fn install(&mut self, universe: &mut Universe, interpreter: &mut Interpreter, class: Oop, selector: &str) -> Result<Oop, Error> {
        universe.push_remappable(class);
        let method = self.build(universe, interpreter, class);
        let class = universe.pop_remappable();
        let method = method.with_context(|| format!("cannot assemble {}>>#{selector}", universe.class_name(class)))?;
        universe.install_method(interpreter, class, selector, method);
        Ok(method)
    }
}

/// Creates a literal's object. The method's class is at `base` on the remappable stack.
fn materialize(universe: &mut Universe, interpreter: &mut Interpreter, literal: &Literal, base: usize) -> Oop {
    match literal {
        Literal::Nil => universe.core.nil,
        Literal::True => universe.core.true_object,
        Literal::False => universe.core.false_object,
        Literal::Integer(value) => universe.new_integer(interpreter, value.clone()),
        Literal::Character(value) => Oop::from_char(*value),
        Literal::Float(value) => universe.new_float(interpreter, *value),
        Literal::String(value) => universe.new_string(interpreter, value),
        Literal::Symbol(name) => universe.intern(interpreter, name),
        Literal::Global(name) => universe.global_association(interpreter, name),
        Literal::MethodClass => {
            let nil = universe.core.nil;
            let association = universe.new_association(interpreter, nil, nil);
            let class = universe.remappable(base);
            universe.heap.store_pointer(association, crate::vm_objects::association::VALUE, class);
            association
        }
    }
}
