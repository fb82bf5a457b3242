use std::fmt::Write;

use bluebook_core::bytecode::SPECIAL_SELECTORS;
use bluebook_core::{Bytecode, MethodFlag};
use bluebook_value::Oop;

use crate::primitives;
use crate::universe::Universe;
use crate::vm_objects::{association, method};

/// Renders a compiled method as a listing: a summary of its header, then one line per
/// instruction with its offset, operands and whatever they refer to. Block bodies are indented.
pub fn disassemble(universe: &Universe, method: Oop) -> String {
    let heap = &universe.heap;
    let header = method::header(heap, method);
    let mut out = String::new();

    let _ = write!(
        out,
        "; {} args, {} temps, stack depth {}",
        header.arg_count(),
        header.temp_count(),
        header.stack_depth()
    );
    match header.flag() {
        Some(MethodFlag::Normal) if header.primitive_index() != 0 => {
            let index = header.primitive_index();
            let name = primitives::get(index).map_or("unknown", |info| info.name);
            let _ = write!(out, ", primitive {index} ({name})");
        }
        Some(MethodFlag::Normal) => {}
        Some(MethodFlag::ReturnSelf) => out.push_str(", answers self"),
        Some(MethodFlag::ReturnInstanceVariable) => {
            let _ = write!(out, ", answers instance variable {}", header.primitive_index());
        }
        Some(MethodFlag::ReturnLiteral) => {
            let literal = method::literal(heap, method, 0);
            let _ = write!(out, ", answers {}", universe.describe(literal));
        }
        None => out.push_str(", reserved flag"),
    }
    out.push('\n');

    let bytes = method::bytecode_bytes(heap, method);
    // Ends of the blocks being listed, innermost last.
    let mut block_ends: Vec<usize> = Vec::new();
    let mut pending_block = false;
    let mut pc = 0;
    while pc < bytes.len() {
        while block_ends.last().is_some_and(|&end| end <= pc) {
            block_ends.pop();
        }
        let padding = "  |".repeat(block_ends.len());
        let Some(bytecode) = Bytecode::decode(&bytes, pc) else {
            let _ = writeln!(out, "{pc:>4} {padding} <invalid {:#04x}>", bytes[pc]);
            break;
        };
        let end = pc + bytecode.width();
        let _ = write!(out, "{pc:>4} {padding} {}", bytecode.padded_name());

        match bytecode {
            Bytecode::PushReceiverVariable(index)
            | Bytecode::StoreReceiverVariable(index)
            | Bytecode::PopIntoReceiverVariable(index)
            | Bytecode::PushTemporary(index)
            | Bytecode::StoreTemporary(index)
            | Bytecode::PopIntoTemporary(index) => {
                let _ = write!(out, " {index}");
            }
            Bytecode::PushLiteralConstant(index) => {
                let _ = write!(out, " {index} ({})", literal_text(universe, method, index));
            }
            Bytecode::PushLiteralVariable(index) | Bytecode::StoreLiteralVariable(index) | Bytecode::PopIntoLiteralVariable(index) => {
                let _ = write!(out, " {index} ({})", binding_text(universe, method, index));
            }
            Bytecode::Send(index, arg_count) | Bytecode::SuperSend(index, arg_count) => {
                let _ = write!(out, " {} {arg_count}", literal_text(universe, method, index));
            }
            Bytecode::SendSpecial(index) => {
                let selector = SPECIAL_SELECTORS.get(usize::from(index)).map_or("?", |special| special.selector);
                let _ = write!(out, " #{selector}");
            }
            Bytecode::CreateBlock(arg_count) => {
                let _ = write!(out, " {arg_count}");
                pending_block = true;
            }
            _ => {
                if let Some(offset) = bytecode.jump_offset() {
                    let target = end as isize + offset;
                    let _ = write!(out, " {offset:+} (to {target})");
                    if std::mem::take(&mut pending_block) && target > 0 {
                        block_ends.push(target as usize);
                    }
                }
            }
        }
        out.push('\n');
        pc = end;
    }
    // Padded names leave trailing blanks after operand-less instructions.
    out.lines().map(|line| format!("{}\n", line.trim_end())).collect()
}

fn literal_text(universe: &Universe, method: Oop, index: u8) -> String {
    let index = usize::from(index);
    if index >= method::literal_count(&universe.heap, method) {
        return String::from("invalid literal");
    }
    universe.describe(method::literal(&universe.heap, method, index))
}

/// The name of the global a literal variable instruction refers to.
fn binding_text(universe: &Universe, method: Oop, index: u8) -> String {
    let heap = &universe.heap;
    let index = usize::from(index);
    if index >= method::literal_count(heap, method) {
        return String::from("invalid literal");
    }
    let binding = method::literal(heap, method, index);
    if !binding.is_pointer() || heap.fixed_fields(binding) != association::FIXED_FIELDS {
        return String::from("not a binding");
    }
    let key = heap.fetch_pointer(binding, association::KEY);
    match universe.string_value(key) {
        Some(name) => name,
        None => String::from("method class"),
    }
}
