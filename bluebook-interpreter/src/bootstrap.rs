use anyhow::{anyhow, Context, Error};
use bluebook_core::bytecode::SPECIAL_SELECTORS;
use bluebook_gc::format::CONTEXT_FIXED_FIELDS;
use bluebook_gc::{Heap, ObjectFormat};
use bluebook_value::Oop;
use log::{debug, info};

use crate::builder::{Literal, MethodBuilder};
use crate::interpreter::Interpreter;
use crate::universe::{CoreObjects, Universe, UniverseConfig};
use crate::vm_objects::class::{self, method_dictionary, InstanceSpec};
use crate::vm_objects::{association, message, method};

/// A kernel class: its name, its superclass and the shape of its instances.
struct KernelClass {
    name: &'static str,
    superclass: Option<&'static str>,
    spec: InstanceSpec,
}

const fn kernel(name: &'static str, superclass: &'static str, format: ObjectFormat, fixed_fields: usize) -> KernelClass {
    KernelClass {
        name,
        superclass: Some(superclass),
        spec: InstanceSpec::new(format, fixed_fields),
    }
}

/// Superclasses come before their subclasses.
const KERNEL_CLASSES: &[KernelClass] = &[
    KernelClass {
        name: "Object",
        superclass: None,
        spec: InstanceSpec::new(ObjectFormat::Plain, 0),
    },
    kernel("Behavior", "Object", ObjectFormat::Plain, class::FIXED_FIELDS),
    kernel("Class", "Behavior", ObjectFormat::Plain, class::FIXED_FIELDS),
    kernel("Metaclass", "Behavior", ObjectFormat::Plain, class::FIXED_FIELDS),
    kernel("UndefinedObject", "Object", ObjectFormat::Plain, 0),
    kernel("Boolean", "Object", ObjectFormat::Plain, 0),
    kernel("True", "Boolean", ObjectFormat::Plain, 0),
    kernel("False", "Boolean", ObjectFormat::Plain, 0),
    kernel("Magnitude", "Object", ObjectFormat::Plain, 0),
    kernel("Character", "Magnitude", ObjectFormat::Plain, 0),
    kernel("Number", "Magnitude", ObjectFormat::Plain, 0),
    kernel("Integer", "Number", ObjectFormat::Plain, 0),
    kernel("SmallInteger", "Integer", ObjectFormat::Plain, 0),
    kernel("LargeInteger", "Integer", ObjectFormat::LargeInteger, 0),
    kernel("Float", "Number", ObjectFormat::Float, 0),
    kernel("Collection", "Object", ObjectFormat::Plain, 0),
    kernel("Array", "Collection", ObjectFormat::Array, 0),
    kernel("ByteArray", "Collection", ObjectFormat::ByteArray, 0),
    kernel("String", "Collection", ObjectFormat::ByteArray, 0),
    kernel("Symbol", "String", ObjectFormat::ByteArray, 0),
    kernel("WordArray", "Collection", ObjectFormat::WordArray, 0),
    kernel("FloatArray", "Collection", ObjectFormat::FloatArray, 0),
    kernel("MethodDictionary", "Object", ObjectFormat::Array, method_dictionary::FIXED_FIELDS),
    kernel("Association", "Object", ObjectFormat::Plain, association::FIXED_FIELDS),
    kernel("Message", "Object", ObjectFormat::Plain, message::FIXED_FIELDS),
    kernel("CompiledMethod", "Object", ObjectFormat::Plain, method::FIXED_FIELDS),
    kernel("MethodContext", "Object", ObjectFormat::Context, CONTEXT_FIXED_FIELDS),
    kernel("BlockContext", "Object", ObjectFormat::Context, CONTEXT_FIXED_FIELDS),
    kernel("System", "Object", ObjectFormat::Plain, 0),
];

/// Where the virtual machine keeps a kernel class.
fn class_slot<'a>(core: &'a mut CoreObjects, name: &str) -> Option<&'a mut Oop> {
    Some(match name {
        "Object" => &mut core.object_class,
        "Behavior" => &mut core.behavior_class,
        "Class" => &mut core.class_class,
        "Metaclass" => &mut core.metaclass_class,
        "UndefinedObject" => &mut core.undefined_object_class,
        "Boolean" => &mut core.boolean_class,
        "True" => &mut core.true_class,
        "False" => &mut core.false_class,
        "Magnitude" => &mut core.magnitude_class,
        "Character" => &mut core.character_class,
        "Number" => &mut core.number_class,
        "Integer" => &mut core.integer_class,
        "SmallInteger" => &mut core.small_integer_class,
        "LargeInteger" => &mut core.large_integer_class,
        "Float" => &mut core.float_class,
        "Collection" => &mut core.collection_class,
        "Array" => &mut core.array_class,
        "ByteArray" => &mut core.byte_array_class,
        "String" => &mut core.string_class,
        "Symbol" => &mut core.symbol_class,
        "WordArray" => &mut core.word_array_class,
        "FloatArray" => &mut core.float_array_class,
        "MethodDictionary" => &mut core.method_dictionary_class,
        "Association" => &mut core.association_class,
        "Message" => &mut core.message_class,
        "CompiledMethod" => &mut core.compiled_method_class,
        "MethodContext" => &mut core.method_context_class,
        "BlockContext" => &mut core.block_context_class,
        "System" => &mut core.system_class,
        _ => return None,
    })
}

fn kernel_class(core: &mut CoreObjects, name: &str) -> Result<Oop, Error> {
    class_slot(core, name)
        .map(|slot| *slot)
        .ok_or_else(|| anyhow!("no kernel class named {name}"))
}

impl Universe {
    /// Creates a virtual machine holding the kernel classes and their methods, and the
    /// interpreter to run it.
    pub fn bootstrap(config: UniverseConfig) -> Result<(Universe, Interpreter), Error> {
        config.validate()?;
        let heap = Heap::new(config.heap.clone())?;
        let mut interpreter = Interpreter::new(config.method_cache_size)?;
        let mut universe = Universe::empty(heap);

        universe.create_kernel_classes(&mut interpreter)?;
        universe.intern_special_selectors(&mut interpreter);
        install_kernel_methods(&mut universe, &mut interpreter).context("could not install the kernel methods")?;

        info!(
            "bootstrapped {} kernel classes, {} bytes in use",
            KERNEL_CLASSES.len(),
            universe.heap.used_bytes()
        );
        Ok((universe, interpreter))
    }

    fn create_kernel_classes(&mut self, interpreter: &mut Interpreter) -> Result<(), Error> {
        // Every reference slot starts out as nil, so it has to exist first. Classes are bare
        // until all of them exist, since each class refers to others.
        let nil = self.allocate(interpreter, Oop::NULL, ObjectFormat::Plain, 0, 0);
        self.heap.set_nil(nil);
        self.core.nil = nil;

        for kernel in KERNEL_CLASSES {
            let class = self.allocate(interpreter, Oop::NULL, ObjectFormat::Plain, class::FIXED_FIELDS, 0);
            if let Some(slot) = class_slot(&mut self.core, kernel.name) {
                *slot = class;
            }
        }

        let nil = self.core.nil;
        self.heap.set_class_of(nil, self.core.undefined_object_class);
        self.core.true_object = self.allocate(interpreter, self.core.true_class, ObjectFormat::Plain, 0, 0);
        self.core.false_object = self.allocate(interpreter, self.core.false_class, ObjectFormat::Plain, 0, 0);

        for kernel in KERNEL_CLASSES {
            let name = self.intern(interpreter, kernel.name);
            self.push_remappable(name);
            let dictionary = self.new_method_dictionary(interpreter, method_dictionary::MIN_CAPACITY);
            self.push_remappable(dictionary);
            let meta_dictionary = self.new_method_dictionary(interpreter, method_dictionary::MIN_CAPACITY);
            self.push_remappable(meta_dictionary);
            let metaclass = self.allocate(interpreter, self.core.metaclass_class, ObjectFormat::Plain, class::FIXED_FIELDS, 0);
            let meta_dictionary = self.pop_remappable();
            let dictionary = self.pop_remappable();
            let name = self.pop_remappable();

            let class = kernel_class(&mut self.core, kernel.name)?;
            let superclass = match kernel.superclass {
                Some(superclass) => kernel_class(&mut self.core, superclass)?,
                None => self.core.nil,
            };
            self.link_class(class, metaclass, superclass, kernel.spec, name, dictionary, meta_dictionary);
            self.set_global(interpreter, kernel.name, class);
            debug!("created kernel class {}", kernel.name);
        }
        Ok(())
    }

    fn intern_special_selectors(&mut self, interpreter: &mut Interpreter) {
        for (index, special) in SPECIAL_SELECTORS.iter().enumerate() {
            self.core.special_selectors[index] = self.intern(interpreter, special.selector);
        }
        self.core.does_not_understand_selector = self.intern(interpreter, "doesNotUnderstand:");
        self.core.escaped_block_selector = self.intern(interpreter, "escapedBlock:");
        self.core.must_be_boolean_selector = self.intern(interpreter, "mustBeBoolean");
    }
}

/// What a primitive method does when its primitive fails.
#[derive(Debug, Copy, Clone)]
enum Fallback {
    /// Resend the message to `super`, where a more general primitive takes over.
    Super,
    /// Send `primitiveFailed` to the receiver.
    PrimitiveFailed,
}

struct PrimitiveMethod {
    class: &'static str,
    selector: &'static str,
    index: usize,
    fallback: Fallback,
}

const fn primitive(class: &'static str, selector: &'static str, index: usize, fallback: Fallback) -> PrimitiveMethod {
    PrimitiveMethod {
        class,
        selector,
        index,
        fallback,
    }
}

use Fallback::{PrimitiveFailed, Super};

const PRIMITIVE_METHODS: &[PrimitiveMethod] = &[
    primitive("Object", "==", 110, PrimitiveFailed),
    primitive("Object", "=", 110, PrimitiveFailed),
    primitive("Object", "~=", 109, PrimitiveFailed),
    primitive("Object", "class", 111, PrimitiveFailed),
    primitive("Object", "identityHash", 75, PrimitiveFailed),
    primitive("Object", "instVarAt:", 73, PrimitiveFailed),
    primitive("Object", "instVarAt:put:", 74, PrimitiveFailed),
    primitive("Object", "at:", 60, PrimitiveFailed),
    primitive("Object", "at:put:", 61, PrimitiveFailed),
    primitive("Object", "size", 62, PrimitiveFailed),
    primitive("Object", "basicAt:", 60, PrimitiveFailed),
    primitive("Object", "basicAt:put:", 61, PrimitiveFailed),
    primitive("Object", "basicSize", 62, PrimitiveFailed),
    primitive("Behavior", "basicNew", 70, PrimitiveFailed),
    primitive("Behavior", "new", 70, PrimitiveFailed),
    primitive("Behavior", "basicNew:", 71, PrimitiveFailed),
    primitive("Behavior", "new:", 71, PrimitiveFailed),
    primitive("Character", "value", 90, PrimitiveFailed),
    primitive("Character", "asInteger", 90, PrimitiveFailed),
    primitive("SmallInteger", "+", 1, Super),
    primitive("SmallInteger", "-", 2, Super),
    primitive("SmallInteger", "<", 3, Super),
    primitive("SmallInteger", ">", 4, Super),
    primitive("SmallInteger", "<=", 5, Super),
    primitive("SmallInteger", ">=", 6, Super),
    primitive("SmallInteger", "=", 7, Super),
    primitive("SmallInteger", "~=", 8, Super),
    primitive("SmallInteger", "*", 9, Super),
    primitive("SmallInteger", "/", 10, Super),
    primitive("SmallInteger", "\\\\", 11, Super),
    primitive("SmallInteger", "//", 12, Super),
    primitive("SmallInteger", "quo:", 13, PrimitiveFailed),
    primitive("SmallInteger", "bitAnd:", 14, PrimitiveFailed),
    primitive("SmallInteger", "bitOr:", 15, PrimitiveFailed),
    primitive("SmallInteger", "bitXor:", 16, PrimitiveFailed),
    primitive("SmallInteger", "bitShift:", 17, PrimitiveFailed),
    primitive("SmallInteger", "asFloat", 18, PrimitiveFailed),
    primitive("SmallInteger", "asCharacter", 19, PrimitiveFailed),
    primitive("SmallInteger", "atRandom", 115, PrimitiveFailed),
    primitive("Integer", "+", 21, PrimitiveFailed),
    primitive("Integer", "-", 22, PrimitiveFailed),
    primitive("Integer", "<", 23, PrimitiveFailed),
    primitive("Integer", ">", 24, PrimitiveFailed),
    primitive("Integer", "<=", 25, PrimitiveFailed),
    primitive("Integer", ">=", 26, PrimitiveFailed),
    primitive("Integer", "=", 27, Super),
    primitive("Integer", "~=", 28, Super),
    primitive("Integer", "*", 29, PrimitiveFailed),
    primitive("Integer", "//", 30, PrimitiveFailed),
    primitive("Integer", "\\\\", 31, PrimitiveFailed),
    primitive("Integer", "/", 32, PrimitiveFailed),
    primitive("Integer", "printString", 33, PrimitiveFailed),
    primitive("Float", "+", 41, PrimitiveFailed),
    primitive("Float", "-", 42, PrimitiveFailed),
    primitive("Float", "<", 43, PrimitiveFailed),
    primitive("Float", ">", 44, PrimitiveFailed),
    primitive("Float", "<=", 45, PrimitiveFailed),
    primitive("Float", ">=", 46, PrimitiveFailed),
    primitive("Float", "=", 47, Super),
    primitive("Float", "~=", 48, Super),
    primitive("Float", "*", 49, PrimitiveFailed),
    primitive("Float", "/", 50, PrimitiveFailed),
    primitive("Float", "truncated", 51, PrimitiveFailed),
    primitive("Float", "printString", 52, PrimitiveFailed),
    primitive("BlockContext", "value", 81, PrimitiveFailed),
    primitive("BlockContext", "value:", 81, PrimitiveFailed),
    primitive("BlockContext", "value:value:", 81, PrimitiveFailed),
    primitive("BlockContext", "value:value:value:", 81, PrimitiveFailed),
    primitive("BlockContext", "valueWithArguments:", 82, PrimitiveFailed),
    primitive("System class", "exit:", 113, PrimitiveFailed),
    primitive("System class", "fullGC", 114, PrimitiveFailed),
];

/// Arguments taken by a selector: one per keyword, one for binary selectors.
pub fn selector_arg_count(selector: &str) -> usize {
    match selector.chars().next() {
        Some(first) if !first.is_alphabetic() && first != '_' => 1,
        _ => selector.matches(':').count(),
    }
}

/// A kernel class by name, or its metaclass for names ending in " class".
fn resolve_class(universe: &mut Universe, name: &str) -> Result<Oop, Error> {
    match name.strip_suffix(" class") {
        Some(instance) => {
            let class = kernel_class(&mut universe.core, instance)?;
            Ok(universe.heap.class_of(class))
        }
        None => kernel_class(&mut universe.core, name),
    }
}

fn install_kernel_methods(universe: &mut Universe, interpreter: &mut Interpreter) -> Result<(), Error> {
    for primitive in PRIMITIVE_METHODS {
        let arg_count = selector_arg_count(primitive.selector);
        let mut builder = MethodBuilder::new(arg_count);
        builder.primitive(primitive.index).push_self();
        match primitive.fallback {
            Fallback::Super => {
                for index in 0..arg_count {
                    builder.push_temp(index);
                }
                builder.super_send(primitive.selector, arg_count);
            }
            Fallback::PrimitiveFailed => {
                builder.send_general("primitiveFailed", 0);
            }
        }
        builder.return_top();
        let class = resolve_class(universe, primitive.class)?;
        builder.install(universe, interpreter, class, primitive.selector)?;
    }

    let trivial: [(&str, &str, MethodBuilder); 10] = [
        ("Object", "yourself", returns_self()),
        ("Object", "isNil", returns_literal(Literal::False)),
        ("Object", "notNil", returns_literal(Literal::True)),
        ("UndefinedObject", "isNil", returns_literal(Literal::True)),
        ("UndefinedObject", "notNil", returns_literal(Literal::False)),
        ("True", "not", returns_literal(Literal::False)),
        ("False", "not", returns_literal(Literal::True)),
        ("Association", "key", returns_instance_variable(association::KEY)),
        ("Association", "value", returns_instance_variable(association::VALUE)),
        ("Message", "selector", returns_instance_variable(message::SELECTOR)),
    ];
    for (class, selector, mut builder) in trivial {
        let class = resolve_class(universe, class)?;
        builder.install(universe, interpreter, class, selector)?;
    }
    let class = universe.core.message_class;
    returns_instance_variable(message::ARGUMENTS).install(universe, interpreter, class, "arguments")?;

    install_iteration_methods(universe, interpreter)
}

fn returns_self() -> MethodBuilder {
    let mut builder = MethodBuilder::new(0);
    builder.returns_self();
    builder
}

fn returns_literal(literal: Literal) -> MethodBuilder {
    let mut builder = MethodBuilder::new(0);
    builder.returns_literal(literal);
    builder
}

fn returns_instance_variable(index: usize) -> MethodBuilder {
    let mut builder = MethodBuilder::new(0);
    builder.returns_instance_variable(index);
    builder
}

/// `Integer>>to:do:` and `Integer>>timesRepeat:`, written in byte-code.
fn install_iteration_methods(universe: &mut Universe, interpreter: &mut Interpreter) -> Result<(), Error> {
    let integer = universe.core.integer_class;

    // to: stop do: aBlock  | i |  i := self. [i <= stop] whileTrue: [aBlock value: i. i := i + 1]
    let (stop, block, i) = (0, 1, 2);
    let mut to_do = MethodBuilder::new(2);
    to_do.temporaries(1).push_self().pop_into_temp(i).while_true(
        |b| {
            b.push_temp(i).push_temp(stop).send("<=", 1);
        },
        |b| {
            b.push_temp(block).push_temp(i).send("value:", 1).pop();
            b.push_temp(i).push_integer(1).send("+", 1).pop_into_temp(i);
        },
    );
    to_do.return_self().install(universe, interpreter, integer, "to:do:")?;

    // timesRepeat: aBlock  | i |  i := 1. [i <= self] whileTrue: [aBlock value. i := i + 1]
    let (block, i) = (0, 1);
    let mut times_repeat = MethodBuilder::new(1);
    times_repeat.temporaries(1).push_integer(1).pop_into_temp(i).while_true(
        |b| {
            b.push_temp(i).push_self().send("<=", 1);
        },
        |b| {
            b.push_temp(block).send("value", 0).pop();
            b.push_temp(i).push_integer(1).send("+", 1).pop_into_temp(i);
        },
    );
    times_repeat.return_self().install(universe, interpreter, integer, "timesRepeat:")?;
    Ok(())
}
