use bluebook_gc::{HeapConfig, ObjectFormat};
use bluebook_interpreter::builder::{Literal, MethodBuilder};
use bluebook_interpreter::interpreter::Interpreter;
use bluebook_interpreter::universe::{Universe, UniverseConfig};
use bluebook_interpreter::vm_objects::class::InstanceSpec;
use bluebook_interpreter::vm_objects::message;
use bluebook_value::Oop;
use num_bigint::BigInt;
use rstest::{fixture, rstest};

#[fixture]
fn vm() -> (Universe, Interpreter) {
    Universe::bootstrap(UniverseConfig::default()).expect("could not bootstrap a test universe")
}

fn int(value: i64) -> Oop {
    Oop::from_small_integer(value)
}

fn install(universe: &mut Universe, interpreter: &mut Interpreter, class: Oop, selector: &str, builder: &mut MethodBuilder) {
    builder
        .install(universe, interpreter, class, selector)
        .unwrap_or_else(|err| panic!("could not install #{selector}: {err:?}"));
}

fn define_class(universe: &mut Universe, interpreter: &mut Interpreter, name: &str, superclass: Oop) -> Oop {
    universe.define_class(interpreter, name, superclass, InstanceSpec::new(ObjectFormat::Plain, 0))
}

#[rstest]
fn three_plus_four_leaves_seven_on_the_stack(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let method = MethodBuilder::new(0)
        .push_self()
        .push_integer(4)
        .send("+", 1)
        .return_top()
        .build(&mut universe, &mut interpreter, nil)
        .unwrap();

    interpreter.start(&mut universe, int(3), method, &[]).unwrap();
    for _ in 0..3 {
        assert_eq!(interpreter.step(&mut universe).unwrap(), None);
    }
    assert_eq!(interpreter.stack_top(&universe.heap), int(7));

    assert_eq!(interpreter.step(&mut universe).unwrap(), Some(int(7)));
    assert!(interpreter.active_context().is_null());
}

#[rstest]
fn starting_twice_is_refused(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let method = MethodBuilder::new(0).return_self().build(&mut universe, &mut interpreter, nil).unwrap();
    interpreter.start(&mut universe, nil, method, &[]).unwrap();
    assert!(interpreter.start(&mut universe, nil, method, &[]).is_err());
}

#[rstest]
#[case("+", 20, 22, 42)]
#[case("-", 20, 22, -2)]
#[case("*", -6, 7, -42)]
#[case("//", -7, 2, -4)]
#[case("\\\\", -7, 2, 1)]
#[case("/", 42, 6, 7)]
#[case("max:", 3, 9, 9)]
#[case("bitXor:", 6, 3, 5)]
#[case("bitShift:", 1, 10, 1024)]
fn small_integer_arithmetic(vm: (Universe, Interpreter), #[case] selector: &str, #[case] a: i64, #[case] b: i64, #[case] expected: i64) {
    let (mut universe, mut interpreter) = vm;
    let result = interpreter.send_message(&mut universe, int(a), selector, &[int(b)]).unwrap();
    assert_eq!(result, int(expected));
}

#[rstest]
fn comparisons_answer_booleans(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let result = interpreter.send_message(&mut universe, int(3), "<", &[int(4)]).unwrap();
    assert_eq!(result, universe.core.true_object);
    let result = interpreter.send_message(&mut universe, int(3), "=", &[int(4)]).unwrap();
    assert_eq!(result, universe.core.false_object);
}

#[rstest]
fn numbers_are_unequal_to_everything_else(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let core = &universe.core;
    let (nil, true_object, false_object) = (core.nil, core.true_object, core.false_object);

    assert_eq!(interpreter.send_message(&mut universe, int(3), "=", &[nil]).unwrap(), false_object);
    assert_eq!(interpreter.send_message(&mut universe, int(3), "~=", &[nil]).unwrap(), true_object);
    let string = universe.new_string(&mut interpreter, "a");
    assert_eq!(interpreter.send_message(&mut universe, int(3), "~=", &[string]).unwrap(), true_object);
    let string = universe.new_string(&mut interpreter, "a");
    assert_eq!(interpreter.send_message(&mut universe, int(3), "=", &[string]).unwrap(), false_object);

    let float = universe.new_float(&mut interpreter, 2.5);
    assert_eq!(interpreter.send_message(&mut universe, float, "=", &[nil]).unwrap(), false_object);
    let float = universe.new_float(&mut interpreter, 2.5);
    assert_eq!(interpreter.send_message(&mut universe, float, "~=", &[nil]).unwrap(), true_object);

    let large = universe.new_integer(&mut interpreter, BigInt::from(Oop::SMALL_INTEGER_MAX) + 1);
    assert_eq!(interpreter.send_message(&mut universe, large, "=", &[nil]).unwrap(), false_object);

    // Numbers of different kinds still compare by value.
    let float = universe.new_float(&mut interpreter, 3.0);
    assert_eq!(interpreter.send_message(&mut universe, int(3), "=", &[float]).unwrap(), true_object);
    assert_eq!(interpreter.send_message(&mut universe, nil, "~=", &[nil]).unwrap(), false_object);
}

#[rstest]
fn overflow_falls_back_to_large_integers(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let max = int(Oop::SMALL_INTEGER_MAX);
    let sum = interpreter.send_message(&mut universe, max, "+", &[int(1)]).unwrap();
    assert!(!sum.is_small_integer());
    assert_eq!(universe.class_of(sum), universe.core.large_integer_class);
    assert_eq!(universe.integer_value(sum), Some(BigInt::from(Oop::SMALL_INTEGER_MAX) + 1));

    let back = interpreter.send_message(&mut universe, sum, "-", &[int(1)]).unwrap();
    assert_eq!(back, max);
}

#[rstest]
fn inexact_division_fails(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let err = interpreter.send_message(&mut universe, int(7), "/", &[int(2)]).unwrap_err();
    assert!(format!("{err:#}").contains("primitiveFailed"), "{err:#}");
}

#[rstest]
fn unknown_selector_without_handler_is_fatal(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let err = interpreter.send_message(&mut universe, int(3), "frobnicate:", &[int(4)]).unwrap_err();
    assert!(format!("{err:#}").contains("does not understand #frobnicate:"), "{err:#}");
}

#[rstest]
fn unknown_selector_with_handler_reifies_the_message(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let object = universe.core.object_class;
    install(&mut universe, &mut interpreter, object, "doesNotUnderstand:", MethodBuilder::new(1).push_temp(0).return_top());

    let result = interpreter.send_message(&mut universe, int(3), "frobnicate:", &[int(4)]).unwrap();
    assert_eq!(universe.class_of(result), universe.core.message_class);
    let selector = universe.heap.fetch_pointer(result, message::SELECTOR);
    assert_eq!(universe.string_value(selector).as_deref(), Some("frobnicate:"));
    let arguments = universe.heap.fetch_pointer(result, message::ARGUMENTS);
    assert_eq!(universe.heap.indexable_len(arguments), 1);
    assert_eq!(universe.heap.fetch_element(arguments, 0), int(4));
}

#[rstest]
fn explicit_does_not_understand_with_a_non_message_is_fatal(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let err = interpreter.send_message(&mut universe, nil, "doesNotUnderstand:", &[int(5)]).unwrap_err();
    assert!(format!("{err:#}").contains("nil does not understand #doesNotUnderstand:"), "{err:#}");
}

#[rstest]
fn temporaries_stop_at_the_declared_count(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    // The slot above the (absent) temporaries is the operand stack, holding 7.
    let method = MethodBuilder::new(0)
        .push_integer(7)
        .push_temp(0)
        .return_top()
        .build(&mut universe, &mut interpreter, nil)
        .unwrap();
    let err = interpreter.execute(&mut universe, nil, method, &[]).unwrap_err();
    assert!(format!("{err:#}").contains("temporary 0 out of range"), "{err:#}");
}

#[test]
fn instances_too_large_for_the_heap_fail_the_primitive() {
    let max_bytes = 4 * 1024 * 1024;
    let config = UniverseConfig {
        heap: HeapConfig {
            max_bytes,
            collection_threshold: 64 * 1024 * 1024,
            ..HeapConfig::default()
        },
        ..UniverseConfig::default()
    };
    let (mut universe, mut interpreter) = Universe::bootstrap(config).unwrap();
    let array = universe.core.array_class;

    // Garbage up to three quarters of the reservation: the next request only fits once it is gone.
    while universe.heap.used_bytes() < 3 * 1024 * 1024 {
        universe.new_array(&mut interpreter, 10_000);
    }
    let collections = universe.gc_stats().collections;
    let big = interpreter.send_message(&mut universe, array, "new:", &[int(200_000)]).unwrap();
    assert!(universe.gc_stats().collections > collections);
    assert_eq!(universe.heap.indexable_len(big), 200_000);

    // Header, count word and elements together are one word more than the reservation.
    let array = universe.core.array_class;
    let too_many = (max_bytes / 8 - 2) as i64;
    let err = interpreter.send_message(&mut universe, array, "new:", &[int(too_many)]).unwrap_err();
    assert!(format!("{err:#}").contains("primitiveFailed"), "{err:#}");

    let array = universe.core.array_class;
    let small = interpreter.send_message(&mut universe, array, "new:", &[int(10)]).unwrap();
    assert_eq!(universe.heap.indexable_len(small), 10);
}

#[rstest]
fn block_value_returns_to_its_caller(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    // ^10 + [3 + 4] value
    let mut builder = MethodBuilder::new(0);
    builder.push_integer(10);
    builder.block(0, |b| {
        b.push_integer(3).push_integer(4).send("+", 1).block_return();
    });
    builder.send("value", 0).send("+", 1).return_top();
    let method = builder.build(&mut universe, &mut interpreter, nil).unwrap();

    let result = interpreter.execute(&mut universe, nil, method, &[]).unwrap();
    assert_eq!(result, int(17));
    assert!(interpreter.active_context().is_null());
}

#[rstest]
fn blocks_see_and_update_their_home_temporaries(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    // | count | count := 0. 5 timesRepeat: [count := count + 2]. ^count
    let mut builder = MethodBuilder::new(0);
    builder.temporaries(1).push_integer(0).pop_into_temp(0);
    builder.push_integer(5).block(0, |b| {
        b.push_temp(0).push_integer(2).send("+", 1).dup().pop_into_temp(0).block_return();
    });
    builder.send("timesRepeat:", 1).pop().push_temp(0).return_top();
    let method = builder.build(&mut universe, &mut interpreter, nil).unwrap();

    assert_eq!(interpreter.execute(&mut universe, nil, method, &[]).unwrap(), int(10));
}

#[rstest]
fn value_with_arguments_spreads_the_array(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    // | a b | ^[:x :y | a := x. b := y. a - b] valueWithArguments: #(10 3)
    let mut builder = MethodBuilder::new(0);
    builder.temporaries(2);
    builder.block(2, |b| {
        b.pop_into_temp(1).pop_into_temp(0).push_temp(0).push_temp(1).send("-", 1).block_return();
    });
    builder.push_global("Array").push_integer(2).send("new:", 1);
    builder.dup().push_integer(1).push_integer(10).send("at:put:", 2).pop();
    builder.dup().push_integer(2).push_integer(3).send("at:put:", 2).pop();
    builder.send("valueWithArguments:", 1).return_top();
    let method = builder.build(&mut universe, &mut interpreter, nil).unwrap();

    assert_eq!(interpreter.execute(&mut universe, nil, method, &[]).unwrap(), int(7));
}

#[rstest]
fn value_with_too_few_arguments_fails(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let mut builder = MethodBuilder::new(0);
    builder.block(2, |b| {
        b.pop().block_return();
    });
    builder.push_global("Array").push_integer(1).send("new:", 1);
    builder.send("valueWithArguments:", 1).return_top();
    let method = builder.build(&mut universe, &mut interpreter, nil).unwrap();

    assert!(interpreter.execute(&mut universe, nil, method, &[]).is_err());
}

#[rstest]
fn non_local_return_leaves_the_loop(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let result = bluebook_interpreter::demos::run(&mut universe, &mut interpreter, "escape", 50).unwrap();
    assert_eq!(result, int(8));
}

/// `Escaper>>makeBlock` answers `[^42]`, whose home has returned by the time it runs.
fn escaper(universe: &mut Universe, interpreter: &mut Interpreter) -> Oop {
    let object = universe.core.object_class;
    let class = define_class(universe, interpreter, "Escaper", object);
    let base = universe.remappable_len();
    universe.push_remappable(class);

    let mut make_block = MethodBuilder::new(0);
    make_block.block(0, |b| {
        b.push_integer(42).return_top();
    });
    make_block.return_top();
    install(universe, interpreter, class, "makeBlock", &mut make_block);

    let class = universe.remappable(base);
    install(universe, interpreter, class, "run", MethodBuilder::new(0).push_self().send("makeBlock", 0).send("value", 0).return_top());
    let class = universe.pop_remappable();
    universe.instantiate(interpreter, class, 0).unwrap()
}

#[rstest]
fn escaped_block_is_reported_to_the_receiver(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let receiver = escaper(&mut universe, &mut interpreter);
    universe.push_remappable(receiver);
    let class = universe.class_of(receiver);
    // escapedBlock: aBlock  ^aBlock class == BlockContext ifTrue: [7] ifFalse: [0]
    let mut handler = MethodBuilder::new(1);
    handler.push_temp(0).send("class", 0).push_global("BlockContext").send("==", 1);
    handler.if_true_if_false(
        |b| {
            b.push_integer(7);
        },
        |b| {
            b.push_integer(0);
        },
    );
    handler.return_top();
    install(&mut universe, &mut interpreter, class, "escapedBlock:", &mut handler);
    let receiver = universe.pop_remappable();

    assert_eq!(interpreter.send_message(&mut universe, receiver, "run", &[]).unwrap(), int(7));
}

#[rstest]
fn escaped_block_without_handler_is_fatal(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let receiver = escaper(&mut universe, &mut interpreter);
    let err = interpreter.send_message(&mut universe, receiver, "run", &[]).unwrap_err();
    assert!(format!("{err:#}").contains("escapedBlock:"), "{err:#}");
}

#[rstest]
fn return_self_methods_allocate_nothing(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let object = universe.core.object_class;
    install(&mut universe, &mut interpreter, object, "itself", MethodBuilder::new(0).push_self().return_top());
    let method = MethodBuilder::new(0)
        .push_integer(5)
        .send("yourself", 0)
        .send("itself", 0)
        .return_top()
        .build(&mut universe, &mut interpreter, nil)
        .unwrap();
    interpreter.start(&mut universe, nil, method, &[]).unwrap();
    interpreter.step(&mut universe).unwrap();

    let before = universe.gc_stats().allocations;
    interpreter.step(&mut universe).unwrap();
    assert_eq!(universe.gc_stats().allocations, before, "a trivial method allocated");
    assert_eq!(interpreter.stack_top(&universe.heap), int(5));

    // An ordinary method needs a context.
    interpreter.step(&mut universe).unwrap();
    assert_eq!(universe.gc_stats().allocations, before + 1);
}

#[rstest]
fn flagged_accessors_answer_fields(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let key = universe.intern(&mut interpreter, "answer");
    let association = universe.new_association(&mut interpreter, key, int(42));
    universe.push_remappable(association);
    let value = interpreter.send_message(&mut universe, association, "value", &[]).unwrap();
    assert_eq!(value, int(42));
    let association = universe.pop_remappable();
    let key = interpreter.send_message(&mut universe, association, "key", &[]).unwrap();
    assert_eq!(universe.string_value(key).as_deref(), Some("answer"));

    let nil = universe.core.nil;
    assert_eq!(interpreter.send_message(&mut universe, nil, "isNil", &[]).unwrap(), universe.core.true_object);
    assert_eq!(interpreter.send_message(&mut universe, int(1), "notNil", &[]).unwrap(), universe.core.true_object);
}

#[rstest]
fn super_sends_start_above_the_method_class(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let object = universe.core.object_class;
    let base = define_class(&mut universe, &mut interpreter, "Base", object);
    universe.push_remappable(base);
    install(&mut universe, &mut interpreter, base, "answer", MethodBuilder::new(0).push_integer(1).return_top());
    let base = universe.pop_remappable();
    let derived = define_class(&mut universe, &mut interpreter, "Derived", base);
    universe.push_remappable(derived);
    install(
        &mut universe,
        &mut interpreter,
        derived,
        "answer",
        MethodBuilder::new(0).push_self().super_send("answer", 0).push_integer(10).send("+", 1).return_top(),
    );
    let derived = universe.pop_remappable();

    let instance = universe.instantiate(&mut interpreter, derived, 0).unwrap();
    assert_eq!(interpreter.send_message(&mut universe, instance, "answer", &[]).unwrap(), int(11));
}

#[rstest]
fn non_boolean_condition_sends_must_be_boolean(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let mut builder = MethodBuilder::new(0);
    let skip = builder.new_label();
    builder.push_integer(3).jump_if_false(skip).push_integer(1).return_top();
    builder.bind(skip).push_integer(2).return_top();
    let method = builder.build(&mut universe, &mut interpreter, nil).unwrap();

    universe.push_remappable(method);
    let err = interpreter.execute(&mut universe, nil, method, &[]).unwrap_err();
    assert!(format!("{err:#}").contains("mustBeBoolean"), "{err:#}");

    // mustBeBoolean  Offender := self. ^true
    let object = universe.core.object_class;
    install(&mut universe, &mut interpreter, object, "mustBeBoolean", MethodBuilder::new(0).push_self().pop_into_global("Offender").return_true());
    let method = universe.pop_remappable();
    assert_eq!(interpreter.execute(&mut universe, nil, method, &[]).unwrap(), int(1));
    assert_eq!(universe.global("Offender"), Some(int(3)));
}

#[rstest]
fn exit_unwinds_every_activation(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let object = universe.core.object_class;
    // bailOut: value  System exit: value. ^0
    install(
        &mut universe,
        &mut interpreter,
        object,
        "bailOut:",
        MethodBuilder::new(1).push_global("System").push_temp(0).send("exit:", 1).pop().push_integer(0).return_top(),
    );
    let method = MethodBuilder::new(0)
        .push_self()
        .push_literal(Literal::Integer(BigInt::from(99)))
        .send("bailOut:", 1)
        .push_integer(1)
        .send("+", 1)
        .return_top()
        .build(&mut universe, &mut interpreter, nil)
        .unwrap();

    assert_eq!(interpreter.execute(&mut universe, nil, method, &[]).unwrap(), int(99));
    assert!(interpreter.active_context().is_null());
}

#[rstest]
fn literals_of_every_kind(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let huge: BigInt = "123456789012345678901234567890".parse().unwrap();
    let cases = [
        (Literal::Integer(huge.clone()), format!("{huge}")),
        (Literal::Character('x'), String::from("$x")),
        (Literal::Float(2.5), String::from("2.5")),
        (Literal::String(String::from("hello")), String::from("'hello'")),
        (Literal::Symbol(String::from("at:put:")), String::from("#at:put:")),
        (Literal::True, String::from("true")),
    ];
    for (literal, expected) in cases {
        let method = MethodBuilder::new(0)
            .push_literal(literal)
            .return_top()
            .build(&mut universe, &mut interpreter, nil)
            .unwrap();
        let result = interpreter.execute(&mut universe, nil, method, &[]).unwrap();
        assert_eq!(universe.describe(result), expected);
    }
}

#[rstest]
fn print_string_of_integers_and_floats(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let printed = interpreter.send_message(&mut universe, int(-42), "printString", &[]).unwrap();
    assert_eq!(universe.string_value(printed).as_deref(), Some("-42"));

    let float = universe.new_float(&mut interpreter, 0.5);
    let printed = interpreter.send_message(&mut universe, float, "printString", &[]).unwrap();
    assert_eq!(universe.string_value(printed).as_deref(), Some("0.5"));
}

#[rstest]
fn strings_answer_characters(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let string = universe.new_string(&mut interpreter, "abc");
    universe.push_remappable(string);
    assert_eq!(interpreter.send_message(&mut universe, string, "size", &[]).unwrap(), int(3));
    let string = universe.remappable(universe.remappable_len() - 1);
    let second = interpreter.send_message(&mut universe, string, "at:", &[int(2)]).unwrap();
    assert_eq!(second, Oop::from_char('b'));

    let string = universe.pop_remappable();
    assert!(interpreter.send_message(&mut universe, string, "at:", &[int(4)]).is_err());
}
