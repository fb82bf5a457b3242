use bluebook_gc::HeapConfig;
use bluebook_interpreter::builder::{Literal, MethodBuilder};
use bluebook_interpreter::demos;
use bluebook_interpreter::interpreter::Interpreter;
use bluebook_interpreter::universe::{Universe, UniverseConfig};
use bluebook_interpreter::vm_objects::class;
use bluebook_value::Oop;
use rstest::{fixture, rstest};

fn stressed() -> UniverseConfig {
    UniverseConfig {
        heap: HeapConfig {
            stress: true,
            ..HeapConfig::default()
        },
        ..UniverseConfig::default()
    }
}

fn small_threshold() -> UniverseConfig {
    UniverseConfig {
        heap: HeapConfig {
            collection_threshold: 16 * 1024,
            ..HeapConfig::default()
        },
        ..UniverseConfig::default()
    }
}

#[fixture]
fn stressed_vm() -> (Universe, Interpreter) {
    Universe::bootstrap(stressed()).expect("could not bootstrap a test universe")
}

/// `Object>>pairWith: other` answers `{self. other}`, allocating before it reads its argument.
fn install_pair_with(universe: &mut Universe, interpreter: &mut Interpreter) {
    let (other, pair) = (0, 1);
    let mut builder = MethodBuilder::new(1);
    builder.temporaries(1);
    builder.push_global("Array").push_integer(2).send("new:", 1).pop_into_temp(pair);
    builder.push_temp(pair).push_integer(1).push_self().send("at:put:", 2).pop();
    builder.push_temp(pair).push_integer(2).push_temp(other).send("at:put:", 2).pop();
    builder.push_temp(pair).return_top();
    let object = universe.core.object_class;
    builder.install(universe, interpreter, object, "pairWith:").unwrap();
}

#[rstest]
fn collection_during_argument_evaluation_keeps_the_pending_receiver(stressed_vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = stressed_vm;
    install_pair_with(&mut universe, &mut interpreter);
    let nil = universe.core.nil;

    // ^(Array new: 2) pairWith: (Array new: 3)
    let method = MethodBuilder::new(0)
        .push_global("Array")
        .push_integer(2)
        .send("new:", 1)
        .push_global("Array")
        .push_literal(Literal::Integer(3.into()))
        .send("new:", 1)
        .send("pairWith:", 1)
        .return_top()
        .build(&mut universe, &mut interpreter, nil)
        .unwrap();

    let collections = universe.gc_stats().collections;
    let pair = interpreter.execute(&mut universe, nil, method, &[]).unwrap();
    assert!(universe.gc_stats().collections > collections);

    let heap = &universe.heap;
    let array = universe.core.array_class;
    assert_eq!(heap.class_of(pair), array);
    let (first, second) = (heap.fetch_element(pair, 0), heap.fetch_element(pair, 1));
    assert_eq!(heap.class_of(first), array);
    assert_eq!(heap.indexable_len(first), 2);
    assert_eq!(heap.class_of(second), array);
    assert_eq!(heap.indexable_len(second), 3);
    assert_ne!(first, second);
    heap.verify().unwrap();
}

#[rstest]
fn collections_inside_sends_keep_the_stack_intact(stressed_vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = stressed_vm;
    let nil = universe.core.nil;
    // | keep | keep := 'kept'. ^(keep size) + ((Array new: 4) size) + (keep size)
    let mut builder = MethodBuilder::new(0);
    builder.temporaries(1);
    builder.push_literal(Literal::String(String::from("kept"))).pop_into_temp(0);
    builder.push_temp(0).send("size", 0);
    builder.push_global("Array").push_integer(4).send("new:", 1).send("size", 0).send("+", 1);
    builder.push_temp(0).send("size", 0).send("+", 1).return_top();
    let method = builder.build(&mut universe, &mut interpreter, nil).unwrap();

    assert_eq!(interpreter.execute(&mut universe, nil, method, &[]).unwrap(), Oop::from_small_integer(12));
}

#[rstest]
#[case("fib", 15, "610")]
#[case("factorial", 25, "15511210043330985984000000")]
#[case("squares", 10, "385")]
#[case("churn", 50, "50")]
#[case("escape", 30, "6")]
fn demos_survive_stress_collection(stressed_vm: (Universe, Interpreter), #[case] name: &str, #[case] argument: i64, #[case] expected: &str) {
    let (mut universe, mut interpreter) = stressed_vm;
    let result = demos::run(&mut universe, &mut interpreter, name, argument).unwrap();
    assert_eq!(universe.describe(result), expected);
    universe.heap.verify().unwrap();
}

#[test]
fn churn_reclaims_garbage() {
    let (mut universe, mut interpreter) = Universe::bootstrap(small_threshold()).unwrap();
    let result = demos::run(&mut universe, &mut interpreter, "churn", 5000).unwrap();
    assert_eq!(result, Oop::from_small_integer(5000));

    let stats = universe.gc_stats();
    assert!(stats.collections > 0);
    assert!(stats.reclaimed_bytes > 0);
    assert!(universe.heap.used_bytes() < stats.allocated_bytes);
    assert!(interpreter.context_pool().reused() > 0);
}

#[test]
fn full_gc_primitive_answers_reclaimed_bytes() {
    let (mut universe, mut interpreter) = Universe::bootstrap(UniverseConfig::default()).unwrap();
    for _ in 0..10 {
        universe.new_array(&mut interpreter, 100);
    }
    let system = universe.global("System").unwrap();
    let reclaimed = interpreter.send_message(&mut universe, system, "fullGC", &[]).unwrap();
    assert!(reclaimed.is_small_integer());
    assert!(reclaimed.as_small_integer() >= 10 * 100 * 8);
}

#[rstest]
fn method_cache_agrees_with_the_class_chain(stressed_vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = stressed_vm;
    demos::run(&mut universe, &mut interpreter, "fib", 10).unwrap();

    let core = &universe.core;
    let pairs = [
        (core.small_integer_class, "+"),
        (core.small_integer_class, "fib"),
        (core.large_integer_class, "+"),
        (core.integer_class, "to:do:"),
        (core.array_class, "at:"),
        (core.array_class, "yourself"),
        (core.block_context_class, "value:"),
        (core.array_class, "fib"),
    ];
    let pairs: Vec<(Oop, Oop)> = pairs
        .iter()
        .map(|&(class, name)| (class, universe.symbol(name).unwrap()))
        .collect();

    for round in 0..3 {
        for &(class, selector) in &pairs {
            let uncached = class::lookup_method(&universe.heap, class, selector);
            // Twice: once filling the cache, once hitting it.
            assert_eq!(interpreter.lookup(&universe, class, selector), uncached, "round {round}");
            assert_eq!(interpreter.lookup(&universe, class, selector), uncached, "round {round}");
        }
        if round == 1 {
            interpreter.flush_method_cache();
        }
    }
    assert!(interpreter.method_cache().hits() > 0);

    // Redefining a method is seen at once.
    let integer = universe.core.integer_class;
    MethodBuilder::new(0)
        .push_integer(0)
        .return_top()
        .install(&mut universe, &mut interpreter, integer, "fib")
        .unwrap();
    let result = interpreter.send_message(&mut universe, Oop::from_small_integer(10), "fib", &[]).unwrap();
    assert_eq!(result, Oop::ZERO);
}

#[rstest]
fn identity_hashes_survive_collections(stressed_vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = stressed_vm;
    let array = universe.new_array(&mut interpreter, 3);
    universe.push_remappable(array);
    let hash = interpreter.send_message(&mut universe, array, "identityHash", &[]).unwrap();
    for _ in 0..3 {
        universe.new_array(&mut interpreter, 10);
        universe.collect_garbage(&mut interpreter);
    }
    let array = universe.pop_remappable();
    assert_eq!(interpreter.send_message(&mut universe, array, "identityHash", &[]).unwrap(), hash);
}
