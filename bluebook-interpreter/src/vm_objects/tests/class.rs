use bluebook_gc::ObjectFormat;
use bluebook_value::Oop;
use rstest::{fixture, rstest};

use crate::builder::MethodBuilder;
use crate::interpreter::Interpreter;
use crate::universe::{Universe, UniverseConfig};
use crate::vm_objects::class::{self, method_dictionary, InstanceSpec};

#[fixture]
fn vm() -> (Universe, Interpreter) {
    Universe::bootstrap(UniverseConfig::default()).expect("could not bootstrap a test universe")
}

#[rstest]
#[case(ObjectFormat::Plain, 0)]
#[case(ObjectFormat::Array, 2)]
#[case(ObjectFormat::Context, 6)]
fn instance_specs_survive_the_class_field(#[case] format: ObjectFormat, #[case] fixed_fields: usize) {
    let spec = InstanceSpec::new(format, fixed_fields);
    assert_eq!(InstanceSpec::from_oop(spec.to_oop()), Some(spec));
}

#[test]
fn non_integer_instance_spec_is_rejected() {
    assert_eq!(InstanceSpec::from_oop(Oop::from_char('a')), None);
}

#[rstest]
fn dictionary_insert_and_lookup(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let dictionary = universe.new_method_dictionary(&mut interpreter, method_dictionary::MIN_CAPACITY);
    universe.push_remappable(dictionary);
    let selectors: Vec<Oop> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|name| universe.intern(&mut interpreter, name))
        .collect();
    let dictionary = universe.pop_remappable();

    let heap = &mut universe.heap;
    for (index, selector) in selectors.iter().enumerate() {
        method_dictionary::insert(heap, dictionary, *selector, Oop::from_small_integer(index as i64));
    }
    assert_eq!(method_dictionary::tally(heap, dictionary), 3);
    assert_eq!(method_dictionary::lookup(heap, dictionary, selectors[1]), Some(Oop::from_small_integer(1)));

    method_dictionary::insert(heap, dictionary, selectors[1], Oop::from_small_integer(99));
    assert_eq!(method_dictionary::tally(heap, dictionary), 3);
    assert_eq!(method_dictionary::lookup(heap, dictionary, selectors[1]), Some(Oop::from_small_integer(99)));
    assert_eq!(method_dictionary::entries(heap, dictionary).len(), 3);

    let missing = universe.core.special_selectors[0];
    assert_eq!(method_dictionary::lookup(&universe.heap, dictionary, missing), None);
}

#[rstest]
fn dictionary_fills_at_three_quarters(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let dictionary = universe.new_method_dictionary(&mut interpreter, 8);
    universe.push_remappable(dictionary);
    let selectors: Vec<Oop> = (0..6).map(|i| universe.intern(&mut interpreter, &format!("s{i}"))).collect();
    let dictionary = universe.pop_remappable();

    let heap = &mut universe.heap;
    for selector in &selectors[..5] {
        method_dictionary::insert(heap, dictionary, *selector, Oop::ZERO);
    }
    assert!(!method_dictionary::is_full(heap, dictionary));
    method_dictionary::insert(heap, dictionary, selectors[5], Oop::ZERO);
    assert!(method_dictionary::is_full(heap, dictionary));
}

#[rstest]
fn installing_many_methods_grows_the_dictionary(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let object = universe.core.object_class;
    let class = universe.define_class(&mut interpreter, "Grower", object, InstanceSpec::new(ObjectFormat::Plain, 0));
    let base = universe.remappable_len();
    universe.push_remappable(class);
    for index in 0..20 {
        let class = universe.remappable(base);
        MethodBuilder::new(0)
            .push_integer(index)
            .return_top()
            .install(&mut universe, &mut interpreter, class, &format!("answer{index}"))
            .expect("could not install a test method");
    }
    let class = universe.pop_remappable();

    let dictionary = class::method_dictionary(&universe.heap, class);
    assert!(method_dictionary::capacity(&universe.heap, dictionary) >= 32);
    assert_eq!(method_dictionary::tally(&universe.heap, dictionary), 20);
    let selector = universe.symbol("answer13").expect("selector was interned");
    assert!(universe.lookup_method(class, selector).is_some());
}

#[rstest]
fn lookup_walks_the_superclass_chain(vm: (Universe, Interpreter)) {
    let (universe, _interpreter) = vm;
    let core = &universe.core;
    let heap = &universe.heap;
    let yourself = universe.symbol("yourself").expect("kernel selector");
    let on_object = class::lookup_method(heap, core.object_class, yourself);
    assert!(on_object.is_some());
    assert_eq!(class::lookup_method(heap, core.small_integer_class, yourself), on_object);

    let plus = universe.symbol("+").expect("kernel selector");
    assert_eq!(class::lookup_method(heap, core.object_class, plus), None);

    assert!(class::inherits_from(heap, core.symbol_class, core.collection_class));
    assert!(class::inherits_from(heap, core.true_class, core.true_class));
    assert!(!class::inherits_from(heap, core.object_class, core.true_class));
}
