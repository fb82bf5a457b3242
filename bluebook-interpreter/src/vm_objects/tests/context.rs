use bluebook_gc::ObjectFormat;
use bluebook_value::Oop;
use rstest::{fixture, rstest};

use crate::interpreter::Interpreter;
use crate::universe::{Universe, UniverseConfig};
use crate::vm_objects::context::{self, ContextPool};

#[fixture]
fn vm() -> (Universe, Interpreter) {
    Universe::bootstrap(UniverseConfig::default()).expect("could not bootstrap a test universe")
}

fn method_context(universe: &mut Universe, interpreter: &mut Interpreter, sender: Oop, frame_size: usize) -> Oop {
    let class = universe.core.method_context_class;
    let context = universe.allocate(interpreter, class, ObjectFormat::Context, context::FIXED_FIELDS, frame_size);
    let heap = &mut universe.heap;
    heap.store_pointer(context, context::SENDER, sender);
    heap.store_pointer(context, context::PC, Oop::ZERO);
    heap.store_pointer(context, context::SP, Oop::ZERO);
    heap.store_pointer(context, context::RECEIVER, Oop::from_small_integer(42));
    context
}

#[rstest]
fn sender_chain(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let bottom = method_context(&mut universe, &mut interpreter, nil, 16);
    let middle = method_context(&mut universe, &mut interpreter, bottom, 16);
    let top = method_context(&mut universe, &mut interpreter, middle, 16);

    let heap = &universe.heap;
    assert_eq!(context::sender(heap, top), middle);
    assert!(context::has_sender(heap, top, bottom));
    assert!(context::has_sender(heap, top, middle));
    assert!(!context::has_sender(heap, top, top));
    assert!(!context::has_sender(heap, bottom, top));
}

#[rstest]
fn killed_context_is_dead(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let bottom = method_context(&mut universe, &mut interpreter, nil, 16);
    let top = method_context(&mut universe, &mut interpreter, bottom, 16);
    assert!(!context::is_dead(&universe.heap, top));

    context::kill(&mut universe.heap, top);
    assert!(context::is_dead(&universe.heap, top));
    assert_eq!(context::sender(&universe.heap, top), nil);
    assert_eq!(context::pc(&universe.heap, top), None);
    assert!(!context::has_sender(&universe.heap, top, bottom));
}

#[rstest]
fn blocks_work_on_their_home(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let home = method_context(&mut universe, &mut interpreter, nil, 16);

    let class = universe.core.block_context_class;
    let block = universe.allocate(&mut interpreter, class, ObjectFormat::Context, context::FIXED_FIELDS, 4);
    let heap = &mut universe.heap;
    heap.store_pointer(block, context::BLOCK_ARG_COUNT, Oop::from_small_integer(1));
    heap.store_pointer(block, context::INITIAL_PC, Oop::from_small_integer(7));
    heap.store_pointer(block, context::HOME, home);

    assert!(context::is_block_context(heap, block));
    assert!(!context::is_block_context(heap, home));
    assert_eq!(context::home(heap, block), home);
    assert_eq!(context::home(heap, home), home);
    assert_eq!(context::receiver(heap, block), Oop::from_small_integer(42));
    assert_eq!(context::block_arg_count(heap, block), 1);
    assert_eq!(context::initial_pc(heap, block), 7);
    assert_eq!(context::frame_size(heap, block), 4);
}

#[rstest]
fn stack_reads_bottom_first(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let context = method_context(&mut universe, &mut interpreter, nil, 16);
    let heap = &mut universe.heap;
    for index in 0..3 {
        heap.store_element(context, index, Oop::from_small_integer(index as i64 + 10));
    }
    heap.store_pointer(context, context::SP, Oop::from_small_integer(3));

    let expected: Vec<Oop> = (10..13).map(Oop::from_small_integer).collect();
    assert_eq!(context::stack(heap, context), expected);
}

#[rstest]
#[case(0, ContextPool::SMALL_FRAME)]
#[case(16, ContextPool::SMALL_FRAME)]
#[case(17, ContextPool::LARGE_FRAME)]
#[case(64, ContextPool::LARGE_FRAME)]
#[case(65, 65)]
fn frame_sizes(#[case] needed: usize, #[case] expected: usize) {
    assert_eq!(ContextPool::frame_size_for(needed), expected);
}

#[rstest]
fn pool_reuses_returned_contexts(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let small = method_context(&mut universe, &mut interpreter, nil, ContextPool::SMALL_FRAME);
    let large = method_context(&mut universe, &mut interpreter, nil, ContextPool::LARGE_FRAME);

    let mut pool = ContextPool::default();
    pool.recycle(&universe.heap, small);
    pool.recycle(&universe.heap, large);
    assert_eq!(pool.len(), 2);

    assert_eq!(pool.take(ContextPool::SMALL_FRAME), Some(small));
    assert_eq!(pool.take(ContextPool::SMALL_FRAME), None);
    assert_eq!(pool.take(ContextPool::LARGE_FRAME), Some(large));
    assert_eq!(pool.reused(), 2);
    assert!(pool.is_empty());
}

#[rstest]
fn pool_skips_captured_and_odd_sized_contexts(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let captured = method_context(&mut universe, &mut interpreter, nil, ContextPool::SMALL_FRAME);
    universe.heap.set_captured(captured, true);
    let odd = method_context(&mut universe, &mut interpreter, nil, 20);

    let mut pool = ContextPool::default();
    pool.recycle(&universe.heap, captured);
    pool.recycle(&universe.heap, odd);
    assert!(pool.is_empty());
    assert_eq!(pool.take(20), None);
}

#[rstest]
fn clearing_the_pool_forgets_everything(vm: (Universe, Interpreter)) {
    let (mut universe, mut interpreter) = vm;
    let nil = universe.core.nil;
    let mut pool = ContextPool::default();
    for _ in 0..3 {
        let context = method_context(&mut universe, &mut interpreter, nil, ContextPool::SMALL_FRAME);
        pool.recycle(&universe.heap, context);
    }
    assert_eq!(pool.len(), 3);
    pool.clear();
    assert_eq!(pool.take(ContextPool::SMALL_FRAME), None);
}
