use anyhow::{bail, Error};
use bluebook_core::bytecode::SPECIAL_SELECTORS;
use bluebook_gc::{GcStats, Heap, HeapConfig, ObjectFormat, RootProvider};
use bluebook_value::{Oop, Tag};
use indexmap::IndexMap;
use log::debug;
use num_bigint::BigInt;
use num_traits::ToPrimitive;

use crate::interpreter::Interpreter;
use crate::method_cache::MethodCache;
use crate::vm_objects::class::{self, method_dictionary};
use crate::vm_objects::{association, context};

/// Settings of a virtual machine instance.
#[derive(Debug, Clone)]
pub struct UniverseConfig {
    pub heap: HeapConfig,
    /// Entries of the method lookup cache. Must be a power of two.
    pub method_cache_size: usize,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            heap: HeapConfig::default(),
            method_cache_size: MethodCache::DEFAULT_SIZE,
        }
    }
}

impl UniverseConfig {
    pub fn validate(&self) -> Result<(), Error> {
        self.heap.validate()?;
        if !self.method_cache_size.is_power_of_two() {
            bail!("method cache size must be a power of two, got {}", self.method_cache_size);
        }
        Ok(())
    }
}

/// The objects of the system the virtual machine refers to directly.
///
/// This keeps a reference to them even if user code rebinds the globals naming them. Every
/// field is a root.
#[derive(Debug)]
pub struct CoreObjects {
    pub nil: Oop,
    pub true_object: Oop,
    pub false_object: Oop,

    /// The **Object** class.
    pub object_class: Oop,
    /// The **Behavior** class, where `new` and `new:` live.
    pub behavior_class: Oop,
    /// The **Class** class.
    pub class_class: Oop,
    /// The **Metaclass** class.
    pub metaclass_class: Oop,
    pub undefined_object_class: Oop,
    pub boolean_class: Oop,
    pub true_class: Oop,
    pub false_class: Oop,
    pub magnitude_class: Oop,
    pub character_class: Oop,
    pub number_class: Oop,
    pub integer_class: Oop,
    pub small_integer_class: Oop,
    pub large_integer_class: Oop,
    pub float_class: Oop,
    pub collection_class: Oop,
    pub array_class: Oop,
    pub byte_array_class: Oop,
    pub string_class: Oop,
    pub symbol_class: Oop,
    pub word_array_class: Oop,
    pub float_array_class: Oop,
    pub method_dictionary_class: Oop,
    pub association_class: Oop,
    pub message_class: Oop,
    pub compiled_method_class: Oop,
    pub method_context_class: Oop,
    pub block_context_class: Oop,
    pub system_class: Oop,

    /// Selectors of the single-byte send opcodes, in opcode order.
    pub special_selectors: [Oop; SPECIAL_SELECTORS.len()],
    pub does_not_understand_selector: Oop,
    pub escaped_block_selector: Oop,
    pub must_be_boolean_selector: Oop,
}

impl Default for CoreObjects {
    fn default() -> Self {
        Self {
            nil: Oop::NULL,
            true_object: Oop::NULL,
            false_object: Oop::NULL,
            object_class: Oop::NULL,
            behavior_class: Oop::NULL,
            class_class: Oop::NULL,
            metaclass_class: Oop::NULL,
            undefined_object_class: Oop::NULL,
            boolean_class: Oop::NULL,
            true_class: Oop::NULL,
            false_class: Oop::NULL,
            magnitude_class: Oop::NULL,
            character_class: Oop::NULL,
            number_class: Oop::NULL,
            integer_class: Oop::NULL,
            small_integer_class: Oop::NULL,
            large_integer_class: Oop::NULL,
            float_class: Oop::NULL,
            collection_class: Oop::NULL,
            array_class: Oop::NULL,
            byte_array_class: Oop::NULL,
            string_class: Oop::NULL,
            symbol_class: Oop::NULL,
            word_array_class: Oop::NULL,
            float_array_class: Oop::NULL,
            method_dictionary_class: Oop::NULL,
            association_class: Oop::NULL,
            message_class: Oop::NULL,
            compiled_method_class: Oop::NULL,
            method_context_class: Oop::NULL,
            block_context_class: Oop::NULL,
            system_class: Oop::NULL,
            special_selectors: [Oop::NULL; SPECIAL_SELECTORS.len()],
            does_not_understand_selector: Oop::NULL,
            escaped_block_selector: Oop::NULL,
            must_be_boolean_selector: Oop::NULL,
        }
    }
}

impl CoreObjects {
    fn visit(&mut self, visitor: &mut dyn FnMut(&mut Oop)) {
        let fields = [
            &mut self.nil,
            &mut self.true_object,
            &mut self.false_object,
            &mut self.object_class,
            &mut self.behavior_class,
            &mut self.class_class,
            &mut self.metaclass_class,
            &mut self.undefined_object_class,
            &mut self.boolean_class,
            &mut self.true_class,
            &mut self.false_class,
            &mut self.magnitude_class,
            &mut self.character_class,
            &mut self.number_class,
            &mut self.integer_class,
            &mut self.small_integer_class,
            &mut self.large_integer_class,
            &mut self.float_class,
            &mut self.collection_class,
            &mut self.array_class,
            &mut self.byte_array_class,
            &mut self.string_class,
            &mut self.symbol_class,
            &mut self.word_array_class,
            &mut self.float_array_class,
            &mut self.method_dictionary_class,
            &mut self.association_class,
            &mut self.message_class,
            &mut self.compiled_method_class,
            &mut self.method_context_class,
            &mut self.block_context_class,
            &mut self.system_class,
            &mut self.does_not_understand_selector,
            &mut self.escaped_block_selector,
            &mut self.must_be_boolean_selector,
        ];
        for field in fields {
            visitor(field);
        }
        self.special_selectors.iter_mut().for_each(visitor);
    }
}

/// The central data structure of a virtual machine instance.
///
/// It owns the heap and everything the heap is reached from besides the interpreter: the
/// well-known objects, the symbol table, the global bindings, and a stack of temporaries kept
/// alive across allocations.
pub struct Universe {
    pub heap: Heap,
    pub core: CoreObjects,
    /// Interned symbols, by name.
    pub(crate) symbols: IndexMap<String, Oop>,
    /// Global bindings: name to association.
    pub(crate) globals: IndexMap<String, Oop>,
    remappable: Vec<Oop>,
}

/// Everything the collector must see besides the heap itself.
struct VmRoots<'a> {
    interpreter: &'a mut Interpreter,
    core: &'a mut CoreObjects,
    symbols: &'a mut IndexMap<String, Oop>,
    globals: &'a mut IndexMap<String, Oop>,
    remappable: &'a mut Vec<Oop>,
}

impl RootProvider for VmRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Oop)) {
        self.interpreter.visit_registers(visitor);
        self.core.visit(visitor);
        self.symbols.values_mut().for_each(&mut *visitor);
        self.globals.values_mut().for_each(&mut *visitor);
        self.remappable.iter_mut().for_each(visitor);
    }
}

impl Universe {
    pub(crate) fn empty(heap: Heap) -> Self {
        Self {
            heap,
            core: CoreObjects::default(),
            symbols: IndexMap::new(),
            globals: IndexMap::new(),
            remappable: Vec::new(),
        }
    }

    pub fn gc_stats(&self) -> &GcStats {
        self.heap.stats()
    }

    // ----- allocation -----

    /// Allocates an object, collecting first when the threshold is crossed.
    ///
    /// Any reference held in a local across this call is stale afterwards unless it was pushed
    /// with [`Universe::push_remappable`]. The class is taken care of.
    pub fn allocate(&mut self, interpreter: &mut Interpreter, class: Oop, format: ObjectFormat, fixed_fields: usize, len: usize) -> Oop {
        let words = format.size_in_words(fixed_fields, len);
        let mut class = class;
        if self.heap.should_collect(words) {
            class = self.collect_keeping(interpreter, class);
        }
        if let Some(oop) = self.heap.try_allocate(class, format, fixed_fields, len) {
            return oop;
        }
        class = self.collect_keeping(interpreter, class);
        match self.heap.try_allocate(class, format, fixed_fields, len) {
            Some(oop) => oop,
            None => self.heap.reservation_exhausted(words),
        }
    }

    fn collect_keeping(&mut self, interpreter: &mut Interpreter, oop: Oop) -> Oop {
        self.push_remappable(oop);
        self.collect_garbage(interpreter);
        self.pop_remappable()
    }

    /// Runs a full collection. The interpreter's registers are written back to the active
    /// context beforehand and reloaded afterwards.
    ///
    /// Returns the number of bytes reclaimed.
    pub fn collect_garbage(&mut self, interpreter: &mut Interpreter) -> usize {
        interpreter.flush_registers(&mut self.heap);
        interpreter.contexts.clear();

        let Self {
            heap,
            core,
            symbols,
            globals,
            remappable,
        } = self;
        let reclaimed = heap.collect(&mut VmRoots {
            interpreter: &mut *interpreter,
            core,
            symbols,
            globals,
            remappable,
        });

        interpreter.flush_method_cache();
        interpreter.reload_registers(&self.heap);
        reclaimed
    }

    /// Creates an instance of `class` according to its instance specification, or `None` if
    /// the class cannot have instances with `len` indexable slots or the heap cannot hold one.
    pub fn instantiate(&mut self, interpreter: &mut Interpreter, class: Oop, len: usize) -> Option<Oop> {
        if !class.is_pointer() || self.heap.fixed_fields(class) < class::FIXED_FIELDS {
            return None;
        }
        let spec = class::instance_spec(&self.heap, class)?;
        if !spec.format.is_indexable() && len != 0 {
            return None;
        }
        // Sizes the reservation cannot hold, even once garbage is gone, answer `None` rather than
        // aborting the process.
        let words = spec.format.size_in_words(spec.fixed_fields, len);
        let mut class = class;
        if !self.heap.has_room_for(words) {
            class = self.collect_keeping(interpreter, class);
            if !self.heap.has_room_for(words) {
                return None;
            }
        }
        Some(self.allocate(interpreter, class, spec.format, spec.fixed_fields, len))
    }

    pub fn new_array(&mut self, interpreter: &mut Interpreter, len: usize) -> Oop {
        self.allocate(interpreter, self.core.array_class, ObjectFormat::Array, 0, len)
    }

    fn new_bytes(&mut self, interpreter: &mut Interpreter, class: Oop, bytes: &[u8]) -> Oop {
        let oop = self.allocate(interpreter, class, ObjectFormat::ByteArray, 0, bytes.len());
        self.heap.store_bytes(oop, bytes);
        oop
    }

    pub fn new_byte_array(&mut self, interpreter: &mut Interpreter, bytes: &[u8]) -> Oop {
        self.new_bytes(interpreter, self.core.byte_array_class, bytes)
    }

    pub fn new_string(&mut self, interpreter: &mut Interpreter, value: &str) -> Oop {
        self.new_bytes(interpreter, self.core.string_class, value.as_bytes())
    }

    pub fn new_float(&mut self, interpreter: &mut Interpreter, value: f64) -> Oop {
        let oop = self.allocate(interpreter, self.core.float_class, ObjectFormat::Float, 0, 0);
        self.heap.set_float_value(oop, value);
        oop
    }

    /// Answers a small integer when the value fits, a large integer otherwise.
    pub fn new_integer(&mut self, interpreter: &mut Interpreter, value: BigInt) -> Oop {
        if let Some(oop) = value.to_i64().and_then(Oop::try_from_small_integer) {
            return oop;
        }
        let oop = self.allocate(interpreter, self.core.large_integer_class, ObjectFormat::LargeInteger, 0, 0);
        self.heap.set_large_integer(oop, value);
        oop
    }

    pub fn new_association(&mut self, interpreter: &mut Interpreter, key: Oop, value: Oop) -> Oop {
        self.push_remappable(key);
        self.push_remappable(value);
        let oop = self.allocate(interpreter, self.core.association_class, ObjectFormat::Plain, association::FIXED_FIELDS, 0);
        let value = self.pop_remappable();
        let key = self.pop_remappable();
        self.heap.store_pointer(oop, association::KEY, key);
        self.heap.store_pointer(oop, association::VALUE, value);
        oop
    }

    /// An empty method dictionary with room for `capacity` entries (a power of two).
    pub fn new_method_dictionary(&mut self, interpreter: &mut Interpreter, capacity: usize) -> Oop {
        debug_assert!(capacity.is_power_of_two());
        let values = self.new_array(interpreter, capacity);
        self.push_remappable(values);
        let dictionary = self.allocate(
            interpreter,
            self.core.method_dictionary_class,
            ObjectFormat::Array,
            method_dictionary::FIXED_FIELDS,
            capacity,
        );
        let values = self.pop_remappable();
        self.heap.store_pointer(dictionary, method_dictionary::TALLY, Oop::ZERO);
        self.heap.store_pointer(dictionary, method_dictionary::VALUES, values);
        dictionary
    }

    // ----- remappable temporaries -----

    /// Keeps a reference alive, and up to date, across allocations.
    pub fn push_remappable(&mut self, oop: Oop) {
        self.remappable.push(oop);
    }

    pub fn pop_remappable(&mut self) -> Oop {
        match self.remappable.pop() {
            Some(oop) => oop,
            None => panic!("remappable stack underflow"),
        }
    }

    /// Reads a remappable temporary by its position from the bottom of the stack.
    pub fn remappable(&self, index: usize) -> Oop {
        self.remappable[index]
    }

    pub fn remappable_len(&self) -> usize {
        self.remappable.len()
    }

    pub fn truncate_remappable(&mut self, len: usize) {
        self.remappable.truncate(len);
    }

    // ----- symbols -----

    pub fn intern(&mut self, interpreter: &mut Interpreter, name: &str) -> Oop {
        if let Some(&symbol) = self.symbols.get(name) {
            return symbol;
        }
        let symbol = self.new_bytes(interpreter, self.core.symbol_class, name.as_bytes());
        self.symbols.insert(name.to_owned(), symbol);
        symbol
    }

    /// An already interned symbol.
    pub fn symbol(&self, name: &str) -> Option<Oop> {
        self.symbols.get(name).copied()
    }

    pub fn is_symbol(&self, oop: Oop) -> bool {
        oop.is_pointer() && self.heap.class_of(oop) == self.core.symbol_class
    }

    /// The text of a string or a symbol.
    pub fn string_value(&self, oop: Oop) -> Option<String> {
        if !oop.is_pointer() {
            return None;
        }
        let class = self.heap.class_of(oop);
        if class != self.core.string_class && class != self.core.symbol_class {
            return None;
        }
        Some(String::from_utf8_lossy(&self.heap.bytes(oop)).into_owned())
    }

    // ----- globals -----

    /// The association a global is bound through, created (bound to nil) if missing.
    pub fn global_association(&mut self, interpreter: &mut Interpreter, name: &str) -> Oop {
        if let Some(&association) = self.globals.get(name) {
            return association;
        }
        let key = self.intern(interpreter, name);
        let association = self.new_association(interpreter, key, self.core.nil);
        self.globals.insert(name.to_owned(), association);
        association
    }

    pub fn set_global(&mut self, interpreter: &mut Interpreter, name: &str, value: Oop) {
        self.push_remappable(value);
        let association = self.global_association(interpreter, name);
        let value = self.pop_remappable();
        self.heap.store_pointer(association, association::VALUE, value);
    }

    pub fn global(&self, name: &str) -> Option<Oop> {
        let association = self.globals.get(name)?;
        Some(self.heap.fetch_pointer(*association, association::VALUE))
    }

    pub fn has_global(&self, name: &str) -> bool {
        self.globals.contains_key(name)
    }

    // ----- classes -----

    pub fn class_of(&self, oop: Oop) -> Oop {
        match oop.tag() {
            Tag::SmallInteger => self.core.small_integer_class,
            Tag::Character => self.core.character_class,
            Tag::Pointer if oop.is_null() => self.core.undefined_object_class,
            Tag::Pointer => self.heap.class_of(oop),
            Tag::Marker => panic!("marker {oop:?} used as an object"),
        }
    }

    /// A class bound to a global of the same name.
    pub fn class_named(&self, name: &str) -> Option<Oop> {
        let class = self.global(name)?;
        self.is_class(class).then_some(class)
    }

    /// Whether an object is a class or a metaclass.
    pub fn is_class(&self, oop: Oop) -> bool {
        if !oop.is_pointer() || oop == self.core.nil {
            return false;
        }
        let class = self.heap.class_of(oop);
        class == self.core.metaclass_class || (class.is_pointer() && self.heap.class_of(class) == self.core.metaclass_class)
    }

    pub fn is_metaclass(&self, oop: Oop) -> bool {
        oop.is_pointer() && self.heap.class_of(oop) == self.core.metaclass_class
    }

    pub fn class_name(&self, class: Oop) -> String {
        if self.is_metaclass(class) {
            let instance = self.heap.fetch_pointer(class, class::THIS_CLASS);
            return format!("{} class", self.class_name(instance));
        }
        self.string_value(self.heap.fetch_pointer(class, class::NAME))
            .unwrap_or_else(|| String::from("<anonymous class>"))
    }

    /// Looks a selector up along the superclass chain, bypassing the method cache.
    pub fn lookup_method(&self, class: Oop, selector: Oop) -> Option<Oop> {
        class::lookup_method(&self.heap, class, selector)
    }

    /// Adds a method to a class, replacing any method with the same selector.
    pub fn install_method(&mut self, interpreter: &mut Interpreter, class: Oop, selector: &str, method: Oop) {
        let base = self.remappable.len();
        self.push_remappable(class);
        self.push_remappable(method);
        let selector = self.intern(interpreter, selector);
        self.push_remappable(selector);

        let dictionary = class::method_dictionary(&self.heap, self.remappable[base]);
        if method_dictionary::is_full(&self.heap, dictionary) {
            let capacity = method_dictionary::capacity(&self.heap, dictionary) * 2;
            let grown = self.new_method_dictionary(interpreter, capacity);
            let class = self.remappable[base];
            let old = class::method_dictionary(&self.heap, class);
            for (key, value) in method_dictionary::entries(&self.heap, old) {
                method_dictionary::insert(&mut self.heap, grown, key, value);
            }
            self.heap.store_pointer(class, class::METHOD_DICTIONARY, grown);
            debug!("grew the method dictionary of {} to {capacity} entries", self.class_name(class));
        }

        let (class, method, selector) = (self.remappable[base], self.remappable[base + 1], self.remappable[base + 2]);
        self.remappable.truncate(base);
        let dictionary = class::method_dictionary(&self.heap, class);
        method_dictionary::insert(&mut self.heap, dictionary, selector, method);
        interpreter.flush_method_cache();
    }

    /// Creates a class, and its metaclass, and binds it to a global.
    pub fn define_class(&mut self, interpreter: &mut Interpreter, name: &str, superclass: Oop, spec: class::InstanceSpec) -> Oop {
        let base = self.remappable.len();
        self.push_remappable(superclass);
        let name_symbol = self.intern(interpreter, name);
        self.push_remappable(name_symbol);
        let dictionary = self.new_method_dictionary(interpreter, method_dictionary::MIN_CAPACITY);
        self.push_remappable(dictionary);
        let meta_dictionary = self.new_method_dictionary(interpreter, method_dictionary::MIN_CAPACITY);
        self.push_remappable(meta_dictionary);
        let metaclass = self.allocate(interpreter, self.core.metaclass_class, ObjectFormat::Plain, class::FIXED_FIELDS, 0);
        self.push_remappable(metaclass);
        let class = self.allocate(interpreter, metaclass, ObjectFormat::Plain, class::FIXED_FIELDS, 0);

        let metaclass = self.pop_remappable();
        let meta_dictionary = self.pop_remappable();
        let dictionary = self.pop_remappable();
        let name_symbol = self.pop_remappable();
        let superclass = self.pop_remappable();
        debug_assert_eq!(self.remappable.len(), base);

        self.link_class(class, metaclass, superclass, spec, name_symbol, dictionary, meta_dictionary);
        self.set_global(interpreter, name, class);
        class
    }

    /// Fills in a class and its metaclass, whose class references are already set.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn link_class(
        &mut self,
        class: Oop,
        metaclass: Oop,
        superclass: Oop,
        spec: class::InstanceSpec,
        name: Oop,
        dictionary: Oop,
        meta_dictionary: Oop,
    ) {
        let nil = self.core.nil;
        let meta_superclass = if superclass == nil {
            self.core.class_class
        } else {
            self.heap.class_of(superclass)
        };
        let heap = &mut self.heap;
        heap.set_class_of(class, metaclass);
        heap.store_pointer(class, class::SUPERCLASS, superclass);
        heap.store_pointer(class, class::METHOD_DICTIONARY, dictionary);
        heap.store_pointer(class, class::INSTANCE_SPEC, spec.to_oop());
        heap.store_pointer(class, class::NAME, name);
        heap.store_pointer(class, class::THIS_CLASS, nil);

        heap.store_pointer(metaclass, class::SUPERCLASS, meta_superclass);
        heap.store_pointer(metaclass, class::METHOD_DICTIONARY, meta_dictionary);
        let class_spec = class::InstanceSpec::new(ObjectFormat::Plain, class::FIXED_FIELDS);
        heap.store_pointer(metaclass, class::INSTANCE_SPEC, class_spec.to_oop());
        heap.store_pointer(metaclass, class::NAME, nil);
        heap.store_pointer(metaclass, class::THIS_CLASS, class);
    }

    // ----- values -----

    pub fn boolean(&self, value: bool) -> Oop {
        if value {
            self.core.true_object
        } else {
            self.core.false_object
        }
    }

    /// The value of a small or large integer.
    pub fn integer_value(&self, oop: Oop) -> Option<BigInt> {
        if oop.is_small_integer() {
            return Some(BigInt::from(oop.as_small_integer()));
        }
        if oop.is_pointer() && self.heap.class_of(oop) == self.core.large_integer_class {
            return self.heap.large_integer(oop).cloned();
        }
        None
    }

    pub fn is_float(&self, oop: Oop) -> bool {
        oop.is_pointer() && self.heap.class_of(oop) == self.core.float_class
    }

    /// A short human-readable rendering of an object.
    pub fn describe(&self, oop: Oop) -> String {
        let core = &self.core;
        match oop.tag() {
            Tag::SmallInteger => return oop.as_small_integer().to_string(),
            Tag::Character => return format!("${}", oop.as_char()),
            Tag::Marker => return format!("<marker {:#x}>", oop.marker_payload()),
            Tag::Pointer if oop.is_null() => return String::from("<null>"),
            Tag::Pointer => {}
        }
        if oop == core.nil {
            return String::from("nil");
        }
        if oop == core.true_object {
            return String::from("true");
        }
        if oop == core.false_object {
            return String::from("false");
        }
        let class = self.heap.class_of(oop);
        if class == core.symbol_class {
            return format!("#{}", self.string_value(oop).unwrap_or_default());
        }
        if class == core.string_class {
            return format!("'{}'", self.string_value(oop).unwrap_or_default());
        }
        if class == core.float_class {
            return format!("{:?}", self.heap.float_value(oop));
        }
        if class == core.large_integer_class {
            return self.integer_value(oop).map(|value| value.to_string()).unwrap_or_default();
        }
        if self.is_class(oop) {
            return self.class_name(oop);
        }
        if class == core.method_context_class || class == core.block_context_class {
            let kind = if context::is_block_context(&self.heap, oop) { "block" } else { "method" };
            let state = if context::is_dead(&self.heap, oop) { " (dead)" } else { "" };
            return format!("a {kind} context{state}");
        }
        if class == core.array_class {
            let len = self.heap.indexable_len(oop);
            let mut elements: Vec<String> = (0..len.min(8)).map(|i| self.describe_shallow(self.heap.fetch_element(oop, i))).collect();
            if len > 8 {
                elements.push(String::from("..."));
            }
            return format!("({})", elements.join(" "));
        }
        let name = self.class_name(class);
        let article = if name.starts_with(['A', 'E', 'I', 'O', 'U']) { "an" } else { "a" };
        format!("{article} {name}")
    }

    fn describe_shallow(&self, oop: Oop) -> String {
        if oop.is_pointer() && self.heap.class_of(oop) == self.core.array_class {
            return String::from("(...)");
        }
        self.describe(oop)
    }
}
