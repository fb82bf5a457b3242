use bluebook_value::Oop;

/// Something holding references into the heap from the outside: interpreter registers,
/// interned symbols, pinned globals.
///
/// Roots are visited twice per collection, once to seed marking and once to be remapped, so the
/// visitor receives them mutably.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Oop));
}

impl RootProvider for [Oop] {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Oop)) {
        self.iter_mut().for_each(visitor);
    }
}

impl RootProvider for Vec<Oop> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Oop)) {
        self.as_mut_slice().visit_roots(visitor);
    }
}

/// A root set with nothing in it.
pub struct NoRoots;

impl RootProvider for NoRoots {
    fn visit_roots(&mut self, _: &mut dyn FnMut(&mut Oop)) {}
}

/// Extends a root set with one more reference, typically the class of an object being
/// allocated when the allocation triggers a collection.
pub struct WithRoot<'a> {
    pub roots: &'a mut dyn RootProvider,
    pub extra: &'a mut Oop,
}

impl RootProvider for WithRoot<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Oop)) {
        self.roots.visit_roots(visitor);
        visitor(self.extra);
    }
}
