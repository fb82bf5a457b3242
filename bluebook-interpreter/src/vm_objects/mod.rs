//!
//! Layouts of the objects the interpreter itself reads and writes: classes and their method
//! dictionaries, compiled methods, contexts, and the small helper objects sends reify.
//!

/// Classes, instance specifications and method dictionaries.
pub mod class;
/// Method and block contexts, and the context free-list.
pub mod context;
/// Compiled methods.
pub mod method;

#[cfg(test)]
mod tests {
    pub mod class;
    pub mod context;
}

/// Field indices of associations, the key/value pairs globals are bound through.
pub mod association {
    pub const KEY: usize = 0;
    pub const VALUE: usize = 1;
    pub const FIXED_FIELDS: usize = 2;
}

/// Field indices of reified messages, handed to `doesNotUnderstand:`.
pub mod message {
    pub const SELECTOR: usize = 0;
    pub const ARGUMENTS: usize = 1;
    pub const FIXED_FIELDS: usize = 2;
}
