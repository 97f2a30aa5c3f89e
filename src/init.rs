/// Provides a constant default value.
///
/// This is what allows a [`Heap`](crate::Heap) to be placed in a `static`
/// without lazy initialization.
pub trait Init {
    /// `Self`'s default value.
    const INIT: Self;
}
