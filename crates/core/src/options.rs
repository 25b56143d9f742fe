//! Functional-options configuration, used by `Server`, `Queue`, and the
//! Redis-backed bus/storage configs so each gets a single constructor that
//! accepts a variadic list of small mutators instead of a constellation of
//! builder methods or a telescoping-constructor problem.

/// A single configuration mutator applied to a freshly defaulted `T`.
pub type OptionFn<T> = Box<dyn FnOnce(&mut T) + Send>;

/// Build a `T` by defaulting it and then applying `opts` in order.
///
/// Later options win when they touch the same field, since they run after
/// earlier ones against the same `&mut T`.
pub fn apply_options<T: Default>(opts: Vec<OptionFn<T>>) -> T {
    let mut value = T::default();
    for opt in opts {
        opt(&mut value);
    }
    value
}
