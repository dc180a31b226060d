// Brio String Interner
// Deduplicates identifiers, method names, and string literals so the VM
// can clone and compare names as cheap Arc<str> handles.

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::sync::{Arc, OnceLock};

pub struct Interner {
    pool: Mutex<FxHashSet<Arc<str>>>,
}

impl Interner {
    pub fn new() -> Self {
        Self {
            pool: Mutex::new(FxHashSet::default()),
        }
    }

    pub fn global() -> &'static Self {
        static INTERNER: OnceLock<Interner> = OnceLock::new();
        INTERNER.get_or_init(Self::new)
    }

    /// Intern a string, returning the shared handle for it.
    pub fn intern(&self, s: &str) -> Arc<str> {
        let mut pool = self.pool.lock();
        if let Some(interned) = pool.get(s) {
            return interned.clone();
        }

        let interned: Arc<str> = Arc::from(s);
        pool.insert(interned.clone());
        interned
    }
}

/// Intern a string using the global interner.
pub fn intern(s: &str) -> Arc<str> {
    Interner::global().intern(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_dedupes() {
        let a = intern("hello");
        let b = intern("hello");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_intern_distinct() {
        let a = intern("alpha");
        let b = intern("beta");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.as_ref(), "alpha");
    }
}
