//! Lexical environment: refcounted scope-chain frames
//!
//! A frame is `{ parent, name -> value }`. Lookup walks the chain toward
//! the root; globals live in the outermost frame. Frames are `Rc`-shared
//! so closures that capture an environment keep it alive, and the
//! refcount doubles as the retain/release lifetime.

use crate::map::LatMap;
use crate::value::LatValue;
use std::cell::RefCell;
use std::rc::Rc;

pub type EnvRef = Rc<EnvFrame>;

#[derive(Debug)]
pub struct EnvFrame {
    parent: Option<EnvRef>,
    vars: RefCell<LatMap<LatValue>>,
}

impl EnvFrame {
    /// Fresh root frame (the globals frame).
    pub fn global() -> EnvRef {
        Rc::new(EnvFrame {
            parent: None,
            vars: RefCell::new(LatMap::new()),
        })
    }

    /// Child frame whose lookups fall through to `parent`.
    pub fn child(parent: &EnvRef) -> EnvRef {
        Rc::new(EnvFrame {
            parent: Some(parent.clone()),
            vars: RefCell::new(LatMap::new()),
        })
    }

    pub fn parent(&self) -> Option<&EnvRef> {
        self.parent.as_ref()
    }

    /// Define (or shadow) a name in this frame.
    pub fn define(&self, name: &str, value: LatValue) {
        self.vars.borrow_mut().insert(name, value);
    }

    /// Walk the chain for `name`.
    pub fn lookup(&self, name: &str) -> Option<LatValue> {
        if let Some(v) = self.vars.borrow().get(name) {
            return Some(v.clone());
        }
        match &self.parent {
            Some(parent) => parent.lookup(name),
            None => None,
        }
    }

    /// Assign to the nearest frame that already defines `name`.
    /// Returns false when no frame does.
    pub fn assign(&self, name: &str, value: LatValue) -> bool {
        if self.vars.borrow().contains_key(name) {
            self.vars.borrow_mut().insert(name, value);
            return true;
        }
        match &self.parent {
            Some(parent) => parent.assign(name, value),
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        if self.vars.borrow().contains_key(name) {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.contains(name),
            None => false,
        }
    }

    /// Names defined directly in this frame (not the chain).
    pub fn local_names(&self) -> Vec<String> {
        self.vars.borrow().keys().map(|k| k.to_string()).collect()
    }

    /// Visit every binding in this frame with `f` (used by GC root scans).
    pub fn for_each_local<F: FnMut(&LatValue)>(&self, mut f: F) {
        for (_, v) in self.vars.borrow().iter() {
            f(v);
        }
    }
}

/// Deep-copy a chain frame by frame, mapping each value through `clone`.
/// Used when a closure capturing an environment is frozen: the crystal
/// copy must not alias the fluid chain.
pub fn clone_chain<F>(env: &EnvRef, clone: &mut F) -> EnvRef
where
    F: FnMut(&LatValue) -> LatValue,
{
    let parent = env.parent.as_ref().map(|p| clone_chain(p, clone));
    let mut vars = LatMap::new();
    for (k, v) in env.vars.borrow().iter() {
        vars.insert(k, clone(v));
    }
    Rc::new(EnvFrame {
        parent,
        vars: RefCell::new(vars),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_walks_chain() {
        let root = EnvFrame::global();
        root.define("x", LatValue::int(1));
        let child = EnvFrame::child(&root);
        child.define("y", LatValue::int(2));
        assert_eq!(child.lookup("x"), Some(LatValue::int(1)));
        assert_eq!(child.lookup("y"), Some(LatValue::int(2)));
        assert_eq!(child.lookup("z"), None);
    }

    #[test]
    fn test_shadowing() {
        let root = EnvFrame::global();
        root.define("x", LatValue::int(1));
        let child = EnvFrame::child(&root);
        child.define("x", LatValue::int(2));
        assert_eq!(child.lookup("x"), Some(LatValue::int(2)));
        assert_eq!(root.lookup("x"), Some(LatValue::int(1)));
    }

    #[test]
    fn test_assign_targets_defining_frame() {
        let root = EnvFrame::global();
        root.define("x", LatValue::int(1));
        let child = EnvFrame::child(&root);
        assert!(child.assign("x", LatValue::int(9)));
        assert_eq!(root.lookup("x"), Some(LatValue::int(9)));
        assert!(!child.assign("missing", LatValue::nil()));
    }

    #[test]
    fn test_refcount_keeps_parent_alive() {
        let child;
        {
            let root = EnvFrame::global();
            root.define("x", LatValue::int(7));
            child = EnvFrame::child(&root);
        }
        // root handle dropped; the chain still resolves
        assert_eq!(child.lookup("x"), Some(LatValue::int(7)));
    }

    #[test]
    fn test_clone_chain_is_independent() {
        let root = EnvFrame::global();
        root.define("x", LatValue::int(1));
        let copy = clone_chain(&root, &mut |v| v.clone());
        root.define("x", LatValue::int(2));
        assert_eq!(copy.lookup("x"), Some(LatValue::int(1)));
    }
}
