use std::collections::HashMap;

use crate::ast::VarType;

/// Where a variable lives: the owning function's frame and the slot in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarLocation {
    pub function: u16,
    pub slot: u16,
    pub ty: VarType,
}

/// One lexical scope. Every block and every parameter list opens one.
#[derive(Debug)]
struct Scope {
    function: u16,
    vars: HashMap<String, (u16, VarType)>,
    functions: HashMap<String, u16>,
}

/// Stack of lexical scopes, innermost last.
///
/// Lookups walk outward, so an inner declaration shadows an outer one and a
/// name declared in an enclosing function resolves to that function's frame.
#[derive(Debug, Default)]
pub struct Scopes {
    stack: Vec<Scope>,
}

impl Scopes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, function: u16) {
        self.stack.push(Scope { function, vars: HashMap::new(), functions: HashMap::new() });
    }

    pub fn pop(&mut self) {
        self.stack.pop();
    }

    /// Declares a variable in the innermost scope. False if the name is taken there.
    pub fn declare_var(&mut self, name: &str, slot: u16, ty: VarType) -> bool {
        let Some(scope) = self.stack.last_mut() else {
            return false;
        };
        if scope.vars.contains_key(name) {
            return false;
        }
        scope.vars.insert(name.to_string(), (slot, ty));
        true
    }

    /// Declares a function in the innermost scope. False if the name is taken there.
    pub fn declare_function(&mut self, name: &str, id: u16) -> bool {
        let Some(scope) = self.stack.last_mut() else {
            return false;
        };
        if scope.functions.contains_key(name) {
            return false;
        }
        scope.functions.insert(name.to_string(), id);
        true
    }

    pub fn lookup_var(&self, name: &str) -> Option<VarLocation> {
        self.stack.iter().rev().find_map(|scope| {
            scope.vars.get(name).map(|&(slot, ty)| VarLocation { function: scope.function, slot, ty })
        })
    }

    pub fn lookup_function(&self, name: &str) -> Option<u16> {
        self.stack.iter().rev().find_map(|scope| scope.functions.get(name).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inner_scope_shadows_outer() {
        let mut scopes = Scopes::new();
        scopes.push(0);
        assert!(scopes.declare_var("x", 0, VarType::Int));
        scopes.push(0);
        assert!(scopes.declare_var("x", 1, VarType::Double));
        assert_eq!(scopes.lookup_var("x").map(|v| v.slot), Some(1));
        scopes.pop();
        assert_eq!(
            scopes.lookup_var("x"),
            Some(VarLocation { function: 0, slot: 0, ty: VarType::Int })
        );
    }

    #[test]
    fn outer_function_variables_report_their_owner() {
        let mut scopes = Scopes::new();
        scopes.push(0);
        scopes.declare_var("total", 2, VarType::Int);
        scopes.declare_function("f", 1);
        scopes.push(1);
        scopes.declare_var("n", 0, VarType::Int);

        assert_eq!(scopes.lookup_var("total").map(|v| (v.function, v.slot)), Some((0, 2)));
        assert_eq!(scopes.lookup_var("n").map(|v| v.function), Some(1));
        assert_eq!(scopes.lookup_function("f"), Some(1));
        assert_eq!(scopes.lookup_var("missing"), None);
    }

    #[test]
    fn duplicates_rejected_within_one_scope() {
        let mut scopes = Scopes::new();
        scopes.push(0);
        assert!(scopes.declare_var("a", 0, VarType::Int));
        assert!(!scopes.declare_var("a", 1, VarType::String));
        assert!(scopes.declare_function("a", 1));
        assert!(!scopes.declare_function("a", 2));
    }

    #[test]
    fn declare_without_scope_fails() {
        let mut scopes = Scopes::new();
        assert!(!scopes.declare_var("a", 0, VarType::Int));
        assert!(!scopes.declare_function("f", 0));
    }
}
